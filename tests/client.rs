//! Immediate-mode client tests against the in-process store
//!
//! Run with: cargo test --test client

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use kvscope::rpc::{Op, Reply, Request, Transport};
use kvscope::{
    BitfieldCommand, CallContext, Client, Commands, Config, ExpireTime, KvError, LocalTransport,
    Overflow, SetOptions,
};

fn client() -> Client {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("kvscope=debug")
        .try_init();
    Client::local(&Config::default()).unwrap()
}

// ============================================================================
// SCOPES
// ============================================================================

#[tokio::test]
async fn test_installation_writes_are_invisible_globally() {
    let inst = client();
    let global = inst.global();

    inst.set("shared", "mine", SetOptions::new()).await.unwrap();
    assert_eq!(global.get("shared").await.unwrap(), "");

    global.set("shared", "theirs", SetOptions::new()).await.unwrap();
    assert_eq!(inst.get("shared").await.unwrap(), "mine");
    assert_eq!(global.get("shared").await.unwrap(), "theirs");
}

#[tokio::test]
async fn test_scopes_share_a_transport() {
    let transport = Arc::new(LocalTransport::open(&Config::default()).unwrap());
    let a = Client::new(transport.clone());
    let b = Client::new(transport);

    a.hset("h", &[("f", "1")]).await.unwrap();
    assert_eq!(b.hget("h", "f").await.unwrap(), "1");
    assert_eq!(b.global().hget("h", "f").await.unwrap(), "");
}

// ============================================================================
// ABSENCE
// ============================================================================

#[tokio::test]
async fn test_missing_reads_as_zero_values() {
    let c = client();
    assert_eq!(c.get("missing").await.unwrap(), "");
    assert_eq!(c.hget("missing", "f").await.unwrap(), "");
    assert_eq!(c.zscore("missing", "m").await.unwrap(), 0.0);
    assert_eq!(c.zrank("missing", "m").await.unwrap(), -1);
}

#[tokio::test]
async fn test_strict_reads_fail_when_missing() {
    let c = client();
    assert!(matches!(c.get_strict("missing").await, Err(KvError::NotFound)));
    assert!(matches!(
        c.hget_strict("missing", "f").await,
        Err(KvError::NotFound)
    ));
    assert!(matches!(
        c.zscore_strict("missing", "m").await,
        Err(KvError::NotFound)
    ));
    assert!(matches!(
        c.zrank_strict("missing", "m").await,
        Err(KvError::NotFound)
    ));

    c.set("present", "", SetOptions::new()).await.unwrap();
    assert_eq!(c.get_strict("present").await.unwrap(), "");
}

#[tokio::test]
async fn test_mget_fills_missing_slots() {
    let c = client();
    c.mset(&[("a", "1"), ("c", "3")]).await.unwrap();
    c.hset("h", &[("f", "v")]).await.unwrap();
    assert_eq!(
        c.mget(&["a", "b", "c", "h"]).await.unwrap(),
        vec!["1", "", "3", ""]
    );
}

// ============================================================================
// STRINGS AND KEYS
// ============================================================================

#[tokio::test]
async fn test_set_nx_xx() {
    let c = client();
    assert_eq!(c.set("k", "1", SetOptions::new().xx()).await.unwrap(), "");
    assert_eq!(c.set("k", "1", SetOptions::new().nx()).await.unwrap(), "OK");
    assert_eq!(c.set("k", "2", SetOptions::new().nx()).await.unwrap(), "");
    assert_eq!(c.set("k", "3", SetOptions::new().xx()).await.unwrap(), "OK");
    assert_eq!(c.get("k").await.unwrap(), "3");
}

#[tokio::test]
async fn test_set_rejects_nx_with_xx() {
    let c = client();
    let err = c.set("k", "v", SetOptions::new().nx().xx()).await.unwrap_err();
    assert!(matches!(err, KvError::InvalidArgument(_)));
    assert_eq!(c.exists(&["k"]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_set_with_expiration() {
    let c = client();
    let at = Utc::now() + Duration::hours(1);
    c.set("session", "v", SetOptions::new().expiration(at))
        .await
        .unwrap();

    match c.expire_time("session").await.unwrap() {
        ExpireTime::At(t) => assert!((t - at).num_seconds().abs() <= 2),
        other => panic!("expected an expiry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_expire_and_expire_time() {
    let c = client();
    assert_eq!(c.expire_time("k").await.unwrap(), ExpireTime::Missing);

    c.set("k", "v", SetOptions::new()).await.unwrap();
    assert_eq!(c.expire_time("k").await.unwrap(), ExpireTime::Persistent);

    assert!(c.expire("k", 100).await.unwrap());
    assert!(matches!(
        c.expire_time("k").await.unwrap(),
        ExpireTime::At(_)
    ));

    assert!(c.expire("k", 0).await.unwrap());
    assert_eq!(c.get("k").await.unwrap(), "");
    assert!(!c.expire("k", 10).await.unwrap());
}

#[tokio::test]
async fn test_incr_by_and_ranges() {
    let c = client();
    assert_eq!(c.incr_by("n", 5).await.unwrap(), 5);
    assert_eq!(c.incr_by("n", -7).await.unwrap(), -2);

    c.set("s", "Hello World", SetOptions::new()).await.unwrap();
    assert_eq!(c.get_range("s", 0, 4).await.unwrap(), "Hello");
    assert_eq!(c.get_range("s", -5, -1).await.unwrap(), "World");
    assert_eq!(c.set_range("s", 6, "Redis").await.unwrap(), 11);
    assert_eq!(c.get("s").await.unwrap(), "Hello Redis");
    assert_eq!(c.str_len("s").await.unwrap(), 11);

    assert!(matches!(
        c.set_range("s", -1, "x").await,
        Err(KvError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_incr_by_on_text_is_remote_error() {
    let c = client();
    c.set("s", "abc", SetOptions::new()).await.unwrap();
    assert!(matches!(c.incr_by("s", 1).await, Err(KvError::Remote(_))));
    assert_eq!(c.get("s").await.unwrap(), "abc");
}

#[tokio::test]
async fn test_del_exists_type_rename() {
    let c = client();
    c.set("a", "1", SetOptions::new()).await.unwrap();
    c.hset("b", &[("f", "v")]).await.unwrap();

    assert_eq!(c.exists(&["a", "b", "c"]).await.unwrap(), 2);
    assert_eq!(c.key_type("a").await.unwrap(), "string");
    assert_eq!(c.key_type("b").await.unwrap(), "hash");
    assert_eq!(c.key_type("c").await.unwrap(), "none");

    c.rename("a", "z").await.unwrap();
    assert_eq!(c.get("z").await.unwrap(), "1");
    assert!(c.rename("a", "y").await.is_err());

    assert_eq!(c.del(&["z", "b", "c"]).await.unwrap(), 2);
    assert_eq!(c.exists(&["z", "b"]).await.unwrap(), 0);
}

// ============================================================================
// HASHES
// ============================================================================

#[tokio::test]
async fn test_hash_operations() {
    let c = client();
    assert_eq!(c.hset("h", &[("a", "1"), ("b", "2")]).await.unwrap(), 2);
    assert_eq!(c.hset("h", &[("a", "10"), ("c", "3")]).await.unwrap(), 1);
    assert!(!c.hsetnx("h", "a", "x").await.unwrap());
    assert!(c.hsetnx("h", "d", "4").await.unwrap());

    assert_eq!(c.hlen("h").await.unwrap(), 4);
    assert_eq!(c.hkeys("h").await.unwrap(), vec!["a", "b", "c", "d"]);
    assert_eq!(
        c.hmget("h", &["a", "zz"]).await.unwrap(),
        vec![Some("10".to_string()), None]
    );

    let all = c.hgetall("h").await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all["a"], "10");

    assert_eq!(c.hincr_by("h", "b", 40).await.unwrap(), 42);
    assert_eq!(c.hdel("h", &["a", "b", "zz"]).await.unwrap(), 2);
    assert_eq!(c.hlen("h").await.unwrap(), 2);
}

#[tokio::test]
async fn test_hscan_pages_through_every_field() {
    let c = client();
    let pairs: Vec<(String, String)> = (0..25)
        .map(|i| (format!("field:{:02}", i), i.to_string()))
        .collect();
    let refs: Vec<(&str, &str)> = pairs
        .iter()
        .map(|(f, v)| (f.as_str(), v.as_str()))
        .collect();
    c.hset("big", &refs).await.unwrap();

    let mut cursor = "0".to_string();
    let mut seen = Vec::new();
    loop {
        let page = c.hscan("big", &cursor, None, Some(10)).await.unwrap();
        assert!(page.field_values.len() <= 10);
        seen.extend(page.field_values.into_iter().map(|(f, _)| f));
        if page.cursor == "0" {
            break;
        }
        cursor = page.cursor;
    }
    assert_eq!(seen.len(), 25);
    assert_eq!(seen[0], "field:00");
    assert_eq!(seen[24], "field:24");
}

#[tokio::test]
async fn test_hscan_with_pattern() {
    let c = client();
    c.hset("h", &[("user:1", "a"), ("user:2", "b"), ("admin:1", "c")])
        .await
        .unwrap();
    let page = c.hscan("h", "0", Some("user:*"), None).await.unwrap();
    assert_eq!(page.cursor, "0");
    let fields: Vec<_> = page.field_values.iter().map(|(f, _)| f.as_str()).collect();
    assert_eq!(fields, vec!["user:1", "user:2"]);
}

#[tokio::test]
async fn test_scan_rejects_garbage_cursor() {
    let c = client();
    c.hset("h", &[("a", "1")]).await.unwrap();
    assert!(c.hscan("h", "not base64!", None, None).await.is_err());
}

// ============================================================================
// BITFIELD
// ============================================================================

#[tokio::test]
async fn test_bitfield_overflow_program() {
    let c = client();
    let program = vec![
        BitfieldCommand::set("i8", 0u64, 127).unwrap(),
        BitfieldCommand::overflow(Overflow::Wrap),
        BitfieldCommand::incr_by("i8", 0u64, 1).unwrap(),
        BitfieldCommand::set("i8", 0u64, 127).unwrap(),
        BitfieldCommand::overflow(Overflow::Sat),
        BitfieldCommand::incr_by("i8", 0u64, 1).unwrap(),
        BitfieldCommand::overflow(Overflow::Fail),
        BitfieldCommand::incr_by("i8", 0u64, 1).unwrap(),
    ];
    assert_eq!(
        c.bitfield("bits", &program).await.unwrap(),
        vec![Some(0), Some(-128), Some(-128), Some(127), None]
    );

    let read = [BitfieldCommand::get("i8", 0u64).unwrap()];
    assert_eq!(c.bitfield("bits", &read).await.unwrap(), vec![Some(127)]);
}

#[tokio::test]
async fn test_bitfield_from_tokens() {
    let c = client();
    let program = kvscope::bitfield::parse_program(&[
        "set", "u8", "#1", "200", "get", "u8", "8", "get", "u4", "#2",
    ])
    .unwrap();
    assert_eq!(
        c.bitfield("bits", &program).await.unwrap(),
        vec![Some(0), Some(200), Some(12)]
    );
    assert_eq!(c.str_len("bits").await.unwrap(), 2);
}

#[tokio::test]
async fn test_binary_value_is_refused_as_text() {
    let c = client();
    let program = [BitfieldCommand::set("u8", 0u64, 255).unwrap()];
    c.bitfield("bits", &program).await.unwrap();

    assert!(matches!(c.get("bits").await, Err(KvError::Remote(_))));
    assert!(matches!(c.get_range("bits", 0, 0).await, Err(KvError::Remote(_))));
    assert_eq!(c.str_len("bits").await.unwrap(), 1);
}

#[tokio::test]
async fn test_bitfield_rejects_bad_encoding() {
    assert!(BitfieldCommand::get("i65", 0u64).is_err());
    assert!(BitfieldCommand::get("u64", 0u64).is_err());
    assert!(kvscope::bitfield::parse_program(&["get", "i8"]).is_err());
}

#[tokio::test]
async fn test_bitfield_rejects_offset_past_limit() {
    let c = client();
    let program = [BitfieldCommand::get("i8", u64::MAX).unwrap()];
    assert!(matches!(
        c.bitfield("bits", &program).await,
        Err(KvError::InvalidArgument(_))
    ));

    let tokens = kvscope::bitfield::parse_program(&["set", "u8", "18446744073709551615", "1"])
        .unwrap();
    assert!(matches!(
        c.bitfield("bits", &tokens).await,
        Err(KvError::InvalidArgument(_))
    ));
    assert_eq!(c.exists(&["bits"]).await.unwrap(), 0);
}

// ============================================================================
// TRANSPORT FAILURES
// ============================================================================

/// Accepts WATCH and MULTI, fails every other call, and counts calls per op.
#[derive(Default)]
struct FlakyTransport {
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FlakyTransport {
    fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn call(&self, request: Request) -> kvscope::Result<Reply> {
        *self.calls.lock().unwrap().entry(request.op.name()).or_default() += 1;
        match request.op {
            Op::Watch { .. } => Ok(Reply::Str("tx-1".to_string())),
            Op::Multi => Ok(Reply::Ok),
            _ => Err(KvError::Transport("link down".to_string())),
        }
    }
}

#[tokio::test]
async fn test_transport_failure_is_returned_once() {
    let transport = Arc::new(FlakyTransport::default());
    let c = Client::new(transport.clone());

    match c.get("k").await {
        Err(KvError::Transport(msg)) => assert_eq!(msg, "link down"),
        other => panic!("expected a transport error, got {:?}", other),
    }
    assert_eq!(transport.calls("get"), 1);

    assert!(matches!(
        c.set("k", "v", SetOptions::new()).await,
        Err(KvError::Transport(_))
    ));
    assert_eq!(transport.calls("set"), 1);
}

#[tokio::test]
async fn test_transport_failure_during_exec_is_returned_once() {
    let transport = Arc::new(FlakyTransport::default());
    let c = Client::new(transport.clone());
    let ctx = CallContext::new();

    let tx = c.watch(&ctx, &["k"]).await.unwrap();
    tx.multi(&ctx).await.unwrap();
    tx.with(&ctx).incr_by("k", 1).await.unwrap();

    match tx.exec(&ctx).await {
        Err(KvError::Transport(msg)) => assert_eq!(msg, "link down"),
        other => panic!("expected a transport error, got {:?}", other),
    }
    assert_eq!(transport.calls("exec"), 1);
    assert_eq!(transport.calls("incrby"), 0);
    assert!(matches!(tx.exec(&ctx).await, Err(KvError::SessionClosed)));
    assert_eq!(transport.calls("exec"), 1);
}
