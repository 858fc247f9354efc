//! In-process store endpoint.
//!
//! The server decodes [`Request`]s, keeps the store-side state of transaction
//! sessions, and applies operations to the [`Db`]. Each request runs under one
//! server-wide lock, so an EXEC's version check and its replay are atomic with
//! respect to every other request.

mod txn;

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::error::{KvError, Result};
use crate::rpc::{Op, Reply, Request, TxId};
use crate::scope::PhysicalKey;
use txn::TxRegistry;

pub struct Server {
    db: Db,
    txs: Mutex<TxRegistry>,
}

impl Server {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            txs: Mutex::new(TxRegistry::default()),
        }
    }

    pub fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(Db::open(config)?))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Number of transaction sessions the store is tracking.
    pub fn open_transactions(&self) -> usize {
        self.txs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Decode a MessagePack request, handle it, and encode the reply.
    pub fn handle_bytes(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let reply = match rmp_serde::from_slice::<Request>(payload) {
            Ok(request) => self.handle(request),
            Err(e) => {
                warn!(error = %e, "malformed request");
                Reply::Error(format!("ERR malformed request: {}", e))
            }
        };
        rmp_serde::to_vec_named(&reply).map_err(|e| KvError::Transport(e.to_string()))
    }

    pub fn handle(&self, request: Request) -> Reply {
        let mut txs = self.txs.lock().unwrap_or_else(|e| e.into_inner());
        debug!(
            op = request.op.name(),
            scope = %request.scope,
            tx = ?request.tx,
            strict = request.strict,
            "request"
        );

        if let Some(key) = request.op.keys().into_iter().find(|k| !request.scope.owns(k)) {
            warn!(key = %key, scope = %request.scope, "key outside request scope");
            return Reply::Error(format!(
                "ERR key '{}' does not belong to the {} scope",
                key, request.scope
            ));
        }

        let result = match (request.op, request.tx) {
            (Op::Watch { keys }, None) => self.watch(&mut txs, keys),
            (Op::Watch { keys }, Some(id)) => self.watch_more(&mut txs, &id, keys),
            (op, None) if op.is_control() => Err(KvError::InvalidState(format!(
                "{} without a transaction id",
                op.name().to_uppercase()
            ))),
            (Op::Unwatch, Some(id)) => txs.get_mut(&id).map(|tx| {
                tx.watched.clear();
                Reply::Ok
            }),
            (Op::Multi, Some(id)) => self.multi(&mut txs, &id),
            (Op::Exec { ops }, Some(id)) => self.exec(&mut txs, &id, ops),
            (Op::Discard, Some(id)) => txs.remove(&id).map(|tx| {
                info!(tx = %id, queued = tx.queuing, "transaction discarded");
                Reply::Ok
            }),
            (op, Some(id)) => Err(match txs.get_mut(&id) {
                Ok(tx) if tx.queuing => KvError::InvalidState(format!(
                    "{} must be sent inside EXEC once MULTI is issued",
                    op.name()
                )),
                Ok(_) => KvError::InvalidState(format!(
                    "{} sent with a transaction id before MULTI",
                    op.name()
                )),
                Err(e) => e,
            }),
            (op, None) => apply(&self.db, &op),
        };

        result.unwrap_or_else(Reply::from)
    }

    fn watch(&self, txs: &mut TxRegistry, keys: Vec<PhysicalKey>) -> Result<Reply> {
        let watched = self.versions(keys)?;
        let id = txs.open(watched);
        debug!(tx = %id, "transaction opened");
        Ok(Reply::Str(id))
    }

    fn watch_more(&self, txs: &mut TxRegistry, id: &str, keys: Vec<PhysicalKey>) -> Result<Reply> {
        let tx = txs.get_mut(id)?;
        if tx.queuing {
            return Err(KvError::InvalidState(
                "WATCH inside MULTI is not allowed".to_string(),
            ));
        }
        for (key, version) in self.versions(keys)? {
            tx.watched.entry(key).or_insert(version);
        }
        Ok(Reply::Ok)
    }

    fn versions(&self, keys: Vec<PhysicalKey>) -> Result<HashMap<PhysicalKey, u64>> {
        keys.into_iter()
            .map(|key| {
                let version = self.db.get_version(key.as_str())?;
                Ok((key, version))
            })
            .collect()
    }

    fn multi(&self, txs: &mut TxRegistry, id: &str) -> Result<Reply> {
        let tx = txs.get_mut(id)?;
        if tx.queuing {
            return Err(KvError::InvalidState(
                "MULTI calls can not be nested".to_string(),
            ));
        }
        tx.queuing = true;
        Ok(Reply::Ok)
    }

    /// Check watched versions, then replay the batch in order.
    fn exec(&self, txs: &mut TxRegistry, id: &TxId, ops: Vec<Op>) -> Result<Reply> {
        if !txs.get_mut(id)?.queuing {
            return Err(KvError::InvalidState("EXEC without MULTI".to_string()));
        }
        let tx = txs.remove(id)?;

        for (key, version) in &tx.watched {
            let current = self.db.get_version(key.as_str())?;
            if current != *version {
                warn!(tx = %id, key = %key, "watched key modified, aborting");
                return Ok(Reply::Nil);
            }
        }

        let replies: Vec<Reply> = ops
            .iter()
            .map(|op| apply(&self.db, op).unwrap_or_else(Reply::from))
            .collect();
        info!(tx = %id, commands = replies.len(), "transaction committed");
        Ok(Reply::Multi(replies))
    }
}

fn strs(keys: &[PhysicalKey]) -> Vec<&str> {
    keys.iter().map(|k| k.as_str()).collect()
}

fn opt_str(value: Option<String>) -> Reply {
    value.map(Reply::Str).unwrap_or(Reply::Nil)
}

/// Apply one data operation to the store.
fn apply(db: &Db, op: &Op) -> Result<Reply> {
    let reply = match op {
        Op::Get { key } => opt_str(db.get(key.as_str())?),
        Op::Set {
            key,
            value,
            nx,
            xx,
            ttl_secs,
        } => {
            if db.set(key.as_str(), value, *nx, *xx, *ttl_secs)? {
                Reply::Ok
            } else {
                Reply::Nil
            }
        }
        Op::Del { keys } => Reply::Int(db.del(&strs(keys))?),
        Op::Exists { keys } => Reply::Int(db.exists(&strs(keys))?),
        Op::Type { key } => Reply::Str(
            db.key_type(key.as_str())?
                .map(|t| t.as_str())
                .unwrap_or("none")
                .to_string(),
        ),
        Op::Rename { key, new_key } => {
            db.rename(key.as_str(), new_key.as_str())?;
            Reply::Ok
        }
        Op::IncrBy { key, increment } => Reply::Int(db.incrby(key.as_str(), *increment)?),
        Op::GetRange { key, start, end } => Reply::Str(db.getrange(key.as_str(), *start, *end)?),
        Op::SetRange { key, offset, value } => {
            Reply::Int(db.setrange(key.as_str(), *offset, value)?)
        }
        Op::StrLen { key } => Reply::Int(db.strlen(key.as_str())?),
        Op::MGet { keys } => Reply::Values(db.mget(&strs(keys))?),
        Op::MSet { pairs } => {
            let pairs: Vec<(&str, &str)> =
                pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            db.mset(&pairs)?;
            Reply::Ok
        }
        Op::Expire { key, seconds } => Reply::Int(db.expire(key.as_str(), *seconds)? as i64),
        Op::ExpireTime { key } => Reply::Int(db.expire_time(key.as_str())?),
        Op::Bitfield { key, ops } => Reply::Ints(db.bitfield(key.as_str(), ops)?),

        Op::HGet { key, field } => opt_str(db.hget(key.as_str(), field)?),
        Op::HMGet { key, fields } => {
            let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
            Reply::Values(db.hmget(key.as_str(), &fields)?)
        }
        Op::HSet { key, pairs } => {
            let pairs: Vec<(&str, &str)> =
                pairs.iter().map(|(f, v)| (f.as_str(), v.as_str())).collect();
            Reply::Int(db.hset(key.as_str(), &pairs)?)
        }
        Op::HSetNx { key, field, value } => {
            Reply::Int(db.hsetnx(key.as_str(), field, value)? as i64)
        }
        Op::HDel { key, fields } => {
            let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
            Reply::Int(db.hdel(key.as_str(), &fields)?)
        }
        Op::HGetAll { key } => Reply::Fields(db.hgetall(key.as_str())?),
        Op::HIncrBy {
            key,
            field,
            increment,
        } => Reply::Int(db.hincrby(key.as_str(), field, *increment)?),
        Op::HLen { key } => Reply::Int(db.hlen(key.as_str())?),
        Op::HKeys { key } => Reply::Strings(db.hkeys(key.as_str())?),
        Op::HScan {
            key,
            cursor,
            pattern,
            count,
        } => {
            let (cursor, fields) =
                db.hscan(key.as_str(), cursor, pattern.as_deref(), *count)?;
            Reply::HashPage { cursor, fields }
        }

        Op::ZAdd { key, members } => Reply::Int(db.zadd(key.as_str(), members)?),
        Op::ZRem { key, members } => {
            let members: Vec<&str> = members.iter().map(String::as_str).collect();
            Reply::Int(db.zrem(key.as_str(), &members)?)
        }
        Op::ZScore { key, member } => db
            .zscore(key.as_str(), member)?
            .map(Reply::Float)
            .unwrap_or(Reply::Nil),
        Op::ZRank { key, member } => db
            .zrank(key.as_str(), member)?
            .map(Reply::Int)
            .unwrap_or(Reply::Nil),
        Op::ZIncrBy {
            key,
            member,
            increment,
        } => Reply::Float(db.zincrby(key.as_str(), member, *increment)?),
        Op::ZCard { key } => Reply::Int(db.zcard(key.as_str())?),
        Op::ZRange { key, query } => Reply::Members(db.zrange(key.as_str(), query)?),
        Op::ZRemRange { key, bounds } => Reply::Int(db.zremrange(key.as_str(), bounds)?),
        Op::ZScan {
            key,
            cursor,
            pattern,
            count,
        } => {
            let (cursor, members) =
                db.zscan(key.as_str(), cursor, pattern.as_deref(), *count)?;
            Reply::ZPage { cursor, members }
        }

        Op::Watch { .. } | Op::Unwatch | Op::Multi | Op::Exec { .. } | Op::Discard => {
            return Err(KvError::InvalidState(format!(
                "{} is not allowed inside a transaction",
                op.name().to_uppercase()
            )))
        }
    };
    Ok(reply)
}
