use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use crate::bitfield::{self, BitfieldOp};
use crate::config::Config;
use crate::error::{KvError, Result};
use crate::range::{normalize_rank, RangeBy, ZBounds, ZRangeQuery};
use crate::types::{KeyType, ZMember};

/// SQLite-backed store holding strings, hashes and sorted sets under physical keys.
pub struct Db {
    conn: Mutex<Connection>,
    /// Last version handed out; every write takes the next one.
    version: AtomicU64,
    scan_count: usize,
}

impl Db {
    /// Open or create a database as described by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let conn = Connection::open(&config.path)?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};
             PRAGMA cache_size = -{};",
            config.busy_timeout_ms,
            config.cache_mb * 1024
        ))?;
        conn.execute_batch(include_str!("schema.sql"))?;

        let version: i64 = conn.query_row(
            "SELECT MAX(
                 (SELECT COALESCE(MAX(version), 0) FROM keys),
                 (SELECT COALESCE(MAX(version), 0) FROM tombstones)
             )",
            [],
            |row| row.get(0),
        )?;
        debug!(path = %config.path, version, "store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            version: AtomicU64::new(version as u64),
            scan_count: config.scan_count,
        })
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_memory() -> Result<Self> {
        Self::open(&Config::default())
    }

    /// Current time in milliseconds since epoch
    pub fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_version(&self) -> i64 {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1) as i64
    }

    // --- key bookkeeping ---

    /// Look up a key, deleting it on the spot if it has expired.
    fn live_key(&self, conn: &Connection, key: &str) -> Result<Option<(i64, KeyType)>> {
        let row: Option<(i64, i32, Option<i64>)> = conn
            .query_row(
                "SELECT id, type, expire_at FROM keys WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((id, _, Some(exp))) if exp <= Self::now_ms() => {
                self.drop_key(conn, id, key)?;
                Ok(None)
            }
            Some((id, ty, _)) => Ok(KeyType::from_i32(ty).map(|t| (id, t))),
            None => Ok(None),
        }
    }

    /// key_id of a live key of type `ty`; WrongType if it holds something else.
    fn key_id(&self, conn: &Connection, key: &str, ty: KeyType) -> Result<Option<i64>> {
        match self.live_key(conn, key)? {
            Some((id, found)) if found == ty => Ok(Some(id)),
            Some(_) => Err(KvError::WrongType),
            None => Ok(None),
        }
    }

    fn get_or_create_key(&self, conn: &Connection, key: &str, ty: KeyType) -> Result<i64> {
        match self.key_id(conn, key, ty)? {
            Some(id) => {
                self.touch(conn, id)?;
                Ok(id)
            }
            None => self.create_key(conn, key, ty),
        }
    }

    fn create_key(&self, conn: &Connection, key: &str, ty: KeyType) -> Result<i64> {
        conn.execute(
            "INSERT INTO keys (key, type, version, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![key, ty as i32, self.next_version(), Self::now_ms()],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute("DELETE FROM tombstones WHERE key = ?1", params![key])?;
        Ok(id)
    }

    /// Stamp a key as modified.
    fn touch(&self, conn: &Connection, id: i64) -> Result<()> {
        conn.execute(
            "UPDATE keys SET version = ?1, updated_at = ?2 WHERE id = ?3",
            params![self.next_version(), Self::now_ms(), id],
        )?;
        Ok(())
    }

    fn drop_key(&self, conn: &Connection, id: i64, key: &str) -> Result<()> {
        conn.execute("DELETE FROM keys WHERE id = ?1", params![id])?;
        conn.execute(
            "INSERT INTO tombstones (key, version) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET version = excluded.version",
            params![key, self.next_version()],
        )?;
        Ok(())
    }

    /// Remove a collection key whose last element is gone. Returns whether it was dropped.
    fn drop_if_empty(&self, conn: &Connection, id: i64, key: &str, ty: KeyType) -> Result<bool> {
        let table = match ty {
            KeyType::Hash => "hashes",
            KeyType::ZSet => "zsets",
            KeyType::String => return Ok(false),
        };
        let remaining: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE key_id = ?1", table),
            params![id],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            self.drop_key(conn, id, key)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Version of a key for WATCH. Keys that never existed report 0.
    pub fn get_version(&self, key: &str) -> Result<u64> {
        let conn = self.conn();
        let live: Option<i64> = conn
            .query_row(
                "SELECT version FROM keys WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let version = match live {
            Some(v) => Some(v),
            None => conn
                .query_row(
                    "SELECT version FROM tombstones WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(version.unwrap_or(0) as u64)
    }

    // --- generic keys ---

    /// DEL key [key ...]
    pub fn del(&self, keys: &[&str]) -> Result<i64> {
        let conn = self.conn();
        let mut deleted = 0;
        for key in keys {
            if let Some((id, _)) = self.live_key(&conn, key)? {
                self.drop_key(&conn, id, key)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// EXISTS key [key ...] - repeated keys are counted each time
    pub fn exists(&self, keys: &[&str]) -> Result<i64> {
        let conn = self.conn();
        let mut count = 0;
        for key in keys {
            if self.live_key(&conn, key)?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// TYPE key
    pub fn key_type(&self, key: &str) -> Result<Option<KeyType>> {
        let conn = self.conn();
        Ok(self.live_key(&conn, key)?.map(|(_, ty)| ty))
    }

    /// RENAME src dst - overwrites dst, carries the TTL along
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let conn = self.conn();
        let (src_id, _) = self.live_key(&conn, src)?.ok_or(KvError::NoSuchKey)?;
        if src == dst {
            return Ok(());
        }
        let tx = conn.unchecked_transaction()?;
        if let Some((dst_id, _)) = self.live_key(&tx, dst)? {
            self.drop_key(&tx, dst_id, dst)?;
        }
        tx.execute(
            "UPDATE keys SET key = ?1, version = ?2, updated_at = ?3 WHERE id = ?4",
            params![dst, self.next_version(), Self::now_ms(), src_id],
        )?;
        tx.execute("DELETE FROM tombstones WHERE key = ?1", params![dst])?;
        tx.execute(
            "INSERT INTO tombstones (key, version) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET version = excluded.version",
            params![src, self.next_version()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// EXPIRE key seconds - a non-positive TTL deletes the key
    pub fn expire(&self, key: &str, seconds: i64) -> Result<bool> {
        let conn = self.conn();
        let Some((id, _)) = self.live_key(&conn, key)? else {
            return Ok(false);
        };
        if seconds <= 0 {
            self.drop_key(&conn, id, key)?;
            return Ok(true);
        }
        let expire_at = Self::now_ms().saturating_add(seconds.saturating_mul(1000));
        conn.execute(
            "UPDATE keys SET expire_at = ?1 WHERE id = ?2",
            params![expire_at, id],
        )?;
        self.touch(&conn, id)?;
        Ok(true)
    }

    /// EXPIRETIME key - unix seconds, -1 without expiry, -2 when missing
    pub fn expire_time(&self, key: &str) -> Result<i64> {
        let conn = self.conn();
        let Some((id, _)) = self.live_key(&conn, key)? else {
            return Ok(-2);
        };
        let expire_at: Option<i64> = conn.query_row(
            "SELECT expire_at FROM keys WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(expire_at.map(|ms| ms / 1000).unwrap_or(-1))
    }

    // --- strings ---

    fn read_string(&self, conn: &Connection, key: &str) -> Result<Option<(i64, Vec<u8>)>> {
        match self.key_id(conn, key, KeyType::String)? {
            Some(id) => {
                let value: Vec<u8> = conn.query_row(
                    "SELECT value FROM strings WHERE key_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                Ok(Some((id, value)))
            }
            None => Ok(None),
        }
    }

    /// Store a string value, creating the key when `existing` is None. Keeps any TTL.
    fn write_string(
        &self,
        conn: &Connection,
        existing: Option<i64>,
        key: &str,
        value: &[u8],
    ) -> Result<i64> {
        let id = match existing {
            Some(id) => {
                self.touch(conn, id)?;
                id
            }
            None => self.create_key(conn, key, KeyType::String)?,
        };
        conn.execute(
            "INSERT INTO strings (key_id, value) VALUES (?1, ?2)
             ON CONFLICT(key_id) DO UPDATE SET value = excluded.value",
            params![id, value],
        )?;
        Ok(id)
    }

    /// GET key
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        self.read_string(&conn, key)?
            .map(|(_, v)| utf8(v))
            .transpose()
    }

    /// SET key value [NX|XX] [EX seconds], returns whether the key was set.
    /// Replaces a value of any type and resets the TTL.
    pub fn set(
        &self,
        key: &str,
        value: &str,
        nx: bool,
        xx: bool,
        ttl_secs: Option<i64>,
    ) -> Result<bool> {
        if nx && xx {
            return Err(KvError::InvalidArgument(
                "NX and XX options at the same time are not compatible".to_string(),
            ));
        }
        if matches!(ttl_secs, Some(s) if s <= 0) {
            return Err(KvError::InvalidArgument(
                "invalid expire time in 'set' command".to_string(),
            ));
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let written = self.set_in(&tx, key, value, nx, xx, ttl_secs)?;
        tx.commit()?;
        Ok(written)
    }

    fn set_in(
        &self,
        conn: &Connection,
        key: &str,
        value: &str,
        nx: bool,
        xx: bool,
        ttl_secs: Option<i64>,
    ) -> Result<bool> {
        let existing = self.live_key(conn, key)?;
        if (nx && existing.is_some()) || (xx && existing.is_none()) {
            return Ok(false);
        }

        let existing = match existing {
            Some((id, KeyType::String)) => Some(id),
            Some((id, _)) => {
                self.drop_key(conn, id, key)?;
                None
            }
            None => None,
        };
        let id = self.write_string(conn, existing, key, value.as_bytes())?;
        let expire_at = ttl_secs.map(|s| Self::now_ms().saturating_add(s.saturating_mul(1000)));
        conn.execute(
            "UPDATE keys SET expire_at = ?1 WHERE id = ?2",
            params![expire_at, id],
        )?;
        Ok(true)
    }

    /// INCRBY key increment
    pub fn incrby(&self, key: &str, increment: i64) -> Result<i64> {
        let conn = self.conn();
        let (id, current) = match self.read_string(&conn, key)? {
            Some((id, bytes)) => {
                let n = std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(KvError::NotInteger)?;
                (Some(id), n)
            }
            None => (None, 0),
        };
        let next = current.checked_add(increment).ok_or(KvError::NotInteger)?;
        self.write_string(&conn, id, key, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// GETRANGE key start end - inclusive, negative indices count from the end
    pub fn getrange(&self, key: &str, start: i64, end: i64) -> Result<String> {
        let conn = self.conn();
        let value = match self.read_string(&conn, key)? {
            Some((_, v)) => v,
            None => return Ok(String::new()),
        };
        let len = value.len() as i64;
        if len == 0 || (start < 0 && end < 0 && start > end) {
            return Ok(String::new());
        }
        let start = if start < 0 { (len + start).max(0) } else { start };
        let end = if end < 0 { (len + end).max(0) } else { end.min(len - 1) };
        if start > end || start >= len {
            return Ok(String::new());
        }
        utf8(value[start as usize..=end as usize].to_vec())
    }

    /// SETRANGE key offset value - zero-pads as needed, returns the new length
    pub fn setrange(&self, key: &str, offset: i64, value: &str) -> Result<i64> {
        if !(0..512 * 1024 * 1024).contains(&offset) {
            return Err(KvError::InvalidArgument("offset is out of range".to_string()));
        }
        let conn = self.conn();
        let (id, mut current) = match self.read_string(&conn, key)? {
            Some((id, v)) => (Some(id), v),
            None => (None, Vec::new()),
        };
        if value.is_empty() {
            return Ok(current.len() as i64);
        }

        let offset = offset as usize;
        let end = offset + value.len();
        if current.len() < end {
            current.resize(end, 0);
        }
        current[offset..end].copy_from_slice(value.as_bytes());
        self.write_string(&conn, id, key, &current)?;
        Ok(current.len() as i64)
    }

    /// STRLEN key
    pub fn strlen(&self, key: &str) -> Result<i64> {
        let conn = self.conn();
        Ok(self
            .read_string(&conn, key)?
            .map(|(_, v)| v.len() as i64)
            .unwrap_or(0))
    }

    /// MGET key [key ...] - keys holding other types read as absent
    pub fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        let conn = self.conn();
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let value = match self.read_string(&conn, key) {
                Ok(v) => v.map(|(_, v)| utf8(v)).transpose()?,
                Err(KvError::WrongType) => None,
                Err(e) => return Err(e),
            };
            values.push(value);
        }
        Ok(values)
    }

    /// MSET key value [key value ...]
    pub fn mset(&self, pairs: &[(&str, &str)]) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        for (key, value) in pairs {
            self.set_in(&tx, key, value, false, false, None)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// BITFIELD key with a compiled program
    pub fn bitfield(&self, key: &str, ops: &[BitfieldOp]) -> Result<Vec<Option<i64>>> {
        bitfield::check_bounds(ops)?;
        let conn = self.conn();
        let (id, mut buf) = match self.read_string(&conn, key)? {
            Some((id, v)) => (Some(id), v),
            None => (None, Vec::new()),
        };
        let (results, written) = bitfield::execute(&mut buf, ops);
        if written {
            self.write_string(&conn, id, key, &buf)?;
        }
        Ok(results)
    }

    // --- hashes ---

    /// HSET key field value [field value ...] - returns number of new fields
    pub fn hset(&self, key: &str, pairs: &[(&str, &str)]) -> Result<i64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let conn = self.conn();
        let key_id = self.get_or_create_key(&conn, key, KeyType::Hash)?;

        let mut added = 0;
        for (field, value) in pairs {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM hashes WHERE key_id = ?1 AND field = ?2",
                    params![key_id, field],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            conn.execute(
                "INSERT INTO hashes (key_id, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key_id, field) DO UPDATE SET value = excluded.value",
                params![key_id, field, value],
            )?;
            if !exists {
                added += 1;
            }
        }
        Ok(added)
    }

    /// HSETNX key field value
    pub fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let conn = self.conn();
        if let Some(id) = self.key_id(&conn, key, KeyType::Hash)? {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM hashes WHERE key_id = ?1 AND field = ?2",
                    params![id, field],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Ok(false);
            }
        }
        let key_id = self.get_or_create_key(&conn, key, KeyType::Hash)?;
        conn.execute(
            "INSERT INTO hashes (key_id, field, value) VALUES (?1, ?2, ?3)",
            params![key_id, field, value],
        )?;
        Ok(true)
    }

    fn field(&self, conn: &Connection, key_id: i64, field: &str) -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT value FROM hashes WHERE key_id = ?1 AND field = ?2",
                params![key_id, field],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// HGET key field
    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let conn = self.conn();
        match self.key_id(&conn, key, KeyType::Hash)? {
            Some(id) => self.field(&conn, id, field),
            None => Ok(None),
        }
    }

    /// HMGET key field [field ...]
    pub fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::Hash)? else {
            return Ok(vec![None; fields.len()]);
        };
        fields.iter().map(|f| self.field(&conn, id, f)).collect()
    }

    /// HGETALL key - ordered by field
    pub fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::Hash)? else {
            return Ok(Vec::new());
        };
        let mut stmt =
            conn.prepare("SELECT field, value FROM hashes WHERE key_id = ?1 ORDER BY field")?;
        let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let pairs = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    /// HKEYS key
    pub fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.hgetall(key)?.into_iter().map(|(f, _)| f).collect())
    }

    /// HLEN key
    pub fn hlen(&self, key: &str) -> Result<i64> {
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::Hash)? else {
            return Ok(0);
        };
        let len: i64 = conn.query_row(
            "SELECT COUNT(*) FROM hashes WHERE key_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(len)
    }

    /// HDEL key field [field ...] - removes the key with its last field
    pub fn hdel(&self, key: &str, fields: &[&str]) -> Result<i64> {
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::Hash)? else {
            return Ok(0);
        };
        let mut removed = 0;
        for field in fields {
            removed += conn.execute(
                "DELETE FROM hashes WHERE key_id = ?1 AND field = ?2",
                params![id, field],
            )? as i64;
        }
        if removed > 0 && !self.drop_if_empty(&conn, id, key, KeyType::Hash)? {
            self.touch(&conn, id)?;
        }
        Ok(removed)
    }

    /// HINCRBY key field increment
    pub fn hincrby(&self, key: &str, field: &str, increment: i64) -> Result<i64> {
        let conn = self.conn();
        let current = match self.key_id(&conn, key, KeyType::Hash)? {
            Some(id) => match self.field(&conn, id, field)? {
                Some(v) => v.parse::<i64>().map_err(|_| KvError::NotInteger)?,
                None => 0,
            },
            None => 0,
        };
        let next = current.checked_add(increment).ok_or(KvError::NotInteger)?;
        let key_id = self.get_or_create_key(&conn, key, KeyType::Hash)?;
        conn.execute(
            "INSERT INTO hashes (key_id, field, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key_id, field) DO UPDATE SET value = excluded.value",
            params![key_id, field, next.to_string()],
        )?;
        Ok(next)
    }

    /// HSCAN key cursor [MATCH pattern] [COUNT count]
    /// Cursor is base64 of the last field returned, or "0" to start from the beginning.
    pub fn hscan(
        &self,
        key: &str,
        cursor: &str,
        pattern: Option<&str>,
        count: Option<usize>,
    ) -> Result<(String, Vec<(String, String)>)> {
        let count = count.unwrap_or(self.scan_count).max(1);
        let after = decode_cursor(cursor)?;
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::Hash)? else {
            return Ok(("0".to_string(), Vec::new()));
        };

        let sql = format!(
            "SELECT field, value FROM hashes
             WHERE key_id = ?1 AND field {} ?2 AND field GLOB ?3
             ORDER BY field
             LIMIT ?4",
            if after.is_some() { ">" } else { ">=" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![id, after.unwrap_or_default(), pattern.unwrap_or("*"), count as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let pairs: Vec<(String, String)> = rows.collect::<std::result::Result<_, _>>()?;

        let next = next_cursor(&pairs, count, |(f, _)| f);
        Ok((next, pairs))
    }

    // --- sorted sets ---

    /// ZADD key score member [score member ...] - returns count of new members
    pub fn zadd(&self, key: &str, members: &[ZMember]) -> Result<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        if members.iter().any(|m| m.score.is_nan()) {
            return Err(KvError::NotFloat);
        }
        let conn = self.conn();
        let key_id = self.get_or_create_key(&conn, key, KeyType::ZSet)?;

        let mut added = 0;
        for m in members {
            let exists = self.score(&conn, key_id, &m.member)?.is_some();
            conn.execute(
                "INSERT INTO zsets (key_id, member, score) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key_id, member) DO UPDATE SET score = excluded.score",
                params![key_id, m.member, m.score],
            )?;
            if !exists {
                added += 1;
            }
        }
        Ok(added)
    }

    /// ZREM key member [member ...]
    pub fn zrem(&self, key: &str, members: &[&str]) -> Result<i64> {
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::ZSet)? else {
            return Ok(0);
        };
        let mut removed = 0;
        for member in members {
            removed += conn.execute(
                "DELETE FROM zsets WHERE key_id = ?1 AND member = ?2",
                params![id, member],
            )? as i64;
        }
        if removed > 0 && !self.drop_if_empty(&conn, id, key, KeyType::ZSet)? {
            self.touch(&conn, id)?;
        }
        Ok(removed)
    }

    fn score(&self, conn: &Connection, key_id: i64, member: &str) -> Result<Option<f64>> {
        Ok(conn
            .query_row(
                "SELECT score FROM zsets WHERE key_id = ?1 AND member = ?2",
                params![key_id, member],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn count_members(&self, conn: &Connection, key_id: i64) -> Result<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM zsets WHERE key_id = ?1",
            params![key_id],
            |row| row.get(0),
        )?)
    }

    /// ZSCORE key member
    pub fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let conn = self.conn();
        match self.key_id(&conn, key, KeyType::ZSet)? {
            Some(id) => self.score(&conn, id, member),
            None => Ok(None),
        }
    }

    /// ZRANK key member - 0-based position in ascending (score, member) order
    pub fn zrank(&self, key: &str, member: &str) -> Result<Option<i64>> {
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::ZSet)? else {
            return Ok(None);
        };
        let Some(score) = self.score(&conn, id, member)? else {
            return Ok(None);
        };
        let rank: i64 = conn.query_row(
            "SELECT COUNT(*) FROM zsets
             WHERE key_id = ?1 AND (score < ?2 OR (score = ?2 AND member < ?3))",
            params![id, score, member],
            |row| row.get(0),
        )?;
        Ok(Some(rank))
    }

    /// ZINCRBY key increment member
    pub fn zincrby(&self, key: &str, member: &str, increment: f64) -> Result<f64> {
        let conn = self.conn();
        let current = match self.key_id(&conn, key, KeyType::ZSet)? {
            Some(id) => self.score(&conn, id, member)?.unwrap_or(0.0),
            None => 0.0,
        };
        let next = current + increment;
        if next.is_nan() {
            return Err(KvError::NotFloat);
        }
        let key_id = self.get_or_create_key(&conn, key, KeyType::ZSet)?;
        conn.execute(
            "INSERT INTO zsets (key_id, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(key_id, member) DO UPDATE SET score = excluded.score",
            params![key_id, member, next],
        )?;
        Ok(next)
    }

    /// ZCARD key
    pub fn zcard(&self, key: &str) -> Result<i64> {
        let conn = self.conn();
        match self.key_id(&conn, key, KeyType::ZSet)? {
            Some(id) => self.count_members(&conn, id),
            None => Ok(0),
        }
    }

    /// ZRANGE key start stop [BYSCORE|BYLEX] [REV] [LIMIT offset count]
    pub fn zrange(&self, key: &str, query: &ZRangeQuery) -> Result<Vec<ZMember>> {
        query.validate()?;
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::ZSet)? else {
            return Ok(Vec::new());
        };

        let dir = if query.reverse { "DESC" } else { "ASC" };
        let order = match query.bounds.mode() {
            RangeBy::Lex => format!("member {}", dir),
            _ => format!("score {}, member {}", dir, dir),
        };
        let (offset, count) = match &query.bounds {
            ZBounds::Rank { start, stop } => {
                let total = self.count_members(&conn, id)?;
                match normalize_rank(*start, *stop, total) {
                    Some(window) => window,
                    None => return Ok(Vec::new()),
                }
            }
            _ => query
                .limit
                .map(|l| (l.offset, l.count))
                .unwrap_or((0, -1)),
        };

        let (filter, bound_params) = query.bounds.sql_filter();
        let sql = format!(
            "SELECT member, score FROM zsets WHERE key_id = ?{} ORDER BY {} LIMIT ? OFFSET ?",
            filter, order
        );
        let mut values = vec![SqlValue::Integer(id)];
        values.extend(bound_params);
        values.push(SqlValue::Integer(count));
        values.push(SqlValue::Integer(offset));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(ZMember {
                member: row.get(0)?,
                score: row.get(1)?,
            })
        })?;
        let members = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(members)
    }

    /// ZREMRANGEBYRANK / ZREMRANGEBYSCORE / ZREMRANGEBYLEX
    pub fn zremrange(&self, key: &str, bounds: &ZBounds) -> Result<i64> {
        ZRangeQuery::new(bounds.clone()).validate()?;
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::ZSet)? else {
            return Ok(0);
        };

        let removed: usize = match bounds {
            ZBounds::Rank { start, stop } => {
                let total = self.count_members(&conn, id)?;
                match normalize_rank(*start, *stop, total) {
                    Some((offset, len)) => conn.execute(
                        "DELETE FROM zsets WHERE key_id = ?1 AND member IN (
                             SELECT member FROM zsets WHERE key_id = ?1
                             ORDER BY score, member LIMIT ?2 OFFSET ?3
                         )",
                        params![id, len, offset],
                    )?,
                    None => 0,
                }
            }
            _ => {
                let (filter, bound_params) = bounds.sql_filter();
                let mut values = vec![SqlValue::Integer(id)];
                values.extend(bound_params);
                conn.execute(
                    &format!("DELETE FROM zsets WHERE key_id = ?{}", filter),
                    params_from_iter(values),
                )?
            }
        };
        let removed = removed as i64;

        if removed > 0 && !self.drop_if_empty(&conn, id, key, KeyType::ZSet)? {
            self.touch(&conn, id)?;
        }
        Ok(removed)
    }

    /// ZSCAN key cursor [MATCH pattern] [COUNT count]
    /// Iterates in member order; cursor is base64 of the last member returned.
    pub fn zscan(
        &self,
        key: &str,
        cursor: &str,
        pattern: Option<&str>,
        count: Option<usize>,
    ) -> Result<(String, Vec<ZMember>)> {
        let count = count.unwrap_or(self.scan_count).max(1);
        let after = decode_cursor(cursor)?;
        let conn = self.conn();
        let Some(id) = self.key_id(&conn, key, KeyType::ZSet)? else {
            return Ok(("0".to_string(), Vec::new()));
        };

        let sql = format!(
            "SELECT member, score FROM zsets
             WHERE key_id = ?1 AND member {} ?2 AND member GLOB ?3
             ORDER BY member
             LIMIT ?4",
            if after.is_some() { ">" } else { ">=" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![id, after.unwrap_or_default(), pattern.unwrap_or("*"), count as i64],
            |row| {
                Ok(ZMember {
                    member: row.get(0)?,
                    score: row.get(1)?,
                })
            },
        )?;
        let members: Vec<ZMember> = rows.collect::<std::result::Result<_, _>>()?;

        let next = next_cursor(&members, count, |m| &m.member);
        Ok((next, members))
    }
}

/// String values are returned as text; bytes written by BITFIELD or SETRANGE
/// that are not valid UTF-8 are refused rather than replaced.
fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| KvError::UnexpectedReply {
        expected: "utf-8 string",
        got: format!("{} bytes of binary data", e.as_bytes().len()),
    })
}

/// "0" (or empty) starts a scan; anything else must be a cursor this store issued.
fn decode_cursor(cursor: &str) -> Result<Option<String>> {
    if cursor == "0" || cursor.is_empty() {
        return Ok(None);
    }
    let bytes = STANDARD.decode(cursor).map_err(|_| KvError::InvalidCursor)?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| KvError::InvalidCursor)
}

fn next_cursor<T>(page: &[T], count: usize, last: impl Fn(&T) -> &String) -> String {
    match page.last() {
        Some(item) if page.len() >= count => STANDARD.encode(last(item).as_bytes()),
        _ => "0".to_string(),
    }
}
