//! kvscope - scoped, transactional key-value client
//!
//! Every key is stored under a scope prefix (`inst:` or `global:`), and
//! optimistic transactions (WATCH / MULTI / EXEC) queue commands behind typed
//! placeholders. The reference store is SQLite, reached through an in-process
//! transport that speaks MessagePack.
//!
//! # Example
//!
//! ```
//! use kvscope::{Client, Commands, Config, SetOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> kvscope::Result<()> {
//! let client = Client::local(&Config::default())?;
//! client.set("greeting", "hello", SetOptions::new()).await?;
//! assert_eq!(client.get("greeting").await?, "hello");
//! assert_eq!(client.get("missing").await?, "");
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod range;
pub mod rpc;
pub mod scope;
pub mod server;
pub mod types;

pub use bitfield::{BitfieldCommand, Overflow};
pub use client::{
    CallContext, Client, Cmd, Commands, NilMode, Queued, Session, Transaction, TxPhase, Value,
};
pub use config::Config;
pub use db::Db;
pub use error::{KvError, Result};
pub use range::{LexBound, Limit, RangeBy, ScoreBound, ZBounds, ZRangeQuery};
pub use rpc::{LocalTransport, Transport};
pub use scope::{PhysicalKey, Scope};
pub use server::Server;
pub use types::{ExpireTime, HScanPage, KeyType, SetOptions, ZMember, ZScanPage};
