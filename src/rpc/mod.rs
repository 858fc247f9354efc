//! The remote call boundary: typed requests, tagged replies, and the transport trait.

mod reply;
mod request;
mod transport;

pub use reply::Reply;
pub use request::{Op, Request, TxId};
pub use transport::{LocalTransport, Transport};
