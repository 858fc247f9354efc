use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Reply, Request};
use crate::config::Config;
use crate::error::{KvError, Result};
use crate::server::Server;

/// Carries requests to a store and brings back its replies.
///
/// Failures of the carrier itself surface as [`KvError::Transport`]; they are
/// not retried here.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: Request) -> Result<Reply>;
}

/// Transport to a [`Server`] in the same process.
///
/// Requests and replies cross as MessagePack bytes, and the store runs on the
/// blocking pool so async workers never wait on SQLite.
#[derive(Clone)]
pub struct LocalTransport {
    server: Arc<Server>,
}

impl LocalTransport {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Open a fresh store and connect to it.
    pub fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(Arc::new(Server::open(config)?)))
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, request: Request) -> Result<Reply> {
        debug!(op = request.op.name(), scope = %request.scope, tx = ?request.tx, "call");
        let payload =
            rmp_serde::to_vec_named(&request).map_err(|e| KvError::Transport(e.to_string()))?;

        let server = Arc::clone(&self.server);
        let response = tokio::task::spawn_blocking(move || server.handle_bytes(&payload))
            .await
            .map_err(|e| KvError::Transport(format!("store task failed: {}", e)))??;

        rmp_serde::from_slice(&response).map_err(|e| KvError::Transport(e.to_string()))
    }
}
