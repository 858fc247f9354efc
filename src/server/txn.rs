use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{KvError, Result};
use crate::rpc::TxId;
use crate::scope::PhysicalKey;

/// Sessions untouched for this long are forgotten on the next WATCH.
const IDLE_LIMIT: Duration = Duration::from_secs(600);

/// Store-side view of one transaction session.
#[derive(Debug)]
pub(crate) struct TxState {
    /// Key versions captured at WATCH time.
    pub watched: HashMap<PhysicalKey, u64>,
    /// MULTI has been received.
    pub queuing: bool,
    last_used: Instant,
}

/// Open transaction sessions keyed by id.
#[derive(Debug, Default)]
pub(crate) struct TxRegistry {
    txs: HashMap<TxId, TxState>,
    next_id: u64,
}

impl TxRegistry {
    pub fn open(&mut self, watched: HashMap<PhysicalKey, u64>) -> TxId {
        self.prune();
        self.next_id += 1;
        let id = format!("tx-{}", self.next_id);
        self.txs.insert(
            id.clone(),
            TxState {
                watched,
                queuing: false,
                last_used: Instant::now(),
            },
        );
        id
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut TxState> {
        let tx = self
            .txs
            .get_mut(id)
            .ok_or_else(|| KvError::InvalidState(format!("no such transaction '{}'", id)))?;
        tx.last_used = Instant::now();
        Ok(tx)
    }

    pub fn remove(&mut self, id: &str) -> Result<TxState> {
        self.txs
            .remove(id)
            .ok_or_else(|| KvError::InvalidState(format!("no such transaction '{}'", id)))
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    fn prune(&mut self) {
        let before = self.txs.len();
        self.txs.retain(|_, tx| tx.last_used.elapsed() < IDLE_LIMIT);
        let pruned = before - self.txs.len();
        if pruned > 0 {
            debug!(pruned, "forgot idle transactions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let mut registry = TxRegistry::default();
        let a = registry.open(HashMap::new());
        let b = registry.open(HashMap::new());
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_is_single_use() {
        let mut registry = TxRegistry::default();
        let id = registry.open(HashMap::new());
        registry.get_mut(&id).unwrap().queuing = true;
        assert!(registry.remove(&id).unwrap().queuing);
        assert!(matches!(registry.remove(&id), Err(KvError::InvalidState(_))));
        assert!(registry.get_mut(&id).is_err());
    }
}
