//! Optimistic transactions: WATCH, then MULTI, queue, and EXEC or DISCARD.
//!
//! A [`Transaction`] is created by [`Client::watch`](super::Client::watch) and
//! is bound to the [`CallContext`] that created it. Every call names the
//! caller's context and is rejected unless it is the owner. Control calls
//! take it directly; commands are queued through [`Transaction::with`], which
//! offers the same methods as the immediate client but queues instead of
//! executing.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::cmd::Cmd;
use super::value::Value;
use super::Commands;
use crate::error::{KvError, Result};
use crate::rpc::{Op, Reply, Request, Transport, TxId};
use crate::scope::{resolve, PhysicalKey, Scope};

/// Identity of one logical execution, e.g. one incoming app invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallContext {
    id: Arc<str>,
}

impl CallContext {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self::from_id(format!("ctx-{}", NEXT.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: Arc::from(id.into()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Watched,
    Queuing,
    Committed,
    Aborted,
}

impl TxPhase {
    pub fn is_closed(self) -> bool {
        matches!(self, TxPhase::Committed | TxPhase::Aborted)
    }
}

type SlotDecoder = Box<dyn FnOnce(Reply) -> Result<Value> + Send>;

struct QueuedOp {
    op: Op,
    decode: SlotDecoder,
}

struct TxInner {
    phase: TxPhase,
    watched: Vec<PhysicalKey>,
    queue: Vec<QueuedOp>,
}

pub struct Transaction {
    id: TxId,
    scope: Scope,
    transport: Arc<dyn Transport>,
    context: CallContext,
    inner: Mutex<TxInner>,
}

impl Transaction {
    pub(crate) fn new(
        id: TxId,
        scope: Scope,
        transport: Arc<dyn Transport>,
        context: CallContext,
        watched: Vec<PhysicalKey>,
    ) -> Self {
        Self {
            id,
            scope,
            transport,
            context,
            inner: Mutex::new(TxInner {
                phase: TxPhase::Watched,
                watched,
                queue: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> TxPhase {
        self.lock().phase
    }

    pub fn watched_keys(&self) -> Vec<PhysicalKey> {
        self.lock().watched.clone()
    }

    /// Queue commands on behalf of `context`. Each queued command checks
    /// the context, so a call from a context other than the owner fails
    /// with `StaleContext`.
    pub fn with<'a>(&'a self, context: &'a CallContext) -> Session<'a> {
        Session { tx: self, context }
    }

    fn lock(&self) -> MutexGuard<'_, TxInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, inner: &TxInner, context: &CallContext) -> Result<()> {
        if inner.phase.is_closed() {
            return Err(KvError::SessionClosed);
        }
        if *context != self.context {
            warn!(tx = %self.id, owner = self.context.id(), caller = context.id(), "transaction used from another context");
            return Err(KvError::StaleContext);
        }
        Ok(())
    }

    /// Check context and phase under the lock.
    fn expect_phase(&self, context: &CallContext, allowed: &[TxPhase], action: &str) -> Result<()> {
        let inner = self.lock();
        self.check(&inner, context)?;
        if !allowed.contains(&inner.phase) {
            return Err(KvError::InvalidState(format!(
                "{} is not allowed while {:?}",
                action, inner.phase
            )));
        }
        Ok(())
    }

    async fn control(&self, op: Op) -> Result<Reply> {
        let request = Request::new(op, self.scope).in_tx(self.id.clone());
        self.transport.call(request).await
    }

    fn enqueue<T>(&self, context: &CallContext, cmd: Cmd<T>) -> Result<Queued<T>>
    where
        T: Into<Value> + 'static,
    {
        let mut inner = self.lock();
        self.check(&inner, context)?;
        if inner.phase != TxPhase::Queuing {
            return Err(KvError::InvalidState(format!(
                "{} issued before MULTI",
                cmd.op.name()
            )));
        }
        let Cmd { op, nil, decode } = cmd;
        let index = inner.queue.len();
        inner.queue.push(QueuedOp {
            op,
            decode: Box::new(move |reply| decode(reply, nil).map(Into::into)),
        });
        Ok(Queued {
            index,
            _marker: PhantomData,
        })
    }

    /// Add keys to the watched set.
    pub async fn watch(&self, context: &CallContext, keys: &[&str]) -> Result<()> {
        self.expect_phase(context, &[TxPhase::Watched], "WATCH")?;
        let keys: Vec<PhysicalKey> = keys.iter().map(|k| resolve(k, self.scope)).collect();
        match self.control(Op::Watch { keys: keys.clone() }).await? {
            Reply::Ok => {
                self.lock().watched.extend(keys);
                Ok(())
            }
            other => Err(other.unexpected("ok")),
        }
    }

    /// Forget every watched key; the transaction stays open.
    pub async fn unwatch(&self, context: &CallContext) -> Result<()> {
        self.expect_phase(context, &[TxPhase::Watched], "UNWATCH")?;
        match self.control(Op::Unwatch).await? {
            Reply::Ok => {
                self.lock().watched.clear();
                Ok(())
            }
            other => Err(other.unexpected("ok")),
        }
    }

    /// Start queuing commands.
    pub async fn multi(&self, context: &CallContext) -> Result<()> {
        self.expect_phase(context, &[TxPhase::Watched], "MULTI")?;
        match self.control(Op::Multi).await? {
            Reply::Ok => {
                self.lock().phase = TxPhase::Queuing;
                Ok(())
            }
            other => Err(other.unexpected("ok")),
        }
    }

    /// Send the queue as one batch. Fails with `TransactionAborted` if a
    /// watched key changed; otherwise returns one value per queued command.
    pub async fn exec(&self, context: &CallContext) -> Result<Vec<Value>> {
        let queue = {
            let mut inner = self.lock();
            self.check(&inner, context)?;
            if inner.phase != TxPhase::Queuing {
                return Err(KvError::InvalidState("EXEC without MULTI".to_string()));
            }
            // Closed from here on, whatever the outcome.
            inner.phase = TxPhase::Aborted;
            std::mem::take(&mut inner.queue)
        };

        let (ops, decoders): (Vec<Op>, Vec<SlotDecoder>) =
            queue.into_iter().map(|q| (q.op, q.decode)).unzip();
        debug!(tx = %self.id, commands = ops.len(), "exec");

        let replies = match self.control(Op::Exec { ops }).await? {
            Reply::Multi(replies) => replies,
            Reply::Nil => {
                warn!(tx = %self.id, "transaction aborted: watched key modified");
                return Err(KvError::TransactionAborted);
            }
            other => return Err(other.unexpected("multi")),
        };
        if replies.len() != decoders.len() {
            return Err(KvError::UnexpectedReply {
                expected: "one reply per queued command",
                got: format!("{} replies for {} commands", replies.len(), decoders.len()),
            });
        }

        self.lock().phase = TxPhase::Committed;
        info!(tx = %self.id, commands = replies.len(), "transaction committed");
        replies
            .into_iter()
            .zip(decoders)
            .map(|(reply, decode)| decode(reply))
            .collect()
    }

    /// Drop the queue and close the transaction.
    pub async fn discard(&self, context: &CallContext) -> Result<()> {
        let dropped = {
            let mut inner = self.lock();
            self.check(&inner, context)?;
            inner.phase = TxPhase::Aborted;
            std::mem::take(&mut inner.queue).len()
        };
        info!(tx = %self.id, dropped, "transaction discarded");
        match self.control(Op::Discard).await? {
            Reply::Ok => Ok(()),
            other => Err(other.unexpected("ok")),
        }
    }
}

/// Placeholder for a queued command's result, redeemed against `exec`'s output.
#[derive(Debug)]
pub struct Queued<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Queued<T>
where
    T: TryFrom<Value, Error = KvError>,
{
    /// Position of the command in the transaction.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn take(&self, results: &[Value]) -> Result<T> {
        let value = results.get(self.index).cloned().ok_or_else(|| {
            KvError::InvalidState(format!("no result at position {}", self.index))
        })?;
        T::try_from(value)
    }
}

/// Queuing view of a transaction for one caller context.
pub struct Session<'a> {
    tx: &'a Transaction,
    context: &'a CallContext,
}

impl Session<'_> {
    pub fn transaction(&self) -> &Transaction {
        self.tx
    }
}

impl Commands for Session<'_> {
    type Output<T> = Queued<T>;

    fn scope(&self) -> Scope {
        self.tx.scope
    }

    async fn run<T>(&self, cmd: Cmd<T>) -> Result<Queued<T>>
    where
        T: Into<Value> + 'static,
    {
        self.tx.enqueue(self.context, cmd)
    }
}
