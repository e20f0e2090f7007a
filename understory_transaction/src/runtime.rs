// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The tokio driver of a [`Document`].
//!
//! [`DocumentHandle::spawn`] moves a document into an actor task that owns
//! the lane queue, its timers and every in-flight resource load. Loader
//! completions come back over a channel and are committed as ordinary
//! transactions; the commit step itself never awaits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use understory_converge::{
    LoadRequest, SourceConcurrency, SourceSettlement, SourceTarget, ValidateRequest,
};

use crate::document::{Commit, Document, TxnError};
use crate::queue::{QueuePolicy, TxnQueue};
use crate::txn::{CommitMeta, Lane, Priority, Txn};

const COMMAND_CAPACITY: usize = 64;

/// Fetches the data of a source.
#[async_trait::async_trait]
pub trait ResourceLoader: Send + Sync {
    /// Loads `key`. The error value lands in the snapshot's `error` field.
    async fn load(&self, key: Value) -> Result<Value, Value>;
}

/// A [`ResourceLoader`] backed by an async closure.
pub struct FnLoader<F>(pub F);

impl<F> core::fmt::Debug for FnLoader<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnLoader").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<F, Fut> ResourceLoader for FnLoader<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Value>> + Send + 'static,
{
    async fn load(&self, key: Value) -> Result<Value, Value> {
        (self.0)(key).await
    }
}

/// Loaders by resource id.
#[derive(Clone, Default)]
pub struct Loaders {
    map: HashMap<String, Arc<dyn ResourceLoader>>,
}

impl core::fmt::Debug for Loaders {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<&String> = self.map.keys().collect();
        keys.sort();
        f.debug_struct("Loaders").field("resources", &keys).finish()
    }
}

impl Loaders {
    /// No loaders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a loader.
    #[must_use]
    pub fn with(mut self, resource: impl Into<String>, loader: impl ResourceLoader + 'static) -> Self {
        self.insert(resource, loader);
        self
    }

    /// Adds or replaces a loader.
    pub fn insert(&mut self, resource: impl Into<String>, loader: impl ResourceLoader + 'static) {
        self.map.insert(resource.into(), Arc::new(loader));
    }

    /// Looks up a loader.
    #[must_use]
    pub fn get(&self, resource: &str) -> Option<Arc<dyn ResourceLoader>> {
        self.map.get(resource).cloned()
    }
}

/// A committed state as seen by subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    /// Commit sequence number.
    pub seq: u64,
    /// The state.
    pub state: Arc<Value>,
    /// Metadata of the commit (`None` for the cold-start state).
    pub meta: Option<CommitMeta>,
}

type Reply = oneshot::Sender<Result<CommitMeta, TxnError>>;

enum Command {
    Dispatch { txn: Txn, reply: Reply },
    Idle(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

struct Queued {
    txn: Txn,
    reply: Option<Reply>,
}

struct Settled {
    target: String,
    token: u64,
    request: LoadRequest,
    result: Result<Value, Value>,
}

struct InFlight {
    token: u64,
    target: SourceTarget,
    handle: JoinHandle<()>,
    trailing: Option<LoadRequest>,
}

/// Cloneable handle to a document running on the tokio runtime.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use understory_converge::{Program, Rule, RuleDecl};
/// use understory_transaction::{Document, DocumentHandle, Loaders, Txn};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let program = Program::builder("greeting")
///     .rule(RuleDecl::new(
///         "message",
///         Rule::computed(["name"], |s| {
///             Ok(json!(format!("Hello, {}", s.read_str("name").unwrap_or("you"))))
///         }),
///     ))
///     .build()
///     .unwrap();
/// let doc = Document::builder(Arc::new(program)).build(json!({})).unwrap();
/// let handle = DocumentHandle::spawn(doc, Loaders::new());
///
/// let meta = handle.dispatch(Txn::new().set("name", json!("Ada"))).await.unwrap();
/// assert_eq!(meta.seq, 1);
/// assert_eq!(handle.snapshot().state["message"], json!("Hello, Ada"));
/// handle.shutdown().await;
/// # }
/// ```
#[derive(Clone)]
pub struct DocumentHandle {
    commands: mpsc::Sender<Command>,
    published: watch::Receiver<Published>,
}

impl core::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("seq", &self.published.borrow().seq)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl DocumentHandle {
    /// Moves `document` into an actor task on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn spawn(document: Document, loaders: Loaders) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let (publish, published) = watch::channel(Published {
            seq: document.seq(),
            state: Arc::clone(document.state()),
            meta: None,
        });
        let mut actor = Actor {
            queue: TxnQueue::new(QueuePolicy::from(&document.config().lanes)),
            document,
            loaders,
            epoch: Instant::now(),
            commands: command_rx,
            settled_tx,
            settled_rx,
            inflight: HashMap::new(),
            next_token: 0,
            idle_waiters: Vec::new(),
            publish,
        };
        actor.start_effects();
        tokio::spawn(actor.run());
        Self {
            commands,
            published,
        }
    }

    /// Queues `txn` and waits for the commit that applied it.
    ///
    /// # Errors
    ///
    /// Returns the commit's error, or [`TxnError::Closed`] if the actor
    /// stopped first.
    pub async fn dispatch(&self, txn: Txn) -> Result<CommitMeta, TxnError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Dispatch { txn, reply })
            .await
            .map_err(|_| TxnError::Closed)?;
        done.await.map_err(|_| TxnError::Closed)?
    }

    /// Like [`dispatch`](Self::dispatch) with an explicit priority.
    ///
    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub async fn dispatch_with(&self, priority: Priority, txn: Txn) -> Result<CommitMeta, TxnError> {
        self.dispatch(txn.with_priority(priority)).await
    }

    /// Runs validation in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub async fn validate(&self, requests: Vec<ValidateRequest>) -> Result<CommitMeta, TxnError> {
        self.dispatch(Txn::new().validate(requests)).await
    }

    /// Refreshes the source at `path` in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch); unknown paths fail with
    /// [`TxnError::UnknownSource`].
    pub async fn refresh_source(&self, path: impl Into<String>, force: bool) -> Result<CommitMeta, TxnError> {
        self.dispatch(Txn::new().refresh_source(path, force)).await
    }

    /// Latest published state.
    #[must_use]
    pub fn snapshot(&self) -> Published {
        self.published.borrow().clone()
    }

    /// Receiver of every published state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Published> {
        self.published.clone()
    }

    /// Resolves once the queue is empty and no load is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`TxnError::Closed`] if the actor stopped first.
    pub async fn idle(&self) -> Result<(), TxnError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Idle(reply))
            .await
            .map_err(|_| TxnError::Closed)?;
        done.await.map_err(|_| TxnError::Closed)
    }

    /// Stops the actor and aborts in-flight loads. Pending transactions
    /// fail with [`TxnError::Closed`].
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
    }
}

struct Actor {
    document: Document,
    queue: TxnQueue<Queued>,
    loaders: Loaders,
    epoch: Instant,
    commands: mpsc::Receiver<Command>,
    settled_tx: mpsc::UnboundedSender<Settled>,
    settled_rx: mpsc::UnboundedReceiver<Settled>,
    inflight: HashMap<String, InFlight>,
    next_token: u64,
    idle_waiters: Vec<oneshot::Sender<()>>,
    publish: watch::Sender<Published>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let deadline = self.queue.next_deadline().map(|at| self.epoch + at);
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command) {
                        return;
                    }
                }
                Some(settled) = self.settled_rx.recv() => self.on_settled(settled),
                () = sleep_until(deadline) => {}
            }
            self.drain();
            self.wake_idle();
        }
        self.stop();
    }

    fn now(&self) -> Duration {
        Instant::now().saturating_duration_since(self.epoch)
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Dispatch { txn, reply } => {
                let lane = txn.lane();
                let now = self.now();
                self.queue.push(
                    lane,
                    Queued {
                        txn,
                        reply: Some(reply),
                    },
                    now,
                );
                true
            }
            Command::Idle(reply) => {
                self.idle_waiters.push(reply);
                true
            }
            Command::Shutdown(reply) => {
                self.stop();
                let _ = reply.send(());
                false
            }
        }
    }

    fn drain(&mut self) {
        let now = self.now();
        while let Some(batch) = self.queue.pop(now) {
            let (txns, replies): (Vec<Txn>, Vec<Option<Reply>>) = batch
                .items
                .into_iter()
                .map(|queued| (queued.txn, queued.reply))
                .unzip();
            let result = self.document.commit(txns);
            if let Ok(commit) = &result {
                self.published(commit);
                self.start_effects();
                self.reap_rows();
            }
            let result = result.map(|commit| commit.meta);
            for reply in replies.into_iter().flatten() {
                let _ = reply.send(result.clone());
            }
        }
    }

    fn published(&self, commit: &Commit) {
        self.publish.send_replace(Published {
            seq: commit.meta.seq,
            state: Arc::clone(&commit.state),
            meta: Some(commit.meta.clone()),
        });
    }

    fn start_effects(&mut self) {
        let effects = self.document.take_effects();
        let now = self.now();
        for settlement in effects.settlements {
            self.queue.push(
                Lane::Urgent,
                Queued {
                    txn: Txn::settle(settlement),
                    reply: None,
                },
                now,
            );
        }
        for request in effects.loads {
            self.start_load(request);
        }
    }

    fn start_load(&mut self, request: LoadRequest) {
        let target = request.target.key();
        if let Some(flight) = self.inflight.get_mut(&target) {
            match request.concurrency {
                SourceConcurrency::ExhaustTrailing => {
                    tracing::trace!(source = %target, "load queued behind in-flight request");
                    flight.trailing = Some(request);
                    return;
                }
                SourceConcurrency::Switch => {
                    tracing::trace!(source = %target, "superseded load aborted");
                    flight.handle.abort();
                }
            }
        }

        let token = self.next_token;
        self.next_token += 1;
        let loader = self.loaders.get(&request.resource);
        if loader.is_none() {
            tracing::warn!(resource = %request.resource, "no loader registered for resource");
        }
        let settled = self.settled_tx.clone();
        let key = target.clone();
        let source = request.target.clone();
        let handle = tokio::spawn(async move {
            let result = match loader {
                Some(loader) => loader.load(request.key.clone()).await,
                None => Err(json!({
                    "message": format!("no loader registered for `{}`", request.resource)
                })),
            };
            let _ = settled.send(Settled {
                target: key,
                token,
                request,
                result,
            });
        });
        self.inflight.insert(
            target,
            InFlight {
                token,
                target: source,
                handle,
                trailing: None,
            },
        );
    }

    fn on_settled(&mut self, settled: Settled) {
        let current = self
            .inflight
            .get(&settled.target)
            .is_some_and(|flight| flight.token == settled.token);
        if !current {
            tracing::trace!(source = %settled.target, "result of an aborted load ignored");
            return;
        }
        let trailing = self
            .inflight
            .remove(&settled.target)
            .and_then(|flight| flight.trailing);
        let settlement = SourceSettlement::from_result(&settled.request, settled.result);
        let now = self.now();
        self.queue.push(
            Lane::Urgent,
            Queued {
                txn: Txn::settle(settlement),
                reply: None,
            },
            now,
        );
        if let Some(next) = trailing {
            self.start_load(next);
        }
    }

    /// Aborts loads whose row left its list.
    fn reap_rows(&mut self) {
        let rows = self.document.rows();
        let gone: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, flight)| {
                matches!(flight.target, SourceTarget::Row { .. }) && flight.target.resolve(rows).is_none()
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in gone {
            if let Some(flight) = self.inflight.remove(&key) {
                tracing::trace!(source = %key, "load of a removed row aborted");
                flight.handle.abort();
            }
        }
    }

    fn wake_idle(&mut self) {
        if self.queue.is_empty() && self.inflight.is_empty() {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn stop(&mut self) {
        for (_, flight) in self.inflight.drain() {
            flight.handle.abort();
        }
        tracing::debug!(
            module_id = self.document.program().module_id(),
            seq = self.document.seq(),
            pending = self.queue.len(),
            "document runtime stopped"
        );
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
