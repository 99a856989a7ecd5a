//! Proxy Actor - single-threaded dispatch around a `ProxyCore`
//!
//! The actor owns the core and is the only task that touches it. Consumer
//! requests arrive on an inbox, pushed events on an event channel, and
//! backing-store results on a completion channel. Backing-store calls run
//! on a worker task in submission order, so forwarded writes reach the store
//! in the order consumers issued them.
//!
//! ```text
//! ProxyHandle ──► inbox ───────┐
//! BackingStore ─► events ──────┼──► ProxyActor ──► consumer channels
//! worker ───────► completions ─┘        │
//!     ▲                                 │ jobs (sync / write / read)
//!     └─────────────────────────────────┘
//! ```
//!
//! A failed snapshot request is retried after a delay that doubles on each
//! consecutive failure. A pending retry counts as outstanding work.
//!
//! `idle()` resolves once no job is outstanding and every pushed event has
//! been processed and delivered.

use crate::backend::{BackingStore, CursorId, CursorPage, StoreEvent, SyncResponse, WriteAck};
use crate::config::{ProxyConfig, MAX_SYNC_RETRY_MS};
use crate::error::StorageError;
use crate::proxy::core::{Command, LocalWrite, ProxyCore, Read};
use crate::proxy::scheduler::Notification;
use crate::types::{
    BarrierToken, Capabilities, ConsumerId, DeliveryPolicy, Entity, EntityId, ProvenanceKey,
    ProxyId, StoreId, StoreInfo, Version,
};
use ahash::AHashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type Reply<T> = oneshot::Sender<Result<T, StorageError>>;

enum ProxyMessage {
    Register {
        policy: DeliveryPolicy,
        capabilities: Capabilities,
        reply: oneshot::Sender<ConsumerHandle>,
    },
    Deregister {
        consumer: ConsumerId,
        reply: Reply<()>,
    },
    Fetch {
        consumer: ConsumerId,
        reply: Reply<Option<Entity>>,
    },
    List {
        consumer: ConsumerId,
        reply: Reply<Vec<Entity>>,
    },
    FetchEntity {
        consumer: ConsumerId,
        id: EntityId,
        reply: Reply<Option<Entity>>,
    },
    Write {
        consumer: ConsumerId,
        write: LocalWrite,
        reply: Reply<()>,
    },
    OpenCursor {
        consumer: ConsumerId,
        page_size: Option<usize>,
        forward: bool,
        reply: Reply<(CursorId, Version)>,
    },
    CursorNext {
        consumer: ConsumerId,
        cursor: CursorId,
        reply: Reply<CursorPage>,
    },
    CursorClose {
        consumer: ConsumerId,
        cursor: CursorId,
        reply: Reply<()>,
    },
    Idle {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Result of a backing-store job, fed back into the actor.
enum Completion {
    Synchronized(Result<SyncResponse, StorageError>),
    Written {
        barrier: Option<BarrierToken>,
        result: Result<WriteAck, StorageError>,
        reply: Option<Reply<()>>,
    },
    /// A read finished and already answered its caller.
    Done,
}

type Job = BoxFuture<'static, Completion>;

/// A consumer's end of a registration.
pub struct ConsumerHandle {
    id: ConsumerId,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

impl ConsumerHandle {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Everything delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.notifications.try_recv().ok()).collect()
    }
}

pub struct ProxyActor {
    core: ProxyCore,
    backend: Arc<dyn BackingStore>,
    store: StoreId,
    default_page_size: usize,
    rx: mpsc::UnboundedReceiver<ProxyMessage>,
    events_tx: mpsc::UnboundedSender<StoreEvent>,
    events_rx: mpsc::UnboundedReceiver<StoreEvent>,
    jobs: mpsc::UnboundedSender<Job>,
    completions: mpsc::UnboundedReceiver<Completion>,
    retry_tx: mpsc::UnboundedSender<()>,
    retry_rx: mpsc::UnboundedReceiver<()>,
    base_retry: Duration,
    next_retry: Duration,
    consumers: AHashMap<ConsumerId, mpsc::UnboundedSender<Notification>>,
    outstanding: usize,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl ProxyActor {
    /// Run the actor loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle_message(msg).await {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(completion) = self.completions.recv() => self.handle_completion(completion).await,
                Some(()) = self.retry_rx.recv() => {
                    self.outstanding = self.outstanding.saturating_sub(1);
                    let commands = self.core.retry_sync();
                    self.execute(commands).await;
                }
            }
            self.settle().await;
        }
        debug!(proxy = %self.core.id(), "proxy actor stopped");
    }

    /// Processes events already pushed, dispatches deliveries and wakes idle
    /// waiters if nothing is left in flight.
    async fn settle(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
        }
        for delivery in self.core.take_deliveries() {
            if let Some(tx) = self.consumers.get(&delivery.consumer) {
                if tx.send(delivery.notification).is_err() {
                    debug!(consumer = %delivery.consumer, "consumer receiver dropped");
                }
            }
        }
        if self.outstanding == 0 {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Handle one inbox message. Returns true on shutdown.
    async fn handle_message(&mut self, msg: ProxyMessage) -> bool {
        match msg {
            ProxyMessage::Register {
                policy,
                capabilities,
                reply,
            } => {
                let (consumer, commands) = self.core.register(policy, capabilities);
                let (tx, rx) = mpsc::unbounded_channel();
                self.consumers.insert(consumer, tx);
                self.execute(commands).await;
                let _ = reply.send(ConsumerHandle {
                    id: consumer,
                    notifications: rx,
                });
            }
            ProxyMessage::Deregister { consumer, reply } => {
                let result = self.core.deregister(consumer);
                self.consumers.remove(&consumer);
                let _ = reply.send(result);
            }
            ProxyMessage::Fetch { consumer, reply } => match self.core.fetch(consumer) {
                Ok(Read::Cached(value)) => {
                    let _ = reply.send(Ok(value));
                }
                Ok(Read::Forward) => {
                    let (backend, store) = (self.backend.clone(), self.store.clone());
                    self.submit(Box::pin(async move {
                        let _ = reply.send(backend.read(&store).await);
                        Completion::Done
                    }));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ProxyMessage::List { consumer, reply } => match self.core.list(consumer) {
                Ok(Read::Cached(items)) => {
                    let _ = reply.send(Ok(items));
                }
                Ok(Read::Forward) => {
                    let (backend, store) = (self.backend.clone(), self.store.clone());
                    self.submit(Box::pin(async move {
                        let _ = reply.send(backend.list(&store).await);
                        Completion::Done
                    }));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ProxyMessage::FetchEntity {
                consumer,
                id,
                reply,
            } => match self.core.fetch_entity(consumer, &id) {
                Ok(Read::Cached(entity)) => {
                    let _ = reply.send(Ok(entity));
                }
                Ok(Read::Forward) => {
                    let (backend, store) = (self.backend.clone(), self.store.clone());
                    self.submit(Box::pin(async move {
                        let _ = reply.send(backend.fetch(&store, &id).await);
                        Completion::Done
                    }));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ProxyMessage::Write {
                consumer,
                write,
                reply,
            } => match self.core.write(consumer, write) {
                Ok(Some(command)) => self.dispatch(command, Some(reply)).await,
                Ok(None) => {
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ProxyMessage::OpenCursor {
                consumer,
                page_size,
                forward,
                reply,
            } => match self.core.check_cursor(consumer, "open_cursor") {
                Ok(()) => {
                    let page_size = page_size.unwrap_or(self.default_page_size);
                    let (backend, store) = (self.backend.clone(), self.store.clone());
                    self.submit(Box::pin(async move {
                        let _ = reply.send(backend.open_cursor(&store, page_size, forward).await);
                        Completion::Done
                    }));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ProxyMessage::CursorNext {
                consumer,
                cursor,
                reply,
            } => match self.core.check_cursor(consumer, "cursor_next") {
                Ok(()) => {
                    let backend = self.backend.clone();
                    self.submit(Box::pin(async move {
                        let _ = reply.send(backend.cursor_next(cursor).await);
                        Completion::Done
                    }));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ProxyMessage::CursorClose {
                consumer,
                cursor,
                reply,
            } => match self.core.check_cursor(consumer, "cursor_close") {
                Ok(()) => {
                    let backend = self.backend.clone();
                    self.submit(Box::pin(async move {
                        let _ = reply.send(backend.cursor_close(cursor).await);
                        Completion::Done
                    }));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ProxyMessage::Idle { reply } => self.idle_waiters.push(reply),
            ProxyMessage::Shutdown { reply } => {
                info!(proxy = %self.core.id(), "proxy actor shutting down");
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn handle_event(&mut self, event: StoreEvent) {
        let commands = self.core.on_event(event);
        self.execute(commands).await;
    }

    async fn handle_completion(&mut self, completion: Completion) {
        self.outstanding = self.outstanding.saturating_sub(1);
        match completion {
            Completion::Synchronized(Ok(response)) => {
                self.next_retry = self.base_retry;
                let commands = self.core.on_sync_response(response);
                self.execute(commands).await;
            }
            Completion::Synchronized(Err(e)) => {
                self.core.on_sync_failed(&e);
                self.schedule_sync_retry();
            }
            Completion::Written {
                barrier,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(ack) => {
                        self.core.on_write_ack(barrier.as_ref(), ack);
                        Ok(())
                    }
                    Err(e) => {
                        self.core.on_write_failed(barrier.as_ref(), &e);
                        Err(e)
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Completion::Done => {}
        }
    }

    async fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            self.dispatch(command, None).await;
        }
    }

    async fn dispatch(&mut self, command: Command, reply: Option<Reply<()>>) {
        match command {
            Command::Initialize => {
                if let Err(e) = self
                    .backend
                    .initialize(&self.store, self.events_tx.clone())
                    .await
                {
                    error!(proxy = %self.core.id(), error = %e, "failed to register event listener");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Command::Synchronize => {
                let (backend, store) = (self.backend.clone(), self.store.clone());
                self.submit(Box::pin(async move {
                    Completion::Synchronized(backend.synchronize(&store).await)
                }));
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Command::Write {
                op,
                barrier,
                originator,
            } => {
                let (backend, store) = (self.backend.clone(), self.store.clone());
                self.submit(Box::pin(async move {
                    let result = backend
                        .write(&store, op, barrier.clone(), Some(originator))
                        .await;
                    Completion::Written {
                        barrier,
                        result,
                        reply,
                    }
                }));
            }
        }
    }

    fn schedule_sync_retry(&mut self) {
        let delay = self.next_retry;
        self.next_retry = (delay * 2).min(Duration::from_millis(MAX_SYNC_RETRY_MS));
        warn!(
            proxy = %self.core.id(),
            delay_ms = delay.as_millis() as u64,
            "retrying synchronization"
        );
        let tx = self.retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        });
        self.outstanding += 1;
    }

    fn submit(&mut self, job: Job) {
        if self.jobs.send(job).is_err() {
            error!(proxy = %self.core.id(), "backend worker stopped");
            return;
        }
        self.outstanding += 1;
    }
}

/// Runs backing-store jobs one at a time, in submission order.
async fn run_backend_worker(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    completions: mpsc::UnboundedSender<Completion>,
) {
    while let Some(job) = jobs.recv().await {
        if completions.send(job.await).is_err() {
            break;
        }
    }
}

/// Public API of a running proxy. Cheap to clone.
#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::UnboundedSender<ProxyMessage>,
    store: StoreId,
}

impl ProxyHandle {
    pub fn store_id(&self) -> &StoreId {
        &self.store
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ProxyMessage,
    ) -> Result<T, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| StorageError::ProxyClosed)?;
        rx.await.map_err(|_| StorageError::ProxyClosed)
    }

    pub async fn register(
        &self,
        policy: DeliveryPolicy,
        capabilities: Capabilities,
    ) -> Result<ConsumerHandle, StorageError> {
        self.request(|reply| ProxyMessage::Register {
            policy,
            capabilities,
            reply,
        })
        .await
    }

    pub async fn deregister(&self, consumer: ConsumerId) -> Result<(), StorageError> {
        self.request(|reply| ProxyMessage::Deregister { consumer, reply })
            .await?
    }

    /// Singleton value.
    pub async fn fetch(&self, consumer: ConsumerId) -> Result<Option<Entity>, StorageError> {
        self.request(|reply| ProxyMessage::Fetch { consumer, reply })
            .await?
    }

    pub async fn list(&self, consumer: ConsumerId) -> Result<Vec<Entity>, StorageError> {
        self.request(|reply| ProxyMessage::List { consumer, reply })
            .await?
    }

    pub async fn fetch_entity(
        &self,
        consumer: ConsumerId,
        id: EntityId,
    ) -> Result<Option<Entity>, StorageError> {
        self.request(|reply| ProxyMessage::FetchEntity {
            consumer,
            id,
            reply,
        })
        .await?
    }

    async fn write(&self, consumer: ConsumerId, write: LocalWrite) -> Result<(), StorageError> {
        self.request(|reply| ProxyMessage::Write {
            consumer,
            write,
            reply,
        })
        .await?
    }

    /// Resolves once the backing store acknowledged the write. The local
    /// effect is visible before that.
    pub async fn set(&self, consumer: ConsumerId, entity: Entity) -> Result<(), StorageError> {
        self.write(consumer, LocalWrite::Set(entity)).await
    }

    pub async fn clear(&self, consumer: ConsumerId) -> Result<(), StorageError> {
        self.write(consumer, LocalWrite::Clear).await
    }

    pub async fn store(&self, consumer: ConsumerId, entity: Entity) -> Result<(), StorageError> {
        self.write(consumer, LocalWrite::Store { entity, key: None })
            .await
    }

    pub async fn store_with_key(
        &self,
        consumer: ConsumerId,
        entity: Entity,
        key: ProvenanceKey,
    ) -> Result<(), StorageError> {
        self.write(
            consumer,
            LocalWrite::Store {
                entity,
                key: Some(key),
            },
        )
        .await
    }

    pub async fn remove(&self, consumer: ConsumerId, id: EntityId) -> Result<(), StorageError> {
        self.write(consumer, LocalWrite::Remove(id)).await
    }

    /// Opens a cursor over a big collection; `None` uses the configured
    /// default page size.
    pub async fn open_cursor(
        &self,
        consumer: ConsumerId,
        page_size: Option<usize>,
        forward: bool,
    ) -> Result<(CursorId, Version), StorageError> {
        self.request(|reply| ProxyMessage::OpenCursor {
            consumer,
            page_size,
            forward,
            reply,
        })
        .await?
    }

    pub async fn cursor_next(
        &self,
        consumer: ConsumerId,
        cursor: CursorId,
    ) -> Result<CursorPage, StorageError> {
        self.request(|reply| ProxyMessage::CursorNext {
            consumer,
            cursor,
            reply,
        })
        .await?
    }

    pub async fn cursor_close(&self, consumer: ConsumerId, cursor: CursorId) -> Result<(), StorageError> {
        self.request(|reply| ProxyMessage::CursorClose {
            consumer,
            cursor,
            reply,
        })
        .await?
    }

    /// Waits for a storage-consistent point: no outstanding backing-store
    /// work and no undelivered notifications.
    pub async fn idle(&self) -> Result<(), StorageError> {
        self.request(|reply| ProxyMessage::Idle { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.request(|reply| ProxyMessage::Shutdown { reply }).await;
    }
}

/// Spawn a proxy actor for `info` and return its handle + join handle
pub fn spawn_proxy(
    id: ProxyId,
    info: StoreInfo,
    backend: Arc<dyn BackingStore>,
    config: &ProxyConfig,
) -> (ProxyHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let (retry_tx, retry_rx) = mpsc::unbounded_channel();
    let base_retry = Duration::from_millis(config.sync_retry_ms);

    let store = info.id.clone();
    let actor = ProxyActor {
        core: ProxyCore::new(id, info, config.max_buffered_events),
        backend,
        store: store.clone(),
        default_page_size: config.default_page_size,
        rx,
        events_tx,
        events_rx,
        jobs: jobs_tx,
        completions: completions_rx,
        retry_tx,
        retry_rx,
        base_retry,
        next_retry: base_retry,
        consumers: AHashMap::new(),
        outstanding: 0,
        idle_waiters: Vec::new(),
    };

    tokio::spawn(run_backend_worker(jobs_rx, completions_tx));
    let task = tokio::spawn(actor.run());
    (ProxyHandle { tx, store }, task)
}
