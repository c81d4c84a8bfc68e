//! In-memory broker.
//!
//! Queues with competing consumers, per-channel prefetch, manual
//! acknowledgement and server-named exclusive queues. Unacknowledged
//! deliveries return to their queue when the channel closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::channel::mpsc as stream_mpsc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::{
    BrokerEndpoint, BrokerError, Channel, Delivery, DeliveryStream, Link, MessageProperties,
    QueueKind, Result, Transport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    properties: MessageProperties,
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl MemoryQueue {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn push(&self, message: Message) {
        // The queue owns its receiver, so this cannot fail.
        let _ = self.tx.send(message);
    }
}

#[derive(Default)]
struct BrokerInner {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    links: Mutex<Vec<Weak<LinkState>>>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

/// Shared in-memory broker. Clones share queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new links until turned off again.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Kill every open link, as a network partition would.
    pub fn sever_connections(&self) {
        let links: Vec<_> = lock(&self.inner.links)
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for link in links {
            link.kill();
        }
    }

    /// Number of links opened so far.
    pub fn connections_opened(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        lock(&self.inner.queues).contains_key(name)
    }

    /// Unacknowledged deliveries across every open channel.
    pub fn unacked_count(&self) -> usize {
        lock(&self.inner.links)
            .iter()
            .filter_map(|weak| weak.upgrade())
            .map(|link| {
                lock(&link.channels)
                    .iter()
                    .map(|channel| lock(&channel.inflight).len())
                    .sum::<usize>()
            })
            .sum()
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.inner.queues).get(name).cloned()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    type Link = MemoryLink;

    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<MemoryLink> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!(
                "connection refused by {}:{}",
                endpoint.host, endpoint.port
            )));
        }

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(LinkState {
            alive: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        });
        lock(&self.inner.links).push(Arc::downgrade(&state));

        Ok(MemoryLink {
            broker: self.clone(),
            state,
        })
    }
}

struct LinkState {
    alive: AtomicBool,
    channels: Mutex<Vec<Arc<ChannelState>>>,
}

impl LinkState {
    fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let channels: Vec<_> = lock(&self.channels).drain(..).collect();
        for channel in channels {
            channel.shut();
        }
    }
}

/// One link to a `MemoryBroker`.
pub struct MemoryLink {
    broker: MemoryBroker,
    state: Arc<LinkState>,
}

#[async_trait]
impl Link for MemoryLink {
    type Channel = MemoryChannel;

    fn is_connected(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<MemoryChannel> {
        if !self.is_connected() {
            return Err(BrokerError::Channel("connection closed".to_string()));
        }

        let (closed, _) = watch::channel(false);
        let state = Arc::new(ChannelState {
            broker: self.broker.clone(),
            closed,
            prefetch: Mutex::new(Arc::new(Semaphore::new(Semaphore::MAX_PERMITS))),
            next_tag: AtomicU64::new(0),
            inflight: Mutex::new(HashMap::new()),
            exclusive: Mutex::new(Vec::new()),
        });
        lock(&self.state.channels).push(Arc::clone(&state));

        Ok(MemoryChannel {
            link: Arc::clone(&self.state),
            state,
        })
    }

    async fn close(&self) {
        self.state.kill();
    }
}

struct Inflight {
    queue: Arc<MemoryQueue>,
    message: Message,
    _permit: OwnedSemaphorePermit,
}

struct ChannelState {
    broker: MemoryBroker,
    closed: watch::Sender<bool>,
    prefetch: Mutex<Arc<Semaphore>>,
    next_tag: AtomicU64,
    inflight: Mutex<HashMap<u64, Inflight>>,
    exclusive: Mutex<Vec<String>>,
}

impl ChannelState {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close once: requeue unacked deliveries, drop exclusive queues.
    fn shut(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let inflight: Vec<_> = lock(&self.inflight).drain().collect();
        for (_, delivery) in inflight {
            delivery.queue.push(delivery.message);
        }

        let exclusive: Vec<_> = lock(&self.exclusive).drain(..).collect();
        let mut queues = lock(&self.broker.inner.queues);
        for name in exclusive {
            queues.remove(&name);
        }
    }

    fn requeue(&self, tag: u64) {
        if let Some(delivery) = lock(&self.inflight).remove(&tag) {
            delivery.queue.push(delivery.message);
        }
    }
}

/// A channel on a `MemoryLink`.
pub struct MemoryChannel {
    link: Arc<LinkState>,
    state: Arc<ChannelState>,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<()> {
        if !self.link.alive.load(Ordering::SeqCst) || self.state.is_closed() {
            return Err(BrokerError::Channel("channel closed".to_string()));
        }
        Ok(())
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn run_consumer(
    state: Arc<ChannelState>,
    queue: Arc<MemoryQueue>,
    out: stream_mpsc::UnboundedSender<Result<Delivery>>,
) {
    let prefetch = Arc::clone(&*lock(&state.prefetch));
    let mut closed = state.closed.subscribe();

    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&prefetch).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = wait_closed(&mut closed) => break,
        };

        let message = tokio::select! {
            message = async { queue.rx.lock().await.recv().await } => match message {
                Some(message) => message,
                None => break,
            },
            _ = wait_closed(&mut closed) => break,
        };

        let tag = state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery {
            tag,
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        lock(&state.inflight).insert(
            tag,
            Inflight {
                queue: Arc::clone(&queue),
                message,
                _permit: permit,
            },
        );

        // Lost a race with close: shut() may already have drained inflight.
        if state.is_closed() || out.unbounded_send(Ok(delivery)).is_err() {
            state.requeue(tag);
            break;
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, name: &str, kind: QueueKind) -> Result<String> {
        self.check_open()?;

        let name = match (kind, name.is_empty()) {
            (QueueKind::Exclusive, true) => format!("amq.gen-{}", uuid::Uuid::new_v4()),
            (_, true) => {
                return Err(BrokerError::Declare("queue name required".to_string()));
            }
            (_, false) => name.to_string(),
        };

        lock(&self.state.broker.inner.queues)
            .entry(name.clone())
            .or_insert_with(MemoryQueue::new);
        if kind == QueueKind::Exclusive {
            lock(&self.state.exclusive).push(name.clone());
        }

        debug!(queue = %name, kind = ?kind, "Queue declared");
        Ok(name)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.check_open()?;
        let permits = if count == 0 {
            Semaphore::MAX_PERMITS
        } else {
            count as usize
        };
        *lock(&self.state.prefetch) = Arc::new(Semaphore::new(permits));
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.check_open()?;
        let target = self
            .state
            .broker
            .queue(queue)
            .ok_or_else(|| BrokerError::Consume(format!("no queue '{}'", queue)))?;

        let (tx, rx) = stream_mpsc::unbounded();
        tokio::spawn(run_consumer(Arc::clone(&self.state), target, tx));
        Ok(rx.boxed())
    }

    async fn publish(
        &self,
        queue: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        self.check_open()?;
        match self.state.broker.queue(queue) {
            Some(target) => target.push(Message { body, properties }),
            // Default exchange drops unroutable messages.
            None => debug!(queue = %queue, "Dropping message for unknown queue"),
        }
        Ok(())
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.check_open()?;
        lock(&self.state.inflight)
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {}", tag)))
    }

    async fn close(&self) -> Result<()> {
        self.state.shut();
        lock(&self.link.channels).retain(|channel| !Arc::ptr_eq(channel, &self.state));
        Ok(())
    }
}

#[cfg(test)]
mod tests;
