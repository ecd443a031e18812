//! Fan-out hub behind the `/events` websocket.
//!
//! One task owns the subscriber table and serves three channels: register,
//! unregister and broadcast. Delivery uses `try_send`, so a subscriber whose
//! queue is full is evicted instead of stalling everyone else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type Message = Arc<str>;

const CONTROL_CAPACITY: usize = 64;
const BROADCAST_CAPACITY: usize = 1024;

struct Register {
    capacity: usize,
    reply: oneshot::Sender<(u64, mpsc::Receiver<Message>)>,
}

/// Cheap handle to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    register: mpsc::Sender<Register>,
    unregister: mpsc::Sender<u64>,
    broadcast: mpsc::Sender<Message>,
    subscribers: Arc<AtomicUsize>,
}

pub struct Hub {
    register: mpsc::Receiver<Register>,
    unregister: mpsc::Receiver<u64>,
    broadcast: mpsc::Receiver<Message>,
    subscribers: Arc<AtomicUsize>,
    clients: HashMap<u64, mpsc::Sender<Message>>,
    next_id: u64,
}

impl Hub {
    /// Starts the hub task; it exits when `token` is cancelled.
    pub fn spawn(token: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (reg_tx, reg_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (unreg_tx, unreg_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (bc_tx, bc_rx) = mpsc::channel(BROADCAST_CAPACITY);
        let subscribers = Arc::new(AtomicUsize::new(0));

        let hub = Hub {
            register: reg_rx,
            unregister: unreg_rx,
            broadcast: bc_rx,
            subscribers: subscribers.clone(),
            clients: HashMap::new(),
            next_id: 0,
        };
        let handle = HubHandle {
            register: reg_tx,
            unregister: unreg_tx,
            broadcast: bc_tx,
            subscribers,
        };
        (handle, tokio::spawn(hub.run(token)))
    }

    async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(req) = self.register.recv() => {
                    let (tx, rx) = mpsc::channel(req.capacity.max(1));
                    let id = self.next_id;
                    self.next_id += 1;
                    if req.reply.send((id, rx)).is_ok() {
                        self.clients.insert(id, tx);
                    }
                }
                Some(id) = self.unregister.recv() => {
                    self.clients.remove(&id);
                }
                Some(msg) = self.broadcast.recv() => self.fan_out(msg),
                else => break,
            }
            self.subscribers.store(self.clients.len(), Ordering::Relaxed);
        }
        // Dropping the senders closes every subscriber queue.
        self.clients.clear();
        self.subscribers.store(0, Ordering::Relaxed);
        tracing::info!("event hub stopped");
    }

    fn fan_out(&mut self, msg: Message) {
        self.clients.retain(|id, tx| match tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "event subscriber queue full, evicting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl HubHandle {
    /// Registers a subscriber with a queue of `capacity` messages. `None` once
    /// the hub has stopped.
    pub async fn subscribe(&self, capacity: usize) -> Option<(u64, mpsc::Receiver<Message>)> {
        let (reply, rx) = oneshot::channel();
        self.register.send(Register { capacity, reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn unsubscribe(&self, id: u64) {
        let _ = self.unregister.send(id).await;
    }

    pub async fn broadcast(&self, msg: impl Into<Message>) {
        let _ = self.broadcast.send(msg.into()).await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_submit_order() {
        let token = CancellationToken::new();
        let (hub, task) = Hub::spawn(token.clone());
        let (_, mut a) = hub.subscribe(8).await.unwrap();
        let (_, mut b) = hub.subscribe(8).await.unwrap();

        for n in 0..3 {
            hub.broadcast(format!("m{n}")).await;
        }

        for rx in [&mut a, &mut b] {
            for n in 0..3 {
                assert_eq!(&*rx.recv().await.unwrap(), format!("m{n}"));
            }
        }
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn full_subscriber_is_evicted() {
        let token = CancellationToken::new();
        let (hub, _task) = Hub::spawn(token.clone());
        let (_, mut slow) = hub.subscribe(1).await.unwrap();
        let (_, mut fast) = hub.subscribe(8).await.unwrap();

        hub.broadcast("first").await;
        hub.broadcast("second").await;
        hub.broadcast("third").await;

        assert_eq!(&*slow.recv().await.unwrap(), "first");
        assert!(slow.recv().await.is_none());
        for want in ["first", "second", "third"] {
            assert_eq!(&*fast.recv().await.unwrap(), want);
        }
        assert_eq!(hub.subscriber_count(), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn unsubscribe_closes_queue() {
        let token = CancellationToken::new();
        let (hub, _task) = Hub::spawn(token.clone());
        let (id, mut rx) = hub.subscribe(4).await.unwrap();

        hub.unsubscribe(id).await;

        assert!(rx.recv().await.is_none());
        token.cancel();
    }
}
