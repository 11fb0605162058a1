//! Lifecycle signal bus.
//!
//! A process-local broadcaster of named shutdown/ready signals used to
//! coordinate the supervisor, its listeners and the SOCKS frontend. Delivery
//! is synchronous: [`LifecycleBus::emit`] pushes the signal into every live
//! subscriber's queue before returning, so a subscriber that stops draining
//! its queue back-pressures the emitter once the queue (100 entries) fills.
//!
//! Subscriptions are removed by dropping them; the next emit prunes closed
//! queues.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Queue depth granted to each subscriber before an emitter stalls.
const SUBSCRIBER_BUFFER: usize = 100;

/// Named lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Begin supervisor teardown.
    StopSsh,
    /// Close every tunnel listener now.
    StopTunnels,
    /// Close the SOCKS listener now.
    StopSocks,
    /// All requested tunnel listeners are bound and accepting.
    StartTunnels,
    /// The SSH connection is fully closed; teardown is complete.
    ClosedSsh,
}

/// Receiving side of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<()>,
}

impl Subscription {
    /// Waits for the next delivery of the subscribed signal. Returns `None`
    /// once the bus itself has gone away.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Broadcast hub for [`Signal`]s.
#[derive(Default)]
pub struct LifecycleBus {
    subscribers: Mutex<HashMap<Signal, Vec<mpsc::Sender<()>>>>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber for `signal`.
    pub fn subscribe(&self, signal: Signal) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().entry(signal).or_default().push(tx);
        Subscription { rx }
    }

    /// Delivers `signal` to every live subscriber before returning.
    ///
    /// A subscriber with a full queue stalls this call until it drains; that
    /// is what keeps shutdown ordering deterministic.
    pub async fn emit(&self, signal: Signal) {
        let senders: Vec<mpsc::Sender<()>> = self
            .subscribers
            .lock()
            .get(&signal)
            .cloned()
            .unwrap_or_default();

        let mut saw_closed = false;
        for sender in &senders {
            if sender.send(()).await.is_err() {
                saw_closed = true;
            }
        }

        if saw_closed {
            self.subscribers
                .lock()
                .entry(signal)
                .or_default()
                .retain(|tx| !tx.is_closed());
        }
    }

    /// Number of live subscribers for `signal`.
    pub fn subscriber_count(&self, signal: Signal) -> usize {
        self.subscribers
            .lock()
            .get(&signal)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}
