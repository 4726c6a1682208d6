/// Event queue between the chain listener and the relay worker
///
/// Hàng đợi FIFO, nhiều producer, một consumer duy nhất. `enqueue` never
/// blocks and never fails; every enqueue raises a wake-up notification the
/// worker's run loop waits on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::gauge;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error};

use crate::types::QueuedEvent;

/// Producer handle; cheap to clone
#[derive(Clone)]
pub struct EventQueue {
    sender: mpsc::UnboundedSender<QueuedEvent>,
    notify: Arc<Notify>,
    depth: Arc<AtomicUsize>,
}

/// The single consumer side, owned by the relay worker
pub struct EventReceiver {
    receiver: mpsc::UnboundedReceiver<QueuedEvent>,
    depth: Arc<AtomicUsize>,
}

impl EventQueue {
    /// Create a queue and its only receiver
    pub fn new() -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sender,
                notify: Arc::new(Notify::new()),
                depth: depth.clone(),
            },
            EventReceiver { receiver, depth },
        )
    }

    /// Append to the tail and wake the worker
    pub fn enqueue(&self, event: QueuedEvent) {
        let label = event.to_string();
        self.depth.fetch_add(1, Ordering::SeqCst);
        match self.sender.send(event) {
            Ok(()) => {
                debug!("Queued {}", label);
                self.report_depth();
                self.notify.notify_one();
            }
            Err(_) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                error!("Relay worker is gone, dropping {}", label);
            }
        }
    }

    /// Events waiting to be processed
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Wake-up signal raised on every enqueue
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn report_depth(&self) {
        gauge!("relay_queue_depth", self.depth() as f64);
    }
}

impl EventReceiver {
    /// Take the head of the queue without waiting
    pub fn try_next(&mut self) -> Option<QueuedEvent> {
        match self.receiver.try_recv() {
            Ok(event) => {
                let left = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                gauge!("relay_queue_depth", left as f64);
                Some(event)
            }
            Err(_) => None,
        }
    }
}
