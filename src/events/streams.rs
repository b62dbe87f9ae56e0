use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace, warn};

struct Shared<T> {
    sender: broadcast::Sender<T>,
    /// Most recent events, oldest first
    history: RwLock<VecDeque<T>>,
    history_limit: usize,
}

/// Broadcast channel with a bounded history for late subscribers.
///
/// Cloning is cheap; every clone publishes into the same channel.
pub struct EventStream<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventStream<T> {
    /// `capacity` bounds the broadcast queue, `history_limit` the replay history
    pub fn new(capacity: usize, history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            shared: Arc::new(Shared {
                sender,
                history: RwLock::new(VecDeque::with_capacity(history_limit)),
                history_limit,
            }),
        }
    }

    pub fn subscribe(&self) -> Subscriber<T> {
        debug!(receivers = self.receiver_count() + 1, "Stream subscriber added");
        Subscriber {
            receiver: self.shared.sender.subscribe(),
            shared: self.shared.clone(),
        }
    }

    /// Publish to every live subscriber and return how many there were.
    ///
    /// The event lands in the history even when nobody is listening.
    pub async fn publish(&self, event: T) -> usize {
        if self.shared.history_limit > 0 {
            let mut history = self.shared.history.write().await;
            if history.len() == self.shared.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let receivers = self.shared.sender.send(event).unwrap_or(0);
        trace!(receivers, "Event sent on stream");
        receivers
    }

    pub fn history_limit(&self) -> usize {
        self.shared.history_limit
    }

    pub fn receiver_count(&self) -> usize {
        self.shared.sender.receiver_count()
    }
}

/// Receiving side of an [`EventStream`]
pub struct Subscriber<T: Clone + Send + 'static> {
    receiver: broadcast::Receiver<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Subscriber<T> {
    pub async fn recv(&mut self) -> Result<T, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Next event accepted by `filter`; lag gaps are logged and skipped.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv_matching<F>(&mut self, mut filter: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        loop {
            match self.receiver.recv().await {
                Ok(event) if filter(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged behind, events were skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged behind, events were skipped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Snapshot of the stream's recent history
    pub async fn history(&self) -> Vec<T> {
        self.shared.history.read().await.iter().cloned().collect()
    }
}
