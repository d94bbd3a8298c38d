//! Sink dispatcher
//!
//! The pull sink reads the [`MetricStore`] directly; the push sink is fed
//! through a [`PushQueue`] so the polling loop never waits on sink I/O.

pub mod push_queue;

pub use push_queue::{Offer, PushQueue};

use std::sync::Arc;

use crate::store::{MetricStore, Reading};

#[derive(Debug, Clone)]
pub struct SinkDispatcher {
    store: Arc<MetricStore>,
    push: Option<Arc<PushQueue>>,
}

impl SinkDispatcher {
    pub fn new(store: Arc<MetricStore>) -> Self {
        Self { store, push: None }
    }

    pub fn with_push_queue(mut self, queue: Arc<PushQueue>) -> Self {
        self.push = Some(queue);
        self
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn push_queue(&self) -> Option<&Arc<PushQueue>> {
        self.push.as_ref()
    }

    /// Store the reading and hand it to the push sink; never blocks
    pub fn dispatch(&self, reading: Reading) -> Arc<Reading> {
        let stored = self.store.write(reading);
        if let Some(queue) = &self.push {
            queue.offer(Arc::clone(&stored));
        }
        stored
    }

    /// Forget everything observed on the previous connection
    pub fn reset(&self) {
        self.store.clear();
    }
}
