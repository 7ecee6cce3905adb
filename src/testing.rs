//! Test helpers shared by the store and bus tests.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::bus::PropertyEventSubscriber;

/// A notification as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<T> {
    Init(String, Option<T>),
    Add(String, T),
    Remove(String),
}

/// Subscriber that records every notification in order.
pub struct RecordingSubscriber<T> {
    events: Mutex<Vec<Delivery<T>>>,
    changed: watch::Sender<usize>,
}

impl<T: Clone + Send + Sync> RecordingSubscriber<T> {
    pub fn new() -> std::sync::Arc<Self> {
        let (changed, _) = watch::channel(0);
        std::sync::Arc::new(Self {
            events: Mutex::new(Vec::new()),
            changed,
        })
    }

    pub fn events(&self) -> Vec<Delivery<T>> {
        self.events.lock().clone()
    }

    fn record(&self, delivery: Delivery<T>) {
        let count = {
            let mut events = self.events.lock();
            events.push(delivery);
            events.len()
        };
        self.changed.send_replace(count);
    }

    /// Wait until `predicate` holds for the recorded events.
    pub async fn wait_until(&self, predicate: impl Fn(&[Delivery<T>]) -> bool) -> Vec<Delivery<T>> {
        let mut rx = self.changed.subscribe();
        let waited = tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|_| predicate(self.events.lock().as_slice())),
        )
        .await;
        assert!(waited.is_ok(), "timed out after {} events", self.events.lock().len());
        self.events()
    }

    /// Wait until at least `count` events were recorded.
    pub async fn wait_for_count(&self, count: usize) -> Vec<Delivery<T>> {
        self.wait_until(|events| events.len() >= count).await
    }
}

impl<T: Clone + Send + Sync> PropertyEventSubscriber<T> for RecordingSubscriber<T> {
    fn on_initialize(&self, name: &str, value: Option<&T>) {
        self.record(Delivery::Init(name.to_string(), value.cloned()));
    }

    fn on_add(&self, name: &str, value: &T) {
        self.record(Delivery::Add(name.to_string(), value.clone()));
    }

    fn on_remove(&self, name: &str) {
        self.record(Delivery::Remove(name.to_string()));
    }
}
