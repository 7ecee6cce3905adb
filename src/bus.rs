//! Event bus between a property publisher and application subscribers.
//!
//! All subscriber callbacks of one bus run on a single dispatcher task, in
//! the order the publisher produced the events. Each subscriber first gets
//! exactly one `on_initialize` per property, carrying the value known at
//! that point, then `on_add`/`on_remove` for every later change.
//!
//! The first subscription to a name asks the publisher to start publishing
//! it; the last unsubscription asks it to stop.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Consumer of property notifications.
pub trait PropertyEventSubscriber<T>: Send + Sync {
    /// Current value of a property when the subscription starts. `None` if
    /// the property does not exist.
    fn on_initialize(&self, name: &str, value: Option<&T>);

    /// The property was created or changed.
    fn on_add(&self, name: &str, value: &T);

    /// The property was removed.
    fn on_remove(&self, name: &str);
}

/// Source of property notifications, typically a property store.
pub trait PropertyEventPublisher<T>: Send + Sync {
    /// Where to publish. Called once when the bus is created.
    fn set_sink(&self, sink: PublishSink<T>);

    /// Begin publishing `name`. The publisher must answer with an
    /// initialize event once it knows the current value.
    fn start_publishing(&self, name: &str);

    /// Stop publishing `name`.
    fn stop_publishing(&self, name: &str);
}

type SubscriberRef<T> = Arc<dyn PropertyEventSubscriber<T>>;

enum BusCommand<T> {
    Register(Vec<String>, SubscriberRef<T>),
    Unregister(Vec<String>, SubscriberRef<T>),
    Initialize(String, Option<T>),
    Add(String, T),
    Remove(String),
    Flush(oneshot::Sender<()>),
}

/// Handle a publisher uses to feed the bus.
pub struct PublishSink<T> {
    tx: mpsc::UnboundedSender<BusCommand<T>>,
}

impl<T> Clone for PublishSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for PublishSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishSink")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T> PublishSink<T> {
    /// Current value of a property, in answer to `start_publishing`.
    pub fn publish_initialize(&self, name: &str, value: Option<T>) {
        let _ = self.tx.send(BusCommand::Initialize(name.to_string(), value));
    }

    pub fn publish_add(&self, name: &str, value: T) {
        let _ = self.tx.send(BusCommand::Add(name.to_string(), value));
    }

    pub fn publish_remove(&self, name: &str) {
        let _ = self.tx.send(BusCommand::Remove(name.to_string()));
    }
}

struct Subscription<T> {
    subscriber: SubscriberRef<T>,
    initialized: bool,
}

struct PropertyState<T> {
    subscriptions: Vec<Subscription<T>>,
    /// `None` until the publisher initialized the property.
    value: Option<Option<T>>,
}

fn same_subscriber<T>(a: &SubscriberRef<T>, b: &SubscriberRef<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Run a subscriber callback, containing panics.
fn deliver(name: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!(name = %name, "subscriber panicked during delivery");
    }
}

enum Change<'a, T> {
    Initialize(Option<&'a T>),
    Add(&'a T),
    Remove,
}

struct Dispatcher<T> {
    publisher: Arc<dyn PropertyEventPublisher<T>>,
    properties: HashMap<String, PropertyState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Dispatcher<T> {
    fn register(&mut self, names: Vec<String>, subscriber: SubscriberRef<T>) {
        for name in names {
            let state = self
                .properties
                .entry(name.clone())
                .or_insert_with(|| PropertyState {
                    subscriptions: Vec::new(),
                    value: None,
                });
            if state
                .subscriptions
                .iter()
                .any(|s| same_subscriber(&s.subscriber, &subscriber))
            {
                continue;
            }
            let first = state.subscriptions.is_empty();
            let initialized = match &state.value {
                Some(value) => {
                    let sub = subscriber.clone();
                    deliver(&name, || sub.on_initialize(&name, value.as_ref()));
                    true
                }
                None => false,
            };
            state.subscriptions.push(Subscription {
                subscriber: subscriber.clone(),
                initialized,
            });
            if first {
                debug!(name = %name, "start publishing");
                self.publisher.start_publishing(&name);
            }
        }
    }

    fn unregister(&mut self, names: Vec<String>, subscriber: SubscriberRef<T>) {
        for name in names {
            let Some(state) = self.properties.get_mut(&name) else {
                continue;
            };
            state
                .subscriptions
                .retain(|s| !same_subscriber(&s.subscriber, &subscriber));
            if state.subscriptions.is_empty() {
                self.properties.remove(&name);
                debug!(name = %name, "stop publishing");
                self.publisher.stop_publishing(&name);
            }
        }
    }

    fn publish(&mut self, name: &str, change: Change<'_, T>) {
        let Some(state) = self.properties.get_mut(name) else {
            return;
        };
        state.value = Some(match &change {
            Change::Initialize(value) => value.cloned(),
            Change::Add(value) => Some((*value).clone()),
            Change::Remove => None,
        });
        let current = state.value.as_ref().and_then(|v| v.as_ref());

        for subscription in state.subscriptions.iter_mut() {
            let sub = &subscription.subscriber;
            if !subscription.initialized {
                subscription.initialized = true;
                deliver(name, || sub.on_initialize(name, current));
                continue;
            }
            match (&change, current) {
                (Change::Remove, _) | (Change::Initialize(_), None) => {
                    deliver(name, || sub.on_remove(name));
                }
                (_, Some(value)) => deliver(name, || sub.on_add(name, value)),
                (_, None) => {}
            }
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BusCommand<T>>) {
        while let Some(command) = rx.recv().await {
            match command {
                BusCommand::Register(names, subscriber) => self.register(names, subscriber),
                BusCommand::Unregister(names, subscriber) => self.unregister(names, subscriber),
                BusCommand::Initialize(name, value) => {
                    self.publish(&name, Change::Initialize(value.as_ref()))
                }
                BusCommand::Add(name, value) => self.publish(&name, Change::Add(&value)),
                BusCommand::Remove(name) => self.publish(&name, Change::Remove),
                BusCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("event bus dispatcher stopped");
    }
}

/// Serializing dispatcher in front of a [`PropertyEventPublisher`].
pub struct EventBus<T> {
    tx: mpsc::UnboundedSender<BusCommand<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> EventBus<T> {
    /// Create a bus fed by `publisher` and start its dispatcher task.
    pub fn new(publisher: Arc<dyn PropertyEventPublisher<T>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        publisher.set_sink(PublishSink { tx: tx.clone() });
        let dispatcher = Dispatcher {
            publisher,
            properties: HashMap::new(),
        };
        let task = tokio::spawn(dispatcher.run(rx));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Subscribe to `names`.
    pub fn register<I, S>(&self, names: I, subscriber: Arc<dyn PropertyEventSubscriber<T>>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect();
        let _ = self.tx.send(BusCommand::Register(names, subscriber));
    }

    /// Unsubscribe from `names`. Deliveries already queued may still arrive.
    pub fn unregister<I, S>(&self, names: I, subscriber: Arc<dyn PropertyEventSubscriber<T>>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect();
        let _ = self.tx.send(BusCommand::Unregister(names, subscriber));
    }

    /// Wait until every command sent before this call was dispatched.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(BusCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Stop the dispatcher after draining queued commands from this handle.
    pub async fn shutdown(&self) {
        self.flush().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("running", &self.task.lock().is_some())
            .finish()
    }
}
