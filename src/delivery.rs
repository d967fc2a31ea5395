//! Single-subscriber event delivery.
//!
//! Two independent channels: encoded frames and timestamped debug lines.
//! Each channel holds at most one handler in an `ArcSwapOption`; `publish`
//! loads the handler once, so a concurrent `subscribe` makes an in-flight
//! publish reach either the old or the new handler, never both.
//!
//! Handlers run in a `DeliveryContext`. With `Inline` they run on the
//! publishing thread. With `Dedicated` they run on a named delivery thread;
//! publishing from any other thread only enqueues the call and never waits
//! for the handler. Each channel caps how many of its calls may be queued
//! at once; past the cap a publish is dropped rather than buffered.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};

use arc_swap::ArcSwapOption;

use crate::frame::EncodedImage;

type Job = Box<dyn FnOnce() + Send>;

// ----------------------------------------------------------------------------
// Delivery context
// ----------------------------------------------------------------------------

/// Where subscriber handlers execute.
#[derive(Clone)]
pub enum DeliveryContext {
    Inline,
    Dedicated(DeliveryThread),
}

impl DeliveryContext {
    /// Spawns a dedicated delivery thread with the given name.
    pub fn dedicated(name: &str) -> std::io::Result<Self> {
        Ok(DeliveryContext::Dedicated(DeliveryThread::spawn(name)?))
    }

    fn run(&self, job: Job) {
        match self {
            DeliveryContext::Inline => job(),
            DeliveryContext::Dedicated(thread) => thread.execute(job),
        }
    }

    /// True when `run` from the calling thread would queue instead of
    /// invoking directly.
    fn queues_from_here(&self) -> bool {
        match self {
            DeliveryContext::Inline => false,
            DeliveryContext::Dedicated(thread) => !thread.is_current(),
        }
    }
}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryContext::Inline => f.write_str("Inline"),
            DeliveryContext::Dedicated(thread) => write!(f, "Dedicated({})", thread.name()),
        }
    }
}

/// A named thread that runs posted jobs in order.
///
/// Cloning shares the thread. It exits once the last clone is dropped and
/// the queue has drained.
#[derive(Clone)]
pub struct DeliveryThread {
    inner: Arc<DeliveryThreadInner>,
}

struct DeliveryThreadInner {
    name: String,
    thread_id: ThreadId,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryThread {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })?;
        Ok(Self {
            inner: Arc::new(DeliveryThreadInner {
                name: name.to_string(),
                thread_id: join.thread().id(),
                tx: Mutex::new(Some(tx)),
                join: Mutex::new(Some(join)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True when called from the delivery thread itself.
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// Runs `job` directly when already on the delivery thread, otherwise
    /// enqueues it without waiting.
    pub fn execute(&self, job: Job) {
        if self.is_current() {
            job();
            return;
        }
        let sender = match self.inner.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match sender {
            Some(tx) => {
                if tx.send(job).is_err() {
                    log::debug!("DeliveryThread: {} has exited, dropping event", self.name());
                }
            }
            None => log::debug!("DeliveryThread: {} is shut down, dropping event", self.name()),
        }
    }

    /// Blocks until every job posted before this call has run.
    ///
    /// Must not be called from the delivery thread.
    pub fn flush(&self) {
        if self.is_current() {
            return;
        }
        let (done_tx, done_rx) = mpsc::channel();
        self.execute(Box::new(move || {
            let _ = done_tx.send(());
        }));
        let _ = done_rx.recv();
    }
}

impl Drop for DeliveryThreadInner {
    fn drop(&mut self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let join = self.join.lock().ok().and_then(|mut join| join.take());
        if let Some(join) = join {
            if std::thread::current().id() != self.thread_id && join.join().is_err() {
                log::warn!("DeliveryThread: {} panicked", self.name);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Channel: one atomically swapped handler
// ----------------------------------------------------------------------------

struct Subscriber<T> {
    id: u64,
    callback: Box<dyn Fn(T) + Send + Sync>,
}

/// Identifies a subscription so a stale subscriber cannot clear its replacement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Queued calls a channel allows unless configured otherwise.
pub const DEFAULT_BACKLOG: usize = 64;
/// Encoded frames allowed to wait on the delivery thread. A full backlog
/// drops the incoming frame.
pub const FRAME_BACKLOG: usize = 2;

/// Result of a single `Channel::publish`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Publish {
    /// Handed to the subscriber, or queued for it.
    Posted,
    /// The subscriber is still behind on earlier calls.
    Dropped,
    NoSubscriber,
}

impl Publish {
    pub fn is_posted(self) -> bool {
        self == Publish::Posted
    }
}

/// Decrements the channel's queued count when the call finishes or is
/// discarded unrun.
struct Pending(Arc<AtomicUsize>);

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Channel<T> {
    name: &'static str,
    slot: ArcSwapOption<Subscriber<T>>,
    context: DeliveryContext,
    backlog: usize,
    pending: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Channel<T> {
    pub fn new(name: &'static str, context: DeliveryContext) -> Self {
        Self {
            name,
            slot: ArcSwapOption::empty(),
            context,
            backlog: DEFAULT_BACKLOG,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Caps queued calls at `backlog` (at least one).
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    /// Calls posted to the delivery thread that have not finished yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Installs `handler`, silently replacing any previous one.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        let previous = self.slot.swap(Some(Arc::new(Subscriber {
            id,
            callback: Box::new(handler),
        })));
        if previous.is_some() {
            log::debug!("{} channel: subscriber replaced", self.name);
        }
        SubscriptionId(id)
    }

    /// Clears the handler. Later publishes are no-ops.
    pub fn unsubscribe(&self) {
        self.slot.store(None);
    }

    /// Clears the handler only if it is still the one identified by `id`.
    pub fn unsubscribe_if(&self, id: SubscriptionId) -> bool {
        let current = self.slot.load();
        let Some(subscriber) = &*current else {
            return false;
        };
        if subscriber.id != id.0 {
            return false;
        }
        let prev = self.slot.compare_and_swap(&current, None);
        matches!(&*prev, Some(s) if s.id == id.0)
    }

    pub fn has_subscriber(&self) -> bool {
        self.slot.load().is_some()
    }

    /// Hands `payload` to the current subscriber. Never waits for the
    /// handler; when the subscriber already has `backlog` calls queued the
    /// payload is discarded.
    pub fn publish(&self, payload: T) -> Publish {
        let Some(subscriber) = self.slot.load_full() else {
            return Publish::NoSubscriber;
        };
        if !self.context.queues_from_here() {
            (subscriber.callback)(payload);
            return Publish::Posted;
        }
        if self.pending.fetch_add(1, Ordering::AcqRel) >= self.backlog {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Publish::Dropped;
        }
        let pending = Pending(self.pending.clone());
        self.context.run(Box::new(move || {
            let _pending = pending;
            (subscriber.callback)(payload);
        }));
        Publish::Posted
    }

    pub fn context(&self) -> &DeliveryContext {
        &self.context
    }
}

// ----------------------------------------------------------------------------
// Debug lines
// ----------------------------------------------------------------------------

pub const DEBUG_CONNECTED: &str = "debug channel connected";

/// Debug text channel. Lines are prefixed with local wall-clock time.
pub struct DebugChannel {
    channel: Channel<String>,
}

impl DebugChannel {
    pub fn new(context: DeliveryContext) -> Self {
        Self {
            channel: Channel::new("debug", context),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let id = self.channel.subscribe(handler);
        self.log(DEBUG_CONNECTED);
        id
    }

    pub fn unsubscribe(&self) {
        self.channel.unsubscribe();
    }

    pub fn has_subscriber(&self) -> bool {
        self.channel.has_subscriber()
    }

    /// Best-effort: dropped when nobody is listening.
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::debug!("{}", message);
        if self.channel.has_subscriber()
            && self.channel.publish(format_debug_line(message)) == Publish::Dropped
        {
            log::trace!("debug channel: backlog full, line dropped");
        }
    }
}

pub fn format_debug_line(message: &str) -> String {
    format!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), message)
}

// ----------------------------------------------------------------------------
// EventDelivery: both channels
// ----------------------------------------------------------------------------

/// The frame channel and the debug channel, sharing one delivery context.
pub struct EventDelivery {
    frames: Channel<EncodedImage>,
    debug: DebugChannel,
}

impl EventDelivery {
    pub fn new(context: DeliveryContext) -> Self {
        Self {
            frames: Channel::new("frame", context.clone()).with_backlog(FRAME_BACKLOG),
            debug: DebugChannel::new(context),
        }
    }

    pub fn inline() -> Self {
        Self::new(DeliveryContext::Inline)
    }

    pub fn frames(&self) -> &Channel<EncodedImage> {
        &self.frames
    }

    pub fn debug(&self) -> &DebugChannel {
        &self.debug
    }

    /// Waits for queued deliveries when running on a dedicated thread.
    pub fn flush(&self) {
        if let DeliveryContext::Dedicated(thread) = self.frames.context() {
            thread.flush();
        }
    }
}
