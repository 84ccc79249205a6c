use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::sample::Sample;
use crate::section::Section;

/// Instantaneous speed, converted to whole km/h, plus the raw sample.
pub trait SpeedListener: Send + Sync {
    fn on_speed_changed(&self, speed_kmh: i32, sample: &Sample);
}

/// Moving (`true`) / stationary (`false`) transitions.
pub trait ActivityListener: Send + Sync {
    fn on_activity_changed(&self, active: bool);
}

/// Tracking running (`true`) / stopped (`false`) transitions.
pub trait TrackingStateListener: Send + Sync {
    fn on_tracking_state_changed(&self, running: bool);
}

/// A movement section was closed.
pub trait SectionListener: Send + Sync {
    fn on_section_changed(&self, section: &Section);
}

impl<F> SpeedListener for F
where
    F: Fn(i32, &Sample) + Send + Sync,
{
    fn on_speed_changed(&self, speed_kmh: i32, sample: &Sample) {
        self(speed_kmh, sample)
    }
}

impl<F> ActivityListener for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_activity_changed(&self, active: bool) {
        self(active)
    }
}

impl<F> TrackingStateListener for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_tracking_state_changed(&self, running: bool) {
        self(running)
    }
}

impl<F> SectionListener for F
where
    F: Fn(&Section) + Send + Sync,
{
    fn on_section_changed(&self, section: &Section) {
        self(section)
    }
}

/// Handle returned by [`ListenerSet::register`], usable to unsubscribe later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

struct Entry<L: ?Sized> {
    id: u64,
    listener: Arc<L>,
}

/// Listeners keyed by `Arc` identity. Registering the same `Arc` twice returns
/// the first handle. `notify` calls a snapshot with no lock held.
pub struct ListenerSet<L: ?Sized> {
    entries: RwLock<Vec<Entry<L>>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    // compare data addresses only; vtable pointers are not unique
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry<L>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry<L>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, listener: Arc<L>) -> Subscription {
        let mut entries = self.write();
        if let Some(existing) = entries
            .iter()
            .find(|entry| same_listener(&entry.listener, &listener))
        {
            return Subscription(existing.id);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(Entry { id, listener });
        Subscription(id)
    }

    /// Returns whether the listener was registered.
    pub fn unregister(&self, listener: &Arc<L>) -> bool {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|entry| !same_listener(&entry.listener, listener));
        entries.len() != before
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != subscription.0);
        entries.len() != before
    }

    pub fn contains(&self, listener: &Arc<L>) -> bool {
        self.read()
            .iter()
            .any(|entry| same_listener(&entry.listener, listener))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.read()
            .iter()
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }

    pub fn notify<F>(&self, mut call: F)
    where
        F: FnMut(&L),
    {
        for listener in self.snapshot() {
            call(&listener);
        }
    }
}
