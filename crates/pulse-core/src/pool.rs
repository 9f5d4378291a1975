//! Generic object pool with intrusive free-list linkage.
//!
//! Operation state is recycled through a capped free list so steady-state
//! scheduling performs no heap allocation. The list is threaded through a
//! [`PoolLink`] embedded in the pooled type itself; the pool never allocates
//! bookkeeping nodes of its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Default number of instances a pool retains before discarding returns.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Intrusive free-list slot embedded in a pooled type.
///
/// While an instance sits in a pool, its link holds the next free instance;
/// while it is in flight, the link is empty.
pub struct PoolLink<T>(Mutex<Option<Arc<T>>>);

impl<T> PoolLink<T> {
    /// Create an unlinked slot.
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }

    fn take(&self) -> Option<Arc<T>> {
        self.0.lock().take()
    }

    fn set(&self, next: Option<Arc<T>>) {
        *self.0.lock() = next;
    }
}

impl<T> Default for PoolLink<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Types that can be recycled through a [`Pool`].
pub trait Poolable: Sized + Send + Sync {
    /// The intrusive link the pool threads its free list through.
    fn pool_link(&self) -> &PoolLink<Self>;
}

/// Capped free list of previously-used instances for one state type.
///
/// Acquire and release are safe under concurrent multi-thread access. The
/// cap bounds retained memory; releasing into a full pool reports failure
/// and the caller simply drops the instance.
pub struct Pool<T: Poolable> {
    head: Mutex<Option<Arc<T>>>,
    len: AtomicUsize,
    capacity: usize,
    gauge: Arc<AtomicUsize>,
}

impl<T: Poolable> Pool<T> {
    /// Create a pool registered with the process-wide [`PoolRegistry`].
    pub fn new(capacity: usize) -> Self {
        Self::with_registry(capacity, global_registry())
    }

    /// Create a pool reporting its size to the given registry.
    pub fn with_registry(capacity: usize, registry: &PoolRegistry) -> Self {
        Self {
            head: Mutex::new(None),
            len: AtomicUsize::new(0),
            capacity,
            gauge: registry.gauge(std::any::type_name::<T>()),
        }
    }

    /// Pop a previously-released instance, or `None` if the free list is
    /// empty (the caller constructs a fresh one).
    pub fn try_acquire(&self) -> Option<Arc<T>> {
        let item = {
            let mut head = self.head.lock();
            let item = head.take()?;
            *head = item.pool_link().take();
            item
        };
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.gauge.fetch_sub(1, Ordering::Relaxed);
        Some(item)
    }

    /// Push an instance onto the free list. Returns `false` once the
    /// configured capacity is reached; the instance is then discarded by the
    /// caller (a memory-bound policy, not a fault).
    pub fn try_release(&self, item: Arc<T>) -> bool {
        let mut head = self.head.lock();
        if self.len.load(Ordering::Relaxed) >= self.capacity {
            return false;
        }
        item.pool_link().set(head.take());
        *head = Some(item);
        self.len.fetch_add(1, Ordering::Relaxed);
        self.gauge.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Number of instances currently retained.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the free list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of instances this pool retains.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Pooled-instance count for one state type, as reported by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStat {
    /// Type name of the pooled state.
    pub type_name: &'static str,
    /// Instances currently sitting in pools of that type.
    pub pooled: usize,
}

/// Registry of per-type pool gauges for instrumentation.
///
/// Mutation is append-only at pool construction; reads are safe from any
/// thread at steady state. Tests construct isolated registries instead of
/// sharing the process-wide one.
pub struct PoolRegistry {
    gauges: DashMap<&'static str, Arc<AtomicUsize>>,
}

impl PoolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            gauges: DashMap::new(),
        }
    }

    fn gauge(&self, type_name: &'static str) -> Arc<AtomicUsize> {
        self.gauges
            .entry(type_name)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    /// Current pooled counts per state type.
    pub fn snapshot(&self) -> Vec<PoolStat> {
        self.gauges
            .iter()
            .map(|entry| PoolStat {
                type_name: entry.key(),
                pooled: entry.value().load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry pools report to by default.
pub fn global_registry() -> &'static PoolRegistry {
    static REGISTRY: Lazy<PoolRegistry> = Lazy::new(PoolRegistry::new);
    &REGISTRY
}
