use std::collections::HashMap;
use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

/// Process-wide registry of root trackers, keyed by tracker id.
///
/// Queues sharing a parent id share one root tracker; the first creation
/// fixes its limits.
static ROOT_TRACKERS: OnceLock<Mutex<HashMap<String, Arc<MemTracker>>>> = OnceLock::new();

/// Hierarchical memory accounting.
///
/// A tracker counts bytes consumed against a soft and a hard limit.
/// Consuming or releasing on a child tracker also updates every ancestor, so
/// a per-queue tracker parented to a process-wide tracker yields two-tier
/// accounting for free.
///
/// Soft limits never block consumption; callers query
/// [`any_soft_limit_exceeded`](MemTracker::any_soft_limit_exceeded) and
/// [`spare_soft_capacity`](MemTracker::spare_soft_capacity) to decide when
/// to reclaim. Hard limits gate admission through
/// [`would_violate_hard`](MemTracker::would_violate_hard).
///
/// Updates are atomic per tracker and lock-free; a multi-level update is not
/// one transaction, so concurrent readers may observe a child updated before
/// its parent.
pub struct MemTracker {
    id: String,
    soft_limit: u64,
    hard_limit: u64,
    consumption: AtomicU64,
    parent: Option<Arc<MemTracker>>,
}

impl MemTracker {
    /// Create a tracker, optionally parented to another tracker.
    pub fn create(
        soft_limit: u64,
        hard_limit: u64,
        id: impl Into<String>,
        parent: Option<Arc<MemTracker>>,
    ) -> Arc<MemTracker> {
        Arc::new(MemTracker {
            id: id.into(),
            soft_limit,
            hard_limit,
            consumption: AtomicU64::new(0),
            parent,
        })
    }

    /// Look up the root tracker registered under `id`, creating it with the
    /// given limits if absent. The limits of an already registered tracker
    /// win over the arguments.
    pub fn find_or_create_root(soft_limit: u64, hard_limit: u64, id: &str) -> Arc<MemTracker> {
        let registry = ROOT_TRACKERS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut roots = registry.lock().unwrap_or_else(PoisonError::into_inner);
        roots
            .entry(id.to_string())
            .or_insert_with(|| MemTracker::create(soft_limit, hard_limit, id, None))
            .clone()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn soft_limit(&self) -> u64 {
        self.soft_limit
    }

    pub fn hard_limit(&self) -> u64 {
        self.hard_limit
    }

    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }

    /// Bytes currently accounted to this tracker, including everything
    /// accounted to its children.
    pub fn consumption(&self) -> u64 {
        self.consumption.load(Ordering::Relaxed)
    }

    /// Account `bytes` to this tracker and all its ancestors.
    pub fn consume(&self, bytes: u64) {
        let mut cur = Some(self);
        while let Some(tracker) = cur {
            tracker.consumption.fetch_add(bytes, Ordering::Relaxed);
            cur = tracker.parent.as_deref();
        }
    }

    /// Return `bytes` to this tracker and all its ancestors.
    pub fn release(&self, bytes: u64) {
        let mut cur = Some(self);
        while let Some(tracker) = cur {
            let prev = tracker.consumption.fetch_sub(bytes, Ordering::Relaxed);
            debug_assert!(
                prev >= bytes,
                "tracker {} released {} bytes with only {} consumed",
                tracker.id,
                bytes,
                prev
            );
            cur = tracker.parent.as_deref();
        }
    }

    /// Whether this tracker or any ancestor is over its soft limit.
    pub fn any_soft_limit_exceeded(&self) -> bool {
        let mut cur = Some(self);
        while let Some(tracker) = cur {
            if tracker.consumption() > tracker.soft_limit {
                return true;
            }
            cur = tracker.parent.as_deref();
        }
        false
    }

    /// The smallest soft-limit headroom along the chain to the root,
    /// negative when some tracker is already over its soft limit.
    pub fn spare_soft_capacity(&self) -> i64 {
        let mut spare = i64::MAX;
        let mut cur = Some(self);
        while let Some(tracker) = cur {
            spare = spare.min(tracker.soft_limit as i64 - tracker.consumption() as i64);
            cur = tracker.parent.as_deref();
        }
        spare
    }

    /// Whether consuming `bytes` would push this tracker or any ancestor
    /// past its hard limit.
    pub fn would_violate_hard(&self, bytes: u64) -> bool {
        let mut cur = Some(self);
        while let Some(tracker) = cur {
            if tracker.consumption() + bytes > tracker.hard_limit {
                return true;
            }
            cur = tracker.parent.as_deref();
        }
        false
    }
}

impl Display for MemTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{} (hard {})",
            self.id,
            self.consumption(),
            self.soft_limit,
            self.hard_limit
        )
    }
}
