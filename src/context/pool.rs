//! Client-scoped recycling of [`Context`] instances.

use std::sync::{Mutex, PoisonError};

use tracing::trace;

use super::{Context, ContextKind};

/// Default number of idle contexts kept for reuse.
pub const DEFAULT_CONTEXT_POOL_CAPACITY: usize = 64;

/// Pool of cleared contexts reused across requests.
///
/// An instance is only recycled when the caller hands back the last live handle,
/// so nobody can observe a context after it has been reset for another request.
#[derive(Debug)]
pub struct ContextPool {
    kind: ContextKind,
    capacity: usize,
    idle: Mutex<Vec<Context>>,
}

impl ContextPool {
    /// Creates a pool producing contexts of `kind`, keeping at most `capacity` idle.
    #[must_use]
    pub fn new(kind: ContextKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Returns the kind of context this pool hands out.
    #[must_use]
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Takes an idle context or creates a fresh one.
    #[must_use]
    pub fn acquire(&self) -> Context {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Context::new(self.kind))
    }

    /// Returns a context to the pool.
    ///
    /// Contexts still referenced elsewhere, of another kind, or beyond capacity
    /// are simply dropped. Returns `true` when the instance was recycled.
    pub fn release(&self, ctx: Context) -> bool {
        if ctx.handle_count() != 1 || ctx.kind() != self.kind {
            return false;
        }
        ctx.clear();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() >= self.capacity {
            return false;
        }
        idle.push(ctx);
        trace!(idle = idle.len(), "context recycled");
        true
    }

    /// Number of idle contexts currently held.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(ContextKind::default(), DEFAULT_CONTEXT_POOL_CAPACITY)
    }
}
