//! Resource-manager seam.
//!
//! The transport does not account for memory or connection budgets itself; an
//! external resource manager hands out per-connection scopes. The transport's
//! obligation is narrow: `set_peer` before any stream exists, and `done`
//! exactly once per connection on every exit path, including failed dials.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use multiaddr::Multiaddr;

use crate::error::ResourceLimit;
use crate::identity::PeerId;

/// Direction of a connection, as seen from the local peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

pub trait ResourceManager: Send + Sync {
    fn open_connection(
        &self,
        direction: Direction,
        remote: &Multiaddr,
    ) -> Result<Arc<dyn ConnectionScope>, ResourceLimit>;
}

pub trait ConnectionScope: Send + Sync {
    fn set_peer(&self, peer: &PeerId) -> Result<(), ResourceLimit>;
    fn done(&self);
}

/// Resource manager that admits everything and accounts for nothing.
#[derive(Debug, Default)]
pub struct NullResourceManager;

impl ResourceManager for NullResourceManager {
    fn open_connection(
        &self,
        _direction: Direction,
        _remote: &Multiaddr,
    ) -> Result<Arc<dyn ConnectionScope>, ResourceLimit> {
        Ok(Arc::new(NullScope))
    }
}

struct NullScope;

impl ConnectionScope for NullScope {
    fn set_peer(&self, _peer: &PeerId) -> Result<(), ResourceLimit> {
        Ok(())
    }

    fn done(&self) {}
}

/// Wraps a scope so `done` is delivered at most once however many teardown
/// paths race to it. Clones share the same once-flag.
#[derive(Clone)]
pub(crate) struct ScopeHandle {
    inner: Arc<ScopeHandleInner>,
}

struct ScopeHandleInner {
    scope: Arc<dyn ConnectionScope>,
    done: AtomicBool,
}

impl ScopeHandle {
    pub(crate) fn new(scope: Arc<dyn ConnectionScope>) -> Self {
        Self {
            inner: Arc::new(ScopeHandleInner {
                scope,
                done: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn set_peer(&self, peer: &PeerId) -> Result<(), ResourceLimit> {
        self.inner.scope.set_peer(peer)
    }

    pub(crate) fn done(&self) {
        if !self.inner.done.swap(true, Ordering::AcqRel) {
            self.inner.scope.done();
        }
    }
}

impl Drop for ScopeHandleInner {
    fn drop(&mut self) {
        // A cancelled dial or accept drops its future without reaching any
        // explicit release path; the last handle still frees the scope.
        if !self.done.swap(true, Ordering::AcqRel) {
            self.scope.done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingScope {
        done_calls: AtomicUsize,
    }

    impl ConnectionScope for CountingScope {
        fn set_peer(&self, _peer: &PeerId) -> Result<(), ResourceLimit> {
            Ok(())
        }

        fn done(&self) {
            self.done_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn done_is_delivered_exactly_once() {
        let scope = Arc::new(CountingScope {
            done_calls: AtomicUsize::new(0),
        });
        let handle = ScopeHandle::new(scope.clone());
        let clone = handle.clone();
        handle.done();
        handle.done();
        clone.done();
        drop(handle);
        drop(clone);
        assert_eq!(scope.done_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_last_handle_releases_the_scope() {
        let scope = Arc::new(CountingScope {
            done_calls: AtomicUsize::new(0),
        });
        let handle = ScopeHandle::new(scope.clone());
        let clone = handle.clone();
        drop(handle);
        assert_eq!(scope.done_calls.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(scope.done_calls.load(Ordering::SeqCst), 1);
    }
}
