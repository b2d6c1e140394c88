//! Kernel FIB synchronization.
//!
//! The route-install collaborator sits behind [`FibClient`]; the
//! [`RouteInstaller`] reconciles the desired route set against what the FIB
//! reports, so repeated syncs are idempotent and nothing tracks deltas.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use meshpath_core::types::MacAddr;

/// The complete set of mesh routes the kernel should hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    /// Next hop for the default route, if a gateway is selected.
    pub default_via: Option<MacAddr>,
    /// Per-destination next hops.
    pub next_hops: BTreeMap<MacAddr, MacAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum FibError {
    #[error("route install failed: {0}")]
    Install(String),

    #[error("route dump failed: {0}")]
    Dump(String),
}

/// Interface to the kernel forwarding table.
///
/// All operations must be safe to repeat. Implementations must not block;
/// blocking backends belong on a worker with results posted back.
pub trait FibClient: Send {
    fn dump(&self) -> impl Future<Output = Result<RouteSet, FibError>> + Send;
    fn set_default_route(&self, via: MacAddr) -> impl Future<Output = Result<(), FibError>> + Send;
    fn clear_default_route(&self) -> impl Future<Output = Result<(), FibError>> + Send;
    fn set_route(
        &self,
        dst: MacAddr,
        via: MacAddr,
    ) -> impl Future<Output = Result<(), FibError>> + Send;
    fn remove_route(&self, dst: MacAddr) -> impl Future<Output = Result<(), FibError>> + Send;
}

/// Applies desired route sets to a [`FibClient`] by diffing against the
/// observed state.
pub struct RouteInstaller<F: FibClient> {
    fib: F,
}

impl<F: FibClient> RouteInstaller<F> {
    pub fn new(fib: F) -> Self {
        Self { fib }
    }

    /// Reconcile the FIB with `desired`.
    ///
    /// Only differences are pushed; a failed call surfaces the error so the
    /// caller can schedule a retry, with the FIB left partially updated but
    /// convergent on the next sync.
    pub async fn sync(&mut self, desired: &RouteSet) -> Result<(), FibError> {
        let observed = self.fib.dump().await?;

        for dst in observed.next_hops.keys() {
            if !desired.next_hops.contains_key(dst) {
                self.fib.remove_route(*dst).await?;
            }
        }
        for (dst, via) in &desired.next_hops {
            if observed.next_hops.get(dst) != Some(via) {
                self.fib.set_route(*dst, *via).await?;
            }
        }

        match (observed.default_via, desired.default_via) {
            (Some(_), None) => self.fib.clear_default_route().await?,
            (observed_via, Some(via)) if observed_via != Some(via) => {
                self.fib.set_default_route(via).await?;
            }
            _ => {}
        }

        Ok(())
    }
}

/// A FIB operation, recorded by [`MemoryFib`] for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibOp {
    SetDefault(MacAddr),
    ClearDefault,
    SetRoute(MacAddr, MacAddr),
    RemoveRoute(MacAddr),
}

/// In-process FIB holding the route set in memory.
///
/// Default wiring for the daemon when no kernel backend is injected, and
/// the test double for the installer. Cloning shares the underlying table.
#[derive(Debug, Clone, Default)]
pub struct MemoryFib {
    inner: Arc<Mutex<MemoryFibInner>>,
}

#[derive(Debug, Default)]
struct MemoryFibInner {
    routes: RouteSet,
    ops: Vec<FibOp>,
}

impl MemoryFib {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current route table contents.
    #[must_use]
    pub fn routes(&self) -> RouteSet {
        self.inner.lock().expect("fib lock poisoned").routes.clone()
    }

    /// Drain the recorded operation log.
    #[must_use]
    pub fn take_ops(&self) -> Vec<FibOp> {
        std::mem::take(&mut self.inner.lock().expect("fib lock poisoned").ops)
    }
}

impl FibClient for MemoryFib {
    async fn dump(&self) -> Result<RouteSet, FibError> {
        Ok(self.routes())
    }

    async fn set_default_route(&self, via: MacAddr) -> Result<(), FibError> {
        let mut inner = self.inner.lock().expect("fib lock poisoned");
        inner.routes.default_via = Some(via);
        inner.ops.push(FibOp::SetDefault(via));
        Ok(())
    }

    async fn clear_default_route(&self) -> Result<(), FibError> {
        let mut inner = self.inner.lock().expect("fib lock poisoned");
        inner.routes.default_via = None;
        inner.ops.push(FibOp::ClearDefault);
        Ok(())
    }

    async fn set_route(&self, dst: MacAddr, via: MacAddr) -> Result<(), FibError> {
        let mut inner = self.inner.lock().expect("fib lock poisoned");
        inner.routes.next_hops.insert(dst, via);
        inner.ops.push(FibOp::SetRoute(dst, via));
        Ok(())
    }

    async fn remove_route(&self, dst: MacAddr) -> Result<(), FibError> {
        let mut inner = self.inner.lock().expect("fib lock poisoned");
        inner.routes.next_hops.remove(&dst);
        inner.ops.push(FibOp::RemoveRoute(dst));
        Ok(())
    }
}
