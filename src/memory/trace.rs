/// Slow-path scopes reported to an [`AllocTrace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceScope {
    Refill,
    Cleanup,
}

/// Side-channel notifications for an allocation recorder.
///
/// Every method has an empty default, so a recorder only overrides what it
/// stores.  Callbacks run inline on the allocating thread, some of them with
/// the heap lock held: they must not allocate from the heap they observe.
pub trait AllocTrace: Send + Sync {
    fn scope_enter(&self, _scope: TraceScope) {}

    fn scope_exit(&self, _scope: TraceScope) {}

    /// A successful allocation.  `bucket` is `None` for fallback-heap blocks.
    fn on_alloc(&self, _addr: usize, _size: usize, _bucket: Option<usize>, _align: usize) {}

    fn on_free(&self, _addr: usize, _size: usize) {}

    fn on_page_map(&self, _addr: usize, _size: usize) {}

    fn on_page_unmap(&self, _addr: usize, _size: usize) {}
}

/// Calls `scope_exit` when dropped, so early returns still close the scope.
pub(crate) struct ScopeGuard<'a> {
    trace: Option<&'a dyn AllocTrace>,
    scope: TraceScope,
}

impl<'a> ScopeGuard<'a> {
    pub(crate) fn enter(trace: Option<&'a dyn AllocTrace>, scope: TraceScope) -> Self {
        if let Some(t) = trace {
            t.scope_enter(scope);
        }
        Self { trace, scope }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(t) = self.trace {
            t.scope_exit(self.scope);
        }
    }
}
