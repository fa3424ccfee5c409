//! Resource - Loadable unit with a state machine
//!
//! Every resource cycles through
//! `Unloaded -> Pending -> Loading -> Loaded -> Pending -> Unloading -> Unloaded`.
//! `Pending` marks "an operation was requested but has not started"; the
//! operation re-checks it before doing any work, which is what makes a
//! request soft-cancellable.
//!
//! The state cell also records the operation currently queued or executing
//! for the resource, so a resource never has more than one of them.

use std::any::type_name;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::LoadResult;
use crate::operation::{Completion, OperationKind, ResidentLedger};
use crate::source::LoadContext;

/// Stable identity of a resource (path or content hash)
pub type ResourceKey = Arc<str>;

/// Lifecycle state of a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceState {
    /// Not resident; the next touch loads it
    Unloaded = 0,
    /// A load or unload was requested and has not started yet
    Pending = 1,
    /// A worker is running the resource's load
    Loading = 2,
    /// Resident and counted against the budget
    Loaded = 3,
    /// A worker is running the resource's unload
    Unloading = 4,
}

impl From<u8> for ResourceState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Pending,
            2 => Self::Loading,
            3 => Self::Loaded,
            4 => Self::Unloading,
            _ => Self::Unloaded,
        }
    }
}

/// A loadable unit of engine data (texture, model, sound bank...)
///
/// Implementations keep their payload behind interior mutability: `load`
/// runs on a streaming worker while the owning thread may read the value
/// through a handle.
pub trait Resource: Send + Sync + 'static {
    /// Bring the payload into memory. An error leaves the resource
    /// `Unloaded` so a later touch retries.
    fn load(&self, ctx: &LoadContext<'_>) -> LoadResult<()>;

    /// Release the payload
    fn unload(&self);

    /// Bytes occupied while loaded
    fn size(&self) -> u64;

    /// Whether the eviction pass may unload this resource
    fn is_unloadable(&self) -> bool {
        true
    }
}

/// How a resource's lifetime is tracked, fixed at construction
#[derive(Debug)]
pub enum Tracking {
    /// Owned by a manager; recency lives in its generation table
    Managed,
    /// Owned by its handles; loaded and unloaded by client code
    Standalone { refs: AtomicUsize },
}

/// Outcome of asking a resource to start an operation
pub(crate) enum Request {
    /// New operation must be dispatched; its completion signal
    Dispatch(Arc<Completion>),
    /// The operation already queued for this resource was re-armed
    Rearmed(Arc<Completion>),
    /// The resource is not in the state the operation starts from
    Rejected,
}

struct InFlight {
    kind: OperationKind,
    completion: Arc<Completion>,
}

struct StateCell {
    state: ResourceState,
    requested: Option<OperationKind>,
    in_flight: Option<InFlight>,
    /// Bytes booked as pending release while an unload is requested or running
    reserved: u64,
}

impl StateCell {
    fn reserve(&mut self, bytes: u64, ledger: Option<&ResidentLedger>) {
        if let Some(ledger) = ledger {
            ledger.reserve(bytes);
            self.reserved += bytes;
        }
    }

    fn release_reservation(&mut self, ledger: Option<&ResidentLedger>) {
        let bytes = std::mem::take(&mut self.reserved);
        if let Some(ledger) = ledger {
            ledger.unreserve(bytes);
        }
    }
}

/// State, size and bookkeeping shared by every resource
pub struct ResourceCore {
    key: ResourceKey,
    tracking: Tracking,
    cell: Mutex<StateCell>,
    size: AtomicU64,
    pinned: AtomicBool,
}

impl ResourceCore {
    fn new(key: ResourceKey, tracking: Tracking) -> Self {
        Self {
            key,
            tracking,
            cell: Mutex::new(StateCell {
                state: ResourceState::Unloaded,
                requested: None,
                in_flight: None,
                reserved: 0,
            }),
            size: AtomicU64::new(0),
            pinned: AtomicBool::new(false),
        }
    }

    /// Hash string identifying the resource
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn tracking(&self) -> &Tracking {
        &self.tracking
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.tracking, Tracking::Managed)
    }

    /// Current state
    pub fn state(&self) -> ResourceState {
        self.cell.lock().state
    }

    /// Bytes counted against the budget (zero unless `Loaded`)
    pub fn resident_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Whether an operation is queued or executing
    pub fn has_operation(&self) -> bool {
        self.cell.lock().in_flight.is_some()
    }

    /// Pinned resources are skipped by eviction
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Release);
    }

    /// Handle count of a standalone resource
    pub fn ref_count(&self) -> Option<usize> {
        match &self.tracking {
            Tracking::Standalone { refs } => Some(refs.load(Ordering::Acquire)),
            Tracking::Managed => None,
        }
    }

    pub(crate) fn add_ref(&self) -> usize {
        match &self.tracking {
            Tracking::Standalone { refs } => refs.fetch_add(1, Ordering::AcqRel) + 1,
            Tracking::Managed => {
                debug_assert!(false, "reference counting on managed resource '{}'", self.key);
                0
            }
        }
    }

    pub(crate) fn release_ref(&self) -> usize {
        match &self.tracking {
            Tracking::Standalone { refs } => refs.fetch_sub(1, Ordering::AcqRel).saturating_sub(1),
            Tracking::Managed => {
                debug_assert!(false, "reference counting on managed resource '{}'", self.key);
                0
            }
        }
    }

    /// Move `origin -> Pending` for the given operation.
    ///
    /// When a previously cancelled operation of the same kind is still
    /// queued it is re-armed instead of queuing a second one. An accepted
    /// unload books the resident size as pending release in `ledger`.
    pub(crate) fn request(&self, kind: OperationKind, ledger: Option<&ResidentLedger>) -> Request {
        let mut cell = self.cell.lock();
        if cell.state != kind.origin() {
            return Request::Rejected;
        }

        let queued = match &cell.in_flight {
            // The queued operation would no-op on this request; let it drain first.
            Some(in_flight) if in_flight.kind != kind => return Request::Rejected,
            Some(in_flight) => Some(in_flight.completion.clone()),
            None => None,
        };
        let request = match queued {
            Some(completion) => Request::Rearmed(completion),
            None => {
                let completion = Completion::new();
                cell.in_flight = Some(InFlight {
                    kind,
                    completion: completion.clone(),
                });
                Request::Dispatch(completion)
            }
        };

        cell.state = ResourceState::Pending;
        cell.requested = Some(kind);
        if kind == OperationKind::Unload {
            cell.reserve(self.size.load(Ordering::Acquire), ledger);
        }
        request
    }

    /// Soft-cancel a requested operation that has not started.
    pub(crate) fn neutralize(&self, kind: OperationKind, ledger: Option<&ResidentLedger>) -> bool {
        let mut cell = self.cell.lock();
        if cell.state == ResourceState::Pending && cell.requested == Some(kind) {
            cell.state = kind.origin();
            cell.requested = None;
            cell.release_reservation(ledger);
            true
        } else {
            false
        }
    }

    /// Undo a request whose operation could not be dispatched.
    pub(crate) fn abandon(&self, kind: OperationKind, ledger: Option<&ResidentLedger>) {
        let completion = {
            let mut cell = self.cell.lock();
            if cell.state == ResourceState::Pending && cell.requested == Some(kind) {
                cell.state = kind.origin();
                cell.requested = None;
            }
            cell.release_reservation(ledger);
            cell.in_flight.take().map(|f| f.completion)
        };
        if let Some(completion) = completion {
            completion.finish();
        }
    }

    /// Worker-side re-check: `Pending -> Loading/Unloading` if this
    /// operation is still the requested one. Otherwise the operation retires.
    pub(crate) fn begin(&self, kind: OperationKind, ledger: Option<&ResidentLedger>) -> bool {
        let completion = {
            let mut cell = self.cell.lock();
            if cell.state == ResourceState::Pending && cell.requested == Some(kind) {
                cell.state = kind.active();
                cell.requested = None;
                return true;
            }
            cell.release_reservation(ledger);
            cell.in_flight.take().map(|f| f.completion)
        };
        if let Some(completion) = completion {
            completion.finish();
        }
        false
    }

    /// Finish a started operation, settling state, size and the ledger together.
    pub(crate) fn settle(&self, state: ResourceState, size: u64, ledger: Option<&ResidentLedger>) -> u64 {
        let (previous, completion) = {
            let mut cell = self.cell.lock();
            let previous = self.size.swap(size, Ordering::AcqRel);
            if let Some(ledger) = ledger {
                ledger.replace(previous, size);
            }
            cell.release_reservation(ledger);
            cell.state = state;
            (previous, cell.in_flight.take().map(|f| f.completion))
        };
        if let Some(completion) = completion {
            completion.finish();
        }
        previous
    }

    /// Completion signal of the queued or executing operation
    pub(crate) fn pending_completion(&self) -> Option<Arc<Completion>> {
        self.cell.lock().in_flight.as_ref().map(|f| f.completion.clone())
    }
}

impl std::fmt::Debug for ResourceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCore")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("size", &self.resident_size())
            .field("managed", &self.is_managed())
            .finish()
    }
}

/// A resource value together with its core bookkeeping
pub struct ResourceCell<T: Resource> {
    core: ResourceCore,
    resource: T,
}

impl<T: Resource> ResourceCell<T> {
    pub(crate) fn managed(key: ResourceKey, resource: T) -> Self {
        Self {
            core: ResourceCore::new(key, Tracking::Managed),
            resource,
        }
    }

    pub(crate) fn standalone(key: ResourceKey, resource: T) -> Self {
        Self {
            core: ResourceCore::new(
                key,
                Tracking::Standalone {
                    refs: AtomicUsize::new(0),
                },
            ),
            resource,
        }
    }

    pub fn core(&self) -> &ResourceCore {
        &self.core
    }

    /// The wrapped resource, without touching it
    pub fn resource(&self) -> &T {
        &self.resource
    }
}

/// Type-erased view used by operations, the registry and the generation table
pub(crate) trait Streamable: Send + Sync + 'static {
    fn core(&self) -> &ResourceCore;
    fn load_payload(&self, ctx: &LoadContext<'_>) -> LoadResult<()>;
    fn unload_payload(&self);
    fn payload_size(&self) -> u64;
    fn unloadable(&self) -> bool;
    fn type_name(&self) -> &'static str;
}

/// Whether two nodes are the same resource, whatever their keys say
pub(crate) fn same_node(a: &Arc<dyn Streamable>, b: &Arc<dyn Streamable>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl<T: Resource> Streamable for ResourceCell<T> {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn load_payload(&self, ctx: &LoadContext<'_>) -> LoadResult<()> {
        self.resource.load(ctx)
    }

    fn unload_payload(&self) {
        self.resource.unload()
    }

    fn payload_size(&self) -> u64 {
        self.resource.size()
    }

    fn unloadable(&self) -> bool {
        !self.core.is_pinned() && self.resource.is_unloadable()
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> ResourceCore {
        ResourceCore::new("tex.png".into(), Tracking::Managed)
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(ResourceState::from(3), ResourceState::Loaded);
        assert_eq!(ResourceState::from(200), ResourceState::Unloaded);
    }

    #[test]
    fn test_request_only_from_origin() {
        let core = core();
        assert!(matches!(core.request(OperationKind::Unload, None), Request::Rejected));
        assert!(matches!(core.request(OperationKind::Load, None), Request::Dispatch(_)));
        assert_eq!(core.state(), ResourceState::Pending);

        // Second request before processing does not dispatch again
        assert!(matches!(core.request(OperationKind::Load, None), Request::Rejected));
        assert!(core.has_operation());
    }

    #[test]
    fn test_begin_and_settle() {
        let core = core();
        let ledger = ResidentLedger::default();
        core.request(OperationKind::Load, None);

        assert!(core.begin(OperationKind::Load, None));
        assert_eq!(core.state(), ResourceState::Loading);

        core.settle(ResourceState::Loaded, 400, Some(&ledger));
        assert_eq!(core.state(), ResourceState::Loaded);
        assert_eq!(core.resident_size(), 400);
        assert_eq!(ledger.resident(), 400);
        assert!(!core.has_operation());
    }

    #[test]
    fn test_neutralized_operation_is_skipped() {
        let core = core();
        core.request(OperationKind::Load, None);
        assert!(core.neutralize(OperationKind::Load, None));
        assert_eq!(core.state(), ResourceState::Unloaded);

        // Still queued: the worker re-check retires it
        assert!(core.has_operation());
        assert!(!core.begin(OperationKind::Load, None));
        assert!(!core.has_operation());
        assert_eq!(core.state(), ResourceState::Unloaded);
    }

    #[test]
    fn test_rearm_reuses_queued_operation() {
        let core = core();
        let first = match core.request(OperationKind::Load, None) {
            Request::Dispatch(c) => c,
            _ => panic!("expected dispatch"),
        };
        core.neutralize(OperationKind::Load, None);

        let second = match core.request(OperationKind::Load, None) {
            Request::Rearmed(c) => c,
            _ => panic!("expected re-arm"),
        };
        assert!(Arc::ptr_eq(&first, &second));
        assert!(core.begin(OperationKind::Load, None));
    }

    #[test]
    fn test_unload_request_reserves_until_retired() {
        let core = core();
        let ledger = ResidentLedger::default();
        core.request(OperationKind::Load, None);
        core.begin(OperationKind::Load, None);
        core.settle(ResourceState::Loaded, 400, Some(&ledger));

        core.request(OperationKind::Unload, Some(&ledger));
        assert_eq!(ledger.pending_release(), 400);
        assert_eq!(ledger.projected(), 0);

        // Cancelled: the bytes stay resident and are no longer pending
        assert!(core.neutralize(OperationKind::Unload, Some(&ledger)));
        assert_eq!(ledger.pending_release(), 0);
        assert_eq!(ledger.projected(), 400);

        // Re-armed: booked again, then released when the unload settles
        assert!(matches!(core.request(OperationKind::Unload, Some(&ledger)), Request::Rearmed(_)));
        assert_eq!(ledger.pending_release(), 400);
        assert!(core.begin(OperationKind::Unload, Some(&ledger)));
        assert_eq!(ledger.pending_release(), 400);
        core.settle(ResourceState::Unloaded, 0, Some(&ledger));
        assert_eq!(ledger.pending_release(), 0);
        assert_eq!(ledger.resident(), 0);
    }

    #[test]
    fn test_withdrawn_unload_drops_reservation() {
        let core = core();
        let ledger = ResidentLedger::default();
        core.request(OperationKind::Load, None);
        core.begin(OperationKind::Load, None);
        core.settle(ResourceState::Loaded, 250, Some(&ledger));

        core.request(OperationKind::Unload, Some(&ledger));
        core.abandon(OperationKind::Unload, Some(&ledger));
        assert_eq!(ledger.pending_release(), 0);
        assert_eq!(core.state(), ResourceState::Loaded);
        assert!(!core.has_operation());
    }

    #[test]
    fn test_standalone_ref_counting() {
        let core = ResourceCore::new("a".into(), Tracking::Standalone { refs: AtomicUsize::new(0) });
        assert_eq!(core.add_ref(), 1);
        assert_eq!(core.add_ref(), 2);
        assert_eq!(core.release_ref(), 1);
        assert_eq!(core.ref_count(), Some(1));
        assert!(!core.is_managed());
    }
}
