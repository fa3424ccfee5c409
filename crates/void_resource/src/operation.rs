//! Resource operations - the unit of work the streaming pipeline runs
//!
//! An operation is an owned value: created when a load or unload is
//! requested, moved into the processor's queue, processed by a worker,
//! moved into the finished queue and dropped by the owning thread's drain.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::LoadError;
use crate::resource::{ResourceKey, ResourceState, Streamable};
use crate::source::{LoadContext, ResourceSource};
use crate::STREAM_TARGET;

/// What an operation drives a resource towards
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Load,
    Unload,
}

impl OperationKind {
    /// State a resource must be in for the operation to be requested
    pub fn origin(self) -> ResourceState {
        match self {
            Self::Load => ResourceState::Unloaded,
            Self::Unload => ResourceState::Loaded,
        }
    }

    /// State while the operation executes
    pub fn active(self) -> ResourceState {
        match self {
            Self::Load => ResourceState::Loading,
            Self::Unload => ResourceState::Unloading,
        }
    }
}

/// One-shot signal set when an operation retires
pub(crate) struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn finish(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// Block until the operation retires
    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

/// Running total of bytes held by `Loaded` resources, and of the share
/// already asked to unload
#[derive(Debug, Default)]
pub struct ResidentLedger {
    resident: AtomicU64,
    pending_release: AtomicU64,
}

impl ResidentLedger {
    pub fn resident(&self) -> u64 {
        self.resident.load(Ordering::Acquire)
    }

    /// Bytes of resources whose unload is requested or running
    pub fn pending_release(&self) -> u64 {
        self.pending_release.load(Ordering::Acquire)
    }

    /// Resident bytes once every requested unload has finished
    pub fn projected(&self) -> u64 {
        self.resident().saturating_sub(self.pending_release())
    }

    pub(crate) fn reserve(&self, bytes: u64) {
        self.pending_release.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn unreserve(&self, bytes: u64) {
        self.pending_release.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub(crate) fn replace(&self, old: u64, new: u64) {
        if new >= old {
            self.resident.fetch_add(new - old, Ordering::AcqRel);
        } else {
            self.resident.fetch_sub(old - new, Ordering::AcqRel);
        }
    }
}

/// How an operation ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Load succeeded with the resident size
    Loaded { size: u64 },
    /// Unload finished, releasing this many bytes
    Unloaded { freed: u64 },
    /// Load failed; the resource is back to `Unloaded`
    Failed(String),
    /// The request was cancelled before a worker reached it
    Skipped,
}

/// Summary of a retired operation, produced by the drain
#[derive(Clone, Debug)]
pub struct OperationReport {
    pub key: ResourceKey,
    pub kind: OperationKind,
    pub outcome: OperationOutcome,
    /// Whether the operation's code panicked (caught at the worker boundary)
    pub panicked: bool,
}

/// A queued load or unload of exactly one resource
pub struct ResourceOperation {
    kind: OperationKind,
    target: Arc<dyn Streamable>,
    source: Arc<dyn ResourceSource>,
    ledger: Option<Arc<ResidentLedger>>,
}

impl ResourceOperation {
    pub(crate) fn new(
        kind: OperationKind,
        target: Arc<dyn Streamable>,
        source: Arc<dyn ResourceSource>,
        ledger: Option<Arc<ResidentLedger>>,
    ) -> Self {
        Self {
            kind,
            target,
            source,
            ledger,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Key of the target resource
    pub fn key(&self) -> &ResourceKey {
        self.target.core().key()
    }

    /// Run the operation on the current thread.
    pub(crate) fn process(&self) -> OperationReport {
        execute(self.kind, self.target.as_ref(), self.source.as_ref(), self.ledger.as_deref())
    }
}

/// Drive `target` through one load or unload on the current thread.
///
/// Never panics: a panic in the resource's code is caught here and the
/// resource is settled as `Unloaded`.
pub(crate) fn execute(
    kind: OperationKind,
    target: &dyn Streamable,
    source: &dyn ResourceSource,
    ledger: Option<&ResidentLedger>,
) -> OperationReport {
    let core = target.core();
    let report = |outcome, panicked| OperationReport {
        key: core.key().clone(),
        kind,
        outcome,
        panicked,
    };

    if !core.begin(kind, ledger) {
        log::debug!(target: STREAM_TARGET, "{:?} of '{}' skipped (request withdrawn)", kind, core.key());
        return report(OperationOutcome::Skipped, false);
    }

    match kind {
        OperationKind::Load => {
            let ctx = LoadContext::new(core.key(), source);
            let (result, panicked) = match panic::catch_unwind(AssertUnwindSafe(|| target.load_payload(&ctx))) {
                Ok(result) => (result, false),
                Err(payload) => (Err(LoadError::Panicked(panic_message(payload.as_ref()))), true),
            };

            match result {
                Ok(()) => {
                    let size = target.payload_size();
                    core.settle(ResourceState::Loaded, size, ledger);
                    log::debug!(target: STREAM_TARGET, "Loaded '{}' ({} bytes)", core.key(), size);
                    report(OperationOutcome::Loaded { size }, panicked)
                }
                Err(e) => {
                    log::error!(
                        target: STREAM_TARGET,
                        "Failed to load {} '{}': {}",
                        target.type_name(),
                        core.key(),
                        e
                    );
                    core.settle(ResourceState::Unloaded, 0, ledger);
                    report(OperationOutcome::Failed(e.to_string()), panicked)
                }
            }
        }
        OperationKind::Unload => {
            let panicked = match panic::catch_unwind(AssertUnwindSafe(|| target.unload_payload())) {
                Ok(()) => false,
                Err(payload) => {
                    log::error!(
                        target: STREAM_TARGET,
                        "Unload of '{}' panicked: {}",
                        core.key(),
                        panic_message(payload.as_ref())
                    );
                    true
                }
            };
            let freed = core.settle(ResourceState::Unloaded, 0, ledger);
            log::debug!(target: STREAM_TARGET, "Unloaded '{}' ({} bytes freed)", core.key(), freed);
            report(OperationOutcome::Unloaded { freed }, panicked)
        }
    }
}

impl std::fmt::Debug for ResourceOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceOperation")
            .field("kind", &self.kind)
            .field("key", self.key())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadResult;
    use crate::resource::{Request, Resource, ResourceCell};
    use crate::source::MemorySource;
    use parking_lot::RwLock;

    struct Blob {
        data: RwLock<Option<Vec<u8>>>,
    }

    impl Blob {
        fn new() -> Self {
            Self { data: RwLock::new(None) }
        }
    }

    impl Resource for Blob {
        fn load(&self, ctx: &LoadContext<'_>) -> LoadResult<()> {
            *self.data.write() = Some(ctx.read_bytes()?);
            Ok(())
        }

        fn unload(&self) {
            *self.data.write() = None;
        }

        fn size(&self) -> u64 {
            self.data.read().as_ref().map_or(0, |d| d.len() as u64)
        }
    }

    struct Exploding;

    impl Resource for Exploding {
        fn load(&self, _ctx: &LoadContext<'_>) -> LoadResult<()> {
            panic!("decoder exploded");
        }

        fn unload(&self) {}

        fn size(&self) -> u64 {
            0
        }
    }

    fn source() -> Arc<dyn ResourceSource> {
        let source = MemorySource::new();
        source.insert("blob", vec![0u8; 64]);
        Arc::new(source)
    }

    fn operation(kind: OperationKind, target: Arc<dyn Streamable>, ledger: &Arc<ResidentLedger>) -> ResourceOperation {
        ResourceOperation::new(kind, target, source(), Some(ledger.clone()))
    }

    #[test]
    fn test_load_then_unload() {
        let ledger = Arc::new(ResidentLedger::default());
        let cell: Arc<dyn Streamable> = Arc::new(ResourceCell::managed("blob".into(), Blob::new()));

        assert!(matches!(cell.core().request(OperationKind::Load, None), Request::Dispatch(_)));
        let report = operation(OperationKind::Load, cell.clone(), &ledger).process();
        assert_eq!(report.outcome, OperationOutcome::Loaded { size: 64 });
        assert_eq!(cell.core().state(), ResourceState::Loaded);
        assert_eq!(ledger.resident(), 64);

        cell.core().request(OperationKind::Unload, None);
        let report = operation(OperationKind::Unload, cell.clone(), &ledger).process();
        assert_eq!(report.outcome, OperationOutcome::Unloaded { freed: 64 });
        assert_eq!(cell.core().state(), ResourceState::Unloaded);
        assert_eq!(ledger.resident(), 0);
    }

    #[test]
    fn test_missing_data_leaves_unloaded() {
        let ledger = Arc::new(ResidentLedger::default());
        let cell: Arc<dyn Streamable> = Arc::new(ResourceCell::managed("missing".into(), Blob::new()));

        cell.core().request(OperationKind::Load, None);
        let report = operation(OperationKind::Load, cell.clone(), &ledger).process();
        assert!(matches!(report.outcome, OperationOutcome::Failed(_)));
        assert_eq!(cell.core().state(), ResourceState::Unloaded);
        assert_eq!(ledger.resident(), 0);
    }

    #[test]
    fn test_panicking_load_is_contained() {
        let ledger = Arc::new(ResidentLedger::default());
        let cell: Arc<dyn Streamable> = Arc::new(ResourceCell::managed("boom".into(), Exploding));

        cell.core().request(OperationKind::Load, None);
        let report = operation(OperationKind::Load, cell.clone(), &ledger).process();
        assert!(report.panicked);
        assert!(matches!(report.outcome, OperationOutcome::Failed(ref msg) if msg.contains("decoder exploded")));
        assert_eq!(cell.core().state(), ResourceState::Unloaded);
    }

    #[test]
    fn test_completion_signal() {
        let completion = Completion::new();

        let waiter = {
            let completion = completion.clone();
            std::thread::spawn(move || completion.wait())
        };
        completion.finish();
        waiter.join().unwrap();
        // Already finished: returns immediately
        completion.wait();
    }
}
