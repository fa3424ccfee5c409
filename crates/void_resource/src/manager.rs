//! Resource Manager - Registry, budget and per-frame coordination
//!
//! One manager per resource category. It owns the registry (key to
//! resource), the generation table and, in async mode, an
//! [`AsyncProcessor`]. In synchronous mode every load and unload runs in
//! place on the calling thread.
//!
//! The owning thread calls [`ResourceManager::perform_all_post_sync`] once
//! per frame. That call drains retired operations, advances aging and, when
//! resident bytes exceed the budget, asks the oldest resources to unload.
//! Eviction is advisory: a frame may run over budget while unloads are in
//! flight, and nothing blocks to enforce it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::error::{ResourceError, ResourceResult};
use crate::generation::GenerationTable;
use crate::handle::ResourceHandle;
use crate::operation::{
    execute, Completion, OperationKind, OperationOutcome, OperationReport, ResidentLedger, ResourceOperation,
};
use crate::processor::AsyncProcessor;
use crate::resource::{same_node, Request, Resource, ResourceCell, ResourceKey, ResourceState, Streamable};
use crate::source::ResourceSource;
use crate::{CACHE_TARGET, STREAM_TARGET};

/// Counters since the manager was created
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Loads that completed successfully
    pub loads: u64,
    pub failures: u64,
    /// Unloads that completed
    pub unloads: u64,
    /// Unloads requested by the eviction pass
    pub evictions: u64,
    /// `get_or_create` calls answered from the registry
    pub hits: u64,
    pub misses: u64,
    /// Operations retired without work after their request was withdrawn
    pub skipped: u64,
    /// Operations whose resource code panicked
    pub panics: u64,
}

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    failures: AtomicU64,
    unloads: AtomicU64,
    evictions: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    skipped: AtomicU64,
    panics: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn record(&self, report: &OperationReport) {
        match report.outcome {
            OperationOutcome::Loaded { .. } => Self::bump(&self.loads, 1),
            OperationOutcome::Unloaded { .. } => Self::bump(&self.unloads, 1),
            OperationOutcome::Failed(_) => Self::bump(&self.failures, 1),
            OperationOutcome::Skipped => Self::bump(&self.skipped, 1),
        }
        if report.panicked {
            Self::bump(&self.panics, 1);
        }
    }

    fn snapshot(&self) -> StreamStats {
        StreamStats {
            loads: self.loads.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            unloads: self.unloads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// What one post-sync pass did
#[derive(Debug, Default)]
pub struct PostSyncReport {
    /// Operations retired since the previous pass
    pub operations: Vec<OperationReport>,
    /// Aging ticks applied
    pub ticks: u64,
    /// Bytes whose unload the eviction pass requested
    pub eviction_requested_bytes: u64,
    /// Resident bytes after the pass
    pub resident_bytes: u64,
    pub budget_bytes: u64,
}

impl PostSyncReport {
    pub fn over_budget(&self) -> bool {
        self.resident_bytes > self.budget_bytes
    }
}

struct RegistryEntry {
    node: Arc<dyn Streamable>,
    any: Arc<dyn Any + Send + Sync>,
}

/// State shared between the manager and its handles
pub(crate) struct ManagerShared {
    config: CacheConfig,
    source: Arc<dyn ResourceSource>,
    registry: Mutex<HashMap<ResourceKey, RegistryEntry>>,
    generations: Mutex<GenerationTable>,
    /// `None` in synchronous mode
    processor: Option<AsyncProcessor>,
    /// Reports of operations executed in place, waiting for the drain
    inline_reports: Mutex<Vec<OperationReport>>,
    ledger: Arc<ResidentLedger>,
    budget: AtomicU64,
    aging: Mutex<Duration>,
    starving: AtomicBool,
    shut_down: AtomicBool,
    counters: Counters,
}

impl ManagerShared {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Ask a resource to start an operation, dispatching it if needed.
    ///
    /// Returns the completion signal of the operation now in charge, or
    /// `None` when the resource was not in a state to accept the request.
    fn request(&self, node: &Arc<dyn Streamable>, kind: OperationKind) -> Option<Arc<Completion>> {
        let completion = match node.core().request(kind, Some(&self.ledger)) {
            Request::Dispatch(completion) => completion,
            Request::Rearmed(completion) => return Some(completion),
            Request::Rejected => return None,
        };

        let operation = Box::new(ResourceOperation::new(
            kind,
            Arc::clone(node),
            Arc::clone(&self.source),
            Some(Arc::clone(&self.ledger)),
        ));

        match &self.processor {
            Some(processor) => {
                if let Err(operation) = processor.enqueue(operation) {
                    log::warn!(
                        target: STREAM_TARGET,
                        "{} cache rejected {:?} of '{}': processor stopped",
                        self.name(),
                        kind,
                        operation.key()
                    );
                    node.core().abandon(kind, Some(&self.ledger));
                    return None;
                }
            }
            None => {
                let report = operation.process();
                self.inline_reports.lock().push(report);
            }
        }
        Some(completion)
    }

    /// Mark a resource as recently used and request its load if evicted.
    pub(crate) fn touch(&self, node: &Arc<dyn Streamable>) {
        if !self.mark_used(node) {
            return;
        }

        let core = node.core();
        match core.state() {
            ResourceState::Unloaded => {
                self.request(node, OperationKind::Load);
            }
            ResourceState::Pending => {
                core.neutralize(OperationKind::Unload, Some(&self.ledger));
            }
            _ => {}
        }
    }

    /// Touch and wait for the resource's operations to settle.
    ///
    /// Returns `Loaded`, or `Unloaded` after a failed load.
    pub(crate) fn touch_sync(&self, node: &Arc<dyn Streamable>) -> ResourceState {
        let core = node.core();
        if !self.mark_used(node) {
            return core.state();
        }

        let mut requested = false;
        loop {
            core.neutralize(OperationKind::Unload, Some(&self.ledger));
            match core.state() {
                ResourceState::Loaded => return ResourceState::Loaded,
                ResourceState::Unloaded if !requested => {
                    requested = true;
                    if let Some(completion) = self.request(node, OperationKind::Load) {
                        completion.wait();
                    }
                    continue;
                }
                _ => {}
            }

            match core.pending_completion() {
                Some(completion) => completion.wait(),
                None => return core.state(),
            }
        }
    }

    /// Move a registered resource into the newest generation.
    ///
    /// Released resources are no longer tracked, even once another
    /// resource is registered under the same key.
    fn mark_used(&self, node: &Arc<dyn Streamable>) -> bool {
        let mut table = self.generations.lock();
        if !table.tracks(node) {
            return false;
        }
        table.touch(node);
        true
    }

    pub(crate) fn generation_of(&self, key: &str) -> Option<usize> {
        self.generations.lock().generation_of(key)
    }

    pub(crate) fn generation_of_node(&self, node: &Arc<dyn Streamable>) -> Option<usize> {
        self.generations.lock().generation_of_target(node)
    }

    /// Forget a resource and request its unload
    pub(crate) fn release(&self, key: &str) -> bool {
        self.forget(key, |_| true)
    }

    /// Release `node` only if it is still the resource registered under its key
    pub(crate) fn release_node(&self, node: &Arc<dyn Streamable>) -> bool {
        self.forget(node.core().key(), |entry| same_node(entry, node))
    }

    fn forget(&self, key: &str, matches: impl FnOnce(&Arc<dyn Streamable>) -> bool) -> bool {
        let entry = {
            let mut registry = self.registry.lock();
            if !registry.get(key).is_some_and(|entry| matches(&entry.node)) {
                return false;
            }
            registry.remove(key)
        };
        let Some(entry) = entry else {
            return false;
        };
        self.generations.lock().remove(key);
        self.request(&entry.node, OperationKind::Unload);
        log::debug!(target: CACHE_TARGET, "{} cache released '{}'", self.name(), key);
        true
    }

    fn drain_reports(&self) -> Vec<OperationReport> {
        let mut reports = match &self.processor {
            Some(processor) => processor.perform_all_post_sync(),
            None => Vec::new(),
        };
        reports.append(&mut self.inline_reports.lock());

        if !reports.is_empty() {
            let registry = self.registry.lock();
            let mut table = self.generations.lock();
            for report in &reports {
                self.counters.record(report);
                if let Some(entry) = registry.get(&report.key) {
                    table.update_size(&report.key, entry.node.core().resident_size());
                }
            }
        }
        reports
    }

    /// Accumulate `elapsed` and apply the aging ticks it completes
    fn advance_aging(&self, elapsed: Duration) -> u64 {
        let interval = self.config.aging_interval;
        let ticks = if interval.is_zero() {
            1
        } else {
            let mut pending = self.aging.lock();
            *pending += elapsed;
            let ticks = pending.as_nanos() / interval.as_nanos();
            if ticks > 0 {
                *pending = Duration::from_nanos((pending.as_nanos() % interval.as_nanos()) as u64);
            }
            ticks as u64
        };

        // Past the ring depth every member already sits in the overflow generation
        let applied = ticks.min(self.config.generation_depth as u64);
        if applied > 0 {
            let mut table = self.generations.lock();
            for _ in 0..applied {
                table.tick();
            }
        }
        ticks
    }

    /// Request unloads until the projected resident size fits the budget.
    ///
    /// The projection leaves out bytes whose unload is already requested,
    /// so a busy worker does not cost one extra victim per frame.
    fn enforce_budget(&self) -> u64 {
        let budget = self.budget.load(Ordering::Acquire);
        let resident = self.ledger.projected();
        if resident <= budget {
            self.starving.store(false, Ordering::Relaxed);
            return 0;
        }

        log::info!(
            target: CACHE_TARGET,
            "{} cache over budget ({} / {} bytes, {} pending release), evicting oldest generations",
            self.name(),
            self.ledger.resident(),
            budget,
            self.ledger.pending_release()
        );

        let mut evicted = 0u64;
        let freed = self.generations.lock().evict_until_under_budget(
            budget,
            resident,
            self.config.protected_generations,
            |node| {
                let accepted = self.request(node, OperationKind::Unload).is_some();
                if accepted {
                    evicted += 1;
                    log::debug!(target: CACHE_TARGET, "Evicting '{}'", node.core().key());
                }
                accepted
            },
        );
        Counters::bump(&self.counters.evictions, evicted);

        let projected = resident.saturating_sub(freed);
        let high_water = budget as f64 * self.config.high_water_ratio;
        if projected as f64 > high_water {
            if !self.starving.swap(true, Ordering::Relaxed) {
                log::warn!(
                    target: CACHE_TARGET,
                    "{} cache starving: working set of {} bytes cannot fit the {} byte budget",
                    self.name(),
                    projected,
                    budget
                );
            }
        } else if projected <= budget {
            self.starving.store(false, Ordering::Relaxed);
        }
        freed
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(processor) = &self.processor {
            processor.shutdown();
        }
        self.drain_reports();

        let nodes: Vec<_> = self.registry.lock().drain().map(|(_, entry)| entry.node).collect();
        *self.generations.lock() = GenerationTable::new(self.config.generation_depth);

        for node in nodes {
            let core = node.core();
            if core.state() != ResourceState::Loaded {
                continue;
            }
            log::warn!(
                target: CACHE_TARGET,
                "{} cache shut down with '{}' still loaded ({} bytes)",
                self.name(),
                core.key(),
                core.resident_size()
            );
            let request = core.request(OperationKind::Unload, Some(&self.ledger));
            if let Request::Dispatch(_) | Request::Rearmed(_) = request {
                let report = execute(OperationKind::Unload, node.as_ref(), self.source.as_ref(), Some(&self.ledger));
                self.counters.record(&report);
            }
        }
        log::debug!(target: CACHE_TARGET, "{} cache shut down", self.name());
    }
}

/// Budgeted cache of one resource category
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
}

impl ResourceManager {
    /// Create a manager reading resource data from `source`.
    ///
    /// Starts the worker threads when `config.async_loading` is set.
    pub fn new(config: CacheConfig, source: Arc<dyn ResourceSource>) -> ResourceResult<Self> {
        let config = config.normalized();
        let processor = if config.async_loading {
            Some(AsyncProcessor::new(config.name.clone(), config.worker_count)?)
        } else {
            None
        };

        log::debug!(
            target: CACHE_TARGET,
            "{} cache created: budget {} bytes, {}",
            config.name,
            config.budget_bytes,
            if processor.is_some() { "async" } else { "synchronous" }
        );

        Ok(Self {
            shared: Arc::new(ManagerShared {
                source,
                registry: Mutex::new(HashMap::new()),
                generations: Mutex::new(GenerationTable::new(config.generation_depth)),
                processor,
                inline_reports: Mutex::new(Vec::new()),
                ledger: Arc::new(ResidentLedger::default()),
                budget: AtomicU64::new(config.budget_bytes),
                aging: Mutex::new(Duration::ZERO),
                starving: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                counters: Counters::default(),
                config,
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn budget_bytes(&self) -> u64 {
        self.shared.budget.load(Ordering::Acquire)
    }

    /// Takes effect on the next post-sync pass
    pub fn set_budget_bytes(&self, budget: u64) {
        self.shared.budget.store(budget, Ordering::Release);
    }

    /// Sum of the sizes of `Loaded` resources
    pub fn resident_bytes(&self) -> u64 {
        self.shared.ledger.resident()
    }

    /// Bytes of resources whose unload is requested but not finished
    pub fn pending_release_bytes(&self) -> u64 {
        self.shared.ledger.pending_release()
    }

    pub fn uses_async(&self) -> bool {
        self.shared.processor.is_some()
    }

    /// Handle to the resource registered under `key`, creating it with
    /// `factory` if there is none. New resources start `Unloaded`.
    pub fn get_or_create<T, F>(&self, key: &str, factory: F) -> ResourceResult<ResourceHandle<T>>
    where
        T: Resource,
        F: FnOnce() -> T,
    {
        self.ensure_running()?;
        if let Some(handle) = self.find::<T>(key)? {
            Counters::bump(&self.shared.counters.hits, 1);
            return Ok(handle);
        }

        // Build outside the registry lock; another thread may win the race
        let key: ResourceKey = key.into();
        let created = Arc::new(ResourceCell::managed(key.clone(), factory()));

        let cell = {
            let mut registry = self.shared.registry.lock();
            match registry.get(&key) {
                Some(entry) => Self::downcast::<T>(&key, entry)?,
                None => {
                    let node: Arc<dyn Streamable> = created.clone();
                    self.shared.generations.lock().touch(&node);
                    registry.insert(
                        key.clone(),
                        RegistryEntry {
                            node,
                            any: created.clone(),
                        },
                    );
                    Counters::bump(&self.shared.counters.misses, 1);
                    log::debug!(target: CACHE_TARGET, "{} cache registered '{}'", self.name(), key);
                    created
                }
            }
        };

        Ok(ResourceHandle::managed(cell, Arc::downgrade(&self.shared)))
    }

    /// Handle to an already registered resource
    pub fn find<T: Resource>(&self, key: &str) -> ResourceResult<Option<ResourceHandle<T>>> {
        let registry = self.shared.registry.lock();
        let Some(entry) = registry.get(key) else {
            return Ok(None);
        };
        let cell = Self::downcast::<T>(key, entry)?;
        Ok(Some(ResourceHandle::managed(cell, Arc::downgrade(&self.shared))))
    }

    fn downcast<T: Resource>(key: &str, entry: &RegistryEntry) -> ResourceResult<Arc<ResourceCell<T>>> {
        Arc::clone(&entry.any)
            .downcast::<ResourceCell<T>>()
            .map_err(|_| ResourceError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    fn ensure_running(&self) -> ResourceResult<()> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            Err(ResourceError::ShutDown(self.name().to_string()))
        } else {
            Ok(())
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared.registry.lock().contains_key(key)
    }

    /// Number of registered resources
    pub fn resource_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Remove a resource from the registry and request its unload.
    ///
    /// Outstanding handles keep the value alive but no longer stream it.
    pub fn release(&self, key: &str) -> bool {
        self.shared.release(key)
    }

    /// Generation index of a resource (0 = newest)
    pub fn generation_of(&self, key: &str) -> Option<usize> {
        self.shared.generation_of(key)
    }

    /// Per-frame synchronization point.
    ///
    /// Drains retired operations, applies the aging ticks `elapsed`
    /// completes and runs an eviction pass when over budget.
    pub fn perform_all_post_sync(&self, elapsed: Duration) -> PostSyncReport {
        let shared = &self.shared;
        let mut operations = shared.drain_reports();
        let ticks = shared.advance_aging(elapsed);
        let eviction_requested_bytes = shared.enforce_budget();

        // Unloads requested in place already ran
        if shared.processor.is_none() && eviction_requested_bytes > 0 {
            operations.extend(shared.drain_reports());
        }

        PostSyncReport {
            operations,
            ticks,
            eviction_requested_bytes,
            resident_bytes: self.resident_bytes(),
            budget_bytes: self.budget_bytes(),
        }
    }

    /// Refresh every loaded resource from the source.
    ///
    /// Synchronous managers unload and reload in place. Async managers
    /// request the unloads; resources come back on their next touch.
    /// Returns the number of resources affected.
    pub fn reload_all(&self) -> usize {
        let nodes: Vec<_> = self
            .shared
            .registry
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.node))
            .collect();

        let mut count = 0;
        for node in &nodes {
            if self.shared.request(node, OperationKind::Unload).is_none() {
                continue;
            }
            if self.shared.processor.is_none() {
                self.shared.request(node, OperationKind::Load);
            }
            count += 1;
        }
        log::debug!(target: CACHE_TARGET, "{} cache reloading {} resource(s)", self.name(), count);
        count
    }

    /// Queued plus executing operations
    pub fn operation_count(&self) -> usize {
        self.shared.processor.as_ref().map_or(0, |p| p.operation_count())
    }

    pub fn is_idle(&self) -> bool {
        self.operation_count() == 0
    }

    /// Block until the processor has nothing queued or executing
    pub fn wait_for_idle(&self) {
        if let Some(processor) = &self.shared.processor {
            processor.wait_for_idle();
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.counters.snapshot()
    }

    /// Stop streaming: finish queued operations, join the workers and
    /// unload whatever is still loaded, reporting it as leaked.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("name", &self.name())
            .field("resources", &self.resource_count())
            .field("resident_bytes", &self.resident_bytes())
            .field("budget_bytes", &self.budget_bytes())
            .field("async", &self.uses_async())
            .finish()
    }
}
