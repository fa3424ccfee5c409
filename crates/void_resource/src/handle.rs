//! Resource Handle - Client-facing reference to a resource
//!
//! Every access through a handle touches the owning manager, which marks the
//! resource as recently used and brings it back if it was evicted. Access
//! never blocks and never fails: a handle whose resource is not loaded yet
//! still hands out the resource, and callers check [`ResourceHandle::state`]
//! before relying on its contents. [`ResourceHandle::touch_sync`] is the
//! blocking variant.
//!
//! Standalone handles wrap a resource no manager knows about. They count
//! their clones and unload the resource when the last one goes away.

use std::ops::BitOr;
use std::sync::{Arc, Weak};

use crate::manager::ManagerShared;
use crate::operation::{execute, OperationKind};
use crate::resource::{Request, Resource, ResourceCell, ResourceKey, ResourceState, Streamable};
use crate::source::ResourceSource;

/// Behaviour switches of a handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HandleFlags(u8);

impl HandleFlags {
    pub const NONE: Self = Self(0);
    /// Accesses never touch; the handle is a plain reference
    pub const UNTOUCHING: Self = Self(1);
    /// Dropping the handle releases the resource regardless of other holders
    pub const FORCE_DISPOSAL: Self = Self(1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for HandleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

enum Binding {
    Managed(Weak<ManagerShared>),
    Standalone,
}

/// Typed reference to a resource
pub struct ResourceHandle<T: Resource> {
    cell: Arc<ResourceCell<T>>,
    binding: Binding,
    flags: HandleFlags,
}

impl<T: Resource> ResourceHandle<T> {
    pub(crate) fn managed(cell: Arc<ResourceCell<T>>, manager: Weak<ManagerShared>) -> Self {
        Self {
            cell,
            binding: Binding::Managed(manager),
            flags: HandleFlags::NONE,
        }
    }

    /// Wrap a resource owned by its handles instead of a manager
    pub fn standalone(key: impl Into<ResourceKey>, resource: T) -> Self {
        let cell = Arc::new(ResourceCell::standalone(key.into(), resource));
        cell.core().add_ref();
        Self {
            cell,
            binding: Binding::Standalone,
            flags: HandleFlags::NONE,
        }
    }

    /// Touch, then return the resource, loaded or not
    pub fn get(&self) -> &T {
        self.touch();
        self.cell.resource()
    }

    /// Touch, then return the resource only if it is loaded
    pub fn get_loaded(&self) -> Option<&T> {
        self.touch();
        (self.state() == ResourceState::Loaded).then(|| self.cell.resource())
    }

    /// The resource without touching it. Its contents may not be loaded.
    pub fn weak_ref(&self) -> &T {
        self.cell.resource()
    }

    /// Mark the resource as recently used and request its load if needed
    pub fn touch(&self) {
        if self.flags.contains(HandleFlags::UNTOUCHING) {
            return;
        }
        if let Some(manager) = self.manager() {
            manager.touch(&self.node());
        }
    }

    /// Touch and block until the resource is loaded or its load failed.
    pub fn touch_sync(&self) -> ResourceState {
        if self.flags.contains(HandleFlags::UNTOUCHING) {
            return self.state();
        }
        match self.manager() {
            Some(manager) => manager.touch_sync(&self.node()),
            None => self.state(),
        }
    }

    /// Load a standalone resource in place from `source`
    pub fn load(&self, source: &dyn ResourceSource) -> ResourceState {
        debug_assert!(
            !self.cell.core().is_managed(),
            "explicit load of managed resource '{}'",
            self.key()
        );
        self.run_in_place(OperationKind::Load, source);
        self.state()
    }

    /// Unload a standalone resource in place
    pub fn unload(&self) -> ResourceState {
        debug_assert!(
            !self.cell.core().is_managed(),
            "explicit unload of managed resource '{}'",
            self.key()
        );
        self.run_in_place(OperationKind::Unload, &NoSource);
        self.state()
    }

    fn run_in_place(&self, kind: OperationKind, source: &dyn ResourceSource) {
        match self.cell.core().request(kind, None) {
            Request::Dispatch(_) | Request::Rearmed(_) => {
                execute(kind, self.cell.as_ref(), source, None);
            }
            Request::Rejected => {}
        }
    }

    pub fn state(&self) -> ResourceState {
        self.cell.core().state()
    }

    pub fn key(&self) -> &ResourceKey {
        self.cell.core().key()
    }

    /// Resident size in bytes (zero unless loaded)
    pub fn size(&self) -> u64 {
        self.cell.core().resident_size()
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ResourceState::Loaded
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.binding, Binding::Managed(_))
    }

    /// Keep the resource out of eviction
    pub fn pin(&self) {
        self.cell.core().set_pinned(true);
    }

    pub fn unpin(&self) {
        self.cell.core().set_pinned(false);
    }

    pub fn is_pinned(&self) -> bool {
        self.cell.core().is_pinned()
    }

    /// Generation index in the owning manager (0 = newest)
    pub fn generation(&self) -> Option<usize> {
        self.manager().and_then(|m| m.generation_of_node(&self.node()))
    }

    pub fn flags(&self) -> HandleFlags {
        self.flags
    }

    pub fn with_flags(mut self, flags: HandleFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Clone that never touches
    pub fn untouching(&self) -> Self {
        self.clone().with_flags(HandleFlags::UNTOUCHING)
    }

    fn manager(&self) -> Option<Arc<ManagerShared>> {
        match &self.binding {
            Binding::Managed(manager) => manager.upgrade(),
            Binding::Standalone => None,
        }
    }

    fn node(&self) -> Arc<dyn Streamable> {
        self.cell.clone()
    }
}

impl<T: Resource> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        let binding = match &self.binding {
            Binding::Managed(manager) => Binding::Managed(manager.clone()),
            Binding::Standalone => {
                self.cell.core().add_ref();
                Binding::Standalone
            }
        };
        Self {
            cell: self.cell.clone(),
            binding,
            flags: self.flags.without(HandleFlags::FORCE_DISPOSAL),
        }
    }
}

impl<T: Resource> Drop for ResourceHandle<T> {
    fn drop(&mut self) {
        let force = self.flags.contains(HandleFlags::FORCE_DISPOSAL);
        match &self.binding {
            Binding::Standalone => {
                let remaining = self.cell.core().release_ref();
                if remaining == 0 || force {
                    self.run_in_place(OperationKind::Unload, &NoSource);
                }
            }
            Binding::Managed(manager) => {
                if force {
                    if let Some(manager) = manager.upgrade() {
                        manager.release_node(&self.node());
                    }
                }
            }
        }
    }
}

impl<T: Resource> std::fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", self.key())
            .field("state", &self.state())
            .field("managed", &self.is_managed())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Source handed to unloads, which never read
struct NoSource;

impl ResourceSource for NoSource {
    fn read(&self, key: &str) -> crate::error::LoadResult<Vec<u8>> {
        Err(crate::error::LoadError::NotFound(key.to_string()))
    }

    fn exists(&self, _key: &str) -> bool {
        false
    }
}
