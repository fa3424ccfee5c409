//! Generation Table - Generational LRU eviction policy
//!
//! Resources are grouped into age cohorts ("generations"), newest first.
//! Touching a resource moves it into generation 0; every aging tick opens a
//! fresh generation 0 and shifts the others back. The ring has a fixed
//! depth, and whatever ages past the last slot is merged into it (the
//! overflow generation).
//!
//! Members live in a slab and each generation threads them into a doubly
//! linked list, so touch, removal and the overflow merge are O(1). A
//! member records the tick it entered its generation; its index is derived
//! from that tick, so shifting the ring updates no member.
//!
//! Eviction walks from the oldest generation towards the newest and asks
//! `Loaded` resources to unload until the projected resident size fits the
//! budget. Within a generation the order is insertion order.
//!
//! Only the owning thread mutates the table; workers never touch it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use slab::Slab;

use crate::resource::{ResourceKey, ResourceState, Streamable};

/// Smallest useful ring: newest plus overflow
pub const MIN_GENERATION_DEPTH: usize = 2;

struct Member {
    key: ResourceKey,
    target: Weak<dyn Streamable>,
    size: u64,
    /// Tick on which the resource entered its generation
    tick: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Member {
    fn is(&self, target: &Arc<dyn Streamable>) -> bool {
        std::ptr::eq(self.target.as_ptr() as *const (), Arc::as_ptr(target) as *const ())
    }
}

/// One age cohort: ends of its member list and running totals
#[derive(Clone, Copy, Default)]
struct Generation {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    bytes: u64,
}

/// Age cohorts of the resources known to one manager
pub struct GenerationTable {
    depth: usize,
    /// Tick number of generation 0
    current_tick: u64,
    generations: VecDeque<Generation>,
    members: Slab<Member>,
    index: HashMap<ResourceKey, usize>,
}

impl GenerationTable {
    /// Create a table with `depth` generations
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(MIN_GENERATION_DEPTH);
        let mut generations = VecDeque::with_capacity(depth + 1);
        generations.push_back(Generation::default());
        Self {
            depth,
            current_tick: 0,
            generations,
            members: Slab::new(),
            index: HashMap::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of ticks since creation
    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// Number of tracked resources
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Whether this very resource is tracked, not merely one with its key
    pub(crate) fn tracks(&self, target: &Arc<dyn Streamable>) -> bool {
        self.slot_of(target).is_some()
    }

    fn slot_of(&self, target: &Arc<dyn Streamable>) -> Option<usize> {
        let slot = *self.index.get(target.core().key())?;
        self.members.get(slot).filter(|m| m.is(target)).map(|_| slot)
    }

    fn index_of(&self, tick: u64) -> usize {
        let age = (self.current_tick - tick) as usize;
        age.min(self.generations.len() - 1)
    }

    /// Generation index of a resource (0 = newest)
    pub fn generation_of(&self, key: &str) -> Option<usize> {
        let slot = *self.index.get(key)?;
        self.members.get(slot).map(|m| self.index_of(m.tick))
    }

    /// Generation index of this very resource
    pub(crate) fn generation_of_target(&self, target: &Arc<dyn Streamable>) -> Option<usize> {
        let slot = self.slot_of(target)?;
        self.members.get(slot).map(|m| self.index_of(m.tick))
    }

    /// Summed recorded size of a generation's members
    pub fn generation_bytes(&self, index: usize) -> u64 {
        self.generations.get(index).map_or(0, |g| g.bytes)
    }

    /// Member count of a generation
    pub fn generation_len(&self, index: usize) -> usize {
        self.generations.get(index).map_or(0, |g| g.len)
    }

    /// Summed recorded size of all generations
    pub fn total_bytes(&self) -> u64 {
        self.generations.iter().map(|g| g.bytes).sum()
    }

    /// Take a member out of its generation's list. It stays in the slab.
    fn unlink(&mut self, slot: usize) {
        let Some(member) = self.members.get(slot) else {
            return;
        };
        let (prev, next, size) = (member.prev, member.next, member.size);
        let index = self.index_of(member.tick);

        let generation = &mut self.generations[index];
        match prev {
            Some(prev) => self.members[prev].next = next,
            None => generation.head = next,
        }
        match next {
            Some(next) => self.members[next].prev = prev,
            None => generation.tail = prev,
        }
        generation.len -= 1;
        generation.bytes -= size;

        let member = &mut self.members[slot];
        member.prev = None;
        member.next = None;
    }

    /// Append a member to the tail of generation 0
    fn push_newest(&mut self, slot: usize) {
        let newest = &mut self.generations[0];
        let member = &mut self.members[slot];
        member.tick = self.current_tick;
        member.prev = newest.tail;
        member.next = None;
        newest.len += 1;
        newest.bytes += member.size;

        match newest.tail {
            Some(tail) => self.members[tail].next = Some(slot),
            None => newest.head = Some(slot),
        }
        newest.tail = Some(slot);
    }

    fn forget(&mut self, slot: usize) {
        self.unlink(slot);
        if let Some(member) = self.members.try_remove(slot) {
            if self.index.get(&member.key) == Some(&slot) {
                self.index.remove(&member.key);
            }
        }
    }

    /// Mark a resource as used now: move it into generation 0.
    ///
    /// A resource already in generation 0 keeps its position; only its
    /// recorded size is refreshed. A different resource registered under
    /// the same key replaces the old member.
    pub(crate) fn touch(&mut self, target: &Arc<dyn Streamable>) {
        let core = target.core();
        let size = core.resident_size();

        if let Some(slot) = self.slot_of(target) {
            if self.index_of(self.members[slot].tick) == 0 {
                self.record_size(slot, size);
            } else {
                self.unlink(slot);
                self.members[slot].size = size;
                self.push_newest(slot);
            }
            return;
        }

        if let Some(&stale) = self.index.get(core.key().as_ref()) {
            self.forget(stale);
        }
        let slot = self.members.insert(Member {
            key: core.key().clone(),
            target: Arc::downgrade(target),
            size,
            tick: self.current_tick,
            prev: None,
            next: None,
        });
        self.index.insert(core.key().clone(), slot);
        self.push_newest(slot);
    }

    fn record_size(&mut self, slot: usize, size: u64) {
        let Some(member) = self.members.get_mut(slot) else {
            return;
        };
        let old = std::mem::replace(&mut member.size, size);
        let tick = member.tick;
        let index = self.index_of(tick);
        let generation = &mut self.generations[index];
        generation.bytes = generation.bytes - old + size;
    }

    /// Refresh a member's recorded size (after a load or unload retired)
    pub fn update_size(&mut self, key: &str, size: u64) {
        if let Some(&slot) = self.index.get(key) {
            self.record_size(slot, size);
        }
    }

    /// Forget a resource
    pub fn remove(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&slot) => {
                self.forget(slot);
                true
            }
            None => false,
        }
    }

    /// Open a new generation 0, shifting every other generation back.
    pub fn tick(&mut self) {
        self.current_tick += 1;
        self.generations.push_front(Generation::default());
        if self.generations.len() > self.depth {
            if let Some(expired) = self.generations.pop_back() {
                self.merge_into_overflow(expired);
            }
        }
    }

    /// Splice an expired generation in front of the overflow list, keeping
    /// the older members first.
    fn merge_into_overflow(&mut self, expired: Generation) {
        let Some(overflow) = self.generations.back_mut() else {
            return;
        };
        if let (Some(tail), Some(head)) = (expired.tail, overflow.head) {
            self.members[tail].next = Some(head);
            self.members[head].prev = Some(tail);
        }
        overflow.head = expired.head.or(overflow.head);
        overflow.tail = overflow.tail.or(expired.tail);
        overflow.len += expired.len;
        overflow.bytes += expired.bytes;
    }

    /// Request unloads from the oldest generation forward until
    /// `resident - freed <= budget`.
    ///
    /// The newest `protected` generations are never scanned. Only `Loaded`,
    /// unloadable resources are candidates; `unload` returns whether the
    /// request was accepted. Returns the bytes whose release is now pending.
    pub(crate) fn evict_until_under_budget(
        &mut self,
        budget: u64,
        resident: u64,
        protected: usize,
        mut unload: impl FnMut(&Arc<dyn Streamable>) -> bool,
    ) -> u64 {
        let mut freed = 0u64;
        if resident <= budget {
            return 0;
        }

        let mut dead = Vec::new();
        let oldest = self.generations.len() - 1;
        'scan: for index in (protected.min(oldest + 1)..=oldest).rev() {
            let mut cursor = self.generations[index].head;
            while let Some(slot) = cursor {
                let member = &self.members[slot];
                cursor = member.next;
                let Some(target) = member.target.upgrade() else {
                    dead.push(slot);
                    continue;
                };

                let core = target.core();
                if core.state() != ResourceState::Loaded || !target.unloadable() {
                    continue;
                }

                let size = core.resident_size();
                if unload(&target) {
                    freed += size;
                    if resident.saturating_sub(freed) <= budget {
                        break 'scan;
                    }
                }
            }
        }

        for slot in dead {
            self.forget(slot);
        }
        freed
    }
}

impl std::fmt::Debug for GenerationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sizes: Vec<_> = self.generations.iter().map(|g| (g.len, g.bytes)).collect();
        f.debug_struct("GenerationTable")
            .field("depth", &self.depth)
            .field("tick", &self.current_tick)
            .field("generations", &sizes)
            .finish()
    }
}
