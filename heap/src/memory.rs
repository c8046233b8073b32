use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::collections::HashSet;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use object::{Header, Value, HEADER_BYTES};

use crate::handles::HandleSet;

const TENURED: usize = 0;
const YOUNG: usize = 1;

/// Which collector runs behind [`ObjectMemory::allocate_raw`].
///
/// Selected once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorKind {
    /// Classic Baker two-space copying collector.
    TwoSpace,
    /// Two-space with tenuring: the left semispace holds promoted
    /// survivors, the right is the allocation nursery.
    Generational,
    /// Bump allocation only; nothing is ever reclaimed.
    NonCollecting,
}

/// Object-memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Capacity of one semispace in bytes.
    pub heap_size: usize,
    /// Upper bound for semispace growth. Growth doubles up to this cap.
    pub max_heap_size: usize,
    /// Chunk size for the static (non-collected) heap.
    pub static_heap_size: usize,
    pub collector: CollectorKind,
    /// Number of young collections between full collections
    /// (generational mode).
    pub right_collection_delay: u32,
    /// Tenured occupancy fraction above which a full collection runs
    /// (generational mode).
    pub tenured_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap_size: 4 << 20,
            max_heap_size: 64 << 20,
            static_heap_size: 1 << 20,
            collector: CollectorKind::TwoSpace,
            right_collection_delay: 8,
            tenured_threshold: 0.75,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 || self.static_heap_size == 0 {
            return Err("heap sizes must be > 0");
        }
        if self.heap_size % 8 != 0 || self.static_heap_size % 8 != 0 {
            return Err("heap sizes must be multiples of 8");
        }
        if self.max_heap_size < self.heap_size {
            return Err("max_heap_size must be >= heap_size");
        }
        if self.right_collection_delay == 0 {
            return Err("right_collection_delay must be > 0");
        }
        if !(0.0..=1.0).contains(&self.tenured_threshold) {
            return Err("tenured_threshold must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

/// Allocation failure. Both variants are unrecoverable for the caller;
/// the process driver reports them and terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Collection and growth up to the configured cap did not free
    /// enough space.
    HeapExhausted { requested: usize },
    /// The request can never fit a semispace.
    OversizedRequest { requested: usize },
}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::HeapExhausted { requested } => {
                write!(f, "heap exhausted allocating {requested} bytes")
            }
            Self::OversizedRequest { requested } => {
                write!(f, "allocation of {requested} bytes exceeds semispace capacity")
            }
        }
    }
}

/// Consumers implement this to expose additional GC roots (globals,
/// cache entries, interpreter scratch). The visitor receives
/// `&mut Value` so the collector can rewrite root pointers in place.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// A provider with no roots, for callers that hold everything through
/// handles.
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
}

/// One entry of the GC event log.
#[derive(Debug, Clone)]
pub struct HeapEvent {
    pub name: &'static str,
    pub duration: Duration,
    pub used_before: usize,
    pub used_after: usize,
    pub total: usize,
}

/// Memory-manager statistics, exposed as a read-only snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub collections_count: u32,
    pub allocations_count: u64,
    pub total_collection_delay: Duration,
    pub left_to_right_collections: u32,
    pub right_to_left_collections: u32,
    pub young_collection_delay: Duration,
    pub events: Vec<HeapEvent>,
}

struct Arena {
    base: NonNull<u8>,
    capacity: usize,
}

impl Arena {
    fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, 8)
            .expect("arena layout");
        let ptr = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        Self { base, capacity }
    }

    #[inline(always)]
    fn range(&self) -> (u64, u64) {
        let base = self.base.as_ptr() as u64;
        (base, base + self.capacity as u64)
    }

    #[inline(always)]
    fn contains(&self, addr: u64) -> bool {
        let (lo, hi) = self.range();
        addr >= lo && addr < hi
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, 8)
            .expect("arena layout");
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

/// Forwarding state for one copy pass: up to two source ranges and the
/// destination bump pointer.
struct CopyScope {
    from: [(u64, u64); 2],
    to_base: *mut u8,
    to_capacity: usize,
    top: usize,
}

impl CopyScope {
    #[inline(always)]
    fn in_from(&self, addr: u64) -> bool {
        (addr >= self.from[0].0 && addr < self.from[0].1)
            || (addr >= self.from[1].0 && addr < self.from[1].1)
    }

    /// Forward one reference: tagged values and pointers outside the
    /// source ranges pass through; already-copied objects yield their
    /// stored forwarding address; everything else is copied and marked.
    fn forward(&mut self, value: Value) -> Value {
        if !value.is_ref() || !self.in_from(value.addr()) {
            return value;
        }
        unsafe {
            let header = &mut *(value.addr() as *mut Header);
            if header.size.is_relocated() {
                return header.class;
            }
            let total = header.total_bytes();
            debug_assert!(self.top + total <= self.to_capacity, "to-space overflow");
            let dst = self.to_base.add(self.top);
            core::ptr::copy_nonoverlapping(value.addr() as *const u8, dst, total);
            let forwarded = Value::from_ptr(dst);
            header.class = forwarded;
            header.size.set_relocated();
            self.top += total;
            forwarded
        }
    }
}

/// The object memory: two equal semispaces, a monotonically growing
/// static heap, root registries, and the copying collector.
///
/// Any raw pointer into the movable heap is invalidated by every
/// allocation unless it is held through a [`HandleSet`] slot or a
/// registered root. The memory itself must not be moved while handle
/// sets or registered roots are live — owners keep it boxed.
pub struct ObjectMemory {
    config: MemoryConfig,
    spaces: [Arena; 2],
    tops: [usize; 2],
    active: usize,
    retired: Vec<Arena>,
    static_chunks: Vec<Arena>,
    static_top: usize,
    static_roots: HashSet<usize>,
    crossgen_refs: HashSet<usize>,
    pub(crate) handles_head: *mut HandleSet,
    minor_since_major: u32,
    stats: MemoryStats,
}

impl ObjectMemory {
    pub fn new(config: MemoryConfig) -> Result<Box<Self>, &'static str> {
        config.validate()?;
        let spaces = [Arena::new(config.heap_size), Arena::new(config.heap_size)];
        let static_chunks = vec![Arena::new(config.static_heap_size)];
        Ok(Box::new(Self {
            active: match config.collector {
                CollectorKind::Generational => YOUNG,
                _ => 0,
            },
            config,
            spaces,
            tops: [0, 0],
            retired: Vec::new(),
            static_chunks,
            static_top: 0,
            static_roots: HashSet::new(),
            crossgen_refs: HashSet::new(),
            handles_head: core::ptr::null_mut(),
            minor_since_major: 0,
            stats: MemoryStats::default(),
        }))
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Read-only statistics snapshot.
    pub fn snapshot(&self) -> MemoryStats {
        self.stats.clone()
    }

    pub fn used_bytes(&self) -> usize {
        self.tops[0] + self.tops[1]
    }

    pub fn semispace_capacity(&self) -> usize {
        self.spaces[0].capacity
    }

    // ── allocation ─────────────────────────────────────────────────

    /// Bump-allocate `bytes` (rounded up to 8) in the active space,
    /// collecting and growing as needed. The caller must write a valid
    /// [`Header`] and initialize every slot before the next allocation.
    pub fn allocate_raw(
        &mut self,
        bytes: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = (bytes + 7) & !7;
        self.stats.allocations_count += 1;

        if total > self.config.max_heap_size {
            return Err(AllocError::OversizedRequest { requested: total });
        }
        if let Some(ptr) = self.try_bump(total) {
            return Ok(ptr);
        }

        if self.config.collector == CollectorKind::NonCollecting {
            self.grow_non_collecting(total);
            return self
                .try_bump(total)
                .ok_or(AllocError::OversizedRequest { requested: total });
        }

        self.collect(roots);
        if let Some(ptr) = self.try_bump(total) {
            return Ok(ptr);
        }
        while self.spaces[0].capacity < self.config.max_heap_size {
            self.grow(roots);
            if let Some(ptr) = self.try_bump(total) {
                return Ok(ptr);
            }
        }
        Err(AllocError::HeapExhausted { requested: total })
    }

    /// Allocate in the static heap. Static objects never move and are
    /// never collected; the heap grows by chaining chunks.
    pub fn static_allocate(&mut self, bytes: usize) -> NonNull<u8> {
        let total = (bytes + 7) & !7;
        let fits = match self.static_chunks.last() {
            Some(chunk) => chunk.capacity - self.static_top >= total,
            None => false,
        };
        if !fits {
            let cap = self.config.static_heap_size.max(total);
            self.static_chunks.push(Arena::new(cap));
            self.static_top = 0;
        }
        let chunk = self
            .static_chunks
            .last()
            .expect("static chunk just ensured");
        let ptr = unsafe { chunk.base.as_ptr().add(self.static_top) };
        self.static_top += total;
        unsafe { NonNull::new_unchecked(ptr) }
    }

    #[inline(always)]
    fn alloc_space(&self) -> usize {
        self.active
    }

    fn try_bump(&mut self, total: usize) -> Option<NonNull<u8>> {
        let space = self.alloc_space();
        if self.spaces[space].capacity - self.tops[space] < total {
            return None;
        }
        let ptr = unsafe { self.spaces[space].base.as_ptr().add(self.tops[space]) };
        self.tops[space] += total;
        Some(unsafe { NonNull::new_unchecked(ptr) })
    }

    // ── region predicates ──────────────────────────────────────────

    pub fn is_in_static_heap(&self, addr: u64) -> bool {
        self.static_chunks.iter().any(|c| c.contains(addr))
    }

    pub fn is_in_movable_heap(&self, addr: u64) -> bool {
        self.spaces[0].contains(addr) || self.spaces[1].contains(addr)
    }

    pub fn is_in_young_heap(&self, addr: u64) -> bool {
        self.spaces[YOUNG].contains(addr)
    }

    // ── write barrier and root registration ────────────────────────

    /// The write barrier. Called on every store of `value` into `*slot`;
    /// registers `slot` when the region holding it is not scanned by the
    /// collection that scans `value`'s region. Idempotent on slot
    /// identity. Returns whether the slot was registered.
    pub fn check_root(&mut self, value: Value, slot: *mut Value) -> bool {
        if !value.is_ref() || self.config.collector == CollectorKind::NonCollecting {
            return false;
        }
        let slot_addr = slot as usize;
        if self.is_in_static_heap(slot_addr as u64) && self.is_in_movable_heap(value.addr()) {
            self.static_roots.insert(slot_addr);
            return true;
        }
        if self.config.collector == CollectorKind::Generational
            && self.spaces[TENURED].contains(slot_addr as u64)
            && self.is_in_young_heap(value.addr())
        {
            self.crossgen_refs.insert(slot_addr);
            return true;
        }
        false
    }

    pub fn add_static_root(&mut self, slot: *mut Value) {
        self.static_roots.insert(slot as usize);
    }

    pub fn remove_static_root(&mut self, slot: *mut Value) {
        self.static_roots.remove(&(slot as usize));
    }

    // ── collection ─────────────────────────────────────────────────

    /// Run one collection appropriate for the configured mode.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) {
        match self.config.collector {
            CollectorKind::NonCollecting => {}
            CollectorKind::TwoSpace => self.collect_two_space(roots),
            CollectorKind::Generational => {
                let due_major = self.minor_since_major + 1
                    >= self.config.right_collection_delay
                    || self.tenured_occupancy() > self.config.tenured_threshold;
                if due_major {
                    self.collect_major(roots);
                } else {
                    self.collect_minor(roots);
                }
            }
        }
    }

    fn tenured_occupancy(&self) -> f64 {
        self.tops[TENURED] as f64 / self.spaces[TENURED].capacity as f64
    }

    fn collect_two_space(&mut self, roots: &mut dyn RootProvider) {
        let started = Instant::now();
        let used_before = self.tops[self.active];
        let from = self.active;
        let to = 1 - from;

        let new_top = self.run_copy([self.spaces[from].range(), (0, 0)], to, 0, false, roots);
        self.tops[from] = 0;
        self.tops[to] = new_top;
        self.active = to;

        if from == TENURED {
            self.stats.left_to_right_collections += 1;
        } else {
            self.stats.right_to_left_collections += 1;
        }
        self.finish_collection("collect", started, used_before, new_top);
    }

    fn collect_minor(&mut self, roots: &mut dyn RootProvider) {
        let young_used = self.tops[YOUNG];
        if self.spaces[TENURED].capacity - self.tops[TENURED] < young_used {
            return self.collect_major(roots);
        }
        let started = Instant::now();
        let used_before = self.used_bytes();

        self.promote_young(roots);
        self.minor_since_major += 1;
        self.stats.right_to_left_collections += 1;
        self.stats.young_collection_delay += started.elapsed();
        self.finish_collection("minor collect", started, used_before, self.used_bytes());
    }

    fn collect_major(&mut self, roots: &mut dyn RootProvider) {
        // The rebuild needs the right space free; promote any live young
        // data first, or fall back to growth when tenured space is short.
        if self.tops[YOUNG] > 0 {
            if self.spaces[TENURED].capacity - self.tops[TENURED] < self.tops[YOUNG] {
                return self.grow(roots);
            }
            self.promote_young(roots);
        }
        let started = Instant::now();
        let used_before = self.used_bytes();

        let top_right =
            self.run_copy([self.spaces[TENURED].range(), (0, 0)], YOUNG, 0, false, roots);
        self.tops[TENURED] = 0;
        self.tops[YOUNG] = top_right;

        let top_left =
            self.run_copy([self.spaces[YOUNG].range(), (0, 0)], TENURED, 0, false, roots);
        self.tops[TENURED] = top_left;
        self.tops[YOUNG] = 0;

        self.crossgen_refs.clear();
        self.minor_since_major = 0;
        self.stats.left_to_right_collections += 1;
        self.finish_collection("major collect", started, used_before, self.used_bytes());
    }

    /// Copy young survivors onto the tenured bump pointer. The tenured
    /// heap itself is not scanned; the crossgen set stands in for it.
    fn promote_young(&mut self, roots: &mut dyn RootProvider) {
        let new_top = self.run_copy(
            [self.spaces[YOUNG].range(), (0, 0)],
            TENURED,
            self.tops[TENURED],
            true,
            roots,
        );
        self.tops[TENURED] = new_top;
        self.tops[YOUNG] = 0;
        self.crossgen_refs.clear();
    }

    /// Double the semispaces (capped) and rebuild the world into the new
    /// tenured/active space.
    fn grow(&mut self, roots: &mut dyn RootProvider) {
        let old_cap = self.spaces[0].capacity;
        let new_cap = (old_cap * 2).min(self.config.max_heap_size);
        if new_cap <= old_cap {
            return;
        }
        let started = Instant::now();
        let used_before = self.used_bytes();

        let old = std::mem::replace(
            &mut self.spaces,
            [Arena::new(new_cap), Arena::new(new_cap)],
        );
        let new_top = self.run_copy([old[0].range(), old[1].range()], 0, 0, false, roots);
        self.tops = [new_top, 0];
        self.active = match self.config.collector {
            CollectorKind::Generational => YOUNG,
            _ => 0,
        };
        self.crossgen_refs.clear();
        self.minor_since_major = 0;

        tracing::info!(old_cap, new_cap, "heap grown");
        self.finish_collection("grow", started, used_before, new_top);
    }

    fn grow_non_collecting(&mut self, needed: usize) {
        let old_cap = self.spaces[self.active].capacity;
        let new_cap = (old_cap * 2).max(needed);
        let old = std::mem::replace(&mut self.spaces[self.active], Arena::new(new_cap));
        self.retired.push(old);
        self.tops[self.active] = 0;
        tracing::info!(old_cap, new_cap, "non-collecting heap chunk added");
    }

    fn finish_collection(
        &mut self,
        name: &'static str,
        started: Instant,
        used_before: usize,
        used_after: usize,
    ) {
        let duration = started.elapsed();
        self.stats.collections_count += 1;
        self.stats.total_collection_delay += duration;
        self.stats.events.push(HeapEvent {
            name,
            duration,
            used_before,
            used_after,
            total: self.spaces[0].capacity + self.spaces[1].capacity,
        });
        tracing::debug!(
            name,
            ?duration,
            used_before,
            used_after,
            "collection finished"
        );
    }

    /// One Cheney pass: forward every root slot, then scan the copied
    /// region until the work pointer meets the allocation pointer.
    ///
    /// Root sources, in order: the handle-set list, the static-root set,
    /// the crossgen set (young collections only), then the caller's
    /// provider.
    fn run_copy(
        &mut self,
        from: [(u64, u64); 2],
        to: usize,
        to_start: usize,
        include_crossgen: bool,
        roots: &mut dyn RootProvider,
    ) -> usize {
        let to_base = self.spaces[to].base.as_ptr();
        let mut scope = CopyScope {
            from,
            to_base,
            to_capacity: self.spaces[to].capacity,
            top: to_start,
        };

        {
            let mut visit = |slot: &mut Value| {
                *slot = scope.forward(*slot);
            };

            let mut set_ptr = self.handles_head;
            while !set_ptr.is_null() {
                let set = unsafe { &*set_ptr };
                set.visit_roots(&mut visit);
                set_ptr = set.next.get();
            }

            for &slot_addr in self.static_roots.iter() {
                visit(unsafe { &mut *(slot_addr as *mut Value) });
            }

            if include_crossgen {
                for &slot_addr in self.crossgen_refs.iter() {
                    visit(unsafe { &mut *(slot_addr as *mut Value) });
                }
            }

            roots.visit_roots(&mut visit);
        }

        let mut scan = to_start;
        while scan < scope.top {
            unsafe {
                let header = &mut *(to_base.add(scan) as *mut Header);
                let total = header.total_bytes();
                header.class = scope.forward(header.class);
                if !header.size.is_binary() {
                    let fields = to_base.add(scan + HEADER_BYTES) as *mut Value;
                    for i in 0..header.slot_count() {
                        let field = &mut *fields.add(i);
                        *field = scope.forward(*field);
                    }
                }
                scan += total;
            }
        }
        scope.top
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{allocation_size, RawObject};

    fn small_config(collector: CollectorKind) -> MemoryConfig {
        MemoryConfig {
            heap_size: 1024,
            max_heap_size: 1024,
            static_heap_size: 1024,
            collector,
            right_collection_delay: 3,
            tenured_threshold: 0.75,
        }
    }

    /// Allocate a slot object with `slots` fields, each filled with
    /// `fill`, and `class` pinned across the allocation.
    fn alloc_object(
        memory: &mut ObjectMemory,
        class: Value,
        slots: usize,
        fill: Value,
    ) -> Value {
        let hs = HandleSet::new(memory);
        let class_h = hs.pin_value::<RawObject>(class);
        let payload = slots * core::mem::size_of::<Value>();
        let ptr = memory
            .allocate_raw(allocation_size(payload), &mut NoRoots)
            .expect("allocation");
        unsafe {
            let header = ptr.as_ptr() as *mut Header;
            header.write(Header::new(payload, false, class_h.value()));
            let fields = ptr.as_ptr().add(HEADER_BYTES) as *mut Value;
            for i in 0..slots {
                fields.add(i).write(fill);
            }
        }
        Value::from_ptr(ptr.as_ptr())
    }

    fn alloc_static_object(memory: &mut ObjectMemory, slots: usize) -> Value {
        let payload = slots * core::mem::size_of::<Value>();
        let ptr = memory.static_allocate(allocation_size(payload));
        unsafe {
            let header = ptr.as_ptr() as *mut Header;
            header.write(Header::new(payload, false, Value::from_int(0)));
            let fields = ptr.as_ptr().add(HEADER_BYTES) as *mut Value;
            for i in 0..slots {
                fields.add(i).write(Value::from_int(0));
            }
        }
        Value::from_ptr(ptr.as_ptr())
    }

    #[test]
    fn handles_survive_repeated_collections() {
        // 1 KiB semispaces, 100 objects of 64 bytes total each, every
        // tenth held through a handle.
        let mut memory = ObjectMemory::new(small_config(CollectorKind::TwoSpace))
            .expect("config");
        let hs = HandleSet::new(&mut memory);

        let class = alloc_object(&mut memory, Value::from_int(0), 6, Value::from_int(7));
        let class_h = hs.pin_value::<RawObject>(class);

        let mut held = Vec::new();
        for i in 0..100 {
            let obj = alloc_object(
                &mut memory,
                class_h.value(),
                6,
                Value::from_int(i),
            );
            if i % 10 == 0 {
                held.push((i, hs.pin_value::<RawObject>(obj)));
            }
        }

        let stats = memory.snapshot();
        assert!(stats.collections_count >= 1, "expected at least one collection");
        assert_eq!(stats.allocations_count, 101);

        for (i, handle) in held {
            assert_eq!(unsafe { handle.field_at(0).to_int() }, i);
            let class_now = unsafe { handle.value().as_ref::<RawObject>() }.header.class;
            assert_eq!(class_now, class_h.value(), "class pointer must follow the class");
            assert_eq!(unsafe { class_h.field_at(0).to_int() }, 7);
        }
    }

    #[test]
    fn static_root_slot_is_forwarded_across_collection() {
        let mut memory = ObjectMemory::new(small_config(CollectorKind::TwoSpace))
            .expect("config");
        let hs = HandleSet::new(&mut memory);

        let holder = alloc_static_object(&mut memory, 1);
        let young = alloc_object(&mut memory, Value::from_int(0), 2, Value::from_int(99));
        let young_h = hs.pin_value::<RawObject>(young);

        let slot = unsafe { (&mut *holder.as_ptr::<RawObject>()).field_slot(0) };
        unsafe { *slot = young_h.value() };
        assert!(memory.check_root(young_h.value(), slot));
        // A second registration of the same slot is a no-op.
        memory.check_root(young_h.value(), slot);

        let before = young_h.value();
        memory.collect(&mut NoRoots);

        let after = unsafe { holder.as_ref::<RawObject>() }.field_at(0);
        assert_ne!(after, before, "object should have moved");
        assert_eq!(after, young_h.value(), "slot must track the forwarded object");
        assert_eq!(unsafe { after.as_ref::<RawObject>().field_at(0).to_int() }, 99);
    }

    #[test]
    fn heap_grows_up_to_the_cap_then_fails() {
        let mut config = small_config(CollectorKind::TwoSpace);
        config.max_heap_size = 4096;
        let mut memory = ObjectMemory::new(config).expect("config");
        let hs = HandleSet::new(&mut memory);

        // 40 live objects * 64 bytes = 2560 bytes: more than one 1 KiB
        // semispace, less than the 4 KiB cap.
        let mut handles = Vec::new();
        for i in 0..40 {
            let obj = alloc_object(&mut memory, Value::from_int(0), 6, Value::from_int(i));
            handles.push(hs.pin_value::<RawObject>(obj));
        }
        assert!(memory.semispace_capacity() > 1024);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(unsafe { handle.field_at(0).to_int() }, i as i32);
        }

        // Another 40 live objects exceed the cap.
        let mut result = Ok(());
        for i in 0..40 {
            let payload = 6 * core::mem::size_of::<Value>();
            match memory.allocate_raw(allocation_size(payload), &mut NoRoots) {
                Ok(ptr) => unsafe {
                    (ptr.as_ptr() as *mut Header)
                        .write(Header::new(payload, false, Value::from_int(0)));
                    let fields = ptr.as_ptr().add(HEADER_BYTES) as *mut Value;
                    for s in 0..6 {
                        fields.add(s).write(Value::from_int(i));
                    }
                    handles.push(hs.pin_value::<RawObject>(Value::from_ptr(ptr.as_ptr())));
                },
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        assert!(matches!(result, Err(AllocError::HeapExhausted { .. })));
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let mut memory = ObjectMemory::new(small_config(CollectorKind::TwoSpace))
            .expect("config");
        let err = memory.allocate_raw(1 << 20, &mut NoRoots);
        assert!(matches!(err, Err(AllocError::OversizedRequest { .. })));
    }

    #[test]
    fn generational_minor_and_major_collections() {
        let mut config = small_config(CollectorKind::Generational);
        config.heap_size = 2048;
        config.max_heap_size = 2048;
        config.right_collection_delay = 2;
        let mut memory = ObjectMemory::new(config).expect("config");
        let hs = HandleSet::new(&mut memory);

        let keeper = alloc_object(&mut memory, Value::from_int(0), 2, Value::from_int(1));
        let keeper_h = hs.pin_value::<RawObject>(keeper);

        // Churn garbage; survivors are promoted, then a full collection
        // runs after right_collection_delay young collections.
        for i in 0..200 {
            alloc_object(&mut memory, Value::from_int(0), 6, Value::from_int(i));
        }

        let stats = memory.snapshot();
        assert!(stats.right_to_left_collections >= 1, "expected young collections");
        assert!(stats.left_to_right_collections >= 1, "expected a full collection");
        assert_eq!(unsafe { keeper_h.field_at(0).to_int() }, 1);
    }

    #[test]
    fn crossgen_reference_keeps_young_object_alive() {
        let mut config = small_config(CollectorKind::Generational);
        config.heap_size = 2048;
        config.max_heap_size = 2048;
        config.right_collection_delay = 100;
        let mut memory = ObjectMemory::new(config).expect("config");
        let hs = HandleSet::new(&mut memory);

        // Promote one object into the tenured space.
        let old = alloc_object(&mut memory, Value::from_int(0), 2, Value::from_int(5));
        let old_h = hs.pin_value::<RawObject>(old);
        memory.collect(&mut NoRoots);
        assert!(!memory.is_in_young_heap(old_h.value().addr()));

        // Store a fresh young object into the tenured one; only the
        // crossgen set keeps it reachable during the next young collection.
        let fresh = alloc_object(&mut memory, Value::from_int(0), 2, Value::from_int(6));
        let slot = old_h.field_slot(0);
        unsafe { *slot = fresh };
        assert!(memory.check_root(fresh, slot));

        memory.collect(&mut NoRoots);
        let promoted = old_h.field_at(0);
        assert!(promoted.is_ref());
        assert!(!memory.is_in_young_heap(promoted.addr()));
        assert_eq!(unsafe { promoted.as_ref::<RawObject>().field_at(0).to_int() }, 6);
    }

    #[test]
    fn non_collecting_mode_never_collects() {
        let mut memory = ObjectMemory::new(small_config(CollectorKind::NonCollecting))
            .expect("config");
        let mut values = Vec::new();
        for i in 0..100 {
            values.push(alloc_object(
                &mut memory,
                Value::from_int(0),
                6,
                Value::from_int(i),
            ));
        }
        assert_eq!(memory.snapshot().collections_count, 0);
        for (i, v) in values.iter().enumerate() {
            assert_eq!(unsafe { v.as_ref::<RawObject>().field_at(0).to_int() }, i as i32);
        }
    }

    #[test]
    fn handle_overflow_slots_are_visited() {
        let mut memory = ObjectMemory::new(small_config(CollectorKind::TwoSpace))
            .expect("config");
        let hs = HandleSet::new(&mut memory);

        for i in 0..crate::HANDLE_SET_CAPACITY {
            let _ = hs.pin_value::<RawObject>(Value::from_int(i as i32));
        }
        let obj = alloc_object(&mut memory, Value::from_int(0), 2, Value::from_int(13));
        let overflow = hs.pin_value::<RawObject>(obj);
        let before = overflow.value();

        memory.collect(&mut NoRoots);

        assert_ne!(overflow.value(), before, "overflow slot should be rewritten");
        assert_eq!(unsafe { overflow.field_at(0).to_int() }, 13);
    }
}
