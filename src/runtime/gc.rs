/// Garbage collectors
///
/// Pluggable strategies over the next-fit heap:
///   ZERO       bump until OOM, never collects
///   MARK_SWEEP mark from roots, then linear sweep to tag-0 chunks
///   LISP2      3-pass compactor: forwarding addresses in the mark
///              word, reference update, slide
///   THREADED   Jonkers' compactor threading references through the
///              size word, two passes, no extra per-object state
///   COMPRESSOR bitmap marking + per-256-bit-block offset vector,
///              one relocate-and-update pass
///   SEMISPACE  Cheney copy into the other half, forwarding pointers
///              in the mark word
///
/// Allocation failure collects and retries once, then aborts. All
/// sizes are 16-byte aligned. Per-phase wall-clock totals are kept in
/// `GcStats` and dumped on teardown when requested.

use super::alloc::NextFitAllocator;
use super::marker::{BitmapMarker, MarkerEdgeFifo, MarkerFifo, MarkerKind, MarkerLifo, BITS_IN_BLOCK, BYTES_PER_BIT};
use super::object::{align_size, Address, ObjectLayout, StringLayout, MARK_UNSET, UNUSED_TAG};
use super::stack::StackWalker;
use std::collections::HashSet;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Allocate,
    Mark,
    Collect,
}

const PHASE_NAMES: [&str; 3] = ["ALLOCATE", "MARK    ", "COLLECT "];

#[derive(Debug, Default)]
pub struct GcStats {
    phases: [Duration; 3],
    pub collections: u64,
}

impl GcStats {
    pub fn add(&mut self, phase: GcPhase, elapsed: Duration) {
        self.phases[phase as usize] += elapsed;
    }

    pub fn phase(&self, phase: GcPhase) -> Duration {
        self.phases[phase as usize]
    }

    pub fn dump(&self) {
        for (name, duration) in PHASE_NAMES.iter().zip(self.phases.iter()) {
            eprintln!("GC Phase {}: {} ms", name, duration.as_millis());
        }
    }
}

// ---------------------------------------------------------------------------
// Algorithm selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcType {
    Zero = 0,
    MarkSweep = 1,
    ThreadedMc = 2,
    Compressor = 3,
    SemispaceCopy = 4,
    Lisp2Mc = 5,
}

impl GcType {
    pub fn from_i32(value: i32) -> Option<GcType> {
        Some(match value {
            0 => GcType::Zero,
            1 => GcType::MarkSweep,
            2 => GcType::ThreadedMc,
            3 => GcType::Compressor,
            4 => GcType::SemispaceCopy,
            5 => GcType::Lisp2Mc,
            _ => return None,
        })
    }
}

/// Visit every pointer-holding field slot, with the trivial-type fast
/// path (a String's only reference is its length object).
///
/// # Safety
/// `obj` must be a live, well-formed object.
unsafe fn for_each_field_slot(obj: *mut ObjectLayout, mut f: impl FnMut(*mut Address)) {
    if (*obj).has_special_type() {
        if (*obj).is_string() {
            let length_slot =
                &mut (*(obj as *mut StringLayout)).length as *mut *mut _ as *mut Address;
            f(length_slot);
        }
        return;
    }
    let fields = (*obj).fields_base();
    for i in 0..(*obj).field_cnt() {
        f(fields.add(i));
    }
}

// ---------------------------------------------------------------------------
// The GC
// ---------------------------------------------------------------------------

pub struct Gc {
    algo: GcType,
    allocator: NextFitAllocator,
    marker: Option<MarkerKind>,
    walker: Box<dyn StackWalker + Send>,
    /// Slots the runtime helpers protect across their own allocations.
    runtime_roots: Vec<*mut Address>,
    pub stats: GcStats,
    trace_cycles: bool,
}

unsafe impl Send for Gc {}

impl Gc {
    pub fn new(algo: GcType, heap_size: usize, walker: Box<dyn StackWalker + Send>) -> Gc {
        let allocator = match algo {
            GcType::SemispaceCopy => NextFitAllocator::new_semispace(heap_size),
            _ => NextFitAllocator::new(heap_size),
        };

        let marker = match algo {
            GcType::Zero | GcType::SemispaceCopy => None,
            GcType::MarkSweep | GcType::ThreadedMc => Some(MarkerKind::Fifo(MarkerFifo::default())),
            GcType::Lisp2Mc => Some(MarkerKind::Lifo(MarkerLifo::default())),
            GcType::Compressor => Some(MarkerKind::Bitmap(BitmapMarker::new(
                allocator.start(),
                allocator.end(),
            ))),
        };

        Gc {
            algo,
            allocator,
            marker,
            walker,
            runtime_roots: Vec::new(),
            stats: GcStats::default(),
            trace_cycles: false,
        }
    }

    /// Swap in a different marking discipline (LIFO / FIFO / edge-FIFO
    /// experiments on the tracing collectors).
    pub fn set_marker(&mut self, marker: MarkerKind) {
        self.marker = Some(marker);
    }

    pub fn edge_fifo_marker() -> MarkerKind {
        MarkerKind::EdgeFifo(MarkerEdgeFifo::default())
    }

    pub fn set_trace_cycles(&mut self, trace: bool) {
        self.trace_cycles = trace;
    }

    pub fn algo(&self) -> GcType {
        self.algo
    }

    pub fn allocator(&self) -> &NextFitAllocator {
        &self.allocator
    }

    pub fn walker_mut(&mut self) -> &mut (dyn StackWalker + Send) {
        &mut *self.walker
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Collects and retries once on exhaustion, then aborts the
    /// process.
    pub fn allocate(&mut self, tag: i32, size: usize, disp_tab: *const u8) -> *mut ObjectLayout {
        let size = align_size(size);

        let started = Instant::now();
        let mut object = self.allocator.allocate(tag, size, disp_tab);
        self.stats.add(GcPhase::Allocate, started.elapsed());

        if object.is_null() {
            if self.trace_cycles {
                eprintln!("GC Collect was invoked!");
            }
            self.collect();

            let started = Instant::now();
            object = self.allocator.allocate(tag, size, disp_tab);
            self.stats.add(GcPhase::Allocate, started.elapsed());
        }

        if object.is_null() {
            exit_with_error("cannot allocate memory for object!");
        }
        object
    }

    /// Clone the object held in `root_slot`. The slot is re-read after
    /// the allocation because a moving collection may have rewritten
    /// it.
    pub fn copy(&mut self, root_slot: *mut Address) -> *mut ObjectLayout {
        unsafe {
            let template = *root_slot as *mut ObjectLayout;
            let new_obj =
                self.allocate((*template).tag, (*template).size, (*template).dispatch_table);

            let template = *root_slot as *mut ObjectLayout;
            let payload = (*template).size.min((*new_obj).size) - super::object::HEADER_SIZE;
            std::ptr::copy_nonoverlapping(
                (*template).fields_base() as Address,
                (*new_obj).fields_base() as Address,
                payload,
            );
            new_obj
        }
    }

    pub fn add_runtime_root(&mut self, root: *mut Address) {
        self.runtime_roots.push(root);
    }

    pub fn clean_runtime_roots(&mut self) {
        self.runtime_roots.clear();
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    pub fn collect(&mut self) {
        self.stats.collections += 1;

        match self.algo {
            GcType::Zero => {}
            GcType::MarkSweep => {
                self.mark_phase(false);
                let started = Instant::now();
                self.sweep();
                self.stats.add(GcPhase::Collect, started.elapsed());
            }
            GcType::Lisp2Mc => {
                self.mark_phase(true);
                let started = Instant::now();
                self.lisp2_compact();
                self.walker.fix_derived_pointers();
                self.stats.add(GcPhase::Collect, started.elapsed());
            }
            GcType::ThreadedMc => {
                self.mark_phase(true);
                let started = Instant::now();
                self.threaded_compact();
                self.walker.fix_derived_pointers();
                self.stats.add(GcPhase::Collect, started.elapsed());
            }
            GcType::Compressor => {
                self.mark_phase(true);
                let started = Instant::now();
                self.compressor_compact();
                self.walker.fix_derived_pointers();
                self.stats.add(GcPhase::Collect, started.elapsed());
            }
            GcType::SemispaceCopy => {
                let started = Instant::now();
                self.semispace_copy();
                self.walker.fix_derived_pointers();
                self.stats.add(GcPhase::Collect, started.elapsed());
            }
        }
    }

    /// Visit every root slot: the mutator stack first, then the
    /// runtime-helper roots.
    fn process_all_roots(
        walker: &mut (dyn StackWalker + Send),
        runtime_roots: &[*mut Address],
        visitor: &mut dyn FnMut(*mut Address),
        record_derived: bool,
    ) {
        walker.process_roots(&mut *visitor, record_derived);
        for &root in runtime_roots {
            visitor(root);
        }
    }

    fn mark_phase(&mut self, record_derived: bool) {
        let started = Instant::now();
        let Gc { marker, walker, runtime_roots, .. } = self;
        let marker = marker.as_mut().expect("tracing collector without a marker");

        Self::process_all_roots(
            &mut **walker,
            runtime_roots,
            &mut |root| marker.mark_root(root),
            record_derived,
        );
        self.stats.add(GcPhase::Mark, started.elapsed());
    }

    // -----------------------------------------------------------------------
    // Mark-sweep
    // -----------------------------------------------------------------------

    fn sweep(&mut self) {
        let mut scan = self.allocator.start();
        let end = self.allocator.end();

        unsafe {
            while scan < end {
                let obj = scan as *mut ObjectLayout;
                let size = (*obj).size;
                if (*obj).tag != UNUSED_TAG {
                    if (*obj).is_marked() {
                        (*obj).unset_marked();
                    } else {
                        self.allocator.free(obj);
                    }
                }
                scan = scan.add(size);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lisp2 mark-compact
    // -----------------------------------------------------------------------

    fn lisp2_compact(&mut self) {
        self.lisp2_compute_locations();
        self.lisp2_update_references();
        self.lisp2_relocate();
    }

    /// Pass 1: forwarding address of every marked object goes into
    /// its mark word.
    fn lisp2_compute_locations(&mut self) {
        let start = self.allocator.start();
        let end = self.allocator.end();
        let mut free = start;
        let mut scan = self.allocator.next_object(start);

        unsafe {
            while scan < end {
                let obj = scan as *mut ObjectLayout;
                if (*obj).is_marked() {
                    (*obj).mark = free as usize;
                    free = free.add((*obj).size);
                }
                scan = self.allocator.next_object(scan.add((*obj).size));
            }
        }
    }

    /// Pass 2: every root and every live field chases its target's
    /// forwarding address.
    fn lisp2_update_references(&mut self) {
        let Gc { allocator, walker, runtime_roots, .. } = self;

        let forward = |slot: *mut Address| unsafe {
            let target = *slot;
            if !target.is_null() && allocator.is_heap_addr(target) {
                *slot = (*(target as *mut ObjectLayout)).mark as Address;
            }
        };

        Self::process_all_roots(&mut **walker, runtime_roots, &mut |root| forward(root), false);

        let end = allocator.end();
        let mut scan = allocator.next_object(allocator.start());
        unsafe {
            while scan < end {
                let obj = scan as *mut ObjectLayout;
                if (*obj).is_marked() {
                    for_each_field_slot(obj, forward);
                }
                scan = allocator.next_object(scan.add((*obj).size));
            }
        }
    }

    /// Pass 3: slide every marked object to its forwarding address in
    /// address order.
    fn lisp2_relocate(&mut self) {
        let start = self.allocator.start();
        let end = self.allocator.end();
        let mut free = start;
        let mut scan = self.allocator.next_object(start);

        unsafe {
            while scan < end {
                let obj = scan as *mut ObjectLayout;
                let size = (*obj).size;
                if (*obj).is_marked() {
                    let dest = (*obj).mark as Address;
                    (*obj).unset_marked();
                    self.allocator.move_object(obj, dest);
                    free = dest.add(size);
                }
                scan = self.allocator.next_object(scan.add(size));
            }
        }
        self.allocator.force_alloc_pos(free);
    }

    // -----------------------------------------------------------------------
    // Jonkers' threaded compactor
    // -----------------------------------------------------------------------

    /// Chain `ref_slot` into the threaded reference list of the object
    /// it points to, using the size word as the list head.
    unsafe fn thread(allocator: &NextFitAllocator, ref_slot: *mut Address) {
        let obj = *ref_slot;
        if !obj.is_null() && allocator.is_heap_addr(obj) {
            let hdr = obj as *mut ObjectLayout;
            let size = (*hdr).size;
            (*hdr).size = ref_slot as usize;
            *ref_slot = size as Address;
        }
    }

    /// Unthread every reference to `obj`, rewriting each to `addr`,
    /// and restore the original size word. `slot_range` bounds the
    /// root slots seen while threading; anything in the heap or that
    /// range is a chained slot rather than the original size.
    unsafe fn unthread(
        allocator: &NextFitAllocator,
        obj: *mut ObjectLayout,
        addr: Address,
        slot_range: (usize, usize),
    ) {
        let mut temp = (*obj).size;
        while allocator.is_heap_addr(temp as Address)
            || (temp >= slot_range.0 && temp <= slot_range.1 && temp != 0)
        {
            let slot = temp as *mut Address;
            let next = *slot;
            *slot = addr;
            temp = next as usize;
        }
        (*obj).size = temp;
    }

    fn threaded_compact(&mut self) {
        let mut slot_min = usize::MAX;
        let mut slot_max = 0usize;

        // pass 1: thread the roots, then every forward reference
        {
            let Gc { allocator, walker, runtime_roots, .. } = self;
            Self::process_all_roots(
                &mut **walker,
                runtime_roots,
                &mut |root| {
                    slot_min = slot_min.min(root as usize);
                    slot_max = slot_max.max(root as usize);
                    unsafe { Self::thread(allocator, root) };
                },
                false,
            );
        }
        let slot_range = (slot_min, slot_max);

        let start = self.allocator.start();
        let end = self.allocator.end();

        unsafe {
            let mut free = start;
            let mut scan = self.allocator.next_object(start);
            while scan < end {
                let obj = scan as *mut ObjectLayout;
                let mut size = (*obj).size;
                if (*obj).is_marked() {
                    // forward references to this object point at
                    // addresses not yet compacted
                    Self::unthread(&self.allocator, obj, free, slot_range);
                    // a self-referencing field threads through the
                    // size word, so it is read first
                    size = (*obj).size;
                    for_each_field_slot(obj, |slot| Self::thread(&self.allocator, slot));
                    free = free.add(size);
                }
                scan = self.allocator.next_object(scan.add(size));
            }

            // pass 2: backward references, then relocate
            let mut free = start;
            let mut scan = self.allocator.next_object(start);
            while scan < end {
                let obj = scan as *mut ObjectLayout;
                if (*obj).is_marked() {
                    Self::unthread(&self.allocator, obj, free, slot_range);
                    (*obj).unset_marked();
                    let size = (*obj).size;
                    self.allocator.move_object(obj, free);
                    free = free.add(size);
                    scan = self.allocator.next_object(scan.add(size));
                } else {
                    scan = self.allocator.next_object(scan.add((*obj).size));
                }
            }

            self.allocator.force_alloc_pos(free);
        }
    }

    // -----------------------------------------------------------------------
    // Compressor-style bitmap compaction
    // -----------------------------------------------------------------------

    fn compressor_compact(&mut self) {
        let start = self.allocator.start();
        let end = self.allocator.end();

        // the bitmap is moved out so the allocator can be borrowed
        // mutably while relocating
        let mut marker = self.marker.take().expect("bitmap marker");
        let bitmap = marker.bitmap().expect("bitmap marker");

        // 1. one pass over the mark bitmap produces the offset vector
        let bits = bitmap.bits_num();
        let blocks = bits / BITS_IN_BLOCK + 1;
        let mut offsets = vec![0usize; blocks];
        let mut total_live = 0usize;
        for block in 0..blocks {
            offsets[block] = total_live;
            let from = block * BITS_IN_BLOCK;
            let to = ((block + 1) * BITS_IN_BLOCK).min(bits);
            total_live += bitmap.count_bits(from, to) * BYTES_PER_BIT;
        }

        let new_address = |old: Address| -> Address {
            let bit = bitmap.byte_to_bit(old);
            let block = bit / BITS_IN_BLOCK;
            let in_block = bitmap.count_bits(block * BITS_IN_BLOCK, bit) * BYTES_PER_BIT;
            bitmap.heap_start().wrapping_add(offsets[block] + in_block)
        };

        // 2. update the roots once per slot; the visitor can see a
        //    slot twice and the rewrite is destructive
        {
            let Gc { allocator, walker, runtime_roots, .. } = self;
            let mut was_updated: HashSet<usize> = HashSet::new();
            Self::process_all_roots(
                &mut **walker,
                runtime_roots,
                &mut |root| unsafe {
                    if !was_updated.insert(root as usize) {
                        return;
                    }
                    let target = *root;
                    if !target.is_null() && allocator.is_heap_addr(target) {
                        *root = new_address(target);
                    }
                },
                false,
            );
        }

        // 3. relocate in address order, updating fields on the way
        unsafe {
            let mut scan = self.allocator.next_object(start);
            while scan < end {
                let obj = scan as *mut ObjectLayout;
                let size = (*obj).size;
                if bitmap.is_bit_set(bitmap.byte_to_bit(scan)) {
                    let allocator = &self.allocator;
                    for_each_field_slot(obj, |slot| {
                        let child = *slot;
                        if !child.is_null() && allocator.is_heap_addr(child) {
                            *slot = new_address(child);
                        }
                    });
                    let dest = new_address(scan);
                    self.allocator.move_object(obj, dest);
                }
                scan = self.allocator.next_object(scan.add(size));
            }

            self.allocator.force_alloc_pos(start.add(total_live));
        }

        marker.clear();
        self.marker = Some(marker);
    }

    // -----------------------------------------------------------------------
    // Semispace copy
    // -----------------------------------------------------------------------

    /// Copy an object on first contact, leaving a forwarding pointer
    /// in its from-space mark word.
    unsafe fn evacuate(obj: *mut ObjectLayout, free: &mut Address) -> Address {
        if (*obj).mark != MARK_UNSET {
            return (*obj).mark as Address;
        }
        let size = (*obj).size;
        let dest = *free;
        std::ptr::copy_nonoverlapping(obj as Address, dest, size);
        (*(dest as *mut ObjectLayout)).mark = MARK_UNSET;
        (*obj).mark = dest as usize;
        *free = free.add(size);
        dest
    }

    fn semispace_copy(&mut self) {
        self.allocator.flip();

        let to_start = self.allocator.start();
        let mut free = to_start;

        let Gc { allocator, walker, runtime_roots, .. } = self;
        let from_start = allocator.fromspace();
        let from_end = unsafe { from_start.add(allocator.semispace_extend()) };
        let in_fromspace = |addr: Address| addr >= from_start && addr < from_end;

        Self::process_all_roots(
            &mut **walker,
            runtime_roots,
            &mut |root| unsafe {
                let target = *root;
                if !target.is_null() && in_fromspace(target) {
                    *root = Self::evacuate(target as *mut ObjectLayout, &mut free);
                }
            },
            true,
        );

        // Cheney scan of the copied prefix
        unsafe {
            let mut scan = to_start;
            while scan < free {
                let obj = scan as *mut ObjectLayout;
                for_each_field_slot(obj, |slot| {
                    let child = *slot;
                    if !child.is_null() && in_fromspace(child) {
                        *slot = Self::evacuate(child as *mut ObjectLayout, &mut free);
                    }
                });
                scan = scan.add((*obj).size);
            }
        }

        self.allocator.force_alloc_pos(free);
    }

    // -----------------------------------------------------------------------
    // Heap verification
    // -----------------------------------------------------------------------

    /// The walkability invariant: stepping from `start` by object size
    /// lands exactly on `end`, every size is positive and 16-byte
    /// aligned.
    pub fn verify_heap(&self) -> Result<(), String> {
        let mut scan = self.allocator.start();
        let end = self.allocator.end();

        unsafe {
            while scan < end {
                let obj = scan as *const ObjectLayout;
                let size = (*obj).size;
                if size == 0 {
                    return Err(format!("zero-sized object at {:p}", obj));
                }
                if !super::object::is_aligned(size) && (*obj).tag != UNUSED_TAG {
                    return Err(format!("misaligned object at {:p} (size {})", obj, size));
                }
                scan = scan.wrapping_add(size);
            }
        }
        if scan == end {
            Ok(())
        } else {
            Err("heap walk overshot the end".to_string())
        }
    }
}

pub fn exit_with_error(message: &str) -> ! {
    eprintln!("\n{}", message);
    std::process::exit(255);
}
