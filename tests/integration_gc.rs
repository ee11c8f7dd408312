/// Integration tests for the runtime: allocators, markers, the
/// collector strategies, stack walking and flag parsing.
///
/// These tests verify:
///   • Next-fit allocation, coalescing, and the walkability invariant
///   • Mark-sweep reclaims transient garbage under heap pressure
///   • Every compactor preserves object graphs and updates roots
///   • Semispace copying flips spaces and evacuates reachable objects
///   • LIFO / FIFO / edge-FIFO markers mark the same set, twice
///   • LLVM StackMaps v3 parsing, including derived-pointer pairs
///   • Runtime flag parsing (`+Flag`, `GCAlgo=`, `MaxHeapSize=`)
use coolc::runtime::gc::{Gc, GcType};
use coolc::runtime::marker::{MarkerEdgeFifo, MarkerFifo, MarkerLifo};
use coolc::runtime::object::{
    Address, IntLayout, ObjectLayout, SpecialTags, HEADER_SIZE, WORD_SIZE,
};
use coolc::runtime::stack::{LocInfo, ShadowStackWalker, StackMap, StackRecord, DwarfReg};
use coolc::runtime::{str_to_size, RuntimeFlags};

// ─── Helpers ──────────────────────────────────────────────────────────────────

// the trivial-class tags every test agrees on
const INT_TAG: i32 = 3;
const BOOL_TAG: i32 = 4;
const STRING_TAG: i32 = 5;
const PLAIN_TAG: i32 = 10;

fn new_gc(algo: GcType, heap_size: usize) -> Gc {
    SpecialTags::set(INT_TAG, BOOL_TAG, STRING_TAG);
    Gc::new(algo, heap_size, Box::new(ShadowStackWalker))
}

fn alloc_plain(gc: &mut Gc, tag: i32, fields: usize) -> *mut ObjectLayout {
    gc.allocate(tag, HEADER_SIZE + fields * WORD_SIZE, std::ptr::null())
}

unsafe fn set_field(obj: *mut ObjectLayout, index: usize, value: *mut ObjectLayout) {
    *(*obj).fields_base().add(index) = value as Address;
}

unsafe fn get_field(obj: *mut ObjectLayout, index: usize) -> *mut ObjectLayout {
    *(*obj).fields_base().add(index) as *mut ObjectLayout
}

// ─── Next-fit allocation ──────────────────────────────────────────────────────

#[test]
fn test_fresh_heap_is_one_free_chunk() {
    let gc = new_gc(GcType::Zero, 4096);
    gc.verify_heap().expect("walkable");

    let first = gc.allocator().start() as *const ObjectLayout;
    unsafe {
        assert_eq!((*first).tag, 0);
        assert_eq!((*first).size, 4096);
    }
}

#[test]
fn test_allocation_is_walkable_and_sized() {
    let mut gc = new_gc(GcType::Zero, 4096);

    let a = alloc_plain(&mut gc, PLAIN_TAG, 2);
    let b = alloc_plain(&mut gc, PLAIN_TAG + 1, 0);
    unsafe {
        assert_eq!((*a).tag, PLAIN_TAG);
        assert_eq!((*a).field_cnt(), 2);
        assert!((*b).size >= HEADER_SIZE);
        assert!((b as Address) > (a as Address));
    }
    gc.verify_heap().expect("walkable after allocations");
}

#[test]
fn test_heap_exactly_one_object_large() {
    // first `new` succeeds, the second collects; since the first is
    // dead it succeeds too
    let mut gc = new_gc(GcType::MarkSweep, HEADER_SIZE + WORD_SIZE);

    let first = alloc_plain(&mut gc, PLAIN_TAG, 1);
    assert!(!first.is_null());

    let second = alloc_plain(&mut gc, PLAIN_TAG, 1);
    assert!(!second.is_null());
    assert_eq!(gc.stats.collections, 1);
    assert_eq!(first, second, "the only slot was recycled");
    gc.verify_heap().expect("walkable");
}

// ─── Mark-sweep ───────────────────────────────────────────────────────────────

#[test]
fn test_mark_sweep_reclaims_transients() {
    // ten thousand transient objects through a 1Kb heap
    let mut gc = new_gc(GcType::MarkSweep, str_to_size("1Kb"));

    let mut frame = StackRecord::new();
    let keeper = alloc_plain(&mut gc, PLAIN_TAG, 1);
    let slot = frame.reg_root(keeper as Address);

    for _ in 0..10_000 {
        let _transient = alloc_plain(&mut gc, PLAIN_TAG + 1, 2);
    }

    assert!(gc.stats.collections > 0);
    let keeper = frame.root(slot) as *mut ObjectLayout;
    unsafe {
        assert_eq!((*keeper).tag, PLAIN_TAG, "the rooted object survived");
    }
    gc.verify_heap().expect("walkable after pressure");
}

#[test]
fn test_mark_sweep_keeps_reachable_graph() {
    let mut gc = new_gc(GcType::MarkSweep, 2048);

    let mut frame = StackRecord::new();
    let a = alloc_plain(&mut gc, PLAIN_TAG, 1);
    let b = alloc_plain(&mut gc, PLAIN_TAG + 1, 1);
    let c = alloc_plain(&mut gc, PLAIN_TAG + 2, 0);
    unsafe {
        set_field(a, 0, b);
        set_field(b, 0, c);
    }
    let slot = frame.reg_root(a as Address);

    gc.collect();

    let a = frame.root(slot) as *mut ObjectLayout;
    unsafe {
        // mark-sweep never moves; the graph survives with marks
        // cleared and tags intact
        assert!(!(*a).is_marked());
        let b = get_field(a, 0);
        let c = get_field(b, 0);
        assert_eq!((*a).tag, PLAIN_TAG);
        assert_eq!((*b).tag, PLAIN_TAG + 1);
        assert_eq!((*c).tag, PLAIN_TAG + 2);
        assert!(!(*b).is_marked() && !(*c).is_marked());
    }
    gc.verify_heap().expect("walkable");
}

#[test]
fn test_mark_sweep_frees_unreachable_objects() {
    let mut gc = new_gc(GcType::MarkSweep, 2048);

    let mut frame = StackRecord::new();
    let keeper = alloc_plain(&mut gc, PLAIN_TAG, 0);
    let garbage = alloc_plain(&mut gc, PLAIN_TAG + 1, 0);
    frame.reg_root(keeper as Address);

    gc.collect();

    unsafe {
        assert_eq!((*garbage).tag, 0, "unreachable object became a free chunk");
        assert_eq!((*keeper).tag, PLAIN_TAG);
    }
    gc.verify_heap().expect("walkable");
}

// ─── Compactors ───────────────────────────────────────────────────────────────

fn compactor_round_trip(algo: GcType) {
    let mut gc = new_gc(algo, 4096);

    let mut frame = StackRecord::new();

    // garbage below the live objects forces them to slide down
    let _garbage1 = alloc_plain(&mut gc, PLAIN_TAG + 5, 4);
    let _garbage2 = alloc_plain(&mut gc, PLAIN_TAG + 6, 8);

    let a = alloc_plain(&mut gc, PLAIN_TAG, 2);
    let b = alloc_plain(&mut gc, PLAIN_TAG + 1, 1);
    let c = alloc_plain(&mut gc, PLAIN_TAG + 2, 0);
    unsafe {
        set_field(a, 0, b);
        set_field(a, 1, c);
        set_field(b, 0, c);
    }
    let slot = frame.reg_root(a as Address);
    let old_addr = a as Address;

    gc.collect();

    let moved = frame.root(slot) as *mut ObjectLayout;
    assert!((moved as Address) < old_addr, "live objects slid toward the heap start");
    assert!(gc.allocator().is_heap_addr(moved as Address));

    unsafe {
        assert_eq!((*moved).tag, PLAIN_TAG);
        assert!(!(*moved).is_marked());

        let b = get_field(moved, 0);
        let c_via_a = get_field(moved, 1);
        let c_via_b = get_field(b, 0);
        assert_eq!((*b).tag, PLAIN_TAG + 1);
        assert_eq!((*c_via_a).tag, PLAIN_TAG + 2);
        assert_eq!(c_via_a, c_via_b, "shared reference stays shared");
    }
    gc.verify_heap().expect("walkable after compaction");

    // the reclaimed space is allocatable again
    let refill = alloc_plain(&mut gc, PLAIN_TAG + 7, 16);
    assert!(!refill.is_null());
    gc.verify_heap().expect("walkable after refill");
}

#[test]
fn test_lisp2_compaction_round_trip() {
    compactor_round_trip(GcType::Lisp2Mc);
}

#[test]
fn test_threaded_compaction_round_trip() {
    compactor_round_trip(GcType::ThreadedMc);
}

#[test]
fn test_compressor_compaction_round_trip() {
    compactor_round_trip(GcType::Compressor);
}

#[test]
fn test_compaction_preserves_field_contents() {
    let mut gc = new_gc(GcType::ThreadedMc, 4096);

    let mut frame = StackRecord::new();
    let _garbage = alloc_plain(&mut gc, PLAIN_TAG + 5, 6);

    let holder = alloc_plain(&mut gc, PLAIN_TAG, 3);
    let child = alloc_plain(&mut gc, PLAIN_TAG + 1, 0);
    unsafe {
        set_field(holder, 0, child);
        set_field(holder, 1, std::ptr::null_mut());
        set_field(holder, 2, holder); // self reference
    }
    let slot = frame.reg_root(holder as Address);

    gc.collect();

    let holder = frame.root(slot) as *mut ObjectLayout;
    unsafe {
        assert_eq!((*get_field(holder, 0)).tag, PLAIN_TAG + 1);
        assert!(get_field(holder, 1).is_null(), "null fields stay null");
        assert_eq!(get_field(holder, 2), holder, "self reference follows the move");
    }
}

// ─── Semispace copying ────────────────────────────────────────────────────────

#[test]
fn test_semispace_copy_evacuates_reachable_graph() {
    let mut gc = new_gc(GcType::SemispaceCopy, 4096);

    let mut frame = StackRecord::new();
    let a = alloc_plain(&mut gc, PLAIN_TAG, 1);
    let b = alloc_plain(&mut gc, PLAIN_TAG + 1, 0);
    let _garbage = alloc_plain(&mut gc, PLAIN_TAG + 2, 4);
    unsafe { set_field(a, 0, b) };
    let slot = frame.reg_root(a as Address);
    let old_addr = a as Address;

    gc.collect();

    let moved = frame.root(slot) as *mut ObjectLayout;
    assert_ne!(moved as Address, old_addr, "the object changed semispaces");
    assert!(gc.allocator().is_heap_addr(moved as Address), "lives in the new tospace");

    unsafe {
        assert_eq!((*moved).tag, PLAIN_TAG);
        assert!(!(*moved).is_marked());
        assert_eq!((*get_field(moved, 0)).tag, PLAIN_TAG + 1);
    }
    gc.verify_heap().expect("tospace is walkable");
}

#[test]
fn test_semispace_allocates_after_flip() {
    let mut gc = new_gc(GcType::SemispaceCopy, 2048);

    let mut frame = StackRecord::new();
    let keeper = alloc_plain(&mut gc, PLAIN_TAG, 0);
    frame.reg_root(keeper as Address);

    // transient pressure forces several flips
    for _ in 0..100 {
        let _transient = alloc_plain(&mut gc, PLAIN_TAG + 1, 4);
    }
    assert!(gc.stats.collections > 0);
    gc.verify_heap().expect("walkable");
}

// ─── Markers ──────────────────────────────────────────────────────────────────

/// Collect the set of marked heap objects, walking linearly.
fn marked_set(gc: &Gc) -> Vec<usize> {
    let mut result = Vec::new();
    let mut scan = gc.allocator().start();
    let end = gc.allocator().end();
    unsafe {
        while scan < end {
            let obj = scan as *mut ObjectLayout;
            if (*obj).tag != 0 && (*obj).is_marked() {
                result.push(scan as usize);
            }
            scan = scan.add((*obj).size);
        }
    }
    result
}

fn unmark_all(gc: &Gc) {
    let mut scan = gc.allocator().start();
    let end = gc.allocator().end();
    unsafe {
        while scan < end {
            let obj = scan as *mut ObjectLayout;
            if (*obj).tag != 0 {
                (*obj).unset_marked();
            }
            scan = scan.add((*obj).size);
        }
    }
}

#[test]
fn test_all_markers_mark_the_same_set() {
    let mut gc = new_gc(GcType::Zero, 4096);

    let a = alloc_plain(&mut gc, PLAIN_TAG, 2);
    let b = alloc_plain(&mut gc, PLAIN_TAG + 1, 1);
    let c = alloc_plain(&mut gc, PLAIN_TAG + 2, 0);
    let _unreachable = alloc_plain(&mut gc, PLAIN_TAG + 3, 0);
    unsafe {
        set_field(a, 0, b);
        set_field(a, 1, c);
        set_field(b, 0, a); // cycle back
    }

    let mut root = a as Address;

    let mut lifo = MarkerLifo::default();
    lifo.mark_root(&mut root as *mut Address);
    let lifo_set = marked_set(&gc);
    unmark_all(&gc);

    let mut fifo = MarkerFifo::default();
    fifo.mark_root(&mut root as *mut Address);
    let fifo_set = marked_set(&gc);
    unmark_all(&gc);

    let mut edge = MarkerEdgeFifo::default();
    edge.mark_root(&mut root as *mut Address);
    let edge_set = marked_set(&gc);

    assert_eq!(lifo_set.len(), 3, "a, b and c are reachable");
    assert_eq!(lifo_set, fifo_set);
    assert_eq!(fifo_set, edge_set);
}

#[test]
fn test_mark_sweep_with_edge_fifo_marker() {
    let mut gc = new_gc(GcType::MarkSweep, 2048);
    gc.set_marker(Gc::edge_fifo_marker());

    let mut frame = StackRecord::new();
    let keeper = alloc_plain(&mut gc, PLAIN_TAG, 1);
    let child = alloc_plain(&mut gc, PLAIN_TAG + 1, 0);
    let garbage = alloc_plain(&mut gc, PLAIN_TAG + 2, 0);
    unsafe { set_field(keeper, 0, child) };
    frame.reg_root(keeper as Address);

    gc.collect();

    unsafe {
        assert_eq!((*keeper).tag, PLAIN_TAG);
        assert_eq!((*child).tag, PLAIN_TAG + 1);
        assert_eq!((*garbage).tag, 0, "unreachable object swept");
    }
    gc.verify_heap().expect("walkable");
}

#[test]
fn test_marking_twice_is_idempotent() {
    let mut gc = new_gc(GcType::Zero, 4096);

    let a = alloc_plain(&mut gc, PLAIN_TAG, 1);
    let b = alloc_plain(&mut gc, PLAIN_TAG + 1, 0);
    unsafe { set_field(a, 0, b) };

    let mut root = a as Address;
    let mut marker = MarkerFifo::default();
    marker.mark_root(&mut root as *mut Address);
    let first = marked_set(&gc);

    marker.mark_root(&mut root as *mut Address);
    let second = marked_set(&gc);

    assert_eq!(first, second);
}

#[test]
fn test_string_marker_fast_path() {
    // a String contributes only its length object, never its bytes
    let mut gc = new_gc(GcType::Zero, 4096);

    let length = gc.allocate(INT_TAG, std::mem::size_of::<IntLayout>(), std::ptr::null());
    let string = alloc_plain(&mut gc, STRING_TAG, 2);
    let decoy = alloc_plain(&mut gc, PLAIN_TAG, 0);
    unsafe {
        set_field(string, 0, length as *mut ObjectLayout);
        // a non-pointer word in the byte area must not be chased
        set_field(string, 1, decoy);
    }

    let mut root = string as Address;
    let mut marker = MarkerFifo::default();
    marker.mark_root(&mut root as *mut Address);

    unsafe {
        assert!((*string).is_marked());
        assert!((*(length as *mut ObjectLayout)).is_marked());
        assert!(!(*decoy).is_marked(), "string payload is opaque to the marker");
    }
}

// ─── Shadow stack ─────────────────────────────────────────────────────────────

#[test]
fn test_shadow_stack_walks_nested_frames() {
    use coolc::runtime::stack::StackWalker;

    let mut outer = StackRecord::new();
    outer.reg_root(0x10 as Address);
    outer.reg_root(0x20 as Address);

    let mut count = 0;
    {
        let mut inner = StackRecord::new();
        inner.reg_root(0x30 as Address);

        let mut walker = ShadowStackWalker;
        walker.process_roots(&mut |_root| count += 1, false);
    }
    assert_eq!(count, 3, "both frames contribute roots");

    let mut after = 0;
    let mut walker = ShadowStackWalker;
    walker.process_roots(&mut |_root| after += 1, false);
    assert_eq!(after, 2, "the inner frame unlinked on drop");
}

// ─── LLVM StackMaps parsing ───────────────────────────────────────────────────

struct SectionWriter(Vec<u8>);

impl SectionWriter {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn align8(&mut self) {
        while self.0.len() % 8 != 0 {
            self.0.push(0);
        }
    }
    fn location(&mut self, loc_type: u8, reg: u16, offset: i32) {
        self.u8(loc_type);
        self.u8(0);
        self.u16(8);
        self.u16(reg);
        self.u16(0);
        self.i32(offset);
    }
}

#[cfg(target_arch = "x86_64")]
const SP: u16 = 0x7;
#[cfg(not(target_arch = "x86_64"))]
const SP: u16 = 0x1F;

#[test]
fn test_stackmap_v3_parsing() {
    let mut w = SectionWriter(Vec::new());

    // header
    w.u8(3);
    w.u8(0);
    w.u16(0);
    w.u32(1); // functions
    w.u32(1); // constants
    w.u32(1); // records

    // StkSizeRecord
    w.u64(0x1000); // function address
    w.u64(40); // stack size
    w.u64(1); // records in this function

    // constants
    w.u64(0xDEAD);

    // StkMapRecord
    w.u64(42); // patchpoint id
    w.u32(0x10); // instruction offset
    w.u16(0);
    w.u16(5); // locations
    w.location(0x4, 0, 0); // calling convention (constant)
    w.location(0x4, 0, 0); // flags (constant)
    w.location(0x4, 0, 0); // deopt count = 0 (constant)
    w.location(0x3, SP, 8); // base pointer, indirect [sp + 8]
    w.location(0x3, SP, 16); // derived pointer, indirect [sp + 16]
    w.align8();
    w.u16(0); // padding
    w.u16(0); // live-outs
    w.align8();

    let map = StackMap::parse(&w.0);
    assert_eq!(map.len(), 1);

    let info = map.info(0x1000 + 0x10).expect("safepoint record");
    assert_eq!(info.stack_size, 40);
    assert_eq!(
        info.offsets,
        vec![LocInfo {
            base_reg: DwarfReg::Sp,
            base_offset: 8,
            der_reg: DwarfReg::Sp,
            der_offset: 16,
        }]
    );
}

#[test]
fn test_stackmap_unknown_address_has_no_info() {
    let mut w = SectionWriter(Vec::new());
    w.u8(3);
    w.u8(0);
    w.u16(0);
    w.u32(0);
    w.u32(0);
    w.u32(0);

    let map = StackMap::parse(&w.0);
    assert!(map.is_empty());
    assert!(map.info(0x1234).is_none());
}

// ─── Trivial-class equality ───────────────────────────────────────────────────

fn test_int(value: i64) -> IntLayout {
    SpecialTags::set(INT_TAG, BOOL_TAG, STRING_TAG);
    IntLayout {
        header: coolc::runtime::object::ObjectLayout {
            mark: coolc::runtime::object::MARK_SET,
            tag: INT_TAG,
            size: std::mem::size_of::<IntLayout>(),
            dispatch_table: std::ptr::null(),
        },
        value,
    }
}

#[test]
fn test_equals_compares_ints_by_value() {
    use coolc::runtime::equals;
    use coolc::runtime::object::{FALSE_VALUE, TRUE_VALUE};

    let a = test_int(5);
    let b = test_int(5);
    let c = test_int(6);

    let lhs = &a.header as *const ObjectLayout;
    assert_eq!(equals(lhs, &b.header as *const ObjectLayout), TRUE_VALUE);
    assert_eq!(equals(lhs, &c.header as *const ObjectLayout), FALSE_VALUE);
    assert_eq!(equals(lhs, lhs), TRUE_VALUE, "identity always wins");
    assert_eq!(equals(lhs, std::ptr::null()), FALSE_VALUE);
}

// ─── Runtime flags ────────────────────────────────────────────────────────────

#[test]
fn test_flag_parsing() {
    let flags = RuntimeFlags::process_args(&[
        "+PrintGCStatistics",
        "GCAlgo=1",
        "MaxHeapSize=1Kb",
        "program-arg",
    ]);
    assert!(flags.print_gc_statistics);
    assert_eq!(flags.gc_algo, 1);
    assert_eq!(flags.heap_size(), 1024);
}

#[test]
fn test_minus_flag_disables() {
    let flags = RuntimeFlags::process_args(&["+TraceMarking", "-TraceMarking"]);
    assert!(!flags.trace_marking);
}

#[test]
fn test_str_to_size_suffixes() {
    assert_eq!(str_to_size("512"), 512);
    assert_eq!(str_to_size("1Kb"), 1024);
    assert_eq!(str_to_size("2Mb"), 2 * 1024 * 1024);
    assert_eq!(str_to_size("1Gb"), 1024 * 1024 * 1024);
}

#[test]
fn test_gc_algo_selection() {
    assert_eq!(GcType::from_i32(0), Some(GcType::Zero));
    assert_eq!(GcType::from_i32(1), Some(GcType::MarkSweep));
    assert_eq!(GcType::from_i32(2), Some(GcType::ThreadedMc));
    assert_eq!(GcType::from_i32(3), Some(GcType::Compressor));
    assert_eq!(GcType::from_i32(4), Some(GcType::SemispaceCopy));
    assert_eq!(GcType::from_i32(5), Some(GcType::Lisp2Mc));
    assert_eq!(GcType::from_i32(6), None);
}
