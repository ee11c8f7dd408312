/// Markers
///
/// Three worklist disciplines over the same object graph:
///   - LIFO: depth-first; most recently marked objects are visited
///     next, which keeps co-located mark bits hot in cache.
///   - FIFO: breadth-first; cache lines are fetched in FIFO order,
///     which suits hardware prefetchers better.
///   - edge-FIFO: enqueues children unconditionally and marks on pop,
///     exposing more prefetch distance (Garner et al).
///
/// All share the trivial-type fast path: a String contributes only
/// its length object, Int and Bool contribute nothing.
///
/// The bitmap marker records liveness in a side bitmap (one bit per
/// heap byte, 256-bit blocks) for the compacting collector that
/// derives forwarding addresses from it.

use super::object::{Address, ObjectLayout, StringLayout};
use std::collections::VecDeque;

/// Visit the children of `obj` with the trivial-type fast path
/// applied.
///
/// # Safety
/// `obj` must point at a live, well-formed object.
pub unsafe fn visit_children(obj: *mut ObjectLayout, mut visit: impl FnMut(*mut ObjectLayout)) {
    if (*obj).has_special_type() {
        if (*obj).is_string() {
            let length = (*(obj as *mut StringLayout)).length;
            if !length.is_null() {
                visit(length as *mut ObjectLayout);
            }
        }
        return;
    }

    let fields = (*obj).fields_base();
    for i in 0..(*obj).field_cnt() {
        let child = *fields.add(i) as *mut ObjectLayout;
        if !child.is_null() {
            visit(child);
        }
    }
}

// ---------------------------------------------------------------------------
// Header-mark markers
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MarkerLifo {
    worklist: Vec<*mut ObjectLayout>,
}

impl MarkerLifo {
    pub fn mark_root(&mut self, root: *mut Address) {
        let obj = unsafe { *root } as *mut ObjectLayout;
        if obj.is_null() {
            return;
        }
        unsafe {
            if !(*obj).is_marked() {
                (*obj).set_marked();
                self.worklist.push(obj);
                self.mark();
            }
        }
    }

    fn mark(&mut self) {
        while let Some(obj) = self.worklist.pop() {
            unsafe {
                visit_children(obj, |child| {
                    if !(*child).is_marked() {
                        (*child).set_marked();
                        self.worklist.push(child);
                    }
                });
            }
        }
    }
}

#[derive(Default)]
pub struct MarkerFifo {
    worklist: VecDeque<*mut ObjectLayout>,
}

impl MarkerFifo {
    pub fn mark_root(&mut self, root: *mut Address) {
        let obj = unsafe { *root } as *mut ObjectLayout;
        if obj.is_null() {
            return;
        }
        unsafe {
            if !(*obj).is_marked() {
                (*obj).set_marked();
                self.worklist.push_back(obj);
                self.mark();
            }
        }
    }

    fn mark(&mut self) {
        while let Some(obj) = self.worklist.pop_front() {
            unsafe {
                visit_children(obj, |child| {
                    if !(*child).is_marked() {
                        (*child).set_marked();
                        self.worklist.push_back(child);
                    }
                });
            }
        }
    }
}

/// Enqueue unconditionally, mark on pop.
#[derive(Default)]
pub struct MarkerEdgeFifo {
    worklist: VecDeque<*mut ObjectLayout>,
}

impl MarkerEdgeFifo {
    pub fn mark_root(&mut self, root: *mut Address) {
        let obj = unsafe { *root } as *mut ObjectLayout;
        if obj.is_null() {
            return;
        }
        self.worklist.push_back(obj);
        self.mark();
    }

    fn mark(&mut self) {
        while let Some(obj) = self.worklist.pop_front() {
            unsafe {
                if (*obj).is_marked() {
                    continue;
                }
                (*obj).set_marked();
                visit_children(obj, |child| {
                    if !(*child).is_marked() {
                        self.worklist.push_back(child);
                    }
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bitmap marker
// ---------------------------------------------------------------------------

pub type BitmapWord = u64;

pub const BITS_PER_BITMAP_WORD: usize = BitmapWord::BITS as usize;
pub const BYTES_PER_BIT: usize = 1;
/// Block granularity of the compacting collector's offset vector.
pub const BITS_IN_BLOCK: usize = 256;

pub struct BitmapMarker {
    heap_start: Address,
    heap_end: Address,
    bitmap: Vec<BitmapWord>,
    worklist: VecDeque<*mut ObjectLayout>,
}

impl BitmapMarker {
    pub fn new(heap_start: Address, heap_end: Address) -> Self {
        let bits = unsafe { heap_end.offset_from(heap_start) as usize } / BYTES_PER_BIT + 1;
        let words = bits / BITS_PER_BITMAP_WORD + 1;
        BitmapMarker {
            heap_start,
            heap_end,
            bitmap: vec![0; words],
            worklist: VecDeque::new(),
        }
    }

    pub fn heap_start(&self) -> Address {
        self.heap_start
    }

    fn is_heap_addr(&self, addr: Address) -> bool {
        addr >= self.heap_start && addr < self.heap_end
    }

    pub fn byte_to_bit(&self, byte: Address) -> usize {
        unsafe { byte.offset_from(self.heap_start) as usize / BYTES_PER_BIT }
    }

    pub fn is_bit_set(&self, bit: usize) -> bool {
        (self.bitmap[bit / BITS_PER_BITMAP_WORD] & (1 << (bit % BITS_PER_BITMAP_WORD))) != 0
    }

    pub fn bits_num(&self) -> usize {
        (unsafe { self.heap_end.offset_from(self.heap_start) as usize }) / BYTES_PER_BIT
    }

    /// Live bits in `[from_bit, to_bit)`.
    pub fn count_bits(&self, from_bit: usize, to_bit: usize) -> usize {
        (from_bit..to_bit).filter(|&b| self.is_bit_set(b)).count()
    }

    pub fn is_marked(&self, obj: *const ObjectLayout) -> bool {
        if !self.is_heap_addr(obj as Address) {
            // constants outside the heap are permanently marked
            return unsafe { (*obj).is_marked() };
        }
        self.is_bit_set(self.byte_to_bit(obj as Address))
    }

    fn mark_object_bits(&mut self, obj: *mut ObjectLayout) {
        let start_bit = self.byte_to_bit(obj as Address);
        let size = unsafe { (*obj).size };
        for bit in start_bit..start_bit + size / BYTES_PER_BIT {
            self.bitmap[bit / BITS_PER_BITMAP_WORD] |= 1 << (bit % BITS_PER_BITMAP_WORD);
        }
    }

    pub fn mark_root(&mut self, root: *mut Address) {
        let obj = unsafe { *root } as *mut ObjectLayout;
        if obj.is_null() || self.is_marked(obj) {
            return;
        }
        self.mark_object_bits(obj);
        self.worklist.push_back(obj);
        self.mark();
    }

    fn mark(&mut self) {
        while let Some(obj) = self.worklist.pop_front() {
            unsafe {
                visit_children(obj, |child| {
                    if !self.is_marked(child) {
                        self.mark_object_bits(child);
                        self.worklist.push_back(child);
                    }
                });
            }
        }
    }

    pub fn clear(&mut self) {
        self.bitmap.fill(0);
    }
}

// ---------------------------------------------------------------------------
// Marker selection
// ---------------------------------------------------------------------------

pub enum MarkerKind {
    Lifo(MarkerLifo),
    Fifo(MarkerFifo),
    EdgeFifo(MarkerEdgeFifo),
    Bitmap(BitmapMarker),
}

unsafe impl Send for MarkerKind {}

impl MarkerKind {
    pub fn mark_root(&mut self, root: *mut Address) {
        match self {
            MarkerKind::Lifo(marker) => marker.mark_root(root),
            MarkerKind::Fifo(marker) => marker.mark_root(root),
            MarkerKind::EdgeFifo(marker) => marker.mark_root(root),
            MarkerKind::Bitmap(marker) => marker.mark_root(root),
        }
    }

    pub fn is_marked(&self, obj: *const ObjectLayout) -> bool {
        match self {
            MarkerKind::Bitmap(marker) => marker.is_marked(obj),
            _ => unsafe { (*obj).is_marked() },
        }
    }

    pub fn clear(&mut self) {
        if let MarkerKind::Bitmap(marker) = self {
            marker.clear();
        }
    }

    pub fn bitmap(&self) -> Option<&BitmapMarker> {
        match self {
            MarkerKind::Bitmap(marker) => Some(marker),
            _ => None,
        }
    }

    pub fn bitmap_mut(&mut self) -> Option<&mut BitmapMarker> {
        match self {
            MarkerKind::Bitmap(marker) => Some(marker),
            _ => None,
        }
    }
}
