/// Heap allocators
///
/// The next-fit allocator owns a contiguous heap `[start, end)` and an
/// allocation cursor. Free memory is represented in place as objects
/// with tag 0 and a valid size, so the heap stays walkable linearly at
/// any time; allocation walks from the cursor coalescing runs of free
/// chunks until one fits. The semispace variant halves the heap and
/// `flip()`s between the halves on each collection.

use super::object::{
    align_size, is_aligned, Address, ObjectLayout, HEADER_SIZE, MARK_UNSET, UNUSED_TAG,
};
use std::alloc::{alloc, dealloc, Layout};

#[derive(Debug, Clone, Copy)]
struct SemispaceExtent {
    orig_start: Address,
    orig_end: Address,
    extend: usize,
}

pub struct NextFitAllocator {
    start: Address,
    end: Address,
    pos: Address,
    layout: Layout,
    semispace: Option<SemispaceExtent>,

    allocated_bytes: u64,
    freed_bytes: u64,
}

unsafe impl Send for NextFitAllocator {}

impl NextFitAllocator {
    pub fn new(size: usize) -> Self {
        Self::with_semispace(size, false)
    }

    /// Heap split into two halves that `flip()` swaps.
    pub fn new_semispace(size: usize) -> Self {
        Self::with_semispace(size, true)
    }

    fn with_semispace(size: usize, semispace: bool) -> Self {
        let size = align_size(size.max(HEADER_SIZE));
        let layout = Layout::from_size_align(size, 16).expect("heap layout");
        let start = unsafe { alloc(layout) };
        assert!(!start.is_null(), "cannot allocate memory for heap!");
        let end = unsafe { start.add(size) };

        let mut allocator = NextFitAllocator {
            start,
            end,
            pos: start,
            layout,
            semispace: None,
            allocated_bytes: 0,
            freed_bytes: 0,
        };

        if semispace {
            let extend = size / 2;
            allocator.semispace = Some(SemispaceExtent { orig_start: start, orig_end: end, extend });
            allocator.end = unsafe { start.add(extend) };
        }

        allocator.force_alloc_pos(allocator.start);
        allocator
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn is_heap_addr(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Either semispace, for the copying collector's fromspace test.
    pub fn is_orig_heap_addr(&self, addr: Address) -> bool {
        match self.semispace {
            Some(extent) => addr >= extent.orig_start && addr < extent.orig_end,
            None => self.is_heap_addr(addr),
        }
    }

    pub fn tospace(&self) -> Address {
        self.start
    }

    /// Bytes in each semispace half.
    pub fn semispace_extend(&self) -> usize {
        self.semispace.expect("extend of a flat heap").extend
    }

    pub fn fromspace(&self) -> Address {
        let extent = self.semispace.expect("fromspace of a flat heap");
        if self.end != extent.orig_end {
            self.end
        } else {
            extent.orig_start
        }
    }

    /// Swap semispaces and reset the cursor into the new tospace.
    pub fn flip(&mut self) {
        let extent = self.semispace.expect("flip of a flat heap");

        self.start = self.end;
        self.end = unsafe { self.start.add(extent.extend) };
        if self.start == extent.orig_end {
            self.start = extent.orig_start;
            self.end = unsafe { self.start.add(extent.extend) };
        }

        self.force_alloc_pos(self.start);
    }

    /// Returns null on OOM so the GC can collect and retry.
    pub fn allocate(&mut self, tag: i32, size: usize, disp_tab: *const u8) -> *mut ObjectLayout {
        debug_assert!(tag != UNUSED_TAG);
        debug_assert!(is_aligned(size));

        // walk from the cursor, coalescing runs of free chunks
        let mut chunk: *mut ObjectLayout = std::ptr::null_mut();
        let mut current = self.pos as *mut ObjectLayout;
        let mut current_chunk_size = 0usize;

        unsafe {
            while (current as Address) < self.end {
                if (*current).tag != UNUSED_TAG {
                    // live object; preceding free run was too small
                    if current_chunk_size != 0 && !chunk.is_null() {
                        (*chunk).size = current_chunk_size;
                    }
                    chunk = std::ptr::null_mut();
                    current_chunk_size = 0;
                } else if chunk.is_null() {
                    chunk = current;
                    current_chunk_size = (*current).size;
                } else {
                    // merge with the previous free chunk
                    current_chunk_size += (*current).size;
                    (*chunk).size = current_chunk_size;
                }

                if current_chunk_size >= size {
                    break;
                }
                current = (current as Address).add((*current).size) as *mut ObjectLayout;
            }

            if chunk.is_null() || (*chunk).size < size {
                return std::ptr::null_mut();
            }

            let mut size = size;
            let mut appendix = 0usize;
            if current_chunk_size - size < HEADER_SIZE {
                // absorb a remainder too small to carry a header, so
                // the heap walk stays exact
                appendix = current_chunk_size - size;
                size = current_chunk_size;
            } else {
                let next_free = (chunk as Address).add(size) as *mut ObjectLayout;
                (*next_free).set_unused(current_chunk_size - size);
                self.pos = next_free as Address;
            }

            (*chunk).mark = MARK_UNSET;
            (*chunk).tag = tag;
            (*chunk).size = size;
            (*chunk).dispatch_table = disp_tab;
            (*chunk).zero_fields(0);
            if appendix != 0 {
                (*chunk).zero_appendix(appendix);
            }

            self.allocated_bytes += size as u64;
            chunk
        }
    }

    /// Turn an object back into a free chunk; the cursor retreats so
    /// the space is reused promptly.
    pub fn free(&mut self, obj: *mut ObjectLayout) {
        unsafe {
            debug_assert!((*obj).size != 0);
            self.freed_bytes += (*obj).size as u64;
            (*obj).unset_marked();
            (*obj).tag = UNUSED_TAG;
        }
        if (obj as Address) < self.pos {
            self.pos = obj as Address;
        }
    }

    /// Relocate an object; regions may overlap during compaction.
    pub fn move_object(&mut self, src: *const ObjectLayout, dst: Address) {
        if dst == src as Address {
            return;
        }
        unsafe {
            let size = (*src).size;
            if dst >= (src as Address).add(size) || dst <= (src as Address).wrapping_sub(size) {
                std::ptr::copy_nonoverlapping(src as Address, dst, size);
            } else {
                std::ptr::copy(src as Address, dst, size);
            }
        }
    }

    /// Reset the cursor and cover `[pos, end)` with one free chunk.
    /// A completely full heap leaves no room for the chunk header.
    pub fn force_alloc_pos(&mut self, pos: Address) {
        if pos < self.end {
            unsafe {
                let chunk = pos as *mut ObjectLayout;
                (*chunk).set_unused(self.end.offset_from(pos) as usize);
            }
        }
        self.pos = pos;
    }

    /// First live object at or after `addr`; `end` when none is left.
    pub fn next_object(&self, addr: Address) -> Address {
        let mut current = addr as *mut ObjectLayout;
        unsafe {
            while (current as Address) < self.end && (*current).tag == UNUSED_TAG {
                current = (current as Address).add((*current).size) as *mut ObjectLayout;
            }
        }
        current as Address
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn freed_bytes(&self) -> u64 {
        self.freed_bytes
    }
}

impl Drop for NextFitAllocator {
    fn drop(&mut self) {
        let start = match self.semispace {
            Some(extent) => extent.orig_start,
            None => self.start,
        };
        unsafe { dealloc(start, self.layout) };
    }
}
