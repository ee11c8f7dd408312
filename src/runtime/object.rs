/// Runtime object model
///
/// Every heap object starts with a fixed header:
///
///   | mark           | word    | GC mark bit, doubles as forwarding slot |
///   | tag            | 32 bits | class tag; 0 means free chunk           |
///   | size           | word    | total bytes including the header        |
///   | dispatch_table | pointer | class dispatch table                    |
///
/// Fields follow in declared order, one word each. Int and Bool carry
/// a single native value field; String carries a pointer to its Int
/// length object followed by a NUL-terminated byte array.

use std::sync::atomic::{AtomicI32, Ordering};

pub type Address = *mut u8;

pub const WORD_SIZE: usize = std::mem::size_of::<usize>();
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectLayout>();

/// Free memory chunks carry this tag so a linear heap walk can skip
/// them by size.
pub const UNUSED_TAG: i32 = 0;

pub const MARK_UNSET: usize = 0;
pub const MARK_SET: usize = 1;
/// Constants in the data segment are emitted with this mark word so
/// the GC never tries to move or free them.
pub const MARK_DEFAULT: usize = MARK_SET;

pub const TRUE_VALUE: i64 = 1;
pub const FALSE_VALUE: i64 = 0;
pub const DEFAULT_VALUE: i64 = 0;

// ---------------------------------------------------------------------------
// Special class tags
// ---------------------------------------------------------------------------

/// Tags of the trivial classes for the current program. They depend on
/// the class hierarchy, so the emitter hands them to the runtime at
/// startup (`_init_runtime`).
pub struct SpecialTags;

static INT_TAG: AtomicI32 = AtomicI32::new(-1);
static BOOL_TAG: AtomicI32 = AtomicI32::new(-1);
static STRING_TAG: AtomicI32 = AtomicI32::new(-1);

impl SpecialTags {
    pub fn set(int_tag: i32, bool_tag: i32, string_tag: i32) {
        INT_TAG.store(int_tag, Ordering::Relaxed);
        BOOL_TAG.store(bool_tag, Ordering::Relaxed);
        STRING_TAG.store(string_tag, Ordering::Relaxed);
    }

    pub fn int() -> i32 {
        INT_TAG.load(Ordering::Relaxed)
    }

    pub fn bool() -> i32 {
        BOOL_TAG.load(Ordering::Relaxed)
    }

    pub fn string() -> i32 {
        STRING_TAG.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Object header
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug)]
pub struct ObjectLayout {
    pub mark: usize,
    pub tag: i32,
    pub size: usize,
    pub dispatch_table: *const u8,
}

impl ObjectLayout {
    pub fn is_marked(&self) -> bool {
        self.mark != MARK_UNSET
    }

    pub fn set_marked(&mut self) {
        self.mark = MARK_SET;
    }

    pub fn unset_marked(&mut self) {
        self.mark = MARK_UNSET;
    }

    /// Turn this header into a free chunk of the given size.
    pub fn set_unused(&mut self, size: usize) {
        self.mark = MARK_UNSET;
        self.tag = UNUSED_TAG;
        self.size = size;
        self.dispatch_table = std::ptr::null();
    }

    /// Number of pointer-sized fields after the header.
    pub fn field_cnt(&self) -> usize {
        (self.size - HEADER_SIZE) / WORD_SIZE
    }

    /// Base address of the field area.
    ///
    /// # Safety
    /// The header must sit at the start of a live, correctly sized
    /// object.
    pub unsafe fn fields_base(&self) -> *mut Address {
        (self as *const ObjectLayout as Address).add(HEADER_SIZE) as *mut Address
    }

    /// Trivial-typed objects are not scanned field-by-field.
    pub fn has_special_type(&self) -> bool {
        self.tag == SpecialTags::int()
            || self.tag == SpecialTags::bool()
            || self.tag == SpecialTags::string()
    }

    pub fn is_string(&self) -> bool {
        self.tag == SpecialTags::string()
    }

    /// # Safety
    /// See `fields_base`.
    pub unsafe fn zero_fields(&mut self, value: usize) {
        let fields = self.fields_base();
        for i in 0..self.field_cnt() {
            *fields.add(i) = value as Address;
        }
    }

    /// Zero the alignment appendix a next-fit allocation may absorb,
    /// so the word after the declared fields never looks like a stale
    /// pointer.
    ///
    /// # Safety
    /// `appendix` bytes past `size - appendix` must belong to this
    /// allocation.
    pub unsafe fn zero_appendix(&mut self, appendix: usize) {
        let base = self as *mut ObjectLayout as Address;
        std::ptr::write_bytes(base.add(self.size - appendix), 0, appendix);
    }

    pub fn print(&self) {
        eprintln!(
            "Object {:p}: mark = {}, tag = {}, size = {}, disp_tab = {:p}",
            self, self.mark, self.tag, self.size, self.dispatch_table
        );
    }
}

// ---------------------------------------------------------------------------
// Trivial-class layouts
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct IntLayout {
    pub header: ObjectLayout,
    pub value: i64,
}

#[repr(C)]
pub struct BoolLayout {
    pub header: ObjectLayout,
    pub value: i64,
}

#[repr(C)]
pub struct StringLayout {
    pub header: ObjectLayout,
    pub length: *mut IntLayout,
    // NUL-terminated bytes follow in place
}

impl StringLayout {
    /// # Safety
    /// The string bytes must have been written after the header.
    pub unsafe fn data(&self) -> *const u8 {
        (self as *const StringLayout as *const u8).add(std::mem::size_of::<StringLayout>())
    }

    /// # Safety
    /// See `data`; additionally the byte array must be NUL-terminated.
    pub unsafe fn as_str(&self) -> &str {
        let len = (*self.length).value as usize;
        let bytes = std::slice::from_raw_parts(self.data(), len);
        std::str::from_utf8_unchecked(bytes)
    }
}

/// 16-byte allocation alignment, as the allocators require.
pub fn align_size(size: usize) -> usize {
    (size + 2 * WORD_SIZE - 1) & !(2 * WORD_SIZE - 1)
}

pub fn is_aligned(value: usize) -> bool {
    value % (2 * WORD_SIZE) == 0
}
