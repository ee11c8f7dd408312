/// Stack walking
///
/// Two cooperation models with generated code:
///
///   - shadow stack: every frame that holds GC roots links a
///     `StackRecord` into a global chain on entry and unlinks it on
///     exit; the walker visits every root slot of every linked frame.
///   - stack map: the compiler emits an `__LLVM_StackMaps` v3 section;
///     the walker parses it once at startup into a return-address
///     indexed table of `(stack size, [offset records])` and walks
///     machine frames from the sp/fp stored at safepoint entry. Walks
///     may record derived-pointer relocations which are re-applied
///     after a moving collection (`derived = base + offset`).

use super::object::Address;
use std::collections::HashMap;

/// Visits one root slot. The slot itself is passed (not the object) so
/// moving collectors can rewrite it.
pub type RootVisitor<'a> = &'a mut dyn FnMut(*mut Address);

pub trait StackWalker {
    fn process_roots(&mut self, visitor: RootVisitor, record_derived_ptrs: bool);

    /// Re-apply the derived-pointer relocations recorded by the last
    /// walk. A no-op for walkers that never produce derived pointers.
    fn fix_derived_pointers(&mut self) {}
}

// ---------------------------------------------------------------------------
// Shadow stack
// ---------------------------------------------------------------------------

/// One frame's worth of roots. Generated prologues allocate these on
/// the machine stack; the runtime (and tests) use `StackRecord::new`
/// with the RAII guard below.
pub struct StackRecord {
    parent: *mut StackRecord,
    roots: Vec<Address>,
}

// The mutator is single-threaded; a thread-local chain also keeps
// concurrently running tests out of each other's frames.
thread_local! {
    static ROOT_CHAIN: std::cell::Cell<*mut StackRecord> =
        const { std::cell::Cell::new(std::ptr::null_mut()) };
}

impl StackRecord {
    /// Link a fresh record at the head of the chain. Dropping the
    /// returned guard unlinks it.
    pub fn new() -> StackRecordGuard {
        let record = Box::into_raw(Box::new(StackRecord {
            parent: ROOT_CHAIN.with(|chain| chain.get()),
            roots: Vec::new(),
        }));
        ROOT_CHAIN.with(|chain| chain.set(record));
        StackRecordGuard { record }
    }

    pub fn parent(&self) -> *mut StackRecord {
        self.parent
    }
}

pub struct StackRecordGuard {
    record: *mut StackRecord,
}

impl StackRecordGuard {
    /// Register a root; returns its slot index for later reads.
    pub fn reg_root(&mut self, obj: Address) -> usize {
        let roots = unsafe { &mut (*self.record).roots };
        roots.push(obj);
        roots.len() - 1
    }

    pub fn root(&self, slot: usize) -> Address {
        unsafe { (&(*self.record).roots)[slot] }
    }

    pub fn set_root(&mut self, slot: usize, obj: Address) {
        unsafe { (&mut (*self.record).roots)[slot] = obj };
    }
}

impl Drop for StackRecordGuard {
    fn drop(&mut self) {
        unsafe {
            debug_assert_eq!(
                ROOT_CHAIN.with(|chain| chain.get()),
                self.record,
                "frames must unwind in order"
            );
            ROOT_CHAIN.with(|chain| chain.set((*self.record).parent));
            drop(Box::from_raw(self.record));
        }
    }
}

#[derive(Default)]
pub struct ShadowStackWalker;

impl StackWalker for ShadowStackWalker {
    fn process_roots(&mut self, visitor: RootVisitor, _record_derived_ptrs: bool) {
        let mut record = ROOT_CHAIN.with(|chain| chain.get());
        while !record.is_null() {
            unsafe {
                for slot in (*record).roots.iter_mut() {
                    visitor(slot as *mut Address);
                }
                record = (*record).parent;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LLVM StackMaps v3 parsing
// ---------------------------------------------------------------------------
// https://llvm.org/docs/StackMaps.html#stack-map-format

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfReg {
    Fp,
    Sp,
}

#[cfg(target_arch = "x86_64")]
const DWARF_FP: u16 = 0x6;
#[cfg(target_arch = "x86_64")]
const DWARF_SP: u16 = 0x7;

#[cfg(not(target_arch = "x86_64"))]
const DWARF_FP: u16 = 0x1D;
#[cfg(not(target_arch = "x86_64"))]
const DWARF_SP: u16 = 0x1F;

const LOCATION_TYPE_INDIRECT: u8 = 0x3;
const LOCATION_TYPE_CONSTANT: u8 = 0x4;

/// One relocation record; `base != derived` marks a derived pointer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocInfo {
    pub base_reg: DwarfReg,
    pub base_offset: i32,
    pub der_reg: DwarfReg,
    pub der_offset: i32,
}

/// All relocations recorded for one safepoint return address.
#[derive(Debug, Clone, Default)]
pub struct AddrInfo {
    pub stack_size: u64,
    pub offsets: Vec<LocInfo>,
}

#[derive(Debug, Default)]
pub struct StackMap {
    records: HashMap<u64, AddrInfo>,
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let v = self.bytes[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.bytes[self.pos..self.pos + 2].try_into().expect("u16"));
        self.pos += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().expect("u32"));
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.bytes[self.pos..self.pos + 8].try_into().expect("u64"));
        self.pos += 8;
        v
    }

    fn i32(&mut self) -> i32 {
        self.u32() as i32
    }

    fn align8(&mut self) {
        self.pos = (self.pos + 7) & !7;
    }
}

#[derive(Debug, Clone, Copy)]
struct RawLocation {
    loc_type: u8,
    dwarf_reg: u16,
    offset: i32,
}

impl StackMap {
    /// Parse an `__LLVM_StackMaps` v3 section. Statepoint records lay
    /// their locations out as: calling convention, flags, deopt count,
    /// the deopt locations, then (base, derived) pointer pairs.
    pub fn parse(section: &[u8]) -> StackMap {
        let mut r = ByteReader::new(section);

        let version = r.u8();
        assert_eq!(version, 3, "unsupported stackmap version");
        r.u8();
        r.u16();
        let num_functions = r.u32();
        let num_constants = r.u32();
        let num_records = r.u32();

        let mut functions = Vec::with_capacity(num_functions as usize);
        for _ in 0..num_functions {
            let func_address = r.u64();
            let stack_size = r.u64();
            let record_count = r.u64();
            functions.push((func_address, stack_size, record_count));
        }
        for _ in 0..num_constants {
            r.u64();
        }

        let mut map = StackMap::default();
        let mut func_iter = functions.into_iter();
        let mut remaining_in_func = 0u64;
        let mut current_func = (0u64, 0u64);

        for _ in 0..num_records {
            while remaining_in_func == 0 {
                let (addr, stack_size, count) =
                    func_iter.next().expect("record outside any function");
                current_func = (addr, stack_size);
                remaining_in_func = count;
            }
            remaining_in_func -= 1;

            let _patch_point_id = r.u64();
            let instruction_offset = r.u32();
            r.u16();
            let num_locations = r.u16();

            let mut locations = Vec::with_capacity(num_locations as usize);
            for _ in 0..num_locations {
                let loc_type = r.u8();
                r.u8();
                let _size = r.u16();
                let dwarf_reg = r.u16();
                r.u16();
                let offset = r.i32();
                locations.push(RawLocation { loc_type, dwarf_reg, offset });
            }
            r.align8();
            r.u16(); // padding
            let num_live_outs = r.u16();
            for _ in 0..num_live_outs {
                r.u16();
                r.u8();
                r.u8();
            }
            r.align8();

            let info = Self::decode_statepoint(current_func.1, &locations);
            let ret_addr = current_func.0 + instruction_offset as u64;
            map.records.insert(ret_addr, info);
        }

        map
    }

    fn decode_statepoint(stack_size: u64, locations: &[RawLocation]) -> AddrInfo {
        let mut info = AddrInfo { stack_size, offsets: Vec::new() };

        // locations 0..2 are calling convention, flags and the deopt
        // count; the deopt locations follow, then the pointer pairs
        if locations.len() < 3 {
            return info;
        }
        debug_assert_eq!(locations[2].loc_type, LOCATION_TYPE_CONSTANT);
        let deopt_count = locations[2].offset.max(0) as usize;
        let pairs_start = 3 + deopt_count;

        let reg = |raw: u16| if raw == DWARF_SP { DwarfReg::Sp } else { DwarfReg::Fp };

        let mut i = pairs_start;
        while i + 1 < locations.len() {
            let base = locations[i];
            let derived = locations[i + 1];
            i += 2;

            if base.loc_type != LOCATION_TYPE_INDIRECT
                || derived.loc_type != LOCATION_TYPE_INDIRECT
            {
                continue;
            }
            debug_assert!(base.dwarf_reg == DWARF_SP || base.dwarf_reg == DWARF_FP);

            info.offsets.push(LocInfo {
                base_reg: reg(base.dwarf_reg),
                base_offset: base.offset,
                der_reg: reg(derived.dwarf_reg),
                der_offset: derived.offset,
            });
        }
        info
    }

    pub fn info(&self, ret_addr: u64) -> Option<&AddrInfo> {
        self.records.get(&ret_addr)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Stack-map walker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct DerivedPtrReloc {
    base_ptr_slot: *mut Address,
    derived_ptr_slot: *mut Address,
    offset: isize,
}

/// Walks machine frames using the parsed stack map, starting from the
/// sp/fp the emitted safepoint entry stored via `set_stack_pointers`.
pub struct StackMapWalker {
    map: StackMap,
    stack_pointer: Address,
    frame_pointer: Address,
    derived_ptrs: Vec<DerivedPtrReloc>,
}

unsafe impl Send for StackMapWalker {}

impl StackMapWalker {
    pub fn new(map: StackMap) -> Self {
        StackMapWalker {
            map,
            stack_pointer: std::ptr::null_mut(),
            frame_pointer: std::ptr::null_mut(),
            derived_ptrs: Vec::new(),
        }
    }

    /// Stored by the safepoint entry stub before the runtime is
    /// entered.
    pub fn set_stack_pointers(&mut self, sp: Address, fp: Address) {
        self.stack_pointer = sp;
        self.frame_pointer = fp;
    }

    fn slot(base: Address, offset: i32) -> *mut Address {
        base.wrapping_offset(offset as isize) as *mut Address
    }
}

impl StackWalker for StackMapWalker {
    fn process_roots(&mut self, visitor: RootVisitor, record_derived_ptrs: bool) {
        if record_derived_ptrs {
            self.derived_ptrs.clear();
        }

        let mut sp = self.stack_pointer;
        let mut fp = self.frame_pointer;
        if sp.is_null() && fp.is_null() {
            return;
        }

        // the return address of the youngest frame sits just below sp
        let mut ret_addr = unsafe { *(sp as *const u64).sub(1) };

        while let Some(info) = self.map.info(ret_addr).cloned() {
            for loc in &info.offsets {
                let base_slot =
                    Self::slot(if loc.base_reg == DwarfReg::Sp { sp } else { fp }, loc.base_offset);
                let derived_slot =
                    Self::slot(if loc.der_reg == DwarfReg::Sp { sp } else { fp }, loc.der_offset);

                unsafe {
                    if (*base_slot).is_null() && !(*derived_slot).is_null() {
                        continue; // interior pointer with no live base
                    }
                    if record_derived_ptrs && base_slot != derived_slot {
                        self.derived_ptrs.push(DerivedPtrReloc {
                            base_ptr_slot: base_slot,
                            derived_ptr_slot: derived_slot,
                            offset: (*derived_slot).offset_from(*base_slot),
                        });
                    }
                }
                visitor(base_slot);
            }

            // to the next activation
            unsafe {
                let next_sp = sp.add(info.stack_size as usize + std::mem::size_of::<Address>());
                ret_addr = *(next_sp as *const u64).sub(1);
                sp = next_sp;
                fp = *(fp as *const Address);
            }
        }
    }

    fn fix_derived_pointers(&mut self) {
        for reloc in &self.derived_ptrs {
            unsafe {
                *reloc.derived_ptr_slot = (*reloc.base_ptr_slot).wrapping_offset(reloc.offset);
            }
        }
    }
}
