/// Runtime library
///
/// Module layout:
///   - object — object header, trivial-class layouts, special tags
///   - alloc  — next-fit and semispace allocators
///   - marker — LIFO / FIFO / edge-FIFO / bitmap markers
///   - gc     — collector strategies and per-phase statistics
///   - stack  — shadow-stack and LLVM stack-map walkers
///
/// This module holds the runtime flags parsed out of argv, the
/// process-wide `Runtime` singleton (installed by `_init_runtime`,
/// torn down in reverse order by `_finish_runtime`), and the helper
/// ABI the emitter links against: `_gc_alloc`, `_equals`,
/// `_case_abort`, `_case_abort_2`, `_dispatch_abort`, and the
/// built-in `Object`/`IO`/`String` methods.

pub mod alloc;
pub mod gc;
pub mod marker;
pub mod object;
pub mod stack;

use gc::{exit_with_error, Gc, GcType};
use object::{
    Address, IntLayout, ObjectLayout, SpecialTags, StringLayout, FALSE_VALUE, HEADER_SIZE,
    TRUE_VALUE,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use stack::{ShadowStackWalker, StackWalker};
use std::io::{BufRead, Write};

// ---------------------------------------------------------------------------
// Runtime flags
// ---------------------------------------------------------------------------

/// Flags scanned out of the generated program's argv before the Cool
/// program runs. `+Flag`/`-Flag` toggle booleans, `Name=value` sets
/// the rest; anything unrecognised belongs to the program and is
/// ignored.
#[derive(Debug, Clone)]
pub struct RuntimeFlags {
    pub print_gc_statistics: bool,
    pub print_allocated_objects: bool,
    pub trace_marking: bool,
    pub trace_object_moving: bool,
    pub trace_gc_cycles: bool,
    pub trace_stack_walker: bool,
    pub max_heap_size: String,
    pub gc_algo: i32,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        RuntimeFlags {
            print_gc_statistics: false,
            print_allocated_objects: false,
            trace_marking: false,
            trace_object_moving: false,
            trace_gc_cycles: false,
            trace_stack_walker: false,
            max_heap_size: "6Kb".to_string(),
            gc_algo: GcType::ThreadedMc as i32,
        }
    }
}

impl RuntimeFlags {
    pub fn process_args<S: AsRef<str>>(args: &[S]) -> RuntimeFlags {
        let mut flags = RuntimeFlags::default();
        for arg in args {
            flags.maybe_set(arg.as_ref());
        }
        flags
    }

    fn maybe_set(&mut self, arg: &str) -> bool {
        if let Some(name) = arg.strip_prefix('+').or_else(|| arg.strip_prefix('-')) {
            let value = arg.starts_with('+');
            let slot = match name {
                "PrintGCStatistics" => &mut self.print_gc_statistics,
                "PrintAllocatedObjects" => &mut self.print_allocated_objects,
                "TraceMarking" => &mut self.trace_marking,
                "TraceObjectMoving" => &mut self.trace_object_moving,
                "TraceGCCycles" => &mut self.trace_gc_cycles,
                "TraceStackWalker" => &mut self.trace_stack_walker,
                _ => return false,
            };
            *slot = value;
            return true;
        }

        if let Some((name, value)) = arg.split_once('=') {
            match name {
                "GCAlgo" => {
                    if let Ok(algo) = value.parse() {
                        self.gc_algo = algo;
                        return true;
                    }
                }
                "MaxHeapSize" => {
                    self.max_heap_size = value.to_string();
                    return true;
                }
                _ => {}
            }
        }
        false
    }

    /// `MaxHeapSize` in bytes; accepts a `Kb`/`Mb`/`Gb` suffix.
    pub fn heap_size(&self) -> usize {
        str_to_size(&self.max_heap_size)
    }
}

pub fn str_to_size(spec: &str) -> usize {
    let digits_end = spec.find(|c: char| !c.is_ascii_digit()).unwrap_or(spec.len());
    let value: usize = spec[..digits_end].parse().unwrap_or(0);
    match spec[digits_end..].to_ascii_lowercase().as_str() {
        "kb" => value * 1024,
        "mb" => value * 1024 * 1024,
        "gb" => value * 1024 * 1024 * 1024,
        _ => value,
    }
}

// ---------------------------------------------------------------------------
// The process-wide runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    pub flags: RuntimeFlags,
    pub gc: Gc,
    /// `class_nameTab` as linked into the generated image; indexed by
    /// class tag, entry 0 is null.
    class_name_tab: *const *const StringLayout,
    int_disp_tab: *const u8,
    string_disp_tab: *const u8,
}

unsafe impl Send for Runtime {}

static RUNTIME: Lazy<Mutex<Option<Runtime>>> = Lazy::new(|| Mutex::new(None));

/// Table pointers and tags the generated image hands to
/// `_init_runtime`.
#[derive(Debug, Clone, Copy)]
pub struct ImageTables {
    pub class_name_tab: *const *const StringLayout,
    pub int_disp_tab: *const u8,
    pub string_disp_tab: *const u8,
    pub int_tag: i32,
    pub bool_tag: i32,
    pub string_tag: i32,
}

impl ImageTables {
    /// A table-less runtime for library consumers that only exercise
    /// the GC.
    pub fn empty(int_tag: i32, bool_tag: i32, string_tag: i32) -> ImageTables {
        ImageTables {
            class_name_tab: std::ptr::null(),
            int_disp_tab: std::ptr::null(),
            string_disp_tab: std::ptr::null(),
            int_tag,
            bool_tag,
            string_tag,
        }
    }
}

/// Install the allocator, stack walker, marker and GC, in that order.
pub fn init_runtime<S: AsRef<str>>(args: &[S], tables: ImageTables) {
    init_runtime_with_walker(args, tables, Box::new(ShadowStackWalker))
}

pub fn init_runtime_with_walker<S: AsRef<str>>(
    args: &[S],
    tables: ImageTables,
    walker: Box<dyn StackWalker + Send>,
) {
    let flags = RuntimeFlags::process_args(args);
    SpecialTags::set(tables.int_tag, tables.bool_tag, tables.string_tag);

    let algo = GcType::from_i32(flags.gc_algo).unwrap_or_else(|| {
        exit_with_error("cannot select GC!");
    });
    let heap_size = flags.heap_size().max(HEADER_SIZE);

    let mut gc = Gc::new(algo, heap_size, walker);
    gc.set_trace_cycles(flags.trace_gc_cycles);

    let mut runtime = RUNTIME.lock();
    *runtime = Some(Runtime {
        flags,
        gc,
        class_name_tab: tables.class_name_tab,
        int_disp_tab: tables.int_disp_tab,
        string_disp_tab: tables.string_disp_tab,
    });
}

/// Tear down in reverse order and print statistics when asked to.
pub fn finish_runtime() {
    let mut runtime = RUNTIME.lock();
    if let Some(runtime) = runtime.take() {
        if runtime.flags.print_gc_statistics {
            runtime.gc.stats.dump();
            eprintln!("Allocated bytes: {}", runtime.gc.allocator().allocated_bytes());
            eprintln!("Freed bytes:     {}", runtime.gc.allocator().freed_bytes());
        }
    }
}

fn with_runtime<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    let mut runtime = RUNTIME.lock();
    match runtime.as_mut() {
        Some(runtime) => f(runtime),
        None => exit_with_error("runtime is not initialized!"),
    }
}

// ---------------------------------------------------------------------------
// Helper ABI
// ---------------------------------------------------------------------------

/// `_gc_alloc`
pub fn gc_alloc(tag: i32, size: usize, disp_tab: *const u8) -> *mut ObjectLayout {
    with_runtime(|runtime| {
        let obj = runtime.gc.allocate(tag, size, disp_tab);
        if runtime.flags.print_allocated_objects {
            unsafe { (*obj).print() };
        }
        obj
    })
}

fn class_name(runtime: &Runtime, tag: i32) -> &'static str {
    unsafe {
        if runtime.class_name_tab.is_null() {
            return "<unknown>";
        }
        let name = *runtime.class_name_tab.add(tag as usize);
        if name.is_null() {
            "<unknown>"
        } else {
            std::mem::transmute::<&str, &'static str>((*name).as_str())
        }
    }
}

/// `Object.abort`
pub fn object_abort(receiver: *const ObjectLayout) -> ! {
    with_runtime(|runtime| {
        let name = class_name(runtime, unsafe { (*receiver).tag });
        print!("Abort called from class {}", name);
        let _ = std::io::stdout().flush();
    });
    std::process::exit(255);
}

/// `Object.type_name`
pub fn object_type_name(receiver: *const ObjectLayout) -> *const StringLayout {
    with_runtime(|runtime| unsafe {
        *runtime.class_name_tab.add((*receiver).tag as usize)
    })
}

/// `Object.copy`
pub fn object_copy(receiver: *mut ObjectLayout) -> *mut ObjectLayout {
    with_runtime(|runtime| {
        let mut receiver = receiver as Address;
        runtime.gc.add_runtime_root(&mut receiver as *mut Address);
        let copy = runtime.gc.copy(&mut receiver as *mut Address);
        runtime.gc.clean_runtime_roots();
        copy
    })
}

/// `_equals`: pointer identity, except for the trivial classes which
/// compare by value.
pub fn equals(lhs: *const ObjectLayout, rhs: *const ObjectLayout) -> i64 {
    if lhs.is_null() || rhs.is_null() {
        return FALSE_VALUE;
    }

    unsafe {
        if lhs == rhs {
            return TRUE_VALUE;
        }
        if (*lhs).tag != (*rhs).tag {
            return FALSE_VALUE;
        }

        let tag = (*lhs).tag;
        if tag == SpecialTags::int() || tag == SpecialTags::bool() {
            let l = (*(lhs as *const IntLayout)).value;
            let r = (*(rhs as *const IntLayout)).value;
            return if l == r { TRUE_VALUE } else { FALSE_VALUE };
        }
        if tag == SpecialTags::string() {
            let l = lhs as *const StringLayout;
            let r = rhs as *const StringLayout;
            if (*(*l).length).value != (*(*r).length).value {
                return FALSE_VALUE;
            }
            return if (*l).as_str() == (*r).as_str() { TRUE_VALUE } else { FALSE_VALUE };
        }
        FALSE_VALUE
    }
}

/// `_case_abort`: no branch matched the dynamic tag.
pub fn case_abort(tag: i32) -> ! {
    with_runtime(|runtime| {
        let name = class_name(runtime, tag);
        print!("No match in case statement for Class {}", name);
        let _ = std::io::stdout().flush();
    });
    std::process::exit(255);
}

/// `_case_abort_2`: the scrutinee was void.
pub fn case_abort_2(filename: *const StringLayout, line: i32) -> ! {
    unsafe {
        print!("{}:{}: Match on void in case statement.", (*filename).as_str(), line);
    }
    let _ = std::io::stdout().flush();
    std::process::exit(255);
}

/// `_dispatch_abort`: the receiver was void.
pub fn dispatch_abort(filename: *const StringLayout, line: i32) -> ! {
    unsafe {
        print!("{}:{}: Dispatch to void.", (*filename).as_str(), line);
    }
    let _ = std::io::stdout().flush();
    std::process::exit(255);
}

/// `_verify_oop` (debug builds): abort on a header that cannot belong
/// to a live object.
pub fn verify_oop(obj: *const ObjectLayout) {
    if obj.is_null() {
        return;
    }
    with_runtime(|runtime| unsafe {
        let heap_obj = runtime.gc.allocator().is_heap_addr(obj as *mut u8 as Address);
        let bad_tag = (*obj).tag <= 0;
        let bad_size = (*obj).size < HEADER_SIZE;
        if heap_obj && (bad_tag || bad_size) {
            (*obj).print();
            exit_with_error("corrupted object header!");
        }
    });
}

// ---------------------------------------------------------------------------
// Built-in IO and String methods
// ---------------------------------------------------------------------------

pub fn io_out_string(receiver: *mut ObjectLayout, s: *const StringLayout) -> *mut ObjectLayout {
    unsafe {
        print!("{}", (*s).as_str());
    }
    let _ = std::io::stdout().flush();
    receiver
}

pub fn io_out_int(receiver: *mut ObjectLayout, value: *const IntLayout) -> *mut ObjectLayout {
    unsafe {
        print!("{}", (*value).value);
    }
    let _ = std::io::stdout().flush();
    receiver
}

fn make_int(runtime: &mut Runtime, value: i64) -> *mut IntLayout {
    let obj = runtime.gc.allocate(
        SpecialTags::int(),
        std::mem::size_of::<IntLayout>(),
        runtime.int_disp_tab,
    ) as *mut IntLayout;
    unsafe { (*obj).value = value };
    obj
}

pub fn io_in_int(_receiver: *mut ObjectLayout) -> *mut IntLayout {
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    let value = line.trim().parse().unwrap_or(0);
    with_runtime(|runtime| make_int(runtime, value))
}

pub fn io_in_string(_receiver: *mut ObjectLayout) -> *mut StringLayout {
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    let line = line.trim_end_matches('\n');
    with_runtime(|runtime| alloc_string(runtime, line))
}

/// Allocate a String object (and its Int length) holding `value`.
fn alloc_string(runtime: &mut Runtime, value: &str) -> *mut StringLayout {
    let size = std::mem::size_of::<StringLayout>() + value.len() + 1;
    let mut obj = runtime.gc.allocate(SpecialTags::string(), size, runtime.string_disp_tab)
        as *mut StringLayout;

    unsafe {
        // the length slot must hold a scannable value before the Int
        // allocation below can trigger a collection
        (*obj).length = std::ptr::null_mut();
        let mut obj_root = obj as Address;
        runtime.gc.add_runtime_root(&mut obj_root as *mut Address);

        let length = make_int(runtime, value.len() as i64);

        obj = obj_root as *mut StringLayout;
        (*obj).length = length;

        let data = (*obj).data() as *mut u8;
        std::ptr::copy_nonoverlapping(value.as_ptr(), data, value.len());
        *data.add(value.len()) = 0;

        runtime.gc.clean_runtime_roots();
    }
    obj
}

pub fn string_length(receiver: *const StringLayout) -> *mut IntLayout {
    unsafe { (*receiver).length }
}

pub fn string_concat(
    receiver: *mut StringLayout,
    other: *mut StringLayout,
) -> *mut StringLayout {
    with_runtime(|runtime| {
        let mut receiver_root = receiver as Address;
        let mut other_root = other as Address;
        runtime.gc.add_runtime_root(&mut receiver_root as *mut Address);
        runtime.gc.add_runtime_root(&mut other_root as *mut Address);

        let joined = unsafe {
            let receiver = receiver_root as *mut StringLayout;
            let other = other_root as *mut StringLayout;
            format!("{}{}", (*receiver).as_str(), (*other).as_str())
        };
        let result = alloc_string(runtime, &joined);
        runtime.gc.clean_runtime_roots();
        result
    })
}

pub fn string_substr(
    receiver: *mut StringLayout,
    index: *const IntLayout,
    length: *const IntLayout,
) -> *mut StringLayout {
    with_runtime(|runtime| unsafe {
        let text = (*receiver).as_str();
        let index = (*index).value.max(0) as usize;
        let length = (*length).value.max(0) as usize;
        if index + length > text.len() {
            exit_with_error("Index out of range");
        }
        let slice = text[index..index + length].to_string();
        let result = alloc_string(runtime, &slice);
        runtime.gc.clean_runtime_roots();
        result
    })
}
