/// Code emitter contract
///
/// The concrete emitter (textual assembly or a binary backend) lives
/// outside this crate. This module pins down the shape of what it
/// consumes — the typed AST, the Klass registry, the IR module and
/// constant pools — plus the runtime helper symbols it links against,
/// and drives the per-class emission order.

use crate::ast::{Class, Feature, TypeId};
use crate::ir::{FuncId, Module, OperandType};
use crate::klass::KlassBuilder;
use crate::semant::Analysis;

// ---------------------------------------------------------------------------
// Runtime helper ABI
// ---------------------------------------------------------------------------

pub const GC_ALLOC: &str = "_gc_alloc";
pub const EQUALS: &str = "_equals";
pub const CASE_ABORT: &str = "_case_abort";
pub const CASE_ABORT_2: &str = "_case_abort_2";
pub const DISPATCH_ABORT: &str = "_dispatch_abort";
pub const INIT_RUNTIME: &str = "_init_runtime";
pub const FINISH_RUNTIME: &str = "_finish_runtime";
pub const VERIFY_OOP: &str = "_verify_oop";

/// Handles to the runtime helpers, declared once per module. The
/// signatures are fixed regardless of the GC selected at run time.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSymbols {
    pub gc_alloc: FuncId,
    pub equals: FuncId,
    pub case_abort: FuncId,
    pub case_abort_2: FuncId,
    pub dispatch_abort: FuncId,
    pub init_runtime: FuncId,
    pub finish_runtime: FuncId,
    pub verify_oop: FuncId,
}

impl RuntimeSymbols {
    pub fn declare(module: &mut Module) -> Self {
        let param = |name: &str, ty: OperandType| (name.to_string(), ty);

        RuntimeSymbols {
            gc_alloc: module.declare_function(
                GC_ALLOC,
                &[
                    param("tag", OperandType::Int32),
                    param("size", OperandType::UInt64),
                    param("disp_tab", OperandType::Pointer),
                ],
                OperandType::Pointer,
            ),
            equals: module.declare_function(
                EQUALS,
                &[param("lhs", OperandType::Pointer), param("rhs", OperandType::Pointer)],
                OperandType::Int32,
            ),
            case_abort: module.declare_function(
                CASE_ABORT,
                &[param("tag", OperandType::Int32)],
                OperandType::Void,
            ),
            case_abort_2: module.declare_function(
                CASE_ABORT_2,
                &[
                    param("filename", OperandType::Pointer),
                    param("linenumber", OperandType::Int32),
                ],
                OperandType::Void,
            ),
            dispatch_abort: module.declare_function(
                DISPATCH_ABORT,
                &[
                    param("filename", OperandType::Pointer),
                    param("linenumber", OperandType::Int32),
                ],
                OperandType::Void,
            ),
            init_runtime: module.declare_function(
                INIT_RUNTIME,
                &[param("argc", OperandType::Int32), param("argv", OperandType::Pointer)],
                OperandType::Void,
            ),
            finish_runtime: module
                .declare_function(FINISH_RUNTIME, &[], OperandType::Void),
            verify_oop: module.declare_function(
                VERIFY_OOP,
                &[param("obj", OperandType::Pointer)],
                OperandType::Void,
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Emitter contract
// ---------------------------------------------------------------------------

/// A target-specific code emitter. Implementations receive the typed
/// AST through the class tree, the Klass registry for layout, and the
/// IR module for bodies and data, and append to their own code
/// stream.
///
/// Obligations beyond the method signatures:
///   - the init function chains to the parent's init, sets
///     trivial-type defaults, then evaluates initialisers in source
///     order;
///   - safepoints follow the GC contract: shadow-stack pushes/pops
///     around every possibly-allocating call, or stack-map records at
///     each such call site;
///   - the runtime entry initialises the GC, constructs `Main`,
///     invokes `Main.main`, tears the runtime down and returns 0.
pub trait CodeGen {
    type Output;

    /// One `<Class>_init` per class.
    fn emit_class_init(&mut self, class: &Class, analysis: &Analysis, klasses: &KlassBuilder);

    /// One `<Class>_<method>` per method defined (not inherited) by
    /// the class.
    fn emit_method(
        &mut self,
        class: &Class,
        method: &Feature,
        analysis: &Analysis,
        klasses: &KlassBuilder,
        module: &Module,
    );

    /// The `main` symbol invoking the runtime entry.
    fn emit_runtime_entry(&mut self, analysis: &Analysis, klasses: &KlassBuilder);

    fn finish(self, module: &Module) -> Self::Output;
}

/// Drive an emitter over a checked program in tag order.
pub fn emit_program<G: CodeGen>(
    mut gen: G,
    analysis: &Analysis,
    klasses: &KlassBuilder,
    module: &Module,
) -> G::Output {
    let ids: Vec<TypeId> = klasses.klasses().map(|k| k.name()).collect();

    for id in ids {
        let class = analysis.tree.class(id);
        gen.emit_class_init(class, analysis, klasses);
        for feature in &class.features {
            if feature.is_method() {
                gen.emit_method(class, feature, analysis, klasses, module);
            }
        }
    }
    gen.emit_runtime_entry(analysis, klasses);

    gen.finish(module)
}
