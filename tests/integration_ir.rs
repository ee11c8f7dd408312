/// Integration tests for the IR: builder folding, dominance, SSA
/// construction, and the scalar passes.
///
/// These tests verify:
///   • Constant folding and global-constant load folding in IRBuilder
///   • Dominators and dominance frontiers on a diamond
///   • SSA: one pruned phi on the diamond, invariants hold, and a
///     second construction run is a no-op
///   • Copy propagation collapses move chains and is idempotent
///   • Dead-allocation elimination erases the boxed-Int chain
///   • Null-check elimination for fresh allocations and dominated
///     re-checks
use coolc::ir::{
    cfg, opt, ssa, BlockId, FuncId, GlobalInit, IRBuilder, InstKind, Module, OperId, OperandType,
    StructuredData,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn new_func(module: &mut Module) -> FuncId {
    module.declare_function(
        "test",
        &[("p".to_string(), OperandType::Int64)],
        OperandType::Int64,
    )
}

/// entry ── p == 0 ──> then ──┐
///    └────────────> els ──┴──> merge(ret x)
/// with x defined in all three leading blocks.
fn build_diamond(module: &mut Module, func: FuncId) -> (BlockId, BlockId, BlockId, BlockId, OperId) {
    let mut builder = IRBuilder::new(module, func);

    let entry = builder.new_block("entry");
    let then_b = builder.new_block("then");
    let else_b = builder.new_block("else");
    let merge = builder.new_block("merge");
    builder.func_mut().set_cfg(entry);

    let x = builder.func_mut().var("x", OperandType::Int64);
    let p = builder.func().param(0);

    builder.set_current_block(entry);
    let one = builder.func_mut().constant(1, OperandType::Int64);
    builder.move_to(x, one);
    let zero = builder.func_mut().constant(0, OperandType::Int64);
    let cond = builder.eq(p, zero);
    builder.cond_br(cond, then_b, else_b);

    builder.set_current_block(then_b);
    let two = builder.func_mut().constant(2, OperandType::Int64);
    builder.move_to(x, two);
    builder.br(merge);

    builder.set_current_block(else_b);
    let three = builder.func_mut().constant(3, OperandType::Int64);
    builder.move_to(x, three);
    builder.br(merge);

    builder.set_current_block(merge);
    builder.ret(Some(x));

    (entry, then_b, else_b, merge, x)
}

// ─── Builder folding ──────────────────────────────────────────────────────────

#[test]
fn test_constant_binary_ops_fold_at_build_time() {
    let mut module = Module::new();
    let func = new_func(&mut module);
    let mut builder = IRBuilder::new(&mut module, func);

    let entry = builder.new_block("entry");
    builder.func_mut().set_cfg(entry);
    builder.set_current_block(entry);

    let two = builder.func_mut().constant(2, OperandType::Int64);
    let three = builder.func_mut().constant(3, OperandType::Int64);
    let sum = builder.add(two, three);
    let product = builder.mul(sum, three);

    assert_eq!(builder.func().oper(sum).constant_value(), Some(5));
    assert_eq!(builder.func().oper(product).constant_value(), Some(15));
    assert!(builder.func().block(entry).insts.is_empty(), "nothing was emitted");
}

#[test]
fn test_division_by_zero_is_not_folded() {
    let mut module = Module::new();
    let func = new_func(&mut module);
    let mut builder = IRBuilder::new(&mut module, func);

    let entry = builder.new_block("entry");
    builder.func_mut().set_cfg(entry);
    builder.set_current_block(entry);

    let one = builder.func_mut().constant(1, OperandType::Int64);
    let zero = builder.func_mut().constant(0, OperandType::Int64);
    let quotient = builder.div(one, zero);

    assert_eq!(builder.func().oper(quotient).constant_value(), None);
    assert_eq!(builder.func().block(entry).insts.len(), 1);
}

#[test]
fn test_load_from_global_constant_folds_to_field() {
    let mut module = Module::new();
    module.add_constant(StructuredData::new(
        "proto",
        vec![
            GlobalInit::Int(7, OperandType::Int64),
            GlobalInit::Label("other".to_string()),
        ],
    ));
    let func = new_func(&mut module);
    let mut builder = IRBuilder::new(&mut module, func);

    let entry = builder.new_block("entry");
    builder.func_mut().set_cfg(entry);
    builder.set_current_block(entry);

    let base = builder.func_mut().global("proto", OperandType::Pointer);

    let offset0 = builder.field_offset(0);
    let folded_int = builder.ld(OperandType::Int64, base, offset0);
    assert_eq!(builder.func().oper(folded_int).constant_value(), Some(7));

    let offset1 = builder.field_offset(std::mem::size_of::<usize>());
    let folded_label = builder.ld(OperandType::Pointer, base, offset1);
    assert!(builder.func().oper(folded_label).is_global());

    assert!(builder.func().block(entry).insts.is_empty(), "both loads folded");
}

// ─── Dominance ────────────────────────────────────────────────────────────────

#[test]
fn test_diamond_dominance() {
    let mut module = Module::new();
    let func_id = new_func(&mut module);
    let (entry, then_b, else_b, merge, _) = build_diamond(&mut module, func_id);

    let func = module.func_mut(func_id);
    let info = cfg::dominance(func);

    assert_eq!(info.idom(entry), Some(entry));
    assert_eq!(info.idom(then_b), Some(entry));
    assert_eq!(info.idom(else_b), Some(entry));
    assert_eq!(info.idom(merge), Some(entry), "neither branch dominates the join");

    assert!(info.frontier(then_b).expect("DF(then)").contains(&merge));
    assert!(info.frontier(else_b).expect("DF(else)").contains(&merge));
    assert!(info.frontier(merge).is_none());

    assert!(info.dominate(entry, merge));
    assert!(!info.dominate(then_b, merge));
}

#[test]
fn test_edge_traversal_covers_every_edge() {
    let mut module = Module::new();
    let func_id = new_func(&mut module);
    let (entry, then_b, else_b, merge, _) = build_diamond(&mut module, func_id);

    let func = module.func_mut(func_id);
    let mut edges = cfg::edge_traversal(func);
    edges.sort();

    let mut expected =
        vec![(entry, then_b), (entry, else_b), (then_b, merge), (else_b, merge)];
    expected.sort();
    assert_eq!(edges, expected);
}

// ─── SSA construction ─────────────────────────────────────────────────────────

#[test]
fn test_diamond_gets_one_pruned_phi() {
    let mut module = Module::new();
    let func_id = new_func(&mut module);
    let (_, _, _, merge, _) = build_diamond(&mut module, func_id);

    let func = module.func_mut(func_id);
    ssa::construct_ssa(func);

    assert_eq!(ssa::count_phis(func), 1);
    ssa::verify(func).expect("SSA invariants");

    // the phi sits at the top of the join block
    let first = func.block(merge).insts[0];
    assert!(func.inst(first).is_phi());
    match &func.inst(first).kind {
        InstKind::Phi { paths } => assert_eq!(paths.len(), 2),
        _ => unreachable!(),
    }
}

#[test]
fn test_ssa_renaming_gives_unique_defs() {
    let mut module = Module::new();
    let func_id = new_func(&mut module);
    build_diamond(&mut module, func_id);

    let func = module.func_mut(func_id);
    ssa::construct_ssa(func);

    // every variable def count is now at most one
    for block in cfg::traversal(func, cfg::DfsOrder::Preorder) {
        for &inst in &func.block(block).insts.clone() {
            if let Some(def) = func.inst(inst).def {
                assert!(func.oper(def).defs.len() <= 1);
            }
        }
    }
}

#[test]
fn test_ssa_construction_is_idempotent() {
    let mut module = Module::new();
    let func_id = new_func(&mut module);
    build_diamond(&mut module, func_id);

    let func = module.func_mut(func_id);
    ssa::construct_ssa(func);
    let phis_first = ssa::count_phis(func);

    ssa::construct_ssa(func);
    let phis_second = ssa::count_phis(func);

    assert_eq!(phis_first, phis_second, "second run inserts no live phis");
    ssa::verify(func).expect("SSA invariants after the second run");
}

#[test]
fn test_straight_line_code_needs_no_phis() {
    let mut module = Module::new();
    let func_id = new_func(&mut module);
    {
        let mut builder = IRBuilder::new(&mut module, func_id);
        let entry = builder.new_block("entry");
        builder.func_mut().set_cfg(entry);
        builder.set_current_block(entry);

        let x = builder.func_mut().var("x", OperandType::Int64);
        let p = builder.func().param(0);
        builder.move_to(x, p);
        builder.ret(Some(x));
    }

    let func = module.func_mut(func_id);
    ssa::construct_ssa(func);
    assert_eq!(ssa::count_phis(func), 0);
    ssa::verify(func).expect("SSA invariants");
}

// ─── Copy propagation ─────────────────────────────────────────────────────────

#[test]
fn test_copy_propagation_collapses_move_chains() {
    let mut module = Module::new();
    let func_id = new_func(&mut module);
    let entry;
    {
        let mut builder = IRBuilder::new(&mut module, func_id);
        entry = builder.new_block("entry");
        builder.func_mut().set_cfg(entry);
        builder.set_current_block(entry);

        let p = builder.func().param(0);
        let t1 = builder.move_new(p);
        let t2 = builder.move_new(t1);
        builder.ret(Some(t2));
    }

    let func = module.func_mut(func_id);
    opt::copy_propagation(func);

    let param = func.param(0);
    let ret = *func.block(entry).insts.last().expect("ret");
    assert_eq!(func.inst(ret).uses[0], param, "ret reads the original value");
}

#[test]
fn test_copy_propagation_is_idempotent() {
    let mut module = Module::new();
    let func_id = new_func(&mut module);
    build_diamond(&mut module, func_id);

    let func = module.func_mut(func_id);
    ssa::construct_ssa(func);

    opt::copy_propagation(func);
    let first = func.dump();
    opt::copy_propagation(func);
    let second = func.dump();

    assert_eq!(first, second);
}

// ─── Dead-allocation elimination ──────────────────────────────────────────────

const INT_TAG: i64 = 3;

fn declare_alloc_helpers(module: &mut Module) -> (FuncId, FuncId) {
    let alloc = module.declare_function(
        "_gc_alloc",
        &[
            ("tag".to_string(), OperandType::Int32),
            ("size".to_string(), OperandType::UInt64),
            ("disp_tab".to_string(), OperandType::Pointer),
        ],
        OperandType::Pointer,
    );
    let init = module.declare_function(
        "Int_init",
        &[("self".to_string(), OperandType::Pointer)],
        OperandType::Void,
    );
    (alloc, init)
}

#[test]
fn test_dead_int_allocation_is_erased() {
    let mut module = Module::new();
    let (alloc, init) = declare_alloc_helpers(&mut module);
    let func_id = new_func(&mut module);

    let entry;
    {
        let mut builder = IRBuilder::new(&mut module, func_id);
        entry = builder.new_block("entry");
        builder.func_mut().set_cfg(entry);
        builder.set_current_block(entry);

        let tag = builder.func_mut().constant(INT_TAG, OperandType::Int32);
        let size = builder.func_mut().constant(48, OperandType::UInt64);
        let disp = builder.func_mut().global("Int_dispTab", OperandType::Pointer);
        let raw = builder.call(alloc, vec![tag, size, disp]).expect("alloc def");

        let boxed = builder.move_new(raw);
        let offset = builder.field_offset(32);
        let payload = builder.func().param(0);
        builder.st(boxed, offset, payload);
        builder.call(init, vec![boxed]);

        let zero = builder.func_mut().constant(0, OperandType::Int64);
        builder.ret(Some(zero));
    }

    let func = module.func_mut(func_id);
    let before = func.block(entry).insts.len();
    let eliminated = opt::dead_allocation_elimination(func, alloc, INT_TAG, init);

    assert_eq!(eliminated, 1);
    assert_eq!(func.block(entry).insts.len(), before - 4, "alloc, cast, store, init gone");
}

#[test]
fn test_observed_allocation_is_kept() {
    let mut module = Module::new();
    let (alloc, init) = declare_alloc_helpers(&mut module);
    let func_id = new_func(&mut module);

    {
        let mut builder = IRBuilder::new(&mut module, func_id);
        let entry = builder.new_block("entry");
        builder.func_mut().set_cfg(entry);
        builder.set_current_block(entry);

        let tag = builder.func_mut().constant(INT_TAG, OperandType::Int32);
        let size = builder.func_mut().constant(48, OperandType::UInt64);
        let disp = builder.func_mut().global("Int_dispTab", OperandType::Pointer);
        let raw = builder.call(alloc, vec![tag, size, disp]).expect("alloc def");

        let boxed = builder.move_new(raw);
        let offset = builder.field_offset(32);
        let payload = builder.func().param(0);
        builder.st(boxed, offset, payload);
        builder.call(init, vec![boxed]);

        // the box escapes through the return value
        builder.ret(Some(boxed));
    }

    let func = module.func_mut(func_id);
    let eliminated = opt::dead_allocation_elimination(func, alloc, INT_TAG, init);
    assert_eq!(eliminated, 0);
}

// ─── Null-check elimination ───────────────────────────────────────────────────

#[test]
fn test_null_check_on_fresh_allocation_is_removed() {
    let mut module = Module::new();
    let (alloc, _) = declare_alloc_helpers(&mut module);
    let func_id = new_func(&mut module);

    let (entry, abort_b, cont);
    {
        let mut builder = IRBuilder::new(&mut module, func_id);
        entry = builder.new_block("entry");
        abort_b = builder.new_block("abort");
        cont = builder.new_block("cont");
        builder.func_mut().set_cfg(entry);

        builder.set_current_block(entry);
        let tag = builder.func_mut().constant(7, OperandType::Int32);
        let size = builder.func_mut().constant(64, OperandType::UInt64);
        let disp = builder.func_mut().global("A_dispTab", OperandType::Pointer);
        let obj = builder.call(alloc, vec![tag, size, disp]).expect("alloc def");

        let null = builder.func_mut().constant(0, OperandType::Pointer);
        let is_null = builder.eq(obj, null);
        builder.cond_br(is_null, abort_b, cont);

        builder.set_current_block(abort_b);
        let zero = builder.func_mut().constant(0, OperandType::Int64);
        builder.ret(Some(zero));

        builder.set_current_block(cont);
        let one = builder.func_mut().constant(1, OperandType::Int64);
        builder.ret(Some(one));
    }

    let func = module.func_mut(func_id);
    let eliminated = opt::null_check_elimination(func, &[alloc]);
    assert_eq!(eliminated, 1);

    let last = *func.block(entry).insts.last().expect("terminator");
    assert!(matches!(func.inst(last).kind, InstKind::Branch { target } if target == cont));
    assert!(func.block(abort_b).preds.is_empty(), "abort edge disconnected");
}

#[test]
fn test_dominated_duplicate_check_is_removed() {
    let mut module = Module::new();
    let (alloc, _) = declare_alloc_helpers(&mut module);
    let func_id = new_func(&mut module);

    let (entry, mid, cont);
    {
        let mut builder = IRBuilder::new(&mut module, func_id);
        entry = builder.new_block("entry");
        let abort1 = builder.new_block("abort1");
        mid = builder.new_block("mid");
        let abort2 = builder.new_block("abort2");
        cont = builder.new_block("cont");
        builder.func_mut().set_cfg(entry);

        let p = builder.func().param(0);

        builder.set_current_block(entry);
        let null = builder.func_mut().constant(0, OperandType::Int64);
        let first = builder.eq(p, null);
        builder.cond_br(first, abort1, mid);

        builder.set_current_block(abort1);
        let zero = builder.func_mut().constant(0, OperandType::Int64);
        builder.ret(Some(zero));

        builder.set_current_block(mid);
        let null2 = builder.func_mut().constant(0, OperandType::Int64);
        let second = builder.eq(p, null2);
        builder.cond_br(second, abort2, cont);

        builder.set_current_block(abort2);
        let zero = builder.func_mut().constant(0, OperandType::Int64);
        builder.ret(Some(zero));

        builder.set_current_block(cont);
        let one = builder.func_mut().constant(1, OperandType::Int64);
        builder.ret(Some(one));
    }

    let func = module.func_mut(func_id);
    let eliminated = opt::null_check_elimination(func, &[alloc]);
    assert_eq!(eliminated, 1, "only the dominated re-check goes away");

    let entry_last = *func.block(entry).insts.last().expect("terminator");
    assert!(matches!(func.inst(entry_last).kind, InstKind::CondBranch { .. }));

    let mid_last = *func.block(mid).insts.last().expect("terminator");
    assert!(matches!(func.inst(mid_last).kind, InstKind::Branch { target } if target == cont));
}

// ─── Use-def chains ───────────────────────────────────────────────────────────

#[test]
fn test_erase_maintains_use_def_chains() {
    let mut module = Module::new();
    let func_id = new_func(&mut module);

    let entry;
    {
        let mut builder = IRBuilder::new(&mut module, func_id);
        entry = builder.new_block("entry");
        builder.func_mut().set_cfg(entry);
        builder.set_current_block(entry);

        let p = builder.func().param(0);
        let t = builder.move_new(p);
        builder.ret(Some(t));
    }

    let func = module.func_mut(func_id);
    let move_inst = func.block(entry).insts[0];
    let def = func.inst(move_inst).def.expect("move def");
    let param = func.param(0);

    assert_eq!(func.oper(param).uses.len(), 1);
    assert_eq!(func.oper(def).defs.len(), 1);

    func.erase(move_inst);
    assert!(func.oper(param).uses.is_empty());
    assert!(func.oper(def).defs.is_empty());
    assert_eq!(func.block(entry).insts.len(), 1, "only the ret is left");
}
