/// Scalar optimisation passes
///
///   - copy propagation: sparse conditional walk over the CFG; phi
///     defs take the common representative of their live-in operands,
///     moves forward their source, every other def represents itself.
///     After convergence the representative chains are compressed and
///     uses of dead copies rewritten.
///   - dead-allocation elimination: erases boxed-Int allocations whose
///     only observers are the payload store and the class init call.
///   - null-check elimination: removes a null test on a value that is
///     non-null on every path (fresh allocation, or a dominating check
///     already proved it).

use super::cfg::{self, DfsOrder};
use super::{BinaryKind, BlockId, FuncId, Function, InstId, InstKind, OperId};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Copy propagation
// ---------------------------------------------------------------------------

pub fn copy_propagation(func: &mut Function) {
    if func.cfg_root().is_none() {
        return;
    }

    let rpo = cfg::traversal(func, DfsOrder::ReversePostorder);
    let mut copies: HashMap<OperId, OperId> = HashMap::new();

    let rep = |copies: &HashMap<OperId, OperId>, o: OperId| copies.get(&o).copied().unwrap_or(o);

    // iterate the transfer functions to a fixed point; every block in
    // the traversal is executable (cond branches push both targets)
    let mut changed = true;
    while changed {
        changed = false;
        for &block in &rpo {
            for &inst_id in &func.block(block).insts {
                let inst = func.inst(inst_id);
                let new_rep = match (&inst.kind, inst.def) {
                    (InstKind::Phi { paths }, Some(def)) => {
                        let mut common: Option<OperId> = None;
                        let mut conflict = false;
                        for &(_, oper) in paths {
                            let oper_rep = rep(&copies, oper);
                            match common {
                                None => common = Some(oper_rep),
                                Some(existing) if existing != oper_rep => {
                                    conflict = true;
                                    break;
                                }
                                Some(_) => {}
                            }
                        }
                        let result = match (common, conflict) {
                            (Some(common), false) => common,
                            _ => def,
                        };
                        Some((def, result))
                    }
                    (InstKind::Move, Some(def)) => {
                        let src = inst.uses[0];
                        // nobody defines constants or globals
                        if !func.oper(src).is_variable() {
                            copies.entry(src).or_insert(src);
                        }
                        Some((def, src))
                    }
                    (_, Some(def)) => Some((def, def)),
                    (_, None) => None,
                };

                if let Some((def, result)) = new_rep {
                    if copies.get(&def) != Some(&result) {
                        copies.insert(def, result);
                        changed = true;
                    }
                }
            }
        }
    }

    // compress representative chains
    let keys: Vec<OperId> = copies.keys().copied().collect();
    for key in keys {
        let mut best = copies[&key];
        let mut steps = 0;
        while copies.get(&best).map_or(false, |&next| next != best) {
            best = copies[&best];
            steps += 1;
            if steps > copies.len() {
                best = key; // representative cycle; keep the copy
                break;
            }
        }
        copies.insert(key, best);
    }

    // rewrite every use of a dead copy to its representative
    for (&dst, &src) in &copies {
        if dst == src {
            continue;
        }
        for user in func.oper(dst).uses.clone() {
            func.update_use(user, dst, src);
        }
    }
}

// ---------------------------------------------------------------------------
// Dead-allocation elimination (boxed Ints)
// ---------------------------------------------------------------------------

/// Erase `_gc_alloc` calls with the Int tag whose result is observed
/// only by the cast copy, the payload store through it, and the
/// adjacent `Int_init` call. Returns the number of allocations
/// removed.
pub fn dead_allocation_elimination(
    func: &mut Function,
    alloc_callee: FuncId,
    int_tag: i64,
    init_callee: FuncId,
) -> usize {
    let mut eliminated = 0;

    loop {
        let victim = find_dead_allocation(func, alloc_callee, int_tag, init_callee);
        match victim {
            Some(chain) => {
                for inst in chain {
                    func.erase(inst);
                }
                eliminated += 1;
            }
            None => return eliminated,
        }
    }
}

fn find_dead_allocation(
    func: &mut Function,
    alloc_callee: FuncId,
    int_tag: i64,
    init_callee: FuncId,
) -> Option<Vec<InstId>> {
    for block in cfg::traversal(func, DfsOrder::ReversePostorder) {
        let insts = func.block(block).insts.clone();
        for (pos, &inst_id) in insts.iter().enumerate() {
            let inst = func.inst(inst_id);
            let is_int_alloc = matches!(inst.kind, InstKind::Call { callee } if callee == alloc_callee)
                && inst
                    .uses
                    .first()
                    .and_then(|&tag| func.oper(tag).constant_value())
                    .map_or(false, |tag| tag == int_tag);
            if !is_int_alloc {
                continue;
            }

            let def = match inst.def {
                Some(def) => def,
                None => continue,
            };

            // sole user must be the cast copy
            let users = &func.oper(def).uses;
            if users.len() != 1 {
                continue;
            }
            let cast = users[0];
            if !matches!(func.inst(cast).kind, InstKind::Move) {
                continue;
            }
            let cast_def = match func.inst(cast).def {
                Some(d) => d,
                None => continue,
            };

            // cast users: exactly the payload store and the init call
            let cast_users = func.oper(cast_def).uses.clone();
            if cast_users.len() != 2 {
                continue;
            }
            let mut store = None;
            let mut init = None;
            for user in cast_users {
                match func.inst(user).kind {
                    InstKind::Store if func.inst(user).uses[0] == cast_def => store = Some(user),
                    InstKind::Call { callee } if callee == init_callee => init = Some(user),
                    _ => {}
                }
            }
            let (store, init) = match (store, init) {
                (Some(store), Some(init)) => (store, init),
                _ => continue,
            };

            // the init call sits right below the allocation chain
            let init_pos = insts.iter().position(|&i| i == init);
            match init_pos {
                Some(p) if p > pos && p <= pos + 3 => {}
                _ => continue,
            }

            return Some(vec![init, store, cast, inst_id]);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Null-check elimination
// ---------------------------------------------------------------------------

/// A null check is a conditional branch on `x == 0`; the taken edge
/// leads to the abort path. Returns the number of checks removed.
pub fn null_check_elimination(func: &mut Function, nonnull_callees: &[FuncId]) -> usize {
    if func.cfg_root().is_none() {
        return 0;
    }

    let info = cfg::dominance(func);
    let checks = collect_null_checks(func);
    let mut eliminated = 0;

    for &(block, cond_br, eq_inst, tested) in &checks {
        let fresh = func.def_of(tested).map_or(false, |def| {
            matches!(func.inst(def).kind, InstKind::Call { callee } if nonnull_callees.contains(&callee))
        });

        // a prior check on the same value whose non-null edge
        // dominates this block
        let already_checked = checks.iter().any(|&(_, other_br, _, other_tested)| {
            if other_br == cond_br || other_tested != tested {
                return false;
            }
            match func.inst(other_br).kind {
                InstKind::CondBranch { not_taken, .. } => info.dominate(not_taken, block),
                _ => false,
            }
        });

        if !(fresh || already_checked) {
            continue;
        }

        let (taken, not_taken) = match func.inst(cond_br).kind {
            InstKind::CondBranch { taken, not_taken } => (taken, not_taken),
            _ => continue,
        };

        func.erase(cond_br);
        func.disconnect(block, taken);
        func.append(block, InstKind::Branch { target: not_taken }, None, Vec::new());

        // the comparison usually dies with its branch
        if func.oper(func.inst(eq_inst).def.expect("eq def")).uses.is_empty() {
            func.erase(eq_inst);
        }
        eliminated += 1;
    }

    eliminated
}

/// (block, cond-branch, eq-instruction, tested operand) of every
/// `x == 0` branch.
fn collect_null_checks(func: &mut Function) -> Vec<(BlockId, InstId, InstId, OperId)> {
    let mut checks = Vec::new();
    for block in cfg::traversal(func, DfsOrder::ReversePostorder) {
        let insts = &func.block(block).insts;
        let &last = match insts.last() {
            Some(last) => last,
            None => continue,
        };
        if !matches!(func.inst(last).kind, InstKind::CondBranch { .. }) {
            continue;
        }

        let cond = func.inst(last).uses[0];
        let eq_inst = match func.def_of(cond) {
            Some(inst) => inst,
            None => continue,
        };
        if !matches!(func.inst(eq_inst).kind, InstKind::Binary(BinaryKind::Eq)) {
            continue;
        }

        let lhs = func.inst(eq_inst).uses[0];
        let rhs = func.inst(eq_inst).uses[1];
        let tested = if func.oper(rhs).constant_value() == Some(0) {
            lhs
        } else if func.oper(lhs).constant_value() == Some(0) {
            rhs
        } else {
            continue;
        };

        checks.push((block, last, eq_inst, tested));
    }
    checks
}
