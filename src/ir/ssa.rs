/// SSA construction
///
/// Three phases per function: phi insertion driven by the dominance
/// frontier, renaming via per-variable version stacks along a
/// pre-order walk of the dominator tree, and pruning of phis whose
/// defs never reach a non-phi use.

use super::cfg::{self, DfsOrder, DominanceInfo};
use super::{BlockId, Function, InstId, OperId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub fn construct_ssa(func: &mut Function) {
    if func.cfg_root().is_none() {
        return;
    }

    let info = cfg::dominance(func);

    // 1. phi insertion
    insert_phis(func, &info);

    // 2. renaming; formals are the first defs
    let mut stacks: HashMap<OperId, Vec<OperId>> = HashMap::new();
    let mut versions: HashMap<OperId, u32> = HashMap::new();
    for i in 0..func.params().len() {
        let param = func.param(i);
        let renamed = next_version(func, &mut versions, param);
        stacks.entry(param).or_default().push(renamed);
        func.set_param(i, renamed);
    }
    let root = func.cfg_root().expect("checked above");
    rename(func, &info, root, &mut stacks, &mut versions);

    // 3. pruning
    prune(func, &info);
}

// ---------------------------------------------------------------------------
// Phase 1: phi insertion
// ---------------------------------------------------------------------------

/// Blocks containing a definition of each variable, in deterministic
/// order.
fn defs_in_blocks(func: &mut Function) -> BTreeMap<OperId, BTreeSet<BlockId>> {
    let mut var_to_blocks: BTreeMap<OperId, BTreeSet<BlockId>> = BTreeMap::new();

    for block in cfg::traversal(func, DfsOrder::ReversePostorder) {
        for &inst_id in &func.block(block).insts {
            if let Some(def) = func.inst(inst_id).def {
                if func.oper(def).is_variable() {
                    var_to_blocks.entry(def).or_default().insert(block);
                }
            }
        }
    }
    var_to_blocks
}

fn insert_phis(func: &mut Function, info: &DominanceInfo) {
    let defs = defs_in_blocks(func);

    for (var, def_blocks) in defs {
        let mut has_phi: BTreeSet<BlockId> = BTreeSet::new();
        let mut worklist = def_blocks.clone();

        while let Some(&x) = worklist.iter().next() {
            worklist.remove(&x);
            let frontier = match info.frontier(x) {
                Some(frontier) => frontier.clone(),
                None => continue,
            };
            for y in frontier {
                if !has_phi.contains(&y) {
                    func.insert_phi(var, y);
                    has_phi.insert(y);
                    if !def_blocks.contains(&y) {
                        worklist.insert(y);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Phase 2: renaming
// ---------------------------------------------------------------------------

fn next_version(
    func: &mut Function,
    versions: &mut HashMap<OperId, u32>,
    var: OperId,
) -> OperId {
    let root = func.oper(var).original_var(var);
    let version = versions.entry(root).or_insert(0);
    *version += 1;
    func.version_of(var, *version)
}

fn rename(
    func: &mut Function,
    info: &DominanceInfo,
    block: BlockId,
    stacks: &mut HashMap<OperId, Vec<OperId>>,
    versions: &mut HashMap<OperId, u32>,
) {
    // versions pushed in this block, to pop on exit
    let mut pushed: Vec<OperId> = Vec::new();

    for inst_id in func.block(block).insts.clone() {
        if func.inst(inst_id).is_phi() {
            // each phi invents a fresh version of its variable
            let def = func.inst(inst_id).def.expect("phi def");
            let renamed = next_version(func, versions, def);
            func.update_def(inst_id, renamed);
            stacks.entry(def).or_default().push(renamed);
            pushed.push(def);
        } else {
            // rewrite uses with the current version; a use with no
            // stacked version is a formal parameter reference left as is
            for use_id in func.inst(inst_id).uses.clone() {
                if !func.oper(use_id).is_variable() {
                    continue;
                }
                if let Some(&top) = stacks.get(&use_id).and_then(|s| s.last()) {
                    func.update_use(inst_id, use_id, top);
                }
            }

            if let Some(def) = func.inst(inst_id).def {
                if func.oper(def).is_variable() {
                    let renamed = next_version(func, versions, def);
                    func.update_def(inst_id, renamed);
                    stacks.entry(def).or_default().push(renamed);
                    pushed.push(def);
                }
            }
        }
    }

    // fill in phi paths of successors with the reaching version
    for succ in func.block(block).succs.clone() {
        for inst_id in func.block(succ).insts.clone() {
            if !func.inst(inst_id).is_phi() {
                break;
            }
            let def = func.inst(inst_id).def.expect("phi def");
            let original = func.oper(def).original_var(def);
            if let Some(&top) = stacks.get(&original).and_then(|s| s.last()) {
                func.phi_add_path(inst_id, top, block);
            }
        }
    }

    for &child in info.dominated_by(block) {
        rename(func, info, child, stacks, versions);
    }

    for var in pushed {
        let stack = stacks.get_mut(&var).expect("pushed in this block");
        stack.pop();
        if stack.is_empty() {
            stacks.remove(&var);
        }
    }
}

// ---------------------------------------------------------------------------
// Phase 3: pruning
// ---------------------------------------------------------------------------

fn prune(func: &mut Function, info: &DominanceInfo) {
    let mut alive = vec![false; func.opers_len()];
    let mut worklist: Vec<OperId> = Vec::new();

    let root = func.cfg_root().expect("non-empty CFG");
    prune_initialize(func, info, root, &mut alive, &mut worklist);
    prune_propagate(func, &mut alive, &mut worklist);
    prune_delete_dead_phis(func, &alive);
}

/// Seed with variables used by non-phi instructions whose definition
/// is a phi, in dominance order.
fn prune_initialize(
    func: &Function,
    info: &DominanceInfo,
    block: BlockId,
    alive: &mut [bool],
    worklist: &mut Vec<OperId>,
) {
    for &inst_id in &func.block(block).insts {
        if func.inst(inst_id).is_phi() {
            continue;
        }
        for &use_id in &func.inst(inst_id).uses {
            if !func.oper(use_id).is_variable() {
                continue;
            }
            if let Some(def_inst) = func.def_of(use_id) {
                if func.inst(def_inst).is_phi() && !alive[use_id.index()] {
                    alive[use_id.index()] = true;
                    worklist.push(use_id);
                }
            }
        }
    }

    for &child in info.dominated_by(block) {
        prune_initialize(func, info, child, alive, worklist);
    }
}

fn prune_propagate(func: &Function, alive: &mut [bool], worklist: &mut Vec<OperId>) {
    while let Some(var) = worklist.pop() {
        // no def at all: a formal parameter
        let def_inst = match func.def_of(var) {
            Some(inst) => inst,
            None => continue,
        };
        if !func.inst(def_inst).is_phi() {
            continue;
        }
        for &use_id in &func.inst(def_inst).uses {
            if !alive[use_id.index()] {
                alive[use_id.index()] = true;
                worklist.push(use_id);
            }
        }
    }
}

fn prune_delete_dead_phis(func: &mut Function, alive: &[bool]) {
    let mut for_delete: Vec<InstId> = Vec::new();

    for block in cfg::traversal(func, DfsOrder::Preorder) {
        for &inst_id in &func.block(block).insts {
            if !func.inst(inst_id).is_phi() {
                break;
            }
            let def = func.inst(inst_id).def.expect("phi def");
            if !alive[def.index()] {
                for_delete.push(inst_id);
            }
        }
    }

    for inst_id in for_delete {
        func.erase(inst_id);
    }
}

// ---------------------------------------------------------------------------
// Invariant checking (used by tests and debug assertions)
// ---------------------------------------------------------------------------

/// Check the SSA invariants: every variable has at most one
/// definition (zero only for formals), and every phi's path blocks
/// are exactly its block's predecessors.
pub fn verify(func: &mut Function) -> Result<(), String> {
    for block in cfg::traversal(func, DfsOrder::Preorder) {
        for &inst_id in &func.block(block).insts {
            let inst = func.inst(inst_id);
            if let Some(def) = inst.def {
                let defs = &func.oper(def).defs;
                if func.oper(def).is_variable() && defs.len() > 1 {
                    return Err(format!(
                        "variable {} has {} definitions",
                        func.oper(def).name(),
                        defs.len()
                    ));
                }
            }
            if let super::InstKind::Phi { paths } = &inst.kind {
                let mut path_blocks: Vec<BlockId> = paths.iter().map(|(b, _)| *b).collect();
                let mut preds = func.block(block).preds.clone();
                path_blocks.sort();
                path_blocks.dedup();
                preds.sort();
                preds.dedup();
                if path_blocks != preds {
                    return Err(format!(
                        "phi in {} has paths {:?} but predecessors {:?}",
                        func.block(block).name,
                        path_blocks,
                        preds
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Number of phi instructions still attached to blocks.
pub fn count_phis(func: &mut Function) -> usize {
    let mut count = 0;
    for block in cfg::traversal(func, DfsOrder::Preorder) {
        for &inst_id in &func.block(block).insts {
            if func.inst(inst_id).is_phi() {
                count += 1;
            }
        }
    }
    count
}
