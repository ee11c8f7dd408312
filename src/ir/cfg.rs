/// CFG traversals and dominance
///
/// Dominators follow the iterative fixed-point of "A Simple, Fast
/// Dominance Algorithm" (Cooper, Harvey, Kennedy): processed in
/// reverse post-order, `intersect` walks two fingers up the idom
/// chain toward higher post-order numbers until they meet. The
/// dominance frontier comes from the same paper's runner walk.

use super::{BlockId, Function};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfsOrder {
    Preorder,
    Postorder,
    ReversePostorder,
}

/// DFS over reachable blocks. A post-order pass (also the tail of a
/// reverse-post-order request) writes post-order numbers back into
/// the blocks.
pub fn traversal(func: &mut Function, order: DfsOrder) -> Vec<BlockId> {
    let root = match func.cfg_root() {
        Some(root) => root,
        None => return Vec::new(),
    };

    let mut visited = vec![false; func.blocks_len()];
    let mut preorder = Vec::new();
    let mut postorder = Vec::new();

    // iterative DFS keeping successor order
    let mut stack: Vec<(BlockId, usize)> = vec![(root, 0)];
    visited[root.index()] = true;
    preorder.push(root);

    while let Some(&(block, next_succ)) = stack.last() {
        let succs = &func.block(block).succs;
        if next_succ < succs.len() {
            let succ = succs[next_succ];
            stack.last_mut().expect("non-empty stack").1 += 1;
            if !visited[succ.index()] {
                visited[succ.index()] = true;
                preorder.push(succ);
                stack.push((succ, 0));
            }
        } else {
            postorder.push(block);
            stack.pop();
        }
    }

    match order {
        DfsOrder::Preorder => preorder,
        DfsOrder::Postorder | DfsOrder::ReversePostorder => {
            for (num, &block) in postorder.iter().enumerate() {
                func.block_mut(block).postorder = num as i32;
            }
            if order == DfsOrder::Postorder {
                postorder
            } else {
                postorder.reverse();
                postorder
            }
        }
    }
}

/// In-order traversal: every (block, successor) edge in DFS order,
/// each block expanded once.
pub fn edge_traversal(func: &mut Function) -> Vec<(BlockId, BlockId)> {
    let mut edges = Vec::new();
    for block in traversal(func, DfsOrder::Preorder) {
        for &succ in &func.block(block).succs {
            edges.push((block, succ));
        }
    }
    edges
}

// ---------------------------------------------------------------------------
// Dominance
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DominanceInfo {
    /// Immediate dominator of every reachable block; the root maps to
    /// itself.
    idom: HashMap<BlockId, BlockId>,
    tree: HashMap<BlockId, Vec<BlockId>>,
    frontier: HashMap<BlockId, BTreeSet<BlockId>>,
}

impl DominanceInfo {
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied()
    }

    pub fn dominance(&self) -> &HashMap<BlockId, BlockId> {
        &self.idom
    }

    /// Children in the dominator tree.
    pub fn dominated_by(&self, block: BlockId) -> &[BlockId] {
        self.tree.get(&block).map_or(&[], |v| v.as_slice())
    }

    pub fn frontier(&self, block: BlockId) -> Option<&BTreeSet<BlockId>> {
        self.frontier.get(&block)
    }

    /// `dominator` (possibly transitively) dominates `dominatee`.
    pub fn dominate(&self, dominator: BlockId, dominatee: BlockId) -> bool {
        if dominator == dominatee {
            return true;
        }
        let mut stack = vec![dominator];
        while let Some(block) = stack.pop() {
            for &child in self.dominated_by(block) {
                if child == dominatee {
                    return true;
                }
                stack.push(child);
            }
        }
        false
    }
}

pub fn dominance(func: &mut Function) -> DominanceInfo {
    let root = func.cfg_root().expect("dominance over an empty CFG");
    let mut rpo = traversal(func, DfsOrder::ReversePostorder);
    rpo.retain(|&b| b != root);

    let mut info = DominanceInfo::default();
    info.idom.insert(root, root);

    let mut changed = true;
    while changed {
        changed = false;
        for &block in &rpo {
            let preds = &func.block(block).preds;

            let mut new_idom = match preds.iter().find(|p| info.idom.contains_key(p)) {
                Some(&p) => p,
                None => continue,
            };
            for &pred in preds {
                if pred != new_idom && info.idom.contains_key(&pred) {
                    new_idom = intersect(func, &info, pred, new_idom);
                }
            }

            if info.idom.get(&block) != Some(&new_idom) {
                info.idom.insert(block, new_idom);
                changed = true;
            }
        }
    }

    dominator_tree(root, &mut info);
    dominance_frontier(func, &mut info);
    info
}

/// Walk both fingers toward higher post-order numbers until they meet.
fn intersect(func: &Function, info: &DominanceInfo, b1: BlockId, b2: BlockId) -> BlockId {
    let mut finger1 = b1;
    let mut finger2 = b2;

    while func.block(finger1).postorder != func.block(finger2).postorder {
        while func.block(finger1).postorder < func.block(finger2).postorder {
            finger1 = info.idom[&finger1];
        }
        while func.block(finger2).postorder < func.block(finger1).postorder {
            finger2 = info.idom[&finger2];
        }
    }
    finger1
}

/// The dominator tree is the inverted idom map.
fn dominator_tree(root: BlockId, info: &mut DominanceInfo) {
    for (&block, &dom) in &info.idom {
        if block != root || dom != root {
            info.tree.entry(dom).or_default().push(block);
        }
    }
    if let Some(children) = info.tree.get_mut(&root) {
        children.retain(|&b| b != root);
        children.sort();
    }
    for children in info.tree.values_mut() {
        children.sort();
    }
}

fn dominance_frontier(func: &Function, info: &mut DominanceInfo) {
    let joins: Vec<(BlockId, BlockId)> = info
        .idom
        .iter()
        .filter(|(b, _)| func.block(**b).preds.len() >= 2)
        .map(|(&b, &d)| (b, d))
        .collect();

    for (block, idom) in joins {
        for pred in func.block(block).preds.clone() {
            if !info.idom.contains_key(&pred) {
                continue; // unreachable predecessor
            }
            let mut runner = pred;
            while runner != idom {
                info.frontier.entry(runner).or_default().insert(block);
                runner = info.idom[&runner];
            }
        }
    }
}
