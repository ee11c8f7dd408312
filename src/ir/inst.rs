/// IR instructions
///
/// An instruction is a tagged kind plus the common def/uses slots; the
/// kind discriminant replaces virtual dispatch. Use positions are
/// fixed per kind:
///
///   Store      uses = [base, offset, value], no def
///   Load       uses = [base, offset], def
///   CondBranch uses = [cond]
///   Binary     uses = [lhs, rhs], def
///   Unary/Move uses = [operand], def
///   Call       uses = args, def iff callee returns non-void
///   Ret        uses = [] | [value]
///   Phi        uses mirror the path operands in path order

use super::oper::{BlockId, FuncId, OperId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
    Shl,
    Or,
    Xor,
    Lt,
    Le,
    Eq,
    Gt,
}

impl BinaryKind {
    pub fn is_logic(self) -> bool {
        matches!(self, BinaryKind::Lt | BinaryKind::Le | BinaryKind::Eq | BinaryKind::Gt)
    }

    /// Two's-complement constant folding.
    pub fn fold(self, lhs: i64, rhs: i64) -> Option<i64> {
        Some(match self {
            BinaryKind::Add => lhs.wrapping_add(rhs),
            BinaryKind::Sub => lhs.wrapping_sub(rhs),
            BinaryKind::Mul => lhs.wrapping_mul(rhs),
            BinaryKind::Div => {
                if rhs == 0 {
                    return None;
                }
                lhs.wrapping_div(rhs)
            }
            BinaryKind::Shl => lhs.wrapping_shl(rhs as u32),
            BinaryKind::Or => lhs | rhs,
            BinaryKind::Xor => lhs ^ rhs,
            BinaryKind::Lt => (lhs < rhs) as i64,
            BinaryKind::Le => (lhs <= rhs) as i64,
            BinaryKind::Eq => (lhs == rhs) as i64,
            BinaryKind::Gt => (lhs > rhs) as i64,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryKind::Add => "+",
            BinaryKind::Sub => "-",
            BinaryKind::Mul => "*",
            BinaryKind::Div => "/",
            BinaryKind::Shl => "<<",
            BinaryKind::Or => "|",
            BinaryKind::Xor => "^",
            BinaryKind::Lt => "<",
            BinaryKind::Le => "<=",
            BinaryKind::Eq => "==",
            BinaryKind::Gt => ">",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Neg,
    Not,
}

impl UnaryKind {
    pub fn fold(self, value: i64) -> i64 {
        match self {
            UnaryKind::Neg => value.wrapping_neg(),
            UnaryKind::Not => (value == 0) as i64,
        }
    }
}

#[derive(Debug, Clone)]
pub enum InstKind {
    /// Ordered (predecessor block, incoming operand) paths.
    Phi { paths: Vec<(BlockId, OperId)> },
    Store,
    Load,
    Branch { target: BlockId },
    CondBranch { taken: BlockId, not_taken: BlockId },
    Binary(BinaryKind),
    Unary(UnaryKind),
    Move,
    Call { callee: FuncId },
    Ret,
}

#[derive(Debug)]
pub struct Inst {
    pub kind: InstKind,
    pub def: Option<OperId>,
    pub uses: Vec<OperId>,
    /// Owning block; `None` once erased.
    pub block: Option<BlockId>,
}

impl Inst {
    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstKind::Phi { .. })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Branch { .. } | InstKind::CondBranch { .. } | InstKind::Ret
        )
    }

    /// Successor blocks named by a terminator.
    pub fn targets(&self) -> Vec<BlockId> {
        match self.kind {
            InstKind::Branch { target } => vec![target],
            InstKind::CondBranch { taken, not_taken } => vec![taken, not_taken],
            _ => Vec::new(),
        }
    }

    /// The operand flowing in from `block`, for phis.
    pub fn phi_path(&self, block: BlockId) -> Option<OperId> {
        match &self.kind {
            InstKind::Phi { paths } => {
                paths.iter().find(|(b, _)| *b == block).map(|(_, o)| *o)
            }
            _ => None,
        }
    }
}
