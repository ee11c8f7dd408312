/// AST definitions for Cool
///
/// The tree is owned top-down (Program → Class → Feature → Expr); all
/// type references are interned `TypeId` indices into a `TypeTable`,
/// and parent classes are referenced by type id resolved through the
/// analyzer's class registry. Nothing in the tree points back up.

use crate::errors::Line;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Type interning
// ---------------------------------------------------------------------------

/// Index into the `TypeTable`. Cheap to copy and compare; two ids are
/// equal iff the type names are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TypeId(u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Well-known types, interned at fixed slots by `TypeTable::new`.
pub const OBJECT: TypeId = TypeId(0);
pub const IO: TypeId = TypeId(1);
pub const INT: TypeId = TypeId(2);
pub const BOOL: TypeId = TypeId(3);
pub const STRING: TypeId = TypeId(4);
pub const SELF_TYPE: TypeId = TypeId(5);
/// Sentinel parent of `Object`; never user-visible.
pub const EMPTY: TypeId = TypeId(6);
/// Native value fields of the trivial classes.
pub const NATIVE_INT: TypeId = TypeId(7);
pub const NATIVE_BOOL: TypeId = TypeId(8);
pub const NATIVE_STRING: TypeId = TypeId(9);

const WELL_KNOWN: [&str; 10] = [
    "Object",
    "IO",
    "Int",
    "Bool",
    "String",
    "SELF_TYPE",
    "_EMPTY_TYPE",
    "_native_int",
    "_native_bool",
    "_native_string",
];

/// Owns every type name used by a compilation. All other structures
/// hold `TypeId`s.
#[derive(Debug, Default)]
pub struct TypeTable {
    names: Vec<String>,
    index: HashMap<String, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        let mut table = TypeTable { names: Vec::new(), index: HashMap::new() };
        for name in WELL_KNOWN {
            table.intern(name);
        }
        table
    }

    pub fn intern(&mut self, name: &str) -> TypeId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = TypeId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<TypeId> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: TypeId) -> &str {
        &self.names[id.index()]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Program and classes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub classes: Vec<Class>,
    pub line: Line,
}

#[derive(Debug, Clone)]
pub struct Class {
    pub name: TypeId,
    pub parent: TypeId,
    pub file: String,
    pub line: Line,
    pub features: Vec<Feature>,
    /// Maximum shadow-stack slots any attribute initialiser needs;
    /// computed by the analyzer and consumed by the init emitter.
    pub expression_stack: u32,
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Feature {
    pub name: String,
    /// Declared type of an attribute / declared return type of a method.
    pub ty: TypeId,
    pub line: Line,
    pub kind: FeatureKind,
}

#[derive(Debug, Clone)]
pub enum FeatureKind {
    Attribute {
        init: Option<Expr>,
    },
    Method {
        formals: Vec<Formal>,
        /// `None` for built-in stubs installed by the analyzer.
        body: Option<Expr>,
        /// Maximum shadow-stack slots the body needs; computed by the
        /// analyzer.
        expression_stack: u32,
    },
}

impl Feature {
    pub fn is_method(&self) -> bool {
        matches!(self.kind, FeatureKind::Method { .. })
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self.kind, FeatureKind::Attribute { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Formal {
    pub name: String,
    pub ty: TypeId,
    pub line: Line,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Eq,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Eq => "=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation `~`.
    Neg,
    Not,
    IsVoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Virtual,
    Static(TypeId),
}

#[derive(Debug, Clone)]
pub struct CaseBranch {
    pub name: String,
    pub ty: TypeId,
    pub body: Expr,
    pub line: Line,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    BoolLit(bool),
    IntLit(i64),
    StrLit(String),
    /// Identifier reference, including `self`.
    Object(String),
    Assign {
        name: String,
        expr: Box<Expr>,
    },
    New(TypeId),
    Dispatch {
        receiver: Box<Expr>,
        method: String,
        args: Vec<Expr>,
        kind: DispatchKind,
    },
    If {
        predicate: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    While {
        predicate: Box<Expr>,
        body: Box<Expr>,
    },
    Block(Vec<Expr>),
    Let {
        name: String,
        ty: TypeId,
        init: Option<Box<Expr>>,
        body: Box<Expr>,
    },
    Case {
        scrutinee: Box<Expr>,
        branches: Vec<CaseBranch>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: Line,
    /// Inferred type; `None` until the analyzer runs.
    pub ty: Option<TypeId>,
    /// True if evaluating this expression may trigger a GC allocation.
    pub can_allocate: bool,
}

impl Expr {
    pub fn new(kind: ExprKind, line: Line) -> Self {
        Expr { kind, line, ty: None, can_allocate: false }
    }

    /// Inferred type after a successful analysis.
    pub fn checked_ty(&self) -> TypeId {
        self.ty.expect("expression type not inferred")
    }
}
