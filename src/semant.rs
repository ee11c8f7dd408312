/// Semantic analysis for Cool
///
/// Merges parsed programs, installs the built-in classes, builds and
/// validates the inheritance tree, checks `Main.main`, then infers a
/// type for every expression with a lexical scope stack. While typing
/// expressions it also computes the maximum number of GC-root slots
/// (shadow-stack model) each method and each class initialiser needs.
///
/// The first error wins and aborts analysis; only the inheritance
/// cycle check accumulates one line per participating class.

use crate::ast::{
    BinaryOp, Class, DispatchKind, Expr, ExprKind, Feature, FeatureKind, Formal, Program, TypeId,
    TypeTable, UnaryOp, BOOL, EMPTY, INT, IO, NATIVE_BOOL, NATIVE_INT, NATIVE_STRING, OBJECT,
    SELF_TYPE, STRING,
};
use crate::errors::{Line, SemantError, NO_LINE};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Type predicates
// ---------------------------------------------------------------------------

pub fn is_basic_type(id: TypeId) -> bool {
    id == OBJECT
        || id == IO
        || id == INT
        || id == BOOL
        || id == STRING
        || id == SELF_TYPE
        || id == EMPTY
        || is_native_type(id)
}

/// Int, Bool and String have value semantics at runtime.
pub fn is_trivial_type(id: TypeId) -> bool {
    id == INT || id == BOOL || id == STRING
}

pub fn is_native_type(id: TypeId) -> bool {
    id == NATIVE_INT || id == NATIVE_BOOL || id == NATIVE_STRING
}

fn is_inherit_allowed(id: TypeId) -> bool {
    !(id == INT || id == BOOL || id == STRING || id == SELF_TYPE || id == EMPTY)
}

// ---------------------------------------------------------------------------
// Scope stack
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum AddResult {
    Ok,
    Redefined,
    Reserved,
}

const SELF_NAME: &str = "self";

/// Innermost-first lexical scope of identifier bindings.
#[derive(Debug, Default)]
pub struct Scope {
    frames: Vec<Vec<(String, TypeId)>>,
}

impl Scope {
    pub fn new() -> Self {
        // the root frame binds `self`
        Scope { frames: vec![vec![(SELF_NAME.to_string(), SELF_TYPE)]] }
    }

    pub fn push(&mut self) {
        self.frames.push(Vec::new());
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn add_if_can(&mut self, name: &str, ty: TypeId) -> AddResult {
        if name == SELF_NAME {
            return AddResult::Reserved;
        }
        let frame = self.frames.last_mut().expect("empty scope stack");
        if frame.iter().any(|(n, _)| n == name) {
            return AddResult::Redefined;
        }
        frame.push((name.to_string(), ty));
        AddResult::Ok
    }

    /// Innermost-first lookup.
    pub fn find(&self, name: &str) -> Option<TypeId> {
        self.find_above(0)
            .find_map(|(n, ty)| if n == name { Some(ty) } else { None })
    }

    /// Lookup skipping the innermost `skip` frames (used to detect an
    /// attribute redefining one of an inherited class).
    pub fn find_skipping(&self, name: &str, skip: usize) -> Option<TypeId> {
        self.find_above(skip)
            .find_map(|(n, ty)| if n == name { Some(ty) } else { None })
    }

    fn find_above(&self, skip: usize) -> impl Iterator<Item = (&str, TypeId)> {
        self.frames
            .iter()
            .rev()
            .skip(skip)
            .flat_map(|frame| frame.iter().rev().map(|(n, ty)| (n.as_str(), *ty)))
    }

    pub fn can_assign(name: &str) -> bool {
        name != SELF_NAME
    }
}

// ---------------------------------------------------------------------------
// Class tree
// ---------------------------------------------------------------------------

/// The validated class hierarchy: a tree rooted at `Object` owning
/// every (typed) class body.
#[derive(Debug, Default)]
pub struct ClassTree {
    pub root: TypeId,
    classes: HashMap<TypeId, Class>,
    children: HashMap<TypeId, Vec<TypeId>>,
    parents: HashMap<TypeId, TypeId>,
}

impl ClassTree {
    pub fn class(&self, id: TypeId) -> &Class {
        &self.classes[&id]
    }

    pub fn contains(&self, id: TypeId) -> bool {
        self.classes.contains_key(&id)
    }

    pub fn children(&self, id: TypeId) -> &[TypeId] {
        self.children.get(&id).map_or(&[], |v| v.as_slice())
    }

    /// Parent class id; `EMPTY` above `Object`.
    pub fn parent(&self, id: TypeId) -> TypeId {
        self.parents.get(&id).copied().unwrap_or(EMPTY)
    }

    /// Pre-order walk of the hierarchy starting at the root.
    pub fn preorder(&self) -> Vec<TypeId> {
        let mut order = Vec::with_capacity(self.classes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            for &child in self.children(id).iter().rev() {
                stack.push(child);
            }
        }
        order
    }
}

/// Result of a successful analysis.
#[derive(Debug)]
pub struct Analysis {
    pub types: TypeTable,
    pub tree: ClassTree,
}

// ---------------------------------------------------------------------------
// Method signatures (side table, so bodies can be checked while the
// defining class is borrowed mutably)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MethodSig {
    formals: Vec<(String, TypeId)>,
    ret: TypeId,
}

// ---------------------------------------------------------------------------
// The analyzer
// ---------------------------------------------------------------------------

pub struct Semant {
    types: TypeTable,
    classes: HashMap<TypeId, Class>,
    children: HashMap<TypeId, Vec<TypeId>>,
    parents: HashMap<TypeId, TypeId>,
    methods: HashMap<TypeId, HashMap<String, MethodSig>>,

    current_class: TypeId,
    current_file: String,
    /// Running count of live GC-root slots along the current
    /// evaluation path; per-method maxima are folded into the AST.
    expr_stack: u32,
}

type SemantResult<T> = Result<T, SemantError>;

impl Semant {
    pub fn new(types: TypeTable) -> Self {
        Semant {
            types,
            classes: HashMap::new(),
            children: HashMap::new(),
            parents: HashMap::new(),
            methods: HashMap::new(),
            current_class: OBJECT,
            current_file: String::new(),
            expr_stack: 0,
        }
    }

    /// Analyze the given programs as one compilation. On success the
    /// returned tree owns every class with all expression types and
    /// stack budgets filled in.
    pub fn analyze(mut self, programs: Vec<Program>) -> SemantResult<Analysis> {
        let program = Self::merge_programs(programs);

        self.install_basic_classes();
        self.build_hierarchy(program)?;
        self.check_main()?;
        self.collect_signatures();

        let mut scope = Scope::new();
        self.check_class(self.root(), &mut scope)?;

        // SELF_TYPE is no longer interesting once types are inferred
        self.classes.remove(&SELF_TYPE);
        self.parents.remove(&SELF_TYPE);
        if let Some(children) = self.children.get_mut(&OBJECT) {
            children.retain(|&c| c != SELF_TYPE);
        }

        Ok(Analysis {
            types: self.types,
            tree: ClassTree {
                root: OBJECT,
                classes: self.classes,
                children: self.children,
                parents: self.parents,
            },
        })
    }

    fn root(&self) -> TypeId {
        OBJECT
    }

    fn merge_programs(programs: Vec<Program>) -> Program {
        let mut merged = Program::default();
        for mut program in programs {
            if merged.classes.is_empty() {
                merged.line = program.line;
            }
            merged.classes.append(&mut program.classes);
        }
        merged
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    fn err(&self, message: String) -> SemantError {
        SemantError { file: self.current_file.clone(), line: NO_LINE, message }
    }

    fn err_at(&self, line: Line, message: String) -> SemantError {
        SemantError { file: self.current_file.clone(), line, message }
    }

    fn name(&self, id: TypeId) -> &str {
        self.types.name(id)
    }

    // -----------------------------------------------------------------------
    // Basic classes
    // -----------------------------------------------------------------------

    fn make_basic_class(
        &mut self,
        name: TypeId,
        parent: TypeId,
        methods: &[(&str, TypeId, &[TypeId])],
        fields: &[(&str, TypeId)],
    ) {
        let mut features = Vec::new();
        for &(method_name, ret, formal_types) in methods {
            let formals = formal_types
                .iter()
                .enumerate()
                .map(|(i, &ty)| Formal { name: format!("_arg{}", i + 1), ty, line: NO_LINE })
                .collect();
            features.push(Feature {
                name: method_name.to_string(),
                ty: ret,
                line: NO_LINE,
                kind: FeatureKind::Method { formals, body: None, expression_stack: 0 },
            });
        }
        for &(field_name, ty) in fields {
            features.push(Feature {
                name: field_name.to_string(),
                ty,
                line: NO_LINE,
                kind: FeatureKind::Attribute { init: None },
            });
        }

        self.classes.insert(
            name,
            Class {
                name,
                parent,
                file: "<basic class>".to_string(),
                line: NO_LINE,
                features,
                expression_stack: 0,
            },
        );
        self.parents.insert(name, parent);
        if parent != EMPTY {
            self.children.entry(parent).or_default().push(name);
        }
    }

    fn install_basic_classes(&mut self) {
        self.make_basic_class(
            OBJECT,
            EMPTY,
            &[
                ("abort", OBJECT, &[]),
                ("type_name", STRING, &[]),
                ("copy", SELF_TYPE, &[]),
            ],
            &[],
        );
        self.make_basic_class(
            IO,
            OBJECT,
            &[
                ("out_string", SELF_TYPE, &[STRING]),
                ("out_int", SELF_TYPE, &[INT]),
                ("in_string", STRING, &[]),
                ("in_int", INT, &[]),
            ],
            &[],
        );
        self.make_basic_class(INT, OBJECT, &[], &[("_value", NATIVE_INT)]);
        self.make_basic_class(BOOL, OBJECT, &[], &[("_value", NATIVE_BOOL)]);
        self.make_basic_class(SELF_TYPE, OBJECT, &[], &[]);
        self.make_basic_class(
            STRING,
            OBJECT,
            &[
                ("length", INT, &[]),
                ("concat", STRING, &[STRING]),
                ("substr", STRING, &[INT, INT]),
            ],
            &[("_length", INT), ("_string", NATIVE_STRING)],
        );
    }

    // -----------------------------------------------------------------------
    // Hierarchy
    // -----------------------------------------------------------------------

    fn build_hierarchy(&mut self, program: Program) -> SemantResult<()> {
        let mut delayed_parent: Vec<TypeId> = Vec::new();
        let user_order: Vec<TypeId> = program.classes.iter().map(|c| c.name).collect();

        for class in program.classes {
            self.current_file = class.file.clone();
            let class_name = class.name;

            if is_basic_type(class_name) {
                return Err(self.err_at(
                    class.line,
                    format!("Redefinition of basic class {}.", self.name(class_name)),
                ));
            }
            if self.classes.contains_key(&class_name) {
                return Err(self.err_at(
                    class.line,
                    format!("Class {} was previously defined.", self.name(class_name)),
                ));
            }

            let parent = class.parent;
            let line = class.line;
            self.parents.insert(class_name, parent);
            self.classes.insert(class_name, class);

            if self.classes.contains_key(&parent) {
                if !is_inherit_allowed(parent) {
                    return Err(self.err_at(
                        line,
                        format!(
                            "Class {} cannot inherit class {}.",
                            self.name(class_name),
                            self.name(parent)
                        ),
                    ));
                }
                self.children.entry(parent).or_default().push(class_name);
            } else {
                delayed_parent.push(class_name);
            }
        }

        // second pass for classes defined after their heirs
        for class_name in delayed_parent {
            let (file, parent, line) = {
                let class = &self.classes[&class_name];
                (class.file.clone(), class.parent, class.line)
            };
            self.current_file = file;

            if !self.classes.contains_key(&parent) {
                return Err(self.err_at(
                    line,
                    format!(
                        "Class {} inherits from an undefined class {}.",
                        self.name(class_name),
                        self.name(parent)
                    ),
                ));
            }
            self.children.entry(parent).or_default().push(class_name);
        }

        self.check_cycles(&user_order)
    }

    /// Walk every user class's parent chain; a chain that re-enters
    /// itself before reaching a finished class is a cycle. Reports one
    /// line per participant, in source order of cycle discovery.
    fn check_cycles(&self, user_order: &[TypeId]) -> SemantResult<()> {
        const UNSEEN: u8 = 0;
        const ON_PATH: u8 = 1;
        const DONE: u8 = 2;

        let mut state: HashMap<TypeId, u8> = HashMap::new();
        let mut message = String::new();

        for &start in user_order {
            if state.get(&start).copied().unwrap_or(UNSEEN) != UNSEEN {
                continue;
            }

            let mut path = Vec::new();
            let mut current = start;
            loop {
                if is_basic_type(current)
                    || state.get(&current).copied().unwrap_or(UNSEEN) == DONE
                {
                    break;
                }
                if state.get(&current).copied().unwrap_or(UNSEEN) == ON_PATH {
                    // cycle: every class from `current` to the end of path
                    let cycle_start =
                        path.iter().position(|&c| c == current).expect("cycle member on path");
                    for &member in &path[cycle_start..] {
                        let class = &self.classes[&member];
                        let member_name = self.name(member);
                        message.push_str(&format!(
                            "\"{}\", line {}: Class {} or an ancestor of {} is involved in an inheritance cycle.\n",
                            class.file, class.line, member_name, member_name
                        ));
                    }
                    break;
                }
                state.insert(current, ON_PATH);
                path.push(current);
                current = self.parents[&current];
            }
            for member in path {
                state.insert(member, DONE);
            }
        }

        if message.is_empty() {
            Ok(())
        } else {
            message.pop(); // trailing newline
            Err(SemantError { file: String::new(), line: NO_LINE, message })
        }
    }

    fn check_main(&mut self) -> SemantResult<()> {
        let main_id = match self.types.get("Main") {
            Some(id) if self.classes.contains_key(&id) => id,
            _ => {
                return Err(SemantError {
                    file: String::new(),
                    line: NO_LINE,
                    message: "Class Main is not defined.".to_string(),
                })
            }
        };

        let main_class = &self.classes[&main_id];
        let found = main_class.features.iter().any(|f| match &f.kind {
            FeatureKind::Method { formals, .. } => f.name == "main" && formals.is_empty(),
            _ => false,
        });
        let (file, line) = (main_class.file.clone(), main_class.line);
        if !found {
            self.current_file = file;
            return Err(self.err_at(line, "No 'main' method in class Main.".to_string()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Signature side table
    // -----------------------------------------------------------------------

    fn collect_signatures(&mut self) {
        for (&class_name, class) in &self.classes {
            let mut sigs = HashMap::new();
            for feature in &class.features {
                if let FeatureKind::Method { formals, .. } = &feature.kind {
                    sigs.insert(
                        feature.name.clone(),
                        MethodSig {
                            formals: formals.iter().map(|f| (f.name.clone(), f.ty)).collect(),
                            ret: feature.ty,
                        },
                    );
                }
            }
            self.methods.insert(class_name, sigs);
        }
    }

    /// Find a method starting the search at `class` (`exact` = do not
    /// look into ancestors).
    fn find_method(&self, class: TypeId, name: &str, exact: bool) -> Option<&MethodSig> {
        let mut current = class;
        while current != EMPTY {
            if let Some(sig) = self.methods.get(&current).and_then(|m| m.get(name)) {
                return Some(sig);
            }
            if exact {
                return None;
            }
            current = self.parents.get(&current).copied().unwrap_or(EMPTY);
        }
        None
    }

    fn check_exists(&self, ty: TypeId) -> bool {
        self.classes.contains_key(&ty) || ty == EMPTY
    }

    // -----------------------------------------------------------------------
    // Per-class checking (scope-carrying DFS over the tree)
    // -----------------------------------------------------------------------

    fn check_class(&mut self, id: TypeId, scope: &mut Scope) -> SemantResult<()> {
        scope.push();

        let prev_class = self.current_class;
        let prev_file = self.current_file.clone();
        self.current_class = id;

        if !is_basic_type(id) {
            // take the class body out so its expressions can be typed
            // while `self` keeps the signature tables borrowed
            let mut class = self.classes.remove(&id).expect("class in registry");
            self.current_file = class.file.clone();

            let result = self.check_features(&mut class, scope);
            self.classes.insert(id, class);
            result?;
        }

        let children = self.children.get(&id).cloned().unwrap_or_default();
        for child in children {
            self.check_class(child, scope)?;
        }

        self.current_class = prev_class;
        self.current_file = prev_file;
        scope.pop();
        Ok(())
    }

    fn check_features(&mut self, class: &mut Class, scope: &mut Scope) -> SemantResult<()> {
        // 1. attributes enter the scope first and may not collide with
        //    inherited ones
        for feature in &class.features {
            if !feature.is_attribute() {
                continue;
            }
            match scope.add_if_can(&feature.name, feature.ty) {
                AddResult::Reserved => {
                    return Err(self.err_at(
                        feature.line,
                        format!("'{}' cannot be the name of an attribute.", feature.name),
                    ));
                }
                AddResult::Redefined => {
                    return Err(self.err_at(
                        feature.line,
                        format!("Attribute {} is multiply defined in class.", feature.name),
                    ));
                }
                AddResult::Ok => {}
            }
            if scope.find_skipping(&feature.name, 1).is_some() {
                return Err(self.err_at(
                    feature.line,
                    format!("Attribute {} is an attribute of an inherited class.", feature.name),
                ));
            }
        }

        // 2. a method name may appear once per class
        for (i, feature) in class.features.iter().enumerate() {
            if !feature.is_method() {
                continue;
            }
            let duplicated = class.features[..i]
                .iter()
                .any(|other| other.is_method() && other.name == feature.name);
            if duplicated {
                return Err(self.err_at(
                    feature.line,
                    format!("Method {} is multiply defined.", feature.name),
                ));
            }
        }

        // 3. type-check attribute initialisers and method bodies
        for feature in &mut class.features {
            match &mut feature.kind {
                FeatureKind::Attribute { init } => {
                    self.expr_stack = 0;
                    Self::check_attribute_in(
                        self,
                        &feature.name,
                        feature.ty,
                        feature.line,
                        init.as_mut(),
                        scope,
                    )?;
                    class.expression_stack = class.expression_stack.max(self.expr_stack);
                }
                FeatureKind::Method { formals, body, expression_stack } => {
                    self.expr_stack = 0;
                    Self::check_method_in(
                        self,
                        class.name,
                        &feature.name,
                        feature.ty,
                        feature.line,
                        formals,
                        body.as_mut(),
                        scope,
                    )?;
                    *expression_stack = self.expr_stack;
                }
            }
        }

        Ok(())
    }

    fn check_attribute_in(
        &mut self,
        name: &str,
        declared: TypeId,
        line: Line,
        init: Option<&mut Expr>,
        scope: &mut Scope,
    ) -> SemantResult<()> {
        if !self.check_exists(declared) {
            return Err(self.err_at(
                line,
                format!("Class {} of attribute {} is undefined.", self.name(declared), name),
            ));
        }

        if let Some(init) = init {
            self.infer_expr(init, scope)?;
            let init_ty = init.checked_ty();
            if !self.check_types_meet(init_ty, declared) {
                return Err(self.err_at(
                    line,
                    format!(
                        "Inferred type {} of initialization of {} does not conform to declared type {}.",
                        self.name(init_ty),
                        name,
                        self.name(declared)
                    ),
                ));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn check_method_in(
        &mut self,
        class_name: TypeId,
        name: &str,
        ret: TypeId,
        line: Line,
        formals: &[Formal],
        body: Option<&mut Expr>,
        scope: &mut Scope,
    ) -> SemantResult<()> {
        scope.push();

        if !self.check_exists(ret) {
            return Err(self.err_at(
                line,
                format!("Undefined return type {} in method {}.", self.name(ret), name),
            ));
        }

        // override signature: identical arity and formal types
        let parent = self.parents.get(&class_name).copied().unwrap_or(EMPTY);
        let parent_sig = self.find_method(parent, name, false).cloned();
        if let Some(parent_sig) = &parent_sig {
            if parent_sig.formals.len() != formals.len() {
                return Err(self.err_at(
                    line,
                    format!(
                        "Incompatible number of formal parameters in redefined method {}.",
                        name
                    ),
                ));
            }
        }

        for (num, formal) in formals.iter().enumerate() {
            if formal.ty == SELF_TYPE {
                return Err(self.err_at(
                    formal.line,
                    format!("Formal parameter {} cannot have type SELF_TYPE.", formal.name),
                ));
            }
            if !self.check_exists(formal.ty) {
                return Err(self.err_at(
                    formal.line,
                    format!(
                        "Class {} of formal parameter {} is undefined.",
                        self.name(formal.ty),
                        formal.name
                    ),
                ));
            }

            match scope.add_if_can(&formal.name, formal.ty) {
                AddResult::Redefined => {
                    return Err(self.err_at(
                        formal.line,
                        format!("Formal parameter {} is multiply defined.", formal.name),
                    ));
                }
                AddResult::Reserved => {
                    return Err(self.err_at(
                        formal.line,
                        format!("'{}' cannot be the name of a formal parameter.", formal.name),
                    ));
                }
                AddResult::Ok => {}
            }

            if let Some(parent_sig) = &parent_sig {
                let original = parent_sig.formals[num].1;
                if original != formal.ty {
                    return Err(self.err_at(
                        formal.line,
                        format!(
                            "In redefined method {}, parameter type {} is different from original type {}",
                            name,
                            self.name(formal.ty),
                            self.name(original)
                        ),
                    ));
                }
            }
        }

        if let Some(body) = body {
            self.infer_expr(body, scope)?;
            let body_ty = body.checked_ty();
            if !self.check_types_meet(body_ty, ret) {
                return Err(self.err_at(
                    line,
                    format!(
                        "Inferred return type {} of method {} does not conform to declared return type {}.",
                        self.name(body_ty),
                        name,
                        self.name(ret)
                    ),
                ));
            }
        }

        scope.pop();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Expression inference
    // -----------------------------------------------------------------------

    fn infer_expr(&mut self, expr: &mut Expr, scope: &mut Scope) -> SemantResult<()> {
        let line = expr.line;
        // split borrows: the kind is matched while the annotation
        // fields on `expr` are written afterwards
        let (ty, can_allocate) = self.infer_kind(&mut expr.kind, scope).map_err(|mut e| {
            if e.line == NO_LINE {
                e.line = line;
            }
            e
        })?;
        expr.ty = Some(ty);
        expr.can_allocate = can_allocate;
        Ok(())
    }

    fn infer_kind(
        &mut self,
        kind: &mut ExprKind,
        scope: &mut Scope,
    ) -> SemantResult<(TypeId, bool)> {
        match kind {
            ExprKind::BoolLit(_) => Ok((BOOL, false)),
            ExprKind::IntLit(_) => Ok((INT, false)),
            ExprKind::StrLit(_) => Ok((STRING, false)),

            ExprKind::Object(name) => {
                let ty = scope
                    .find(name)
                    .ok_or_else(|| self.err(format!("Undeclared identifier {}.", name)))?;
                Ok((ty, false))
            }

            ExprKind::New(ty) => {
                // init can trigger a collection, so the result needs a slot
                self.expr_stack += 1;
                if !self.check_exists(*ty) {
                    return Err(
                        self.err(format!("'new' used with undefined class {}.", self.name(*ty)))
                    );
                }
                Ok((*ty, true))
            }

            ExprKind::Assign { name, expr } => {
                self.infer_expr(expr, scope)?;
                let expr_ty = expr.checked_ty();

                let var_ty = scope.find(name).ok_or_else(|| {
                    self.err(format!("Assignment to undeclared variable {}.", name))
                })?;
                if !Scope::can_assign(name) {
                    return Err(self.err("Cannot assign to 'self'.".to_string()));
                }
                if !self.check_types_meet(expr_ty, var_ty) {
                    return Err(self.err(format!(
                        "Type {} of assigned expression does not conform to declared type {} of identifier {}.",
                        self.name(expr_ty),
                        self.name(var_ty),
                        name
                    )));
                }
                Ok((expr_ty, expr.can_allocate))
            }

            ExprKind::Unary { op, expr } => {
                self.infer_expr(expr, scope)?;
                let operand_ty = expr.checked_ty();
                let result = match op {
                    UnaryOp::IsVoid => BOOL,
                    UnaryOp::Not => {
                        if operand_ty != BOOL {
                            return Err(self.err(format!(
                                "Argument of 'not' has type {} instead of Bool.",
                                self.name(operand_ty)
                            )));
                        }
                        BOOL
                    }
                    UnaryOp::Neg => {
                        if operand_ty != INT {
                            return Err(self.err(format!(
                                "Argument of '~' has type {} instead of Int.",
                                self.name(operand_ty)
                            )));
                        }
                        INT
                    }
                };
                // ~ boxes a fresh Int
                let can_allocate = *op == UnaryOp::Neg || expr.can_allocate;
                Ok((result, can_allocate))
            }

            ExprKind::Binary { op, lhs, rhs } => {
                let entry_stack = self.expr_stack;

                self.infer_expr(lhs, scope)?;
                let lhs_stack = self.expr_stack;

                // the left value stays live in a slot across the rhs
                self.expr_stack = entry_stack + 1;
                self.infer_expr(rhs, scope)?;
                let rhs_stack = self.expr_stack;

                self.expr_stack = lhs_stack.max(rhs_stack);

                let lhs_ty = lhs.checked_ty();
                let rhs_ty = rhs.checked_ty();

                let result = if *op == BinaryOp::Eq {
                    let basic = |t: TypeId| t == INT || t == BOOL || t == STRING;
                    if (basic(lhs_ty) || basic(rhs_ty)) && lhs_ty != rhs_ty {
                        return Err(
                            self.err("Illegal comparison with a basic type.".to_string())
                        );
                    }
                    BOOL
                } else {
                    if lhs_ty != INT || rhs_ty != INT {
                        return Err(self.err(format!(
                            "non-Int arguments: {} {} {}",
                            self.name(lhs_ty),
                            op.symbol(),
                            self.name(rhs_ty)
                        )));
                    }
                    match op {
                        BinaryOp::Lt | BinaryOp::Le => BOOL,
                        _ => INT,
                    }
                };
                Ok((result, true))
            }

            ExprKind::If { predicate, then_expr, else_expr } => {
                let entry_stack = self.expr_stack;

                self.infer_expr(predicate, scope)?;
                if predicate.checked_ty() != BOOL {
                    return Err(
                        self.err("Predicate of 'if' does not have type Bool.".to_string())
                    );
                }
                let predicate_stack = self.expr_stack;

                self.expr_stack = entry_stack;
                self.infer_expr(then_expr, scope)?;
                let then_stack = self.expr_stack;

                self.expr_stack = entry_stack;
                self.infer_expr(else_expr, scope)?;
                let else_stack = self.expr_stack;

                self.expr_stack = predicate_stack.max(then_stack).max(else_stack);

                let result = self
                    .find_common_ancestor(&[then_expr.checked_ty(), else_expr.checked_ty()]);
                let can_allocate = predicate.can_allocate
                    || then_expr.can_allocate
                    || else_expr.can_allocate;
                Ok((result, can_allocate))
            }

            ExprKind::While { predicate, body } => {
                let entry_stack = self.expr_stack;

                self.infer_expr(predicate, scope)?;
                if predicate.checked_ty() != BOOL {
                    return Err(self.err("Loop condition does not have type Bool.".to_string()));
                }
                let predicate_stack = self.expr_stack;

                self.expr_stack = entry_stack;
                self.infer_expr(body, scope)?;
                let body_stack = self.expr_stack;

                // the loop itself holds no value
                self.expr_stack = predicate_stack.max(body_stack);

                Ok((OBJECT, predicate.can_allocate || body.can_allocate))
            }

            ExprKind::Block(exprs) => {
                let entry_stack = self.expr_stack;
                let mut max_stack = entry_stack;
                for expr in exprs.iter_mut() {
                    self.expr_stack = entry_stack;
                    self.infer_expr(expr, scope)?;
                    max_stack = max_stack.max(self.expr_stack);
                }
                self.expr_stack = max_stack;

                let last_ty = exprs.last().expect("non-empty block").checked_ty();
                let can_allocate = exprs.iter().any(|e| e.can_allocate);
                Ok((last_ty, can_allocate))
            }

            ExprKind::Let { name, ty, init, body } => {
                if !self.check_exists(*ty) {
                    return Err(self.err(format!(
                        "Class {} of let-bound identifier {} is undefined.",
                        self.name(*ty),
                        name
                    )));
                }

                let entry_stack = self.expr_stack;
                let mut init_stack = entry_stack;
                if let Some(init) = init {
                    self.infer_expr(init, scope)?;
                    let init_ty = init.checked_ty();
                    if !self.check_types_meet(init_ty, *ty) {
                        return Err(self.err(format!(
                            "Inferred type {} of initialization of {} does not conform to identifier's declared type {}.",
                            self.name(init_ty),
                            name,
                            self.name(*ty)
                        )));
                    }
                    init_stack = self.expr_stack;
                }

                scope.push();
                if scope.add_if_can(name, *ty) != AddResult::Ok {
                    return Err(
                        self.err(format!("'{}' cannot be bound in a 'let' expression.", name))
                    );
                }

                // one slot keeps the binding alive through the body
                self.expr_stack = entry_stack + 1;
                self.infer_expr(body, scope)?;
                let body_stack = self.expr_stack;

                self.expr_stack = init_stack.max(body_stack);
                scope.pop();

                let can_allocate = init.as_ref().map_or(false, |e| e.can_allocate)
                    || body.can_allocate;
                Ok((body.checked_ty(), can_allocate))
            }

            ExprKind::Case { scrutinee, branches } => {
                let entry_stack = self.expr_stack;

                self.infer_expr(scrutinee, scope)?;
                let mut max_stack = self.expr_stack;

                let mut seen_types: Vec<TypeId> = Vec::new();
                let mut result_types: Vec<TypeId> = Vec::new();
                for branch in branches.iter_mut() {
                    scope.push();

                    // one slot holds the scrutinee in every branch
                    self.expr_stack = entry_stack + 1;

                    if branch.ty == SELF_TYPE {
                        return Err(self.err_at(
                            branch.line,
                            format!(
                                "Identifier {} declared with type SELF_TYPE in case branch.",
                                branch.name
                            ),
                        ));
                    }
                    if !self.check_exists(branch.ty) {
                        return Err(self.err_at(
                            branch.line,
                            format!(
                                "Class {} of case branch is undefined.",
                                self.name(branch.ty)
                            ),
                        ));
                    }
                    if scope.add_if_can(&branch.name, branch.ty) != AddResult::Ok {
                        return Err(self.err_at(
                            branch.line,
                            format!("'{}' bound in 'case'.", branch.name),
                        ));
                    }
                    if seen_types.contains(&branch.ty) {
                        return Err(self.err(format!(
                            "Duplicate branch {} in case statement.",
                            self.name(branch.ty)
                        )));
                    }
                    seen_types.push(branch.ty);

                    self.infer_expr(&mut branch.body, scope)?;
                    max_stack = max_stack.max(self.expr_stack);

                    scope.pop();
                    result_types.push(branch.body.checked_ty());
                }

                self.expr_stack = max_stack;

                let result = self.find_common_ancestor(&result_types);
                let can_allocate = scrutinee.can_allocate
                    || branches.iter().any(|b| b.body.can_allocate);
                Ok((result, can_allocate))
            }

            ExprKind::Dispatch { receiver, method, args, kind } => {
                let entry_stack = self.expr_stack;

                self.infer_expr(receiver, scope)?;
                // the receiver path may have to spill every argument
                let receiver_stack = self.expr_stack + args.len() as u32;

                let mut dispatch_ty = receiver.checked_ty();
                if let DispatchKind::Static(static_ty) = kind {
                    if *static_ty == SELF_TYPE {
                        return Err(self.err("Static dispatch to SELF_TYPE.".to_string()));
                    }
                    if !self.check_exists(*static_ty) {
                        return Err(self.err(format!(
                            "Static dispatch to undefined class {}.",
                            self.name(*static_ty)
                        )));
                    }
                    if !self.check_types_meet(dispatch_ty, *static_ty) {
                        return Err(self.err(format!(
                            "Expression type {} does not conform to declared static dispatch type {}.",
                            self.name(dispatch_ty),
                            self.name(*static_ty)
                        )));
                    }
                    dispatch_ty = *static_ty;
                }

                let lookup_class = self.exact_type(dispatch_ty);
                let sig = self
                    .find_method(lookup_class, method, false)
                    .cloned()
                    .ok_or_else(|| {
                        self.err(format!("Dispatch to undefined method {}.", method))
                    })?;

                if sig.formals.len() != args.len() {
                    return Err(self.err(format!(
                        "Method {} called with wrong number of arguments.",
                        method
                    )));
                }

                let mut max_stack = receiver_stack;
                for (i, arg) in args.iter_mut().enumerate() {
                    self.expr_stack = entry_stack;
                    self.infer_expr(arg, scope)?;

                    let (formal_name, formal_ty) = &sig.formals[i];
                    let arg_ty = arg.checked_ty();
                    if !self.check_types_meet(arg_ty, *formal_ty) {
                        return Err(self.err_at(
                            arg.line,
                            format!(
                                "In call of method {}, type {} of parameter {} does not conform to declared type {}.",
                                method,
                                self.name(arg_ty),
                                formal_name,
                                self.name(*formal_ty)
                            ),
                        ));
                    }
                    // argument i is spilled while later ones evaluate
                    max_stack = max_stack.max(self.expr_stack + i as u32);
                }
                self.expr_stack = max_stack;

                let result = if sig.ret == SELF_TYPE { receiver.checked_ty() } else { sig.ret };
                Ok((result, true))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Conformance and least common ancestors
    // -----------------------------------------------------------------------

    /// SELF_TYPE resolved against the class under analysis.
    fn exact_type(&self, ty: TypeId) -> TypeId {
        if ty == SELF_TYPE {
            self.current_class
        } else {
            ty
        }
    }

    /// `dynamic` conforms to `static_`. Not commutative.
    fn check_types_meet(&self, dynamic: TypeId, static_: TypeId) -> bool {
        if static_ == SELF_TYPE {
            return dynamic == SELF_TYPE;
        }
        let mut current = self.exact_type(dynamic);
        loop {
            if current == static_ {
                return true;
            }
            if current == EMPTY {
                return false;
            }
            current = self.parents.get(&current).copied().unwrap_or(EMPTY);
        }
    }

    fn depth(&self, ty: TypeId) -> u32 {
        let mut depth = 0;
        let mut current = ty;
        while current != OBJECT {
            depth += 1;
            current = self.parents[&current];
        }
        depth
    }

    fn find_common_ancestor(&self, classes: &[TypeId]) -> TypeId {
        let mut lca = self.exact_type(classes[0]);
        let mut all_self_type = classes[0] == SELF_TYPE;

        for &ty in &classes[1..] {
            lca = self.find_common_ancestor_of_two(lca, self.exact_type(ty));
            all_self_type = all_self_type && ty == SELF_TYPE;
            if lca == OBJECT {
                break;
            }
        }

        if all_self_type {
            SELF_TYPE
        } else {
            lca
        }
    }

    fn find_common_ancestor_of_two(&self, t1: TypeId, t2: TypeId) -> TypeId {
        let mut h1 = self.depth(t1);
        let mut h2 = self.depth(t2);
        let mut t1 = t1;
        let mut t2 = t2;

        while h1 > h2 {
            t1 = self.parents[&t1];
            h1 -= 1;
        }
        while h2 > h1 {
            t2 = self.parents[&t2];
            h2 -= 1;
        }
        while t1 != t2 {
            t1 = self.parents[&t1];
            t2 = self.parents[&t2];
        }
        t1
    }
}
