/// Integration tests for semantic analysis.
///
/// These tests verify:
///   • A minimal program with `Main.main` type-checks
///   • Exact diagnostic text for the classic error classes
///   • Inheritance-cycle reporting, one line per participant
///   • SELF_TYPE handling in dispatch and `if` joins
///   • Shadow-stack budgeting recorded on methods and classes
use coolc::ast::{self, FeatureKind};
use coolc::errors::CompileError;
use coolc::semant::Analysis;
use coolc::check_sources;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn check(src: &str) -> Result<Analysis, CompileError> {
    check_sources(&[("test.cl".to_string(), src.to_string())])
}

fn check_err(src: &str) -> String {
    match check(src) {
        Ok(_) => panic!("analysis should fail"),
        Err(error) => error.to_string(),
    }
}

fn method_stack(analysis: &Analysis, class: &str, method: &str) -> u32 {
    let id = analysis.types.get(class).expect("class exists");
    let class = analysis.tree.class(id);
    class
        .features
        .iter()
        .find_map(|f| match &f.kind {
            FeatureKind::Method { expression_stack, .. } if f.name == method => {
                Some(*expression_stack)
            }
            _ => None,
        })
        .expect("method exists")
}

// ─── Programs that should check ───────────────────────────────────────────────

#[test]
fn test_minimal_main_checks() {
    let analysis = check(r#"class Main { main():Object { "hi" }; };"#).expect("should check");
    let main_id = analysis.types.get("Main").expect("Main interned");
    assert!(analysis.tree.contains(main_id));
}

#[test]
fn test_inferred_types_are_recorded_everywhere() {
    let analysis = check(
        r#"
        class Main {
            x : Int <- 1;
            main() : Int { if true then x else 2 + 3 fi };
        };
        "#,
    )
    .expect("should check");

    let main_id = analysis.types.get("Main").expect("Main interned");
    for feature in &analysis.tree.class(main_id).features {
        if let FeatureKind::Method { body: Some(body), .. } = &feature.kind {
            assert_eq!(body.ty, Some(ast::INT), "if joins Int with Int");
        }
    }
}

#[test]
fn test_self_type_dispatch_result() {
    // copy() returns SELF_TYPE, so b.copy() has B's static type
    let analysis = check(
        r#"
        class B { f() : B { self.copy() }; };
        class Main { main() : Object { new B }; };
        "#,
    )
    .expect("should check");
    assert!(analysis.types.get("B").is_some());
}

#[test]
fn test_if_join_is_least_common_ancestor() {
    let analysis = check(
        r#"
        class A {};
        class B inherits A {};
        class C inherits A {};
        class Main {
            main() : A { if true then new B else new C fi };
        };
        "#,
    )
    .expect("should check");

    let main_id = analysis.types.get("Main").expect("Main");
    let a_id = analysis.types.get("A").expect("A");
    let body = analysis.tree.class(main_id).features.iter().find_map(|f| match &f.kind {
        FeatureKind::Method { body: Some(body), .. } => Some(body),
        _ => None,
    });
    assert_eq!(body.expect("main body").ty, Some(a_id));
}

#[test]
fn test_while_has_type_object() {
    let analysis = check(
        r#"
        class Main {
            main() : Object { while false loop 1 pool };
        };
        "#,
    )
    .expect("should check");

    let main_id = analysis.types.get("Main").expect("Main");
    let body = analysis.tree.class(main_id).features.iter().find_map(|f| match &f.kind {
        FeatureKind::Method { body: Some(body), .. } => Some(body),
        _ => None,
    });
    assert_eq!(body.expect("main body").ty, Some(ast::OBJECT));
}

// ─── Error diagnostics ────────────────────────────────────────────────────────

#[test]
fn test_empty_program_reports_missing_main() {
    let err = check_sources(&[]).expect_err("no sources");
    assert_eq!(err.to_string(), "Class Main is not defined.");
}

#[test]
fn test_program_without_main_class() {
    let err = check_err("class A {};");
    assert_eq!(err, "Class Main is not defined.");
}

#[test]
fn test_main_without_main_method() {
    let err = check_err("class Main { f() : Int { 0 }; };");
    assert_eq!(err, "\"test.cl\", line 1: No 'main' method in class Main.");
}

#[test]
fn test_override_with_different_parameter_type() {
    let err = check_err(
        "class A { f(x:Int):Int{x}; };\nclass B inherits A { f(x:String):Int{0}; };\nclass Main { main():Object { 0 }; };",
    );
    assert_eq!(
        err,
        "\"test.cl\", line 2: In redefined method f, parameter type String is different from original type Int"
    );
}

#[test]
fn test_override_with_different_arity() {
    let err = check_err(
        "class A { f(x:Int):Int{x}; };\nclass B inherits A { f():Int{0}; };\nclass Main { main():Object { 0 }; };",
    );
    assert_eq!(
        err,
        "\"test.cl\", line 2: Incompatible number of formal parameters in redefined method f."
    );
}

#[test]
fn test_cyclic_inheritance_reports_every_member() {
    let err = check_err("class A inherits B {};\nclass B inherits A {};");
    let lines: Vec<&str> = err.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0],
        "\"test.cl\", line 1: Class A or an ancestor of A is involved in an inheritance cycle."
    );
    assert_eq!(
        lines[1],
        "\"test.cl\", line 2: Class B or an ancestor of B is involved in an inheritance cycle."
    );
}

#[test]
fn test_inherit_from_int_is_rejected() {
    let err = check_err("class A inherits Int {};\nclass Main { main():Object { 0 }; };");
    assert_eq!(err, "\"test.cl\", line 1: Class A cannot inherit class Int.");
}

#[test]
fn test_redefine_basic_class() {
    let err = check_err("class Int {};\nclass Main { main():Object { 0 }; };");
    assert_eq!(err, "\"test.cl\", line 1: Redefinition of basic class Int.");
}

#[test]
fn test_class_redefinition() {
    let err = check_err("class A {};\nclass A {};\nclass Main { main():Object { 0 }; };");
    assert_eq!(err, "\"test.cl\", line 2: Class A was previously defined.");
}

#[test]
fn test_undefined_parent() {
    let err = check_err("class A inherits Nope {};\nclass Main { main():Object { 0 }; };");
    assert_eq!(err, "\"test.cl\", line 1: Class A inherits from an undefined class Nope.");
}

#[test]
fn test_undeclared_identifier() {
    let err = check_err("class Main { main():Object { foo }; };");
    assert_eq!(err, "\"test.cl\", line 1: Undeclared identifier foo.");
}

#[test]
fn test_assign_to_self() {
    let err = check_err("class Main { main():Object { self <- new Main }; };");
    assert_eq!(err, "\"test.cl\", line 1: Cannot assign to 'self'.");
}

#[test]
fn test_non_int_arguments() {
    let err = check_err(r#"class Main { main():Int { 1 + "x" }; };"#);
    assert_eq!(err, "\"test.cl\", line 1: non-Int arguments: Int + String");
}

#[test]
fn test_illegal_basic_comparison() {
    let err = check_err(r#"class Main { main():Bool { 1 = "x" }; };"#);
    assert_eq!(err, "\"test.cl\", line 1: Illegal comparison with a basic type.");
}

#[test]
fn test_if_predicate_must_be_bool() {
    let err = check_err("class Main { main():Object { if 1 then 2 else 3 fi }; };");
    assert_eq!(err, "\"test.cl\", line 1: Predicate of 'if' does not have type Bool.");
}

#[test]
fn test_loop_condition_must_be_bool() {
    let err = check_err("class Main { main():Object { while 1 loop 2 pool }; };");
    assert_eq!(err, "\"test.cl\", line 1: Loop condition does not have type Bool.");
}

#[test]
fn test_let_init_must_conform() {
    let err = check_err(r#"class Main { main():Object { let x : Int <- "s" in x }; };"#);
    assert_eq!(
        err,
        "\"test.cl\", line 1: Inferred type String of initialization of x does not conform to identifier's declared type Int."
    );
}

#[test]
fn test_duplicate_case_branch() {
    let err = check_err(
        "class Main { main():Object { case 1 of a : Int => a; b : Int => b; esac }; };",
    );
    assert_eq!(err, "\"test.cl\", line 1: Duplicate branch Int in case statement.");
}

#[test]
fn test_case_branch_self_type() {
    let err =
        check_err("class Main { main():Object { case 1 of a : SELF_TYPE => a; esac }; };");
    assert_eq!(
        err,
        "\"test.cl\", line 1: Identifier a declared with type SELF_TYPE in case branch."
    );
}

#[test]
fn test_static_dispatch_to_self_type() {
    let err = check_err("class Main { main():Object { (new Main)@SELF_TYPE.main() }; };");
    assert_eq!(err, "\"test.cl\", line 1: Static dispatch to SELF_TYPE.");
}

#[test]
fn test_static_dispatch_must_conform() {
    let err = check_err(
        "class A {};\nclass Main { main():Object { (new A)@Main.main() }; };",
    );
    assert_eq!(
        err,
        "\"test.cl\", line 2: Expression type A does not conform to declared static dispatch type Main."
    );
}

#[test]
fn test_dispatch_to_undefined_method() {
    let err = check_err("class Main { main():Object { self.nope() }; };");
    assert_eq!(err, "\"test.cl\", line 1: Dispatch to undefined method nope.");
}

#[test]
fn test_argument_conformance() {
    let err = check_err(
        "class A { f(x:Int):Int{x}; };\nclass Main { main():Object { (new A).f(\"s\") }; };",
    );
    assert_eq!(
        err,
        "\"test.cl\", line 2: In call of method f, type String of parameter x does not conform to declared type Int."
    );
}

#[test]
fn test_attribute_redefined_from_parent() {
    let err = check_err(
        "class A { x : Int; };\nclass B inherits A { x : Int; };\nclass Main { main():Object { 0 }; };",
    );
    assert_eq!(
        err,
        "\"test.cl\", line 2: Attribute x is an attribute of an inherited class."
    );
}

#[test]
fn test_method_multiply_defined() {
    let err = check_err(
        "class Main { main():Object { 0 }; main():Object { 1 }; };",
    );
    assert_eq!(err, "\"test.cl\", line 1: Method main is multiply defined.");
}

#[test]
fn test_formal_cannot_be_self() {
    let err = check_err("class Main { main():Object { 0 }; f(self:Int):Int { 0 }; };");
    assert_eq!(
        err,
        "\"test.cl\", line 1: 'self' cannot be the name of a formal parameter."
    );
}

#[test]
fn test_body_must_conform_to_return_type() {
    let err = check_err("class Main { main():Int { \"s\" }; };");
    assert_eq!(
        err,
        "\"test.cl\", line 1: Inferred return type String of method main does not conform to declared return type Int."
    );
}

#[test]
fn test_new_with_undefined_class() {
    let err = check_err("class Main { main():Object { new Nope }; };");
    assert_eq!(err, "\"test.cl\", line 1: 'new' used with undefined class Nope.");
}

#[test]
fn test_not_requires_bool() {
    let err = check_err("class Main { main():Bool { not 1 }; };");
    assert_eq!(err, "\"test.cl\", line 1: Argument of 'not' has type Int instead of Bool.");
}

#[test]
fn test_neg_requires_int() {
    let err = check_err("class Main { main():Int { ~true }; };");
    assert_eq!(err, "\"test.cl\", line 1: Argument of '~' has type Bool instead of Int.");
}

// ─── Syntax errors from the front-end ────────────────────────────────────────

#[test]
fn test_syntax_error_is_prefixed_with_location() {
    let err = match check("class Main { main():Object { } };") {
        Err(error) => error.to_string(),
        Ok(_) => panic!("parse should fail"),
    };
    assert!(err.starts_with("\"test.cl\", line 1: syntax error"), "got: {}", err);
}

// ─── Stack budgeting ──────────────────────────────────────────────────────────

#[test]
fn test_new_needs_one_slot() {
    let analysis = check(
        "class Main { main():Object { new Main }; };",
    )
    .expect("should check");
    assert_eq!(method_stack(&analysis, "Main", "main"), 1);
}

#[test]
fn test_binary_op_holds_left_operand() {
    let analysis = check("class Main { main():Int { 1 + 2 }; };").expect("should check");
    assert_eq!(method_stack(&analysis, "Main", "main"), 1);
}

#[test]
fn test_nested_binary_ops_stack_up() {
    // ((1 + 2) + (3 + 4)): the right subtree runs with the left sum
    // spilled, and its own left operand needs a second slot
    let analysis =
        check("class Main { main():Int { (1 + 2) + (3 + 4) }; };").expect("should check");
    assert_eq!(method_stack(&analysis, "Main", "main"), 2);
}

#[test]
fn test_literal_body_needs_no_slots() {
    let analysis = check("class Main { main():Int { 1 }; };").expect("should check");
    assert_eq!(method_stack(&analysis, "Main", "main"), 0);
}

#[test]
fn test_let_binding_needs_a_slot() {
    let analysis =
        check("class Main { main():Int { let x : Int in x }; };").expect("should check");
    assert_eq!(method_stack(&analysis, "Main", "main"), 1);
}

#[test]
fn test_attribute_initialisers_budget_the_class_init() {
    let analysis = check(
        "class Main { x : Int <- 1 + 2; main():Int { 0 }; };",
    )
    .expect("should check");
    let main_id = analysis.types.get("Main").expect("Main");
    assert_eq!(analysis.tree.class(main_id).expression_stack, 1);
}
