//! Canonical keys, supplier lists and compile-time failures

mod common;

use common::*;
use insta::assert_snapshot;
use treecalc_engine::prelude::*;

#[test]
fn test_equal_rules_share_a_controller() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    constant(&mut s, m, "a", Value::Float64(1.5));
    let x = param(&mut s, m, "x", "a + 1");
    let y = param(&mut s, m, "y", "(a)+1");

    let key = s.canonical_key(x).unwrap();
    assert_snapshot!(key.to_string(), @r#"(add (sourceDescr "/m/a") 1)"#);
    assert_eq!(s.canonical_key(y).unwrap(), key);

    // one controller for both rules
    let dc = s.item_dc(x).unwrap();
    assert_eq!(s.item_dc(y).unwrap(), dc);
    assert_eq!(s.value("/m/y").unwrap(), Value::Float64(2.5));
    assert!(s.metrics().memo_hits > 0);
}

#[test]
fn test_casts_and_value_type_names() {
    let mut s = Session::new();
    let root = s.config_root();
    let x = param(&mut s, root, "x", "UInt16(3) * 2");
    let y = param(&mut s, root, "y", "-4 + 1.5");

    assert_snapshot!(s.canonical_key(x).unwrap().to_string(), @"(mul (UInt16 3) 2)");
    assert_snapshot!(s.canonical_key(y).unwrap().to_string(), @"(add -4 1.5)");
    assert_eq!(s.value("/y").unwrap(), Value::Float64(-2.5));
}

#[test]
fn test_suppliers_are_transitive_in_first_occurrence_order() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    let a = constant(&mut s, m, "a", Value::Int32(1));
    let b = constant(&mut s, m, "b", Value::Int32(2));
    let y = param(&mut s, m, "y", "b * 2");
    let x = param(&mut s, m, "x", "a + b");
    let z = param(&mut s, m, "z", "y - x");

    assert_eq!(s.suppliers(x).unwrap(), vec![a, b]);
    // y first, then what y needs, then x and the rest of its list
    assert_eq!(s.suppliers(z).unwrap(), vec![y, b, x, a]);
    // Int32 constants times a UInt32 literal widen to Int64
    assert_eq!(s.value("/m/z").unwrap(), Value::Int64(1));
}

#[test]
fn test_aliases_take_the_key_of_their_target() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    constant(&mut s, m, "a", Value::UInt32(7));
    let x = param(&mut s, m, "x", "a * 3");
    let y = param(&mut s, m, "y", "x");

    assert_eq!(s.canonical_key(y).unwrap(), s.canonical_key(x).unwrap());
    assert_eq!(s.item_dc(y).unwrap(), s.item_dc(x).unwrap());
    assert_eq!(s.value("/m/y").unwrap(), Value::UInt32(21));
}

#[test]
fn test_long_cycle_is_reported_without_deep_recursion() {
    const N: usize = 5000;
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    let nodes: Vec<NodeId> = (0..N)
        .map(|i| param(&mut s, m, &format!("n{}", i), &format!("n{} + 1", (i + 1) % N)))
        .collect();

    let err = s.canonical_key(nodes[0]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Calculation rule would create a circular dependency in /m/n0"
    );
    // every member remembers why it failed
    assert!(matches!(
        s.fail_reason(nodes[N / 2]),
        Some(CalcError::CircularDependency { item }) if item == "/m/n2500"
    ));

    // breaking the cycle anywhere makes the chain compile again
    s.set_expr(nodes[N - 1], "1").unwrap();
    assert_snapshot!(
        s.canonical_key(nodes[N - 3]).unwrap().to_string(),
        @"(add (add 1 1) 1)"
    );
    assert!(s.fail_reason(nodes[N / 2]).is_none());
}

#[test]
fn test_self_reference_is_circular() {
    let mut s = Session::new();
    let root = s.config_root();
    let a = param(&mut s, root, "a", "this + 1");
    let err = s.canonical_key(a).unwrap_err();
    assert_eq!(err, CalcError::CircularDependency { item: "/a".into() });
}

#[test]
fn test_template_members_cannot_be_referenced_from_outside() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    let t = template(&mut s, m, "t");
    param(&mut s, t, "v", "1");
    let x = param(&mut s, m, "x", "t/v + 1");

    let err = s.canonical_key(x).unwrap_err();
    assert_snapshot!(
        err.to_string(),
        @"Calculation rule would create a dependency on /m/t/v which is (part of) a template"
    );
}

#[test]
fn test_unknown_identifier_reports_best_guess() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    let a = container(&mut s, m, "a");
    container(&mut s, a, "b");
    let x = param(&mut s, m, "x", "a/b/zz + 1");

    let err = s.canonical_key(x).unwrap_err();
    assert_eq!(
        err,
        CalcError::UnknownIdentifier {
            name: "a/b/zz".into(),
            context: "/m".into(),
            best_guess: Some("/m/a/b".into()),
        }
    );
    assert_snapshot!(err.to_string(), @"Unknown identifier 'a/b/zz' in /m (resolved up to /m/a/b)");
}

#[test]
fn test_identifiers_search_upwards_but_not_downwards() {
    let mut s = Session::new();
    let root = s.config_root();
    let outer = container(&mut s, root, "outer");
    let inner = container(&mut s, outer, "inner");
    constant(&mut s, outer, "k", Value::Float64(2.0));
    constant(&mut s, inner, "hidden", Value::Float64(3.0));
    param(&mut s, inner, "up", "k * 10");
    let down = param(&mut s, outer, "down", "hidden");

    assert_eq!(s.value("/outer/inner/up").unwrap(), Value::Float64(20.0));
    assert!(matches!(
        s.canonical_key(down),
        Err(CalcError::UnknownIdentifier { .. })
    ));
}

#[test]
fn test_no_matching_overload() {
    let mut s = Session::new();
    let root = s.config_root();
    let x = param(&mut s, root, "x", r#"not("text")"#);
    let err = s.canonical_key(x).unwrap_err();
    assert!(matches!(err, CalcError::NoOverload { ref operator, .. } if operator == "not"));
}

#[test]
fn test_unknown_operator() {
    let mut s = Session::new();
    let root = s.config_root();
    let x = param(&mut s, root, "x", "frobnicate(1)");
    assert_eq!(
        s.canonical_key(x).unwrap_err(),
        CalcError::UnknownOperator {
            name: "frobnicate".into()
        }
    );
}

#[test]
fn test_meta_function_inside_an_expression_is_rejected() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    template(&mut s, m, "t");
    let x = param(&mut s, m, "x", "loop(t, 2) + 1");
    let err = s.canonical_key(x).unwrap_err();
    assert_snapshot!(err.to_string(), @"meta function call not allowed as sub-expression");
}

#[test]
fn test_syntax_errors_name_the_item() {
    let mut s = Session::new();
    let root = s.config_root();
    let x = param(&mut s, root, "x", "1 +");
    assert!(matches!(
        s.canonical_key(x),
        Err(CalcError::Syntax { ref item, .. }) if item == "/x"
    ));
}

#[test]
fn test_downstream_failures_name_their_origin() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    param(&mut s, m, "a", "nowhere + 1");
    let b = param(&mut s, m, "b", "a * 2");
    let c = param(&mut s, m, "c", "b - 1");

    let err = s.canonical_key(c).unwrap_err();
    assert_eq!(err.origin(), Some("/m/a"));
    assert!(matches!(
        s.fail_reason(b),
        Some(CalcError::Downstream { source_item, .. }) if source_item == "/m/a"
    ));

    // creating the missing item clears the memoized failures
    constant(&mut s, m, "nowhere", Value::Float64(1.0));
    assert!(s.fail_reason(b).is_none());
    assert_eq!(s.value("/m/c").unwrap(), Value::Float64(3.0));
}

#[test]
fn test_rule_edits_recompile_dependents() {
    let mut s = Session::new();
    let root = s.config_root();
    let a = param(&mut s, root, "a", "1 + 2");
    let b = param(&mut s, root, "b", "a * 10");
    assert_eq!(s.value("/b").unwrap(), Value::UInt32(30));

    s.set_expr(a, "5").unwrap();
    assert_snapshot!(s.canonical_key(b).unwrap().to_string(), @"(mul 5 10)");
    assert_eq!(s.value("/b").unwrap(), Value::UInt32(50));
}

#[test]
fn test_check_lists_every_failing_rule() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    param(&mut s, m, "good", "1");
    let bad = param(&mut s, m, "bad", "missing * 2");
    let t = template(&mut s, m, "t");
    // rules inside templates are only checked through their instances
    param(&mut s, t, "broken", "missing");

    let failures = s.check(root);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, bad);
}
