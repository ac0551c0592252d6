//! Computing values: operators, special forms, meta functions and staleness

mod common;

use common::*;
use insta::assert_snapshot;
use treecalc_engine::prelude::*;

#[test]
fn test_values_flow_through_suppliers() {
    let mut s = cities();
    assert_eq!(floats(&mut s, "/m/cities/density"), vec![2.0, 4.0, 6.0]);
    assert_eq!(s.value("/m/total").unwrap(), Value::Float64(6.0));
}

#[test]
fn test_data_edits_make_dependents_stale() {
    let mut s = cities();
    assert_eq!(s.value("/m/total").unwrap(), Value::Float64(6.0));

    let pop = node(&s, "/m/cities/pop");
    s.set_data(pop, Column::Float64(vec![10.0, 20.0, 30.0])).unwrap();
    assert_eq!(s.value("/m/total").unwrap(), Value::Float64(60.0));
    assert_eq!(floats(&mut s, "/m/cities/density"), vec![20.0, 40.0, 60.0]);
}

#[test]
fn test_set_data_rejects_calculated_items_and_wrong_types() {
    let mut s = cities();
    let density = node(&s, "/m/cities/density");
    let pop = node(&s, "/m/cities/pop");

    assert!(s.set_data(density, Column::Float64(vec![1.0])).is_err());
    assert!(matches!(
        s.set_data(pop, Column::Int32(vec![1, 2, 3])),
        Err(CalcError::TypeMismatch { .. })
    ));
}

#[test]
fn test_arrow_looks_up_through_the_index() {
    let mut s = cities();
    let region_name = node(&s, "/m/cities/regionName");
    assert_snapshot!(
        s.canonical_key(region_name).unwrap().to_string(),
        @r#"(lookup (sourceDescr "/m/cities/region") (sourceDescr "/m/regions/name"))"#
    );
    let column = s.read_column(region_name).unwrap();
    assert_eq!(
        *column,
        Column::String(vec!["south".into(), "north".into(), "south".into()])
    );
}

#[test]
fn test_lookup_requires_matching_domains() {
    let mut s = cities();
    let cities = node(&s, "/m/cities");
    let bad = param(&mut s, cities, "bad", "lookup(region, pop)");
    let err = s.canonical_key(bad).unwrap_err();
    assert_snapshot!(
        err.to_string(),
        @"lookup: index refers to /m/regions but the attribute is defined on /m/cities"
    );
}

#[test]
fn test_id_and_count_follow_the_unit() {
    let mut s = cities();
    let cities = node(&s, "/m/cities");
    let ids = s.create_item(
        cities,
        "ids",
        NodeKind::Data(DataMeta {
            domain: Some(cities),
            ..DataMeta::default()
        }),
    )
    .unwrap();
    s.set_expr(ids, "id(cities)").unwrap();
    assert_eq!(*s.read_column(ids).unwrap(), Column::UInt32(vec![0, 1, 2]));

    let m = node(&s, "/m");
    param(&mut s, m, "n", "count(cities/pop)");
    assert_eq!(s.value("/m/n").unwrap(), Value::UInt32(3));
}

#[test]
fn test_division_by_zero_is_undefined() {
    let mut s = Session::new();
    let root = s.config_root();
    constant(&mut s, root, "a", Value::Int32(5));
    param(&mut s, root, "q", "a / 0");
    let q = s.value("/q").unwrap();
    assert!(!q.is_defined());
}

#[test]
fn test_scope_resolves_in_the_namespace() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    let consts = container(&mut s, m, "consts");
    let k = constant(&mut s, consts, "k", Value::Float64(2.5));
    let x = param(&mut s, m, "x", "scope(consts, k * 2)");

    assert_snapshot!(s.canonical_key(x).unwrap().to_string(), @r#"(mul (sourceDescr "/m/consts/k") 2)"#);
    assert_eq!(s.suppliers(x).unwrap(), vec![consts, k]);
    assert_eq!(s.value("/m/x").unwrap(), Value::Float64(5.0));
}

#[test]
fn test_subitem_path_is_computed() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    let set = container(&mut s, m, "set");
    constant(&mut s, set, "a", Value::Float64(1.0));
    constant(&mut s, set, "b", Value::Float64(2.0));
    let which = constant(&mut s, m, "which", Value::String("b".into()));
    let x = param(&mut s, m, "x", "set!which");

    assert_eq!(s.value("/m/x").unwrap(), Value::Float64(2.0));
    let b = node(&s, "/m/set/b");
    // container first, then the path rule, then the selected member
    assert_eq!(s.suppliers(x).unwrap(), vec![set, which, b]);

    // the rule read data, so a data edit recompiles it
    s.set_data(which, Column::String(vec!["a".into()])).unwrap();
    assert_eq!(s.value("/m/x").unwrap(), Value::Float64(1.0));
    let a = node(&s, "/m/set/a");
    assert_eq!(s.suppliers(x).unwrap(), vec![set, which, a]);
}

#[test]
fn test_arrow_suppliers_list_index_before_member() {
    let mut s = cities();
    let x = node(&s, "/m/cities/regionName");
    let index = node(&s, "/m/cities/region");
    let name = node(&s, "/m/regions/name");
    assert_eq!(s.suppliers(x).unwrap(), vec![index, name]);
}

#[test]
fn test_long_chain_computes_without_deep_recursion() {
    const N: usize = 5000;
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    param(&mut s, m, "a0", "0");
    for i in 1..N {
        param(&mut s, m, &format!("a{}", i), &format!("a{} + 1", i - 1));
    }

    assert_eq!(
        s.value(&format!("/m/a{}", N - 1)).unwrap(),
        Value::UInt32((N - 1) as u32)
    );
    // the middle of the chain was computed on the way
    assert_eq!(s.value("/m/a2500").unwrap(), Value::UInt32(2500));
}

#[test]
fn test_choose_compiles_only_the_selected_branch() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    let sel = constant(&mut s, m, "sel", Value::UInt32(1));
    let broken = param(&mut s, m, "broken", "nowhere + 1");
    param(&mut s, m, "fine", "7");
    let x = param(&mut s, m, "x", "choose(sel, broken, fine)");

    assert_snapshot!(
        s.canonical_key(x).unwrap().to_string(),
        @r#"(choose (sourceDescr "/m/sel") (sourceDescr "/m/broken") 7)"#
    );
    assert_eq!(s.value("/m/x").unwrap(), Value::UInt32(7));
    assert!(s.fail_reason(broken).is_none());

    // selecting the broken branch surfaces its failure
    s.set_data(sel, Column::UInt32(vec![0])).unwrap();
    let err = s.value("/m/x").unwrap_err();
    assert_eq!(err.origin(), Some("/m/broken"));
}

#[test]
fn test_indirect_rules_are_computed_text() {
    let mut s = Session::new();
    let root = s.config_root();
    let text = constant(&mut s, root, "ruleText", Value::String("1 + 41".into()));
    param(&mut s, root, "x", "=ruleText");

    assert_eq!(s.value("/x").unwrap(), Value::UInt32(42));
    s.set_data(text, Column::String(vec!["2 * 4".into()])).unwrap();
    assert_eq!(s.value("/x").unwrap(), Value::UInt32(8));
}

/// Template `t(i, prev)` with `nextValue = prev + i`
fn accumulator(s: &mut Session, parent: NodeId) -> NodeId {
    let t = template(s, parent, "t");
    s.create_item(t, "i", NodeKind::Data(DataMeta::default())).unwrap();
    param(s, t, "prev", "0");
    param(s, t, "nextValue", "prev + i");
    t
}

#[test]
fn test_loop_unrolls_into_iterations() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    accumulator(&mut s, m);
    let l = calculated_container(&mut s, m, "l", "loop(t, 3)");
    param(&mut s, m, "r", "l/lastIter/nextValue");

    // 0, 0 + 1, 1 + 2
    assert_eq!(s.value("/m/r").unwrap(), Value::UInt32(3));
    for i in 0..3 {
        let iter = node(&s, &format!("/m/l/iter{}", i));
        assert!(s.tree().node(iter).flags.endogenous);
    }
    assert_eq!(
        s.tree().node(node(&s, "/m/l/iter1")).expr.as_deref(),
        Some("/m/t(UInt16(1), iter0/nextValue)")
    );

    // a new count replaces the generated items
    s.set_expr(l, "loop(t, 2)").unwrap();
    assert_eq!(s.value("/m/r").unwrap(), Value::UInt32(1));
    assert!(s.lookup("/m/l/iter2").is_none());
}

#[test]
fn test_loop_of_zero_iterations_leaves_last_iter_empty() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    accumulator(&mut s, m);
    let l = calculated_container(&mut s, m, "l", "loop(t, 0)");

    assert_snapshot!(s.canonical_key(l).unwrap().to_string(), @r#"(sourceDescr "/m/l")"#);
    let last = node(&s, "/m/l/lastIter");
    assert!(!s.tree().node(last).has_calculator());
    assert_eq!(s.tree().children(l).count(), 1);
}

/// String attribute `name` below a fresh unit `unit`, one element per entry
fn names(s: &mut Session, parent: NodeId, unit: &str, name: &str, values: &[&str]) -> NodeId {
    let domain = s
        .create_item(
            parent,
            unit,
            NodeKind::Unit(UnitInfo {
                value_type: ValueType::UInt32,
                count: Some(values.len() as u64),
            }),
        )
        .unwrap();
    let item = s
        .create_item(
            parent,
            name,
            NodeKind::Data(DataMeta {
                value_type: Some(ValueType::String),
                domain: Some(domain),
                values: None,
            }),
        )
        .unwrap();
    let column = Column::String(values.iter().map(|v| v.to_string()).collect());
    s.set_data(item, column).unwrap();
    item
}

#[test]
fn test_loop_links_each_iteration_to_the_previous() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    accumulator(&mut s, m);
    calculated_container(&mut s, m, "l", "loop(t, UInt16(3))");
    param(&mut s, m, "r", "l/lastIter/nextValue");

    assert_eq!(s.value("/m/r").unwrap(), Value::UInt32(3));
    let expr = |s: &Session, path: &str| s.tree().node(node(s, path)).expr.clone();
    assert_eq!(expr(&s, "/m/l/iter0").as_deref(), Some("/m/t(UInt16(0))"));
    assert_eq!(expr(&s, "/m/l/iter2").as_deref(), Some("/m/t(UInt16(2), iter1/nextValue)"));
    assert_eq!(expr(&s, "/m/l/lastIter").as_deref(), Some("iter2"));

    // lastIter stands for the final iteration
    let last = node(&s, "/m/l/lastIter");
    let iter2 = node(&s, "/m/l/iter2");
    assert_snapshot!(s.canonical_key(last).unwrap().to_string(), @r#"(sourceDescr "/m/l/iter2")"#);
    assert_eq!(s.suppliers(last).unwrap().first(), Some(&iter2));
}

#[test]
fn test_ids_of_replaced_iterations_fail_cleanly() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    accumulator(&mut s, m);
    let l = calculated_container(&mut s, m, "l", "loop(t, UInt16(3))");
    s.canonical_key(l).unwrap();
    let iter2 = node(&s, "/m/l/iter2");

    s.set_expr(l, "loop(t, UInt16(2))").unwrap();
    // the old iteration may still be computed or already be gone
    match s.calc_item(iter2) {
        CalcOutcome::Ready(_) | CalcOutcome::Failed(_) => {}
        CalcOutcome::Suspended => panic!("suspended without a trigger"),
    }

    s.canonical_key(l).unwrap();
    assert!(!s.tree().contains(iter2));
    assert_eq!(s.lookup("/m/l/iter2"), None);
    assert!(matches!(
        s.calc_item(iter2),
        CalcOutcome::Failed(CalcError::Undefined { .. })
    ));
    assert!(matches!(s.canonical_key(iter2), Err(CalcError::Undefined { .. })));
    assert!(s.suppliers(iter2).is_err());
    assert!(s.read_column(iter2).is_err());
    assert!(s.estimate(iter2).is_err());
    assert!(s.set_expr(iter2, "1").is_err());
    assert!(s.set_data(iter2, Column::UInt32(vec![1])).is_err());
    assert!(s.set_prop(iter2, "IsTemplate", "true").is_err());
    assert!(s.create_item(iter2, "x", NodeKind::Container).is_err());
    assert!(s.fail_reason(iter2).is_none());
}

#[test]
fn test_iterate_chains_named_steps() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    names(&mut s, m, "steps", "stepNames", &["a", "b", "c"]);
    constant(&mut s, m, "init", Value::Float64(1.0));
    constant(&mut s, m, "start", Value::String("init".into()));
    let step = template(&mut s, m, "step");
    s.create_item(step, "value", NodeKind::Data(DataMeta::default())).unwrap();
    param(&mut s, step, "nextValue", "value * 2");
    calculated_container(&mut s, m, "it", "iterate(stepNames, step, start)");
    param(&mut s, m, "r", "it/lastValue");

    assert_eq!(s.value("/m/r").unwrap(), Value::Float64(8.0));
    for name in ["a", "b", "c", "lastValue"] {
        assert!(s.lookup(&format!("/m/it/{}", name)).is_some(), "missing {}", name);
    }
    let expr = |s: &Session, path: &str| s.tree().node(node(s, path)).expr.clone();
    assert_eq!(expr(&s, "/m/it/a").as_deref(), Some("/m/step(init)"));
    assert_eq!(expr(&s, "/m/it/b").as_deref(), Some("/m/step(a/nextValue)"));
    assert_eq!(expr(&s, "/m/it/lastValue").as_deref(), Some("c/nextValue"));
}

#[test]
fn test_iterate_keeps_each_name_whole() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    names(&mut s, m, "steps", "stepNames", &["a, b"]);
    constant(&mut s, m, "init", Value::Float64(1.0));
    constant(&mut s, m, "start", Value::String("init".into()));
    let step = template(&mut s, m, "step");
    s.create_item(step, "value", NodeKind::Data(DataMeta::default())).unwrap();
    param(&mut s, step, "nextValue", "value * 2");
    let it = calculated_container(&mut s, m, "it", "iterate(stepNames, step, start)");

    s.canonical_key(it).unwrap();
    assert!(s.lookup("/m/it/a, b").is_some());
    assert!(s.lookup("/m/it/a").is_none());
}

#[test]
fn test_for_each_generates_one_item_per_name() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    names(&mut s, m, "slots", "itemNames", &["x", "", "y"]);
    names(&mut s, m, "rules", "itemRules", &["2 + 3", "1", "x * 10"]);
    constant(&mut s, m, "oneRule", Value::String("4".into()));
    let gen = calculated_container(&mut s, m, "gen", "for_each_ne(itemNames, itemRules)");
    param(&mut s, m, "r", "gen/y + 1");

    assert_eq!(s.value("/m/r").unwrap(), Value::UInt32(51));
    // the empty name is skipped
    assert_eq!(s.tree().children(gen).count(), 2);
    let x = node(&s, "/m/gen/x");
    assert!(s.tree().node(x).flags.endogenous);
    assert_eq!(s.tree().node(x).expr.as_deref(), Some("2 + 3"));

    // one rule serves every name; the old items are replaced
    s.set_expr(gen, "for_each_ne(itemNames, oneRule)").unwrap();
    assert_eq!(s.value("/m/r").unwrap(), Value::UInt32(5));
    assert!(!s.tree().contains(x));
    assert_eq!(s.value("/m/gen/x").unwrap(), Value::UInt32(4));
}

#[test]
fn test_for_each_rejects_mismatched_rules() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    names(&mut s, m, "slots", "itemNames", &["x", "y", "z"]);
    names(&mut s, m, "rules", "itemRules", &["1", "2"]);
    let gen = calculated_container(&mut s, m, "gen", "for_each_ne(itemNames, itemRules)");

    let err = s.canonical_key(gen).unwrap_err();
    assert!(err.to_string().contains("3 names but 2 expressions"), "{}", err);
}

#[test]
fn test_for_each_nedv_types_the_generated_items() {
    let mut s = cities();
    let m = node(&s, "/m");
    let cities_unit = node(&s, "/m/cities");
    let meters = s
        .create_item(
            m,
            "meters",
            NodeKind::Unit(UnitInfo {
                value_type: ValueType::Float64,
                count: None,
            }),
        )
        .unwrap();
    constant(&mut s, m, "attrNames", Value::String("popTwice".into()));
    constant(&mut s, m, "attrRules", Value::String("cities/pop * 2".into()));
    let derived = calculated_container(
        &mut s,
        m,
        "derived",
        "for_each_nedv(attrNames, attrRules, cities, meters)",
    );

    s.canonical_key(derived).unwrap();
    let item = node(&s, "/m/derived/popTwice");
    assert_eq!(
        s.tree().node(item).kind,
        NodeKind::Data(DataMeta {
            value_type: Some(ValueType::Float64),
            domain: Some(cities_unit),
            values: Some(meters),
        })
    );
    assert_eq!(floats(&mut s, "/m/derived/popTwice"), vec![2.0, 4.0, 6.0]);
}

#[test]
fn test_template_call_binds_arguments_in_order() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    let twice = template(&mut s, m, "twice");
    s.create_item(twice, "input", NodeKind::Data(DataMeta::default())).unwrap();
    param(&mut s, twice, "out", "input * 2");
    calculated_container(&mut s, m, "x", "twice(21)");
    let y = param(&mut s, m, "y", "x/out");

    assert_snapshot!(s.canonical_key(y).unwrap().to_string(), @"(mul 21 2)");
    assert_eq!(s.value("/m/y").unwrap(), Value::UInt32(42));
    // the template itself stays uncompiled
    let out = node(&s, "/m/twice/out");
    assert!(s.tree().node(out).compiled.is_none());
}

#[test]
fn test_template_call_with_too_many_arguments_fails() {
    let mut s = Session::new();
    let root = s.config_root();
    let m = container(&mut s, root, "m");
    let t = template(&mut s, m, "one");
    s.create_item(t, "p", NodeKind::Data(DataMeta::default())).unwrap();
    let x = calculated_container(&mut s, m, "x", "one(1, 2)");
    assert_snapshot!(
        s.canonical_key(x).unwrap_err().to_string(),
        @"/m/one takes at most 1 arguments, 2 given"
    );
}
