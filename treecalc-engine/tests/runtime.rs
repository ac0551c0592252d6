//! Suspension, worker hand-off, payload cache, garbage collection and
//! model loading

mod common;

use common::*;
use std::fs;
use std::sync::Arc;
use treecalc_engine::prelude::*;
use treecalc_engine::suspend::suspend_first;
use treecalc_engine::{CalcCache, Config, ConfigError, MemoryStorage, VisitState};

/// Retry `calc_item` after every suspension, counting them
fn calc_with_retries(s: &mut Session, node: NodeId) -> (Arc<Column>, usize) {
    let mut suspensions = 0;
    loop {
        match s.calc_item(node) {
            CalcOutcome::Ready(future) => return (future.column.expect("computed data"), suspensions),
            CalcOutcome::Suspended => {
                suspensions += 1;
                s.suspend().resume();
            }
            CalcOutcome::Failed(error) => panic!("calculation failed: {}", error),
        }
        assert!(suspensions < 100, "no progress between suspensions");
    }
}

#[test]
fn test_suspended_calculation_resumes_to_the_same_result() {
    let rule = "sum(cities/density) + total";

    let mut plain = cities();
    let m = node(&plain, "/m");
    let chain = param(&mut plain, m, "chain", rule);
    let expected = plain.read_column(chain).unwrap();

    let mut s = cities();
    let m = node(&s, "/m");
    let chain = param(&mut s, m, "chain", rule);
    // suspend at every checkpoint that follows some progress
    s.suspend().install_trigger(|| true);
    let (column, suspensions) = calc_with_retries(&mut s, chain);

    assert_eq!(column, expected);
    assert_eq!(*column, Column::Float64(vec![18.0]));
    assert!(suspensions > 0);
    assert!(s.metrics().suspensions > 0);
}

#[test]
fn test_bounded_trigger_suspends_a_bounded_number_of_times() {
    let mut s = cities();
    let density = node(&s, "/m/cities/density");
    s.suspend().install_trigger(suspend_first(1));
    let (column, suspensions) = calc_with_retries(&mut s, density);
    assert_eq!(*column, Column::Float64(vec![2.0, 4.0, 6.0]));
    assert_eq!(suspensions, 1);
}

#[test]
fn test_worker_commit_is_published_by_the_meta_queue() {
    let mut s = cities();
    let density = node(&s, "/m/cities/density");
    let dc = s.item_dc(density).unwrap();

    let handle = s.spawn_calc(dc).unwrap().expect("worker started");
    assert_eq!(s.dc_state(dc), Some(DcState::DataPending));
    handle.join().unwrap();

    assert_eq!(s.pending_commits(), 1);
    assert_eq!(s.process_meta_queue(), 1);
    assert_eq!(s.pending_commits(), 0);
    assert_eq!(s.dc_state(dc), Some(DcState::DataReady));
    assert_eq!(floats(&mut s, "/m/cities/density"), vec![2.0, 4.0, 6.0]);

    // nothing left to hand off
    assert!(s.spawn_calc(dc).unwrap().is_none());
}

#[test]
fn test_reading_waits_for_worker_commits() {
    let mut s = cities();
    let total = node(&s, "/m/total");
    let dc = s.item_dc(total).unwrap();
    let handle = s.spawn_calc(dc).unwrap().expect("worker started");

    assert_eq!(s.value("/m/total").unwrap(), Value::Float64(6.0));
    assert_eq!(s.pending_commits(), 0);
    handle.join().unwrap();
}

#[test]
fn test_payload_cache_is_shared_between_sessions() {
    let cache = Arc::new(CalcCache::new());

    let mut first = cities().with_cache(Arc::clone(&cache));
    assert_eq!(floats(&mut first, "/m/cities/density"), vec![2.0, 4.0, 6.0]);
    assert!(cache.stats().entries >= 1);

    let mut second = cities().with_cache(Arc::clone(&cache));
    assert_eq!(floats(&mut second, "/m/cities/density"), vec![2.0, 4.0, 6.0]);
    let metrics = second.metrics();
    assert!(metrics.cache_hits >= 1);
    assert_eq!(metrics.computations, 0);
}

#[test]
fn test_cache_keys_include_input_payloads() {
    let cache = Arc::new(CalcCache::new());
    let mut first = cities().with_cache(Arc::clone(&cache));
    floats(&mut first, "/m/cities/density");

    let mut second = cities().with_cache(Arc::clone(&cache));
    let pop = node(&second, "/m/cities/pop");
    second
        .set_data(pop, Column::Float64(vec![5.0, 5.0, 5.0]))
        .unwrap();
    assert_eq!(floats(&mut second, "/m/cities/density"), vec![10.0, 10.0, 10.0]);
    assert_eq!(second.metrics().cache_hits, 0);
}

#[test]
fn test_garbage_collection_keeps_what_has_interest() {
    let mut s = cities();
    let density = node(&s, "/m/cities/density");
    let total = node(&s, "/m/total");
    let guard = s.retain_node(density).expect("live node");

    floats(&mut s, "/m/cities/density");
    assert_eq!(s.value("/m/total").unwrap(), Value::Float64(6.0));
    let density_dc = s.item_dc(density).unwrap();
    let total_dc = s.item_dc(total).unwrap();

    let stats = s.collect_garbage();
    assert!(stats.dcs_removed > 0);
    assert!(stats.nodes_removed > 0);
    assert_eq!(s.dc_state(density_dc), Some(DcState::DataReady));
    assert_eq!(s.dc_state(total_dc), None);

    drop(guard);
    s.collect_garbage();
    assert_eq!(s.dc_state(density_dc), None);

    // collected controllers are rebuilt on demand
    assert_eq!(s.value("/m/total").unwrap(), Value::Float64(6.0));
    assert!(s.metrics().collected >= stats.dcs_removed as u64);
}

const STORED: &str = r#"
items:
  - name: m
    items:
      - name: cities
        kind: unit
        count: 3
        items:
          - name: pop
            kind: attribute
            storage: pop.col
          - name: density
            kind: attribute
            expr: "pop * 2"
"#;

#[test]
fn test_storage_payloads_are_dropped_and_reloaded() {
    let mut s = load(STORED);
    let storage = MemoryStorage::new().with("pop.col", Column::Float64(vec![1.0, 2.0, 3.0]));
    s.register_storage("default", Arc::new(storage));

    assert_eq!(floats(&mut s, "/m/cities/density"), vec![2.0, 4.0, 6.0]);
    let stats = s.collect_garbage();
    assert_eq!(stats.payloads_dropped, 1);
    assert_eq!(floats(&mut s, "/m/cities/density"), vec![2.0, 4.0, 6.0]);
}

#[test]
fn test_missing_storage_manager_fails_the_read() {
    let mut s = load(STORED);
    let err = s.value("/m/cities/density").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Storage error: No storage manager registered as 'default'"
    );
}

#[test]
fn test_estimates_do_not_compute() {
    let mut s = cities();
    let density = node(&s, "/m/cities/density");
    let total = node(&s, "/m/total");

    let estimate = s.estimate(density).unwrap();
    assert_eq!((estimate.elements, estimate.bytes), (3, 24));
    let estimate = s.estimate(total).unwrap();
    assert_eq!((estimate.elements, estimate.bytes), (1, 8));
    assert_eq!(s.metrics().computations, 0);
}

#[test]
fn test_visiting_suppliers_can_stop_early() {
    let mut s = cities();
    let m = node(&s, "/m");
    let both = param(&mut s, m, "both", "total + sum(cities/density)");

    let mut seen = Vec::new();
    let state = s.visit_suppliers(both, |s, n| {
        seen.push(s.tree().full_name(n));
        VisitState::Continue
    });
    assert_eq!(state, VisitState::Continue);
    assert_eq!(
        seen,
        vec!["/m/total", "/m/cities/pop", "/m/cities/density"]
    );

    let mut visits = 0;
    let state = s.visit_suppliers(both, |_, _| {
        visits += 1;
        VisitState::Stop
    });
    assert_eq!(state, VisitState::Stop);
    assert_eq!(visits, 1);
}

#[test]
fn test_model_loads_from_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.yml");
    fs::write(&path, format!("engine:\n  cache_max_bytes: 1000000\n{}", CITIES)).unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.item_count(), 9);
    let mut s = Session::from_config(&config).unwrap();
    assert!(s.cache_stats().is_some());
    assert_eq!(s.value("/m/total").unwrap(), Value::Float64(6.0));

    let missing = Config::from_file(dir.path().join("absent.yml")).unwrap_err();
    assert!(matches!(missing, ConfigError::Io { .. }));
}

#[test]
fn test_suspension_can_be_disabled_in_the_model() {
    let s = load(&format!("engine:\n  suspension: false\n{}", CITIES));
    assert!(s.suspend().is_blocked());
    assert!(!s.engine().suspension);
}
