//! Benchmarks for substitution and the controller memo

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use treecalc_engine::prelude::*;
use treecalc_engine::parse_expr;

/// Session with `/m/n0 = 1` and `/m/n{i} = n{i-1} + 1` up to `len`
fn setup_chain(len: usize) -> (Session, NodeId) {
    let mut session = Session::new();
    let root = session.config_root();
    let m = session.create_item(root, "m", NodeKind::Container).expect("live parent");
    let mut last = session.create_item(m, "n0", NodeKind::Data(DataMeta::default())).expect("live parent");
    session.set_expr(last, "1").expect("live item");
    for i in 1..len {
        last = session.create_item(m, &format!("n{}", i), NodeKind::Data(DataMeta::default())).expect("live parent");
        session.set_expr(last, &format!("n{} + 1", i - 1)).expect("live item");
    }
    (session, last)
}

/// Session with `count` items that all spell the same rule differently
fn setup_shared(count: usize) -> (Session, Vec<NodeId>) {
    let mut session = Session::new();
    let root = session.config_root();
    let m = session.create_item(root, "m", NodeKind::Container).expect("live parent");
    let a = session.create_item(m, "a", NodeKind::Data(DataMeta::default())).expect("live parent");
    session.set_expr(a, "1.5").expect("live item");
    let items = (0..count)
        .map(|i| {
            let item = session.create_item(m, &format!("s{}", i), NodeKind::Data(DataMeta::default())).expect("live parent");
            let rule = if i % 2 == 0 { "a * 2" } else { "(a) * 2" };
            session.set_expr(item, rule).expect("live item");
            item
        })
        .collect();
    (session, items)
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_rule", |b| {
        b.iter(|| {
            let expr = parse_expr(black_box("sum(cities/pop * 2) / count(cities) + regions!north/area"));
            black_box(expr)
        })
    });
}

fn bench_substitution(c: &mut Criterion) {
    let mut group = c.benchmark_group("substitution_chain");

    for len in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, &len| {
            b.iter_batched(
                || setup_chain(len),
                |(mut session, last)| {
                    let key = session.canonical_key(last);
                    black_box(key)
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_memo(c: &mut Criterion) {
    let (mut session, items) = setup_shared(64);
    for &item in &items {
        let _ = session.item_dc(item);
    }

    c.bench_function("memo_hot", |b| {
        b.iter(|| {
            for &item in &items {
                black_box(session.item_dc(black_box(item)).ok());
            }
        })
    });
}

fn bench_calc(c: &mut Criterion) {
    c.bench_function("calc_chain_cold", |b| {
        b.iter_batched(
            || setup_chain(200),
            |(mut session, last)| black_box(session.read_column(last).ok()),
            BatchSize::SmallInput,
        )
    });

    let (mut session, last) = setup_chain(200);
    let _ = session.read_column(last);
    c.bench_function("calc_chain_hot", |b| {
        b.iter(|| black_box(session.read_column(black_box(last)).ok()))
    });
}

fn bench_edit_and_recompute(c: &mut Criterion) {
    let (mut session, last) = setup_chain(200);
    let first = session.lookup("/m/n0");

    c.bench_function("edit_and_recompute", |b| {
        let mut counter = 0u32;
        b.iter(|| {
            if let Some(first) = first {
                session.set_expr(first, &counter.to_string()).expect("live item");
            }
            black_box(session.read_column(last).ok());
            counter += 1;
        })
    });
}

criterion_group!(
    benches,
    bench_parse,
    bench_substitution,
    bench_memo,
    bench_calc,
    bench_edit_and_recompute,
);

criterion_main!(benches);
