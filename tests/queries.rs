//! End-to-end query engine scenarios: cold and warm execution, precise
//! invalidation, cycles, quotas, and the no-work-rebuild property.

mod common;

use common::FixtureAst;
use sovereign::{
    ChangeSet, ContentId, HoverInfo, QueryArg, QueryEngine, QueryError, QueryKind, QueryResult,
    QuotaProfile, Severity, TypeInfo,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn hover(text: &str) -> QueryResult {
    QueryResult::Hover(HoverInfo {
        text: text.to_owned(),
        type_name: "()".to_owned(),
    })
}

fn engine_with_fixture() -> (QueryEngine, Arc<FixtureAst>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let ast = Arc::new(FixtureAst::new());
    let engine = QueryEngine::new(ast.clone(), QuotaProfile::batch());
    (engine, ast)
}

#[test]
fn cold_empty_args_query_populates_cache() {
    let (engine, _ast) = engine_with_fixture();
    engine.register(QueryKind::Hover, |_ctx, _args| Ok(hover("fn main()")));

    let execution = engine.execute(QueryKind::Hover, &[]).unwrap();
    assert!(!execution.from_cache);
    assert_eq!(execution.result, hover("fn main()"));
    assert!(execution.deps.is_empty());
    assert_eq!(engine.cache_len(), 1);

    let key = engine.memo_key(QueryKind::Hover, &[]);
    assert!(engine.deps_of(&key).unwrap().is_empty());
}

#[test]
fn warm_repeat_skips_the_body() {
    let (engine, _ast) = engine_with_fixture();
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    engine.register(QueryKind::Hover, |_ctx, _args| {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(hover("h"))
    });

    let first = engine.execute(QueryKind::Hover, &[]).unwrap();
    let second = engine.execute(QueryKind::Hover, &[]).unwrap();
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.result, second.result);
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn invalidation_forces_exactly_one_reexecution() {
    let (engine, ast) = engine_with_fixture();
    let module = ast.add_module("mod", Vec::new());
    let expr = ast.add_expr("x + 1", module);

    let calls = Arc::new(AtomicUsize::new(0));
    let body_calls = calls.clone();
    engine.register(QueryKind::Hover, move |ctx, _args| {
        body_calls.fetch_add(1, Ordering::SeqCst);
        let view = ctx.node(expr)?;
        Ok(hover(&format!("expr spanning {:?}", view.span)))
    });

    let cold = engine.execute(QueryKind::Hover, &[]).unwrap();
    assert!(!cold.from_cache);
    assert!(cold.deps.contains_cid(&expr));

    let report = engine.invalidate(&ChangeSet::new().modify(expr));
    assert_eq!(report.queries_invalidated, 1);
    assert_eq!(report.entries_evicted, 1);

    let warm = engine.execute(QueryKind::Hover, &[]).unwrap();
    assert!(!warm.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // And the rebuilt entry is hot again.
    assert!(engine.execute(QueryKind::Hover, &[]).unwrap().from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn unrelated_changes_do_not_evict() {
    let (engine, ast) = engine_with_fixture();
    let module = ast.add_module("mod", Vec::new());
    let used = ast.add_expr("used", module);
    let untouched = ContentId::hash_of(b"never-read");

    engine.register(QueryKind::Hover, move |ctx, _args| {
        ctx.node(used)?;
        Ok(hover("uses one node"))
    });
    engine.execute(QueryKind::Hover, &[]).unwrap();

    let report = engine.invalidate(&ChangeSet::new().modify(untouched));
    assert_eq!(report.queries_invalidated, 0);
    assert!(engine.execute(QueryKind::Hover, &[]).unwrap().from_cache);
}

#[test]
fn cosmetic_changes_never_invalidate() {
    let (engine, ast) = engine_with_fixture();
    let module = ast.add_module("mod", Vec::new());
    let expr = ast.add_expr("y", module);

    engine.register(QueryKind::Hover, move |ctx, _args| {
        ctx.node(expr)?;
        Ok(hover("h"))
    });
    engine.execute(QueryKind::Hover, &[]).unwrap();

    engine.invalidate(&ChangeSet::new().modify(expr).with_severity(Severity::Cosmetic));
    assert!(engine.execute(QueryKind::Hover, &[]).unwrap().from_cache);
}

#[test]
fn invalidation_cascades_through_subqueries() {
    let (engine, ast) = engine_with_fixture();
    let module = ast.add_module("mod", Vec::new());
    let expr = ast.add_expr("leaf", module);

    let type_calls = Arc::new(AtomicUsize::new(0));
    let hover_calls = Arc::new(AtomicUsize::new(0));

    let counter = type_calls.clone();
    engine.register(QueryKind::TypeOf, move |ctx, _args| {
        counter.fetch_add(1, Ordering::SeqCst);
        ctx.node(expr)?;
        Ok(QueryResult::Type(TypeInfo {
            name: "Int".into(),
            declaration: None,
        }))
    });
    let counter = hover_calls.clone();
    engine.register(QueryKind::Hover, move |ctx, _args| {
        counter.fetch_add(1, Ordering::SeqCst);
        match ctx.subquery(QueryKind::TypeOf, &[])? {
            QueryResult::Type(info) => Ok(hover(&info.name)),
            other => panic!("unexpected {:?}", other),
        }
    });

    engine.execute(QueryKind::Hover, &[]).unwrap();
    assert_eq!(engine.cache_len(), 2);

    // The hover query never read `expr` itself, only through typeOf.
    let report = engine.invalidate(&ChangeSet::new().modify(expr));
    assert_eq!(report.queries_invalidated, 2);
    assert_eq!(engine.cache_len(), 0);

    engine.execute(QueryKind::Hover, &[]).unwrap();
    assert_eq!(type_calls.load(Ordering::SeqCst), 2);
    assert_eq!(hover_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn cycle_between_bodies_caches_nothing() {
    let (engine, _ast) = engine_with_fixture();
    engine.register(QueryKind::Hover, |ctx, _args| {
        ctx.subquery(QueryKind::TypeOf, &[])?;
        Ok(hover("unreachable"))
    });
    engine.register(QueryKind::TypeOf, |ctx, _args| {
        ctx.subquery(QueryKind::Hover, &[])?;
        Ok(QueryResult::Type(TypeInfo {
            name: "loop".into(),
            declaration: None,
        }))
    });

    let err = engine.execute(QueryKind::Hover, &[]).unwrap_err();
    assert!(matches!(err, QueryError::Cycle(_)));
    assert_eq!(engine.cache_len(), 0);
}

#[test]
fn interactive_quota_stops_runaway_traversal() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ast = Arc::new(FixtureAst::new());
    let module = ast.add_module("mod", Vec::new());
    let expr = ast.add_expr("hot", module);
    let engine = QueryEngine::new(ast.clone(), QuotaProfile::interactive());

    engine.register(QueryKind::Hover, move |ctx, _args| {
        for _ in 0..20_000 {
            ctx.node(expr)?;
        }
        Ok(hover("unreachable"))
    });

    let err = engine.execute(QueryKind::Hover, &[]).unwrap_err();
    assert!(matches!(err, QueryError::QuotaExceeded(_)));
    assert_eq!(engine.cache_len(), 0);
    assert_eq!(engine.telemetry().global().quota_exceeded, 1);
}

#[test]
fn memo_keys_are_argument_sensitive() {
    let (engine, _ast) = engine_with_fixture();
    let a = engine.memo_key(QueryKind::TypeOf, &[QueryArg::Scalar(1)]);
    let b = engine.memo_key(QueryKind::TypeOf, &[QueryArg::Scalar(2)]);
    let c = engine.memo_key(QueryKind::TypeOf, &[QueryArg::Scalar(1)]);
    assert_ne!(a, b);
    assert_eq!(a, c);
    assert_ne!(a, engine.memo_key(QueryKind::Hover, &[QueryArg::Scalar(1)]));
}

#[test]
fn no_work_rebuild_has_full_hit_rate() {
    let (engine, ast) = engine_with_fixture();
    let module = ast.add_module("mod", Vec::new());
    let exprs: Vec<ContentId> = (0..10)
        .map(|i| ast.add_expr(&format!("expr-{}", i), module))
        .collect();

    engine.register(QueryKind::Hover, move |ctx, args| {
        let index = match args {
            [QueryArg::Scalar(i)] => *i as usize,
            _ => 0,
        };
        ctx.node(exprs[index % exprs.len()])?;
        Ok(hover(&format!("#{}", index)))
    });

    for i in 0..10 {
        let run = engine
            .execute(QueryKind::Hover, &[QueryArg::Scalar(i)])
            .unwrap();
        assert!(!run.from_cache);
    }
    let lookups_after_first_pass = ast.node_lookups();

    for i in 0..10 {
        let run = engine
            .execute(QueryKind::Hover, &[QueryArg::Scalar(i)])
            .unwrap();
        assert!(run.from_cache, "query {} missed on the second pass", i);
    }
    // Zero stage work: the second pass never touched the AST.
    assert_eq!(ast.node_lookups(), lookups_after_first_pass);

    let stats = engine.cache_stats();
    assert_eq!(stats.hits, 10);
    assert_eq!(stats.entries, 10);
}

#[test]
fn telemetry_separates_hits_from_misses() {
    let (engine, _ast) = engine_with_fixture();
    engine.register(QueryKind::Hover, |_ctx, _args| Ok(hover("h")));

    engine.execute(QueryKind::Hover, &[]).unwrap();
    engine.execute(QueryKind::Hover, &[]).unwrap();
    engine.execute(QueryKind::Hover, &[]).unwrap();

    let stats = engine.telemetry().stats_for(QueryKind::Hover).unwrap();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.cache_hits, 2);

    let global = engine.telemetry().global();
    assert_eq!(global.total_queries, 3);
    assert_eq!(global.cache_hits, 2);
}
