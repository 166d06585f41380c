use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;

use super::*;
use crate::{
    andersen::AliasResult,
    ir::{self, IrDb, ValueId},
};

fn analyze_with<F: FnOnce(&mut PointsToSets<'_>, &IrDb)>(code: &str, conf: Config, f: F) {
    let db = ir::parse(code).unwrap();
    let mut pts = PointsToSets::new(&db, conf);
    f(&mut pts, &db);
}

fn analyze<F: FnOnce(&mut PointsToSets<'_>, &IrDb)>(code: &str, f: F) {
    analyze_with(code, Config::default(), f);
}

fn global(db: &IrDb, name: &str) -> ValueId {
    db.value_by_name(name).unwrap()
}

fn local(db: &IrDb, func: &str, name: &str) -> ValueId {
    db.local(global(db, func), name).unwrap()
}

fn sorted(set: FxHashSet<ValueId>) -> Vec<ValueId> {
    let mut v: Vec<_> = set.into_iter().collect();
    v.sort();
    v
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("mayalias_test_{}", name))
}

static TRIVIAL: &str = "
    module m
    func @f() {
    entry:
      %p = alloca i32
      %q = bitcast %p to i8*
      ret
    }
";

static CROSS_GLOBAL: &str = "
    module m
    global @g : i32*
    func @f(%x : i32*) {
    entry:
      store %x, @g
      ret
    }
    func @h() {
    entry:
      %y = load @g
      ret
    }
";

static HEAP: &str = "
    module m
    declare @malloc(i64) : i8*
    func @f(%n : i64) {
    entry:
      %h = call @malloc(%n)
      ret
    }
";

static HEAP_FLOW: &str = "
    module m
    global @g : i8*
    declare @malloc(i64) : i8*
    func @f(%n : i64) {
    entry:
      %h = call @malloc(%n)
      store %h, @g
      ret
    }
    func @k() {
    entry:
      %y = load @g
      ret
    }
";

static RICH: &str = "
    module m
    global @g : i32*
    global @buf : [8 x i32]
    declare @malloc(i64) : i8*
    func @id(%p : i8*) : i8* {
    entry:
      ret %p
    }
    func @f(%x : i32*, %n : i64) {
    entry:
      %a = alloca i32
      store %x, @g
      %h = call @malloc(%n)
      %fp = alloca i8*
      store @id, %fp
      ret
    }
    func @h() {
    entry:
      %y = load @g
      %b = gep @buf, 0, 0
      ret
    }
";

#[test]
fn test_trivial_aliasing() {
    analyze(TRIVIAL, |pts, db| {
        let p = local(db, "f", "p");
        let q = local(db, "f", "q");
        assert_eq!(pts.alias(p, q), AliasResult::Must);
        assert_eq!(sorted(pts.reachable_alloc_sites(p, false)), vec![p]);
        assert_eq!(sorted(pts.reachable_alloc_sites(q, true)), vec![p]);
        assert!(pts.is_in_reachable_alloc_sites(q, p, true));
        assert!(!pts.is_in_reachable_alloc_sites(p, q, false));
    });
}

#[test]
fn test_cross_function_global() {
    analyze(CROSS_GLOBAL, |pts, db| {
        let x = local(db, "f", "x");
        let y = local(db, "h", "y");
        let g = global(db, "g");
        assert_eq!(pts.alias(x, y), AliasResult::Must);
        assert_eq!(pts.alias(x, g), AliasResult::Must);
        assert!(pts.analyzed_functions().contains(&global(db, "f")));
        assert!(pts.analyzed_functions().contains(&global(db, "h")));
    });
}

#[test]
fn test_heap_alloc() {
    analyze(HEAP, |pts, db| {
        let h = local(db, "f", "h");
        assert_eq!(sorted(pts.reachable_alloc_sites(h, true)), vec![h]);
        assert_eq!(sorted(pts.reachable_alloc_sites(h, false)), vec![h]);
    });
    let conf = Config {
        heap_alloc_fns: FxHashSet::default(),
        ..Default::default()
    };
    analyze_with(HEAP, conf, |pts, db| {
        let h = local(db, "f", "h");
        assert!(pts.reachable_alloc_sites(h, true).is_empty());
        assert!(pts.reachable_alloc_sites(h, false).is_empty());
    });
}

#[test]
fn test_heap_flow_intra_inter() {
    analyze(HEAP_FLOW, |pts, db| {
        let h = local(db, "f", "h");
        let y = local(db, "k", "y");
        let g = global(db, "g");
        assert_eq!(sorted(pts.reachable_alloc_sites(y, false)), vec![h]);
        assert!(pts.reachable_alloc_sites(y, true).is_empty());
        // a global object sees allocation sites of every function
        assert_eq!(sorted(pts.reachable_alloc_sites(g, true)), vec![h]);
        assert!(pts.is_in_reachable_alloc_sites(y, h, false));
        assert!(!pts.is_in_reachable_alloc_sites(y, h, true));
    });
}

#[test]
fn test_function_pointer_store() {
    analyze(
        "
        module m
        func @foo() {
        entry:
          ret
        }
        func @f(%pp : i8**) {
        entry:
          store @foo, %pp
          ret
        }
        ",
        |pts, db| {
            let foo = global(db, "foo");
            let pp = local(db, "f", "pp");
            assert_eq!(pts.alias(foo, pp), AliasResult::Must);
        },
    );
}

#[test]
fn test_const_bitcast_store() {
    analyze(
        "
        module m
        global @a : i64
        func @f(%p : i8**) {
        entry:
          store bitcast @a to i8*, %p
          ret
        }
        ",
        |pts, db| {
            let a = global(db, "a");
            let p = local(db, "f", "p");
            assert_eq!(pts.alias(a, p), AliasResult::Must);
            let set = pts.points_to_set(a);
            assert!(set.contains(&a));
            assert!(set.contains(&p));
            // the interned bitcast expression is in the set as well
            assert_eq!(set.len(), 3);
        },
    );
}

#[test]
fn test_merge_views() {
    let db = ir::parse(CROSS_GLOBAL).unwrap();
    let x = local(&db, "f", "x");
    let y = local(&db, "h", "y");
    let g = global(&db, "g");

    // two views over the same IR, one with only @f analyzed and x ~ g,
    // the other with only @h analyzed and y ~ g
    let p1 = temp_path("merge_e1");
    let p2 = temp_path("merge_e2");
    std::fs::write(&p1, "[ValueIds]\n[AnalyzedFunctions]\n1 \n[PointsToSets]\n2 0 \n").unwrap();
    std::fs::write(&p2, "[ValueIds]\n[AnalyzedFunctions]\n5 \n[PointsToSets]\n6 0 \n").unwrap();
    let mut e1 = PointsToSets::load(&db, &p1, Config::default()).unwrap();
    let e2 = PointsToSets::load(&db, &p2, Config::default()).unwrap();
    std::fs::remove_file(&p1).ok();
    std::fs::remove_file(&p2).ok();

    e1.merge_with(&e2);
    // the incoming {y, g} class bridges into the existing {x, g} class
    assert_eq!(e1.alias(x, y), AliasResult::Must);
    assert_eq!(e1.analyzed_functions().len(), 2);
    let mut want = vec![g, x, y];
    want.sort();
    assert_eq!(sorted(e1.points_to_set(g)), want);
}

#[test]
fn test_merge_with_self_view() {
    let db = ir::parse(RICH).unwrap();
    let mut e1 = PointsToSets::new(&db, Config::default());
    let e2 = PointsToSets::new(&db, Config::default());
    let mut values = vec![];
    db.walk_values(|v| values.push(v));
    let before: Vec<_> = values.iter().map(|&v| sorted(e1.points_to_set(v))).collect();
    e1.merge_with(&e2);
    let after: Vec<_> = values.iter().map(|&v| sorted(e1.points_to_set(v))).collect();
    assert_eq!(before, after);
}

#[test]
fn test_save_load() {
    let db = ir::parse(RICH).unwrap();
    let mut e = PointsToSets::new(&db, Config::default());
    let mut values = vec![];
    db.walk_values(|v| values.push(v));
    for &v in &values {
        e.points_to_set(v);
    }
    let path = temp_path("roundtrip");
    e.save(&path).unwrap();
    let mut e2 = PointsToSets::load(&db, &path, Config::default()).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(e.analyzed_functions(), e2.analyzed_functions());
    for &v in &values {
        assert_eq!(
            sorted(e.points_to_set(v)),
            sorted(e2.points_to_set(v)),
            "{}",
            db.display_value(v)
        );
    }
}

#[test]
fn test_eager_lazy_closure() {
    let db = ir::parse(RICH).unwrap();
    let mut lazy = PointsToSets::new(&db, Config::default());
    let mut eager = PointsToSets::new(
        &db,
        Config {
            lazy: false,
            ..Default::default()
        },
    );
    let mut values = vec![];
    db.walk_values(|v| values.push(v));
    for &v in &values {
        assert_eq!(
            sorted(lazy.points_to_set(v)),
            sorted(eager.points_to_set(v)),
            "{}",
            db.display_value(v)
        );
    }
}

#[test]
fn test_idempotence() {
    analyze(RICH, |pts, db| {
        let x = local(db, "f", "x");
        let y = local(db, "h", "y");
        let first = sorted(pts.points_to_set(x));
        assert_eq!(sorted(pts.points_to_set(x)), first);
        assert_eq!(pts.alias(x, y), pts.alias(y, x));
        let f = global(db, "f");
        let analyzed = pts.analyzed_functions().len();
        pts.compute_functions_points_to_set(Some(f));
        assert_eq!(pts.analyzed_functions().len(), analyzed);
        assert_eq!(sorted(pts.points_to_set(x)), first);
    });
}

#[test]
fn test_reflexivity() {
    analyze(RICH, |pts, db| {
        let mut values = vec![];
        db.walk_values(|v| values.push(v));
        for v in values {
            if db.is_interesting_pointer(v) {
                assert!(pts.points_to_set(v).contains(&v), "{}", db.display_value(v));
            } else {
                assert!(pts.points_to_set(v).is_empty());
            }
        }
    });
}

#[test]
fn test_introduce_alias_monotone() {
    analyze(RICH, |pts, db| {
        let a = local(db, "f", "a");
        let x = local(db, "f", "x");
        let y = local(db, "h", "y");
        assert_eq!(pts.alias(x, y), AliasResult::Must);
        assert_eq!(pts.alias(a, y), AliasResult::No);
        pts.introduce_alias(a, y, AliasResult::May);
        assert_eq!(pts.alias(a, y), AliasResult::Must);
        // previously aliased pairs stay aliased
        assert_eq!(pts.alias(x, y), AliasResult::Must);
        assert_eq!(pts.alias(a, x), AliasResult::Must);
    });
}

#[test]
fn test_alloc_site_soundness() {
    analyze(RICH, |pts, db| {
        let mut values = vec![];
        db.walk_values(|v| values.push(v));
        for &v in &values {
            for p in pts.reachable_alloc_sites(v, false) {
                assert!(db.is_alloca(p) || db.is_call(p), "{}", db.display_value(p));
            }
            let vfun = db.containing_fn(v);
            for p in pts.reachable_alloc_sites(v, true) {
                assert!(
                    db.is_global_object(v) || db.containing_fn(p) == vfun,
                    "{}",
                    db.display_value(p)
                );
            }
        }
    });
}

#[test]
fn test_uninteresting_values() {
    analyze(RICH, |pts, db| {
        let n = local(db, "f", "n");
        let x = local(db, "f", "x");
        assert_eq!(pts.alias(n, x), AliasResult::No);
        assert_eq!(pts.alias(x, n), AliasResult::No);
        assert!(pts.points_to_set(n).is_empty());
        assert!(pts.reachable_alloc_sites(n, false).is_empty());
        assert!(!pts.is_in_reachable_alloc_sites(n, x, false));
    });
}

#[test]
fn test_load_errors() {
    let db = ir::parse(TRIVIAL).unwrap();
    let missing = Path::new("/nonexistent/mayalias.pts");
    assert!(matches!(
        PointsToSets::load(&db, missing, Config::default()),
        Err(PersistError::Io { .. })
    ));

    let path = temp_path("no_sections");
    std::fs::write(&path, "garbage\n").unwrap();
    assert!(matches!(
        PointsToSets::load(&db, &path, Config::default()),
        Err(PersistError::Parse { .. })
    ));

    std::fs::write(&path, "[AnalyzedFunctions]\nxyz\n[PointsToSets]\n").unwrap();
    assert!(matches!(
        PointsToSets::load(&db, &path, Config::default()),
        Err(PersistError::Parse { .. })
    ));

    // value 1 exists but is not a function
    std::fs::write(&path, "[AnalyzedFunctions]\n1 \n[PointsToSets]\n").unwrap();
    assert!(matches!(
        PointsToSets::load(&db, &path, Config::default()),
        Err(PersistError::Parse { .. })
    ));
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_print_and_distribution() {
    analyze(TRIVIAL, |pts, db| {
        let p = local(db, "f", "p");
        pts.points_to_set(p);
        let mut out = vec![];
        pts.print(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("V: %p = alloca i32 in @f"));
        assert!(text.contains("\tpoints to -> %q = bitcast %p in @f"));
        let mut saved = vec![];
        pts.write(&mut saved).unwrap();
        assert!(String::from_utf8(saved).unwrap().starts_with("[ValueIds]\n0: @f = func"));
        pts.draw_points_to_sets_distribution(2);
        pts.peek_into_points_to_set(p, 1);
    });
}
