mod common;

use common::TestEnv;
use std::fs;

use geoflow::eval::{DerivedDefinition, EvalOptions};
use geoflow::{EvalError, Evaluated};

const REGRID_1980: &str = "regrid(ds(variable='tas',period='1980'),grid='r90x45')";

#[test]
fn test_second_evaluation_runs_nothing() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    let first = env.eval(&mut cache, REGRID_1980).unwrap();
    assert_eq!(env.executor.labels(), vec!["select", "regrid"]);

    env.executor.clear();
    let second = env.eval(&mut cache, REGRID_1980).unwrap();
    assert!(env.executor.labels().is_empty());
    assert_eq!(first, second);

    let Evaluated::File(path) = second else {
        panic!("expected a single file");
    };
    assert!(path.starts_with(cache.root()));
    assert_eq!(cache.lookup_exact(&env.crs(REGRID_1980)), Some(path));
}

#[test]
fn test_equivalent_spellings_share_one_entry() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    env.eval(&mut cache, REGRID_1980).unwrap();
    env.executor.clear();

    // Explicit default, reordered facets and extra whitespace
    let respelled = "regrid( ds(period='1980', variable='tas'), grid='r90x45', method='bil' )";
    env.eval(&mut cache, respelled).unwrap();
    assert!(env.executor.labels().is_empty());
}

#[test]
fn test_superset_is_cut_with_select() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    env.eval(&mut cache, "regrid(ds(variable='tas',period='1979-1985'),grid='r90x45')")
        .unwrap();
    env.executor.clear();

    let result = env.eval(&mut cache, REGRID_1980).unwrap();
    assert_eq!(env.executor.labels(), vec!["select"]);

    let invocation = &env.executor.invocations()[0];
    let superset = cache
        .lookup_exact(&env.crs("regrid(ds(variable='tas',period='1979-1985'),grid='r90x45')"))
        .unwrap();
    assert_eq!(invocation.inputs, vec![superset]);
    assert_eq!(result.paths(), vec![cache.lookup_exact(&env.crs(REGRID_1980)).unwrap()]);
}

#[test]
fn test_non_timewise_operator_is_recomputed() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    env.eval(&mut cache, "mean(ds(variable='tas',period='1979-1985'))").unwrap();
    env.executor.clear();

    env.eval(&mut cache, "mean(ds(variable='tas',period='1980'))").unwrap();
    // select reuses its own superset, mean has to run again
    assert_eq!(env.executor.labels(), vec!["select", "mean"]);
}

#[test]
fn test_prefix_is_extended_and_concatenated() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    env.eval(&mut cache, REGRID_1980).unwrap();
    env.executor.clear();

    let longer = "regrid(ds(variable='tas',period='1980-1981'),grid='r90x45')";
    let result = env.eval(&mut cache, longer).unwrap();
    assert_eq!(env.executor.labels(), vec!["select", "regrid", "concat"]);

    let path = cache.lookup_exact(&env.crs(longer)).unwrap();
    assert_eq!(result, Evaluated::File(path.clone()));

    // Both halves are consumed by the concatenation
    assert_eq!(cache.lookup_exact(&env.crs(REGRID_1980)), None);
    assert_eq!(
        cache.lookup_exact(&env.crs("regrid(ds(variable='tas',period='1981'),grid='r90x45')")),
        None
    );

    let stamp = cache.read_stamp(&path).unwrap().unwrap();
    assert_eq!(stamp.crs, env.crs(longer));
}

#[test]
fn test_ensemble_is_broadcast() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    let result = env
        .eval(
            &mut cache,
            "regrid(ens('a':ds(model='A',variable='tas',period='1980'),'b':ds(model='B',variable='tas',period='1980')),grid='r90x45')",
        )
        .unwrap();

    assert_eq!(result.labels(), vec!["a", "b"]);
    let paths = result.paths();
    assert_eq!(paths.len(), 2);
    assert_ne!(paths[0], paths[1]);
    assert_eq!(
        env.executor.labels(),
        vec!["select", "regrid", "select", "regrid"]
    );
    assert_eq!(
        cache.lookup_exact(&env.crs(
            "regrid(ds(model='B',variable='tas',period='1980'),grid='r90x45')"
        )),
        Some(paths[1].clone())
    );
}

#[test]
fn test_ensemble_aware_operator_sees_all_members() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    let result = env
        .eval(
            &mut cache,
            "ensmean(ens('a':ds(model='A',variable='tas',period='1980'),'b':ds(model='B',variable='tas',period='1980')))",
        )
        .unwrap();

    assert!(matches!(result, Evaluated::File(_)));
    let invocations = env.executor.invocations();
    let ensmean = invocations.last().unwrap();
    assert_eq!(ensmean.label, "ensmean");
    assert_eq!(ensmean.inputs.len(), 2);
    assert!(ensmean.command.to_string().ends_with("# 'a' 'b'"));
}

#[test]
fn test_secondary_outputs_are_cached() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    env.eval(&mut cache, "plot(ds(variable='tas',period='1980'))").unwrap();
    assert_eq!(env.executor.labels(), vec!["select", "plot"]);
    assert_eq!(env.executor.invocations()[1].outputs.len(), 2);
    env.executor.clear();

    let legend = env
        .eval(&mut cache, "plot.legend(ds(variable='tas',period='1980'))")
        .unwrap();
    assert!(env.executor.labels().is_empty());
    let Evaluated::File(path) = legend else {
        panic!("expected a single file");
    };
    assert_eq!(path.extension().unwrap(), "png");
}

#[test]
fn test_derived_variable_is_expanded() {
    let env = TestEnv::new().with_derived(vec![DerivedDefinition {
        variable: "anomaly".to_string(),
        operator: "minus".to_string(),
        inputs: vec!["tas".to_string(), "pr".to_string()],
        params: Default::default(),
    }]);
    let mut cache = env.open_cache();

    env.eval(&mut cache, "regrid(ds(variable='anomaly',period='1980'),grid='r90x45')")
        .unwrap();
    assert_eq!(
        env.executor.labels(),
        vec!["select", "select", "minus", "regrid"]
    );
    assert!(cache
        .lookup_exact(&env.crs(
            "minus(ds(variable='tas',period='1980'),ds(variable='pr',period='1980'))"
        ))
        .is_some());
}

#[test]
fn test_derivation_cycle_is_reported() {
    let env = TestEnv::new().with_derived(vec![
        DerivedDefinition {
            variable: "x".to_string(),
            operator: "mean".to_string(),
            inputs: vec!["y".to_string()],
            params: Default::default(),
        },
        DerivedDefinition {
            variable: "y".to_string(),
            operator: "mean".to_string(),
            inputs: vec!["x".to_string()],
            params: Default::default(),
        },
    ]);
    let mut cache = env.open_cache();

    let err = env
        .eval(&mut cache, "mean(ds(variable='x',period='1980'))")
        .unwrap_err();
    match err {
        EvalError::DerivationCycle { chain } => assert_eq!(chain, vec!["x", "y", "x"]),
        other => panic!("unexpected error: {}", other),
    }
    assert!(env.executor.labels().is_empty());
}

#[test]
fn test_deleted_artifact_is_recomputed() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    let path = env.eval(&mut cache, REGRID_1980).unwrap().paths().remove(0);
    fs::remove_file(&path).unwrap();
    env.executor.clear();

    env.eval(&mut cache, REGRID_1980).unwrap();
    assert_eq!(env.executor.labels(), vec!["regrid"]);
    assert!(path.exists());
}

#[test]
fn test_no_cache_recomputes_everything() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    env.eval(&mut cache, REGRID_1980).unwrap();
    env.executor.clear();

    env.eval_with(&mut cache, REGRID_1980, EvalOptions { use_cache: false })
        .unwrap();
    assert_eq!(env.executor.labels(), vec!["select", "regrid"]);
    assert!(cache.lookup_exact(&env.crs(REGRID_1980)).is_some());
}

#[test]
fn test_index_rebuilds_from_stamps() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();
    let path = env.eval(&mut cache, REGRID_1980).unwrap().paths().remove(0);
    cache.close().unwrap();

    fs::remove_file(env.cache_dir.join(geoflow::cache::INDEX_FILE)).unwrap();
    let mut reopened = env.open_cache();
    assert!(reopened.is_empty());

    assert_eq!(reopened.rebuild().unwrap(), 2);
    assert_eq!(reopened.lookup_exact(&env.crs(REGRID_1980)), Some(path));
}

#[test]
fn test_missing_data_is_reported() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    let err = env
        .eval(&mut cache, "regrid(ds(variable='zg',period='1980'),grid='r90x45')")
        .unwrap_err();
    assert!(matches!(err, EvalError::NoData { .. }));
    assert!(err.to_string().contains("variable='zg'"));
}

#[test]
fn test_failed_command_leaves_no_entry() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();
    env.executor.fail_on("regrid");

    let err = env.eval(&mut cache, REGRID_1980).unwrap_err();
    match err {
        EvalError::ExternalExecution {
            exit_code, stderr, ..
        } => {
            assert_eq!(exit_code, 1);
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(cache.lookup_exact(&env.crs(REGRID_1980)), None);
    // The operand was computed before the failure and stays cached
    assert!(cache
        .lookup_exact(&env.crs("select(ds(variable='tas',period='1980'))"))
        .is_some());
}

#[test]
fn test_regional_domain_needs_domain_slot() {
    let env = TestEnv::new();
    let mut cache = env.open_cache();

    let err = env
        .eval(
            &mut cache,
            "regrid(ds(domain='europe',variable='tas',period='1980'),grid='r90x45')",
        )
        .unwrap_err();
    assert!(matches!(err, EvalError::UnsupportedDomain { ref domain, .. } if domain == "europe"));
}
