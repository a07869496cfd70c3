//! End-to-end scenarios exercising the full parse → register → evaluate
//! pipeline. The VM-level scenarios (round-trip compile, argument
//! arithmetic, branch selection, role denial) live as inline tests in
//! `src/vm.rs`; the two scenarios below need the registration and migration
//! layers as well, so they live here instead.

use std::sync::Arc;

use corevm::compiler_context::{CompilerContext, CompilerOptions};
use corevm::migration::MigrationRegistry;
use corevm::parser::parse_module;
use corevm::security::policy::{Decision, PolicyEvaluator};
use corevm::value::Value;
use corevm::version::Version;
use corevm::version_registry::{VersionEntry, VersionRegistry};

#[test]
fn deny_precedence_policy_scenario() {
    let source = r#"
        (mod m
            (role user :permissions [data.access])
            (fn access_data :v1 :permissions [data.access] :inputs [] :outputs [] (body 1))
            (policy access_policy
                (rule :effect allow :roles [user] :permissions [data.access] :versions all_versions)
                (rule :effect deny :roles [user] :permissions [data.access] :versions all_versions)))
    "#;

    let module = parse_module(source).unwrap();
    let mut ctx = CompilerContext::new(CompilerOptions::default());
    ctx.register_module(&module);

    let policies: Vec<_> = module.policies().cloned().collect();
    let evaluator = PolicyEvaluator::new(&policies, &ctx.security);
    let function = module.functions().find(|f| f.name == "access_data").unwrap();

    let decision = evaluator.evaluate("user", function, Some(&function.version.version));
    assert_eq!(decision.decision, Decision::Deny);
}

#[test]
fn migration_path_scenario() {
    let mut chain: VersionRegistry<()> = VersionRegistry::new();
    let v1 = Version::new(1, 0, 0);
    let v2 = Version::new(2, 0, 0);
    let v3 = Version::new(3, 0, 0);

    chain.chain_mut("calc").insert(VersionEntry {
        version: v1.clone(),
        replaces: None,
        deprecated: false,
        item: (),
    });
    chain.chain_mut("calc").insert(VersionEntry {
        version: v2.clone(),
        replaces: Some(v1.clone()),
        deprecated: false,
        item: (),
    });
    chain.chain_mut("calc").insert(VersionEntry {
        version: v3.clone(),
        replaces: Some(v2.clone()),
        deprecated: false,
        item: (),
    });

    let mut migrations = MigrationRegistry::new();
    migrations.register(
        "calc",
        v1.clone(),
        v2.clone(),
        Arc::new(|v: &Value| match v {
            Value::Int(n) => Ok(Value::Int(n + 1)),
            other => Err(format!("unexpected {:?}", other)),
        }),
    );
    migrations.register(
        "calc",
        v2.clone(),
        v3.clone(),
        Arc::new(|v: &Value| match v {
            Value::Int(n) => Ok(Value::Int(n * 10)),
            other => Err(format!("unexpected {:?}", other)),
        }),
    );

    let calc_chain = chain.chain("calc").unwrap();
    let path = migrations.build_path("calc", calc_chain, &v1, &v3).unwrap();
    assert_eq!(path.len(), 2);

    let result = migrations.migrate("calc", calc_chain, &v1, &v3, &Value::Int(4)).unwrap();
    assert_eq!(result, Value::Int(50));

    // Remove coverage for v2 -> v3 and confirm the path now comes up short.
    let mut migrations = MigrationRegistry::new();
    migrations.register(
        "calc",
        v1.clone(),
        v2.clone(),
        Arc::new(|v: &Value| match v {
            Value::Int(n) => Ok(Value::Int(n + 1)),
            other => Err(format!("unexpected {:?}", other)),
        }),
    );
    let err = migrations.build_path("calc", calc_chain, &v1, &v3).unwrap_err();
    assert!(matches!(err, corevm::migration::MigrationError::MissingStep { .. }));
}
