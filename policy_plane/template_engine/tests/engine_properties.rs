use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use template_engine::{
    BuildContext, Composer, CompositionError, ConflictResolution, ConflictStrategy, DeploymentOptions,
    DeploymentStrategy, EngineConfig, ExtensionId, ExtensionState, ExtensionType, InheritanceEngine,
    InheritanceError, InheritanceLevel, LifecycleError, MergeStrategy, RuleSet, RulesPatch, Template,
    TemplateDraft, TemplateEngine, TemplateExtension, TemplateId, TemplateStore, Validator,
};
use template_sandbox::{Isolator, Sandbox, SandboxErrorKind, SandboxLimits};

fn engine() -> TemplateEngine {
    TemplateEngine::new(EngineConfig::default()).unwrap()
}

fn promote(engine: &TemplateEngine, id: &str) {
    let id = ExtensionId::new(id);
    let manager = engine.extensions();
    manager
        .transition_extension_state(&id, ExtensionState::Testing, Some("ready".into()), None)
        .unwrap();
    manager
        .transition_extension_state(&id, ExtensionState::Approved, None, Some("security-lead"))
        .unwrap();
    manager
        .deploy_extension(&id, DeploymentOptions::new(DeploymentStrategy::Immediate).deployed_by("ops"))
        .unwrap();
}

#[test]
fn test_end_to_end_inherit_extend_apply() {
    let engine = engine();
    engine
        .register_template(Template::builder().id("base").name("Base").deny(["eval("]).build().unwrap())
        .unwrap();
    engine
        .inheritance()
        .create_inherited_template(
            &"base".into(),
            TemplateDraft::new("Team").with_id("team").with_rules(RuleSet {
                allow: vec!["console.log(".into()],
                ..RuleSet::default()
            }),
            ExtensionType::Extend,
        )
        .unwrap();

    let ext = TemplateExtension::new("no-inner-html", "Block innerHTML", "team")
        .with_rules(RulesPatch::new().deny(["innerHTML ="]))
        .with_priority(1);
    engine.extensions().create_extension(ext, vec![], Some("dev")).unwrap();
    promote(&engine, "no-inner-html");

    let report = engine.build(&"team".into(), &BuildContext::default()).unwrap();
    assert_eq!(report.applied, vec![ExtensionId::new("no-inner-html")]);
    assert_eq!(report.template.rules.deny, vec!["eval(", "innerHTML ="]);
    assert_eq!(report.template.rules.allow, vec!["console.log("]);
}

#[test]
fn test_resolution_is_idempotent_and_matches_cold_run() {
    let cached = engine();
    let cold = TemplateEngine::new(EngineConfig::default().without_caches()).unwrap();
    for engine in [&cached, &cold] {
        engine
            .register_template(
                Template::builder()
                    .id("base")
                    .name("Base")
                    .deny(["eval(", "rm -rf"])
                    .tag("security")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        engine
            .inheritance()
            .create_inherited_template(
                &"base".into(),
                TemplateDraft::new("Child").with_id("child"),
                ExtensionType::Inherit,
            )
            .unwrap();
    }
    let ctx = BuildContext::new("production").with_parameter("strict", json!(true));

    let first = cached.inheritance().resolve_template(&"child".into(), &ctx).unwrap();
    let second = cached.inheritance().resolve_template(&"child".into(), &ctx).unwrap();
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
    assert_eq!(cached.inheritance().cache_stats().hits, 1);

    let uncached = cold.inheritance().resolve_template(&"child".into(), &ctx).unwrap();
    assert_eq!(first.rules, uncached.rules);
    assert_eq!(first.inheritance.chain, uncached.inheritance.chain);
    assert_eq!(first.metadata.tags, uncached.metadata.tags);
}

#[test]
fn test_parent_cycles_fail_resolution_and_composition() {
    let store = Arc::new(TemplateStore::new());
    let validator = Arc::new(Validator::default().with_store(store.clone()));
    let inheritance = InheritanceEngine::new(store.clone(), validator);

    let a = Template::builder().id("a").name("A").parent("b").deny(["x"]).build().unwrap();
    let b = Template::builder().id("b").name("B").parent("a").deny(["y"]).build().unwrap();
    store.put(a.clone());
    store.put(b.clone());

    assert!(matches!(
        inheritance.resolve_template(&"a".into(), &BuildContext::default()),
        Err(InheritanceError::CircularInheritance { .. })
    ));
    assert!(matches!(
        Composer::new().compose(&[a, b]),
        Err(CompositionError::CircularReference { .. })
    ));
}

#[test]
fn test_unique_merge_is_order_independent() {
    let make = |id: &str, level: InheritanceLevel, tags: &[&str]| {
        let mut builder = Template::builder().id(id).name(id).level(level);
        for tag in tags {
            builder = builder.tag(*tag);
        }
        builder.build().unwrap()
    };
    let templates = vec![
        make("base", InheritanceLevel::Base, &["pci", "soc2"]),
        make("org", InheritanceLevel::Organization, &["hipaa", "pci"]),
        make("team", InheritanceLevel::Team, &["soc2", "gdpr"]),
    ];
    let composer = Composer::new();
    let expected = vec!["pci", "soc2", "hipaa", "gdpr"];

    let orders: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    for order in orders {
        let input: Vec<Template> = order.iter().map(|i| templates[*i].clone()).collect();
        let result = composer.compose(&input).unwrap();
        assert_eq!(result.template.metadata.tags, expected);
    }
}

#[test]
fn test_conflict_accounting() {
    let composer = Composer::new();
    let strict = ConflictResolution::new(ConflictStrategy::Error);
    match composer.merge_values_with(&json!({"x": 1}), &json!({"x": 2}), &MergeStrategy::default(), &strict) {
        Err(CompositionError::Conflicts { conflicts }) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].path, "x");
        }
        other => panic!("expected conflicts, got {:?}", other),
    }

    let overriding = ConflictResolution::new(ConflictStrategy::Override);
    let (merged, conflicts) = composer
        .merge_values_with(&json!({"x": 1}), &json!({"x": 2}), &MergeStrategy::default(), &overriding)
        .unwrap();
    assert_eq!(merged, json!({"x": 2}));
    assert_eq!(conflicts.len(), 1);
}

#[test]
fn test_extension_priority_order() {
    let engine = engine();
    engine
        .register_template(Template::builder().id("base").name("Base").deny(["eval("]).build().unwrap())
        .unwrap();
    for priority in [10, 5, 20] {
        let id = format!("marker-{}", priority);
        let ext = TemplateExtension::new(id.as_str(), id.as_str(), "base")
            .with_rules(RulesPatch::new().ask([format!("m{}", priority)]))
            .with_priority(priority);
        engine.extensions().create_extension(ext, vec![], None).unwrap();
        promote(&engine, &id);
    }

    let report = engine.build(&"base".into(), &BuildContext::default()).unwrap();
    assert_eq!(report.template.rules.ask, vec!["m5", "m10", "m20"]);
}

#[test]
fn test_lifecycle_legality() {
    let engine = engine();
    engine
        .register_template(Template::builder().id("base").name("Base").deny(["eval("]).build().unwrap())
        .unwrap();
    let ext = TemplateExtension::new("e", "E", "base").with_rules(RulesPatch::new().deny(["exec("]));
    engine.extensions().create_extension(ext, vec![], None).unwrap();
    promote(&engine, "e");

    let id = ExtensionId::new("e");
    let manager = engine.extensions();
    assert!(matches!(
        manager.transition_extension_state(&id, ExtensionState::Testing, None, None),
        Err(LifecycleError::InvalidTransition { .. })
    ));
    manager
        .transition_extension_state(&id, ExtensionState::Deprecated, None, None)
        .unwrap();
    manager
        .transition_extension_state(&id, ExtensionState::Archived, None, None)
        .unwrap();
    for target in [
        ExtensionState::Draft,
        ExtensionState::Testing,
        ExtensionState::Approved,
        ExtensionState::Deployed,
        ExtensionState::Deprecated,
    ] {
        assert!(manager.transition_extension_state(&id, target, None, Some("admin")).is_err());
    }
    assert_eq!(manager.get_extension(&id).unwrap().state, ExtensionState::Archived);
}

#[test]
fn test_sandbox_containment() {
    let sandbox = Sandbox::with_limits(SandboxLimits::new(300, 16).with_max_steps(u64::MAX));
    let home_before = std::env::var("HOME").ok();

    for code in [
        "return process.env.HOME;",
        "let fs = require('fs'); return fs.readFileSync('/etc/passwd');",
    ] {
        let result = sandbox.execute(code, &json!({}));
        assert!(!result.success);
        let kind = result.error_kind();
        assert!(matches!(kind, Some(SandboxErrorKind::Security) | Some(SandboxErrorKind::Runtime)));
    }
    assert_eq!(std::env::var("HOME").ok(), home_before);

    let started = Instant::now();
    let result = sandbox.execute("while (true) { }", &json!({}));
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_millis(300) + Duration::from_millis(700));
}

#[test]
fn test_reparenting_invalidates_cached_resolution() {
    let engine = engine();
    for (id, rule) in [("a", "from-a"), ("b", "from-b")] {
        engine
            .register_template(Template::builder().id(id).name(id).deny([rule]).build().unwrap())
            .unwrap();
    }
    engine
        .inheritance()
        .create_inherited_template(&"a".into(), TemplateDraft::new("Leaf").with_id("leaf"), ExtensionType::Inherit)
        .unwrap();
    let ctx = BuildContext::default();
    let leaf = TemplateId::new("leaf");

    assert_eq!(engine.inheritance().resolve_template(&leaf, &ctx).unwrap().rules.deny, vec!["from-a"]);
    engine
        .inheritance()
        .update_inheritance(&leaf, Some("b".into()), ExtensionType::Inherit, None)
        .unwrap();
    assert_eq!(engine.inheritance().resolve_template(&leaf, &ctx).unwrap().rules.deny, vec!["from-b"]);
}
