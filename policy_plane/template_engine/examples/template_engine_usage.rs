use serde_json::{json, Map};
use template_engine::{
    BuildContext, ComparisonOp, CompositionConfig, CompositionEntry, Condition, CustomValidationRef,
    CustomValidationRule, DeploymentOptions, DeploymentStrategy, EngineConfig, ExtensionState,
    ExtensionType, RuleSet, RuleSeverity, RulesPatch, Template, TemplateDraft, TemplateEngine,
    TemplateExtension,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Template Engine Usage ===\n");

    let engine = TemplateEngine::new(EngineConfig::default())?;

    // Example 1: Base template plus a team child
    println!("1. Registering templates...");
    engine.register_template(
        Template::builder()
            .id("secure-base")
            .name("Secure Base")
            .version("1.2.0")
            .deny(["eval(", "rm -rf /"])
            .ask(["git push --force"])
            .tag("baseline")
            .compliance("SOC2")
            .build()?,
    )?;
    let team = engine.inheritance().create_inherited_template(
        &"secure-base".into(),
        TemplateDraft::new("Frontend Team")
            .with_id("frontend")
            .with_rules(RuleSet {
                allow: vec!["console.log(".into(), "npm test".into()],
                ..RuleSet::default()
            }),
        ExtensionType::Extend,
    )?;
    println!(
        "   ✓ {} inherits {:?} (level {:?}, parent version {})",
        team.id,
        team.inheritance.chain,
        team.inheritance.level,
        team.inheritance.describe_bounds()
    );

    // Example 2: Custom validation rule executed in the sandbox
    println!("\n2. Registering a custom validation rule...");
    engine.validator().register_custom_rule(CustomValidationRule::new(
        "needs-deny",
        "At least one deny rule",
        RuleSeverity::Error,
        "return { isValid: context.template.rules.deny.length > 0, message: 'no deny rules' };",
    ));
    if let Some(current) = engine.inheritance().get_template(&"frontend".into()) {
        let mut updated = (*current).clone();
        updated.custom_validation.push(CustomValidationRef {
            rule_id: "needs-deny".into(),
            parameters: Map::new(),
        });
        engine.inheritance().update_template(updated, None)?;
    }
    println!("   ✓ Rule attached to frontend");

    // Example 3: Extension lifecycle
    println!("\n3. Walking an extension through its lifecycle...");
    let ext = TemplateExtension::new("block-inner-html", "Block innerHTML", "frontend")
        .with_rules(RulesPatch::new().deny(["innerHTML ="]))
        .with_priority(1)
        .with_author("appsec");
    let manager = engine.extensions();
    let id = manager.create_extension(ext, vec![], Some("appsec"))?.extension.id;
    manager.transition_extension_state(&id, ExtensionState::Testing, Some("ready for review".into()), None)?;
    manager.transition_extension_state(&id, ExtensionState::Approved, None, Some("security-lead"))?;
    let record = manager.deploy_extension(
        &id,
        DeploymentOptions::new(DeploymentStrategy::Canary {
            percentage: 25.0,
            observation_ms: 50,
        })
        .deployed_by("release-bot"),
    )?;
    println!(
        "   ✓ Deployment {} finished {:?} after {} stage(s)",
        record.id, record.status, record.stages_completed
    );

    // Example 4: Build for a context
    println!("\n4. Building the effective template...");
    let ctx = BuildContext::new("production").with_parameter("region", json!("eu"));
    let report = engine.build(&"frontend".into(), &ctx)?;
    println!("   deny:  {:?}", report.template.rules.deny);
    println!("   allow: {:?}", report.template.rules.allow);
    println!("   ask:   {:?}", report.template.rules.ask);
    println!("   applied extensions: {:?}", report.applied);

    // Example 5: Composition from config
    println!("\n5. Composing templates...");
    engine.register_template(
        Template::builder()
            .id("prod-hardening")
            .name("Production Hardening")
            .deny(["curl | sh"])
            .build()?,
    )?;
    let config = CompositionConfig::new("secure-base")
        .with_entry(CompositionEntry::new("frontend", 10))
        .with_entry(
            CompositionEntry::new("prod-hardening", 20)
                .with_conditions([Condition::environment(ComparisonOp::Eq, json!("production"))]),
        );
    let composed = engine.compose_from_config(&config, &ctx)?;
    println!(
        "   ✓ {} composed from {:?} with {} conflict(s)",
        composed.template.id,
        composed.template.inheritance.composed_from,
        composed.conflicts.len()
    );

    println!("\n=== Done ===");
    Ok(())
}
