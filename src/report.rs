use anyhow::Result;
use serde_json::json;
use serde_sarif::sarif::{
    Artifact, ArtifactLocation, ArtifactRoles, Invocation, Location, LogicalLocation, Message,
    PhysicalLocation, ReportingDescriptor, Result as SarifResult, ResultLevel, Run, Sarif, Tool,
    ToolComponent, SCHEMA_URL,
};

use crate::engine::HookRecord;

pub(crate) const TOOL_NAME: &str = "classhook";

/// What happened to one unit, as reported.
#[derive(Clone, Debug)]
pub(crate) struct UnitOutcome {
    pub(crate) origin: String,
    pub(crate) length: u64,
    pub(crate) hooks: Vec<HookRecord>,
}

impl UnitOutcome {
    pub(crate) fn changed(&self) -> bool {
        !self.hooks.is_empty()
    }
}

pub(crate) fn build_invocation() -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");

    Invocation::builder()
        .execution_successful(true)
        .arguments(arguments)
        .command_line(command_line)
        .build()
}

/// SARIF log with one rule per pass and one result per applied hook point.
pub(crate) fn build_sarif(
    passes: &[&'static str],
    outcomes: &[UnitOutcome],
    invocation: Invocation,
) -> Result<Sarif> {
    let rules: Vec<ReportingDescriptor> = passes
        .iter()
        .map(|pass| {
            ReportingDescriptor::builder()
                .id(*pass)
                .short_description(&rule_description(pass).to_string())
                .build()
        })
        .collect();
    let driver = ToolComponent::builder()
        .name(TOOL_NAME)
        .rules(rules)
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };

    let mut artifacts = Vec::with_capacity(outcomes.len());
    let mut results = Vec::new();
    for (index, outcome) in outcomes.iter().enumerate() {
        artifacts.push(artifact(outcome)?);
        for hook in &outcome.hooks {
            results.push(
                SarifResult::builder()
                    .rule_id(hook.pass)
                    .level(ResultLevel::Note)
                    .message(result_message(format!(
                        "{} instrumented: {}",
                        hook.pass, hook.reason
                    )))
                    .locations(vec![method_location(&outcome.origin, index as i64, hook)])
                    .build(),
            );
        }
    }

    let run = Run::builder()
        .tool(tool)
        .invocations(vec![invocation])
        .results(results)
        .artifacts(artifacts)
        .build();

    Ok(Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build())
}

fn rule_description(pass: &str) -> &'static str {
    match pass {
        crate::passes::click_guard::NAME => "Debounce guard inserted at the start of a click handler",
        crate::passes::privacy_sentry::NAME => "Audit capture inserted before a sensitive access",
        crate::passes::thread_rename::NAME => "Thread or pool creation routed through a naming factory",
        _ => "Instrumentation pass",
    }
}

fn artifact(outcome: &UnitOutcome) -> Result<Artifact> {
    let role = if outcome.changed() {
        ArtifactRoles::Modified
    } else {
        ArtifactRoles::Unmodified
    };
    Ok(Artifact::builder()
        .location(ArtifactLocation::builder().uri(outcome.origin.clone()).build())
        .length(outcome.length as i64)
        .roles(vec![serde_json::to_value(role)?])
        .build())
}

fn method_location(origin: &str, artifact_index: i64, hook: &HookRecord) -> Location {
    let logical = LogicalLocation::builder()
        .name(format!("{}.{}{}", hook.class, hook.method, hook.descriptor))
        .kind("function")
        .build();
    let physical = PhysicalLocation::builder()
        .artifact_location(
            ArtifactLocation::builder()
                .uri(origin)
                .index(artifact_index)
                .build(),
        )
        .build();
    Location::builder()
        .physical_location(physical)
        .logical_locations(vec![logical])
        .build()
}

fn result_message(text: impl Into<String>) -> Message {
    Message::builder().text(text.into()).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HookReason;
    use crate::passes::{click_guard, thread_rename};

    fn invocation() -> Invocation {
        Invocation::builder()
            .execution_successful(true)
            .arguments(Vec::<String>::new())
            .build()
    }

    #[test]
    fn sarif_without_units_has_rules_and_no_results() {
        let sarif = build_sarif(&[click_guard::NAME], &[], invocation()).expect("sarif");
        let value = serde_json::to_value(&sarif).expect("serialize SARIF");

        assert_eq!(value["version"], "2.1.0");
        assert_eq!(value["$schema"], SCHEMA_URL);
        assert_eq!(value["runs"][0]["tool"]["driver"]["name"], TOOL_NAME);
        assert_eq!(value["runs"][0]["tool"]["driver"]["rules"][0]["id"], "click_guard");
        assert!(value["runs"][0]["results"]
            .as_array()
            .expect("results array")
            .is_empty());
        assert_eq!(value["runs"][0]["invocations"][0]["executionSuccessful"], true);
    }

    #[test]
    fn each_hook_becomes_a_result_at_its_method() {
        let outcomes = vec![
            UnitOutcome {
                origin: "build/classes/a/Plain.class".to_string(),
                length: 10,
                hooks: Vec::new(),
            },
            UnitOutcome {
                origin: "jar:app.jar!/a/Worker.class".to_string(),
                length: 20,
                hooks: vec![HookRecord {
                    pass: thread_rename::NAME,
                    class: "a/Worker".to_string(),
                    method: "start".to_string(),
                    descriptor: "()V".to_string(),
                    reason: HookReason::FactoryCall(
                        "java/util/concurrent/Executors.newFixedThreadPool".to_string(),
                    ),
                }],
            },
        ];

        let sarif = build_sarif(&[thread_rename::NAME], &outcomes, invocation()).expect("sarif");
        let value = serde_json::to_value(&sarif).expect("serialize SARIF");

        let run = &value["runs"][0];
        assert_eq!(run["artifacts"][0]["roles"][0], "unmodified");
        assert_eq!(run["artifacts"][1]["roles"][0], "modified");
        let result = &run["results"][0];
        assert_eq!(result["ruleId"], "thread_rename");
        assert_eq!(result["level"], "note");
        assert_eq!(
            result["locations"][0]["logicalLocations"][0]["name"],
            "a/Worker.start()V"
        );
        assert_eq!(result["locations"][0]["physicalLocation"]["artifactLocation"]["index"], 1);
        assert!(result["message"]["text"]
            .as_str()
            .expect("message")
            .contains("newFixedThreadPool"));
    }
}
