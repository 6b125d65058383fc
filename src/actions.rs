//! Built-in action catalog for the dev REPL
//!
//! A small guided-analysis flow over a bundled facility dataset. The
//! analysis step runs as a sandboxed snippet; a challenger variant is
//! registered so comparison mode has two implementations to race.

use parley_core::{
    ActionHandler, ActionOutcome, ActionSpec, ArgValue, Conversation, Error, ParamSpec,
    ResolvedArguments, Result, WorkflowStage,
};
use parley_sandbox::{ExecutionJob, SandboxExecutor};
use std::sync::Arc;
use std::time::Duration;

/// Demo rows the snippet actions analyze.
fn demo_rows() -> serde_json::Value {
    serde_json::json!([
        {"name": "Mji Health Post", "tier": "primary", "band": "under_five", "visits": 620},
        {"name": "Kivu Clinic", "tier": "primary", "band": "five_to_fourteen", "visits": 410},
        {"name": "Lakeside Clinic", "tier": "primary", "band": "fifteen_plus", "visits": 530},
        {"name": "Central District Hospital", "tier": "secondary", "band": "under_five", "visits": 980},
        {"name": "North District Hospital", "tier": "secondary", "band": "fifteen_plus", "visits": 1150},
        {"name": "St. Anne Referral", "tier": "tertiary", "band": "under_five", "visits": 1420},
        {"name": "Teaching Hospital", "tier": "tertiary", "band": "fifteen_plus", "visits": 2300},
        {"name": "Westside Clinic", "tier": "primary", "band": "under_five", "visits": 350},
    ])
}

struct TextHandler {
    spec: ActionSpec,
    render: fn(&ResolvedArguments) -> ActionOutcome,
}

#[async_trait::async_trait]
impl ActionHandler for TextHandler {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    async fn execute(
        &self,
        args: &ResolvedArguments,
        _conversation: &Conversation,
    ) -> Result<ActionOutcome> {
        Ok((self.render)(args))
    }
}

/// Runs an analysis snippet in the sandbox with the conversation's
/// collected inputs bound as parameters.
struct SnippetHandler {
    spec: ActionSpec,
    sandbox: Arc<SandboxExecutor>,
    source: &'static str,
    timeout: Duration,
    summarize: fn(&serde_json::Value) -> String,
}

#[async_trait::async_trait]
impl ActionHandler for SnippetHandler {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    async fn execute(
        &self,
        _args: &ResolvedArguments,
        conversation: &Conversation,
    ) -> Result<ActionOutcome> {
        let tier = conversation
            .context_value("tier")
            .and_then(|v| v.as_str())
            .unwrap_or("all")
            .to_string();
        let band = conversation
            .context_value("band")
            .and_then(|v| v.as_str())
            .unwrap_or("all_ages")
            .to_string();

        let job = ExecutionJob::new(self.source)
            .with_binding("rows", demo_rows())
            .with_binding("tier", serde_json::json!(tier))
            .with_binding("band", serde_json::json!(band))
            .with_timeout(self.timeout);

        let output = self.sandbox.run(&job).await.map_err(Error::from)?;
        let handle = format!("analysis:{}", job.id);

        Ok(ActionOutcome::message((self.summarize)(&output.value))
            .with_result_handle(&handle)
            .with_context("last_result", serde_json::json!(handle)))
    }
}

const COUNT_SNIPPET: &str = r#"
rows = params["rows"]
tier = params["tier"]
band = params["band"]
selected = [r for r in rows
            if (tier == "all" or r["tier"] == tier)
            and (band == "all_ages" or r["band"] == band)]
total = sum(coerce_num(r["visits"], 0) for r in selected)
leaders = [r["name"] for r in top_n(selected, "visits", 3)]
result = {"facilities": len(selected), "total_visits": total, "leaders": leaders}
"#;

const MEAN_SNIPPET: &str = r#"
rows = params["rows"]
tier = params["tier"]
band = params["band"]
selected = [r for r in rows
            if (tier == "all" or r["tier"] == tier)
            and (band == "all_ages" or r["band"] == band)]
visits = [coerce_num(r["visits"], 0) for r in selected]
mean = round(sum(visits) / len(visits), 1) if visits else 0
busiest = max(selected, key=lambda r: coerce_num(r["visits"], 0))["name"] if selected else None
result = {"facilities": len(selected), "mean_visits": mean, "busiest": busiest}
"#;

fn summarize_counts(value: &serde_json::Value) -> String {
    let facilities = value.get("facilities").and_then(|v| v.as_u64()).unwrap_or(0);
    let total = value.get("total_visits").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let leaders = value
        .get("leaders")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    format!(
        "{} facilities matched with {} total visits. Top facilities: {}.",
        facilities, total, leaders
    )
}

fn summarize_means(value: &serde_json::Value) -> String {
    let facilities = value.get("facilities").and_then(|v| v.as_u64()).unwrap_or(0);
    let mean = value.get("mean_visits").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let busiest = value
        .get("busiest")
        .and_then(|v| v.as_str())
        .unwrap_or("n/a");
    format!(
        "{} facilities matched, averaging {} visits. Busiest: {}.",
        facilities, mean, busiest
    )
}

/// Build the dev catalog over a sandbox executor.
pub fn build_catalog(
    sandbox: Arc<SandboxExecutor>,
    execution_timeout: Duration,
) -> parley_core::ActionCatalog {
    let mut catalog = parley_core::ActionCatalog::new();

    catalog.register(Arc::new(TextHandler {
        spec: ActionSpec::new("start_guided_analysis", "Begin the guided facility analysis")
            .with_keywords(&["start", "begin", "guided", "analysis", "analyse", "analyze"])
            .gated_to(&[WorkflowStage::Idle])
            .advances_to(WorkflowStage::AwaitingFacilityChoice),
        render: |_| {
            ActionOutcome::message(
                "Let's set up your analysis. Which facility tier should we include \
                 (primary, secondary, tertiary, or all)?",
            )
        },
    }));

    catalog.register(Arc::new(TextHandler {
        spec: ActionSpec::new("choose_facility_tier", "Record the facility tier to analyze")
            .with_keywords(&["facility", "tier", "hospitals", "clinics", "level"])
            .with_param(
                ParamSpec::choice(
                    "tier",
                    "facility tier",
                    &["primary", "secondary", "tertiary", "all"],
                )
                .with_alias("health posts", "primary")
                .with_alias("district hospitals", "secondary")
                .with_alias("referral", "tertiary")
                .with_alias("everything", "all"),
            )
            .gated_to(&[WorkflowStage::AwaitingFacilityChoice])
            .advances_to(WorkflowStage::AwaitingAgeGroup),
        render: |args| {
            let tier = choice_text(args, "tier");
            ActionOutcome::message(format!(
                "Facility tier set to {}. Which age group should we look at \
                 (under five, five to fourteen, fifteen plus, or all ages)?",
                tier
            ))
        },
    }));

    catalog.register(Arc::new(TextHandler {
        spec: ActionSpec::new("choose_age_group", "Record the age group to analyze")
            .with_keywords(&["age", "group", "band", "ages"])
            .with_param(
                ParamSpec::choice(
                    "band",
                    "age group",
                    &["under_five", "five_to_fourteen", "fifteen_plus", "all_ages"],
                )
                .with_alias("under five", "under_five")
                .with_alias("children", "under_five")
                .with_alias("kids", "under_five")
                .with_alias("five to fourteen", "five_to_fourteen")
                .with_alias("school age", "five_to_fourteen")
                .with_alias("fifteen plus", "fifteen_plus")
                .with_alias("adults", "fifteen_plus")
                .with_alias("all ages", "all_ages")
                .with_alias("everyone", "all_ages"),
            )
            .gated_to(&[WorkflowStage::AwaitingAgeGroup])
            .advances_to(WorkflowStage::ReadyForCompute),
        render: |args| {
            let band = choice_text(args, "band");
            ActionOutcome::message(format!(
                "Age group set to {}. Say \"run the analysis\" when you're ready.",
                band.replace('_', " ")
            ))
        },
    }));

    catalog.register(Arc::new(SnippetHandler {
        spec: ActionSpec::new("run_analysis", "Run the visit analysis for the collected inputs")
            .with_keywords(&["run", "compute", "calculate", "execute", "analyse", "analyze"])
            .gated_to(&[WorkflowStage::ReadyForCompute])
            .advances_to(WorkflowStage::Completed)
            .as_comparison(),
        sandbox: Arc::clone(&sandbox),
        source: COUNT_SNIPPET,
        timeout: execution_timeout,
        summarize: summarize_counts,
    }));
    catalog.register_challenger(
        "run_analysis",
        Arc::new(SnippetHandler {
            spec: ActionSpec::new("run_analysis", "Run the visit analysis (averages variant)"),
            sandbox,
            source: MEAN_SNIPPET,
            timeout: execution_timeout,
            summarize: summarize_means,
        }),
    );

    catalog.register(Arc::new(TextHandler {
        spec: ActionSpec::new("show_summary", "Describe the loaded dataset")
            .with_keywords(&["summary", "summarize", "overview", "describe", "data"]),
        render: |_| {
            ActionOutcome::message(
                "The demo dataset covers 8 facilities across primary, secondary, and \
                 tertiary tiers, with visit counts broken down by age band. Start a \
                 guided analysis to slice it.",
            )
        },
    }));

    catalog.register(Arc::new(TextHandler {
        spec: ActionSpec::new("cancel_workflow", "Cancel the in-progress analysis")
            .with_keywords(&["cancel", "stop", "abort", "restart", "nevermind"])
            .gated_to(&[
                WorkflowStage::AwaitingFacilityChoice,
                WorkflowStage::AwaitingAgeGroup,
                WorkflowStage::ReadyForCompute,
            ])
            .advances_to(WorkflowStage::Idle),
        render: |_| {
            ActionOutcome::message(
                "Okay, cancelled. Say \"start a guided analysis\" to begin again.",
            )
            .with_context_cleared()
        },
    }));

    catalog
}

fn choice_text(args: &ResolvedArguments, name: &str) -> String {
    match args.value(name) {
        Some(ArgValue::Choice(s)) | Some(ArgValue::Text(s)) => s.clone(),
        Some(ArgValue::Number(n)) => n.to_string(),
        None => "all".to_string(),
    }
}
