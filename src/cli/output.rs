//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::graph::ResourceGraph;
use crate::planner::{ApplyReport, Operation, OperationKind, Plan, ResourceStatus};
use crate::state::StackState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Message")]
    message: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Level")]
    level: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

/// State resource row for table display.
#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a change plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&PlanJson::from(plan)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();

        let title = if plan.destroy { "Destroy Plan" } else { "Change Plan" };
        let _ = writeln!(output, "\n{title}");
        if !plan.config_hash.is_empty() {
            let _ = write!(
                output,
                "   Config hash: {}\n\n",
                Self::short_hash(&plan.config_hash)
            );
        }

        let rows: Vec<OperationRow> = plan
            .operations
            .iter()
            .enumerate()
            .map(|(i, op)| OperationRow {
                index: i,
                action: Self::format_operation_kind(op.kind),
                resource: op.resource.clone(),
                kind: op.resource_kind.clone(),
                after: op
                    .depends_on
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                reason: Self::truncate(&op.reason, 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            let changed: Vec<&Operation> = plan
                .operations
                .iter()
                .filter(|op| !op.details.is_empty())
                .collect();
            if !changed.is_empty() {
                output.push_str("\nProperty changes:\n");
            }
            for op in changed {
                let _ = writeln!(output, "   {} ({}):", op.resource, op.kind);
                for detail in &op.details {
                    let marker = if detail.forces_replace {
                        format!(" {}", "# forces replacement".red())
                    } else {
                        String::new()
                    };
                    let _ = writeln!(
                        output,
                        "     {}: {} -> {}{marker}",
                        detail.field,
                        detail.old_value.as_deref().unwrap_or("(none)"),
                        detail.new_value.as_deref().unwrap_or("(none)"),
                    );
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.count(OperationKind::Create).to_string().green(),
            plan.count(OperationKind::Update).to_string().yellow(),
            plan.count(OperationKind::Replace).to_string().magenta(),
            plan.count(OperationKind::Delete).to_string().red()
        );

        if !plan.passes_guardrails {
            let _ = write!(output, "\n{} Guardrail violations:\n", "⚠".yellow());
            for violation in &plan.guardrail_violations {
                let _ = writeln!(output, "   - {violation}");
            }
        }

        output
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if report.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else if report.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply finished with errors", "✗".red())
                };

                let mut output = format!("\n{status}\n\n");

                let rows: Vec<OutcomeRow> = report
                    .resources
                    .iter()
                    .filter(|(_, o)| o.status != ResourceStatus::Unchanged)
                    .map(|(name, o)| OutcomeRow {
                        resource: name.clone(),
                        status: Self::format_status(o.status),
                        attempts: o.attempts,
                        message: Self::truncate(o.message.as_deref().unwrap_or(""), 60),
                    })
                    .collect();

                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let _ = writeln!(output, "\nResources: {}", report.summary());

                if !report.exports.is_empty() {
                    output.push('\n');
                    output.push_str(&Self::format_exports_text(&report.exports));
                }

                output
            }
        }
    }

    /// Formats the dependency graph.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        let levels = graph.levels();

        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<NodeJson> = graph
                    .topological_order()
                    .into_iter()
                    .filter_map(|name| {
                        graph.node(&name).map(|node| NodeJson {
                            kind: node.kind.clone(),
                            depends_on: graph.dependencies(&name),
                            name,
                        })
                    })
                    .collect();
                let json = GraphJson {
                    resources: graph.len(),
                    edges: graph.edge_count(),
                    levels,
                    nodes,
                };
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!(
                    "\nResource graph: {} resources, {} edges\n\n",
                    graph.len(),
                    graph.edge_count()
                );

                let rows: Vec<NodeRow> = levels
                    .iter()
                    .enumerate()
                    .flat_map(|(level, names)| {
                        names.iter().map(move |name| (level, name))
                    })
                    .filter_map(|(level, name)| {
                        graph.node(name).map(|node| NodeRow {
                            level,
                            resource: name.clone(),
                            kind: node.kind.clone(),
                            depends_on: graph.dependencies(name).join(", "),
                        })
                    })
                    .collect();

                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "errors": result
                        .errors
                        .iter()
                        .map(|e| serde_json::json!({ "field": e.field, "message": e.message }))
                        .collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid", "✓".green());
                } else {
                    let _ = writeln!(
                        output,
                        "{} {} validation error(s):",
                        "✗".red(),
                        result.error_count()
                    );
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                }

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats stack state.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    state.project, state.environment
                );

                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(
                    output,
                    "   Config hash: {}",
                    Self::short_hash(&state.config_hash)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<StateRow> = state
                        .resources
                        .values()
                        .map(|r| StateRow {
                            resource: r.name.clone(),
                            kind: r.kind.clone(),
                            id: r.provider_id.clone(),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.pending_deletes.is_empty() {
                    let _ = writeln!(
                        output,
                        "\n   {} Replaced instances awaiting deletion:",
                        "⚠".yellow()
                    );
                    for pending in &state.pending_deletes {
                        let _ = writeln!(
                            output,
                            "     {} ({}) {}",
                            pending.name, pending.kind, pending.provider_id
                        );
                    }
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} resources)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats stack exports.
    #[must_use]
    pub fn format_exports(&self, exports: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(exports).unwrap_or_default(),
            OutputFormat::Text => {
                if exports.is_empty() {
                    return String::from("No outputs recorded.\n");
                }
                Self::format_exports_text(exports)
            }
        }
    }

    fn format_exports_text(exports: &BTreeMap<String, Value>) -> String {
        let mut output = String::from("Outputs:\n");
        for (name, value) in exports {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Object(_) => String::from("(object)"),
                other => other.to_string(),
            };
            let _ = writeln!(output, "   {} = {}", name.bold(), Self::truncate(&rendered, 80));
        }
        output
    }

    /// Formats an operation kind with color.
    fn format_operation_kind(kind: OperationKind) -> String {
        match kind {
            OperationKind::Create => "+create".green().to_string(),
            OperationKind::Update => "~update".yellow().to_string(),
            OperationKind::Replace => "+/-replace".magenta().to_string(),
            OperationKind::DeleteReplaced => "-delete-replaced".red().to_string(),
            OperationKind::Delete => "-delete".red().to_string(),
        }
    }

    /// Formats a resource status with color.
    fn format_status(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Applied => "applied".green().to_string(),
            ResourceStatus::Unchanged => "unchanged".dimmed().to_string(),
            ResourceStatus::Failed => "failed".red().to_string(),
            ResourceStatus::Skipped => "skipped".yellow().to_string(),
        }
    }

    /// First eight characters of a hash.
    fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    config_hash: String,
    destroy: bool,
    operation_count: usize,
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    unchanged: Vec<String>,
    passes_guardrails: bool,
    guardrail_violations: Vec<String>,
    operations: Vec<OperationJson>,
}

#[derive(serde::Serialize)]
struct OperationJson {
    index: usize,
    kind: OperationKind,
    resource: String,
    resource_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_id: Option<String>,
    reason: String,
    depends_on: Vec<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    changes: Vec<ChangeJson>,
}

#[derive(serde::Serialize)]
struct ChangeJson {
    field: String,
    old_value: Option<String>,
    new_value: Option<String>,
    forces_replace: bool,
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        Self {
            config_hash: plan.config_hash.clone(),
            destroy: plan.destroy,
            operation_count: plan.operation_count(),
            creates: plan.count(OperationKind::Create),
            updates: plan.count(OperationKind::Update),
            replaces: plan.count(OperationKind::Replace),
            deletes: plan.count(OperationKind::Delete),
            unchanged: plan.unchanged.clone(),
            passes_guardrails: plan.passes_guardrails,
            guardrail_violations: plan.guardrail_violations.clone(),
            operations: plan
                .operations
                .iter()
                .enumerate()
                .map(|(index, op)| OperationJson {
                    index,
                    kind: op.kind,
                    resource: op.resource.clone(),
                    resource_kind: op.resource_kind.clone(),
                    provider_id: op.provider_id.clone(),
                    reason: op.reason.clone(),
                    depends_on: op.depends_on.clone(),
                    changes: op
                        .details
                        .iter()
                        .map(|d| ChangeJson {
                            field: d.field.clone(),
                            old_value: d.old_value.clone(),
                            new_value: d.new_value.clone(),
                            forces_replace: d.forces_replace,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(serde::Serialize)]
struct GraphJson {
    resources: usize,
    edges: usize,
    levels: Vec<Vec<String>>,
    nodes: Vec<NodeJson>,
}

#[derive(serde::Serialize)]
struct NodeJson {
    name: String,
    kind: String,
    depends_on: Vec<String>,
}
