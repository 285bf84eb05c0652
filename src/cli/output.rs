//! Output formatting for the `check` command.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use crate::dag::StatusUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
    Table,
}

/// What `check` reports: object statuses plus the names of the resources
/// Envoy would receive, keyed by type URL.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub statuses: Vec<StatusUpdate>,
    pub resources: BTreeMap<String, Vec<String>>,
}

impl CheckReport {
    pub fn invalid_count(&self) -> usize {
        self.statuses.iter().filter(|s| !s.is_valid()).count()
    }
}

pub fn render(report: &CheckReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(report).context("Failed to serialize to JSON")
        }
        OutputFormat::Yaml => serde_yaml::to_string(report).context("Failed to serialize to YAML"),
        OutputFormat::Table => Ok(render_table(report)),
    }
}

fn render_table(report: &CheckReport) -> String {
    let columns = [("OBJECT", 48), ("STATE", 10), ("DESCRIPTION", 60)];
    let mut out = table_header(&columns);
    for status in &report.statuses {
        let description = status
            .errors
            .first()
            .map(|e| e.message.as_str())
            .unwrap_or(status.description.as_str());
        out.push_str(&format!(
            "{:<48} {:<10} {}\n",
            truncate(&status.key.to_string(), 47),
            status.state.to_string(),
            truncate(description, 60)
        ));
    }
    out.push('\n');
    for (type_url, names) in &report.resources {
        let short = type_url.rsplit('.').next().unwrap_or(type_url);
        out.push_str(&format!("{} ({})\n", short, names.len()));
        for name in names {
            out.push_str(&format!("  {}\n", name));
        }
    }
    out
}

/// Truncate string to maximum length with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn table_header(columns: &[(&str, usize)]) -> String {
    let mut header = String::new();
    for (name, width) in columns {
        header.push_str(&format!("{:<width$} ", name, width = width));
    }
    let total_width: usize = columns.iter().map(|(_, w)| w + 1).sum();
    format!("{}\n{}\n", header.trim_end(), "-".repeat(total_width.saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::ValidityState;
    use crate::k8s::{Kind, ObjectKey};

    fn report() -> CheckReport {
        CheckReport {
            statuses: vec![StatusUpdate {
                key: ObjectKey::new(Kind::Ingress, "default", "kuard"),
                state: ValidityState::Valid,
                description: "Valid Ingress".into(),
                errors: vec![],
                warnings: vec![],
                conditions: BTreeMap::new(),
            }],
            resources: BTreeMap::from([(
                "type.googleapis.com/envoy.config.route.v3.RouteConfiguration".to_string(),
                vec!["ingress_http".to_string()],
            )]),
        }
    }

    #[test]
    fn test_table_lists_objects_and_resources() {
        let table = render(&report(), OutputFormat::Table).unwrap();
        assert!(table.starts_with("OBJECT"));
        assert!(table.contains("valid"));
        assert!(table.contains("RouteConfiguration (1)"));
        assert!(table.contains("  ingress_http"));
    }

    #[test]
    fn test_json_output() {
        let json = render(&report(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["statuses"][0]["state"], "Valid");
        assert_eq!(report().invalid_count(), 0);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 8), "hello...");
        assert_eq!(truncate("hello", 3), "...");
    }
}
