//! Machine-readable plan and result reports

use serde::{Deserialize, Serialize};
use std::path::Path;
use tidesync_core::{Action, ExecutionResult, PlanItem, RemoteLocation, SyncResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub files: Vec<PlanFile>,
    pub summary: PlanSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
    /// skip, create, update, or delete
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub skip: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultReport {
    pub files: Vec<ResultFile>,
    pub errors: Vec<ErrorFile>,
    pub summary: ResultSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFile {
    /// skipped, created, updated, or deleted
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFile {
    /// create, update, or delete
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub skipped: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Present-tense verb of an item: create, update, or delete
fn verb(item: &PlanItem) -> &'static str {
    match item.action {
        Action::Delete => "delete",
        Action::Upload if item.is_create() => "create",
        Action::Upload => "update",
    }
}

fn absolute(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn source_of(item: &PlanItem) -> Option<String> {
    item.local_path.as_deref().map(absolute)
}

impl PlanReport {
    pub fn from_plan(plan: &[PlanItem], location: &RemoteLocation) -> Self {
        let mut report = PlanReport::default();
        for item in plan {
            let action = verb(item);
            match action {
                "create" => report.summary.create += 1,
                "update" => report.summary.update += 1,
                _ => report.summary.delete += 1,
            }
            report.files.push(PlanFile {
                action: action.to_string(),
                source: source_of(item),
                target: location.target(&item.remote_key),
                reason: item.reason.to_string(),
            });
        }
        report
    }
}

impl ResultReport {
    pub fn from_results(results: &[ExecutionResult], location: &RemoteLocation) -> Self {
        let mut report = ResultReport::default();
        for result in results {
            let item = &result.item;
            let target = location.target(&item.remote_key);

            if let Some(err) = &result.error {
                report.summary.failed += 1;
                report.errors.push(ErrorFile {
                    action: verb(item).to_string(),
                    source: source_of(item),
                    target,
                    error: err.to_string(),
                });
                continue;
            }

            let action = match verb(item) {
                "create" => {
                    report.summary.created += 1;
                    "created"
                }
                "update" => {
                    report.summary.updated += 1;
                    "updated"
                }
                _ => {
                    report.summary.deleted += 1;
                    "deleted"
                }
            };
            report.files.push(ResultFile {
                action: action.to_string(),
                source: source_of(item),
                target,
            });
        }
        report
    }

    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }
}

/// Write `value` as pretty-printed JSON
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> SyncResult<()> {
    let data = serde_json::to_vec_pretty(value).map_err(anyhow::Error::from)?;
    std::fs::write(path, data)?;
    Ok(())
}
