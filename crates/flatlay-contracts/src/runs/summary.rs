use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::results::GenerationResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outputs: Vec<String>,
    pub failures: Vec<FailedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub original_name: String,
    pub error: String,
}

impl RunSummary {
    pub fn from_results(
        run_id: impl Into<String>,
        started_at: impl Into<String>,
        results: &[GenerationResult],
        outputs: Vec<String>,
    ) -> Self {
        let failures: Vec<FailedItem> = results
            .iter()
            .filter(|result| !result.success)
            .map(|result| FailedItem {
                original_name: result.original_name.clone(),
                error: result.error.clone().unwrap_or_default(),
            })
            .collect();
        Self {
            run_id: run_id.into(),
            started_at: started_at.into(),
            finished_at: now_utc_iso(),
            total_items: results.len(),
            succeeded: results.len() - failures.len(),
            failed: failures.len(),
            outputs,
            failures,
        }
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let mut payload = serde_json::to_value(summary)?;
    if let Value::Object(fields) = &mut payload {
        fields.insert("ts".to_string(), Value::String(now_utc_iso()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
