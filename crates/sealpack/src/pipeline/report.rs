use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::hasher::FingerprintRecord;
use crate::pipeline::{BuildRequest, Stage, TargetState};
use crate::targets::Target;

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub target: Target,
    #[serde(flatten)]
    pub state: TargetState,
    pub binary: Option<FingerprintRecord>,
    pub elapsed_ms: u128,
}

impl TargetOutcome {
    pub fn succeeded(&self) -> bool {
        self.state.succeeded()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackagingReport {
    pub tool_version: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub request: BuildRequest,
    pub source: FingerprintRecord,
    pub targets: Vec<TargetOutcome>,
}

impl PackagingReport {
    pub fn all_succeeded(&self) -> bool {
        self.targets.iter().all(TargetOutcome::succeeded)
    }

    pub fn outcome(&self, target: Target) -> Option<&TargetOutcome> {
        self.targets.iter().find(|o| o.target == target)
    }

    pub fn failures(&self) -> impl Iterator<Item = (Target, Stage)> + '_ {
        self.targets
            .iter()
            .filter_map(|o| o.state.failed_stage().map(|s| (o.target, s)))
    }

    pub fn succeeded_count(&self) -> usize {
        self.targets.iter().filter(|o| o.succeeded()).count()
    }

    /// `Err` of kind `Tool` naming every failed target and its stage.
    pub fn check(&self) -> Result<()> {
        let failed: Vec<String> = self
            .targets
            .iter()
            .filter_map(|o| match &o.state {
                TargetState::Failed { error, .. } => Some(error.clone()),
                _ => None,
            })
            .collect();
        if failed.is_empty() {
            return Ok(());
        }
        Err(Error::tool(format!(
            "{} of {} targets failed: {}",
            failed.len(),
            self.targets.len(),
            failed.join("; ")
        )))
    }
}
