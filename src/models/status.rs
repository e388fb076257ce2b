use std::{
    fmt::{Display, Formatter, Result},
    str::FromStr,
};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Lifecycle of a notification as seen in its outcome record:
/// `pending -> processing -> {processed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Pending => "pending",
            OutcomeStatus::Processing => "processing",
            OutcomeStatus::Processed => "processed",
            OutcomeStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutcomeStatus::Processed | OutcomeStatus::Failed)
    }

    /// Terminal records only accept rewrites carrying the same status.
    pub fn accepts(&self, next: OutcomeStatus) -> bool {
        !self.is_terminal() || *self == next
    }
}

impl Display for OutcomeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutcomeStatus::Pending),
            "processing" => Ok(OutcomeStatus::Processing),
            "processed" => Ok(OutcomeStatus::Processed),
            "failed" => Ok(OutcomeStatus::Failed),
            other => Err(anyhow!("Unknown outcome status '{}'", other)),
        }
    }
}
