//! Processing phases: the coarse lifecycle every status maps onto.

use serde::{Deserialize, Serialize};

/// One of the four phases a fine-grained status belongs to.
///
/// The engine only reasons about phases; what a status *means* is up to the
/// domain that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingPhase {
    /// Waiting to be claimed.
    Pending,
    /// Claimed and being worked on.
    Processing,
    /// Finished successfully (terminal).
    Completed,
    /// Finished unsuccessfully (terminal).
    Failed,
}

impl ProcessingPhase {
    /// Terminal phases are never claimed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingPhase::Completed | ProcessingPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingPhase::Pending => "PENDING",
            ProcessingPhase::Processing => "PROCESSING",
            ProcessingPhase::Completed => "COMPLETED",
            ProcessingPhase::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
