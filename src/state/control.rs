//! Orchestrator-owned bookkeeping carried inside the state container.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::StageName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The three bounded feedback loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Length,
    Quality,
    Originality,
}

impl LoopKind {
    pub const ALL: [LoopKind; 3] = [Self::Length, Self::Quality, Self::Originality];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Length => "length",
            Self::Quality => "quality",
            Self::Originality => "originality",
        }
    }
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-loop iteration counters plus the order loops were first entered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCounters {
    pub length: u32,
    pub quality: u32,
    pub originality: u32,
    #[serde(default)]
    pub entered: Vec<LoopKind>,
}

impl LoopCounters {
    pub fn get(&self, kind: LoopKind) -> u32 {
        match kind {
            LoopKind::Length => self.length,
            LoopKind::Quality => self.quality,
            LoopKind::Originality => self.originality,
        }
    }

    fn slot(&mut self, kind: LoopKind) -> &mut u32 {
        match kind {
            LoopKind::Length => &mut self.length,
            LoopKind::Quality => &mut self.quality,
            LoopKind::Originality => &mut self.originality,
        }
    }

    /// Count one more entry into `kind`.
    ///
    /// The first entry of a loop type in a run zeroes every other loop's
    /// counter; re-entries of the same loop never reset anything.
    pub fn record_entry(&mut self, kind: LoopKind) {
        if !self.entered.contains(&kind) {
            for other in LoopKind::ALL.into_iter().filter(|k| *k != kind) {
                *self.slot(other) = 0;
            }
            self.entered.push(kind);
        }
        *self.slot(kind) += 1;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedFlags {
    pub length_degraded: bool,
    pub quality_degraded: bool,
    pub originality_degraded: bool,
}

impl DegradedFlags {
    pub fn set(&mut self, kind: LoopKind) {
        match kind {
            LoopKind::Length => self.length_degraded = true,
            LoopKind::Quality => self.quality_degraded = true,
            LoopKind::Originality => self.originality_degraded = true,
        }
    }

    pub fn is_set(&self, kind: LoopKind) -> bool {
        match kind {
            LoopKind::Length => self.length_degraded,
            LoopKind::Quality => self.quality_degraded,
            LoopKind::Originality => self.originality_degraded,
        }
    }

    pub fn any(&self) -> bool {
        self.length_degraded || self.quality_degraded || self.originality_degraded
    }
}

/// Last failure recorded on the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
}

/// Bookkeeping changes applied through `StateContainer::transition`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlUpdate {
    /// The named stage finished and its output is in the container.
    StageCompleted(StageName),
    LoopEntered(LoopKind),
    Escalated(LoopKind),
    /// The terminal stage completed.
    Finished,
    Failed(ErrorRecord),
    Cancelled,
}

impl ControlUpdate {
    pub fn describe(&self) -> String {
        match self {
            Self::StageCompleted(stage) => format!("stage '{}' completed", stage),
            Self::LoopEntered(kind) => format!("entered {} loop", kind),
            Self::Escalated(kind) => format!("{} loop bound reached, escalated", kind),
            Self::Finished => "run finished".to_string(),
            Self::Failed(err) => format!("run failed: {}", err.kind),
            Self::Cancelled => "run cancelled".to_string(),
        }
    }
}
