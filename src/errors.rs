//! Typed error hierarchy for the draftline pipeline engine.
//!
//! The enums follow the engine's layers:
//! - `ValidationError`: a stage tried to write a field it did not declare
//! - `GraphError` / `RoutingError`: stage graph misconfiguration
//! - `CheckpointError`: rejected or failed checkpoint persistence
//! - `CollaboratorError`: failures reported by external services
//! - `RunError`: the reason a single run stopped without finishing
//! - `SupervisorError`: failures of the run registry API

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{Field, OrderId, RunStatus, StageName};

/// A stage attempted to write a field outside its declared outputs.
///
/// Always a programming defect in the stage; the run is aborted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stage '{stage}' wrote undeclared field '{field}'")]
pub struct ValidationError {
    pub stage: StageName,
    pub field: Field,
}

/// Configuration errors detected while building the stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(StageName),

    #[error("Route from '{from}' targets unknown stage '{to}'")]
    UnknownTarget { from: StageName, to: StageName },

    #[error("Route declared from unknown stage '{0}'")]
    UnknownSource(StageName),

    #[error("Stage '{0}' has no outgoing routes and is not the terminal stage")]
    DeadEnd(StageName),

    #[error("Terminal stage '{0}' must not have outgoing routes")]
    TerminalHasRoutes(StageName),

    #[error("Routes from '{stage}' overlap: '{first}' and '{second}' can match the same state")]
    AmbiguousRoutes {
        stage: StageName,
        first: String,
        second: String,
    },

    #[error("Routes from '{stage}' do not cover every state: {missing}")]
    IncompleteRoutes { stage: StageName, missing: String },

    #[error("Stage '{stage}' reads '{field}' which no stage writes and the order does not provide")]
    UnsatisfiedInput { stage: StageName, field: Field },

    #[error("Validating stage '{stage}' declares content output '{field}'")]
    ContentFromValidator { stage: StageName, field: Field },

    #[error("Loop '{name}' references unknown stage '{stage}'")]
    UnknownLoopStage { name: String, stage: StageName },

    #[error("Loop '{name}' must have a bound of at least 1")]
    ZeroLoopBound { name: String },

    #[error("Entry stage '{0}' is not registered")]
    MissingEntry(StageName),

    #[error("Terminal stage '{0}' is not registered")]
    MissingTerminal(StageName),
}

/// No outgoing route matched the state produced by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("No route matched after stage '{stage}'")]
pub struct RoutingError {
    pub stage: StageName,
}

/// Checkpoint persistence failures.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(
        "Checkpoint sequence {seq} for order {order_id} is not after the latest sequence {latest}"
    )]
    OutOfOrder {
        order_id: OrderId,
        seq: u64,
        latest: u64,
    },

    #[error("Failed to encode checkpoint state for order {order_id}: {source}")]
    Encode {
        order_id: OrderId,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode checkpoint state for order {order_id}: {source}")]
    Decode {
        order_id: OrderId,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Failure reported by an external collaborator (generation, search,
/// detection, humanization, extraction).
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollaboratorError {
    #[error("Service call timed out")]
    Timeout,

    #[error("Service rate-limited the request")]
    RateLimited {
        #[serde(default, with = "millis_opt")]
        retry_after: Option<Duration>,
    },

    #[error("Service returned malformed output: {0}")]
    Malformed(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl CollaboratorError {
    /// Whether the orchestrator may retry the stage that saw this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }

    /// Minimum delay the service asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Why a run stopped before reaching the terminal stage.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Stage '{stage}' failed: {reason}")]
    StageFailed { stage: StageName, reason: String },

    #[error("Stage '{stage}' exhausted {attempts} attempts: {reason}")]
    RetriesExhausted {
        stage: StageName,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Stage '{0}' is not registered in the graph")]
    UnknownStage(StageName),
}

impl RunError {
    /// Short machine-readable kind recorded in the state's error record.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StageFailed { .. } => "fatal_failure",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Validation(_) => "validation_error",
            Self::Routing(_) => "routing_error",
            Self::Checkpoint(_) => "checkpoint_error",
            Self::UnknownStage(_) => "unknown_stage",
        }
    }

    /// Misconfiguration rather than a runtime condition.
    pub fn is_configuration_bug(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Routing(_) | Self::UnknownStage(_)
        )
    }
}

/// Errors from the run supervisor API.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("A run for order {0} is already active")]
    AlreadyRunning(OrderId),

    #[error("No run found for order {0}")]
    NotFound(OrderId),

    #[error("Order {order_id} is not running; its run ended {status}. Pick a new order id")]
    Finished { order_id: OrderId, status: RunStatus },

    #[error("Run task for order {order_id} panicked or was aborted: {message}")]
    TaskFailed { order_id: OrderId, message: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_stage_and_field() {
        let err = ValidationError {
            stage: StageName::from("check_quality"),
            field: Field::Draft,
        };
        let msg = err.to_string();
        assert!(msg.contains("check_quality"));
        assert!(msg.contains("draft"));
    }

    #[test]
    fn collaborator_error_retry_classification() {
        assert!(CollaboratorError::Timeout.is_retryable());
        assert!(CollaboratorError::Malformed("x".into()).is_retryable());
        assert!(
            CollaboratorError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
            .is_retryable()
        );
        assert!(!CollaboratorError::Unavailable("down".into()).is_retryable());
    }

    #[test]
    fn rate_limited_exposes_retry_after() {
        let err = CollaboratorError::RateLimited {
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(CollaboratorError::Timeout.retry_after(), None);
    }

    #[test]
    fn collaborator_error_serializes_with_kind_tag() {
        let err = CollaboratorError::RateLimited {
            retry_after: Some(Duration::from_millis(250)),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "rate_limited");
        assert_eq!(json["retry_after"], 250);
        let back: CollaboratorError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn run_error_kinds_and_configuration_bugs() {
        let routing: RunError = RoutingError {
            stage: StageName::from("revise"),
        }
        .into();
        assert_eq!(routing.kind(), "routing_error");
        assert!(routing.is_configuration_bug());

        let exhausted = RunError::RetriesExhausted {
            stage: StageName::from("write_draft"),
            attempts: 3,
            reason: "malformed".into(),
        };
        assert_eq!(exhausted.kind(), "retries_exhausted");
        assert!(!exhausted.is_configuration_bug());
        assert!(exhausted.to_string().contains("3 attempts"));
    }

    #[test]
    fn checkpoint_out_of_order_carries_sequences() {
        let err = CheckpointError::OutOfOrder {
            order_id: OrderId::from("A-1"),
            seq: 3,
            latest: 5,
        };
        match &err {
            CheckpointError::OutOfOrder { seq, latest, .. } => {
                assert_eq!(*seq, 3);
                assert_eq!(*latest, 5);
            }
            _ => panic!("Expected OutOfOrder"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CollaboratorError::Timeout);
        assert_std_error(&SupervisorError::NotFound(OrderId::from("x")));
        assert_std_error(&GraphError::DeadEnd(StageName::from("x")));
    }
}
