//! Progress events: the only channel through which a run reports to the
//! outside world.
//!
//! Every [`ProgressEvent`] carries an id, an emission timestamp and one
//! [`ProgressKind`] payload. The payload field names are the wire contract
//! relayed to observers; the JSON form is flat with a `type` tag:
//!
//! ```text
//! {"type":"step_started","test_id":"test_1700000000000","step":"Set 5V","step_number":1,...}
//! ```

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::StepResult;

// --- event type names ---

pub const EVENT_TYPE_TEST_STARTED: &str = "test_started";
pub const EVENT_TYPE_STEP_STARTED: &str = "step_started";
pub const EVENT_TYPE_STEP_COMPLETED: &str = "step_completed";
pub const EVENT_TYPE_TEST_COMPLETED: &str = "test_completed";
pub const EVENT_TYPE_TEST_ERROR: &str = "test_error";

/// Final status of a run, carried by `test_completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every executed step passed
    Completed,
    /// At least one step failed
    Failed,
    /// Ended early by a stop request
    Stopped,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    TestStarted {
        test_id: String,
        /// Sequence name
        sequence: String,
        total_steps: usize,
    },
    StepStarted {
        test_id: String,
        /// Step name
        step: String,
        step_number: usize,
    },
    StepCompleted {
        test_id: String,
        step: String,
        result: StepResult,
    },
    TestCompleted {
        test_id: String,
        /// Overall verdict: `steps_passed == total_steps`
        passed: bool,
        steps_passed: usize,
        /// Number of executed steps
        total_steps: usize,
        /// Elapsed seconds since the run started
        duration: f64,
        status: RunStatus,
    },
    TestError {
        test_id: String,
        error: String,
    },
}

impl ProgressKind {
    /// Test id carried by every payload.
    pub fn test_id(&self) -> &str {
        match self {
            Self::TestStarted { test_id, .. }
            | Self::StepStarted { test_id, .. }
            | Self::StepCompleted { test_id, .. }
            | Self::TestCompleted { test_id, .. }
            | Self::TestError { test_id, .. } => test_id,
        }
    }

    /// Wire name of the payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TestStarted { .. } => EVENT_TYPE_TEST_STARTED,
            Self::StepStarted { .. } => EVENT_TYPE_STEP_STARTED,
            Self::StepCompleted { .. } => EVENT_TYPE_STEP_COMPLETED,
            Self::TestCompleted { .. } => EVENT_TYPE_TEST_COMPLETED,
            Self::TestError { .. } => EVENT_TYPE_TEST_ERROR,
        }
    }
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Event id (UUID v4)
    pub id: String,
    /// Seconds since the Unix epoch at emission
    pub timestamp: f64,
    /// Payload
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    /// Wraps a payload, stamping it with a fresh id and the current time.
    pub fn new(kind: ProgressKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: unix_seconds(SystemTime::now()),
            kind,
        }
    }

    /// Wire name of the payload.
    pub fn event_type(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Test id of the run that emitted the event.
    pub fn test_id(&self) -> &str {
        self.kind.test_id()
    }

    /// Serializes the event to its JSON wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProgressEvent[{}] type={} test={}",
            &self.id[..8.min(self.id.len())],
            self.kind.type_name(),
            self.kind.test_id(),
        )
    }
}

fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> ProgressKind {
        ProgressKind::TestStarted {
            test_id: "test_1700000000000".to_owned(),
            sequence: "Basic power test".to_owned(),
            total_steps: 2,
        }
    }

    #[test]
    fn new_event_is_stamped() {
        let event = ProgressEvent::new(started());
        assert_eq!(event.event_type(), "test_started");
        assert_eq!(event.test_id(), "test_1700000000000");
        assert_eq!(event.id.len(), 36);
        assert_ne!(event.id, ProgressEvent::new(started()).id);
    }

    #[test]
    fn wire_form_is_flat_and_tagged() {
        let json = ProgressEvent::new(started()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "test_started");
        assert_eq!(value["test_id"], "test_1700000000000");
        assert_eq!(value["sequence"], "Basic power test");
        assert_eq!(value["total_steps"], 2);
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
        assert_eq!(value["id"].as_str().map(str::len), Some(36));
    }

    #[test]
    fn test_completed_wire_fields() {
        let event = ProgressEvent::new(ProgressKind::TestCompleted {
            test_id: "test_1".to_owned(),
            passed: false,
            steps_passed: 1,
            total_steps: 2,
            duration: 0.5,
            status: RunStatus::Failed,
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "test_completed");
        assert_eq!(value["passed"], false);
        assert_eq!(value["steps_passed"], 1);
        assert_eq!(value["status"], "failed");
    }

    #[test]
    fn wire_form_decodes_back() {
        let event = ProgressEvent::new(started());
        let decoded: ProgressEvent = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded.id, event.id);
        assert_eq!(decoded.kind, started());
    }

    #[test]
    fn display_contains_type_and_test_id() {
        let display = ProgressEvent::new(started()).to_string();
        assert!(display.contains("test_started"));
        assert!(display.contains("test_1700000000000"));
    }

    #[test]
    fn events_are_send_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<ProgressEvent>();
    }
}
