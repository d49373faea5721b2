//! Run lifecycle vocabulary shared by the store and the engine.

use serde::{Deserialize, Serialize};

use crate::ids::{RunId, ToolCallId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Terminal states accept nothing. Cancellation is reachable from every
    /// non-terminal state; failure from every non-terminal state so that
    /// timeouts and orphan sweeps can close suspended or never-started runs.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Completed | Suspended) => true,
            (Suspended, Running) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// States from which `next` is reachable. Used to build guarded UPDATEs.
    pub fn sources_of(next: RunStatus) -> Vec<RunStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    pub const ALL: [RunStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Suspended,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What a suspended run is waiting on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Awaiting {
    /// A human decision on the proposed call.
    Approval,
    /// A delegated child run that is itself suspended.
    ChildRun { child_run_id: RunId },
}

/// Snapshot of the single outstanding tool call a suspended run is parked on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingTool {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub step: u32,
    pub awaiting: Awaiting,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
    }

    #[test]
    fn lifecycle_edges() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Suspended));
        assert!(RunStatus::Suspended.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Suspended.can_transition_to(RunStatus::Failed));

        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Suspended.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn terminal_states_are_sinks() {
        for from in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            for to in RunStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn cancel_reachable_from_every_live_state() {
        assert_eq!(
            RunStatus::sources_of(RunStatus::Cancelled),
            vec![RunStatus::Pending, RunStatus::Running, RunStatus::Suspended]
        );
    }

    #[test]
    fn status_string_roundtrip() {
        for status in RunStatus::ALL {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn pending_tool_serde() {
        let pending = PendingTool {
            tool_call_id: ToolCallId::from_raw("call_1"),
            tool_name: "write_file".into(),
            arguments: serde_json::json!({"path": "a.txt"}),
            step: 3,
            awaiting: Awaiting::ChildRun {
                child_run_id: RunId::from_raw("run_child"),
            },
        };
        let json = serde_json::to_value(&pending).unwrap();
        assert_eq!(json["awaiting"]["kind"], "child_run");
        assert_eq!(json["awaiting"]["child_run_id"], "run_child");
        let parsed: PendingTool = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, pending);
    }
}
