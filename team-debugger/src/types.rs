// Debugger type definitions
//
// Ids and small enums shared across the debuggee model and the engine

use serde::{Deserialize, Serialize};

// Target addresses are 64 bits regardless of the target's address size
pub type TargetAddr = u64;
pub type TargetSize = u64;

pub type TeamId = i32;
pub type ThreadId = i32;
pub type ImageId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    #[default]
    Unknown,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppedReason {
    #[default]
    Unknown,
    Debugged,
    DebuggerCall,
    Exception,
    Breakpoint,
    Watchpoint,
    SingleStep,
}

/// User-requested thread actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadAction {
    Run,
    Stop,
    StepOver,
    StepInto,
    StepOut,
    SetAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    #[default]
    None,
    Over,
    Into,
    Out,
    Until,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDisposition {
    Ignore,
    #[default]
    StopAtReceipt,
    StopAtSignalHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchpointType {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackGrowthDirection {
    Positive,
    Negative,
}

impl StackGrowthDirection {
    /// Whether `frame_address` lies on the caller side of `previous`.
    pub fn has_exited(self, previous: TargetAddr, frame_address: TargetAddr) -> bool {
        match self {
            StackGrowthDirection::Positive => frame_address < previous,
            StackGrowthDirection::Negative => frame_address > previous,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSeverity {
    Info,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_growth_exit() {
        let down = StackGrowthDirection::Negative;
        assert!(down.has_exited(0x7000, 0x7010));
        assert!(!down.has_exited(0x7000, 0x7000));
        assert!(!down.has_exited(0x7000, 0x6ff0));

        let up = StackGrowthDirection::Positive;
        assert!(up.has_exited(0x7000, 0x6ff0));
        assert!(!up.has_exited(0x7000, 0x7010));
    }

    #[test]
    fn test_thread_state_serde() {
        let json = serde_json::to_string(&ThreadState::Stopped).unwrap();
        assert_eq!(json, "\"stopped\"");
        let reason: StoppedReason = serde_json::from_str("\"single_step\"").unwrap();
        assert_eq!(reason, StoppedReason::SingleStep);
    }
}
