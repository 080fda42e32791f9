// Debug events
//
// Raw events delivered by the target's debug port. One variant per event
// kind, matched exhaustively by the controller.

use crate::cpu_state::CpuState;
use crate::image::ImageInfo;
use crate::thread::ThreadInfo;
use crate::types::{TargetAddr, TeamId, ThreadId};
use std::sync::Arc;

pub const SYSCALL_WRITE: u32 = 1;

/// A single debug event. `thread_stopped` tells whether the originating
/// thread is held by the debugger until explicitly continued.
#[derive(Debug, Clone)]
pub struct DebugEvent {
    pub team: TeamId,
    pub thread: ThreadId,
    pub thread_stopped: bool,
    pub kind: DebugEventKind,
}

#[derive(Debug, Clone)]
pub struct SyscallInfo {
    pub syscall: u32,
    pub arguments: Vec<u64>,
    pub return_value: i64,
}

#[derive(Debug, Clone)]
pub enum DebugEventKind {
    ThreadDebugged {
        cpu_state: Option<Arc<CpuState>>,
    },
    DebuggerCall {
        message: TargetAddr,
    },
    BreakpointHit {
        cpu_state: Arc<CpuState>,
    },
    WatchpointHit {
        cpu_state: Arc<CpuState>,
    },
    SingleStep {
        cpu_state: Arc<CpuState>,
    },
    ExceptionOccurred {
        exception: String,
        cpu_state: Option<Arc<CpuState>>,
    },
    SignalReceived {
        signal: i32,
        handler: Option<TargetAddr>,
    },
    TeamDeleted,
    TeamExec,
    ThreadCreated {
        new_thread: ThreadInfo,
    },
    ThreadRenamed {
        name: String,
    },
    ThreadPriorityChanged {
        priority: i32,
    },
    ThreadDeleted,
    ImageCreated {
        image: ImageInfo,
    },
    ImageDeleted {
        image: ImageInfo,
    },
    PostSyscall {
        syscall: SyscallInfo,
    },
}

impl DebugEvent {
    pub fn new(team: TeamId, thread: ThreadId, thread_stopped: bool, kind: DebugEventKind) -> Self {
        Self {
            team,
            thread,
            thread_stopped,
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            DebugEventKind::ThreadDebugged { .. } => "thread debugged",
            DebugEventKind::DebuggerCall { .. } => "debugger call",
            DebugEventKind::BreakpointHit { .. } => "breakpoint hit",
            DebugEventKind::WatchpointHit { .. } => "watchpoint hit",
            DebugEventKind::SingleStep { .. } => "single step",
            DebugEventKind::ExceptionOccurred { .. } => "exception occurred",
            DebugEventKind::SignalReceived { .. } => "signal received",
            DebugEventKind::TeamDeleted => "team deleted",
            DebugEventKind::TeamExec => "team exec",
            DebugEventKind::ThreadCreated { .. } => "thread created",
            DebugEventKind::ThreadRenamed { .. } => "thread renamed",
            DebugEventKind::ThreadPriorityChanged { .. } => "thread priority changed",
            DebugEventKind::ThreadDeleted => "thread deleted",
            DebugEventKind::ImageCreated { .. } => "image created",
            DebugEventKind::ImageDeleted { .. } => "image deleted",
            DebugEventKind::PostSyscall { .. } => "post syscall",
        }
    }

    /// Events that are routed to the thread's handler.
    pub fn is_thread_event(&self) -> bool {
        matches!(
            self.kind,
            DebugEventKind::ThreadDebugged { .. }
                | DebugEventKind::DebuggerCall { .. }
                | DebugEventKind::BreakpointHit { .. }
                | DebugEventKind::WatchpointHit { .. }
                | DebugEventKind::SingleStep { .. }
                | DebugEventKind::ExceptionOccurred { .. }
                | DebugEventKind::SignalReceived { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_event_classification() {
        let cpu = Arc::new(CpuState::new(0x1000, 0, 0, vec![]));
        let hit = DebugEvent::new(1, 2, true, DebugEventKind::BreakpointHit { cpu_state: cpu });
        assert!(hit.is_thread_event());
        assert_eq!(hit.name(), "breakpoint hit");

        let exec = DebugEvent::new(1, 2, true, DebugEventKind::TeamExec);
        assert!(!exec.is_thread_event());
    }
}
