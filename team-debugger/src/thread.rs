// Threads
//
// Model of one debuggee thread. State changes go through Team so that
// dependent state is cleared and listeners get notified.

use crate::cpu_state::CpuState;
use crate::stack_trace::StackTrace;
use crate::types::{StoppedReason, TeamId, ThreadId, ThreadState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub team_id: TeamId,
    pub thread_id: ThreadId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Thread {
    id: ThreadId,
    name: String,
    priority: i32,
    main_thread: bool,
    state: ThreadState,
    stopped_reason: StoppedReason,
    stopped_reason_info: String,
    stop_request_pending: bool,
    cpu_state: Option<Arc<CpuState>>,
    stack_trace: Option<Arc<StackTrace>>,
}

impl Thread {
    pub fn new(info: &ThreadInfo, main_thread: bool) -> Self {
        Self {
            id: info.thread_id,
            name: info.name.clone(),
            priority: 0,
            main_thread,
            state: ThreadState::Unknown,
            stopped_reason: StoppedReason::Unknown,
            stopped_reason_info: String::new(),
            stop_request_pending: false,
            cpu_state: None,
            stack_trace: None,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_main_thread(&self) -> bool {
        self.main_thread
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn stopped_reason(&self) -> StoppedReason {
        self.stopped_reason
    }

    pub fn stopped_reason_info(&self) -> &str {
        &self.stopped_reason_info
    }

    pub fn stop_request_pending(&self) -> bool {
        self.stop_request_pending
    }

    pub fn cpu_state(&self) -> Option<&Arc<CpuState>> {
        self.cpu_state.as_ref()
    }

    pub fn stack_trace(&self) -> Option<&Arc<StackTrace>> {
        self.stack_trace.as_ref()
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub(crate) fn set_stop_request_pending(&mut self, pending: bool) {
        self.stop_request_pending = pending;
    }

    /// Leaving Stopped drops the CPU state and stack trace in the same step.
    pub(crate) fn set_state(
        &mut self,
        state: ThreadState,
        cpu_state: Option<Arc<CpuState>>,
        reason: StoppedReason,
        reason_info: String,
    ) {
        self.state = state;
        self.stack_trace = None;
        if state == ThreadState::Stopped {
            self.cpu_state = cpu_state;
            self.stopped_reason = reason;
            self.stopped_reason_info = reason_info;
            self.stop_request_pending = false;
        } else {
            self.cpu_state = None;
            self.stopped_reason = StoppedReason::Unknown;
            self.stopped_reason_info.clear();
        }
    }

    /// A new CPU state invalidates the stack trace.
    pub(crate) fn set_cpu_state(&mut self, cpu_state: Option<Arc<CpuState>>) {
        self.cpu_state = cpu_state;
        self.stack_trace = None;
    }

    pub(crate) fn set_stack_trace(&mut self, stack_trace: Option<Arc<StackTrace>>) {
        self.stack_trace = stack_trace;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack_trace::StackTrace;

    fn thread() -> Thread {
        Thread::new(
            &ThreadInfo {
                team_id: 1,
                thread_id: 7,
                name: "worker".to_string(),
            },
            false,
        )
    }

    #[test]
    fn test_running_clears_cpu_state() {
        let mut thread = thread();
        let cpu = Arc::new(CpuState::new(0x1000, 0, 0, vec![]));
        thread.set_state(
            ThreadState::Stopped,
            Some(cpu),
            StoppedReason::Breakpoint,
            String::new(),
        );
        thread.set_stack_trace(Some(Arc::new(StackTrace::default())));
        assert!(thread.cpu_state().is_some());

        thread.set_state(ThreadState::Running, None, StoppedReason::Unknown, String::new());
        assert!(thread.cpu_state().is_none());
        assert!(thread.stack_trace().is_none());
        assert_eq!(thread.stopped_reason(), StoppedReason::Unknown);
    }

    #[test]
    fn test_new_cpu_state_clears_stack_trace() {
        let mut thread = thread();
        thread.set_stack_trace(Some(Arc::new(StackTrace::default())));
        thread.set_cpu_state(Some(Arc::new(CpuState::new(0x2000, 0, 0, vec![]))));
        assert!(thread.stack_trace().is_none());
    }
}
