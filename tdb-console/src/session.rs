// Debug session management
//
// A session is one simulated team under a TeamDebugger, plus the team events
// the console has not looked at yet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use team_debugger::debug_info::SourceLocation;
use team_debugger::settings::MemorySettingsManager;
use team_debugger::sim::{debugger_setup, Program, SimulatedTarget};
use team_debugger::stack_trace::StackTrace;
use team_debugger::team::{TeamEvent, TeamListener};
use team_debugger::types::{StoppedReason, ThreadState};
use team_debugger::user_interface::LoggingUserInterface;
use team_debugger::{DebuggerConfig, DebuggerResult, QuitOption, TargetAddr, TeamDebugger, ThreadId};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(5);

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    Exited,
    StillRunning,
}

struct EventLog {
    events: mpsc::UnboundedReceiver<TeamEvent>,
    console: Vec<String>,
}

impl EventLog {
    fn record(&mut self, event: &TeamEvent) {
        if let TeamEvent::ConsoleOutputReceived { fd, output } = event {
            debug!("Console output on fd {}: {:?}", fd, output);
            self.console.push(output.clone());
        }
    }
}

/// Forwards team events into the session's log.
struct SessionListener {
    tx: mpsc::UnboundedSender<TeamEvent>,
}

impl TeamListener for SessionListener {
    fn team_event(&self, event: &TeamEvent) {
        let _ = self.tx.send(event.clone());
    }
}

pub struct DebugSession {
    pub id: SessionId,
    pub debugger: Arc<TeamDebugger>,
    pub target: Arc<SimulatedTarget>,
    log: Mutex<EventLog>,
}

impl DebugSession {
    pub async fn launch(id: SessionId, program: Program, config: DebuggerConfig) -> DebuggerResult<Self> {
        let target = SimulatedTarget::launch(program);
        let setup = debugger_setup(
            &target,
            Arc::new(LoggingUserInterface),
            Arc::new(MemorySettingsManager::new()),
        );
        let stop_in_main = config.stop_in_main;
        let debugger = TeamDebugger::init(setup, config).await?;

        let (tx, events) = mpsc::unbounded_channel();
        debugger.team().add_listener(Arc::new(SessionListener { tx }));
        info!("Session {} debugging {}", id, debugger.team().name());

        let session = Self {
            id,
            debugger,
            target,
            log: Mutex::new(EventLog {
                events,
                console: Vec::new(),
            }),
        };
        if stop_in_main && !session.settle_in_main(LAUNCH_TIMEOUT).await {
            warn!("Session {}: team did not stop in main", session.id);
        }
        Ok(session)
    }

    /// Polls until the main thread sits at the stop-in-main breakpoint and
    /// every image's debug info is settled.
    async fn settle_in_main(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let settled = self.debugger.team().read(|t| {
                let stopped = t.main_thread().is_some_and(|thread| {
                    thread.state() == ThreadState::Stopped
                        && thread.stopped_reason() == StoppedReason::Breakpoint
                });
                stopped && t.images().all(|image| image.debug_info_state().is_final())
            });
            if settled {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn main_thread(&self) -> Option<ThreadId> {
        self.debugger
            .team()
            .read(|t| t.main_thread().map(|thread| thread.id()))
    }

    /// Consumes queued events and returns the console output they carried.
    pub async fn take_console_output(&self) -> Vec<String> {
        let mut log = self.log.lock().await;
        while let Ok(event) = log.events.try_recv() {
            log.record(&event);
        }
        std::mem::take(&mut log.console)
    }

    /// Waits for `thread` to change state and end up stopped. Call
    /// `take_console_output` before acting on the thread so older state
    /// changes don't count.
    pub async fn wait_for_stop(&self, thread: ThreadId, timeout: Duration) -> StopOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut log = self.log.lock().await;
        let mut changed = false;
        loop {
            match self.debugger.team().thread_state(thread) {
                None => return StopOutcome::Exited,
                Some(ThreadState::Stopped) if changed => return StopOutcome::Stopped,
                _ => {}
            }
            match tokio::time::timeout_at(deadline, log.events.recv()).await {
                Ok(Some(event)) => {
                    log.record(&event);
                    match event {
                        TeamEvent::ThreadStateChanged(id) if id == thread => changed = true,
                        TeamEvent::ThreadRemoved(id) if id == thread => return StopOutcome::Exited,
                        _ => {}
                    }
                }
                Ok(None) | Err(_) => return StopOutcome::StillRunning,
            }
        }
    }

    /// Stack traces are computed in the background once a thread stops.
    pub async fn wait_for_stack_trace(&self, thread: ThreadId, timeout: Duration) -> Option<Arc<StackTrace>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut log = self.log.lock().await;
        loop {
            let snapshot = self.debugger.team().thread_snapshot(thread)?;
            if snapshot.state() != ThreadState::Stopped {
                return None;
            }
            if let Some(trace) = snapshot.stack_trace() {
                return Some(trace.clone());
            }
            match tokio::time::timeout_at(deadline, log.events.recv()).await {
                Ok(Some(event)) => log.record(&event),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// `function+offset (file:line)` when debug info covers the address.
    pub fn describe_address(&self, address: TargetAddr) -> String {
        self.debugger.team().read(|t| match t.debug_info().function_at_address(address) {
            Some(function) => {
                let line = function
                    .source_location_at(address)
                    .map(|location| {
                        format!(" ({}:{})", function.source_file().unwrap_or("?"), location.line)
                    })
                    .unwrap_or_default();
                format!("{}+{:#x}{}", function.name, address - function.address(), line)
            }
            None => format!("{:#x}", address),
        })
    }

    /// Address of `line` in `function`, or of the function itself.
    pub fn resolve_function(&self, function: &str, line: Option<u32>) -> Option<TargetAddr> {
        self.debugger.team().read(|t| {
            let instance = t
                .images()
                .filter_map(|image| image.debug_info())
                .find_map(|info| info.function_by_name(function).cloned())?;
            match line {
                Some(line) => instance
                    .statement_at_source_location(SourceLocation::new(line))
                    .map(|statement| statement.covering_address_range().start),
                None => Some(instance.address()),
            }
        })
    }
}

pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Arc<DebugSession>>>,
    current_session: Mutex<Option<SessionId>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            current_session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn create_session(&self, program: Program, config: DebuggerConfig) -> DebuggerResult<Arc<DebugSession>> {
        let session_id = format!("session_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(DebugSession::launch(session_id.clone(), program, config).await?);

        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), session.clone());
        *self.current_session.lock().await = Some(session_id);
        Ok(session)
    }

    pub async fn get_current_session(&self) -> Option<Arc<DebugSession>> {
        let current = self.current_session.lock().await;
        let session_id = current.as_ref()?;
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Quits the session's debugger and forgets the session.
    pub async fn close_session(&self, session_id: &str, option: QuitOption) -> bool {
        let Some(session) = self.sessions.lock().await.remove(session_id) else {
            return false;
        };
        let mut current = self.current_session.lock().await;
        if current.as_deref() == Some(session_id) {
            *current = None;
        }
        drop(current);
        session.debugger.quit(option).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::demo_program;
    use team_debugger::ThreadAction;

    #[tokio::test]
    async fn test_session_stops_in_main_and_resolves_lines() {
        let manager = SessionManager::new();
        let session = manager
            .create_session(demo_program().unwrap(), DebuggerConfig::default())
            .await
            .unwrap();
        let thread = session.main_thread().unwrap();
        let main = session.resolve_function("main", None).unwrap();
        let snapshot = session.debugger.team().thread_snapshot(thread).unwrap();
        assert_eq!(snapshot.stopped_reason(), StoppedReason::Breakpoint);
        assert_eq!(snapshot.cpu_state().unwrap().instruction_pointer, main);
        assert!(session.describe_address(main).starts_with("main+0x0"));
        assert!(session.resolve_function("tick", Some(12)).unwrap() > main);
        assert!(session.resolve_function("missing", None).is_none());

        session.take_console_output().await;
        session
            .debugger
            .thread_action(thread, ThreadAction::Run, None)
            .await
            .unwrap();
        let outcome = session.wait_for_stop(thread, Duration::from_secs(5)).await;
        assert_eq!(outcome, StopOutcome::Exited);
        assert_eq!(session.take_console_output().await.concat(), "tick\ntick\ntick\n");

        let id = session.id.clone();
        assert!(manager.close_session(&id, QuitOption::KillTeam).await);
        assert!(manager.get_current_session().await.is_none());
    }
}
