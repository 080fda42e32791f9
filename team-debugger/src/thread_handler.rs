// Thread handler
//
// Per-thread state machine. Turns raw debug events into thread state
// changes and drives source level stepping with temporary breakpoints and
// single steps. Each handler is fed by its own message queue, so at most
// one event or action is processed per thread at any time.

use crate::architecture::{read_instruction_info, Architecture, InstructionType};
use crate::breakpoint::{BreakpointClientId, UserBreakpoint};
use crate::breakpoint_manager::BreakpointManager;
use crate::config::DebuggerConfig;
use crate::cpu_state::CpuState;
use crate::debug_info::{AddressRange, ImageDebugInfoProvider, Statement};
use crate::error::{DebuggerError, DebuggerResult};
use crate::events::{DebugEvent, DebugEventKind};
use crate::interface::{DebuggerInterface, TeamMemory};
use crate::jobs::{
    thread_job_key, ExpressionEvaluationJob, GetCpuStateJob, GetStackTraceJob, GetThreadStateJob,
};
use crate::language::{EvaluationContext, ExpressionResult};
use crate::stack_trace::{StackFrame, StackFrameType};
use crate::team::Team;
use crate::types::{
    NotificationSeverity, SignalDisposition, StepMode, StoppedReason, TargetAddr, ThreadAction, ThreadId,
    ThreadState,
};
use crate::user_interface::UserInterface;
use crate::worker::{Job, JobListener, JobType, Worker};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Collaborators shared by all thread handlers of a team.
pub struct ThreadHandlerContext {
    pub team: Arc<Team>,
    pub interface: Arc<dyn DebuggerInterface>,
    pub memory: Arc<dyn TeamMemory>,
    pub architecture: Arc<dyn Architecture>,
    pub worker: Worker,
    pub breakpoint_manager: Arc<BreakpointManager>,
    pub debug_info_provider: Arc<dyn ImageDebugInfoProvider>,
    pub user_interface: Arc<dyn UserInterface>,
    pub job_listener: Option<Arc<dyn JobListener>>,
    pub config: DebuggerConfig,
}

#[derive(Debug, Default)]
struct StepState {
    step_mode: StepMode,
    step_statement: Option<Statement>,
    temporary_breakpoint: Option<TargetAddr>,
    previous_instruction_pointer: TargetAddr,
    previous_frame_address: TargetAddr,
    single_stepping: bool,
}

pub struct ThreadHandler {
    thread: ThreadId,
    client: BreakpointClientId,
    ctx: Arc<ThreadHandlerContext>,
    step: Mutex<StepState>,
}

impl ThreadHandler {
    pub fn new(thread: ThreadId, ctx: Arc<ThreadHandlerContext>) -> Self {
        Self {
            thread,
            client: (1 << 32) | thread as u32 as u64,
            ctx,
            step: Mutex::new(StepState::default()),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Kicks off the initial thread state query.
    pub fn init(&self) {
        let job = Arc::new(GetThreadStateJob::new(
            self.ctx.team.clone(),
            self.ctx.interface.clone(),
            self.thread,
        ));
        self.schedule(job);
    }

    /// Dispatches a thread event. Returns whether the thread stays stopped
    /// under debugger control.
    pub async fn handle_event(&self, event: &DebugEvent) -> bool {
        match &event.kind {
            DebugEventKind::ThreadDebugged { cpu_state } => {
                self.handle_thread_debugged(cpu_state.clone(), String::new()).await
            }
            DebugEventKind::DebuggerCall { message } => self.handle_debugger_call(*message).await,
            DebugEventKind::BreakpointHit { cpu_state } => self.handle_breakpoint_hit(cpu_state.clone()).await,
            DebugEventKind::WatchpointHit { cpu_state } => self.handle_watchpoint_hit(cpu_state.clone()).await,
            DebugEventKind::SingleStep { cpu_state } => self.handle_single_step(cpu_state.clone()).await,
            DebugEventKind::ExceptionOccurred { exception, cpu_state } => {
                self.handle_exception_occurred(exception, cpu_state.clone()).await
            }
            DebugEventKind::SignalReceived { signal, handler } => {
                self.handle_signal_received(*signal, *handler).await
            }
            _ => false,
        }
    }

    pub async fn handle_thread_action(&self, action: ThreadAction, address: Option<TargetAddr>) -> DebuggerResult<()> {
        let mut step = self.step.lock().await;
        let state = self
            .ctx
            .team
            .thread_state(self.thread)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {}", self.thread)))?;
        debug!("Thread {}: action {:?} in state {:?}", self.thread, action, state);

        if action == ThreadAction::Stop {
            if state != ThreadState::Running {
                return Err(DebuggerError::InvalidState(format!(
                    "thread {} is not running",
                    self.thread
                )));
            }
            self.ctx
                .team
                .with(|t| t.set_stop_request_pending(self.thread, true));
            return self.ctx.interface.stop_thread(self.thread).await;
        }

        if state != ThreadState::Stopped {
            return Err(DebuggerError::InvalidState(format!(
                "thread {} is not stopped",
                self.thread
            )));
        }

        match action {
            ThreadAction::SetAddress => {
                let address = address
                    .ok_or_else(|| DebuggerError::InvalidState("no address given".to_string()))?;
                self.set_address(address).await
            }
            ThreadAction::Run => match address {
                Some(address) => self.run_to(&mut step, address).await,
                None => {
                    self.clear_continuation(&mut step).await;
                    self.resume(&mut step, false).await
                }
            },
            ThreadAction::StepOver | ThreadAction::StepInto | ThreadAction::StepOut => {
                self.start_step(&mut step, action).await
            }
            ThreadAction::Stop => Ok(()),
        }
    }

    /// Runs until `address` is reached. Used for "stop in main" and signal
    /// handlers.
    pub async fn set_breakpoint_and_run(&self, address: TargetAddr) -> DebuggerResult<()> {
        let mut step = self.step.lock().await;
        self.run_to(&mut step, address).await
    }

    /// Resumes a thread whose event was not consumed.
    pub async fn continue_thread(&self) {
        let running = self.ctx.team.thread_state(self.thread) == Some(ThreadState::Running);
        if !running {
            self.set_running();
        }
        if let Err(e) = self.ctx.interface.continue_thread(self.thread).await {
            warn!("Failed to continue thread {}: {}", self.thread, e);
        }
    }

    /// Drops any step in progress along with its temporary breakpoint.
    pub async fn release(&self) {
        let mut step = self.step.lock().await;
        self.clear_continuation(&mut step).await;
    }

    // Event handlers

    pub async fn handle_breakpoint_hit(&self, cpu_state: Arc<CpuState>) -> bool {
        let mut step = self.step.lock().await;
        let address = cpu_state.instruction_pointer;

        if step.temporary_breakpoint == Some(address) && step.step_mode != StepMode::None {
            if step.step_mode == StepMode::Until {
                return self
                    .stop(&mut step, Some(cpu_state), StoppedReason::Breakpoint, String::new())
                    .await;
            }
            return self.handle_breakpoint_hit_step(&mut step, cpu_state).await;
        }

        let user_breakpoint = self.ctx.team.read(|t| {
            t.breakpoint_at(address)
                .and_then(|b| b.enabled_user_breakpoints().next())
        });
        let Some(user_breakpoint) = user_breakpoint else {
            // Stale installation or one owned by somebody else.
            if step.single_stepping {
                return self.handle_single_step_step(&mut step, cpu_state).await;
            }
            debug!("Thread {}: ignoring breakpoint at {:#x}", self.thread, address);
            return false;
        };

        if !self.condition_holds(&user_breakpoint, &cpu_state).await {
            debug!(
                "Thread {}: condition of breakpoint {} is false",
                self.thread,
                user_breakpoint.id()
            );
            return false;
        }
        self.stop(&mut step, Some(cpu_state), StoppedReason::Breakpoint, String::new())
            .await
    }

    pub async fn handle_watchpoint_hit(&self, cpu_state: Arc<CpuState>) -> bool {
        let mut step = self.step.lock().await;
        self.stop(&mut step, Some(cpu_state), StoppedReason::Watchpoint, String::new())
            .await
    }

    pub async fn handle_single_step(&self, cpu_state: Arc<CpuState>) -> bool {
        let mut step = self.step.lock().await;
        self.handle_single_step_step(&mut step, cpu_state).await
    }

    pub async fn handle_exception_occurred(&self, exception: &str, cpu_state: Option<Arc<CpuState>>) -> bool {
        let mut step = self.step.lock().await;
        self.stop(&mut step, cpu_state, StoppedReason::Exception, exception.to_string())
            .await
    }

    pub async fn handle_debugger_call(&self, message: TargetAddr) -> bool {
        let mut step = self.step.lock().await;
        let text = self
            .ctx
            .memory
            .read_memory_string(message, self.ctx.config.max_debug_string_length)
            .await
            .unwrap_or_else(|e| {
                debug!("Failed to read debugger message at {:#x}: {}", message, e);
                String::new()
            });
        self.stop(&mut step, None, StoppedReason::DebuggerCall, text).await
    }

    pub async fn handle_thread_debugged(&self, cpu_state: Option<Arc<CpuState>>, reason: String) -> bool {
        let mut step = self.step.lock().await;
        self.stop(&mut step, cpu_state, StoppedReason::Debugged, reason).await
    }

    pub async fn handle_signal_received(&self, signal: i32, handler: Option<TargetAddr>) -> bool {
        let disposition = self.ctx.team.read(|t| t.signal_disposition_for(signal));
        let mut step = self.step.lock().await;
        match (disposition, handler) {
            (SignalDisposition::Ignore, _) => false,
            (SignalDisposition::StopAtSignalHandler, Some(handler)) => {
                match self.run_to(&mut step, handler).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Thread {}: cannot run to signal handler: {}", self.thread, e);
                        self.stop(
                            &mut step,
                            None,
                            StoppedReason::Debugged,
                            format!("Received signal {}", signal),
                        )
                        .await
                    }
                }
            }
            _ => {
                self.stop(
                    &mut step,
                    None,
                    StoppedReason::Debugged,
                    format!("Received signal {}", signal),
                )
                .await
            }
        }
    }

    // Team model changes

    pub fn handle_thread_state_changed(&self) {
        let snapshot = self
            .ctx
            .team
            .read(|t| t.thread(self.thread).map(|th| (th.state(), th.cpu_state().is_some())));
        match snapshot {
            Some((ThreadState::Stopped, false)) => {
                let job = Arc::new(GetCpuStateJob::new(
                    self.ctx.team.clone(),
                    self.ctx.interface.clone(),
                    self.thread,
                ));
                self.schedule(job);
            }
            Some((ThreadState::Stopped, true)) => {}
            _ => {
                self.ctx
                    .worker
                    .abort_job(thread_job_key(self.thread, JobType::GetCpuState));
                self.ctx
                    .worker
                    .abort_job(thread_job_key(self.thread, JobType::GetStackTrace));
            }
        }
    }

    pub fn handle_cpu_state_changed(&self) {
        let needs_trace = self.ctx.team.read(|t| {
            t.thread(self.thread).is_some_and(|th| {
                th.state() == ThreadState::Stopped && th.cpu_state().is_some() && th.stack_trace().is_none()
            })
        });
        let key = thread_job_key(self.thread, JobType::GetStackTrace);
        self.ctx.worker.abort_job(key);
        if !needs_trace {
            return;
        }

        let job: Arc<dyn Job> = Arc::new(GetStackTraceJob::new(
            self.ctx.team.clone(),
            self.ctx.memory.clone(),
            self.ctx.architecture.clone(),
            self.ctx.debug_info_provider.clone(),
            self.thread,
            self.ctx.config.max_stack_frames,
        ));
        match self.ctx.worker.schedule_job(job.clone(), self.ctx.job_listener.clone()) {
            Ok(()) => {}
            Err(DebuggerError::AlreadyInProgress(_)) => {
                // The aborted job still holds the key; queue behind it.
                let worker = self.ctx.worker.clone();
                let listener = self.ctx.job_listener.clone();
                tokio::spawn(async move {
                    worker.wait_for(key).await;
                    if let Err(e) = worker.schedule_job(job, listener) {
                        debug!("Stack trace job not rescheduled: {}", e);
                    }
                });
            }
            Err(e) => debug!("Failed to schedule stack trace job: {}", e),
        }
    }

    // Stepping

    async fn start_step(&self, step: &mut StepState, action: ThreadAction) -> DebuggerResult<()> {
        self.clear_continuation(step).await;

        let Some(cpu_state) = self.current_cpu_state().await else {
            return self.step_fallback(step).await;
        };
        let Some(frame) = self.top_frame(&cpu_state).await else {
            return self.step_fallback(step).await;
        };
        let address = cpu_state.instruction_pointer;

        if frame.frame_type == StackFrameType::Syscall {
            // Any step out of a syscall ends once the thread is back in user
            // code.
            step.previous_instruction_pointer = address;
            step.previous_frame_address = frame.frame_address;
            return self.resume(step, true).await;
        }

        if action == ThreadAction::StepOut {
            if self
                .install_temporary_breakpoint(step, frame.return_address)
                .await
                .is_err()
            {
                return self.step_fallback(step).await;
            }
            step.step_mode = StepMode::Out;
            step.previous_instruction_pointer = address;
            step.previous_frame_address = frame.frame_address;
            return self.resume(step, false).await;
        }

        let statement = match self
            .ctx
            .team
            .read(|t| t.debug_info().statement_at_address(address))
        {
            Some((_, statement)) => Some(statement),
            None => read_instruction_info(self.ctx.architecture.as_ref(), self.ctx.memory.as_ref(), address)
                .await
                .ok()
                .map(|info| Statement::Instruction {
                    range: AddressRange::new(address, info.size as u64),
                }),
        };
        let Some(statement) = statement else {
            return self.step_fallback(step).await;
        };

        step.step_statement = Some(statement);
        step.previous_instruction_pointer = address;
        step.previous_frame_address = frame.frame_address;

        if action == ThreadAction::StepInto {
            step.step_mode = StepMode::Into;
            return self.resume(step, true).await;
        }

        step.step_mode = StepMode::Over;
        if self.do_step_over(step, address).await {
            Ok(())
        } else {
            self.step_fallback(step).await
        }
    }

    /// Steps over the instruction at `address`, treating calls as opaque.
    async fn do_step_over(&self, step: &mut StepState, address: TargetAddr) -> bool {
        let info = match read_instruction_info(self.ctx.architecture.as_ref(), self.ctx.memory.as_ref(), address).await
        {
            Ok(info) => info,
            Err(e) => {
                debug!("Thread {}: no instruction info at {:#x}: {}", self.thread, address, e);
                return false;
            }
        };

        if info.instruction_type == InstructionType::SubroutineCall {
            if self
                .install_temporary_breakpoint(step, info.next_address())
                .await
                .is_err()
            {
                return false;
            }
            return self.resume(step, false).await.is_ok();
        }
        self.resume(step, true).await.is_ok()
    }

    async fn handle_breakpoint_hit_step(&self, step: &mut StepState, cpu_state: Arc<CpuState>) -> bool {
        self.uninstall_temporary_breakpoint(step).await;
        let address = cpu_state.instruction_pointer;
        let frame_address = self.frame_address(&cpu_state).await;

        match step.step_mode {
            StepMode::Over => {
                if frame_address != step.previous_frame_address {
                    // A recursive call came back here first.
                    return self.rearm(step, cpu_state).await;
                }
                if step
                    .step_statement
                    .as_ref()
                    .is_some_and(|s| s.contains_address(address))
                {
                    if self.do_step_over(step, address).await {
                        return true;
                    }
                    return self.step_fallback(step).await.is_ok();
                }
                self.stop(step, Some(cpu_state), StoppedReason::SingleStep, String::new())
                    .await
            }
            StepMode::Out => {
                let direction = self.ctx.architecture.stack_growth_direction();
                if !direction.has_exited(step.previous_frame_address, frame_address) {
                    return self.rearm(step, cpu_state).await;
                }
                self.stop(step, Some(cpu_state), StoppedReason::SingleStep, String::new())
                    .await
            }
            _ => {
                self.stop(step, Some(cpu_state), StoppedReason::SingleStep, String::new())
                    .await
            }
        }
    }

    async fn handle_single_step_step(&self, step: &mut StepState, cpu_state: Arc<CpuState>) -> bool {
        step.single_stepping = false;
        let address = cpu_state.instruction_pointer;
        let in_statement = step
            .step_statement
            .as_ref()
            .is_some_and(|s| s.contains_address(address));

        match step.step_mode {
            StepMode::Into if in_statement => {
                if self.resume(step, true).await.is_ok() {
                    return true;
                }
            }
            StepMode::Over if in_statement => {
                if self.do_step_over(step, address).await {
                    return true;
                }
            }
            _ => {}
        }
        self.stop(step, Some(cpu_state), StoppedReason::SingleStep, String::new())
            .await
    }

    /// Puts the temporary breakpoint back at the current address and runs.
    async fn rearm(&self, step: &mut StepState, cpu_state: Arc<CpuState>) -> bool {
        let address = cpu_state.instruction_pointer;
        if self.install_temporary_breakpoint(step, address).await.is_ok() && self.resume(step, false).await.is_ok() {
            return true;
        }
        self.stop(step, Some(cpu_state), StoppedReason::SingleStep, String::new())
            .await
    }

    async fn step_fallback(&self, step: &mut StepState) -> DebuggerResult<()> {
        debug!("Thread {}: falling back to a single step", self.thread);
        self.uninstall_temporary_breakpoint(step).await;
        step.step_mode = StepMode::None;
        step.step_statement = None;
        self.resume(step, true).await
    }

    async fn run_to(&self, step: &mut StepState, address: TargetAddr) -> DebuggerResult<()> {
        self.clear_continuation(step).await;
        self.install_temporary_breakpoint(step, address).await?;
        step.step_mode = StepMode::Until;
        self.resume(step, false).await
    }

    async fn set_address(&self, address: TargetAddr) -> DebuggerResult<()> {
        let cpu_state = self
            .current_cpu_state()
            .await
            .ok_or_else(|| DebuggerError::InvalidState(format!("no CPU state for thread {}", self.thread)))?;
        let updated = cpu_state.with_instruction_pointer(address);
        self.ctx.interface.set_cpu_state(self.thread, &updated).await?;
        self.ctx.team.with(|t| {
            let (reason, info) = t
                .thread(self.thread)
                .map(|th| (th.stopped_reason(), th.stopped_reason_info().to_string()))
                .unwrap_or_default();
            t.set_thread_state(self.thread, ThreadState::Stopped, Some(Arc::new(updated)), reason, info);
        });
        Ok(())
    }

    // Helpers

    fn set_running(&self) {
        self.ctx.team.with(|t| {
            t.set_thread_state(
                self.thread,
                ThreadState::Running,
                None,
                StoppedReason::Unknown,
                String::new(),
            )
        });
    }

    async fn resume(&self, step: &mut StepState, single_step: bool) -> DebuggerResult<()> {
        let previous = self.ctx.team.read(|t| {
            t.thread(self.thread).map(|th| {
                (
                    th.cpu_state().cloned(),
                    th.stopped_reason(),
                    th.stopped_reason_info().to_string(),
                )
            })
        });
        self.set_running();
        step.single_stepping = single_step;
        let result = if single_step {
            self.ctx.interface.single_step_thread(self.thread).await
        } else {
            self.ctx.interface.continue_thread(self.thread).await
        };
        if let Err(e) = &result {
            warn!("Failed to resume thread {}: {}", self.thread, e);
            step.single_stepping = false;
            // Still stopped on the target.
            if let Some((cpu_state, reason, info)) = previous {
                self.ctx.team.with(|t| {
                    t.set_thread_state(self.thread, ThreadState::Stopped, cpu_state, reason, info)
                });
            }
        }
        result
    }

    /// Publishes the stop and forgets any step in progress.
    async fn stop(
        &self,
        step: &mut StepState,
        cpu_state: Option<Arc<CpuState>>,
        reason: StoppedReason,
        info: String,
    ) -> bool {
        self.clear_continuation(step).await;

        let cpu_state = match cpu_state {
            Some(cpu_state) => Some(cpu_state),
            None => match self.ctx.interface.get_cpu_state(self.thread).await {
                Ok(cpu_state) => Some(Arc::new(cpu_state)),
                Err(e) => {
                    debug!("Thread {} stopped without CPU state: {}", self.thread, e);
                    None
                }
            },
        };

        info!("Thread {} stopped: {:?} {}", self.thread, reason, info);
        self.ctx
            .team
            .with(|t| t.set_thread_state(self.thread, ThreadState::Stopped, cpu_state, reason, info));
        true
    }

    async fn clear_continuation(&self, step: &mut StepState) {
        self.uninstall_temporary_breakpoint(step).await;
        step.step_mode = StepMode::None;
        step.step_statement = None;
        step.single_stepping = false;
    }

    async fn install_temporary_breakpoint(&self, step: &mut StepState, address: TargetAddr) -> DebuggerResult<()> {
        self.uninstall_temporary_breakpoint(step).await;
        self.ctx
            .breakpoint_manager
            .install_temporary_breakpoint(address, self.client)
            .await
            .inspect_err(|e| warn!("Thread {}: temporary breakpoint at {:#x}: {}", self.thread, address, e))?;
        step.temporary_breakpoint = Some(address);
        Ok(())
    }

    async fn uninstall_temporary_breakpoint(&self, step: &mut StepState) {
        let Some(address) = step.temporary_breakpoint.take() else {
            return;
        };
        if let Err(e) = self
            .ctx
            .breakpoint_manager
            .uninstall_temporary_breakpoint(address, self.client)
            .await
        {
            warn!("Thread {}: failed to remove temporary breakpoint at {:#x}: {}", self.thread, address, e);
        }
    }

    async fn current_cpu_state(&self) -> Option<Arc<CpuState>> {
        let published = self
            .ctx
            .team
            .read(|t| t.thread(self.thread).and_then(|th| th.cpu_state().cloned()));
        if published.is_some() {
            return published;
        }
        match self.ctx.interface.get_cpu_state(self.thread).await {
            Ok(cpu_state) => {
                let cpu_state = Arc::new(cpu_state);
                self.ctx
                    .team
                    .with(|t| t.set_thread_cpu_state(self.thread, Some(cpu_state.clone())));
                Some(cpu_state)
            }
            Err(e) => {
                debug!("No CPU state for thread {}: {}", self.thread, e);
                None
            }
        }
    }

    async fn top_frame(&self, cpu_state: &Arc<CpuState>) -> Option<StackFrame> {
        match self
            .ctx
            .architecture
            .create_stack_trace(self.ctx.memory.as_ref(), cpu_state.clone(), 1)
            .await
        {
            Ok(trace) => trace.frame_at(0).cloned(),
            Err(e) => {
                debug!("Thread {}: cannot unwind: {}", self.thread, e);
                None
            }
        }
    }

    async fn frame_address(&self, cpu_state: &Arc<CpuState>) -> TargetAddr {
        self.top_frame(cpu_state)
            .await
            .map(|frame| frame.frame_address)
            .unwrap_or(cpu_state.frame_pointer)
    }

    /// Evaluates the breakpoint's condition. Anything but a definite false
    /// stops the thread.
    async fn condition_holds(&self, user_breakpoint: &UserBreakpoint, cpu_state: &Arc<CpuState>) -> bool {
        let Some(condition) = user_breakpoint.condition() else {
            return true;
        };
        let address = cpu_state.instruction_pointer;
        let Some(language) = self
            .ctx
            .team
            .read(|t| t.debug_info().language_for_address(address))
        else {
            warn!("No language to evaluate '{}' at {:#x}", condition, address);
            self.ctx.user_interface.notify_user(
                "Breakpoint condition",
                &format!("Cannot evaluate '{}': no source language at {:#x}", condition, address),
                NotificationSeverity::Warning,
            );
            return true;
        };

        let context = EvaluationContext {
            team: self.ctx.team.clone(),
            thread: Some(self.thread),
            cpu_state: Some(cpu_state.clone()),
            frame: self.top_frame(cpu_state).await,
            memory: self.ctx.memory.clone(),
            architecture: self.ctx.architecture.clone(),
        };
        let job = Arc::new(ExpressionEvaluationJob::new(language, condition.clone(), context));
        let key = job.key();
        if let Err(e) = self.ctx.worker.schedule_job(job.clone(), self.ctx.job_listener.clone()) {
            warn!("Failed to schedule condition evaluation: {}", e);
            return true;
        }

        let waited = tokio::time::timeout(self.ctx.config.condition_timeout(), self.ctx.worker.wait_for(key)).await;
        if waited.is_err() {
            self.ctx.worker.abort_job(key);
            warn!("Condition '{}' timed out", condition);
            return true;
        }

        match job.take_result() {
            Some(Ok(ExpressionResult::Primitive(value))) => match value.to_bool() {
                Some(holds) => holds,
                None => self.non_boolean_condition(&condition, &value.to_string()),
            },
            Some(Ok(other)) => self.non_boolean_condition(&condition, &other.describe()),
            Some(Err(e)) => {
                info!("Condition '{}' failed to evaluate: {}", condition, e);
                true
            }
            None => true,
        }
    }

    fn non_boolean_condition(&self, condition: &str, result: &str) -> bool {
        warn!("Condition '{}' is not a boolean: {}", condition, result);
        self.ctx.user_interface.notify_user(
            "Breakpoint condition",
            &format!("'{}' evaluated to {}, which is not a boolean", condition, result),
            NotificationSeverity::Warning,
        );
        true
    }

    fn schedule(&self, job: Arc<dyn Job>) {
        match self.ctx.worker.schedule_job(job, self.ctx.job_listener.clone()) {
            Ok(()) | Err(DebuggerError::AlreadyInProgress(_)) => {}
            Err(e) => debug!("Thread {}: failed to schedule job: {}", self.thread, e),
        }
    }
}

/// Work items for a thread handler's queue.
pub enum ThreadMessage {
    Event(DebugEvent),
    Action {
        action: ThreadAction,
        address: Option<TargetAddr>,
        reply: Option<oneshot::Sender<DebuggerResult<()>>>,
    },
    /// Stop the thread for a controller level reason, e.g. an image load.
    Debugged { reason: String },
    SetBreakpointAndRun(TargetAddr),
    Continue,
}

/// Runs the handler's queue until all senders are gone.
pub fn spawn_thread_handler(handler: Arc<ThreadHandler>) -> mpsc::UnboundedSender<ThreadMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                ThreadMessage::Event(event) => {
                    let handled = handler.handle_event(&event).await;
                    if !handled && event.thread_stopped {
                        handler.continue_thread().await;
                    }
                }
                ThreadMessage::Action { action, address, reply } => {
                    let result = handler.handle_thread_action(action, address).await;
                    if let Err(e) = &result {
                        debug!("Thread {}: {:?} failed: {}", handler.thread_id(), action, e);
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                ThreadMessage::Debugged { reason } => {
                    handler.handle_thread_debugged(None, reason).await;
                }
                ThreadMessage::SetBreakpointAndRun(address) => {
                    if let Err(e) = handler.set_breakpoint_and_run(address).await {
                        warn!("Thread {}: cannot run to {:#x}: {}", handler.thread_id(), address, e);
                        handler.continue_thread().await;
                    }
                }
                ThreadMessage::Continue => handler.continue_thread().await,
            }
        }
        handler.release().await;
        debug!("Thread handler {} finished", handler.thread_id());
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::NoOpSettingsManager;
    use crate::sim::{debugger_setup, Program, ProgramBuilder, RecordingUserInterface, SimulatedTarget, SYS_WRITE};
    use crate::team_debugger::TeamDebugger;
    use crate::types::WatchpointType;
    use crate::worker::{JobContext, JobKey, JobState};
    use async_trait::async_trait;
    use std::time::Duration;

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn config() -> DebuggerConfig {
        DebuggerConfig {
            max_concurrent_jobs: 2,
            condition_timeout_ms: 2000,
            ..Default::default()
        }
    }

    struct Fixture {
        program: Program,
        target: Arc<SimulatedTarget>,
        debugger: Arc<TeamDebugger>,
        thread: ThreadId,
    }

    impl Fixture {
        async fn launch(program: Program, config: DebuggerConfig) -> Self {
            let target = SimulatedTarget::launch(program.clone());
            let ui = Arc::new(RecordingUserInterface::new());
            let setup = debugger_setup(&target, ui, Arc::new(NoOpSettingsManager));
            let debugger = TeamDebugger::init(setup, config).await.unwrap();
            let fixture = Self {
                thread: target.main_thread(),
                program,
                target,
                debugger,
            };
            let main = fixture.symbol("main");
            fixture.wait_for_stop(StoppedReason::Breakpoint).await;
            assert_eq!(fixture.instruction_pointer(), main);
            wait_until("debug info", || {
                fixture
                    .debugger
                    .team()
                    .read(|t| t.images().all(|image| image.debug_info_state().is_final()))
            })
            .await;
            fixture
        }

        fn symbol(&self, name: &str) -> TargetAddr {
            self.program.symbol(name).unwrap()
        }

        fn stop(&self) -> Option<(StoppedReason, String, TargetAddr)> {
            self.debugger.team().read(|t| {
                let thread = t.thread(self.thread)?;
                if thread.state() != ThreadState::Stopped {
                    return None;
                }
                Some((
                    thread.stopped_reason(),
                    thread.stopped_reason_info().to_string(),
                    thread.cpu_state()?.instruction_pointer,
                ))
            })
        }

        fn instruction_pointer(&self) -> TargetAddr {
            self.stop().map(|(_, _, ip)| ip).unwrap()
        }

        /// Returns the reason info of the stop.
        async fn wait_for_stop(&self, reason: StoppedReason) -> String {
            wait_until(&format!("{:?} stop", reason), || {
                self.stop().is_some_and(|(r, _, _)| r == reason)
            })
            .await;
            self.stop().map(|(_, info, _)| info).unwrap()
        }

        async fn act(&self, action: ThreadAction, address: Option<TargetAddr>) -> DebuggerResult<()> {
            self.debugger.thread_action(self.thread, action, address).await
        }
    }

    #[tokio::test]
    async fn test_stop_running_thread() {
        let mut builder = ProgramBuilder::new("spin", 0x1000);
        builder.function("main").line(1).enter();
        builder.label("spin").line(2).nop().jmp("spin");
        let f = Fixture::launch(builder.build().unwrap(), config()).await;

        assert!(matches!(
            f.act(ThreadAction::Stop, None).await,
            Err(DebuggerError::InvalidState(_))
        ));

        f.act(ThreadAction::Run, None).await.unwrap();
        assert_eq!(f.debugger.team().thread_state(f.thread), Some(ThreadState::Running));

        f.act(ThreadAction::Stop, None).await.unwrap();
        f.wait_for_stop(StoppedReason::Debugged).await;
        let pending = f
            .debugger
            .team()
            .read(|t| t.thread(f.thread).map(|th| th.stop_request_pending()));
        assert_eq!(pending, Some(false));
        let ip = f.instruction_pointer();
        assert!(ip > f.symbol("main") && ip < f.symbol("spin") + 3);
    }

    #[tokio::test]
    async fn test_pending_stop_lands_on_syscall_return() {
        let mut builder = ProgramBuilder::new("write", 0x1000);
        let message = builder.data("message", b"hi\n");
        builder.function("main").line(1).enter();
        builder.line(2).mov(0, 1).mov(1, message as u32).mov(2, 3).syscall(SYS_WRITE);
        builder.line(3).nop();
        builder.line(4).leave().ret();
        let f = Fixture::launch(builder.build().unwrap(), config()).await;
        let after_syscall = f.symbol("main") + 1 + 6 * 3 + 2;

        f.debugger
            .team()
            .with(|t| t.set_stop_request_pending(f.thread, true));
        f.act(ThreadAction::Run, None).await.unwrap();
        f.wait_for_stop(StoppedReason::Debugged).await;
        assert_eq!(f.instruction_pointer(), after_syscall);

        wait_until("stack trace", || {
            f.debugger
                .team()
                .thread_snapshot(f.thread)
                .is_some_and(|th| th.stack_trace().is_some())
        })
        .await;
        let top = f.debugger.team().thread_snapshot(f.thread).and_then(|th| {
            th.stack_trace()
                .and_then(|trace| trace.frame_at(0).map(|frame| frame.frame_type))
        });
        assert_eq!(top, Some(StackFrameType::Syscall));

        // Stepping out of the syscall ends back in user code.
        f.act(ThreadAction::StepOver, None).await.unwrap();
        f.wait_for_stop(StoppedReason::SingleStep).await;
        assert_eq!(f.instruction_pointer(), after_syscall + 1);
        assert_eq!(f.debugger.team().count_breakpoints(), 0);
    }

    #[tokio::test]
    async fn test_set_address() {
        let mut builder = ProgramBuilder::new("jump", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).nop();
        builder.line(3).nop();
        builder.line(4).leave().ret();
        let f = Fixture::launch(builder.build().unwrap(), config()).await;
        let line3 = f.symbol("main") + 2;

        assert!(f.act(ThreadAction::SetAddress, None).await.is_err());
        f.act(ThreadAction::SetAddress, Some(line3)).await.unwrap();
        assert_eq!(f.instruction_pointer(), line3);
        assert_eq!(f.stop().map(|(reason, _, _)| reason), Some(StoppedReason::Breakpoint));

        f.act(ThreadAction::StepOver, None).await.unwrap();
        f.wait_for_stop(StoppedReason::SingleStep).await;
        assert_eq!(f.instruction_pointer(), line3 + 1);
    }

    #[tokio::test]
    async fn test_watchpoint_hit_stops() {
        let mut builder = ProgramBuilder::new("watch", 0x1000);
        let counter = builder.data("counter", &[0; 8]);
        builder.function("main").line(1).enter();
        builder.line(2).mov(0, 7).store(0, counter as u32);
        builder.line(3).leave().ret();
        let f = Fixture::launch(builder.build().unwrap(), config()).await;

        f.debugger
            .set_watchpoint(counter, WatchpointType::Write, 8, true)
            .await
            .unwrap();
        f.act(ThreadAction::Run, None).await.unwrap();
        f.wait_for_stop(StoppedReason::Watchpoint).await;
        assert_eq!(f.instruction_pointer(), f.symbol("main") + 1 + 6 + 6);
    }

    #[tokio::test]
    async fn test_debugger_call_reports_message() {
        let mut builder = ProgramBuilder::new("call", 0x1000);
        builder.data("greeting", b"hi there\0");
        builder.function("main").line(1).enter();
        builder.line(2).mov_address(0, "greeting").debugger();
        builder.line(3).leave().ret();
        let f = Fixture::launch(builder.build().unwrap(), config()).await;

        f.act(ThreadAction::Run, None).await.unwrap();
        let info = f.wait_for_stop(StoppedReason::DebuggerCall).await;
        assert_eq!(info, "hi there");
    }

    #[tokio::test]
    async fn test_exception_stops_at_faulting_instruction() {
        let mut builder = ProgramBuilder::new("crash", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).nop().fault();
        builder.line(3).leave().ret();
        let f = Fixture::launch(builder.build().unwrap(), config()).await;

        f.act(ThreadAction::Run, None).await.unwrap();
        let info = f.wait_for_stop(StoppedReason::Exception).await;
        assert_eq!(info, "general protection fault");
        assert_eq!(f.instruction_pointer(), f.symbol("main") + 2);
    }

    /// Holds a worker slot until aborted.
    struct SlotHog;

    #[async_trait]
    impl Job for SlotHog {
        fn key(&self) -> JobKey {
            JobKey::new(0, JobType::Custom(1))
        }

        async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
            loop {
                ctx.check_aborted()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[tokio::test]
    async fn test_condition_timeout_stops() {
        let mut builder = ProgramBuilder::new("slow", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).mov(0, 1);
        builder.line(3).nop();
        builder.line(4).leave().ret();
        let config = DebuggerConfig {
            max_concurrent_jobs: 1,
            condition_timeout_ms: 100,
            ..Default::default()
        };
        let f = Fixture::launch(builder.build().unwrap(), config).await;
        let line3 = f.symbol("main") + 1 + 6;

        // The evaluation can't get a slot, so it never answers in time.
        let worker = f.debugger.worker();
        worker.schedule_job(Arc::new(SlotHog), None).unwrap();
        let hog = SlotHog.key();
        wait_until("busy worker", || worker.job_state(hog) == Some(JobState::Active)).await;

        let breakpoint = f.debugger.set_breakpoint(line3, true).await.unwrap();
        f.debugger
            .set_breakpoint_condition(&breakpoint, Some("r0 == 99".to_string()));
        f.act(ThreadAction::Run, None).await.unwrap();

        wait_until("stop at line 3", || f.stop().is_some_and(|(_, _, ip)| ip == line3)).await;
        assert_eq!(f.stop().map(|(reason, _, _)| reason), Some(StoppedReason::Breakpoint));
        worker.abort_job(hog);
    }

    #[tokio::test]
    async fn test_failed_resume_keeps_thread_stopped() {
        let mut builder = ProgramBuilder::new("stuck", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).nop();
        builder.line(3).leave().ret();
        let f = Fixture::launch(builder.build().unwrap(), config()).await;
        let main = f.symbol("main");

        f.target.fail_resumes(true);
        assert!(f.act(ThreadAction::Run, None).await.is_err());
        assert!(f.act(ThreadAction::StepInto, None).await.is_err());
        assert_eq!(f.stop().map(|(reason, _, ip)| (reason, ip)), Some((StoppedReason::Breakpoint, main)));

        f.target.fail_resumes(false);
        f.act(ThreadAction::StepInto, None).await.unwrap();
        f.wait_for_stop(StoppedReason::SingleStep).await;
        assert_eq!(f.instruction_pointer(), main + 1);
    }
}
