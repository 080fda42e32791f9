// Team debugger controller
//
// Owns the worker, the breakpoint and watchpoint managers and one thread
// handler per live thread. Debug events, team model changes and job
// completions are funneled through a single message loop; user requests are
// plain async methods.

use crate::architecture::Architecture;
use crate::breakpoint::{UserBreakpoint, UserBreakpointLocation};
use crate::breakpoint_manager::BreakpointManager;
use crate::config::DebuggerConfig;
use crate::debug_info::ImageDebugInfoProvider;
use crate::error::{DebuggerError, DebuggerResult};
use crate::eventloop::{spawn_event_loop, EventLoopHandle};
use crate::events::{DebugEvent, DebugEventKind, SyscallInfo, SYSCALL_WRITE};
use crate::image::{ImageInfo, ImageType};
use crate::interface::{DebuggerInterface, TeamMemory};
use crate::jobs::{
    ExpressionEvaluationJob, GenerateReportJob, LoadImageDebugInfoJob, ResolveValueNodeValueJob,
    RetrieveMemoryBlockJob, WriteMemoryJob, WriteValueNodeValueJob,
};
use crate::language::EvaluationContext;
use crate::memory_block::{TeamMemoryBlock, TeamMemoryBlockListener, TeamMemoryBlockManager};
use crate::settings::{BreakpointSetting, SettingsManager, TeamSettings};
use crate::team::{Team, TeamEvent, TeamListener};
use crate::thread::ThreadInfo;
use crate::thread_handler::{spawn_thread_handler, ThreadHandler, ThreadHandlerContext, ThreadMessage};
use crate::types::{
    ImageId, NotificationSeverity, SignalDisposition, TargetAddr, ThreadAction, ThreadId, WatchpointType,
};
use crate::user_interface::{TeamDebuggerListener, UserInterface};
use crate::value::{Value, ValueNodeContainer, ValueNodeId};
use crate::watchpoint_manager::WatchpointManager;
use crate::worker::{Job, JobKey, JobListener, Worker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Initializing,
    Running,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitOption {
    AskUser,
    KillTeam,
    ResumeTeam,
}

/// Messages processed by the controller loop, one at a time.
#[derive(Debug)]
pub enum ControllerMessage {
    DebugEvent(DebugEvent),
    DebugPortClosed(String),
    ImageDebugInfoChanged(ImageId),
    ThreadStateChanged(ThreadId),
    ThreadCpuStateChanged(ThreadId),
    JobFinished(JobKey),
    Shutdown,
}

/// Collaborators a controller is built from.
pub struct TeamDebuggerSetup {
    pub interface: Arc<dyn DebuggerInterface>,
    pub memory: Arc<dyn TeamMemory>,
    pub debug_info_provider: Arc<dyn ImageDebugInfoProvider>,
    pub user_interface: Arc<dyn UserInterface>,
    pub settings: Arc<dyn SettingsManager>,
    pub listener: Arc<dyn TeamDebuggerListener>,
    /// The team was started by us rather than attached to
    pub launched: bool,
}

struct HandlerEntry {
    handler: Arc<ThreadHandler>,
    sender: mpsc::UnboundedSender<ThreadMessage>,
}

pub struct TeamDebugger {
    team: Arc<Team>,
    interface: Arc<dyn DebuggerInterface>,
    memory: Arc<dyn TeamMemory>,
    architecture: Arc<dyn Architecture>,
    worker: Worker,
    breakpoint_manager: Arc<BreakpointManager>,
    watchpoint_manager: WatchpointManager,
    memory_blocks: Arc<TeamMemoryBlockManager>,
    debug_info_provider: Arc<dyn ImageDebugInfoProvider>,
    user_interface: Arc<dyn UserInterface>,
    settings: Arc<dyn SettingsManager>,
    listener: Arc<dyn TeamDebuggerListener>,
    job_listener: Arc<dyn JobListener>,
    handler_context: Arc<ThreadHandlerContext>,
    config: DebuggerConfig,
    launched: bool,
    lifecycle: Mutex<Lifecycle>,
    thread_handlers: Mutex<HashMap<ThreadId, HandlerEntry>>,
    image_info_pending_threads: Mutex<HashMap<ImageId, ThreadId>>,
    exec_pending: AtomicBool,
    team_gone: AtomicBool,
    controller_tx: mpsc::UnboundedSender<ControllerMessage>,
    event_loop: Mutex<Option<EventLoopHandle>>,
    team_listener: Mutex<Option<Arc<dyn TeamListener>>>,
}

/// Forwards the team events the controller reacts to.
struct ControllerTeamListener {
    tx: mpsc::UnboundedSender<ControllerMessage>,
}

impl TeamListener for ControllerTeamListener {
    fn team_event(&self, event: &TeamEvent) {
        let message = match event {
            TeamEvent::ImageDebugInfoChanged(id) => ControllerMessage::ImageDebugInfoChanged(*id),
            TeamEvent::ThreadStateChanged(id) => ControllerMessage::ThreadStateChanged(*id),
            TeamEvent::ThreadCpuStateChanged(id) => ControllerMessage::ThreadCpuStateChanged(*id),
            _ => return,
        };
        let _ = self.tx.send(message);
    }
}

/// Reports job progress as background status.
struct ControllerJobListener {
    tx: mpsc::UnboundedSender<ControllerMessage>,
    user_interface: Arc<dyn UserInterface>,
}

impl JobListener for ControllerJobListener {
    fn job_started(&self, _key: JobKey, description: &str) {
        self.user_interface
            .notify_background_work_status(&format!("{}...", description));
    }

    fn job_done(&self, key: JobKey) {
        let _ = self.tx.send(ControllerMessage::JobFinished(key));
    }

    fn job_failed(&self, key: JobKey, error: &DebuggerError) {
        debug!("Job {} failed: {}", key, error);
        let _ = self.tx.send(ControllerMessage::JobFinished(key));
    }

    fn job_aborted(&self, key: JobKey) {
        let _ = self.tx.send(ControllerMessage::JobFinished(key));
    }

    fn job_waiting_for_input(&self, key: JobKey) {
        self.user_interface
            .notify_background_work_status(&format!("Waiting for input ({})", key));
    }
}

impl TeamDebugger {
    /// Builds the team model from the target, starts the event listener and
    /// the controller loop.
    pub async fn init(setup: TeamDebuggerSetup, config: DebuggerConfig) -> DebuggerResult<Arc<Self>> {
        let TeamDebuggerSetup {
            interface,
            memory,
            debug_info_provider,
            user_interface,
            settings,
            listener,
            launched,
        } = setup;

        let team_info = interface.get_team_info().await?;
        info!("Debugging team {} ({})", team_info.team_id, team_info.name);

        let team = Arc::new(Team::new(team_info.team_id, team_info.name.clone()));
        let architecture = interface.architecture();
        let worker = Worker::new(config.max_concurrent_jobs);
        let (controller_tx, controller_rx) = mpsc::unbounded_channel();

        let job_listener: Arc<dyn JobListener> = Arc::new(ControllerJobListener {
            tx: controller_tx.clone(),
            user_interface: user_interface.clone(),
        });
        let breakpoint_manager = Arc::new(BreakpointManager::new(team.clone(), interface.clone()));
        let handler_context = Arc::new(ThreadHandlerContext {
            team: team.clone(),
            interface: interface.clone(),
            memory: memory.clone(),
            architecture: architecture.clone(),
            worker: worker.clone(),
            breakpoint_manager: breakpoint_manager.clone(),
            debug_info_provider: debug_info_provider.clone(),
            user_interface: user_interface.clone(),
            job_listener: Some(job_listener.clone()),
            config: config.clone(),
        });

        let debugger = Arc::new(TeamDebugger {
            team: team.clone(),
            interface: interface.clone(),
            memory,
            architecture,
            worker,
            breakpoint_manager,
            watchpoint_manager: WatchpointManager::new(team.clone(), interface.clone()),
            memory_blocks: Arc::new(TeamMemoryBlockManager::new()),
            debug_info_provider,
            user_interface,
            settings,
            listener,
            job_listener,
            handler_context,
            config,
            launched,
            lifecycle: Mutex::new(Lifecycle::Initializing),
            thread_handlers: Mutex::new(HashMap::new()),
            image_info_pending_threads: Mutex::new(HashMap::new()),
            exec_pending: AtomicBool::new(false),
            team_gone: AtomicBool::new(false),
            controller_tx: controller_tx.clone(),
            event_loop: Mutex::new(None),
            team_listener: Mutex::new(None),
        });

        let team_listener: Arc<dyn TeamListener> = Arc::new(ControllerTeamListener {
            tx: controller_tx.clone(),
        });
        team.add_listener(team_listener.clone());
        *debugger.team_listener.lock() = Some(team_listener);

        // Threads first, so the handlers exist when the first event arrives.
        let threads = interface.get_thread_infos().await?;
        team.with(|t| {
            for info in &threads {
                t.add_thread(info, info.thread_id == team_info.team_id);
            }
        });
        for info in &threads {
            debugger.add_thread_handler(info.thread_id);
        }
        let main_thread = threads
            .iter()
            .find(|info| info.thread_id == team_info.team_id)
            .or_else(|| threads.first())
            .map(|info| info.thread_id);

        let images = interface.get_image_infos().await?;
        let mut app_image = None;
        for info in images {
            if info.image_type == ImageType::App {
                app_image = Some(info.image_id);
            }
            let image_id = info.image_id;
            team.with(|t| t.add_image(info));
            debugger.request_image_debug_info(image_id);
        }

        debugger.load_settings().await;

        if !interface.is_post_mortem() {
            *debugger.event_loop.lock() = Some(spawn_event_loop(interface.clone(), controller_tx));
        }
        tokio::spawn(debugger.clone().run(controller_rx));
        *debugger.lifecycle.lock() = Lifecycle::Running;

        if launched && !interface.is_post_mortem() {
            if let Some(thread) = main_thread {
                debugger.start_main_thread(thread, app_image).await;
            }
        }

        debugger.listener.team_debugger_started();
        Ok(debugger)
    }

    async fn start_main_thread(&self, thread: ThreadId, app_image: Option<ImageId>) {
        if !self.config.stop_in_main {
            self.post_to_thread(
                thread,
                ThreadMessage::Debugged {
                    reason: String::new(),
                },
            );
            return;
        }
        let Some(image) = app_image else {
            warn!("No app image, not stopping in main");
            return;
        };
        match self.interface.get_symbol_address(image, "main").await {
            Ok(address) => {
                self.post_to_thread(thread, ThreadMessage::SetBreakpointAndRun(address));
            }
            Err(e) => warn!("Cannot stop in main: {}", e),
        }
    }

    pub fn team(&self) -> &Arc<Team> {
        &self.team
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn thread_handler(&self, thread: ThreadId) -> Option<Arc<ThreadHandler>> {
        self.thread_handlers
            .lock()
            .get(&thread)
            .map(|entry| entry.handler.clone())
    }

    // Controller loop

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ControllerMessage>) {
        debug!("Controller loop started for team {}", self.team.id());
        while let Some(message) = rx.recv().await {
            match message {
                ControllerMessage::DebugEvent(event) => self.handle_debug_event(event).await,
                ControllerMessage::DebugPortClosed(reason) => {
                    // Expected once the team is gone or we are shutting down.
                    if self.lifecycle() != Lifecycle::Terminating && !self.team_gone.load(Ordering::SeqCst) {
                        warn!("Debug port of team {} closed: {}", self.team.id(), reason);
                        self.user_interface.notify_user(
                            "Debug connection lost",
                            &format!("Lost the debug connection to team {}: {}", self.team.id(), reason),
                            NotificationSeverity::Error,
                        );
                        self.handle_team_deleted();
                    }
                }
                ControllerMessage::ImageDebugInfoChanged(image) => self.image_debug_info_changed(image).await,
                ControllerMessage::ThreadStateChanged(thread) => {
                    if let Some(handler) = self.thread_handler(thread) {
                        handler.handle_thread_state_changed();
                    }
                }
                ControllerMessage::ThreadCpuStateChanged(thread) => {
                    if let Some(handler) = self.thread_handler(thread) {
                        handler.handle_cpu_state_changed();
                    }
                }
                ControllerMessage::JobFinished(_) => {
                    if !self.worker.has_pending_jobs() {
                        self.user_interface.notify_background_work_status("Ready.");
                    }
                }
                ControllerMessage::Shutdown => break,
            }
        }
        debug!("Controller loop of team {} finished", self.team.id());
    }

    async fn handle_debug_event(self: &Arc<Self>, event: DebugEvent) {
        if self.lifecycle() == Lifecycle::Terminating {
            debug!("Dropping {} event while terminating", event.name());
            return;
        }
        if event.team != self.team.id() {
            warn!("Event for foreign team {} ignored", event.team);
            return;
        }

        if event.is_thread_event() {
            let sender = self
                .thread_handlers
                .lock()
                .get(&event.thread)
                .map(|entry| entry.sender.clone());
            match sender {
                Some(sender) => {
                    if let Err(returned) = sender.send(ThreadMessage::Event(event)) {
                        if let ThreadMessage::Event(event) = returned.0 {
                            self.continue_unhandled(&event).await;
                        }
                    }
                }
                None => {
                    warn!("No handler for thread {}, {} event passed through", event.thread, event.name());
                    self.continue_unhandled(&event).await;
                }
            }
            return;
        }

        let handled = match &event.kind {
            DebugEventKind::TeamDeleted => {
                self.handle_team_deleted();
                true
            }
            DebugEventKind::TeamExec => {
                self.prepare_for_team_exec().await;
                false
            }
            DebugEventKind::ThreadCreated { new_thread } => {
                self.handle_thread_created(new_thread).await;
                false
            }
            DebugEventKind::ThreadRenamed { name } => {
                self.team.with(|t| t.set_thread_name(event.thread, name.clone()));
                false
            }
            DebugEventKind::ThreadPriorityChanged { priority } => {
                self.team
                    .with(|t| t.set_thread_priority(event.thread, *priority));
                false
            }
            DebugEventKind::ThreadDeleted => {
                self.handle_thread_deleted(event.thread);
                false
            }
            DebugEventKind::ImageCreated { image } => self.handle_image_created(event.thread, image),
            DebugEventKind::ImageDeleted { image } => {
                self.handle_image_deleted(image).await;
                false
            }
            DebugEventKind::PostSyscall { syscall } => self.handle_post_syscall(event.thread, syscall).await,
            _ => false,
        };

        if !handled {
            self.continue_unhandled(&event).await;
        }
    }

    async fn continue_unhandled(&self, event: &DebugEvent) {
        if !event.thread_stopped {
            return;
        }
        let sender = self
            .thread_handlers
            .lock()
            .get(&event.thread)
            .map(|entry| entry.sender.clone());
        let queued = sender.is_some_and(|sender| sender.send(ThreadMessage::Continue).is_ok());
        if !queued {
            if let Err(e) = self.interface.continue_thread(event.thread).await {
                debug!("Failed to continue thread {}: {}", event.thread, e);
            }
        }
    }

    fn handle_team_deleted(self: &Arc<Self>) {
        // Closing the interface ends the port too; ask only once.
        if self.team_gone.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Team {} terminated", self.team.id());
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.interface.close(false).await {
                debug!("Closing the debugger interface failed: {}", e);
            }

            let mut choices = vec!["Do nothing".to_string(), "Quit".to_string()];
            if this.launched {
                choices.push("Restart team".to_string());
            }
            let message = format!("Team {} has terminated.", this.team.id());
            let answer = this
                .user_interface
                .ask_user("Team terminated", &message, &choices)
                .await;
            match answer {
                Some(1) | None => this.terminate(this.config.kill_team_on_quit).await,
                Some(2) => {
                    this.save_settings();
                    this.listener.team_debugger_restart_requested();
                }
                _ => {}
            }
        });
    }

    /// The team's address space is about to be replaced. Everything tied to
    /// it goes; breakpoints come back from the settings once the new app
    /// image has its debug info.
    async fn prepare_for_team_exec(&self) {
        info!("Team {} exec'ed", self.team.id());
        self.save_settings();

        let images: Vec<ImageId> = self.team.read(|t| t.images().map(|image| image.id()).collect());
        for image in &images {
            if let Err(e) = self.breakpoint_manager.remove_image_breakpoints(*image).await {
                debug!("Removing breakpoints of image {}: {}", image, e);
            }
        }

        let user_breakpoints = self.team.read(|t| t.user_breakpoints().to_vec());
        for user_breakpoint in &user_breakpoints {
            if let Err(e) = self
                .breakpoint_manager
                .uninstall_user_breakpoint(user_breakpoint)
                .await
            {
                debug!("Removing user breakpoint {}: {}", user_breakpoint.id(), e);
            }
        }

        self.team.with(|t| {
            for image in &images {
                t.remove_image(*image);
            }
            t.clear_signal_dispositions();
        });
        self.image_info_pending_threads.lock().clear();
        self.memory_blocks.invalidate(0, usize::MAX);
        self.exec_pending.store(true, Ordering::SeqCst);
    }

    async fn handle_thread_created(&self, info: &ThreadInfo) {
        let info = match self.interface.get_thread_info(info.thread_id).await {
            Ok(info) => info,
            Err(e) => {
                debug!("No info for new thread {}: {}", info.thread_id, e);
                info.clone()
            }
        };
        debug!("Thread {} created ({})", info.thread_id, info.name);
        self.team.with(|t| t.add_thread(&info, false));
        self.add_thread_handler(info.thread_id);
    }

    fn handle_thread_deleted(&self, thread: ThreadId) {
        debug!("Thread {} deleted", thread);
        // Dropping the sender ends the handler's queue.
        self.thread_handlers.lock().remove(&thread);
        self.image_info_pending_threads
            .lock()
            .retain(|_, pending| *pending != thread);
        self.team.with(|t| t.remove_thread(thread));
    }

    /// Keeps the loading thread stopped until the image's debug info is in.
    fn handle_image_created(&self, thread: ThreadId, info: &ImageInfo) -> bool {
        debug!("Image {} created: {}", info.image_id, info.name);
        self.team.with(|t| t.add_image(info.clone()));
        self.image_info_pending_threads
            .lock()
            .insert(info.image_id, thread);
        self.request_image_debug_info(info.image_id);
        true
    }

    async fn handle_image_deleted(&self, info: &ImageInfo) {
        debug!("Image {} deleted: {}", info.image_id, info.name);
        if let Err(e) = self
            .breakpoint_manager
            .remove_image_breakpoints(info.image_id)
            .await
        {
            debug!("Removing breakpoints of image {}: {}", info.image_id, e);
        }
        self.image_info_pending_threads.lock().remove(&info.image_id);
        self.team.with(|t| t.remove_image(info.image_id));
    }

    async fn handle_post_syscall(&self, thread: ThreadId, syscall: &SyscallInfo) -> bool {
        let stop_requested = self.team.read(|t| {
            t.thread(thread)
                .is_some_and(|th| th.stop_request_pending())
        });
        if stop_requested {
            return self.post_to_thread(
                thread,
                ThreadMessage::Debugged {
                    reason: String::new(),
                },
            );
        }

        if syscall.syscall != SYSCALL_WRITE || syscall.return_value <= 0 {
            return false;
        }
        let (Some(fd), Some(buffer)) = (syscall.arguments.first(), syscall.arguments.get(1)) else {
            return false;
        };
        let fd = *fd as i32;
        if fd != 1 && fd != 2 {
            return false;
        }
        let size = (syscall.return_value as usize).min(self.config.max_debug_string_length);
        match self.memory.read_memory(*buffer, size).await {
            Ok(bytes) => {
                let output = String::from_utf8_lossy(&bytes).into_owned();
                self.team
                    .with(|t| t.notify_console_output_received(fd, output));
            }
            Err(e) => debug!("Failed to read console output at {:#x}: {}", buffer, e),
        }
        false
    }

    async fn image_debug_info_changed(&self, image_id: ImageId) {
        let Some((info, state)) = self.team.read(|t| {
            t.image(image_id)
                .map(|image| (image.info().clone(), image.debug_info_state()))
        }) else {
            self.image_info_pending_threads.lock().remove(&image_id);
            return;
        };

        let post_exec_setup = self.exec_pending.load(Ordering::SeqCst)
            && info.image_type == ImageType::App
            && state != crate::image::ImageDebugInfoState::Loading;
        // The settings must be in before the image's breakpoints are updated.
        if post_exec_setup {
            self.team.with(|t| t.set_name(info.name.clone()));
            self.load_settings().await;
            self.exec_pending.store(false, Ordering::SeqCst);
        }

        if !state.is_final() {
            return;
        }
        if let Err(e) = self
            .breakpoint_manager
            .update_image_breakpoints(image_id)
            .await
        {
            self.notify_user("Install Breakpoint", &format!("Failed to install breakpoint: {}", e));
        }

        let Some(thread) = self.image_info_pending_threads.lock().remove(&image_id) else {
            return;
        };

        let (stop_on_load, stop) = self.team.read(|t| {
            let listed = !t.stop_image_name_list_enabled()
                || t.stop_image_names().iter().any(|name| name == info.file_name());
            (t.stop_on_image_load(), t.stop_on_image_load() && listed)
        });
        if stop {
            let reason = format!("Image '{}' loaded.", info.file_name());
            self.post_to_thread(thread, ThreadMessage::Debugged { reason });
            return;
        }
        if !stop_on_load && post_exec_setup && self.config.stop_in_main {
            // After an exec the main breakpoint has to wait for the new app
            // image's symbols.
            match self.interface.get_symbol_address(image_id, "main").await {
                Ok(address) => {
                    self.post_to_thread(thread, ThreadMessage::SetBreakpointAndRun(address));
                    return;
                }
                Err(e) => warn!("Cannot stop in main after exec: {}", e),
            }
        }
        self.post_to_thread(thread, ThreadMessage::Continue);
    }

    // Breakpoints

    /// Sets (or re-enables) a user breakpoint at `address`. With debug info
    /// the breakpoint is bound to the function's source location and thus
    /// instantiated in every loaded instance of the function.
    pub async fn set_breakpoint(&self, address: TargetAddr, enabled: bool) -> DebuggerResult<Arc<UserBreakpoint>> {
        let user_breakpoint = self.team.read(|t| {
            if let Some(existing) = t.user_breakpoint_at(address) {
                return existing;
            }
            match t.debug_info().function_at_address(address) {
                Some(function) => {
                    let statement = function.statement_at_address(address);
                    let location = UserBreakpointLocation {
                        function_id: function.id.clone(),
                        source_file: function.source_file().map(str::to_string),
                        source_location: statement
                            .and_then(|s| s.start_source_location())
                            .unwrap_or_default(),
                        relative_address: address - function.address(),
                    };
                    UserBreakpoint::new_at(location, address)
                }
                None => UserBreakpoint::at_address(address),
            }
        });

        info!("Setting breakpoint {} at {:#x}", user_breakpoint.id(), address);
        if let Err(e) = self
            .breakpoint_manager
            .install_user_breakpoint(&user_breakpoint, enabled)
            .await
        {
            self.notify_user("Install Breakpoint", &format!("Failed to install breakpoint: {}", e));
        }
        Ok(user_breakpoint)
    }

    pub async fn set_user_breakpoint_enabled(&self, user_breakpoint: &Arc<UserBreakpoint>, enabled: bool) {
        if let Err(e) = self
            .breakpoint_manager
            .install_user_breakpoint(user_breakpoint, enabled)
            .await
        {
            self.notify_user("Install Breakpoint", &format!("Failed to install breakpoint: {}", e));
        }
    }

    pub async fn clear_breakpoint(&self, address: TargetAddr) -> DebuggerResult<()> {
        let user_breakpoint = self
            .team
            .read(|t| t.user_breakpoint_at(address))
            .ok_or_else(|| DebuggerError::NotFound(format!("breakpoint at {:#x}", address)))?;
        self.clear_user_breakpoint(&user_breakpoint).await;
        Ok(())
    }

    pub async fn clear_user_breakpoint(&self, user_breakpoint: &Arc<UserBreakpoint>) {
        info!("Clearing breakpoint {}", user_breakpoint.id());
        if let Err(e) = self
            .breakpoint_manager
            .uninstall_user_breakpoint(user_breakpoint)
            .await
        {
            self.notify_user("Uninstall Breakpoint", &format!("Failed to uninstall breakpoint: {}", e));
        }
    }

    pub fn set_breakpoint_condition(&self, user_breakpoint: &Arc<UserBreakpoint>, condition: Option<String>) {
        user_breakpoint.set_condition(condition);
        self.team
            .with(|t| t.notify_user_breakpoint_changed(user_breakpoint));
    }

    // Watchpoints

    pub async fn set_watchpoint(
        &self,
        address: TargetAddr,
        watch_type: WatchpointType,
        length: usize,
        enabled: bool,
    ) -> DebuggerResult<()> {
        let result = self
            .watchpoint_manager
            .install_watchpoint(address, watch_type, length, enabled)
            .await;
        if let Err(e) = &result {
            self.notify_user("Install Watchpoint", &format!("Failed to install watchpoint: {}", e));
        }
        result
    }

    pub async fn clear_watchpoint(&self, address: TargetAddr) -> DebuggerResult<()> {
        let result = self.watchpoint_manager.uninstall_watchpoint(address).await;
        if let Err(e) = &result {
            self.notify_user("Uninstall Watchpoint", &format!("Failed to uninstall watchpoint: {}", e));
        }
        result
    }

    // Threads

    /// Runs a thread action on the thread's handler queue and waits until
    /// the handler has acted on it.
    pub async fn thread_action(
        &self,
        thread: ThreadId,
        action: ThreadAction,
        address: Option<TargetAddr>,
    ) -> DebuggerResult<()> {
        let sender = self
            .thread_handlers
            .lock()
            .get(&thread)
            .map(|entry| entry.sender.clone())
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {}", thread)))?;
        let (reply, result) = oneshot::channel();
        sender
            .send(ThreadMessage::Action {
                action,
                address,
                reply: Some(reply),
            })
            .map_err(|_| DebuggerError::NotFound(format!("thread {}", thread)))?;
        result.await.map_err(|_| DebuggerError::Aborted)?
    }

    // Memory

    /// Returns the cached block covering `address`, retrieving it in the
    /// background if necessary. `listener` hears about the outcome.
    pub fn inspect_memory(
        &self,
        address: TargetAddr,
        listener: Option<Arc<dyn TeamMemoryBlockListener>>,
    ) -> DebuggerResult<Arc<TeamMemoryBlock>> {
        let block = self.memory_blocks.get_memory_block(address);
        if block.is_valid() {
            if let Some(listener) = listener {
                listener.memory_block_retrieved(&block);
            }
            return Ok(block);
        }
        if let Some(listener) = listener {
            block.add_listener(listener);
        }
        let job = Arc::new(RetrieveMemoryBlockJob::new(self.memory.clone(), block.clone()));
        match self.worker.schedule_job(job, Some(self.job_listener.clone())) {
            Ok(()) | Err(DebuggerError::AlreadyInProgress(_)) => Ok(block),
            Err(e) => Err(e),
        }
    }

    pub fn write_memory(&self, address: TargetAddr, data: Vec<u8>) -> DebuggerResult<JobKey> {
        let job = Arc::new(WriteMemoryJob::new(
            self.team.clone(),
            self.memory.clone(),
            self.memory_blocks.clone(),
            address,
            data,
        ));
        let key = job.key();
        self.worker
            .schedule_job(job, Some(self.job_listener.clone()))?;
        Ok(key)
    }

    // Expressions and values

    /// Schedules an evaluation in the context of `thread`'s top frame. The
    /// outcome is also published as an `ExpressionEvaluated` team event.
    pub fn evaluate_expression(
        &self,
        expression: &str,
        thread: Option<ThreadId>,
    ) -> DebuggerResult<Arc<ExpressionEvaluationJob>> {
        let (cpu_state, frame, language) = self.team.read(|t| {
            let thread = thread.and_then(|id| t.thread(id));
            let cpu_state = thread.and_then(|th| th.cpu_state().cloned());
            let frame = thread
                .and_then(|th| th.stack_trace())
                .and_then(|trace| trace.frame_at(0).cloned());
            let language = cpu_state
                .as_ref()
                .and_then(|cpu| t.debug_info().language_for_address(cpu.instruction_pointer))
                .or_else(|| {
                    t.images()
                        .find_map(|image| image.debug_info().and_then(|info| info.language.clone()))
                });
            (cpu_state, frame, language)
        });
        let language =
            language.ok_or_else(|| DebuggerError::Unsupported("no source language available".to_string()))?;

        let context = EvaluationContext {
            team: self.team.clone(),
            thread,
            cpu_state,
            frame,
            memory: self.memory.clone(),
            architecture: self.architecture.clone(),
        };
        let job = Arc::new(ExpressionEvaluationJob::new(language, expression, context).publish_result());
        self.worker
            .schedule_job(job.clone(), Some(self.job_listener.clone()))?;
        Ok(job)
    }

    pub fn resolve_value_node(
        &self,
        container: Arc<ValueNodeContainer>,
        node: ValueNodeId,
        thread: Option<ThreadId>,
    ) -> DebuggerResult<JobKey> {
        let cpu_state = thread.and_then(|id| {
            self.team
                .read(|t| t.thread(id).and_then(|th| th.cpu_state().cloned()))
        });
        let job = Arc::new(ResolveValueNodeValueJob::new(
            container,
            node,
            self.architecture.clone(),
            self.memory.clone(),
            cpu_state,
        ));
        let key = job.key();
        match self.worker.schedule_job(job, Some(self.job_listener.clone())) {
            Ok(()) | Err(DebuggerError::AlreadyInProgress(_)) => Ok(key),
            Err(e) => Err(e),
        }
    }

    pub fn write_value_node(
        &self,
        container: Arc<ValueNodeContainer>,
        node: ValueNodeId,
        thread: Option<ThreadId>,
        value: Value,
    ) -> DebuggerResult<JobKey> {
        let job = Arc::new(WriteValueNodeValueJob::new(
            self.team.clone(),
            self.interface.clone(),
            self.memory.clone(),
            container,
            node,
            thread,
            value,
        ));
        let key = job.key();
        self.worker
            .schedule_job(job, Some(self.job_listener.clone()))?;
        Ok(key)
    }

    pub fn generate_report(&self, path: impl Into<PathBuf>) -> DebuggerResult<JobKey> {
        let job = Arc::new(GenerateReportJob::new(
            self.team.clone(),
            self.architecture.clone(),
            self.memory.clone(),
            path.into(),
            self.config.max_stack_frames,
        ));
        let key = job.key();
        self.worker
            .schedule_job(job, Some(self.job_listener.clone()))?;
        Ok(key)
    }

    // Team settings

    pub fn set_default_signal_disposition(&self, disposition: SignalDisposition) {
        self.team
            .with(|t| t.set_default_signal_disposition(disposition));
    }

    pub fn set_custom_signal_disposition(&self, signal: i32, disposition: SignalDisposition) {
        self.team
            .with(|t| t.set_custom_signal_disposition(signal, disposition));
    }

    pub fn remove_custom_signal_disposition(&self, signal: i32) {
        self.team
            .with(|t| t.remove_custom_signal_disposition(signal));
    }

    pub fn set_stop_on_image_load(&self, enabled: bool, use_name_list: bool) {
        self.team
            .with(|t| t.set_stop_on_image_load(enabled, use_name_list));
    }

    pub fn add_stop_image_name(&self, name: &str) {
        self.team.with(|t| t.add_stop_image_name(name));
    }

    pub fn remove_stop_image_name(&self, name: &str) {
        self.team.with(|t| t.remove_stop_image_name(name));
    }

    // Shutdown

    /// Returns false if the user cancelled.
    pub async fn quit(&self, option: QuitOption) -> bool {
        let kill_team = match option {
            QuitOption::KillTeam => true,
            QuitOption::ResumeTeam => false,
            QuitOption::AskUser => {
                let name = self.team.name();
                let short_name = name.rsplit('/').next().unwrap_or(&name).to_string();
                let message = format!("What shall be done about the debugged team '{}'?", name);
                let choices = vec![
                    format!("Kill {}", short_name),
                    "Cancel".to_string(),
                    format!("Resume {}", short_name),
                ];
                match self
                    .user_interface
                    .ask_user("Quit Debugger", &message, &choices)
                    .await
                {
                    Some(0) => true,
                    Some(2) => false,
                    _ => return false,
                }
            }
        };
        self.terminate(kill_team).await;
        true
    }

    async fn terminate(&self, kill_team: bool) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Terminating {
                return;
            }
            *lifecycle = Lifecycle::Terminating;
        }
        info!("Shutting down debugger for team {}", self.team.id());

        self.save_settings();
        if let Err(e) = self.interface.close(kill_team).await {
            debug!("Closing the debugger interface failed: {}", e);
        }
        self.worker.shut_down();
        if let Some(event_loop) = self.event_loop.lock().take() {
            event_loop.shut_down();
        }
        self.thread_handlers.lock().clear();
        if let Some(listener) = self.team_listener.lock().take() {
            self.team.remove_listener(&listener);
        }
        let _ = self.controller_tx.send(ControllerMessage::Shutdown);
        self.listener.team_debugger_quit();
    }

    // Settings

    fn save_settings(&self) {
        let settings = self.team.read(|t| TeamSettings {
            team_name: t.name().to_string(),
            breakpoints: t
                .user_breakpoints()
                .iter()
                .map(|ub| BreakpointSetting::from_user_breakpoint(ub))
                .collect(),
            default_signal_disposition: t.default_signal_disposition(),
            signal_dispositions: t.custom_signal_dispositions().clone(),
        });
        if let Err(e) = self.settings.save_team_settings(&settings) {
            error!("Failed to save settings of {}: {}", settings.team_name, e);
        }
    }

    /// Recreates saved location breakpoints and signal dispositions.
    async fn load_settings(&self) {
        let name = self.team.name();
        let Some(settings) = self.settings.load_team_settings(&name) else {
            return;
        };
        debug!("Loading {} saved breakpoint(s) for {}", settings.breakpoints.len(), name);

        for setting in &settings.breakpoints {
            let Some(location) = setting.location.clone() else {
                continue;
            };
            let user_breakpoint = UserBreakpoint::new(location);
            user_breakpoint.set_hidden(setting.hidden);
            user_breakpoint.set_condition(setting.condition.clone());
            if let Err(e) = self
                .breakpoint_manager
                .install_user_breakpoint(&user_breakpoint, setting.enabled)
                .await
            {
                warn!("Failed to restore breakpoint {}: {}", user_breakpoint.id(), e);
            }
        }

        self.team.with(|t| {
            t.set_default_signal_disposition(settings.default_signal_disposition);
            for (signal, disposition) in &settings.signal_dispositions {
                t.set_custom_signal_disposition(*signal, *disposition);
            }
        });
    }

    // Helpers

    fn add_thread_handler(&self, thread: ThreadId) {
        let handler = Arc::new(ThreadHandler::new(thread, self.handler_context.clone()));
        let sender = spawn_thread_handler(handler.clone());
        self.thread_handlers.lock().insert(
            thread,
            HandlerEntry {
                handler: handler.clone(),
                sender,
            },
        );
        handler.init();
    }

    fn post_to_thread(&self, thread: ThreadId, message: ThreadMessage) -> bool {
        let sender = self
            .thread_handlers
            .lock()
            .get(&thread)
            .map(|entry| entry.sender.clone());
        match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => {
                debug!("No handler for thread {}", thread);
                false
            }
        }
    }

    fn request_image_debug_info(&self, image: ImageId) {
        if let Err(e) = LoadImageDebugInfoJob::schedule_if_necessary(
            &self.worker,
            &self.team,
            image,
            &self.debug_info_provider,
            Some(self.job_listener.clone()),
        ) {
            debug!("Debug info of image {} not requested: {}", image, e);
        }
    }

    fn notify_user(&self, title: &str, message: &str) {
        warn!("{}: {}", title, message);
        self.user_interface
            .notify_user(title, message, NotificationSeverity::Warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MemorySettingsManager, NoOpSettingsManager};
    use crate::sim::{
        debugger_setup, Program, ProgramBuilder, RecordingUserInterface, SimulatedTarget, SYS_RAISE,
        SYS_SET_SIGNAL_HANDLER, SYS_WRITE,
    };
    use crate::types::{StoppedReason, ThreadState};
    use crate::worker::JobWaitStatus;
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

    struct Session {
        program: Program,
        target: Arc<SimulatedTarget>,
        debugger: Arc<TeamDebugger>,
        ui: Arc<RecordingUserInterface>,
        thread: ThreadId,
    }

    impl Session {
        fn stop(&self) -> Option<(StoppedReason, String, Arc<crate::cpu_state::CpuState>)> {
            self.debugger.team().read(|t| {
                let thread = t.thread(self.thread)?;
                if thread.state() != ThreadState::Stopped {
                    return None;
                }
                Some((
                    thread.stopped_reason(),
                    thread.stopped_reason_info().to_string(),
                    thread.cpu_state()?.clone(),
                ))
            })
        }

        fn stopped_at(&self, reason: StoppedReason, address: TargetAddr) -> bool {
            self.stop()
                .is_some_and(|(r, _, cpu)| r == reason && cpu.instruction_pointer == address)
        }

        async fn wait_stopped_at(&self, reason: StoppedReason, address: TargetAddr) {
            wait_until(&format!("{:?} stop at {:#x}", reason, address), || {
                self.stopped_at(reason, address)
            })
            .await;
        }

        fn symbol(&self, name: &str) -> TargetAddr {
            self.program.symbol(name).unwrap()
        }
    }

    async fn start_with(program: Program, settings: Arc<dyn SettingsManager>, answers: Vec<Option<usize>>) -> Session {
        let target = SimulatedTarget::launch(program.clone());
        let ui = Arc::new(RecordingUserInterface::with_answers(answers));
        let debugger = TeamDebugger::init(debugger_setup(&target, ui.clone(), settings), config())
            .await
            .unwrap();
        let session = Session {
            thread: target.main_thread(),
            program,
            target,
            debugger,
            ui,
        };
        session
            .wait_stopped_at(StoppedReason::Breakpoint, session.symbol("main"))
            .await;
        wait_until("debug info", || {
            session.debugger.team().read(|t| {
                t.images()
                    .all(|image| image.debug_info_state().is_final())
            })
        })
        .await;
        session
    }

    async fn start(program: Program) -> Session {
        start_with(program, Arc::new(NoOpSettingsManager), vec![Some(0)]).await
    }

    // main calls helper from line 2
    fn call_program() -> Program {
        let mut builder = ProgramBuilder::new("calls", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).mov(0, 1).call("helper");
        builder.line(3).nop();
        builder.line(4).leave().ret();
        builder.function("helper").line(10).enter();
        builder.line(11).add(0, 1).nop();
        builder.line(12).leave().ret();
        builder.build().unwrap()
    }

    // rec(r0): decrements r0 and recurses until it hits zero
    fn recursive_program() -> Program {
        let mut builder = ProgramBuilder::new("recursion", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).mov(0, 3).call("rec");
        builder.line(3).leave().ret();
        builder.function("rec").line(10).enter();
        builder.line(11).add(0, -1).jnz(0, "deeper");
        builder.line(12).leave().ret();
        builder.label("deeper").line(13).call("rec");
        builder.line(14).leave().ret();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_launch_stops_in_main() {
        let s = start(call_program()).await;
        let main = s.symbol("main");

        assert_eq!(s.debugger.lifecycle(), Lifecycle::Running);
        assert_eq!(s.target.install_count(main), 1);
        wait_until("temporary breakpoint removal", || s.target.uninstall_count(main) == 1).await;
        assert_eq!(s.debugger.team().count_breakpoints(), 0);
        assert!(s.debugger.team().read(|t| t.main_thread().is_some()));
    }

    #[tokio::test]
    async fn test_step_over_call_skips_callee() {
        let s = start(call_program()).await;
        let line2 = s.symbol("main") + 1;
        let call = line2 + 6;
        let after_call = call + 5;

        s.debugger
            .thread_action(s.thread, ThreadAction::Run, Some(line2))
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::Breakpoint, line2).await;

        s.debugger
            .thread_action(s.thread, ThreadAction::StepOver, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::SingleStep, after_call).await;

        let helper = s.symbol("helper");
        let stepped = s.target.single_step_log();
        assert!(stepped.contains(&line2));
        assert!(stepped.iter().all(|address| *address < helper));
        assert_eq!(s.target.install_count(after_call), 1);
        assert_eq!(s.target.uninstall_count(after_call), 1);
        assert_eq!(s.debugger.team().count_breakpoints(), 0);
    }

    #[tokio::test]
    async fn test_step_into_enters_callee() {
        let s = start(call_program()).await;
        let call = s.symbol("main") + 7;

        s.debugger
            .thread_action(s.thread, ThreadAction::Run, Some(call))
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::Breakpoint, call).await;

        s.debugger
            .thread_action(s.thread, ThreadAction::StepInto, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::SingleStep, s.symbol("helper"))
            .await;
    }

    #[tokio::test]
    async fn test_step_over_recursive_call() {
        let s = start(recursive_program()).await;
        let deeper = s.symbol("deeper");
        let after_call = deeper + 5;

        let user_breakpoint = s.debugger.set_breakpoint(deeper, true).await.unwrap();
        s.debugger
            .set_breakpoint_condition(&user_breakpoint, Some("r0 == 2".to_string()));
        s.debugger
            .thread_action(s.thread, ThreadAction::Run, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::Breakpoint, deeper).await;
        let (_, _, outer) = s.stop().unwrap();

        s.debugger
            .thread_action(s.thread, ThreadAction::StepOver, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::SingleStep, after_call).await;

        // The inner frame returned to the same address first.
        let (_, _, cpu) = s.stop().unwrap();
        assert_eq!(cpu.frame_pointer, outer.frame_pointer);
        assert_eq!(cpu.register(0), Some(0));
        assert_eq!(s.target.install_count(after_call), 2);
    }

    #[tokio::test]
    async fn test_step_out_of_recursion() {
        let s = start(recursive_program()).await;
        let deeper = s.symbol("deeper");
        let after_call = deeper + 5;

        let user_breakpoint = s.debugger.set_breakpoint(deeper, true).await.unwrap();
        s.debugger
            .set_breakpoint_condition(&user_breakpoint, Some("r0 == 1".to_string()));
        s.debugger
            .thread_action(s.thread, ThreadAction::Run, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::Breakpoint, deeper).await;
        let (_, _, inner) = s.stop().unwrap();

        s.debugger
            .thread_action(s.thread, ThreadAction::StepOut, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::SingleStep, after_call).await;

        // Stack grows down: the caller's frame lies above.
        let (_, _, cpu) = s.stop().unwrap();
        assert!(cpu.frame_pointer > inner.frame_pointer);
        assert_eq!(cpu.register(0), Some(0));
    }

    // Counts r1 down from 5 in a loop
    fn loop_program() -> Program {
        let mut builder = ProgramBuilder::new("loop", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).mov(1, 5);
        builder.label("again").line(3).add(1, -1);
        builder.line(4).jnz(1, "again");
        builder.line(5).leave();
        builder.line(6).ret();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_false_condition_never_stops() {
        let s = start(loop_program()).await;
        let again = s.symbol("again");
        let line5 = again + 6;

        let looping = s.debugger.set_breakpoint(again, true).await.unwrap();
        s.debugger
            .set_breakpoint_condition(&looping, Some("r1 == 100".to_string()));
        s.debugger.set_breakpoint(line5, true).await.unwrap();

        s.debugger
            .thread_action(s.thread, ThreadAction::Run, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::Breakpoint, line5).await;
        let (_, _, cpu) = s.stop().unwrap();
        assert_eq!(cpu.register(1), Some(0));
    }

    #[tokio::test]
    async fn test_failed_condition_stops() {
        let s = start(loop_program()).await;
        let again = s.symbol("again");

        let looping = s.debugger.set_breakpoint(again, true).await.unwrap();
        s.debugger
            .set_breakpoint_condition(&looping, Some("bogus > 1".to_string()));
        s.debugger
            .thread_action(s.thread, ThreadAction::Run, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::Breakpoint, again).await;
        let (_, _, cpu) = s.stop().unwrap();
        assert_eq!(cpu.register(1), Some(5));
    }

    #[tokio::test]
    async fn test_non_boolean_condition_stops_and_warns() {
        let s = start(loop_program()).await;
        let again = s.symbol("again");

        let looping = s.debugger.set_breakpoint(again, true).await.unwrap();
        s.debugger
            .set_breakpoint_condition(&looping, Some("type r1".to_string()));
        s.debugger
            .thread_action(s.thread, ThreadAction::Run, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::Breakpoint, again).await;
        assert!(s
            .ui
            .notifications()
            .iter()
            .any(|(title, _)| title == "Breakpoint condition"));
    }

    fn straight_program(name: &str, text_base: TargetAddr) -> Program {
        let mut builder = ProgramBuilder::new(name, text_base);
        builder.function("main").line(1).enter();
        builder.line(2).nop();
        builder.line(3).nop();
        builder.line(4).nop();
        builder.line(5).leave().ret();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_exec_discards_breakpoints() {
        let s = start(straight_program("alpha", 0x1000)).await;
        let main = s.symbol("main");
        let lines = [main + 1, main + 2, main + 3];
        for address in lines {
            s.debugger.set_breakpoint(address, true).await.unwrap();
        }
        assert_eq!(s.debugger.team().count_breakpoints(), 3);

        let beta = straight_program("beta", 0x20000);
        let beta_main = beta.symbol("main").unwrap();
        s.target.exec(beta);
        s.wait_stopped_at(StoppedReason::Breakpoint, beta_main).await;

        assert_eq!(s.debugger.team().count_breakpoints(), 0);
        assert!(s.debugger.team().read(|t| t.user_breakpoints().is_empty()));
        for address in lines {
            assert_eq!(s.target.uninstall_count(address), 1);
        }
        assert_eq!(s.debugger.team().name(), "/sim/beta");
    }

    #[tokio::test]
    async fn test_exec_restores_saved_breakpoints() {
        let settings = Arc::new(MemorySettingsManager::new());
        let s = start_with(straight_program("alpha", 0x1000), settings.clone(), vec![Some(0)]).await;
        let main = s.symbol("main");
        let lines = [main + 1, main + 2, main + 3];
        for address in lines {
            s.debugger.set_breakpoint(address, true).await.unwrap();
        }

        s.target.exec(straight_program("alpha", 0x1000));
        wait_until("main breakpoint after exec", || s.target.install_count(main) == 2).await;

        assert!(settings.document("/sim/alpha").is_some());
        assert_eq!(s.debugger.team().read(|t| t.user_breakpoints().len()), 3);
        for address in lines {
            assert_eq!(s.target.install_count(address), 2);
            assert!(s
                .debugger
                .team()
                .read(|t| t.breakpoint_at(address).unwrap().is_installed()));
        }
    }

    #[tokio::test]
    async fn test_stop_on_listed_image_load() {
        let s = start(straight_program("host", 0x1000)).await;
        let line2 = s.symbol("main") + 1;
        s.debugger.set_breakpoint(line2, true).await.unwrap();
        s.debugger.set_stop_on_image_load(true, true);
        s.debugger.add_stop_image_name("libwanted.so");

        let mut skipped = ProgramBuilder::library("libskip.so", 0x40000);
        skipped.function("skip").line(1).ret();
        s.target.load_library(s.thread, skipped.build().unwrap());
        s.wait_stopped_at(StoppedReason::Breakpoint, line2).await;

        let mut wanted = ProgramBuilder::library("libwanted.so", 0x50000);
        wanted.function("wanted").line(1).ret();
        s.target.load_library(s.thread, wanted.build().unwrap());
        wait_until("image load stop", || {
            s.stop()
                .is_some_and(|(reason, info, _)| {
                    reason == StoppedReason::Debugged && info == "Image 'libwanted.so' loaded."
                })
        })
        .await;
    }

    fn signal_program() -> Program {
        let mut builder = ProgramBuilder::new("signals", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).mov(0, 10).mov_address(1, "on_signal").syscall(SYS_SET_SIGNAL_HANDLER);
        builder.line(3).mov(0, 10).syscall(SYS_RAISE);
        builder.line(4).nop();
        builder.line(5).leave().ret();
        builder.function("on_signal").line(20).enter();
        builder.line(21).nop();
        builder.line(22).leave().ret();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_ignored_signal_passes_through() {
        let s = start(signal_program()).await;
        let line4 = s.symbol("main") + 1 + 14 + 8;
        s.debugger
            .set_custom_signal_disposition(10, SignalDisposition::Ignore);
        s.debugger.set_breakpoint(line4, true).await.unwrap();

        s.debugger
            .thread_action(s.thread, ThreadAction::Run, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::Breakpoint, line4).await;
    }

    #[tokio::test]
    async fn test_signal_stops_at_handler() {
        let s = start(signal_program()).await;
        s.debugger
            .set_custom_signal_disposition(10, SignalDisposition::StopAtSignalHandler);

        s.debugger
            .thread_action(s.thread, ThreadAction::Run, None)
            .await
            .unwrap();
        s.wait_stopped_at(StoppedReason::Breakpoint, s.symbol("on_signal"))
            .await;
    }

    struct ConsoleRecorder {
        output: parking_lot::Mutex<Vec<(i32, String)>>,
    }

    impl TeamListener for ConsoleRecorder {
        fn team_event(&self, event: &TeamEvent) {
            if let TeamEvent::ConsoleOutputReceived { fd, output } = event {
                self.output.lock().push((*fd, output.clone()));
            }
        }
    }

    #[tokio::test]
    async fn test_console_output() {
        let mut builder = ProgramBuilder::new("hello", 0x1000);
        let message = builder.data("message", b"hello\n");
        builder.function("main").line(1).enter();
        builder.line(2).mov(0, 1).mov(1, message as u32).mov(2, 6).syscall(SYS_WRITE);
        builder.line(3).leave().ret();
        let s = start(builder.build().unwrap()).await;

        let recorder = Arc::new(ConsoleRecorder {
            output: parking_lot::Mutex::new(Vec::new()),
        });
        s.debugger.team().add_listener(recorder.clone());
        s.debugger
            .thread_action(s.thread, ThreadAction::Run, None)
            .await
            .unwrap();

        wait_until("console output", || !recorder.output.lock().is_empty()).await;
        assert_eq!(recorder.output.lock()[0], (1, "hello\n".to_string()));
    }

    #[tokio::test]
    async fn test_team_deleted_quits_on_request() {
        #[derive(Default)]
        struct QuitRecorder(AtomicBool);
        impl TeamDebuggerListener for QuitRecorder {
            fn team_debugger_quit(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let program = straight_program("short", 0x1000);
        let target = SimulatedTarget::launch(program);
        let ui = Arc::new(RecordingUserInterface::with_answers(vec![Some(1)]));
        let quit = Arc::new(QuitRecorder::default());
        let mut setup = debugger_setup(&target, ui.clone(), Arc::new(NoOpSettingsManager));
        setup.listener = quit.clone();
        let mut config = config();
        config.stop_in_main = false;
        let debugger = TeamDebugger::init(setup, config).await.unwrap();
        let thread = target.main_thread();

        wait_until("debugged stop", || {
            debugger.team().thread_state(thread) == Some(ThreadState::Stopped)
        })
        .await;
        debugger
            .thread_action(thread, ThreadAction::Run, None)
            .await
            .unwrap();

        wait_until("quit", || quit.0.load(Ordering::SeqCst)).await;
        assert_eq!(debugger.lifecycle(), Lifecycle::Terminating);
        assert!(ui.questions().iter().any(|q| q == "Team terminated"));
        assert!(debugger.team().read(|t| t.thread(thread).is_none()));
    }

    #[tokio::test]
    async fn test_lost_debug_port_asks_and_quits() {
        let s = start_with(call_program(), Arc::new(NoOpSettingsManager), vec![Some(1)]).await;

        s.target.close(false).await.unwrap();

        wait_until("terminating", || s.debugger.lifecycle() == Lifecycle::Terminating).await;
        assert!(s
            .ui
            .notifications()
            .iter()
            .any(|(title, _)| title == "Debug connection lost"));
        let asked: Vec<String> = s
            .ui
            .questions()
            .into_iter()
            .filter(|q| q == "Team terminated")
            .collect();
        assert_eq!(asked.len(), 1);
    }

    #[tokio::test]
    async fn test_report_and_evaluation() {
        let s = start(call_program()).await;

        let job = s.debugger.evaluate_expression("r0 == 0", Some(s.thread)).unwrap();
        assert_eq!(s.debugger.worker().wait_for(job.key()).await, JobWaitStatus::Succeeded);
        assert_eq!(
            job.take_result().unwrap().unwrap(),
            crate::language::ExpressionResult::Primitive(Value::Bool(true))
        );

        let path = std::env::temp_dir().join(format!("tdb-report-{}.txt", std::process::id()));
        let key = s.debugger.generate_report(&path).unwrap();
        assert_eq!(s.debugger.worker().wait_for(key).await, JobWaitStatus::Succeeded);
        let report = std::fs::read_to_string(&path).unwrap();
        assert!(report.contains("/sim/calls"));
        assert!(report.contains("main"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_quit_asks_user() {
        let s = start_with(call_program(), Arc::new(NoOpSettingsManager), vec![Some(1), Some(0)]).await;

        assert!(!s.debugger.quit(QuitOption::AskUser).await);
        assert_eq!(s.debugger.lifecycle(), Lifecycle::Running);

        assert!(s.debugger.quit(QuitOption::AskUser).await);
        assert_eq!(s.debugger.lifecycle(), Lifecycle::Terminating);
        assert!(!s.target.is_alive());
    }
}
