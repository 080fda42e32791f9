// Team model
//
// The debuggee: threads, images, breakpoints and watchpoints behind one lock.
// Mutations queue TeamEvents which are delivered to listeners once the lock
// has been released, so listeners may take the lock again.

use crate::breakpoint::{Breakpoint, UserBreakpoint};
use crate::cpu_state::CpuState;
use crate::debug_info::{ImageDebugInfo, TeamDebugInfo};
use crate::image::{Image, ImageDebugInfoState, ImageInfo};
use crate::stack_trace::StackTrace;
use crate::thread::{Thread, ThreadInfo};
use crate::types::{
    ImageId, SignalDisposition, StoppedReason, TargetAddr, TeamId, ThreadId, ThreadState,
};
use crate::watchpoint::Watchpoint;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum TeamEvent {
    ThreadAdded(ThreadId),
    ThreadRemoved(ThreadId),
    ThreadStateChanged(ThreadId),
    ThreadCpuStateChanged(ThreadId),
    ThreadStackTraceChanged(ThreadId),
    ThreadNameChanged(ThreadId),
    ImageAdded(ImageId),
    ImageRemoved(ImageId),
    ImageDebugInfoChanged(ImageId),
    BreakpointChanged(TargetAddr),
    UserBreakpointChanged(u64),
    WatchpointChanged(TargetAddr),
    ConsoleOutputReceived { fd: i32, output: String },
    MemoryChanged { address: TargetAddr, size: usize },
    DebugReportChanged { path: PathBuf },
    ExpressionEvaluated {
        expression: String,
        result: Result<String, String>,
    },
    SignalDispositionChanged { signal: Option<i32> },
    StopOnImageLoadChanged,
}

pub trait TeamListener: Send + Sync {
    fn team_event(&self, event: &TeamEvent);
}

#[derive(Debug)]
pub struct TeamInner {
    id: TeamId,
    name: String,
    threads: BTreeMap<ThreadId, Thread>,
    images: BTreeMap<ImageId, Image>,
    breakpoints: BTreeMap<TargetAddr, Breakpoint>,
    watchpoints: BTreeMap<TargetAddr, Watchpoint>,
    user_breakpoints: Vec<Arc<UserBreakpoint>>,
    debug_info: TeamDebugInfo,
    default_signal_disposition: SignalDisposition,
    signal_dispositions: BTreeMap<i32, SignalDisposition>,
    stop_on_image_load: bool,
    stop_image_name_list_enabled: bool,
    stop_image_names: Vec<String>,
    events: Vec<TeamEvent>,
}

impl TeamInner {
    fn new(id: TeamId, name: String) -> Self {
        Self {
            id,
            name,
            threads: BTreeMap::new(),
            images: BTreeMap::new(),
            breakpoints: BTreeMap::new(),
            watchpoints: BTreeMap::new(),
            user_breakpoints: Vec::new(),
            debug_info: TeamDebugInfo::default(),
            default_signal_disposition: SignalDisposition::default(),
            signal_dispositions: BTreeMap::new(),
            stop_on_image_load: false,
            stop_image_name_list_enabled: false,
            stop_image_names: Vec::new(),
            events: Vec::new(),
        }
    }

    fn notify(&mut self, event: TeamEvent) {
        self.events.push(event);
    }

    pub fn id(&self) -> TeamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    // Threads

    pub fn add_thread(&mut self, info: &ThreadInfo, main_thread: bool) {
        if self.threads.contains_key(&info.thread_id) {
            return;
        }
        self.threads
            .insert(info.thread_id, Thread::new(info, main_thread));
        self.notify(TeamEvent::ThreadAdded(info.thread_id));
    }

    pub fn remove_thread(&mut self, id: ThreadId) -> Option<Thread> {
        let thread = self.threads.remove(&id)?;
        self.notify(TeamEvent::ThreadRemoved(id));
        Some(thread)
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn main_thread(&self) -> Option<&Thread> {
        self.threads.values().find(|t| t.is_main_thread())
    }

    pub fn set_thread_state(
        &mut self,
        id: ThreadId,
        state: ThreadState,
        cpu_state: Option<Arc<CpuState>>,
        reason: StoppedReason,
        reason_info: String,
    ) -> bool {
        let Some(thread) = self.threads.get_mut(&id) else {
            return false;
        };
        let cpu_changed = match (&cpu_state, thread.cpu_state()) {
            (Some(new), Some(old)) => !Arc::ptr_eq(new, old),
            (None, None) => false,
            _ => true,
        };
        thread.set_state(state, cpu_state, reason, reason_info);
        debug!("Thread {} state -> {:?} ({:?})", id, state, reason);
        self.notify(TeamEvent::ThreadStateChanged(id));
        if cpu_changed {
            self.notify(TeamEvent::ThreadCpuStateChanged(id));
        }
        true
    }

    pub fn set_thread_cpu_state(&mut self, id: ThreadId, cpu_state: Option<Arc<CpuState>>) -> bool {
        let Some(thread) = self.threads.get_mut(&id) else {
            return false;
        };
        thread.set_cpu_state(cpu_state);
        self.notify(TeamEvent::ThreadCpuStateChanged(id));
        true
    }

    pub fn set_thread_stack_trace(&mut self, id: ThreadId, stack_trace: Option<Arc<StackTrace>>) -> bool {
        let Some(thread) = self.threads.get_mut(&id) else {
            return false;
        };
        thread.set_stack_trace(stack_trace);
        self.notify(TeamEvent::ThreadStackTraceChanged(id));
        true
    }

    pub fn set_thread_name(&mut self, id: ThreadId, name: String) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.set_name(name);
            self.notify(TeamEvent::ThreadNameChanged(id));
        }
    }

    pub fn set_thread_priority(&mut self, id: ThreadId, priority: i32) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.set_priority(priority);
        }
    }

    pub fn set_stop_request_pending(&mut self, id: ThreadId, pending: bool) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.set_stop_request_pending(pending);
        }
    }

    // Images

    pub fn add_image(&mut self, info: ImageInfo) {
        let id = info.image_id;
        if self.images.contains_key(&id) {
            return;
        }
        self.images.insert(id, Image::new(info));
        self.notify(TeamEvent::ImageAdded(id));
    }

    pub fn remove_image(&mut self, id: ImageId) -> Option<Image> {
        let image = self.images.remove(&id)?;
        self.debug_info.remove_image_debug_info(id);
        self.notify(TeamEvent::ImageRemoved(id));
        Some(image)
    }

    pub fn image(&self, id: ImageId) -> Option<&Image> {
        self.images.get(&id)
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    pub fn image_by_address(&self, address: TargetAddr) -> Option<&Image> {
        self.images.values().find(|i| i.contains_address(address))
    }

    pub(crate) fn set_image_debug_info_state(&mut self, id: ImageId, state: ImageDebugInfoState) -> bool {
        match self.images.get_mut(&id) {
            Some(image) => {
                image.set_debug_info_state(state);
                true
            }
            None => false,
        }
    }

    pub fn set_image_debug_info(
        &mut self,
        id: ImageId,
        debug_info: Option<Arc<ImageDebugInfo>>,
        state: ImageDebugInfoState,
    ) -> bool {
        let Some(image) = self.images.get_mut(&id) else {
            return false;
        };
        image.set_debug_info(debug_info.clone(), state);
        match debug_info {
            Some(info) => self.debug_info.add_image_debug_info(info),
            None => self.debug_info.remove_image_debug_info(id),
        }
        self.notify(TeamEvent::ImageDebugInfoChanged(id));
        true
    }

    pub fn debug_info(&self) -> &TeamDebugInfo {
        &self.debug_info
    }

    // Breakpoints

    pub fn breakpoint_at(&self, address: TargetAddr) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    pub(crate) fn breakpoint_at_mut(&mut self, address: TargetAddr) -> Option<&mut Breakpoint> {
        self.breakpoints.get_mut(&address)
    }

    /// Returns the breakpoint at `address`, creating it if necessary.
    pub(crate) fn ensure_breakpoint(&mut self, address: TargetAddr) -> &mut Breakpoint {
        let image_id = self.image_by_address(address).map(|i| i.id());
        self.breakpoints
            .entry(address)
            .or_insert_with(|| Breakpoint::new(address, image_id))
    }

    pub(crate) fn remove_breakpoint(&mut self, address: TargetAddr) -> Option<Breakpoint> {
        let breakpoint = self.breakpoints.remove(&address)?;
        self.notify(TeamEvent::BreakpointChanged(address));
        Some(breakpoint)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn count_breakpoints(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn notify_breakpoint_changed(&mut self, address: TargetAddr) {
        self.notify(TeamEvent::BreakpointChanged(address));
    }

    // User breakpoints

    pub(crate) fn add_user_breakpoint(&mut self, user_breakpoint: Arc<UserBreakpoint>) {
        if !self
            .user_breakpoints
            .iter()
            .any(|ub| Arc::ptr_eq(ub, &user_breakpoint))
        {
            self.user_breakpoints.push(user_breakpoint);
        }
    }

    pub(crate) fn remove_user_breakpoint(&mut self, user_breakpoint: &Arc<UserBreakpoint>) {
        self.user_breakpoints
            .retain(|ub| !Arc::ptr_eq(ub, user_breakpoint));
    }

    pub fn user_breakpoints(&self) -> &[Arc<UserBreakpoint>] {
        &self.user_breakpoints
    }

    pub fn user_breakpoint_by_id(&self, id: u64) -> Option<&Arc<UserBreakpoint>> {
        self.user_breakpoints.iter().find(|ub| ub.id() == id)
    }

    /// The user breakpoint that has an instance at `address`, if any.
    pub fn user_breakpoint_at(&self, address: TargetAddr) -> Option<Arc<UserBreakpoint>> {
        self.breakpoints
            .get(&address)?
            .user_breakpoints()
            .iter()
            .find_map(|instance| instance.user_breakpoint())
    }

    pub fn notify_user_breakpoint_changed(&mut self, user_breakpoint: &UserBreakpoint) {
        self.notify(TeamEvent::UserBreakpointChanged(user_breakpoint.id()));
    }

    // Watchpoints

    pub fn watchpoint_at(&self, address: TargetAddr) -> Option<&Watchpoint> {
        self.watchpoints.get(&address)
    }

    pub(crate) fn watchpoint_at_mut(&mut self, address: TargetAddr) -> Option<&mut Watchpoint> {
        self.watchpoints.get_mut(&address)
    }

    pub(crate) fn add_watchpoint(&mut self, watchpoint: Watchpoint) {
        let address = watchpoint.address();
        self.watchpoints.insert(address, watchpoint);
        self.notify(TeamEvent::WatchpointChanged(address));
    }

    pub(crate) fn remove_watchpoint(&mut self, address: TargetAddr) -> Option<Watchpoint> {
        let watchpoint = self.watchpoints.remove(&address)?;
        self.notify(TeamEvent::WatchpointChanged(address));
        Some(watchpoint)
    }

    pub fn watchpoints(&self) -> impl Iterator<Item = &Watchpoint> {
        self.watchpoints.values()
    }

    pub fn watchpoint_containing(&self, address: TargetAddr) -> Option<&Watchpoint> {
        self.watchpoints.values().find(|w| w.contains(address))
    }

    pub fn notify_watchpoint_changed(&mut self, address: TargetAddr) {
        self.notify(TeamEvent::WatchpointChanged(address));
    }

    // Signal dispositions

    pub fn default_signal_disposition(&self) -> SignalDisposition {
        self.default_signal_disposition
    }

    pub fn set_default_signal_disposition(&mut self, disposition: SignalDisposition) {
        if self.default_signal_disposition != disposition {
            self.default_signal_disposition = disposition;
            self.notify(TeamEvent::SignalDispositionChanged { signal: None });
        }
    }

    pub fn signal_disposition_for(&self, signal: i32) -> SignalDisposition {
        self.signal_dispositions
            .get(&signal)
            .copied()
            .unwrap_or(self.default_signal_disposition)
    }

    pub fn custom_signal_dispositions(&self) -> &BTreeMap<i32, SignalDisposition> {
        &self.signal_dispositions
    }

    pub fn set_custom_signal_disposition(&mut self, signal: i32, disposition: SignalDisposition) {
        self.signal_dispositions.insert(signal, disposition);
        self.notify(TeamEvent::SignalDispositionChanged { signal: Some(signal) });
    }

    pub fn remove_custom_signal_disposition(&mut self, signal: i32) {
        if self.signal_dispositions.remove(&signal).is_some() {
            self.notify(TeamEvent::SignalDispositionChanged { signal: Some(signal) });
        }
    }

    pub fn clear_signal_dispositions(&mut self) {
        let signals: Vec<i32> = self.signal_dispositions.keys().copied().collect();
        for signal in signals {
            self.remove_custom_signal_disposition(signal);
        }
    }

    // Stop on image load

    pub fn stop_on_image_load(&self) -> bool {
        self.stop_on_image_load
    }

    pub fn stop_image_name_list_enabled(&self) -> bool {
        self.stop_image_name_list_enabled
    }

    pub fn stop_image_names(&self) -> &[String] {
        &self.stop_image_names
    }

    pub fn set_stop_on_image_load(&mut self, enabled: bool, use_name_list: bool) {
        self.stop_on_image_load = enabled;
        self.stop_image_name_list_enabled = use_name_list;
        self.notify(TeamEvent::StopOnImageLoadChanged);
    }

    pub fn add_stop_image_name(&mut self, name: &str) {
        if !self.stop_image_names.iter().any(|n| n == name) {
            self.stop_image_names.push(name.to_string());
            self.notify(TeamEvent::StopOnImageLoadChanged);
        }
    }

    pub fn remove_stop_image_name(&mut self, name: &str) {
        let before = self.stop_image_names.len();
        self.stop_image_names.retain(|n| n != name);
        if before != self.stop_image_names.len() {
            self.notify(TeamEvent::StopOnImageLoadChanged);
        }
    }

    // Misc notifications

    pub fn notify_console_output_received(&mut self, fd: i32, output: String) {
        self.notify(TeamEvent::ConsoleOutputReceived { fd, output });
    }

    pub fn notify_memory_changed(&mut self, address: TargetAddr, size: usize) {
        self.notify(TeamEvent::MemoryChanged { address, size });
    }

    pub fn notify_debug_report_changed(&mut self, path: PathBuf) {
        self.notify(TeamEvent::DebugReportChanged { path });
    }

    pub fn notify_expression_evaluated(&mut self, expression: String, result: Result<String, String>) {
        self.notify(TeamEvent::ExpressionEvaluated { expression, result });
    }
}

pub struct Team {
    inner: Mutex<TeamInner>,
    listeners: Mutex<Vec<Arc<dyn TeamListener>>>,
}

impl Team {
    pub fn new(id: TeamId, name: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(TeamInner::new(id, name.into())),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Runs `f` under the team lock and delivers the events it queued after
    /// the lock is released.
    pub fn with<R>(&self, f: impl FnOnce(&mut TeamInner) -> R) -> R {
        let (result, events) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner);
            (result, std::mem::take(&mut inner.events))
        };
        self.dispatch(events);
        result
    }

    pub fn read<R>(&self, f: impl FnOnce(&TeamInner) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner)
    }

    pub fn id(&self) -> TeamId {
        self.read(|t| t.id)
    }

    pub fn name(&self) -> String {
        self.read(|t| t.name.clone())
    }

    pub fn add_listener(&self, listener: Arc<dyn TeamListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TeamListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.read(|t| t.thread(id).map(|thread| thread.state()))
    }

    pub fn thread_snapshot(&self, id: ThreadId) -> Option<Thread> {
        self.read(|t| t.thread(id).cloned())
    }

    pub fn count_breakpoints(&self) -> usize {
        self.read(|t| t.count_breakpoints())
    }

    fn dispatch(&self, events: Vec<TeamEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        for event in &events {
            for listener in &listeners {
                listener.team_event(event);
            }
        }
    }
}
