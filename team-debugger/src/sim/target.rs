// Simulated target
//
// An in-process debuggee running sim byte code. Threads execute
// synchronously inside `continue_thread`/`single_step_thread` until they
// stop; the resulting debug events are queued on the debug port. The
// target counts breakpoint installs and uninstalls per address and logs
// every single-stepped address for tests.

use super::arch::SimArchitecture;
use super::isa::{Instruction, MAX_INSTRUCTION_SIZE, REGISTER_COUNT, SYS_RAISE, SYS_SET_SIGNAL_HANDLER, SYS_WRITE};
use super::program::Program;
use crate::architecture::Architecture;
use crate::cpu_state::CpuState;
use crate::debug_info::{ImageDebugInfo, ImageDebugInfoProvider};
use crate::error::{DebuggerError, DebuggerResult};
use crate::events::{DebugEvent, DebugEventKind, SyscallInfo};
use crate::image::{ImageInfo, ImageType};
use crate::interface::{DebuggerInterface, TeamInfo, TeamMemory};
use crate::thread::ThreadInfo;
use crate::types::{ImageId, TargetAddr, TeamId, ThreadId, ThreadState, WatchpointType};
use async_trait::async_trait;
use bytes::Buf;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const SIM_TEAM_ID: TeamId = 100;

const STACK_TOP: TargetAddr = 0x7fff_0000;
const STACK_SIZE: u64 = 0x10000;
const STACK_SPACING: u64 = 0x20000;
/// Instructions a thread runs per continue before it is parked as running
const STEP_BUDGET: usize = 100_000;

type Fault = &'static str;

const SEGMENT_VIOLATION: Fault = "segment violation";

struct Region {
    base: TargetAddr,
    bytes: Vec<u8>,
    image: Option<ImageId>,
}

impl Region {
    fn contains(&self, address: TargetAddr, size: usize) -> bool {
        address >= self.base && address - self.base + size as u64 <= self.bytes.len() as u64
    }
}

struct SimThread {
    name: String,
    state: ThreadState,
    cpu: CpuState,
    pending_signal: Option<i32>,
}

enum Step {
    Continue,
    Stop(DebugEventKind),
    Exited,
}

struct Machine {
    architecture: Arc<SimArchitecture>,
    team_name: String,
    images: BTreeMap<ImageId, (Program, ImageInfo)>,
    next_image_id: ImageId,
    regions: Vec<Region>,
    threads: BTreeMap<ThreadId, SimThread>,
    next_thread_id: ThreadId,
    breakpoints: HashSet<TargetAddr>,
    watchpoints: HashMap<TargetAddr, (WatchpointType, usize)>,
    signal_handlers: HashMap<i32, TargetAddr>,
    install_counts: HashMap<TargetAddr, usize>,
    uninstall_counts: HashMap<TargetAddr, usize>,
    failing_installs: HashSet<TargetAddr>,
    failing_watchpoint_removals: HashSet<TargetAddr>,
    failing_resumes: bool,
    single_step_log: Vec<TargetAddr>,
    events: Option<mpsc::UnboundedSender<DebugEvent>>,
}

pub struct SimulatedTarget {
    architecture: Arc<SimArchitecture>,
    machine: Mutex<Machine>,
    port: tokio::sync::Mutex<mpsc::UnboundedReceiver<DebugEvent>>,
}

impl SimulatedTarget {
    /// Maps `program` and creates the main thread, stopped at the entry.
    pub fn launch(program: Program) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let architecture = Arc::new(SimArchitecture::new());
        let mut machine = Machine {
            architecture: architecture.clone(),
            team_name: program.path().to_string(),
            images: BTreeMap::new(),
            next_image_id: 1,
            regions: Vec::new(),
            threads: BTreeMap::new(),
            next_thread_id: SIM_TEAM_ID + 1,
            breakpoints: HashSet::new(),
            watchpoints: HashMap::new(),
            signal_handlers: HashMap::new(),
            install_counts: HashMap::new(),
            uninstall_counts: HashMap::new(),
            failing_installs: HashSet::new(),
            failing_watchpoint_removals: HashSet::new(),
            failing_resumes: false,
            single_step_log: Vec::new(),
            events: Some(tx),
        };
        let entry = program.entry();
        machine.map(program);
        machine.create_thread(SIM_TEAM_ID, "main", entry, 0);
        info!("Launched simulated team {} ({})", SIM_TEAM_ID, machine.team_name);

        Arc::new(Self {
            architecture,
            machine: Mutex::new(machine),
            port: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn architecture(&self) -> Arc<dyn Architecture> {
        self.architecture.clone()
    }

    pub fn main_thread(&self) -> ThreadId {
        SIM_TEAM_ID
    }

    pub fn is_alive(&self) -> bool {
        !self.machine.lock().threads.is_empty()
    }

    pub fn install_count(&self, address: TargetAddr) -> usize {
        self.machine
            .lock()
            .install_counts
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub fn uninstall_count(&self, address: TargetAddr) -> usize {
        self.machine
            .lock()
            .uninstall_counts
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Makes every later install at `address` fail.
    pub fn fail_breakpoint_install(&self, address: TargetAddr) {
        self.machine.lock().failing_installs.insert(address);
    }

    /// Makes continue and single step requests fail while set.
    pub fn fail_resumes(&self, fail: bool) {
        self.machine.lock().failing_resumes = fail;
    }

    /// Makes removing the watchpoint at `address` fail until the hook is
    /// cleared again.
    pub fn fail_watchpoint_uninstall(&self, address: TargetAddr, fail: bool) {
        let mut machine = self.machine.lock();
        if fail {
            machine.failing_watchpoint_removals.insert(address);
        } else {
            machine.failing_watchpoint_removals.remove(&address);
        }
    }

    pub fn watchpoint_installed(&self, address: TargetAddr) -> bool {
        self.machine.lock().watchpoints.contains_key(&address)
    }

    pub fn single_step_log(&self) -> Vec<TargetAddr> {
        self.machine.lock().single_step_log.clone()
    }

    pub fn program(&self, image: ImageId) -> Option<Program> {
        self.machine
            .lock()
            .images
            .get(&image)
            .map(|(program, _)| program.clone())
    }

    /// Replaces the team's address space with `program`. Only the main
    /// thread survives; it is left stopped at the new entry.
    pub fn exec(&self, program: Program) {
        let mut machine = self.machine.lock();
        info!("Team {} exec'ing {}", SIM_TEAM_ID, program.path());

        let others: Vec<ThreadId> = machine
            .threads
            .keys()
            .copied()
            .filter(|id| *id != SIM_TEAM_ID)
            .collect();
        for id in others {
            machine.threads.remove(&id);
            machine.emit(id, false, DebugEventKind::ThreadDeleted);
        }

        let old: Vec<ImageInfo> = machine.images.values().map(|(_, info)| info.clone()).collect();
        machine.images.clear();
        machine.regions.retain(|region| region.image.is_none());
        machine.breakpoints.clear();
        machine.watchpoints.clear();
        machine.signal_handlers.clear();
        machine.team_name = program.path().to_string();

        let entry = program.entry();
        machine.create_thread(SIM_TEAM_ID, "main", entry, 0);
        let image = machine.map(program);

        machine.emit(SIM_TEAM_ID, false, DebugEventKind::TeamExec);
        for info in old {
            machine.emit(SIM_TEAM_ID, false, DebugEventKind::ImageDeleted { image: info });
        }
        machine.emit(SIM_TEAM_ID, true, DebugEventKind::ImageCreated { image });
    }

    /// Maps a library on behalf of `thread`, which stops until continued.
    pub fn load_library(&self, thread: ThreadId, program: Program) -> ImageId {
        let mut machine = self.machine.lock();
        let image = machine.map(program);
        let image_id = image.image_id;
        if let Some(thread) = machine.threads.get_mut(&thread) {
            thread.state = ThreadState::Stopped;
        }
        machine.emit(thread, true, DebugEventKind::ImageCreated { image });
        image_id
    }

    /// Starts a new thread at `entry`. It stays stopped until continued.
    pub fn spawn_thread(&self, entry: TargetAddr, name: &str) -> ThreadId {
        let mut machine = self.machine.lock();
        let id = machine.next_thread_id;
        machine.next_thread_id += 1;
        let slot = machine.threads.len() as u64;
        machine.create_thread(id, name, entry, slot);
        let new_thread = ThreadInfo {
            team_id: SIM_TEAM_ID,
            thread_id: id,
            name: name.to_string(),
        };
        machine.emit(SIM_TEAM_ID, false, DebugEventKind::ThreadCreated { new_thread });
        id
    }

    fn thread_info(id: ThreadId, thread: &SimThread) -> ThreadInfo {
        ThreadInfo {
            team_id: SIM_TEAM_ID,
            thread_id: id,
            name: thread.name.clone(),
        }
    }
}

impl Machine {
    fn emit(&self, thread: ThreadId, stopped: bool, kind: DebugEventKind) {
        if let Some(tx) = &self.events {
            let _ = tx.send(DebugEvent::new(SIM_TEAM_ID, thread, stopped, kind));
        }
    }

    fn map(&mut self, program: Program) -> ImageInfo {
        let image_id = self.next_image_id;
        self.next_image_id += 1;
        let info = program.image_info(SIM_TEAM_ID, image_id);
        self.regions.push(Region {
            base: program.text_base(),
            bytes: program.text().to_vec(),
            image: Some(image_id),
        });
        self.regions.push(Region {
            base: program.data_base(),
            bytes: program.data().to_vec(),
            image: Some(image_id),
        });
        debug!("Mapped {} as image {} at {:#x}", program.path(), image_id, program.text_base());
        self.images.insert(image_id, (program, info.clone()));
        info
    }

    /// Creates (or resets) a thread with a fresh stack in stack slot `slot`.
    fn create_thread(&mut self, id: ThreadId, name: &str, entry: TargetAddr, slot: u64) {
        let top = STACK_TOP - slot * STACK_SPACING;
        let base = top - STACK_SIZE;
        self.regions.retain(|region| !(region.image.is_none() && region.base == base));
        self.regions.push(Region {
            base,
            bytes: vec![0; STACK_SIZE as usize],
            image: None,
        });
        let cpu = CpuState::new(entry, top - 16, 0, vec![0; REGISTER_COUNT]);
        self.threads.insert(
            id,
            SimThread {
                name: name.to_string(),
                state: ThreadState::Stopped,
                cpu,
                pending_signal: None,
            },
        );
    }

    fn region(&self, address: TargetAddr, size: usize) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(address, size))
    }

    fn read(&self, address: TargetAddr, size: usize) -> DebuggerResult<Vec<u8>> {
        let region = self
            .region(address, size)
            .ok_or(DebuggerError::BadAddress(address))?;
        let offset = (address - region.base) as usize;
        Ok(region.bytes[offset..offset + size].to_vec())
    }

    fn write(&mut self, address: TargetAddr, data: &[u8]) -> DebuggerResult<()> {
        let region = self
            .regions
            .iter_mut()
            .find(|region| region.contains(address, data.len()))
            .ok_or(DebuggerError::BadAddress(address))?;
        let offset = (address - region.base) as usize;
        region.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_u64(&self, address: TargetAddr) -> Result<u64, Fault> {
        let bytes = self.read(address, 8).map_err(|_| SEGMENT_VIOLATION)?;
        Ok((&bytes[..]).get_u64_le())
    }

    fn write_u64(&mut self, address: TargetAddr, value: u64) -> Result<(), Fault> {
        self.write(address, &value.to_le_bytes())
            .map_err(|_| SEGMENT_VIOLATION)
    }

    fn push(&mut self, cpu: &mut CpuState, value: u64) -> Result<(), Fault> {
        let sp = cpu.stack_pointer.wrapping_sub(8);
        self.write_u64(sp, value)?;
        cpu.stack_pointer = sp;
        Ok(())
    }

    fn pop(&self, cpu: &mut CpuState) -> Result<u64, Fault> {
        let value = self.read_u64(cpu.stack_pointer)?;
        cpu.stack_pointer += 8;
        Ok(value)
    }

    fn fetch(&self, address: TargetAddr) -> Result<Vec<u8>, Fault> {
        let region = self.region(address, 1).ok_or(SEGMENT_VIOLATION)?;
        let offset = (address - region.base) as usize;
        let end = (offset + MAX_INSTRUCTION_SIZE).min(region.bytes.len());
        Ok(region.bytes[offset..end].to_vec())
    }

    fn watchpoint_hit(&self, address: TargetAddr, size: usize, write: bool) -> bool {
        self.watchpoints.iter().any(|(watched, (watch_type, length))| {
            let overlaps = address < watched + *length as u64 && *watched < address + size as u64;
            let matches = match watch_type {
                WatchpointType::Read => !write,
                WatchpointType::Write => write,
                WatchpointType::ReadWrite => true,
            };
            overlaps && matches
        })
    }

    /// Runs a stopped thread until it stops, exits or runs out of budget.
    fn run_thread(&mut self, id: ThreadId, single_step: bool) {
        let Some(resume_address) = self.threads.get(&id).map(|t| t.cpu.instruction_pointer) else {
            return;
        };
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.state = ThreadState::Running;
            self.architecture.leave_syscall_return(&thread.cpu);
        }
        self.deliver_signal(id);

        if single_step {
            if let Some(thread) = self.threads.get(&id) {
                self.single_step_log.push(thread.cpu.instruction_pointer);
            }
            match self.execute(id) {
                Step::Continue => {
                    let cpu_state = self.cpu_snapshot(id);
                    self.stop(id, DebugEventKind::SingleStep { cpu_state });
                }
                Step::Stop(kind) => self.stop(id, kind),
                Step::Exited => self.exit_thread(id),
            }
            return;
        }

        for executed in 0..STEP_BUDGET {
            let Some(address) = self.threads.get(&id).map(|t| t.cpu.instruction_pointer) else {
                return;
            };
            let resuming = executed == 0 && address == resume_address;
            if self.breakpoints.contains(&address) && !resuming {
                let cpu_state = self.cpu_snapshot(id);
                self.stop(id, DebugEventKind::BreakpointHit { cpu_state });
                return;
            }
            match self.execute(id) {
                Step::Continue => {}
                Step::Stop(kind) => {
                    self.stop(id, kind);
                    return;
                }
                Step::Exited => {
                    self.exit_thread(id);
                    return;
                }
            }
        }
        debug!("Thread {} used up its step budget", id);
    }

    fn deliver_signal(&mut self, id: ThreadId) {
        let Some(thread) = self.threads.get_mut(&id) else {
            return;
        };
        let Some(signal) = thread.pending_signal.take() else {
            return;
        };
        let Some(handler) = self.signal_handlers.get(&signal).copied() else {
            debug!("Thread {}: signal {} has no handler, dropped", id, signal);
            return;
        };
        let Some(mut cpu) = self.threads.get(&id).map(|t| t.cpu.clone()) else {
            return;
        };
        let return_address = cpu.instruction_pointer;
        if self.push(&mut cpu, return_address).is_ok() {
            cpu.instruction_pointer = handler;
            if let Some(thread) = self.threads.get_mut(&id) {
                thread.cpu = cpu;
            }
        }
    }

    fn cpu_snapshot(&self, id: ThreadId) -> Arc<CpuState> {
        Arc::new(
            self.threads
                .get(&id)
                .map(|t| t.cpu.clone())
                .unwrap_or_else(|| CpuState::new(0, 0, 0, vec![0; REGISTER_COUNT])),
        )
    }

    fn stop(&mut self, id: ThreadId, kind: DebugEventKind) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.state = ThreadState::Stopped;
            if matches!(kind, DebugEventKind::PostSyscall { .. }) {
                self.architecture.enter_syscall_return(&thread.cpu);
            }
        }
        self.emit(id, true, kind);
    }

    fn exit_thread(&mut self, id: ThreadId) {
        debug!("Thread {} exited", id);
        self.threads.remove(&id);
        self.emit(id, false, DebugEventKind::ThreadDeleted);
        if self.threads.is_empty() {
            info!("Last thread of team {} gone", SIM_TEAM_ID);
            self.emit(id, false, DebugEventKind::TeamDeleted);
        }
    }

    fn execute(&mut self, id: ThreadId) -> Step {
        let Some(mut cpu) = self.threads.get(&id).map(|t| t.cpu.clone()) else {
            return Step::Exited;
        };
        let step = match self.execute_instruction(id, &mut cpu) {
            Ok(step) => step,
            Err(fault) => Step::Stop(DebugEventKind::ExceptionOccurred {
                exception: fault.to_string(),
                cpu_state: Some(Arc::new(cpu.clone())),
            }),
        };
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.cpu = cpu;
        }
        step
    }

    /// Executes one instruction. On a fault `cpu` is left as it was.
    fn execute_instruction(&mut self, id: ThreadId, cpu: &mut CpuState) -> Result<Step, Fault> {
        let address = cpu.instruction_pointer;
        let code = self.fetch(address)?;
        let instruction = Instruction::decode(&code).map_err(|_| "illegal instruction")?;
        let next = address + instruction.size() as u64;
        let mut updated = cpu.clone();
        updated.instruction_pointer = next;

        let step = match instruction {
            Instruction::Nop => Step::Continue,
            Instruction::Enter => {
                self.push(&mut updated, cpu.frame_pointer)?;
                updated.frame_pointer = updated.stack_pointer;
                Step::Continue
            }
            Instruction::Leave => {
                updated.stack_pointer = cpu.frame_pointer;
                updated.frame_pointer = self.pop(&mut updated)?;
                Step::Continue
            }
            Instruction::Ret => {
                let return_address = self.pop(&mut updated)?;
                if return_address == 0 {
                    return Ok(Step::Exited);
                }
                updated.instruction_pointer = return_address;
                Step::Continue
            }
            Instruction::Hlt => return Ok(Step::Exited),
            Instruction::Call { .. } | Instruction::Jmp { .. } => {
                if matches!(instruction, Instruction::Call { .. }) {
                    self.push(&mut updated, next)?;
                }
                updated.instruction_pointer = instruction.branch_target(address).unwrap_or(next);
                Step::Continue
            }
            Instruction::Jnz { register, .. } => {
                if updated.registers[register as usize] != 0 {
                    updated.instruction_pointer = instruction.branch_target(address).unwrap_or(next);
                }
                Step::Continue
            }
            Instruction::Mov { register, value } => {
                updated.registers[register as usize] = value as u64;
                Step::Continue
            }
            Instruction::Add { register, value } => {
                let slot = &mut updated.registers[register as usize];
                *slot = slot.wrapping_add(value as i64 as u64);
                Step::Continue
            }
            Instruction::Store { register, address } => {
                let target = address as TargetAddr;
                self.write_u64(target, updated.registers[register as usize])?;
                if self.watchpoint_hit(target, 8, true) {
                    Step::Stop(DebugEventKind::WatchpointHit {
                        cpu_state: Arc::new(updated.clone()),
                    })
                } else {
                    Step::Continue
                }
            }
            Instruction::Load { register, address } => {
                let source = address as TargetAddr;
                updated.registers[register as usize] = self.read_u64(source)?;
                if self.watchpoint_hit(source, 8, false) {
                    Step::Stop(DebugEventKind::WatchpointHit {
                        cpu_state: Arc::new(updated.clone()),
                    })
                } else {
                    Step::Continue
                }
            }
            Instruction::Debugger => Step::Stop(DebugEventKind::DebuggerCall {
                message: updated.registers[0],
            }),
            Instruction::Fault => return Err("general protection fault"),
            Instruction::Syscall { number } => self.syscall(id, number, &mut updated),
        };
        *cpu = updated;
        Ok(step)
    }

    fn syscall(&mut self, id: ThreadId, number: u8, cpu: &mut CpuState) -> Step {
        let registers = cpu.registers.clone();
        let (arguments, return_value) = match number {
            SYS_WRITE => {
                let (fd, buffer, length) = (registers[0], registers[1], registers[2]);
                let result = match self.read(buffer, length as usize) {
                    Ok(_) => length as i64,
                    Err(_) => -14,
                };
                (vec![fd, buffer, length], result)
            }
            SYS_RAISE => {
                let signal = registers[0] as i32;
                if let Some(thread) = self.threads.get_mut(&id) {
                    thread.pending_signal = Some(signal);
                }
                cpu.registers[0] = 0;
                return Step::Stop(DebugEventKind::SignalReceived {
                    signal,
                    handler: self.signal_handlers.get(&signal).copied(),
                });
            }
            SYS_SET_SIGNAL_HANDLER => {
                self.signal_handlers
                    .insert(registers[0] as i32, registers[1]);
                (vec![registers[0], registers[1]], 0)
            }
            _ => (Vec::new(), -38),
        };
        cpu.registers[0] = return_value as u64;
        Step::Stop(DebugEventKind::PostSyscall {
            syscall: SyscallInfo {
                syscall: number as u32,
                arguments,
                return_value,
            },
        })
    }
}

#[async_trait]
impl TeamMemory for SimulatedTarget {
    async fn read_memory(&self, address: TargetAddr, size: usize) -> DebuggerResult<Vec<u8>> {
        self.machine.lock().read(address, size)
    }

    async fn write_memory(&self, address: TargetAddr, data: &[u8]) -> DebuggerResult<usize> {
        self.machine.lock().write(address, data)?;
        Ok(data.len())
    }
}

#[async_trait]
impl DebuggerInterface for SimulatedTarget {
    fn team_id(&self) -> TeamId {
        SIM_TEAM_ID
    }

    fn architecture(&self) -> Arc<dyn Architecture> {
        self.architecture.clone()
    }

    async fn next_debug_event(&self) -> DebuggerResult<DebugEvent> {
        self.port
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| DebuggerError::TargetIo("debug port closed".to_string()))
    }

    async fn continue_thread(&self, thread: ThreadId) -> DebuggerResult<()> {
        let mut machine = self.machine.lock();
        if machine.failing_resumes {
            return Err(DebuggerError::TargetIo(format!("cannot resume thread {}", thread)));
        }
        let state = machine
            .threads
            .get(&thread)
            .map(|t| t.state)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {}", thread)))?;
        if state == ThreadState::Stopped {
            machine.run_thread(thread, false);
        }
        Ok(())
    }

    async fn stop_thread(&self, thread: ThreadId) -> DebuggerResult<()> {
        let mut machine = self.machine.lock();
        let sim_thread = machine
            .threads
            .get_mut(&thread)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {}", thread)))?;
        if sim_thread.state != ThreadState::Running {
            return Ok(());
        }
        sim_thread.state = ThreadState::Stopped;
        let cpu_state = Some(Arc::new(sim_thread.cpu.clone()));
        machine.emit(thread, true, DebugEventKind::ThreadDebugged { cpu_state });
        Ok(())
    }

    async fn single_step_thread(&self, thread: ThreadId) -> DebuggerResult<()> {
        let mut machine = self.machine.lock();
        if machine.failing_resumes {
            return Err(DebuggerError::TargetIo(format!("cannot step thread {}", thread)));
        }
        let state = machine
            .threads
            .get(&thread)
            .map(|t| t.state)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {}", thread)))?;
        if state != ThreadState::Stopped {
            return Err(DebuggerError::InvalidState(format!("thread {} is not stopped", thread)));
        }
        machine.run_thread(thread, true);
        Ok(())
    }

    async fn install_breakpoint(&self, address: TargetAddr) -> DebuggerResult<()> {
        let mut machine = self.machine.lock();
        if machine.failing_installs.contains(&address) {
            return Err(DebuggerError::TargetIo(format!("cannot write breakpoint at {:#x}", address)));
        }
        if machine.region(address, 1).is_none() {
            return Err(DebuggerError::BadAddress(address));
        }
        machine.breakpoints.insert(address);
        *machine.install_counts.entry(address).or_default() += 1;
        Ok(())
    }

    async fn uninstall_breakpoint(&self, address: TargetAddr) -> DebuggerResult<()> {
        let mut machine = self.machine.lock();
        *machine.uninstall_counts.entry(address).or_default() += 1;
        if machine.breakpoints.remove(&address) {
            Ok(())
        } else {
            Err(DebuggerError::NotFound(format!("breakpoint at {:#x}", address)))
        }
    }

    async fn install_watchpoint(
        &self,
        address: TargetAddr,
        watch_type: WatchpointType,
        length: usize,
    ) -> DebuggerResult<()> {
        self.machine
            .lock()
            .watchpoints
            .insert(address, (watch_type, length));
        Ok(())
    }

    async fn uninstall_watchpoint(&self, address: TargetAddr) -> DebuggerResult<()> {
        let mut machine = self.machine.lock();
        if machine.failing_watchpoint_removals.contains(&address) {
            return Err(DebuggerError::TargetIo(format!("cannot clear watchpoint at {:#x}", address)));
        }
        match machine.watchpoints.remove(&address) {
            Some(_) => Ok(()),
            None => Err(DebuggerError::NotFound(format!("watchpoint at {:#x}", address))),
        }
    }

    async fn get_cpu_state(&self, thread: ThreadId) -> DebuggerResult<CpuState> {
        let machine = self.machine.lock();
        let sim_thread = machine
            .threads
            .get(&thread)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {}", thread)))?;
        if sim_thread.state != ThreadState::Stopped {
            return Err(DebuggerError::InvalidState(format!("thread {} is running", thread)));
        }
        Ok(sim_thread.cpu.clone())
    }

    async fn set_cpu_state(&self, thread: ThreadId, state: &CpuState) -> DebuggerResult<()> {
        let mut machine = self.machine.lock();
        let sim_thread = machine
            .threads
            .get_mut(&thread)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {}", thread)))?;
        if sim_thread.state != ThreadState::Stopped {
            return Err(DebuggerError::InvalidState(format!("thread {} is running", thread)));
        }
        self.architecture.leave_syscall_return(&sim_thread.cpu);
        sim_thread.cpu = state.clone();
        Ok(())
    }

    async fn get_team_info(&self) -> DebuggerResult<TeamInfo> {
        let machine = self.machine.lock();
        Ok(TeamInfo {
            team_id: SIM_TEAM_ID,
            name: machine.team_name.clone(),
            arguments: vec![machine.team_name.clone()],
        })
    }

    async fn get_thread_infos(&self) -> DebuggerResult<Vec<ThreadInfo>> {
        let machine = self.machine.lock();
        Ok(machine
            .threads
            .iter()
            .map(|(id, thread)| Self::thread_info(*id, thread))
            .collect())
    }

    async fn get_thread_info(&self, thread: ThreadId) -> DebuggerResult<ThreadInfo> {
        let machine = self.machine.lock();
        machine
            .threads
            .get(&thread)
            .map(|sim_thread| Self::thread_info(thread, sim_thread))
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {}", thread)))
    }

    async fn get_image_infos(&self) -> DebuggerResult<Vec<ImageInfo>> {
        Ok(self
            .machine
            .lock()
            .images
            .values()
            .map(|(_, info)| info.clone())
            .collect())
    }

    async fn get_symbol_address(&self, image: ImageId, name: &str) -> DebuggerResult<TargetAddr> {
        let machine = self.machine.lock();
        let (program, _) = machine
            .images
            .get(&image)
            .ok_or_else(|| DebuggerError::NotFound(format!("image {}", image)))?;
        program
            .symbol(name)
            .ok_or_else(|| DebuggerError::NotFound(format!("symbol '{}' in {}", name, program.path())))
    }

    async fn close(&self, kill_team: bool) -> DebuggerResult<()> {
        let mut machine = self.machine.lock();
        machine.events = None;
        if kill_team {
            info!("Killing simulated team {}", SIM_TEAM_ID);
            machine.threads.clear();
        }
        Ok(())
    }
}

/// Serves debug info straight from the programs mapped into a target.
pub struct SimDebugInfoProvider {
    target: Arc<SimulatedTarget>,
}

impl SimDebugInfoProvider {
    pub fn new(target: Arc<SimulatedTarget>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl ImageDebugInfoProvider for SimDebugInfoProvider {
    async fn load_image_debug_info(&self, image: &ImageInfo) -> DebuggerResult<Option<ImageDebugInfo>> {
        // System images never carry line info.
        if image.image_type == ImageType::System {
            return Ok(None);
        }
        Ok(self
            .target
            .program(image.image_id)
            .map(|program| program.debug_info(image.image_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ProgramBuilder;

    fn counter() -> Program {
        let mut builder = ProgramBuilder::new("counter", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).mov(0, 2);
        builder.label("again").line(3).add(0, -1);
        builder.line(4).jnz(0, "again");
        builder.line(5).store(0, 0x11000);
        builder.line(6).leave().ret();
        builder.build().unwrap()
    }

    async fn next_event(target: &SimulatedTarget) -> DebugEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), target.next_debug_event())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_breakpoint_then_resume_past_it() {
        let program = counter();
        let target = SimulatedTarget::launch(program.clone());
        let again = program.symbol("again").unwrap();
        target.install_breakpoint(again).await.unwrap();

        target.continue_thread(SIM_TEAM_ID).await.unwrap();
        let event = next_event(&target).await;
        assert!(matches!(event.kind, DebugEventKind::BreakpointHit { ref cpu_state } if cpu_state.instruction_pointer == again));
        assert!(event.thread_stopped);

        // Resuming at the breakpoint executes the instruction, the loop hits
        // it again.
        target.continue_thread(SIM_TEAM_ID).await.unwrap();
        let event = next_event(&target).await;
        let DebugEventKind::BreakpointHit { cpu_state } = event.kind else {
            panic!("expected a breakpoint hit, got {}", event.name());
        };
        assert_eq!(cpu_state.register(0), Some(1));
    }

    #[tokio::test]
    async fn test_watchpoint_and_exit() {
        let target = SimulatedTarget::launch(counter());
        target
            .install_watchpoint(0x11000, WatchpointType::Write, 8)
            .await
            .unwrap();

        target.continue_thread(SIM_TEAM_ID).await.unwrap();
        let event = next_event(&target).await;
        assert!(matches!(event.kind, DebugEventKind::WatchpointHit { .. }));
        assert_eq!(target.read_memory(0x11000, 8).await.unwrap(), vec![0; 8]);

        target.continue_thread(SIM_TEAM_ID).await.unwrap();
        assert!(matches!(next_event(&target).await.kind, DebugEventKind::ThreadDeleted));
        assert!(matches!(next_event(&target).await.kind, DebugEventKind::TeamDeleted));
        assert!(!target.is_alive());
    }

    #[tokio::test]
    async fn test_single_step_and_faults() {
        let mut builder = ProgramBuilder::new("faulty", 0x1000);
        builder.function("main").line(1).nop().fault();
        let program = builder.build().unwrap();
        let target = SimulatedTarget::launch(program.clone());

        target.single_step_thread(SIM_TEAM_ID).await.unwrap();
        let event = next_event(&target).await;
        assert!(matches!(event.kind, DebugEventKind::SingleStep { ref cpu_state } if cpu_state.instruction_pointer == program.symbol("main").unwrap()));
        assert_eq!(target.single_step_log(), vec![program.entry()]);

        target.continue_thread(SIM_TEAM_ID).await.unwrap();
        let event = next_event(&target).await;
        let DebugEventKind::ExceptionOccurred { exception, cpu_state } = event.kind else {
            panic!("expected an exception, got {}", event.name());
        };
        assert_eq!(exception, "general protection fault");
        assert_eq!(cpu_state.unwrap().instruction_pointer, program.symbol("main").unwrap() + 1);
        assert!(target.get_cpu_state(SIM_TEAM_ID).await.is_ok());
    }

    #[tokio::test]
    async fn test_uninstall_counts_misses() {
        let target = SimulatedTarget::launch(counter());
        assert!(target.uninstall_breakpoint(0x1000).await.is_err());
        assert_eq!(target.uninstall_count(0x1000), 1);
        assert!(matches!(
            target.install_breakpoint(0x9000_0000).await,
            Err(DebuggerError::BadAddress(_))
        ));
    }
}
