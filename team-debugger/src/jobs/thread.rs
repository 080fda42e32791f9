// Thread state jobs
//
// Fetch thread state, CPU state and stack traces from the target and
// publish them on the Thread, unless the thread moved on meanwhile.

use super::{image_job_key, thread_job_key, LoadImageDebugInfoJob};
use crate::architecture::Architecture;
use crate::cpu_state::CpuState;
use crate::debug_info::ImageDebugInfoProvider;
use crate::error::{DebuggerError, DebuggerResult};
use crate::image::ImageDebugInfoState;
use crate::interface::{DebuggerInterface, TeamMemory};
use crate::team::Team;
use crate::types::{StoppedReason, ThreadId, ThreadState};
use crate::worker::{Job, JobContext, JobKey, JobType};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Initial state query for a newly known thread.
pub struct GetThreadStateJob {
    team: Arc<Team>,
    interface: Arc<dyn DebuggerInterface>,
    thread: ThreadId,
}

impl GetThreadStateJob {
    pub fn new(team: Arc<Team>, interface: Arc<dyn DebuggerInterface>, thread: ThreadId) -> Self {
        Self {
            team,
            interface,
            thread,
        }
    }
}

#[async_trait]
impl Job for GetThreadStateJob {
    fn key(&self) -> JobKey {
        thread_job_key(self.thread, JobType::GetThreadState)
    }

    fn description(&self) -> String {
        format!("Getting state of thread {}", self.thread)
    }

    async fn run(&self, _ctx: &JobContext) -> DebuggerResult<()> {
        let result = self.interface.get_cpu_state(self.thread).await;

        self.team.with(|t| {
            match t.thread(self.thread) {
                Some(thread) if thread.state() == ThreadState::Unknown => {}
                _ => return Ok(()),
            }
            match result {
                Ok(cpu_state) => {
                    t.set_thread_state(
                        self.thread,
                        ThreadState::Stopped,
                        Some(Arc::new(cpu_state)),
                        StoppedReason::Unknown,
                        String::new(),
                    );
                    Ok(())
                }
                Err(DebuggerError::InvalidState(_)) => {
                    t.set_thread_state(
                        self.thread,
                        ThreadState::Running,
                        None,
                        StoppedReason::Unknown,
                        String::new(),
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }
}

/// Fills in the CPU state of a thread that stopped without one.
pub struct GetCpuStateJob {
    team: Arc<Team>,
    interface: Arc<dyn DebuggerInterface>,
    thread: ThreadId,
}

impl GetCpuStateJob {
    pub fn new(team: Arc<Team>, interface: Arc<dyn DebuggerInterface>, thread: ThreadId) -> Self {
        Self {
            team,
            interface,
            thread,
        }
    }
}

#[async_trait]
impl Job for GetCpuStateJob {
    fn key(&self) -> JobKey {
        thread_job_key(self.thread, JobType::GetCpuState)
    }

    fn description(&self) -> String {
        format!("Getting CPU state of thread {}", self.thread)
    }

    async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
        let still_needed = self.team.read(|t| {
            t.thread(self.thread)
                .is_some_and(|thread| thread.state() == ThreadState::Stopped && thread.cpu_state().is_none())
        });
        if !still_needed {
            return Ok(());
        }

        let cpu_state = self.interface.get_cpu_state(self.thread).await?;
        ctx.check_aborted()?;

        self.team.with(|t| {
            if t.thread(self.thread)
                .is_some_and(|thread| thread.state() == ThreadState::Stopped && thread.cpu_state().is_none())
            {
                t.set_thread_cpu_state(self.thread, Some(Arc::new(cpu_state)));
            }
        });
        Ok(())
    }
}

/// Unwinds a stopped thread's stack and resolves the frames' functions,
/// loading image debug info on the way where needed.
pub struct GetStackTraceJob {
    team: Arc<Team>,
    memory: Arc<dyn TeamMemory>,
    architecture: Arc<dyn Architecture>,
    provider: Arc<dyn ImageDebugInfoProvider>,
    thread: ThreadId,
    max_frames: usize,
}

impl GetStackTraceJob {
    pub fn new(
        team: Arc<Team>,
        memory: Arc<dyn TeamMemory>,
        architecture: Arc<dyn Architecture>,
        provider: Arc<dyn ImageDebugInfoProvider>,
        thread: ThreadId,
        max_frames: usize,
    ) -> Self {
        Self {
            team,
            memory,
            architecture,
            provider,
            thread,
            max_frames,
        }
    }

    fn current_cpu_state(&self) -> Option<Arc<CpuState>> {
        self.team
            .read(|t| t.thread(self.thread).and_then(|thread| thread.cpu_state().cloned()))
    }
}

#[async_trait]
impl Job for GetStackTraceJob {
    fn key(&self) -> JobKey {
        thread_job_key(self.thread, JobType::GetStackTrace)
    }

    fn description(&self) -> String {
        format!("Getting stack trace of thread {}", self.thread)
    }

    async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
        let Some(cpu_state) = self.current_cpu_state() else {
            return Ok(());
        };
        if self
            .team
            .read(|t| t.thread(self.thread).is_some_and(|thread| thread.stack_trace().is_some()))
        {
            return Ok(());
        }

        let mut stack_trace = self
            .architecture
            .create_stack_trace(self.memory.as_ref(), cpu_state.clone(), self.max_frames)
            .await?;
        ctx.check_aborted()?;

        // Make sure the debug info of every involved image is there.
        let images: BTreeSet<_> = self.team.read(|t| {
            stack_trace
                .frames()
                .iter()
                .filter_map(|frame| t.image_by_address(frame.instruction_pointer))
                .filter(|image| !image.debug_info_state().is_final())
                .map(|image| image.id())
                .collect()
        });
        for image_id in images {
            let state = LoadImageDebugInfoJob::schedule_if_necessary(
                ctx.worker(),
                &self.team,
                image_id,
                &self.provider,
                None,
            );
            if let Ok(ImageDebugInfoState::Loading) | Ok(ImageDebugInfoState::NotLoaded) = state {
                let status = ctx.wait_for(image_job_key(image_id)).await;
                debug!("Debug info of image {} for stack trace: {:?}", image_id, status);
            }
            ctx.check_aborted()?;
        }

        self.team.read(|t| {
            for frame in stack_trace.frames_mut() {
                frame.image_id = t.image_by_address(frame.instruction_pointer).map(|i| i.id());
                frame.function = t.debug_info().function_at_address(frame.instruction_pointer);
            }
        });

        let published = self.team.with(|t| {
            let current = t.thread(self.thread).and_then(|thread| thread.cpu_state().cloned());
            match current {
                Some(current) if Arc::ptr_eq(&current, &cpu_state) => {
                    t.set_thread_stack_trace(self.thread, Some(Arc::new(stack_trace)))
                }
                _ => false,
            }
        });
        if !published {
            debug!("Thread {} moved on, dropping stack trace", self.thread);
            return Err(DebuggerError::Aborted);
        }
        Ok(())
    }
}
