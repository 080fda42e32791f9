// Debug report job
//
// Writes a plain text snapshot of the team: images, threads, and for
// stopped threads their registers and stack.

use crate::architecture::Architecture;
use crate::error::DebuggerResult;
use crate::interface::TeamMemory;
use crate::stack_trace::StackTrace;
use crate::team::Team;
use crate::types::{ThreadId, ThreadState};
use crate::worker::{Job, JobContext, JobKey, JobType};
use async_trait::async_trait;
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct GenerateReportJob {
    team: Arc<Team>,
    architecture: Arc<dyn Architecture>,
    memory: Arc<dyn TeamMemory>,
    path: PathBuf,
    max_frames: usize,
}

impl GenerateReportJob {
    pub fn new(
        team: Arc<Team>,
        architecture: Arc<dyn Architecture>,
        memory: Arc<dyn TeamMemory>,
        path: PathBuf,
        max_frames: usize,
    ) -> Self {
        Self {
            team,
            architecture,
            memory,
            path,
            max_frames,
        }
    }

    /// Published trace of a stopped thread, unwinding one if none is there yet.
    async fn stack_trace(&self, thread: ThreadId) -> Option<Arc<StackTrace>> {
        let (cpu_state, published) = self.team.read(|t| {
            let thread = t.thread(thread)?;
            Some((thread.cpu_state()?.clone(), thread.stack_trace().cloned()))
        })?;
        if published.is_some() {
            return published;
        }
        let mut trace = self
            .architecture
            .create_stack_trace(self.memory.as_ref(), cpu_state, self.max_frames)
            .await
            .ok()?;
        self.team.read(|t| {
            for frame in trace.frames_mut() {
                frame.function = t.debug_info().function_at_address(frame.instruction_pointer);
            }
        });
        Some(Arc::new(trace))
    }

    async fn render(&self) -> String {
        let mut out = String::new();
        let (header, threads) = self.team.read(|t| {
            let mut header = String::new();
            let _ = writeln!(header, "Debug report for team {} ({})", t.id(), t.name());
            let _ = writeln!(header, "Architecture: {}", self.architecture.name());
            let _ = writeln!(header, "\nLoaded images:");
            for image in t.images() {
                let info = image.info();
                let _ = writeln!(
                    header,
                    "  {:>4} {:<24} text {:#010x}-{:#010x} debug info: {:?}",
                    info.image_id,
                    info.name,
                    info.text_base,
                    info.text_base + info.text_size,
                    image.debug_info_state()
                );
            }
            let threads: Vec<_> = t.threads().cloned().collect();
            (header, threads)
        });
        out.push_str(&header);

        let _ = writeln!(out, "\nThreads:");
        for thread in threads {
            let _ = writeln!(
                out,
                "\n  thread {} \"{}\": {:?}",
                thread.id(),
                thread.name(),
                thread.state()
            );
            if thread.state() != ThreadState::Stopped {
                continue;
            }
            let _ = writeln!(
                out,
                "    stopped: {:?} {}",
                thread.stopped_reason(),
                thread.stopped_reason_info()
            );
            if let Some(cpu_state) = thread.cpu_state() {
                let _ = writeln!(
                    out,
                    "    ip {:#010x} sp {:#010x} fp {:#010x}",
                    cpu_state.instruction_pointer, cpu_state.stack_pointer, cpu_state.frame_pointer
                );
                for register in self.architecture.registers() {
                    if let Some(value) = cpu_state.register(register.index) {
                        let _ = writeln!(out, "    {:>6}: {:#018x}", register.name, value);
                    }
                }
            }
            if let Some(trace) = self.stack_trace(thread.id()).await {
                let _ = writeln!(out, "    frames:");
                for (index, frame) in trace.frames().iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "    {:>3} {:#010x} {:#010x} {}",
                        index,
                        frame.frame_address,
                        frame.instruction_pointer,
                        frame.function_name().unwrap_or("??")
                    );
                }
            }
        }
        out
    }
}

#[async_trait]
impl Job for GenerateReportJob {
    fn key(&self) -> JobKey {
        JobKey::new(self.team.id() as u32 as u64, JobType::GenerateReport)
    }

    fn description(&self) -> String {
        format!("Generating debug report {}", self.path.display())
    }

    async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
        let report = self.render().await;
        ctx.check_aborted()?;
        tokio::fs::write(&self.path, report).await?;
        info!("Wrote debug report to {}", self.path.display());
        let path = self.path.clone();
        self.team.with(|t| t.notify_debug_report_changed(path));
        Ok(())
    }
}
