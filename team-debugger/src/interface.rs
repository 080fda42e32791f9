// Target control surface
//
// The OS-level operations the engine needs from the debuggee: thread control,
// breakpoint installation, register access and memory I/O

use crate::architecture::Architecture;
use crate::cpu_state::CpuState;
use crate::error::DebuggerResult;
use crate::events::DebugEvent;
use crate::image::ImageInfo;
use crate::thread::ThreadInfo;
use crate::types::{ImageId, TargetAddr, TeamId, ThreadId, WatchpointType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamInfo {
    pub team_id: TeamId,
    pub name: String,
    pub arguments: Vec<String>,
}

#[async_trait]
pub trait TeamMemory: Send + Sync {
    async fn read_memory(&self, address: TargetAddr, size: usize) -> DebuggerResult<Vec<u8>>;

    async fn write_memory(&self, address: TargetAddr, data: &[u8]) -> DebuggerResult<usize>;

    /// Reads a NUL-terminated string of at most `max_length` bytes.
    async fn read_memory_string(&self, address: TargetAddr, max_length: usize) -> DebuggerResult<String> {
        let mut bytes = Vec::new();
        let mut cursor = address;
        while bytes.len() < max_length {
            let chunk = (max_length - bytes.len()).min(64);
            let data = match self.read_memory(cursor, chunk).await {
                Ok(data) => data,
                Err(e) if bytes.is_empty() => return Err(e),
                Err(_) => break,
            };
            if let Some(end) = data.iter().position(|b| *b == 0) {
                bytes.extend_from_slice(&data[..end]);
                break;
            }
            bytes.extend_from_slice(&data);
            cursor += data.len() as TargetAddr;
            if data.len() < chunk {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
pub trait DebuggerInterface: Send + Sync {
    fn team_id(&self) -> TeamId;

    fn architecture(&self) -> Arc<dyn Architecture>;

    fn is_post_mortem(&self) -> bool {
        false
    }

    /// Blocks until the next debug event is available. Returns an error once
    /// the debug port is gone.
    async fn next_debug_event(&self) -> DebuggerResult<DebugEvent>;

    async fn continue_thread(&self, thread: ThreadId) -> DebuggerResult<()>;

    async fn stop_thread(&self, thread: ThreadId) -> DebuggerResult<()>;

    async fn single_step_thread(&self, thread: ThreadId) -> DebuggerResult<()>;

    async fn install_breakpoint(&self, address: TargetAddr) -> DebuggerResult<()>;

    async fn uninstall_breakpoint(&self, address: TargetAddr) -> DebuggerResult<()>;

    async fn install_watchpoint(
        &self,
        address: TargetAddr,
        watch_type: WatchpointType,
        length: usize,
    ) -> DebuggerResult<()>;

    async fn uninstall_watchpoint(&self, address: TargetAddr) -> DebuggerResult<()>;

    async fn get_cpu_state(&self, thread: ThreadId) -> DebuggerResult<CpuState>;

    async fn set_cpu_state(&self, thread: ThreadId, state: &CpuState) -> DebuggerResult<()>;

    async fn get_team_info(&self) -> DebuggerResult<TeamInfo>;

    async fn get_thread_infos(&self) -> DebuggerResult<Vec<ThreadInfo>>;

    async fn get_thread_info(&self, thread: ThreadId) -> DebuggerResult<ThreadInfo>;

    async fn get_image_infos(&self) -> DebuggerResult<Vec<ImageInfo>>;

    async fn get_symbol_address(&self, image: ImageId, name: &str) -> DebuggerResult<TargetAddr>;

    /// Detaches from the team, killing it if requested.
    async fn close(&self, kill_team: bool) -> DebuggerResult<()>;
}
