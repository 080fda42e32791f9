// Memory jobs

use crate::error::{DebuggerError, DebuggerResult};
use crate::interface::TeamMemory;
use crate::memory_block::{TeamMemoryBlock, TeamMemoryBlockManager};
use crate::team::Team;
use crate::types::TargetAddr;
use crate::worker::{Job, JobContext, JobKey, JobType};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

static NEXT_WRITE: AtomicU64 = AtomicU64::new(1);

/// Fills a memory block from the target and notifies its listeners.
pub struct RetrieveMemoryBlockJob {
    memory: Arc<dyn TeamMemory>,
    block: Arc<TeamMemoryBlock>,
}

impl RetrieveMemoryBlockJob {
    pub fn new(memory: Arc<dyn TeamMemory>, block: Arc<TeamMemoryBlock>) -> Self {
        Self { memory, block }
    }
}

#[async_trait]
impl Job for RetrieveMemoryBlockJob {
    fn key(&self) -> JobKey {
        JobKey::new(self.block.base_address(), JobType::RetrieveMemoryBlock)
    }

    fn description(&self) -> String {
        format!("Reading memory at {:#x}", self.block.base_address())
    }

    async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
        let result = self
            .memory
            .read_memory(self.block.base_address(), self.block.size())
            .await;
        ctx.check_aborted()?;
        match result {
            Ok(data) => {
                self.block.set_data(data);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to read memory block {:#x}: {}", self.block.base_address(), e);
                self.block.notify_failed(&e.to_string());
                Err(e)
            }
        }
    }
}

/// Writes bytes to the target, invalidating cached blocks over the range.
pub struct WriteMemoryJob {
    id: u64,
    team: Arc<Team>,
    memory: Arc<dyn TeamMemory>,
    blocks: Arc<TeamMemoryBlockManager>,
    address: TargetAddr,
    data: Vec<u8>,
}

impl WriteMemoryJob {
    pub fn new(
        team: Arc<Team>,
        memory: Arc<dyn TeamMemory>,
        blocks: Arc<TeamMemoryBlockManager>,
        address: TargetAddr,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id: NEXT_WRITE.fetch_add(1, Ordering::SeqCst),
            team,
            memory,
            blocks,
            address,
            data,
        }
    }
}

#[async_trait]
impl Job for WriteMemoryJob {
    fn key(&self) -> JobKey {
        JobKey::new(self.id, JobType::WriteMemory)
    }

    fn description(&self) -> String {
        format!("Writing {} bytes at {:#x}", self.data.len(), self.address)
    }

    async fn run(&self, _ctx: &JobContext) -> DebuggerResult<()> {
        let written = self.memory.write_memory(self.address, &self.data).await?;
        self.blocks.invalidate(self.address, self.data.len());
        self.team
            .with(|t| t.notify_memory_changed(self.address, written));
        if written < self.data.len() {
            return Err(DebuggerError::TargetIo(format!(
                "wrote {} of {} bytes at {:#x}",
                written,
                self.data.len(),
                self.address
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_block::{TeamMemoryBlockListener, MEMORY_BLOCK_SIZE};
    use crate::sim::{ProgramBuilder, SimulatedTarget};
    use crate::team::{TeamEvent, TeamListener};
    use crate::worker::{JobWaitStatus, Worker};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Blocks {
        retrieved: Mutex<Vec<TargetAddr>>,
        failed: Mutex<Vec<TargetAddr>>,
    }

    impl TeamMemoryBlockListener for Blocks {
        fn memory_block_retrieved(&self, block: &Arc<TeamMemoryBlock>) {
            self.retrieved.lock().push(block.base_address());
        }

        fn memory_block_retrieval_failed(&self, block: &Arc<TeamMemoryBlock>, _error: &str) {
            self.failed.lock().push(block.base_address());
        }
    }

    #[derive(Default)]
    struct Changes(Mutex<Vec<TeamEvent>>);

    impl TeamListener for Changes {
        fn team_event(&self, event: &TeamEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn target() -> Arc<SimulatedTarget> {
        let mut builder = ProgramBuilder::new("memory", 0x1000);
        builder.function("main").line(1).nop().ret();
        SimulatedTarget::launch(builder.build().unwrap())
    }

    #[tokio::test]
    async fn test_retrieve_and_fail() {
        let target = target();
        let manager = TeamMemoryBlockManager::new();
        let listener = Arc::new(Blocks::default());
        let worker = Worker::new(2);

        let text = manager.get_memory_block(0x1000);
        text.add_listener(listener.clone());
        let job = Arc::new(RetrieveMemoryBlockJob::new(target.clone(), text.clone()));
        let key = job.key();
        worker.schedule_job(job, None).unwrap();
        assert_eq!(worker.wait_for(key).await, JobWaitStatus::Succeeded);
        assert_eq!(text.data().map(|d| d.len()), Some(MEMORY_BLOCK_SIZE));
        assert_eq!(*listener.retrieved.lock(), vec![0x1000]);

        let unmapped = manager.get_memory_block(0xdead_0000);
        unmapped.add_listener(listener.clone());
        let job = Arc::new(RetrieveMemoryBlockJob::new(target.clone(), unmapped.clone()));
        let key = job.key();
        worker.schedule_job(job, None).unwrap();
        assert_eq!(worker.wait_for(key).await, JobWaitStatus::Failed);
        assert!(!unmapped.is_valid());
        assert_eq!(*listener.failed.lock(), vec![0xdead_0000]);
    }

    #[tokio::test]
    async fn test_write_invalidates_blocks() {
        let target = target();
        let team = Arc::new(Team::new(1, "memory"));
        let changes = Arc::new(Changes::default());
        team.add_listener(changes.clone());
        let manager = Arc::new(TeamMemoryBlockManager::new());
        let block = manager.get_memory_block(0x1000);
        block.set_data(vec![0; MEMORY_BLOCK_SIZE]);

        let worker = Worker::new(1);
        let job = Arc::new(WriteMemoryJob::new(
            team,
            target.clone(),
            manager.clone(),
            0x1000,
            vec![0x90, 0x90],
        ));
        let key = job.key();
        worker.schedule_job(job, None).unwrap();
        assert_eq!(worker.wait_for(key).await, JobWaitStatus::Succeeded);

        assert!(!block.is_valid());
        assert_eq!(
            *changes.0.lock(),
            vec![TeamEvent::MemoryChanged {
                address: 0x1000,
                size: 2
            }]
        );
        assert_eq!(target.read_memory(0x1000, 2).await.unwrap(), vec![0x90, 0x90]);
    }
}
