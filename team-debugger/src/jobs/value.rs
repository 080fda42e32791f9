// Value node jobs
//
// Resolving a node first makes sure its parent has a value, scheduling or
// joining the parent's job and waiting on it. Children therefore never
// resolve before their parents.

use crate::architecture::Architecture;
use crate::cpu_state::CpuState;
use crate::error::{DebuggerError, DebuggerResult};
use crate::interface::{DebuggerInterface, TeamMemory};
use crate::team::Team;
use crate::types::ThreadId;
use crate::value::{
    resolve_child_location, Resolution, Value, ValueLoader, ValueLocation, ValueNode, ValueNodeContainer,
    ValueNodeId,
};
use crate::worker::{Job, JobContext, JobKey, JobType, JobWaitStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub fn resolve_job_key(container: &ValueNodeContainer, node: ValueNodeId) -> JobKey {
    JobKey::new(container.job_subject(node), JobType::ResolveValueNodeValue)
}

pub struct ResolveValueNodeValueJob {
    container: Arc<ValueNodeContainer>,
    node: ValueNodeId,
    architecture: Arc<dyn Architecture>,
    memory: Arc<dyn TeamMemory>,
    cpu_state: Option<Arc<CpuState>>,
}

impl ResolveValueNodeValueJob {
    pub fn new(
        container: Arc<ValueNodeContainer>,
        node: ValueNodeId,
        architecture: Arc<dyn Architecture>,
        memory: Arc<dyn TeamMemory>,
        cpu_state: Option<Arc<CpuState>>,
    ) -> Self {
        Self {
            container,
            node,
            architecture,
            memory,
            cpu_state,
        }
    }

    fn for_node(&self, node: ValueNodeId) -> Self {
        Self {
            container: self.container.clone(),
            node,
            architecture: self.architecture.clone(),
            memory: self.memory.clone(),
            cpu_state: self.cpu_state.clone(),
        }
    }

    fn node(&self, id: ValueNodeId) -> DebuggerResult<ValueNode> {
        self.container
            .node(id)
            .ok_or_else(|| DebuggerError::NotFound(format!("value node {}", id)))
    }

    /// Waits until the parent has a value, resolving it if nobody else does.
    async fn resolve_parent(&self, ctx: &JobContext, parent_id: ValueNodeId) -> DebuggerResult<ValueNode> {
        let parent = self.node(parent_id)?;
        match parent.value_state() {
            Resolution::Resolved(_) => return Ok(parent),
            Resolution::Failed(error) => {
                return Err(DebuggerError::Evaluation(format!("{}: {}", parent.name, error)))
            }
            Resolution::Unresolved => {}
        }

        let key = resolve_job_key(&self.container, parent_id);
        if ctx.worker().get_job(key).is_none() {
            match ctx.worker().schedule_job(Arc::new(self.for_node(parent_id)), None) {
                Ok(()) | Err(DebuggerError::AlreadyInProgress(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if ctx.wait_for(key).await == JobWaitStatus::Aborted {
            return Err(DebuggerError::Aborted);
        }

        let parent = self.node(parent_id)?;
        match parent.value_state() {
            Resolution::Resolved(_) => Ok(parent),
            Resolution::Failed(error) => Err(DebuggerError::Evaluation(format!("{}: {}", parent.name, error))),
            Resolution::Unresolved => Err(DebuggerError::Evaluation(format!(
                "{}: not resolved",
                parent.name
            ))),
        }
    }

    async fn resolve(&self, ctx: &JobContext, node: &ValueNode) -> DebuggerResult<()> {
        let location = match node.location_state() {
            Resolution::Resolved(location) => location.clone(),
            Resolution::Failed(error) => return Err(DebuggerError::Evaluation(error.clone())),
            Resolution::Unresolved => {
                let parent_id = node
                    .parent
                    .ok_or_else(|| DebuggerError::InvalidState(format!("{} has no location", node.name)))?;
                let parent = self.resolve_parent(ctx, parent_id).await?;
                let parent_value = parent
                    .value()
                    .ok_or_else(|| DebuggerError::InvalidState(format!("{} has no value", parent.name)))?;
                let location = resolve_child_location(
                    &node.kind,
                    &parent.value_type,
                    parent_value,
                    &node.value_type,
                    self.architecture.address_size(),
                )?;
                self.container.set_location(node.id, location.clone());
                location
            }
        };
        ctx.check_aborted()?;

        let loader = ValueLoader::new(
            self.architecture.as_ref(),
            self.memory.as_ref(),
            self.cpu_state.as_deref(),
        );
        let value = loader.load_value(&location, &node.value_type).await?;
        if !self.container.set_location_and_value(node.id, location, value) {
            debug!("Value node {} was resolved meanwhile", node.name);
        }
        Ok(())
    }
}

#[async_trait]
impl Job for ResolveValueNodeValueJob {
    fn key(&self) -> JobKey {
        resolve_job_key(&self.container, self.node)
    }

    fn description(&self) -> String {
        format!("Resolving value node {}", self.node)
    }

    async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
        let node = self.node(self.node)?;
        if !node.value_state().is_unresolved() {
            return Ok(());
        }

        match self.resolve(ctx, &node).await {
            Ok(()) => Ok(()),
            Err(DebuggerError::Aborted) => Err(DebuggerError::Aborted),
            Err(e) => {
                self.container.set_failed(node.id, &e);
                Err(e)
            }
        }
    }
}

/// Stores a new value for a resolved node in the target.
pub struct WriteValueNodeValueJob {
    team: Arc<Team>,
    interface: Arc<dyn DebuggerInterface>,
    memory: Arc<dyn TeamMemory>,
    container: Arc<ValueNodeContainer>,
    node: ValueNodeId,
    thread: Option<ThreadId>,
    value: Value,
}

impl WriteValueNodeValueJob {
    pub fn new(
        team: Arc<Team>,
        interface: Arc<dyn DebuggerInterface>,
        memory: Arc<dyn TeamMemory>,
        container: Arc<ValueNodeContainer>,
        node: ValueNodeId,
        thread: Option<ThreadId>,
        value: Value,
    ) -> Self {
        Self {
            team,
            interface,
            memory,
            container,
            node,
            thread,
            value,
        }
    }
}

#[async_trait]
impl Job for WriteValueNodeValueJob {
    fn key(&self) -> JobKey {
        JobKey::new(self.container.job_subject(self.node), JobType::WriteValueNodeValue)
    }

    fn description(&self) -> String {
        format!("Writing value node {}", self.node)
    }

    async fn run(&self, _ctx: &JobContext) -> DebuggerResult<()> {
        let node = self
            .container
            .node(self.node)
            .ok_or_else(|| DebuggerError::NotFound(format!("value node {}", self.node)))?;
        let location = node
            .resolved_location()
            .or_else(|| node.location_state().resolved())
            .cloned()
            .ok_or_else(|| DebuggerError::InvalidState(format!("{} has no location", node.name)))?;

        let architecture = self.interface.architecture();
        let loader = ValueLoader::new(architecture.as_ref(), self.memory.as_ref(), None);
        let bytes = loader.encode_value(&self.value, &node.value_type)?;

        match &location {
            ValueLocation::Memory { address, .. } => {
                let written = self.memory.write_memory(*address, &bytes).await?;
                if written < bytes.len() {
                    return Err(DebuggerError::TargetIo(format!(
                        "short write at {:#x}: {} of {} bytes",
                        address,
                        written,
                        bytes.len()
                    )));
                }
                self.team.with(|t| t.notify_memory_changed(*address, bytes.len()));
            }
            ValueLocation::Register { index, .. } => {
                let thread = self
                    .thread
                    .ok_or_else(|| DebuggerError::InvalidState("register value without thread".to_string()))?;
                let cpu_state = self
                    .team
                    .read(|t| t.thread(thread).and_then(|th| th.cpu_state().cloned()))
                    .ok_or_else(|| DebuggerError::InvalidState(format!("thread {} is not stopped", thread)))?;
                let raw = self
                    .value
                    .to_u64()
                    .ok_or_else(|| DebuggerError::Evaluation(format!("cannot store {}", self.value)))?;
                let updated = cpu_state.with_register(*index, raw);
                self.interface.set_cpu_state(thread, &updated).await?;
                self.team
                    .with(|t| t.set_thread_cpu_state(thread, Some(Arc::new(updated))));
            }
        }

        self.container.replace_value(self.node, location, self.value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ProgramBuilder, SimulatedTarget};
    use crate::value::{ValueNodeKind, ValueType};
    use crate::worker::Worker;

    fn int32() -> ValueType {
        ValueType::Integer { size: 4, signed: true }
    }

    struct Fixture {
        target: Arc<SimulatedTarget>,
        container: Arc<ValueNodeContainer>,
        data: u64,
    }

    // struct { int32 a; int32 b; int32 *p; } at `data`, p pointing at b
    fn fixture() -> Fixture {
        let mut builder = ProgramBuilder::new("values", 0x1000);
        builder.function("main").line(1).ret();
        let data = builder.data_address();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.extend_from_slice(&(-3i32).to_le_bytes());
        bytes.extend_from_slice(&(data + 4).to_le_bytes());
        builder.data("s", &bytes);
        let program = builder.build().unwrap();
        Fixture {
            target: SimulatedTarget::launch(program),
            container: Arc::new(ValueNodeContainer::new()),
            data,
        }
    }

    fn job(f: &Fixture, node: ValueNodeId) -> Arc<ResolveValueNodeValueJob> {
        Arc::new(ResolveValueNodeValueJob::new(
            f.container.clone(),
            node,
            f.target.architecture(),
            f.target.clone(),
            None,
        ))
    }

    #[tokio::test]
    async fn test_child_resolves_parent_first() {
        let f = fixture();
        let s = f.container.add_variable(
            "s",
            ValueType::Struct {
                name: "s".to_string(),
                size: 16,
            },
            ValueLocation::Memory {
                address: f.data,
                size: 16,
            },
        );
        let p = f
            .container
            .add_child(
                s,
                "p",
                ValueNodeKind::Member { offset: 8 },
                ValueType::Pointer {
                    target: Box::new(int32()),
                },
            )
            .unwrap();
        let pointee = f.container.add_child(p, "*p", ValueNodeKind::Pointee, int32()).unwrap();

        // A single slot still works: waiting gives the slot up.
        let worker = Worker::new(1);
        let key = resolve_job_key(&f.container, pointee);
        worker.schedule_job(job(&f, pointee), None).unwrap();
        assert_eq!(worker.wait_for(key).await, JobWaitStatus::Succeeded);

        assert_eq!(f.container.node(pointee).unwrap().value(), Some(&Value::Integer(-3)));
        assert_eq!(
            f.container.node(p).unwrap().value(),
            Some(&Value::Address(f.data + 4))
        );
        assert!(f.container.node(s).unwrap().value().is_some());
    }

    #[tokio::test]
    async fn test_failure_recorded_once() {
        let f = fixture();
        let p = f.container.add_variable(
            "null",
            ValueType::Pointer {
                target: Box::new(int32()),
            },
            ValueLocation::Register { index: 0, size: 8 },
        );
        let pointee = f.container.add_child(p, "*null", ValueNodeKind::Pointee, int32()).unwrap();

        // No CPU state: the register read fails, and so does the child.
        let worker = Worker::new(2);
        worker.schedule_job(job(&f, pointee), None).unwrap();
        let status = worker.wait_for(resolve_job_key(&f.container, pointee)).await;
        assert_eq!(status, JobWaitStatus::Failed);
        assert!(matches!(
            f.container.node(p).unwrap().value_state(),
            Resolution::Failed(_)
        ));
        let failed = f.container.node(pointee).unwrap();
        assert!(matches!(failed.value_state(), Resolution::Failed(_)));

        // Resolving again leaves the recorded failure alone.
        worker.schedule_job(job(&f, pointee), None).unwrap();
        worker.wait_for(resolve_job_key(&f.container, pointee)).await;
        assert_eq!(
            f.container.node(pointee).unwrap().value_state(),
            failed.value_state()
        );
    }

    #[tokio::test]
    async fn test_write_memory_value() {
        let f = fixture();
        let team = Arc::new(Team::new(1, "values"));
        let a = f.container.add_variable(
            "a",
            int32(),
            ValueLocation::Memory {
                address: f.data,
                size: 4,
            },
        );
        let worker = Worker::new(2);
        let write = Arc::new(WriteValueNodeValueJob::new(
            team,
            f.target.clone(),
            f.target.clone(),
            f.container.clone(),
            a,
            None,
            Value::Integer(42),
        ));
        let key = write.key();
        worker.schedule_job(write, None).unwrap();
        assert_eq!(worker.wait_for(key).await, JobWaitStatus::Succeeded);

        let bytes = f.target.read_memory(f.data, 4).await.unwrap();
        assert_eq!(bytes, 42i32.to_le_bytes().to_vec());
        assert_eq!(f.container.node(a).unwrap().value(), Some(&Value::Integer(42)));
    }
}
