// Architecture abstraction
//
// CPU/ABI specific instruction decoding and stack unwinding

use crate::cpu_state::CpuState;
use crate::error::DebuggerResult;
use crate::interface::TeamMemory;
use crate::stack_trace::StackTrace;
use crate::types::{StackGrowthDirection, TargetAddr};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionType {
    SubroutineCall,
    Jump,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionInfo {
    pub address: TargetAddr,
    pub size: usize,
    pub instruction_type: InstructionType,
    pub target_address: Option<TargetAddr>,
    pub disassembly: String,
}

impl InstructionInfo {
    pub fn next_address(&self) -> TargetAddr {
        self.address + self.size as TargetAddr
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub index: usize,
    pub name: String,
    pub bit_size: u32,
}

#[async_trait]
pub trait Architecture: Send + Sync {
    fn name(&self) -> &str;

    fn address_size(&self) -> usize;

    fn is_big_endian(&self) -> bool {
        false
    }

    fn stack_growth_direction(&self) -> StackGrowthDirection;

    fn registers(&self) -> &[Register];

    fn max_instruction_size(&self) -> usize;

    /// Decode the instruction at `address` from `code`.
    fn instruction_info(&self, address: TargetAddr, code: &[u8]) -> DebuggerResult<InstructionInfo>;

    /// Unwind at most `max_frames` frames starting at `cpu_state`.
    async fn create_stack_trace(
        &self,
        memory: &dyn TeamMemory,
        cpu_state: Arc<CpuState>,
        max_frames: usize,
    ) -> DebuggerResult<StackTrace>;

    fn register_by_name(&self, name: &str) -> Option<&Register> {
        self.registers().iter().find(|r| r.name == name)
    }
}

/// Reads and decodes the instruction at `address`.
pub async fn read_instruction_info(
    architecture: &dyn Architecture,
    memory: &dyn TeamMemory,
    address: TargetAddr,
) -> DebuggerResult<InstructionInfo> {
    let code = memory
        .read_memory(address, architecture.max_instruction_size())
        .await?;
    architecture.instruction_info(address, &code)
}
