// Simulated architecture
//
// Decodes sim byte code and unwinds frame pointer chains. A frame's address
// is the value its frame pointer has once ENTER has run.

use super::isa::{Instruction, MAX_INSTRUCTION_SIZE, REGISTER_COUNT};
use crate::architecture::{Architecture, InstructionInfo, InstructionType, Register};
use crate::cpu_state::CpuState;
use crate::error::{DebuggerError, DebuggerResult};
use crate::interface::TeamMemory;
use crate::stack_trace::{StackFrame, StackFrameType, StackTrace};
use crate::types::{StackGrowthDirection, TargetAddr};
use async_trait::async_trait;
use bytes::Buf;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct SimArchitecture {
    registers: Vec<Register>,
    // (ip, sp) of threads parked on a syscall return
    syscall_returns: Mutex<HashSet<(TargetAddr, TargetAddr)>>,
}

impl Default for SimArchitecture {
    fn default() -> Self {
        Self::new()
    }
}

impl SimArchitecture {
    pub fn new() -> Self {
        let registers = (0..REGISTER_COUNT)
            .map(|index| Register {
                index,
                name: format!("r{}", index),
                bit_size: 64,
            })
            .collect();
        Self {
            registers,
            syscall_returns: Mutex::new(HashSet::new()),
        }
    }

    /// The thread at `cpu` stopped on its way out of a syscall; its top
    /// frame unwinds as a syscall frame until it runs again.
    pub(super) fn enter_syscall_return(&self, cpu: &CpuState) {
        self.syscall_returns
            .lock()
            .insert((cpu.instruction_pointer, cpu.stack_pointer));
    }

    pub(super) fn leave_syscall_return(&self, cpu: &CpuState) {
        self.syscall_returns
            .lock()
            .remove(&(cpu.instruction_pointer, cpu.stack_pointer));
    }

    fn is_syscall_return(&self, cpu: &CpuState) -> bool {
        self.syscall_returns
            .lock()
            .contains(&(cpu.instruction_pointer, cpu.stack_pointer))
    }
}

async fn read_u64(memory: &dyn TeamMemory, address: TargetAddr) -> DebuggerResult<u64> {
    let bytes = memory.read_memory(address, 8).await?;
    if bytes.len() < 8 {
        return Err(DebuggerError::BadAddress(address));
    }
    Ok((&bytes[..]).get_u64_le())
}

#[async_trait]
impl Architecture for SimArchitecture {
    fn name(&self) -> &str {
        "sim64"
    }

    fn address_size(&self) -> usize {
        8
    }

    fn stack_growth_direction(&self) -> StackGrowthDirection {
        StackGrowthDirection::Negative
    }

    fn registers(&self) -> &[Register] {
        &self.registers
    }

    fn max_instruction_size(&self) -> usize {
        MAX_INSTRUCTION_SIZE
    }

    fn instruction_info(&self, address: TargetAddr, code: &[u8]) -> DebuggerResult<InstructionInfo> {
        let instruction = Instruction::decode(code)?;
        let instruction_type = match instruction {
            Instruction::Call { .. } => InstructionType::SubroutineCall,
            Instruction::Jnz { .. } | Instruction::Jmp { .. } => InstructionType::Jump,
            _ => InstructionType::Other,
        };
        Ok(InstructionInfo {
            address,
            size: instruction.size(),
            instruction_type,
            target_address: instruction.branch_target(address),
            disassembly: instruction.to_string(),
        })
    }

    async fn create_stack_trace(
        &self,
        memory: &dyn TeamMemory,
        cpu_state: Arc<CpuState>,
        max_frames: usize,
    ) -> DebuggerResult<StackTrace> {
        let mut frames = Vec::new();
        let mut state = cpu_state;

        if max_frames > 0 && self.is_syscall_return(&state) {
            frames.push(StackFrame::new(
                StackFrameType::Syscall,
                state.clone(),
                state.stack_pointer,
                state.instruction_pointer,
                state.instruction_pointer,
            ));
        }

        let mut innermost = true;
        while frames.len() < max_frames {
            // Only the innermost user frame can be caught between frame setup
            // and teardown.
            let frameless = std::mem::take(&mut innermost) && {
                let code = memory
                    .read_memory(state.instruction_pointer, 1)
                    .await
                    .unwrap_or_default();
                matches!(
                    Instruction::decode(&code),
                    Ok(Instruction::Enter) | Ok(Instruction::Ret)
                )
            };

            let (frame, caller) = if frameless {
                let stack_pointer = state.stack_pointer;
                let return_address = read_u64(memory, stack_pointer).await.unwrap_or(0);
                let frame = StackFrame::new(
                    StackFrameType::Frameless,
                    state.clone(),
                    stack_pointer.wrapping_sub(8),
                    state.instruction_pointer,
                    return_address,
                );
                let caller = CpuState::new(
                    return_address,
                    stack_pointer + 8,
                    state.frame_pointer,
                    state.registers.clone(),
                );
                (frame, caller)
            } else {
                let frame_pointer = state.frame_pointer;
                if frame_pointer == 0 {
                    frames.push(StackFrame::new(
                        StackFrameType::Standard,
                        state.clone(),
                        0,
                        state.instruction_pointer,
                        0,
                    ));
                    break;
                }
                let return_address = read_u64(memory, frame_pointer + 8).await.unwrap_or(0);
                let saved_frame_pointer = read_u64(memory, frame_pointer).await.unwrap_or(0);
                let frame = StackFrame::new(
                    StackFrameType::Standard,
                    state.clone(),
                    frame_pointer,
                    state.instruction_pointer,
                    return_address,
                );
                let caller = CpuState::new(
                    return_address,
                    frame_pointer + 16,
                    saved_frame_pointer,
                    state.registers.clone(),
                );
                (frame, caller)
            };

            let return_address = frame.return_address;
            let frame_address = frame.frame_address;
            frames.push(frame);
            if return_address == 0 {
                break;
            }
            // Callers live further up the stack.
            if caller.frame_pointer != 0 && caller.frame_pointer <= frame_address {
                debug!("Frame chain does not grow at {:#x}, stopping unwind", frame_address);
                break;
            }
            state = Arc::new(caller);
        }

        Ok(StackTrace::new(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ProgramBuilder, SimulatedTarget};

    #[test]
    fn test_instruction_info() {
        let arch = SimArchitecture::new();
        let info = arch.instruction_info(0x1000, &[0xe8, 0x10, 0, 0, 0]).unwrap();
        assert_eq!(info.instruction_type, InstructionType::SubroutineCall);
        assert_eq!(info.next_address(), 0x1005);
        assert_eq!(info.target_address, Some(0x1015));
        assert_eq!(arch.register_by_name("r3").map(|r| r.index), Some(3));
    }

    #[tokio::test]
    async fn test_unwind_frameless_top_frame() {
        let mut builder = ProgramBuilder::new("unwind", 0x1000);
        builder.function("main").line(1).ret();
        let program = builder.build().unwrap();
        let target = SimulatedTarget::launch(program.clone());
        let arch = SimArchitecture::new();

        // Fake a call into main: the return address sits on top of the stack.
        let sp = 0x7ffe_ff00;
        target.write_memory(sp, &0x1005u64.to_le_bytes()).await.unwrap();
        let cpu = Arc::new(CpuState::new(program.symbol("main").unwrap(), sp, 0, vec![0; 8]));
        let trace = arch.create_stack_trace(target.as_ref(), cpu, 8).await.unwrap();

        let top = trace.frame_at(0).unwrap();
        assert_eq!(top.frame_type, StackFrameType::Frameless);
        assert_eq!(top.frame_address, sp - 8);
        assert_eq!(top.return_address, 0x1005);
        assert_eq!(trace.frame_at(1).unwrap().instruction_pointer, 0x1005);
    }

    #[tokio::test]
    async fn test_unwind_syscall_return() {
        let mut builder = ProgramBuilder::new("unwind", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).nop();
        builder.line(3).leave().ret();
        let program = builder.build().unwrap();
        let target = SimulatedTarget::launch(program.clone());
        let arch = SimArchitecture::new();

        let sp = 0x7ffe_ff00;
        target.write_memory(sp, &[0u8; 16]).await.unwrap();
        let ip = program.symbol("main").unwrap() + 1;
        let cpu = CpuState::new(ip, sp, sp, vec![0; 8]);
        arch.enter_syscall_return(&cpu);
        let trace = arch
            .create_stack_trace(target.as_ref(), Arc::new(cpu.clone()), 8)
            .await
            .unwrap();
        assert_eq!(trace.frame_at(0).unwrap().frame_type, StackFrameType::Syscall);
        let user = trace.frame_at(1).unwrap();
        assert_eq!(user.frame_type, StackFrameType::Standard);
        assert_eq!(user.instruction_pointer, ip);

        arch.leave_syscall_return(&cpu);
        let trace = arch.create_stack_trace(target.as_ref(), Arc::new(cpu), 8).await.unwrap();
        assert_eq!(trace.frame_at(0).unwrap().frame_type, StackFrameType::Standard);
    }
}
