// CPU state snapshots
//
// Immutable once published; shared between Thread and StackFrame via Arc

use crate::types::TargetAddr;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub instruction_pointer: TargetAddr,
    pub stack_pointer: TargetAddr,
    pub frame_pointer: TargetAddr,
    pub registers: Vec<u64>,
}

impl CpuState {
    pub fn new(
        instruction_pointer: TargetAddr,
        stack_pointer: TargetAddr,
        frame_pointer: TargetAddr,
        registers: Vec<u64>,
    ) -> Self {
        Self {
            instruction_pointer,
            stack_pointer,
            frame_pointer,
            registers,
        }
    }

    pub fn register(&self, index: usize) -> Option<u64> {
        self.registers.get(index).copied()
    }

    /// Copy of this state with a different instruction pointer.
    pub fn with_instruction_pointer(&self, address: TargetAddr) -> CpuState {
        CpuState {
            instruction_pointer: address,
            ..self.clone()
        }
    }

    pub fn with_register(&self, index: usize, value: u64) -> CpuState {
        let mut state = self.clone();
        if let Some(slot) = state.registers.get_mut(index) {
            *slot = value;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_instruction_pointer() {
        let state = CpuState::new(0x1000, 0x7000, 0x7010, vec![1, 2, 3]);
        let moved = state.with_instruction_pointer(0x2000);

        assert_eq!(moved.instruction_pointer, 0x2000);
        assert_eq!(moved.stack_pointer, 0x7000);
        assert_eq!(moved.registers, vec![1, 2, 3]);
        assert_eq!(state.instruction_pointer, 0x1000);
    }

    #[test]
    fn test_with_register_out_of_range() {
        let state = CpuState::new(0, 0, 0, vec![5]);
        assert_eq!(state.with_register(0, 9).register(0), Some(9));
        assert_eq!(state.with_register(4, 9), state);
        assert_eq!(state.register(4), None);
    }
}
