// Stack traces
//
// Frames are ordered innermost first. Each frame shares the CPU state it was
// unwound with.

use crate::cpu_state::CpuState;
use crate::debug_info::FunctionInstance;
use crate::types::{ImageId, TargetAddr};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFrameType {
    /// Regular frame with a frame pointer set up
    Standard,
    /// Function entry or exit, frame pointer not (or no longer) established
    Frameless,
    /// Thread is inside a syscall; the CPU state's IP is the return address
    Syscall,
    Signal,
}

#[derive(Debug, Clone)]
pub struct StackFrame {
    pub frame_type: StackFrameType,
    pub cpu_state: Arc<CpuState>,
    pub frame_address: TargetAddr,
    pub instruction_pointer: TargetAddr,
    pub return_address: TargetAddr,
    pub image_id: Option<ImageId>,
    pub function: Option<Arc<FunctionInstance>>,
}

impl StackFrame {
    pub fn new(
        frame_type: StackFrameType,
        cpu_state: Arc<CpuState>,
        frame_address: TargetAddr,
        instruction_pointer: TargetAddr,
        return_address: TargetAddr,
    ) -> Self {
        Self {
            frame_type,
            cpu_state,
            frame_address,
            instruction_pointer,
            return_address,
            image_id: None,
            function: None,
        }
    }

    pub fn function_name(&self) -> Option<&str> {
        self.function.as_ref().map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StackTrace {
    frames: Vec<StackFrame>,
}

impl StackTrace {
    pub fn new(frames: Vec<StackFrame>) -> Self {
        Self { frames }
    }

    pub fn count_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_at(&self, index: usize) -> Option<&StackFrame> {
        self.frames.get(index)
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [StackFrame] {
        &mut self.frames
    }
}
