// Simulated instruction set
//
// A tiny little-endian byte code: frame setup, calls, conditional jumps,
// register arithmetic, memory access and a few syscalls. Relative branch
// offsets count from the end of the branching instruction.

use crate::error::{DebuggerError, DebuggerResult};
use bytes::{Buf, BufMut};
use std::fmt;

pub const OP_NOP: u8 = 0x90;
pub const OP_ENTER: u8 = 0x55;
pub const OP_LEAVE: u8 = 0xc9;
pub const OP_RET: u8 = 0xc3;
pub const OP_CALL: u8 = 0xe8;
pub const OP_MOV: u8 = 0xb8;
pub const OP_ADD: u8 = 0x05;
pub const OP_JNZ: u8 = 0x75;
pub const OP_JMP: u8 = 0xeb;
pub const OP_HLT: u8 = 0xf4;
pub const OP_SYSCALL: u8 = 0xcd;
pub const OP_DEBUGGER: u8 = 0xcc;
pub const OP_FAULT: u8 = 0x0f;
pub const OP_STORE: u8 = 0x89;
pub const OP_LOAD: u8 = 0x8b;

pub const REGISTER_COUNT: usize = 8;
pub const MAX_INSTRUCTION_SIZE: usize = 6;

/// write(fd = r0, buffer = r1, length = r2)
pub const SYS_WRITE: u8 = 1;
/// raise(signal = r0)
pub const SYS_RAISE: u8 = 2;
/// set_signal_handler(signal = r0, handler = r1)
pub const SYS_SET_SIGNAL_HANDLER: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    /// push fp; fp = sp
    Enter,
    /// sp = fp; pop fp
    Leave,
    /// Returning to address 0 ends the thread
    Ret,
    Call { offset: i32 },
    Mov { register: u8, value: u32 },
    Add { register: u8, value: i8 },
    Jnz { register: u8, offset: i8 },
    Jmp { offset: i8 },
    Hlt,
    Syscall { number: u8 },
    /// Debugger call with the message address in r0
    Debugger,
    Fault,
    /// Stores the full 8-byte register
    Store { register: u8, address: u32 },
    Load { register: u8, address: u32 },
}

impl Instruction {
    pub fn size(&self) -> usize {
        match self {
            Instruction::Nop
            | Instruction::Enter
            | Instruction::Leave
            | Instruction::Ret
            | Instruction::Hlt
            | Instruction::Debugger
            | Instruction::Fault => 1,
            Instruction::Jmp { .. } | Instruction::Syscall { .. } => 2,
            Instruction::Add { .. } | Instruction::Jnz { .. } => 3,
            Instruction::Call { .. } => 5,
            Instruction::Mov { .. } | Instruction::Store { .. } | Instruction::Load { .. } => 6,
        }
    }

    /// Decodes the instruction at the start of `code`.
    pub fn decode(mut code: &[u8]) -> DebuggerResult<Instruction> {
        if !code.has_remaining() {
            return Err(DebuggerError::Unsupported("empty instruction stream".to_string()));
        }
        let opcode = code.get_u8();
        let needed = match opcode {
            OP_JMP | OP_SYSCALL => 1,
            OP_ADD | OP_JNZ => 2,
            OP_CALL => 4,
            OP_MOV | OP_STORE | OP_LOAD => 5,
            _ => 0,
        };
        if code.remaining() < needed {
            return Err(DebuggerError::Unsupported(format!(
                "truncated instruction {:#04x}",
                opcode
            )));
        }

        let instruction = match opcode {
            OP_NOP => Instruction::Nop,
            OP_ENTER => Instruction::Enter,
            OP_LEAVE => Instruction::Leave,
            OP_RET => Instruction::Ret,
            OP_HLT => Instruction::Hlt,
            OP_DEBUGGER => Instruction::Debugger,
            OP_FAULT => Instruction::Fault,
            OP_CALL => Instruction::Call {
                offset: code.get_i32_le(),
            },
            OP_JMP => Instruction::Jmp {
                offset: code.get_i8(),
            },
            OP_SYSCALL => Instruction::Syscall {
                number: code.get_u8(),
            },
            OP_MOV => Instruction::Mov {
                register: register(code.get_u8())?,
                value: code.get_u32_le(),
            },
            OP_ADD => Instruction::Add {
                register: register(code.get_u8())?,
                value: code.get_i8(),
            },
            OP_JNZ => Instruction::Jnz {
                register: register(code.get_u8())?,
                offset: code.get_i8(),
            },
            OP_STORE => Instruction::Store {
                register: register(code.get_u8())?,
                address: code.get_u32_le(),
            },
            OP_LOAD => Instruction::Load {
                register: register(code.get_u8())?,
                address: code.get_u32_le(),
            },
            _ => {
                return Err(DebuggerError::Unsupported(format!(
                    "illegal opcode {:#04x}",
                    opcode
                )))
            }
        };
        Ok(instruction)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match *self {
            Instruction::Nop => buf.put_u8(OP_NOP),
            Instruction::Enter => buf.put_u8(OP_ENTER),
            Instruction::Leave => buf.put_u8(OP_LEAVE),
            Instruction::Ret => buf.put_u8(OP_RET),
            Instruction::Hlt => buf.put_u8(OP_HLT),
            Instruction::Debugger => buf.put_u8(OP_DEBUGGER),
            Instruction::Fault => buf.put_u8(OP_FAULT),
            Instruction::Call { offset } => {
                buf.put_u8(OP_CALL);
                buf.put_i32_le(offset);
            }
            Instruction::Jmp { offset } => {
                buf.put_u8(OP_JMP);
                buf.put_i8(offset);
            }
            Instruction::Syscall { number } => {
                buf.put_u8(OP_SYSCALL);
                buf.put_u8(number);
            }
            Instruction::Mov { register, value } => {
                buf.put_u8(OP_MOV);
                buf.put_u8(register);
                buf.put_u32_le(value);
            }
            Instruction::Add { register, value } => {
                buf.put_u8(OP_ADD);
                buf.put_u8(register);
                buf.put_i8(value);
            }
            Instruction::Jnz { register, offset } => {
                buf.put_u8(OP_JNZ);
                buf.put_u8(register);
                buf.put_i8(offset);
            }
            Instruction::Store { register, address } => {
                buf.put_u8(OP_STORE);
                buf.put_u8(register);
                buf.put_u32_le(address);
            }
            Instruction::Load { register, address } => {
                buf.put_u8(OP_LOAD);
                buf.put_u8(register);
                buf.put_u32_le(address);
            }
        }
    }

    /// Absolute branch target for an instruction at `address`.
    pub fn branch_target(&self, address: u64) -> Option<u64> {
        let next = address.wrapping_add(self.size() as u64);
        match *self {
            Instruction::Call { offset } => Some(next.wrapping_add(offset as i64 as u64)),
            Instruction::Jnz { offset, .. } | Instruction::Jmp { offset } => {
                Some(next.wrapping_add(offset as i64 as u64))
            }
            _ => None,
        }
    }
}

fn register(index: u8) -> DebuggerResult<u8> {
    if (index as usize) < REGISTER_COUNT {
        Ok(index)
    } else {
        Err(DebuggerError::Unsupported(format!("no register r{}", index)))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Nop => write!(f, "nop"),
            Instruction::Enter => write!(f, "enter"),
            Instruction::Leave => write!(f, "leave"),
            Instruction::Ret => write!(f, "ret"),
            Instruction::Hlt => write!(f, "hlt"),
            Instruction::Debugger => write!(f, "debugger"),
            Instruction::Fault => write!(f, "fault"),
            Instruction::Call { offset } => write!(f, "call {:+}", offset),
            Instruction::Jmp { offset } => write!(f, "jmp {:+}", offset),
            Instruction::Syscall { number } => write!(f, "syscall {}", number),
            Instruction::Mov { register, value } => write!(f, "mov r{}, {:#x}", register, value),
            Instruction::Add { register, value } => write!(f, "add r{}, {}", register, value),
            Instruction::Jnz { register, offset } => write!(f, "jnz r{}, {:+}", register, offset),
            Instruction::Store { register, address } => write!(f, "store r{}, [{:#x}]", register, address),
            Instruction::Load { register, address } => write!(f, "load r{}, [{:#x}]", register, address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sizes_and_targets() {
        let mut code = Vec::new();
        Instruction::Call { offset: -10 }.encode(&mut code);
        Instruction::Jnz { register: 2, offset: 4 }.encode(&mut code);

        let call = Instruction::decode(&code).unwrap();
        assert_eq!(call, Instruction::Call { offset: -10 });
        assert_eq!(call.size(), 5);
        assert_eq!(call.branch_target(0x1000), Some(0x1000 + 5 - 10));

        let jnz = Instruction::decode(&code[5..]).unwrap();
        assert_eq!(jnz.branch_target(0x2000), Some(0x2000 + 3 + 4));
        assert_eq!(jnz.to_string(), "jnz r2, +4");
    }

    #[test]
    fn test_decode_errors() {
        assert!(Instruction::decode(&[0x00]).is_err());
        assert!(Instruction::decode(&[OP_MOV, 1, 0]).is_err());
        assert!(Instruction::decode(&[OP_MOV, 9, 0, 0, 0, 0]).is_err());
        assert!(Instruction::decode(&[]).is_err());
    }
}
