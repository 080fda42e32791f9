// Simulated programs
//
// `ProgramBuilder` assembles sim byte code and records a symbol table and a
// line table per function as it goes. A built `Program` can be mapped into a
// `SimulatedTarget` and describes its own image and debug info.

use super::isa::Instruction;
use super::language::SimLanguage;
use crate::debug_info::{AddressRange, FunctionId, FunctionInstance, ImageDebugInfo, LineEntry, SourceLocation};
use crate::error::{DebuggerError, DebuggerResult};
use crate::image::{ImageInfo, ImageType};
use crate::types::{ImageId, TargetAddr, TeamId};
use std::collections::HashMap;
use std::sync::Arc;

pub const PAGE_SIZE: u64 = 0x1000;
/// The data segment starts this far above the text base.
pub const DATA_OFFSET: u64 = 0x10000;

#[derive(Debug, Clone, Copy)]
enum FixupKind {
    Relative32,
    Relative8,
    Absolute32,
}

#[derive(Debug, Clone)]
struct Fixup {
    /// Offset of the operand within the text
    offset: usize,
    /// Address the relative offset is measured from
    base: TargetAddr,
    label: String,
    kind: FixupKind,
}

#[derive(Debug, Clone)]
struct FunctionDef {
    name: String,
    start: TargetAddr,
    lines: Vec<LineEntry>,
}

pub struct ProgramBuilder {
    name: String,
    path: String,
    image_type: ImageType,
    text_base: TargetAddr,
    code: Vec<u8>,
    labels: HashMap<String, TargetAddr>,
    functions: Vec<FunctionDef>,
    fixups: Vec<Fixup>,
    data: Vec<u8>,
}

impl ProgramBuilder {
    /// An application image. It starts with a `_start` stub that calls
    /// `main` and halts once `main` returns.
    pub fn new(name: &str, text_base: TargetAddr) -> Self {
        let mut builder = Self::with_type(name, format!("/sim/{}", name), ImageType::App, text_base);
        builder.function("_start").call("main").hlt();
        builder
    }

    pub fn library(name: &str, text_base: TargetAddr) -> Self {
        Self::with_type(name, format!("/sim/lib/{}", name), ImageType::Library, text_base)
    }

    fn with_type(name: &str, path: String, image_type: ImageType, text_base: TargetAddr) -> Self {
        Self {
            name: name.to_string(),
            path,
            image_type,
            text_base,
            code: Vec::new(),
            labels: HashMap::new(),
            functions: Vec::new(),
            fixups: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Current assembly address.
    pub fn address(&self) -> TargetAddr {
        self.text_base + self.code.len() as TargetAddr
    }

    /// Starts a new function at the current address.
    pub fn function(&mut self, name: &str) -> &mut Self {
        let start = self.address();
        self.labels.insert(name.to_string(), start);
        self.functions.push(FunctionDef {
            name: name.to_string(),
            start,
            lines: Vec::new(),
        });
        self
    }

    /// Code emitted from here on belongs to source line `line`.
    pub fn line(&mut self, line: u32) -> &mut Self {
        let address = self.address();
        if let Some(function) = self.functions.last_mut() {
            function.lines.retain(|entry| entry.address != address);
            function.lines.push(LineEntry {
                address,
                location: SourceLocation::new(line),
            });
        }
        self
    }

    pub fn label(&mut self, name: &str) -> &mut Self {
        let address = self.address();
        self.labels.insert(name.to_string(), address);
        self
    }

    fn emit(&mut self, instruction: Instruction) -> &mut Self {
        instruction.encode(&mut self.code);
        self
    }

    fn emit_fixup(&mut self, instruction: Instruction, operand: usize, label: &str, kind: FixupKind) -> &mut Self {
        let start = self.code.len();
        let base = self.address() + instruction.size() as TargetAddr;
        self.fixups.push(Fixup {
            offset: start + operand,
            base,
            label: label.to_string(),
            kind,
        });
        self.emit(instruction)
    }

    pub fn nop(&mut self) -> &mut Self {
        self.emit(Instruction::Nop)
    }

    pub fn enter(&mut self) -> &mut Self {
        self.emit(Instruction::Enter)
    }

    pub fn leave(&mut self) -> &mut Self {
        self.emit(Instruction::Leave)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.emit(Instruction::Ret)
    }

    pub fn hlt(&mut self) -> &mut Self {
        self.emit(Instruction::Hlt)
    }

    pub fn mov(&mut self, register: u8, value: u32) -> &mut Self {
        self.emit(Instruction::Mov { register, value })
    }

    /// Loads the address of `label` into `register`.
    pub fn mov_address(&mut self, register: u8, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Mov { register, value: 0 }, 2, label, FixupKind::Absolute32)
    }

    pub fn add(&mut self, register: u8, value: i8) -> &mut Self {
        self.emit(Instruction::Add { register, value })
    }

    pub fn jnz(&mut self, register: u8, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Jnz { register, offset: 0 }, 2, label, FixupKind::Relative8)
    }

    pub fn jmp(&mut self, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Jmp { offset: 0 }, 1, label, FixupKind::Relative8)
    }

    pub fn call(&mut self, label: &str) -> &mut Self {
        self.emit_fixup(Instruction::Call { offset: 0 }, 1, label, FixupKind::Relative32)
    }

    pub fn syscall(&mut self, number: u8) -> &mut Self {
        self.emit(Instruction::Syscall { number })
    }

    pub fn debugger(&mut self) -> &mut Self {
        self.emit(Instruction::Debugger)
    }

    pub fn fault(&mut self) -> &mut Self {
        self.emit(Instruction::Fault)
    }

    pub fn store(&mut self, register: u8, address: u32) -> &mut Self {
        self.emit(Instruction::Store { register, address })
    }

    pub fn load(&mut self, register: u8, address: u32) -> &mut Self {
        self.emit(Instruction::Load { register, address })
    }

    /// Address the next `data` call will place its bytes at.
    pub fn data_address(&self) -> TargetAddr {
        self.text_base + DATA_OFFSET + self.data.len() as TargetAddr
    }

    /// Appends `bytes` to the data segment under `name`.
    pub fn data(&mut self, name: &str, bytes: &[u8]) -> TargetAddr {
        let address = self.data_address();
        self.labels.insert(name.to_string(), address);
        self.data.extend_from_slice(bytes);
        address
    }

    pub fn build(&self) -> DebuggerResult<Program> {
        let text_size = round_up(self.code.len() as u64 + 16, PAGE_SIZE);
        if text_size > DATA_OFFSET {
            return Err(DebuggerError::Unsupported(format!(
                "text of {} does not fit below its data segment",
                self.name
            )));
        }

        let mut text = self.code.clone();
        for fixup in &self.fixups {
            let target = *self
                .labels
                .get(&fixup.label)
                .ok_or_else(|| DebuggerError::NotFound(format!("label '{}'", fixup.label)))?;
            let relative = target as i64 - fixup.base as i64;
            match fixup.kind {
                FixupKind::Relative32 => {
                    let value = i32::try_from(relative).map_err(|_| out_of_range(&fixup.label))?;
                    text[fixup.offset..fixup.offset + 4].copy_from_slice(&value.to_le_bytes());
                }
                FixupKind::Relative8 => {
                    let value = i8::try_from(relative).map_err(|_| out_of_range(&fixup.label))?;
                    text[fixup.offset] = value as u8;
                }
                FixupKind::Absolute32 => {
                    let value = u32::try_from(target).map_err(|_| out_of_range(&fixup.label))?;
                    text[fixup.offset..fixup.offset + 4].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
        text.resize(text_size as usize, 0);

        let mut data = self.data.clone();
        data.resize(round_up(data.len().max(1) as u64, PAGE_SIZE) as usize, 0);

        let code_end = self.address();
        let functions = self
            .functions
            .iter()
            .enumerate()
            .map(|(index, function)| {
                let end = self
                    .functions
                    .get(index + 1)
                    .map(|next| next.start)
                    .unwrap_or(code_end);
                ProgramFunction {
                    name: function.name.clone(),
                    range: AddressRange::new(function.start, end - function.start),
                    lines: function.lines.clone(),
                }
            })
            .collect();

        Ok(Program {
            name: self.name.clone(),
            path: self.path.clone(),
            source_file: format!("{}.src", self.name),
            image_type: self.image_type,
            text_base: self.text_base,
            text,
            data_base: self.text_base + DATA_OFFSET,
            data,
            symbols: self.labels.clone(),
            functions,
        })
    }
}

fn round_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn out_of_range(label: &str) -> DebuggerError {
    DebuggerError::Unsupported(format!("branch to '{}' out of range", label))
}

#[derive(Debug, Clone)]
struct ProgramFunction {
    name: String,
    range: AddressRange,
    lines: Vec<LineEntry>,
}

/// An assembled image, ready to be mapped.
#[derive(Debug, Clone)]
pub struct Program {
    name: String,
    path: String,
    source_file: String,
    image_type: ImageType,
    text_base: TargetAddr,
    text: Vec<u8>,
    data_base: TargetAddr,
    data: Vec<u8>,
    symbols: HashMap<String, TargetAddr>,
    functions: Vec<ProgramFunction>,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    /// Address of a function, label or data item.
    pub fn symbol(&self, name: &str) -> Option<TargetAddr> {
        self.symbols.get(name).copied()
    }

    pub fn entry(&self) -> TargetAddr {
        self.text_base
    }

    pub fn text_base(&self) -> TargetAddr {
        self.text_base
    }

    pub(crate) fn text(&self) -> &[u8] {
        &self.text
    }

    pub fn data_base(&self) -> TargetAddr {
        self.data_base
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn image_info(&self, team_id: TeamId, image_id: ImageId) -> ImageInfo {
        ImageInfo {
            team_id,
            image_id,
            name: self.path.clone(),
            image_type: self.image_type,
            text_base: self.text_base,
            text_size: self.text.len() as u64,
            data_base: self.data_base,
            data_size: self.data.len() as u64,
        }
    }

    pub fn debug_info(&self, image_id: ImageId) -> ImageDebugInfo {
        let functions = self
            .functions
            .iter()
            .map(|function| {
                Arc::new(FunctionInstance {
                    image_id,
                    id: FunctionId {
                        source_file: Some(self.source_file.clone()),
                        name: function.name.clone(),
                    },
                    name: function.name.clone(),
                    address_range: function.range,
                    line_table: function.lines.clone(),
                })
            })
            .collect();
        ImageDebugInfo {
            image_id,
            image_name: self.path.clone(),
            functions,
            language: Some(Arc::new(SimLanguage)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_line_table() {
        let mut builder = ProgramBuilder::new("layout", 0x1000);
        builder.function("main").line(1).enter();
        builder.line(2).mov(0, 1).call("helper");
        builder.line(3).leave().ret();
        builder.function("helper").line(10).ret();
        let program = builder.build().unwrap();

        // _start is "call main; hlt"
        let main = program.symbol("main").unwrap();
        assert_eq!(main, 0x1000 + 6);
        assert_eq!(program.entry(), 0x1000);

        let info = program.debug_info(1);
        let function = info.function_by_name("main").unwrap();
        assert_eq!(function.address_range, AddressRange::new(main, 1 + 6 + 5 + 2));
        let statement = function.statement_at_address(main + 3).unwrap();
        assert_eq!(statement.start_source_location(), Some(SourceLocation::new(2)));
        assert_eq!(statement.covering_address_range(), AddressRange::new(main + 1, 11));

        let image = program.image_info(100, 1);
        assert_eq!(image.name, "/sim/layout");
        assert_eq!(image.text_size % PAGE_SIZE, 0);
        assert_eq!(image.data_base, 0x11000);
    }

    #[test]
    fn test_unknown_label_and_short_branch() {
        let mut builder = ProgramBuilder::library("broken", 0x4000);
        builder.function("f").call("nowhere");
        assert!(matches!(builder.build(), Err(DebuggerError::NotFound(_))));

        let mut builder = ProgramBuilder::library("far", 0x4000);
        builder.function("f").label("top");
        for _ in 0..200 {
            builder.nop();
        }
        builder.jmp("top");
        assert!(builder.build().is_err());
    }
}
