// Debug information
//
// Functions, statements and source locations of loaded images, plus the
// team-wide index used for address and source-location lookups

use crate::error::DebuggerResult;
use crate::image::ImageInfo;
use crate::language::SourceLanguage;
use crate::types::{ImageId, TargetAddr, TargetSize};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Identifies a function independently of where an image got loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId {
    pub source_file: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32) -> Self {
        Self { line, column: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: TargetAddr,
    pub size: TargetSize,
}

impl AddressRange {
    pub fn new(start: TargetAddr, size: TargetSize) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> TargetAddr {
        self.start + self.size
    }

    pub fn contains(&self, address: TargetAddr) -> bool {
        address >= self.start && address - self.start < self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub address: TargetAddr,
    pub location: SourceLocation,
}

/// The unit a source-level step treats as atomic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Code generated for one source line
    Contiguous {
        location: SourceLocation,
        range: AddressRange,
    },
    /// A single machine instruction, used when no line info is available
    Instruction { range: AddressRange },
}

impl Statement {
    pub fn covering_address_range(&self) -> AddressRange {
        match self {
            Statement::Contiguous { range, .. } | Statement::Instruction { range } => *range,
        }
    }

    pub fn contains_address(&self, address: TargetAddr) -> bool {
        self.covering_address_range().contains(address)
    }

    pub fn start_source_location(&self) -> Option<SourceLocation> {
        match self {
            Statement::Contiguous { location, .. } => Some(*location),
            Statement::Instruction { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionInstance {
    pub image_id: ImageId,
    pub id: FunctionId,
    pub name: String,
    pub address_range: AddressRange,
    /// Sorted by address
    pub line_table: Vec<LineEntry>,
}

impl FunctionInstance {
    pub fn address(&self) -> TargetAddr {
        self.address_range.start
    }

    pub fn source_file(&self) -> Option<&str> {
        self.id.source_file.as_deref()
    }

    pub fn statement_at_address(&self, address: TargetAddr) -> Option<Statement> {
        if !self.address_range.contains(address) {
            return None;
        }
        let index = self
            .line_table
            .iter()
            .rposition(|entry| entry.address <= address)?;
        let entry = self.line_table[index];
        let end = self
            .line_table
            .get(index + 1)
            .map(|next| next.address)
            .unwrap_or_else(|| self.address_range.end());
        Some(Statement::Contiguous {
            location: entry.location,
            range: AddressRange::new(entry.address, end - entry.address),
        })
    }

    pub fn statement_at_source_location(&self, location: SourceLocation) -> Option<Statement> {
        let entry = self
            .line_table
            .iter()
            .find(|entry| entry.location.line == location.line)?;
        self.statement_at_address(entry.address)
    }

    pub fn source_location_at(&self, address: TargetAddr) -> Option<SourceLocation> {
        self.statement_at_address(address)
            .and_then(|statement| statement.start_source_location())
    }
}

pub struct ImageDebugInfo {
    pub image_id: ImageId,
    pub image_name: String,
    pub functions: Vec<Arc<FunctionInstance>>,
    pub language: Option<Arc<dyn SourceLanguage>>,
}

impl fmt::Debug for ImageDebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageDebugInfo")
            .field("image_id", &self.image_id)
            .field("image_name", &self.image_name)
            .field("functions", &self.functions.len())
            .field("language", &self.language.as_ref().map(|l| l.name().to_string()))
            .finish()
    }
}

impl ImageDebugInfo {
    pub fn function_at_address(&self, address: TargetAddr) -> Option<&Arc<FunctionInstance>> {
        self.functions
            .iter()
            .find(|f| f.address_range.contains(address))
    }

    pub fn function_by_name(&self, name: &str) -> Option<&Arc<FunctionInstance>> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[async_trait]
pub trait ImageDebugInfoProvider: Send + Sync {
    /// Loads debug info for an image. `Ok(None)` means none is available.
    async fn load_image_debug_info(&self, image: &ImageInfo) -> DebuggerResult<Option<ImageDebugInfo>>;
}

/// Team-wide index over the loaded images' debug info.
#[derive(Debug, Default)]
pub struct TeamDebugInfo {
    images: BTreeMap<ImageId, Arc<ImageDebugInfo>>,
    functions: HashMap<FunctionId, Vec<Arc<FunctionInstance>>>,
}

impl TeamDebugInfo {
    pub fn add_image_debug_info(&mut self, info: Arc<ImageDebugInfo>) {
        self.remove_image_debug_info(info.image_id);
        for function in &info.functions {
            self.functions
                .entry(function.id.clone())
                .or_default()
                .push(function.clone());
        }
        self.images.insert(info.image_id, info);
    }

    pub fn remove_image_debug_info(&mut self, image_id: ImageId) {
        if self.images.remove(&image_id).is_none() {
            return;
        }
        self.functions.retain(|_, instances| {
            instances.retain(|f| f.image_id != image_id);
            !instances.is_empty()
        });
    }

    pub fn image_debug_info(&self, image_id: ImageId) -> Option<&Arc<ImageDebugInfo>> {
        self.images.get(&image_id)
    }

    pub fn function_at_address(&self, address: TargetAddr) -> Option<Arc<FunctionInstance>> {
        self.images
            .values()
            .find_map(|info| info.function_at_address(address).cloned())
    }

    pub fn function_instances(&self, id: &FunctionId) -> Vec<Arc<FunctionInstance>> {
        self.functions.get(id).cloned().unwrap_or_default()
    }

    pub fn language_for_address(&self, address: TargetAddr) -> Option<Arc<dyn SourceLanguage>> {
        self.images
            .values()
            .find(|info| info.function_at_address(address).is_some())
            .and_then(|info| info.language.clone())
    }

    pub fn statement_at_address(&self, address: TargetAddr) -> Option<(Arc<FunctionInstance>, Statement)> {
        let function = self.function_at_address(address)?;
        let statement = function.statement_at_address(address)?;
        Some((function, statement))
    }

    pub fn statement_at_source_location(
        &self,
        source_file: &str,
        location: SourceLocation,
    ) -> Option<(Arc<FunctionInstance>, Statement)> {
        self.images
            .values()
            .flat_map(|info| info.functions.iter())
            .filter(|f| f.source_file() == Some(source_file))
            .find_map(|f| {
                f.statement_at_source_location(location)
                    .map(|statement| (f.clone(), statement))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(image_id: ImageId, start: TargetAddr) -> FunctionInstance {
        FunctionInstance {
            image_id,
            id: FunctionId {
                source_file: Some("demo.c".to_string()),
                name: "compute".to_string(),
            },
            name: "compute".to_string(),
            address_range: AddressRange::new(start, 0x20),
            line_table: vec![
                LineEntry { address: start, location: SourceLocation::new(10) },
                LineEntry { address: start + 0x6, location: SourceLocation::new(11) },
                LineEntry { address: start + 0x10, location: SourceLocation::new(12) },
            ],
        }
    }

    #[test]
    fn test_statement_at_address() {
        let f = function(1, 0x1000);

        let statement = f.statement_at_address(0x1008).unwrap();
        assert_eq!(statement.start_source_location(), Some(SourceLocation::new(11)));
        assert_eq!(statement.covering_address_range(), AddressRange::new(0x1006, 0xa));

        let last = f.statement_at_address(0x101f).unwrap();
        assert_eq!(last.covering_address_range().end(), 0x1020);

        assert!(f.statement_at_address(0x1020).is_none());
    }

    #[test]
    fn test_team_debug_info_index() {
        let mut team_info = TeamDebugInfo::default();
        for (image_id, base) in [(1, 0x1000), (2, 0x8000)] {
            team_info.add_image_debug_info(Arc::new(ImageDebugInfo {
                image_id,
                image_name: format!("image{}", image_id),
                functions: vec![Arc::new(function(image_id, base))],
                language: None,
            }));
        }

        let id = FunctionId {
            source_file: Some("demo.c".to_string()),
            name: "compute".to_string(),
        };
        assert_eq!(team_info.function_instances(&id).len(), 2);

        let (f, statement) = team_info
            .statement_at_source_location("demo.c", SourceLocation::new(12))
            .unwrap();
        assert_eq!(f.image_id, 1);
        assert_eq!(statement.covering_address_range().start, 0x1010);

        team_info.remove_image_debug_info(1);
        assert_eq!(team_info.function_instances(&id).len(), 1);
        assert!(team_info.function_at_address(0x1004).is_none());
        assert!(team_info.statement_at_address(0x8004).is_some());
    }
}
