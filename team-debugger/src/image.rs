// Images
//
// A loaded executable or shared object and the state of its debug info

use crate::debug_info::ImageDebugInfo;
use crate::types::{ImageId, TargetAddr, TargetSize, TeamId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    App,
    Library,
    AddOn,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub team_id: TeamId,
    pub image_id: ImageId,
    pub name: String,
    pub image_type: ImageType,
    pub text_base: TargetAddr,
    pub text_size: TargetSize,
    pub data_base: TargetAddr,
    pub data_size: TargetSize,
}

impl ImageInfo {
    pub fn contains_address(&self, address: TargetAddr) -> bool {
        (address >= self.text_base && address - self.text_base < self.text_size)
            || (address >= self.data_base && address - self.data_base < self.data_size)
    }

    /// The image's file name without any leading path.
    pub fn file_name(&self) -> &str {
        match self.name.rfind('/') {
            Some(index) => &self.name[index + 1..],
            None => &self.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageDebugInfoState {
    #[default]
    NotLoaded,
    Loading,
    Loaded,
    Unavailable,
}

impl ImageDebugInfoState {
    pub fn is_final(self) -> bool {
        matches!(self, ImageDebugInfoState::Loaded | ImageDebugInfoState::Unavailable)
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    info: ImageInfo,
    debug_info_state: ImageDebugInfoState,
    debug_info: Option<Arc<ImageDebugInfo>>,
}

impl Image {
    pub fn new(info: ImageInfo) -> Self {
        Self {
            info,
            debug_info_state: ImageDebugInfoState::NotLoaded,
            debug_info: None,
        }
    }

    pub fn id(&self) -> ImageId {
        self.info.image_id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn contains_address(&self, address: TargetAddr) -> bool {
        self.info.contains_address(address)
    }

    pub fn debug_info_state(&self) -> ImageDebugInfoState {
        self.debug_info_state
    }

    pub fn debug_info(&self) -> Option<&Arc<ImageDebugInfo>> {
        self.debug_info.as_ref()
    }

    pub(crate) fn set_debug_info_state(&mut self, state: ImageDebugInfoState) {
        self.debug_info_state = state;
    }

    pub(crate) fn set_debug_info(
        &mut self,
        debug_info: Option<Arc<ImageDebugInfo>>,
        state: ImageDebugInfoState,
    ) {
        self.debug_info = debug_info;
        self.debug_info_state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ImageInfo {
        ImageInfo {
            team_id: 1,
            image_id: 3,
            name: "/boot/apps/demo".to_string(),
            image_type: ImageType::App,
            text_base: 0x1000,
            text_size: 0x100,
            data_base: 0x2000_0000,
            data_size: 0x1000,
        }
    }

    #[test]
    fn test_contains_address() {
        let info = info();
        assert!(info.contains_address(0x1000));
        assert!(info.contains_address(0x10ff));
        assert!(!info.contains_address(0x1100));
        assert!(info.contains_address(0x2000_0010));
        assert!(!info.contains_address(0xfff));
    }

    #[test]
    fn test_file_name() {
        assert_eq!(info().file_name(), "demo");
        let mut bare = info();
        bare.name = "libc.so".to_string();
        assert_eq!(bare.file_name(), "libc.so");
    }
}
