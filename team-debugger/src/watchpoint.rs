// Watchpoints
//
// Data breakpoints keyed by address, with a single owner each

use crate::types::{TargetAddr, WatchpointType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watchpoint {
    address: TargetAddr,
    watch_type: WatchpointType,
    length: usize,
    enabled: bool,
    installed: bool,
}

impl Watchpoint {
    pub fn new(address: TargetAddr, watch_type: WatchpointType, length: usize) -> Self {
        Self {
            address,
            watch_type,
            length,
            enabled: false,
            installed: false,
        }
    }

    pub fn address(&self) -> TargetAddr {
        self.address
    }

    pub fn watch_type(&self) -> WatchpointType {
        self.watch_type
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub(crate) fn set_installed(&mut self, installed: bool) {
        self.installed = installed;
    }

    pub fn should_be_installed(&self) -> bool {
        self.enabled
    }

    pub fn contains(&self, address: TargetAddr) -> bool {
        address >= self.address && address - self.address < self.length as TargetAddr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let watchpoint = Watchpoint::new(0x2000_0000, WatchpointType::Write, 8);
        assert!(watchpoint.contains(0x2000_0000));
        assert!(watchpoint.contains(0x2000_0007));
        assert!(!watchpoint.contains(0x2000_0008));
        assert!(!watchpoint.should_be_installed());
    }
}
