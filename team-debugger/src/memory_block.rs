// Team memory blocks
//
// Page-sized snapshots of target memory for inspection, cached by page base.
// Listeners hear about a block once its data arrives or the read fails.

use crate::types::TargetAddr;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub const MEMORY_BLOCK_SIZE: usize = 4096;

pub trait TeamMemoryBlockListener: Send + Sync {
    fn memory_block_retrieved(&self, block: &Arc<TeamMemoryBlock>);

    fn memory_block_retrieval_failed(&self, block: &Arc<TeamMemoryBlock>, error: &str);
}

#[derive(Default)]
struct BlockData {
    data: Option<Vec<u8>>,
    listeners: Vec<Arc<dyn TeamMemoryBlockListener>>,
}

pub struct TeamMemoryBlock {
    base_address: TargetAddr,
    inner: Mutex<BlockData>,
}

impl std::fmt::Debug for TeamMemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamMemoryBlock")
            .field("base_address", &self.base_address)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl TeamMemoryBlock {
    fn new(base_address: TargetAddr) -> Self {
        Self {
            base_address,
            inner: Mutex::new(BlockData::default()),
        }
    }

    pub fn base_address(&self) -> TargetAddr {
        self.base_address
    }

    pub fn size(&self) -> usize {
        MEMORY_BLOCK_SIZE
    }

    pub fn contains(&self, address: TargetAddr) -> bool {
        address >= self.base_address && address - self.base_address < MEMORY_BLOCK_SIZE as TargetAddr
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().data.is_some()
    }

    pub fn data(&self) -> Option<Vec<u8>> {
        self.inner.lock().data.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn TeamMemoryBlockListener>) {
        self.inner.lock().listeners.push(listener);
    }

    pub fn invalidate(&self) {
        self.inner.lock().data = None;
    }

    pub(crate) fn set_data(self: &Arc<Self>, data: Vec<u8>) {
        let listeners = {
            let mut inner = self.inner.lock();
            inner.data = Some(data);
            std::mem::take(&mut inner.listeners)
        };
        for listener in listeners {
            listener.memory_block_retrieved(self);
        }
    }

    pub(crate) fn notify_failed(self: &Arc<Self>, error: &str) {
        let listeners = std::mem::take(&mut self.inner.lock().listeners);
        for listener in listeners {
            listener.memory_block_retrieval_failed(self, error);
        }
    }
}

#[derive(Debug, Default)]
pub struct TeamMemoryBlockManager {
    blocks: Mutex<HashMap<TargetAddr, Arc<TeamMemoryBlock>>>,
}

impl TeamMemoryBlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_base(address: TargetAddr) -> TargetAddr {
        address & !(MEMORY_BLOCK_SIZE as TargetAddr - 1)
    }

    /// The cached block covering `address`, created empty if necessary.
    pub fn get_memory_block(&self, address: TargetAddr) -> Arc<TeamMemoryBlock> {
        let base = Self::block_base(address);
        self.blocks
            .lock()
            .entry(base)
            .or_insert_with(|| Arc::new(TeamMemoryBlock::new(base)))
            .clone()
    }

    /// Drops cached data overlapping `[address, address + size)`.
    pub fn invalidate(&self, address: TargetAddr, size: usize) {
        let end = address.saturating_add(size as TargetAddr);
        for block in self.blocks.lock().values() {
            let block_end = block.base_address() + MEMORY_BLOCK_SIZE as TargetAddr;
            if block.base_address() < end && address < block_end {
                block.invalidate();
            }
        }
    }

    pub fn count_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flag(Mutex<Option<bool>>);

    impl TeamMemoryBlockListener for Flag {
        fn memory_block_retrieved(&self, _block: &Arc<TeamMemoryBlock>) {
            *self.0.lock() = Some(true);
        }

        fn memory_block_retrieval_failed(&self, _block: &Arc<TeamMemoryBlock>, _error: &str) {
            *self.0.lock() = Some(false);
        }
    }

    #[test]
    fn test_blocks_are_page_aligned_and_cached() {
        let manager = TeamMemoryBlockManager::new();
        let a = manager.get_memory_block(0x1234);
        let b = manager.get_memory_block(0x1fff);
        assert_eq!(a.base_address(), 0x1000);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.count_blocks(), 1);
    }

    #[test]
    fn test_listener_and_invalidate() {
        let manager = TeamMemoryBlockManager::new();
        let block = manager.get_memory_block(0x2000);
        let flag = Arc::new(Flag(Mutex::new(None)));
        block.add_listener(flag.clone());

        block.set_data(vec![0; MEMORY_BLOCK_SIZE]);
        assert_eq!(*flag.0.lock(), Some(true));
        assert!(block.is_valid());

        manager.invalidate(0x2ff8, 16);
        assert!(!block.is_valid());
    }
}
