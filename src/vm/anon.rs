//! Anonymous pages
//!
//! Memory with no backing file: zero-filled on first touch, written to a
//! swap slot on eviction and read back (releasing the slot) on the next
//! fault.

use super::error::VmResult;
use super::swap::{SwapSlot, SwapTable};

/// Anonymous page state
#[derive(Debug, Default)]
pub struct AnonPage {
    /// Slot holding the contents while evicted
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn new() -> Self {
        Self { slot: None }
    }

    pub fn is_swapped(&self) -> bool {
        self.slot.is_some()
    }

    pub fn slot(&self) -> Option<&SwapSlot> {
        self.slot.as_ref()
    }

    /// Fill `frame`: from the swap slot if the page was evicted, otherwise
    /// zeros. The slot is kept; see [`release_slot`](Self::release_slot).
    pub fn fill(&self, frame: &mut [u8], swap: &SwapTable) -> VmResult<()> {
        match &self.slot {
            Some(slot) => swap.swap_in(slot, frame),
            None => {
                frame.fill(0);
                Ok(())
            }
        }
    }

    /// Drop the slot once its contents live in a mapped frame
    pub fn release_slot(&mut self, swap: &SwapTable) {
        if let Some(slot) = self.slot.take() {
            swap.free(slot);
        }
    }

    /// Fill `frame` and release the slot. The slot survives a failed read.
    pub fn swap_in(&mut self, frame: &mut [u8], swap: &SwapTable) -> VmResult<()> {
        self.fill(frame, swap)?;
        self.release_slot(swap);
        Ok(())
    }

    /// Write `frame` to a fresh swap slot
    pub fn swap_out(&mut self, frame: &[u8], swap: &SwapTable) -> VmResult<()> {
        debug_assert!(self.slot.is_none(), "resident anon page already owns a slot");
        self.slot = Some(swap.swap_out(frame)?);
        Ok(())
    }

    /// Release the swap slot, if any. Contents are discarded.
    pub fn destroy(self, swap: &SwapTable) {
        if let Some(slot) = self.slot {
            swap.free(slot);
        }
    }

    /// Independent copy; a swapped-out page gets its own slot
    pub fn duplicate(&self, swap: &SwapTable) -> VmResult<Self> {
        let slot = match &self.slot {
            Some(slot) => Some(swap.duplicate(slot)?),
            None => None,
        };
        Ok(Self { slot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::block::RamDisk;
    use crate::vm::swap::SECTORS_PER_PAGE;
    use crate::vm::PAGE_SIZE;
    use alloc::sync::Arc;
    use alloc::vec;

    fn setup(slots: u64) -> (Arc<RamDisk>, SwapTable) {
        let disk = Arc::new(RamDisk::new(slots * SECTORS_PER_PAGE as u64));
        (disk.clone(), SwapTable::new(disk))
    }

    #[test]
    fn test_first_touch_zero_fills() {
        let (_disk, swap) = setup(1);
        let mut anon = AnonPage::new();
        let mut frame = vec![0xffu8; PAGE_SIZE];
        anon.swap_in(&mut frame, &swap).unwrap();
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_swap_cycle_releases_slot() {
        let (_disk, swap) = setup(1);
        let mut anon = AnonPage::new();
        let frame = vec![0x42u8; PAGE_SIZE];
        anon.swap_out(&frame, &swap).unwrap();
        assert!(anon.is_swapped());
        assert_eq!(swap.used(), 1);

        let mut back = vec![0u8; PAGE_SIZE];
        anon.swap_in(&mut back, &swap).unwrap();
        assert_eq!(back, frame);
        assert!(!anon.is_swapped());
        assert_eq!(swap.used(), 0);
    }

    #[test]
    fn test_failed_swap_in_keeps_slot() {
        let (disk, swap) = setup(1);
        let mut anon = AnonPage::new();
        anon.swap_out(&vec![1u8; PAGE_SIZE], &swap).unwrap();

        disk.set_failing(true);
        let mut back = vec![0u8; PAGE_SIZE];
        assert!(anon.swap_in(&mut back, &swap).is_err());
        assert!(anon.is_swapped());
        assert_eq!(swap.used(), 1);
    }

    #[test]
    fn test_fill_keeps_slot_until_released() {
        let (_disk, swap) = setup(1);
        let mut anon = AnonPage::new();
        anon.swap_out(&vec![7u8; PAGE_SIZE], &swap).unwrap();

        let mut back = vec![0u8; PAGE_SIZE];
        anon.fill(&mut back, &swap).unwrap();
        assert!(back.iter().all(|&b| b == 7));
        assert!(anon.is_swapped());
        assert_eq!(swap.used(), 1);

        // A second fill still sees the same contents
        let mut again = vec![0u8; PAGE_SIZE];
        anon.fill(&mut again, &swap).unwrap();
        assert_eq!(again, back);

        anon.release_slot(&swap);
        assert!(!anon.is_swapped());
        assert_eq!(swap.used(), 0);
    }

    #[test]
    fn test_destroy_frees_slot() {
        let (_disk, swap) = setup(2);
        let mut anon = AnonPage::new();
        anon.swap_out(&vec![1u8; PAGE_SIZE], &swap).unwrap();
        let copy = anon.duplicate(&swap).unwrap();
        assert_eq!(swap.used(), 2);
        anon.destroy(&swap);
        copy.destroy(&swap);
        assert_eq!(swap.used(), 0);
    }
}
