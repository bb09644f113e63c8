//! Thread-local spill storage: the direct word slots backing GPR spills,
//! the 64-byte-aligned indirect area backing SIMD spills, and the
//! slot-ownership tables.
//!
//! Direct slots live in raw TLS so generated code reaches them in one
//! instruction.  TLS cannot be read straight into a vector register on the
//! supported ISAs, so SIMD slots live in a separately allocated aligned
//! area whose pointer sits in one hidden direct slot; generated code does
//! `load pointer; move [pointer + slot*64] <-> simd`.

use crate::data_structures::{Reg, SpillSlot, AFLAGS_SLOT};
use crate::interface::Config;

/// One SIMD slot.  The alignment carries over to the whole area, letting
/// generated code use aligned vector moves.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct SimdSlab([u8; 64]);

pub const SIMD_SLOT_SIZE: u32 = 64;

pub struct SlotStore {
    /// Which register owns each GPR-space slot (direct slots first, then the
    /// host framework's).  The flags engine owns slot 0; its entry names the
    /// GPR used to carry the flags, which may differ between the spill and
    /// the restore.
    slot_use: Vec<Option<Reg>>,
    /// Backing words for the direct slots.  This vector is the thread's TLS
    /// segment view; generated code addresses it by byte offset.
    direct: Vec<u64>,
    /// Which vector register owns each SIMD slot.  May hold a partial-width
    /// alias of the register that was actually reserved.
    simd_use: Vec<Option<Reg>>,
    simd: Vec<SimdSlab>,
    num_direct: u32,
    #[cfg(debug_assertions)]
    max_slot_used: u32,
}

impl SlotStore {
    pub fn new(config: &Config, host_slot_count: u32) -> SlotStore {
        let num_direct = config.num_gpr_slots;
        let total = (num_direct + host_slot_count) as usize;
        SlotStore {
            slot_use: vec![None; total],
            direct: vec![0; num_direct as usize],
            simd_use: vec![None; config.num_simd_slots as usize],
            simd: vec![SimdSlab([0; 64]); config.num_simd_slots as usize],
            num_direct,
            #[cfg(debug_assertions)]
            max_slot_used: 0,
        }
    }

    /// Total GPR-space slots tracked, direct plus host.
    pub fn num_total(&self) -> u32 {
        self.slot_use.len() as u32
    }

    pub fn num_simd(&self) -> u32 {
        self.simd_use.len() as u32
    }

    /// First free GPR-space slot.  Slot 0 is never returned; it is the
    /// flags engine's.
    pub fn find_free_slot(&self) -> Option<SpillSlot> {
        debug_assert!(AFLAGS_SLOT.get() == 0);
        for i in (AFLAGS_SLOT.get() + 1)..self.num_total() {
            if self.slot_use[i as usize].is_none() {
                return Some(SpillSlot::new(i));
            }
        }
        None
    }

    pub fn find_free_simd_slot(&self) -> Option<SpillSlot> {
        for i in 0..self.num_simd() {
            if self.simd_use[i as usize].is_none() {
                return Some(SpillSlot::new(i));
            }
        }
        None
    }

    pub fn owner(&self, slot: SpillSlot) -> Option<Reg> {
        self.slot_use[slot.get_usize()]
    }
    pub fn set_owner(&mut self, slot: SpillSlot, owner: Option<Reg>) {
        #[cfg(debug_assertions)]
        {
            if owner.is_some() && slot.get() > self.max_slot_used {
                self.max_slot_used = slot.get();
            }
        }
        self.slot_use[slot.get_usize()] = owner;
    }

    pub fn simd_owner(&self, slot: SpillSlot) -> Option<Reg> {
        self.simd_use[slot.get_usize()]
    }
    pub fn set_simd_owner(&mut self, slot: SpillSlot, owner: Option<Reg>) {
        self.simd_use[slot.get_usize()] = owner;
    }

    pub fn all_free(&self) -> bool {
        self.slot_use.iter().all(|o| o.is_none()) && self.simd_use.iter().all(|o| o.is_none())
    }

    /// Highest slot ever owned, for capacity-planning diagnostics.
    #[cfg(debug_assertions)]
    pub fn max_slot_used(&self) -> u32 {
        self.max_slot_used
    }

    //-------------------------------------------------------------------------
    // Value access.  Generated code writes these locations at run time; the
    // fault rewriter and tests read and write them directly.

    pub fn read_direct(&self, slot: SpillSlot) -> u64 {
        self.direct[slot.get_usize()]
    }
    pub fn write_direct(&mut self, slot: SpillSlot, value: u64) {
        self.direct[slot.get_usize()] = value;
    }

    /// Read the low `len` bytes of a SIMD slot.
    pub fn read_simd(&self, slot: SpillSlot, len: usize) -> &[u8] {
        debug_assert!(len <= SIMD_SLOT_SIZE as usize);
        &self.simd[slot.get_usize()].0[..len]
    }
    pub fn write_simd(&mut self, slot: SpillSlot, bytes: &[u8]) {
        debug_assert!(bytes.len() <= SIMD_SLOT_SIZE as usize);
        self.simd[slot.get_usize()].0[..bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interface::Config;

    fn test_config() -> Config {
        Config {
            num_gpr_slots: 4,
            num_simd_slots: 2,
            conservative: false,
            error_callback: None,
            simd_ptr_offs: 0,
            slot_offs: 8,
        }
    }

    #[test]
    fn slot_zero_is_never_allocated() {
        let store = SlotStore::new(&test_config(), 2);
        assert_eq!(store.find_free_slot(), Some(SpillSlot::new(1)));
    }

    #[test]
    fn first_free_search_skips_owned() {
        let mut store = SlotStore::new(&test_config(), 0);
        store.set_owner(SpillSlot::new(1), Some(Reg::gpr(3)));
        assert_eq!(store.find_free_slot(), Some(SpillSlot::new(2)));
        store.set_owner(SpillSlot::new(2), Some(Reg::gpr(5)));
        store.set_owner(SpillSlot::new(3), Some(Reg::gpr(6)));
        assert_eq!(store.find_free_slot(), None);
        store.set_owner(SpillSlot::new(2), None);
        assert_eq!(store.find_free_slot(), Some(SpillSlot::new(2)));
    }

    #[test]
    fn simd_area_is_aligned() {
        let store = SlotStore::new(&test_config(), 0);
        let p = store.read_simd(SpillSlot::new(0), 16).as_ptr() as usize;
        assert_eq!(p % 64, 0);
    }

    #[test]
    fn simd_values_round_trip() {
        let mut store = SlotStore::new(&test_config(), 0);
        let bytes: Vec<u8> = (0..16).collect();
        store.write_simd(SpillSlot::new(1), &bytes);
        assert_eq!(store.read_simd(SpillSlot::new(1), 16), &bytes[..]);
    }
}
