//! Fault-time state restoration: walking emitted code to rebuild the
//! application's register state.
//!
//! The clean reserve-and-unreserve interface, with no up-front declaration
//! of how many cross-instruction scratch registers a client wants, is paid
//! for here: when a fault lands inside the code cache, the fragment is
//! decoded from its start up to the fault PC and every instruction is
//! classified as one of our spills, one of our restores, or something else.
//!
//! The walk keeps a shadow mapping from register to slot:
//!
//!   - a spill of register R to slot S records `R -> S`, unless R is
//!     already mapped, in which case the new spill is a tool-value save to a
//!     temp slot and is ignored;
//!   - a restore of R from its recorded slot erases the mapping;
//!   - a restore of R from any other slot is a tool-value temp reload and
//!     is ignored.
//!
//! This makes the result independent of how many temp-slot sandwiches the
//! insertion driver wrapped around app instructions, as long as each spill
//! has its matching restore.  After the walk, every register still mapped
//! had an application value in memory at the fault point, so that value is
//! written into the machine context.  The flags get one extra bit of
//! shadow state: a capture opcode directly after an accumulator spill means
//! the flags ride in the accumulator rather than in their slot.
//!
//! Classification works from addresses, not from remembered instruction
//! identity: the direct-slot TLS range, the host framework's own slot
//! range, and the two-instruction indirect sequence (pointer load, then a
//! vector move against that pointer) are each recognisable on sight.

use log::{debug, trace};

use crate::data_structures::{AFlags, Map, PerThread, Reg, RegClass, SpillSlot, AFLAGS_SLOT};
use crate::interface::{CacheInstr, HostSlots, MachineContext, WORD_SIZE};

/// Result of classifying one instruction, see
/// [`PerThread::is_instr_spill_or_restore`].
#[derive(Copy, Clone, Debug)]
pub struct SpillRestoreInfo {
    pub is_spill: bool,
    pub is_restore: bool,
    /// The register being saved or restored, when recognised.
    pub reg: Option<Reg>,
}

#[derive(Copy, Clone, Debug)]
struct Recognized {
    is_spill: bool,
    reg: Reg,
    /// Unified GPR-space slot for direct/host accesses; SIMD-space slot for
    /// indirect ones.
    slot: SpillSlot,
    indirect: bool,
}

/// Classify one decoded instruction (with its successor, needed for the
/// indirect sequence) as one of our spills or restores.
fn recognize<C: CacheInstr, H: HostSlots>(
    pt: &PerThread,
    host: &H,
    instr: &C,
    next: Option<&C>,
) -> Option<Recognized> {
    let raw = instr.raw_slot_access()?;
    let cfg = &pt.config;

    if raw.in_tls
        && raw.offs >= cfg.slot_offs
        && raw.offs < cfg.slot_offs + cfg.num_gpr_slots * WORD_SIZE
    {
        // One of our direct slots.
        return Some(Recognized {
            is_spill: raw.is_store,
            reg: raw.reg,
            slot: SpillSlot::new((raw.offs - cfg.slot_offs) / WORD_SIZE),
            indirect: false,
        });
    }

    if raw.in_tls && raw.offs == cfg.simd_ptr_offs && !raw.is_store {
        // Loading the pointer to the indirect area; the spill or restore
        // itself is the vector move that follows immediately.  Nothing else
        // is allowed to interleave with this two-instruction sequence.
        let next = next?;
        let sba = match next.simd_block_access() {
            Some(s) => s,
            None => {
                debug_assert!(false, "use of the indirect area must be a vector move");
                return None;
            }
        };
        return Some(Recognized {
            is_spill: sba.is_store,
            reg: sba.reg,
            slot: SpillSlot::new(sba.disp / crate::slots::SIMD_SLOT_SIZE),
            indirect: true,
        });
    }

    // Assume a host-framework slot, in TLS or in the thread-private context
    // block.
    let slot = if raw.in_tls {
        let max_slot = host.max_addressable_slot();
        let min_offs = host.slot_offs(0);
        let max_offs = host.slot_offs(max_slot);
        // The host lays its slots out linearly, low-to-high or high-to-low.
        let slot = if min_offs > max_offs {
            if raw.offs > min_offs {
                (raw.offs - min_offs) / WORD_SIZE
            } else if raw.offs < max_offs {
                // Beyond the addressable range on the far side: one of the
                // host's hidden slots.
                max_slot + 1
            } else {
                (min_offs - raw.offs) / WORD_SIZE
            }
        } else if raw.offs > max_offs {
            (raw.offs - max_offs) / WORD_SIZE
        } else if raw.offs < min_offs {
            max_slot + 1
        } else {
            (raw.offs - min_offs) / WORD_SIZE
        };
        if slot > max_slot {
            // Not ours: some other component's TLS access.
            return None;
        }
        if slot + 1 > max_slot {
            // The last usable host slot is left unrecognised: the host uses
            // it for stores with no paired restore, which would wreck the
            // walk.  Tools are told to allocate enough dedicated slots.
            return None;
        }
        slot
    } else {
        // Context-block offsets are zero-based.
        raw.offs / WORD_SIZE
    };
    Some(Recognized {
        is_spill: raw.is_store,
        reg: raw.reg,
        slot: SpillSlot::new(slot + cfg.num_gpr_slots),
        indirect: false,
    })
}

fn spilled_value<H: HostSlots>(pt: &PerThread, host: &H, slot: SpillSlot) -> u64 {
    if slot.get() < pt.config.num_gpr_slots {
        pt.slots.read_direct(slot)
    } else {
        host.read_slot(slot.get() - pt.config.num_gpr_slots)
    }
}

impl PerThread {
    /// Is `instr` (from the code cache) one of our spills or restores, and
    /// of which register?  The successor instruction is needed to identify
    /// the indirect vector sequence.
    pub fn is_instr_spill_or_restore<C: CacheInstr, H: HostSlots>(
        &self,
        host: &H,
        instr: &C,
        next: Option<&C>,
    ) -> SpillRestoreInfo {
        match recognize(self, host, instr, next) {
            None => SpillRestoreInfo {
                is_spill: false,
                is_restore: false,
                reg: None,
            },
            Some(rec) => SpillRestoreInfo {
                is_spill: rec.is_spill,
                is_restore: !rec.is_spill,
                reg: Some(rec.reg),
            },
        }
    }
}

/// Rewrite a faulting machine context back to the application's view.
///
/// `code` holds the instructions decoded from the fragment start, in order;
/// `num_executed` of them lie before the fault PC (one extra trailing
/// instruction, when available, lets the walk pair an indirect-area pointer
/// load with its vector move).  Returns true if the context was processed
/// (including the no-op case of nothing to rewrite).
pub fn restore_state<C: CacheInstr, H: HostSlots, M: MachineContext>(
    pt: &PerThread,
    host: &H,
    code: &[C],
    num_executed: usize,
    mcx: &mut M,
) -> bool {
    let accum = pt.univ.accumulator;
    // Shadow state: which slot holds each register's app value right now.
    // SIMD registers are keyed by their canonical alias; the slot-to-alias
    // map remembers the width that was actually stored.
    let mut spilled_to: Map<Reg, SpillSlot> = Map::default();
    let mut spilled_simd_to: Map<Reg, SpillSlot> = Map::default();
    let mut simd_slot_use: Map<SpillSlot, Reg> = Map::default();
    let mut spilled_to_aflags = None::<SpillSlot>;
    // Set by a flags capture directly after an accumulator spill, cleared
    // by the release opcode or by anything else landing in the accumulator.
    let mut prev_accum_spill = false;
    let mut aflags_in_accum = false;

    debug!("restore_state: walking {} executed instructions", num_executed);
    for i in 0..num_executed.min(code.len()) {
        let instr = &code[i];
        let next = code.get(i + 1);
        if let Some(rec) = recognize(pt, host, instr, next) {
            trace!(
                "restore_state @{}: {} of {:?} slot {:?}",
                i,
                if rec.is_spill { "spill" } else { "restore" },
                rec.reg,
                rec.slot
            );
            if rec.is_spill {
                if !rec.indirect && rec.slot == AFLAGS_SLOT {
                    spilled_to_aflags = Some(rec.slot);
                } else if rec.indirect {
                    let key = rec.reg.widest();
                    match spilled_simd_to.get(&key) {
                        // A redundant same-slot spill refreshes the value.
                        Some(&s) if s != rec.slot => {
                            // Already spilled: this one is a tool-value
                            // save to a temp slot.
                            trace!("restore_state @{}: ignoring tool spill", i);
                        }
                        _ => {
                            spilled_simd_to.insert(key, rec.slot);
                            simd_slot_use.insert(rec.slot, rec.reg);
                        }
                    }
                } else {
                    match spilled_to.get(&rec.reg) {
                        Some(&s) if s != rec.slot => {
                            trace!("restore_state @{}: ignoring tool spill", i);
                        }
                        _ => {
                            spilled_to.insert(rec.reg, rec.slot);
                        }
                    }
                }
            } else {
                // A restore.
                if !rec.indirect && rec.slot == AFLAGS_SLOT && spilled_to_aflags == Some(rec.slot)
                {
                    spilled_to_aflags = None;
                } else if rec.indirect {
                    let key = rec.reg.widest();
                    if spilled_simd_to.get(&key) == Some(&rec.slot) {
                        spilled_simd_to.remove(&key);
                        simd_slot_use.remove(&rec.slot);
                    }
                } else if spilled_to.get(&rec.reg) == Some(&rec.slot) {
                    spilled_to.remove(&rec.reg);
                } else {
                    // A tool-value temp reload.
                    trace!("restore_state @{}: ignoring restore", i);
                }
            }
            if !rec.indirect && rec.reg == accum {
                prev_accum_spill = rec.is_spill;
                aflags_in_accum = false;
            }
        } else if instr.is_flags_capture() && prev_accum_spill {
            aflags_in_accum = true;
        } else if instr.is_flags_release() {
            aflags_in_accum = false;
        } else if aflags_in_accum && instr.writes_reg(accum) {
            // The accumulator got clobbered; the flags no longer ride there.
            aflags_in_accum = false;
        }
    }

    if spilled_to_aflags.is_some() || aflags_in_accum {
        let val = if aflags_in_accum {
            mcx.gpr(accum)
        } else {
            // spilled_to_aflags is Some here.
            match spilled_to_aflags {
                Some(slot) => spilled_value(pt, host, slot),
                None => 0,
            }
        };
        let arith = AFlags::all().bits() as u64;
        let mut newval = mcx.flags() & !arith;
        newval |= (val >> 8) & AFlags::LOW_BYTE.bits() as u64;
        if val & 1 != 0 {
            // The overflow capture left a 1 in the low byte.
            newval |= AFlags::OF.bits() as u64;
        }
        debug!(
            "restore_state: restoring aflags from {:#x} to {:#x}",
            mcx.flags(),
            newval
        );
        mcx.set_flags(newval);
    }

    for (&reg, &slot) in &spilled_to {
        let val = spilled_value(pt, host, slot);
        debug!(
            "restore_state: restoring {:?} from {:?}: {:#x} -> {:#x}",
            reg,
            slot,
            mcx.gpr(reg),
            val
        );
        mcx.set_gpr(reg, val);
    }

    for (_, &slot) in &spilled_simd_to {
        if slot.get() >= pt.config.num_simd_slots {
            continue;
        }
        let actual = match simd_slot_use.get(&slot) {
            Some(&a) => a,
            None => {
                debug_assert!(false, "slot mapping lost its register");
                continue;
            }
        };
        debug_assert!(
            actual.class() == RegClass::SimdXmm,
            "wider vector classes are not spillable yet"
        );
        let bytes = pt.slots.read_simd(slot, actual.class().size_bytes());
        debug!("restore_state: restoring {:?} from {:?}", actual, slot);
        mcx.set_simd(actual, bytes);
    }
    true
}
