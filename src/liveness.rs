//! Per-block liveness analysis.
//!
//! The vectors are filled by a single backward pass: local liveness is a
//! one-pass dataflow when information flows from the block exit backward,
//! because each register's state at reverse position `i` is a function of
//! its state at `i - 1` and the effect of the instruction at `i`.  Indices
//! are therefore reversed: entry 0 describes the last instruction.
//!
//! A separate forward scan serves reservations made outside the
//! block-driven insertion pass, where the block boundaries are unknown: it
//! walks from the insertion point to the first control transfer and
//! produces a single conservative liveness value at index 0.

use log::{debug, trace};

use crate::data_structures::{AFlags, GprLive, PerThread, Reg, SimdLive};
use crate::interface::AppInstr;

/// Backward scan over a whole block.  Fills the liveness vectors, counts
/// app uses, and notes intra-block control flow.  Runs in the host's
/// analysis event, before any insertion happens.
#[inline(never)]
pub(crate) fn analyze_block<I: AppInstr>(pt: &mut PerThread, insns: &[I]) {
    for st in pt.gprs.iter_mut().chain(pt.simds.iter_mut()) {
        st.app_uses = 0;
    }
    pt.live.clear();
    pt.bb_has_internal_flow = false;

    let num_gprs = pt.univ.num_gprs as usize;
    let num_simds = pt.univ.num_simds as usize;

    // Reverse scan; index counts from the block exit.
    let mut index = 0usize;
    for inst in insns.iter().rev() {
        let xfer = inst.is_control_transfer() || inst.is_interrupt() || inst.is_syscall();

        if !pt.bb_has_internal_flow && inst.targets_within_block() {
            // Lazy restores are unsafe once a branch can re-enter the
            // middle of the block.
            pt.bb_has_internal_flow = true;
            debug!("analyze @{}: disabling lazy restores due to intra-block control flow", index);
        }

        for r in 0..num_gprs {
            let reg = Reg::gpr(r as u8);
            let value = if inst.reads_reg(reg) {
                GprLive::Live
            } else if inst.writes_exact_reg(reg) {
                GprLive::Dead
            } else if xfer {
                GprLive::Live
            } else if index > 0 {
                pt.live.gpr[r][index - 1]
            } else {
                GprLive::Live
            };
            trace!("analyze @{}: {:?}={:?}", index, reg, value);
            pt.live.gpr[r].push(value);
        }

        for r in 0..num_simds {
            let reg = Reg::new(crate::data_structures::RegClass::SimdZmm, r as u8);
            let prior = if index > 0 {
                pt.live.simd[r][index - 1]
            } else {
                SimdLive::Unknown
            };
            let value = match simd_liveness_state(inst, reg, prior) {
                Some(v) => v,
                None => {
                    if xfer {
                        SimdLive::ZmmLive
                    } else {
                        prior
                    }
                }
            };
            trace!("analyze @{}: {:?}={:?}", index, reg, value);
            pt.live.simd[r].push(value);
        }

        let value = if xfer {
            // Assume the flags are read before written beyond the transfer.
            AFlags::all()
        } else {
            let prior = if index > 0 {
                pt.live.aflags[index - 1]
            } else {
                AFlags::all()
            };
            let r = inst.flags_read();
            let w = inst.flags_written();
            // A flag stays read-downstream unless written here without also
            // being read here.
            (prior | r) & !(w & !r)
        };
        trace!("analyze @{}: flags={:?}", index, value);
        pt.live.aflags.push(value);

        count_app_uses(pt, inst);
        index += 1;
    }

    pt.live_idx = index;
    pt.block_len = index;
}

/// Forward scan from an arbitrary insertion point, for use outside the
/// insertion pass.  Produces index-0 liveness that is `Live` for anything
/// indeterminate by the first control transfer.
#[inline(never)]
pub(crate) fn forward_scan<I: AppInstr>(pt: &mut PerThread, window: &[I]) {
    let num_gprs = pt.univ.num_gprs as usize;
    let num_simds = pt.univ.num_simds as usize;

    pt.live.clear();
    for r in 0..num_gprs {
        pt.gprs[r].app_uses = 0;
        pt.live.gpr[r].push(GprLive::Unknown);
    }
    for r in 0..num_simds {
        pt.simds[r].app_uses = 0;
        pt.live.simd[r].push(SimdLive::Unknown);
        // A stale spill record from an earlier standalone reservation must
        // not make a fresh reservation look resumable.
        pt.simds[r].ever_spilled = false;
    }

    // A flag is read iff it is read before any write; mask first-reads with
    // the set of already-written flags.
    let mut first_reads = AFlags::empty();
    let mut written = AFlags::empty();

    for inst in window {
        if inst.is_control_transfer() || inst.is_interrupt() || inst.is_syscall() {
            break;
        }

        for r in 0..num_gprs {
            if pt.live.gpr[r][0] != GprLive::Unknown {
                continue;
            }
            let reg = Reg::gpr(r as u8);
            if inst.reads_reg(reg) {
                pt.live.gpr[r][0] = GprLive::Live;
            } else if inst.writes_exact_reg(reg) {
                pt.live.gpr[r][0] = GprLive::Dead;
            }
        }

        for r in 0..num_simds {
            if pt.live.simd[r][0] != SimdLive::Unknown {
                continue;
            }
            let reg = Reg::new(crate::data_structures::RegClass::SimdZmm, r as u8);
            if let Some(v) = simd_liveness_state(inst, reg, SimdLive::Unknown) {
                pt.live.simd[r][0] = v;
            }
        }

        let r = inst.flags_read();
        // Reading and writing in one instruction counts only as reading.
        let w = inst.flags_written() & !r;
        first_reads |= r & !written;
        written |= w;

        count_app_uses(pt, inst);
    }

    for r in 0..num_gprs {
        if pt.live.gpr[r][0] == GprLive::Unknown {
            pt.live.gpr[r][0] = GprLive::Live;
        }
    }
    for r in 0..num_simds {
        if pt.live.simd[r][0] == SimdLive::Unknown {
            pt.live.simd[r][0] = SimdLive::ZmmLive;
        }
    }
    pt.live
        .aflags
        .push(first_reads | (AFlags::all() & !written));

    pt.live_idx = 0;
}

/// Make sure liveness information is valid for an operation at `at`: inside
/// the insertion pass the vectors are already filled for the whole block;
/// outside it, run the forward scan over the code that follows.
pub(crate) fn ensure_liveness_at<I: AppInstr>(pt: &mut PerThread, insns: &[I], at: crate::data_structures::InstIx) {
    if !pt.in_insertion {
        forward_scan(pt, &insns[at.get_usize()..]);
        debug_assert!(pt.live_idx == 0, "standalone paths always use index 0");
    }
}

/// The effect of one instruction on a vector register's liveness, if any.
/// `reg` is the canonical (widest) alias; `prior` is the state flowing in.
///
/// Precedence goes to bigger aliases: if both zmm0 and ymm0 are read, the
/// state must become ZmmLive, not YmmLive, and symmetrically for dead; that
/// is what keeps spilling at the narrowest sufficient width.  Writes only
/// deaden at the exact width written; a partial write deadens nothing.
fn simd_liveness_state<I: AppInstr>(inst: &I, reg: Reg, prior: SimdLive) -> Option<SimdLive> {
    use crate::data_structures::RegClass::{SimdXmm, SimdYmm, SimdZmm};
    debug_assert!(reg.class() == SimdZmm);
    let xmm = reg.with_class(SimdXmm);
    let ymm = reg.with_class(SimdYmm);
    let zmm = reg;

    if inst.reads_reg(zmm) {
        let state = if (inst.reads_exact_reg(zmm) || inst.has_partial_read(zmm))
            && (prior <= SimdLive::ZmmLive || prior == SimdLive::Unknown)
        {
            SimdLive::ZmmLive
        } else if (inst.reads_exact_reg(ymm) || inst.has_partial_read(ymm))
            && (prior <= SimdLive::YmmLive || prior == SimdLive::Unknown)
        {
            SimdLive::YmmLive
        } else if (inst.reads_exact_reg(xmm) || inst.has_partial_read(xmm))
            && (prior <= SimdLive::XmmLive || prior == SimdLive::Unknown)
        {
            SimdLive::XmmLive
        } else {
            // A read we cannot attribute to a width the prior state allows;
            // stay maximal.
            SimdLive::ZmmLive
        };
        return Some(state);
    }

    if inst.writes_reg(zmm) {
        if inst.writes_exact_reg(zmm) {
            return Some(SimdLive::ZmmDead);
        } else if inst.writes_exact_reg(ymm)
            && (prior < SimdLive::YmmDead || prior >= SimdLive::XmmLive)
        {
            return Some(SimdLive::YmmDead);
        } else if inst.writes_exact_reg(xmm) && prior >= SimdLive::XmmLive {
            return Some(SimdLive::XmmDead);
        }
        // A partial write leaves the register as live as it was.
    }
    None
}

fn count_app_uses<I: AppInstr>(pt: &mut PerThread, inst: &I) {
    for (reg, in_memory_operand) in inst.operand_regs() {
        if reg.is_gpr() {
            if reg.index() < pt.gprs.len() {
                pt.gprs[reg.index()].app_uses += 1;
                // Memory-tracing tools must restore the app value to form
                // the address, so memory uses count double.
                if in_memory_operand {
                    pt.gprs[reg.index()].app_uses += 1;
                }
            }
        } else if reg.index() < pt.simds.len() {
            pt.simds[reg.index()].app_uses += 1;
        }
    }
}
