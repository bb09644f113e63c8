//! Emission of spill and restore code.
//!
//! The mediator never encodes machine instructions itself; it hands the
//! host concrete [`CodeInst`] items to lower.  GPRs spill directly to raw
//! TLS (or to a host-framework slot once our own run out); vector registers
//! spill indirectly, through a pointer kept in a hidden TLS slot, which
//! costs a scratch GPR per access.

use log::debug;

use crate::data_structures::{InstIx, PerThread, Reg, RegClass, SpillSlot, Writable, AFLAGS_SLOT};
use crate::interface::{AppInstr, BlockCtx, CodeSink};
use crate::reserve;

/// One instruction of emitted spill/restore code, in host-lowerable form.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodeInst {
    /// Store a GPR to a raw TLS word at a byte offset.
    StoreTls { offs: u32, src: Reg },
    /// Load a GPR from a raw TLS word.
    LoadTls { offs: u32, dst: Writable<Reg> },
    /// Store a GPR into the host framework's numbered spill slot.
    StoreHostSlot { slot: u32, src: Reg },
    /// Load a GPR from the host framework's numbered spill slot.
    LoadHostSlot { slot: u32, dst: Writable<Reg> },
    /// Aligned vector store to `[base + disp]`.
    StoreSimd { base: Reg, disp: u32, src: Reg },
    /// Aligned vector load from `[base + disp]`.
    LoadSimd { base: Reg, disp: u32, dst: Writable<Reg> },
    /// Capture the low arithmetic flags into the accumulator's flags byte.
    FlagsToAccum,
    /// Capture the overflow flag into the accumulator's low byte.
    CaptureOverflow,
    /// Write the accumulator's flags byte back to the arithmetic flags.
    FlagsFromAccum,
    /// Recreate the overflow flag from the accumulator's low byte, without
    /// clobbering that byte (a compare, not an add).
    MaterializeOverflow,
    /// Exchange two GPRs.
    Swap { a: Reg, b: Reg },
    /// Copy one register to another of the same class.
    Move { dst: Writable<Reg>, src: Reg },
    /// Materialise the application value of the host's stolen register.
    LoadStolenValue { dst: Writable<Reg> },
}

/// Run `f` with the host's instrumentation auto-predication suspended, so
/// the emitted batch executes unconditionally.
pub(crate) fn unpredicated<I, S: CodeSink, R>(
    cx: &mut BlockCtx<I, S>,
    f: impl FnOnce(&mut BlockCtx<I, S>) -> R,
) -> R {
    let prior = cx.sink.clear_auto_predication();
    let result = f(cx);
    cx.sink.set_auto_predication(prior);
    result
}

//=============================================================================
// Direct (GPR) spills

/// Emit a store of `reg` into GPR-space `slot` before `at`.  The caller
/// updates the register's own state (including `ever_spilled`); this routine
/// updates slot ownership.
pub(crate) fn spill_gpr_directly<S: CodeSink>(
    pt: &mut PerThread,
    sink: &mut S,
    at: InstIx,
    reg: Reg,
    slot: SpillSlot,
) {
    debug!("spill @{} {:?} -> {:?}", pt.live_idx, reg, slot);
    debug_assert!(
        pt.slots.owner(slot).is_none()
            || pt.slots.owner(slot) == Some(reg)
            // The flags can be saved and restored using different carriers.
            || slot == AFLAGS_SLOT,
        "internal tracking error"
    );
    if slot == AFLAGS_SLOT {
        pt.aflags.ever_spilled = true;
    }
    pt.slots.set_owner(slot, Some(reg));
    if slot.get() < pt.config.num_gpr_slots {
        sink.insert(
            at,
            CodeInst::StoreTls {
                offs: pt.config.direct_slot_offs(slot),
                src: reg,
            },
        );
    } else {
        sink.insert(
            at,
            CodeInst::StoreHostSlot {
                slot: slot.get() - pt.config.num_gpr_slots,
                src: reg,
            },
        );
    }
}

/// Emit a load of `reg` from GPR-space `slot` before `at`.  Releases slot
/// ownership when `release`.
pub(crate) fn restore_gpr_directly<S: CodeSink>(
    pt: &mut PerThread,
    sink: &mut S,
    at: InstIx,
    reg: Reg,
    slot: SpillSlot,
    release: bool,
) {
    debug!(
        "restore @{} {:?} <- {:?} release={}",
        pt.live_idx, reg, slot, release
    );
    debug_assert!(
        pt.slots.owner(slot) == Some(reg)
            || (slot == AFLAGS_SLOT && pt.slots.owner(slot).is_some()),
        "internal tracking error"
    );
    if release {
        pt.slots.set_owner(slot, None);
    }
    if slot.get() < pt.config.num_gpr_slots {
        sink.insert(
            at,
            CodeInst::LoadTls {
                offs: pt.config.direct_slot_offs(slot),
                dst: Writable::from_reg(reg),
            },
        );
    } else {
        sink.insert(
            at,
            CodeInst::LoadHostSlot {
                slot: slot.get() - pt.config.num_gpr_slots,
                dst: Writable::from_reg(reg),
            },
        );
    }
}

//=============================================================================
// Indirect (SIMD) spills

/// Load the pointer to the indirect SIMD area into a scratch GPR.
fn load_indirect_base<S: CodeSink>(pt: &PerThread, sink: &mut S, at: InstIx, scratch: Reg) {
    sink.insert(
        at,
        CodeInst::LoadTls {
            offs: pt.config.simd_ptr_offs,
            dst: Writable::from_reg(scratch),
        },
    );
}

/// Emit the two-instruction indirect spill of a vector register before
/// `at`: load the area pointer into a freshly reserved scratch GPR, then an
/// aligned store at the slot's displacement.  Only the 128-bit subclass is
/// emitted; wider classes are rejected before reaching here.
pub(crate) fn spill_simd_indirectly<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
    reg: Reg,
    slot: SpillSlot,
) {
    debug!("spill_simd @{} {:?} -> {:?}", pt.live_idx, reg, slot);
    debug_assert!(reg.is_simd(), "not an applicable register");
    debug_assert!(
        pt.slots.simd_owner(slot).is_none()
            || pt.slots.simd_owner(slot).map(Reg::widest) == Some(reg.widest()),
        "internal tracking error"
    );
    debug_assert!(
        slot.get() < pt.config.num_simd_slots,
        "slot out of bounds of the requested SIMD slots"
    );
    let scratch = match reserve::reserve_gpr_internal(pt, cx, at, None, false) {
        Ok(r) => r,
        Err(e) => {
            crate::interface::report_error(
                pt.config.error_callback,
                e,
                "failed to reserve scratch register for a vector spill",
            );
            return;
        }
    };
    load_indirect_base(pt, cx.sink, at, scratch);
    pt.slots.set_simd_owner(slot, Some(reg));
    debug_assert!(
        reg.class() == RegClass::SimdXmm,
        "wider vector classes are not spillable yet"
    );
    cx.sink.insert(
        at,
        CodeInst::StoreSimd {
            base: scratch,
            disp: slot.get() * crate::slots::SIMD_SLOT_SIZE,
            src: reg,
        },
    );
    if let Err(e) = reserve::unreserve_register_internal(pt, cx, at, scratch) {
        crate::interface::report_error(
            pt.config.error_callback,
            e,
            "failed to unreserve scratch register after a vector spill",
        );
    }
}

/// Emit the two-instruction indirect restore of a vector register before
/// `at`.  Releases slot ownership when `release` and the stored alias
/// matches exactly.
pub(crate) fn restore_simd_indirectly<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
    reg: Reg,
    slot: SpillSlot,
    release: bool,
) {
    debug!(
        "restore_simd @{} {:?} <- {:?} release={}",
        pt.live_idx, reg, slot, release
    );
    debug_assert!(reg.is_simd(), "not an applicable register");
    let owner = pt.slots.simd_owner(slot);
    debug_assert!(
        owner.map(Reg::widest) == Some(reg.widest())
            && owner.map(|o| o.class().size_bytes()).unwrap_or(0) >= reg.class().size_bytes(),
        "internal tracking error"
    );
    let scratch = match reserve::reserve_gpr_internal(pt, cx, at, None, false) {
        Ok(r) => r,
        Err(e) => {
            crate::interface::report_error(
                pt.config.error_callback,
                e,
                "failed to reserve scratch register for a vector restore",
            );
            return;
        }
    };
    load_indirect_base(pt, cx.sink, at, scratch);
    if release && owner == Some(reg) {
        pt.slots.set_simd_owner(slot, None);
    }
    debug_assert!(
        reg.class() == RegClass::SimdXmm,
        "wider vector classes are not spillable yet"
    );
    cx.sink.insert(
        at,
        CodeInst::LoadSimd {
            base: scratch,
            disp: slot.get() * crate::slots::SIMD_SLOT_SIZE,
            dst: Writable::from_reg(reg),
        },
    );
    if let Err(e) = reserve::unreserve_register_internal(pt, cx, at, scratch) {
        crate::interface::report_error(
            pt.config.error_callback,
            e,
            "failed to unreserve scratch register after a vector restore",
        );
    }
}
