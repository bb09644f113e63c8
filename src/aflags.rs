//! The arithmetic-flags sub-state-machine.
//!
//! Flags move between four shapes: native (still the application's),
//! captured in the accumulator, stored in slot 0, and any of those while
//! reserved by a client.  Capturing goes through the accumulator because
//! that is the only register the flags-to-register instruction targets; as
//! an optimisation the captured word is *parked* there, and the store to
//! slot 0 is deferred until something else wants the accumulator.
//!
//! The capture sequence is flags-to-accumulator plus an overflow capture
//! into the accumulator's low byte; the restore materialises overflow with
//! a compare that leaves that byte intact, so the word can stay live in the
//! accumulator across repeated restores.

use log::debug;

use crate::data_structures::{AFlags, GprLive, InstIx, PerThread, AFLAGS_SLOT};
use crate::emit::{self, unpredicated, CodeInst};
use crate::interface::{AppInstr, BlockCtx, CodeSink, RegMedError};
use crate::liveness;
use crate::reserve;

/// Emit the flags capture at `at`.  On return the flags are reserved-shaped:
/// either parked in the accumulator (normal case) or already stored to slot
/// 0 (when the accumulator is client-held and a swap register was needed).
///
/// May set `aflags.xchg`.
pub(crate) fn spill_aflags<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
) -> Result<(), RegMedError> {
    let accum = pt.univ.accumulator;
    let live = pt.aflags_live_at(pt.live_idx);
    debug!("spill_aflags @{}", pt.live_idx);

    let mut swap = None;
    if pt.gpr_state(accum).in_use && pt.aflags.xchg != Some(accum) {
        // No way to tell whoever holds the accumulator that we need it, so
        // park its tool value in a freshly reserved register for the
        // duration of the capture.  The flags go straight to their slot in
        // this case rather than staying in the accumulator.
        let xr = reserve::reserve_gpr_internal(pt, cx, at, None, false)?;
        debug!("  accumulator is in use: using {:?} temporarily", xr);
        cx.sink.insert(at, CodeInst::Swap { a: accum, b: xr });
        swap = Some(xr);
    }

    if !pt.gpr_state(accum).native {
        // Unreserved but not yet lazily restored: its slot already holds
        // the app value.
        debug_assert!(
            pt.gpr_state(accum)
                .slot
                .map_or(false, |s| pt.slots.owner(s) == Some(accum)),
            "accumulator tracking error"
        );
        debug!(
            "  using un-restored accumulator in {:?}",
            pt.gpr_state(accum).slot
        );
    } else if pt.aflags.xchg != Some(accum) {
        let xslot = pt.slots.find_free_slot().ok_or(RegMedError::OutOfSlots)?;
        if pt.config.conservative || pt.gpr_live_at(accum, pt.live_idx) == GprLive::Live {
            emit::spill_gpr_directly(pt, cx.sink, at, accum, xslot);
        } else {
            pt.slots.set_owner(xslot, Some(accum));
        }
        pt.gpr_state_mut(accum).slot = Some(xslot);
        debug_assert!(pt.slots.owner(xslot) == Some(accum), "slot should be the accumulator's");
    }

    cx.sink.insert(at, CodeInst::FlagsToAccum);
    if live.contains(AFlags::OF) {
        cx.sink.insert(at, CodeInst::CaptureOverflow);
    }

    if let Some(xr) = swap {
        cx.sink.insert(at, CodeInst::Swap { a: xr, b: accum });
        emit::spill_gpr_directly(pt, cx.sink, at, xr, AFLAGS_SLOT);
        reserve::unreserve_register_internal(pt, cx, at, xr)?;
    } else {
        // Keep the flags in the accumulator itself until forced to move
        // them to slot 0.
        let was_pending = {
            let st = pt.gpr_state(accum);
            !st.native && !st.in_use
        };
        if was_pending {
            pt.pending_unreserved -= 1;
        }
        let st = pt.gpr_state_mut(accum);
        st.in_use = true;
        st.native = false;
        // The slot is marked written even on the no-spill path; the
        // un-restored-accumulator branch above relies on owning it.
        st.ever_spilled = true;
        pt.aflags.xchg = Some(accum);
    }
    Ok(())
}

/// Emit the restore of the application flags at `at`.  `release` hands the
/// flags state back (slot freed, parked accumulator unreserved); without it
/// the captured value stays available for a later re-restore.
pub(crate) fn restore_aflags<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
    release: bool,
) -> Result<(), RegMedError> {
    let accum = pt.univ.accumulator;
    let live = pt.aflags_live_at(pt.live_idx);
    debug!(
        "restore_aflags @{}: release={} accum-in-use={} slot={:?} xchg={:?}",
        pt.live_idx,
        release,
        pt.gpr_state(accum).in_use,
        pt.gpr_state(accum).slot,
        pt.aflags.xchg
    );
    if pt.aflags.native {
        return Ok(());
    }

    let mut temp_slot = None;
    let mut swap = None;
    if pt.aflags.xchg == Some(accum) {
        debug_assert!(pt.gpr_state(accum).in_use, "flags-in-accumulator state error");
    } else {
        let t = pt.slots.find_free_slot().ok_or(RegMedError::OutOfSlots)?;
        temp_slot = Some(t);
        if pt.gpr_state(accum).in_use {
            // Pick an unreserved register, park the accumulator's tool
            // value there, and swap back afterwards.
            let xr = reserve::reserve_gpr_internal(pt, cx, at, None, false)?;
            debug!("  accumulator is in use: using {:?} temporarily", xr);
            cx.sink.insert(at, CodeInst::Swap { a: accum, b: xr });
            swap = Some(xr);
        } else if pt.config.conservative || pt.gpr_live_at(accum, pt.live_idx) == GprLive::Live {
            emit::spill_gpr_directly(pt, cx.sink, at, accum, t);
        }
        emit::restore_gpr_directly(pt, cx.sink, at, accum, AFLAGS_SLOT, release);
    }

    if live.contains(AFlags::OF) {
        // A plain add would clobber the low byte that holds the other
        // flags; the compare reproduces OF while leaving it intact.
        cx.sink.insert(at, CodeInst::MaterializeOverflow);
    }
    cx.sink.insert(at, CodeInst::FlagsFromAccum);

    if let Some(xr) = swap {
        cx.sink.insert(at, CodeInst::Swap { a: xr, b: accum });
        reserve::unreserve_register_internal(pt, cx, at, xr)?;
    } else if pt.aflags.xchg == Some(accum) {
        if release {
            pt.aflags.xchg = None;
            pt.gpr_state_mut(accum).in_use = false;
            // The accumulator still holds the flags word; its app value
            // stays in its slot awaiting a lazy restore.
            pt.pending_unreserved += 1;
        }
    } else if pt.config.conservative || pt.gpr_live_at(accum, pt.live_idx) == GprLive::Live {
        if let Some(t) = temp_slot {
            emit::restore_gpr_directly(pt, cx.sink, at, accum, t, true);
        }
    }
    Ok(())
}

/// Evict parked flags out of the accumulator.  Only call when the flags are
/// currently carried there.  If the flags are reserved (or the caller wants
/// the machine state unchanged), the captured word moves to slot 0; if they
/// are unreserved, the app flags are restored instead.  Either way the
/// accumulator's own app value comes back and, when `stateful`, the
/// accumulator is handed back to the allocator.
pub(crate) fn move_aflags_from_reg<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
    stateful: bool,
) {
    let accum = pt.univ.accumulator;
    if pt.aflags.in_use || !stateful {
        debug!("move_aflags @{}: accumulator to slot", pt.live_idx);
        emit::spill_gpr_directly(pt, cx.sink, at, accum, AFLAGS_SLOT);
    } else if !pt.aflags.native {
        debug!("move_aflags @{}: lazily restoring aflags for app accumulator", pt.live_idx);
        if let Err(e) = restore_aflags(pt, cx, at, true) {
            crate::interface::report_error(
                pt.config.error_callback,
                e,
                "failed to restore flags before app accumulator use",
            );
        }
        pt.aflags.native = true;
        pt.slots.set_owner(AFLAGS_SLOT, None);
    }
    debug!(
        "move_aflags @{}: restoring accumulator from {:?}",
        pt.live_idx,
        pt.gpr_state(accum).slot
    );
    let acc_slot = pt.gpr_state(accum).slot;
    if pt.config.conservative || pt.gpr_live_at(accum, pt.live_idx) == GprLive::Live {
        if let Some(slot) = acc_slot {
            emit::restore_gpr_directly(pt, cx.sink, at, accum, slot, stateful);
        }
    } else if stateful {
        if let Some(slot) = acc_slot {
            pt.slots.set_owner(slot, None);
        }
    }
    if stateful {
        let was_pending = {
            let st = pt.gpr_state(accum);
            !st.native && !st.in_use
        };
        if was_pending {
            pt.pending_unreserved -= 1;
        }
        let st = pt.gpr_state_mut(accum);
        st.in_use = false;
        st.native = true;
        st.ever_spilled = false;
        pt.aflags.xchg = None;
    }
}

//=============================================================================
// Client-facing operations

impl PerThread {
    /// Reserve exclusive ownership of the arithmetic flags.  If the flags
    /// are dead here this costs nothing; if an earlier reservation is still
    /// outstanding (lazily unrestored) it is resumed; otherwise the capture
    /// sequence is emitted.
    pub fn reserve_aflags<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
    ) -> Result<(), RegMedError> {
        liveness::ensure_liveness_at(self, cx.insns, at);
        let live = self.aflags_live_at(self.live_idx);
        // Just like scratch registers, the flags are exclusively owned.
        if self.aflags.in_use {
            return Err(RegMedError::InUse);
        }
        let accum = self.univ.accumulator;

        if live.is_empty() {
            // Free ownership.  If a stale capture is outstanding, drop it.
            if !self.aflags.native {
                self.slots.set_owner(AFLAGS_SLOT, None);
                if self.aflags.xchg == Some(accum) {
                    self.aflags.xchg = None;
                    let st = self.gpr_state_mut(accum);
                    if st.in_use {
                        st.in_use = false;
                        self.pending_unreserved += 1;
                    }
                }
            }
            self.aflags.in_use = true;
            self.aflags.native = true;
            debug!("reserve_aflags @{}: aflags are dead", self.live_idx);
            return Ok(());
        }

        // A prior reservation not yet lazily restored can be resumed as-is.
        if !self.aflags.native
            || (self.gpr_state(accum).in_use && self.aflags.xchg == Some(accum))
        {
            debug!("reserve_aflags @{}: using un-restored aflags", self.live_idx);
            debug_assert!(
                self.aflags.xchg.is_some() || self.slots.owner(AFLAGS_SLOT).is_some(),
                "lost slot reservation"
            );
            self.aflags.native = false;
            self.aflags.in_use = true;
            return Ok(());
        }

        debug!("reserve_aflags @{}: spilling aflags", self.live_idx);
        // The capture writes this; the inconsistent combination of no
        // exchange partner but a reserved accumulator cannot reach here
        // because the un-restored branch above takes it.
        self.aflags.xchg = None;
        unpredicated(cx, |cx| spill_aflags(self, cx, at))?;
        self.aflags.in_use = true;
        self.aflags.native = false;
        self.aflags.slot = Some(AFLAGS_SLOT);
        Ok(())
    }

    /// Give up flags ownership.  Inside the insertion pass the restore is
    /// deferred in case another component wants the flags locally; outside
    /// it the app value comes back immediately.
    pub fn unreserve_aflags<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
    ) -> Result<(), RegMedError> {
        if !self.aflags.in_use {
            return Err(RegMedError::InvalidParameter);
        }
        self.aflags.in_use = false;
        if !self.in_insertion {
            unpredicated(cx, |cx| -> Result<(), RegMedError> {
                if self.aflags.xchg.is_some() {
                    move_aflags_from_reg(self, cx, at, true);
                } else if !self.aflags.native {
                    restore_aflags(self, cx, at, true)?;
                    self.aflags.native = true;
                }
                Ok(())
            })?;
            self.slots.set_owner(AFLAGS_SLOT, None);
        }
        debug!("unreserve_aflags @{}", self.live_idx);
        Ok(())
    }

    /// Put the application's flags back without giving up a reservation.
    pub fn restore_app_aflags<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
    ) -> Result<(), RegMedError> {
        if self.aflags.native {
            return Ok(());
        }
        debug!("restore_app_aflags @{}: restoring as requested", self.live_idx);
        let release = !self.aflags.in_use;
        unpredicated(cx, |cx| restore_aflags(self, cx, at, release))?;
        if !self.aflags.in_use {
            self.aflags.native = true;
        }
        Ok(())
    }

    /// The set of arithmetic flags some downstream instruction reads before
    /// writing, at `at`.  Empty means all dead.
    pub fn aflags_liveness<I: AppInstr, S>(
        &mut self,
        cx: &BlockCtx<I, S>,
        at: InstIx,
    ) -> Result<AFlags, RegMedError> {
        liveness::ensure_liveness_at(self, cx.insns, at);
        Ok(self.aflags_live_at(self.live_idx))
    }

    /// True if no arithmetic flag is read below `at`.
    pub fn are_aflags_dead<I: AppInstr, S>(
        &mut self,
        cx: &BlockCtx<I, S>,
        at: InstIx,
    ) -> Result<bool, RegMedError> {
        Ok(self.aflags_liveness(cx, at)?.is_empty())
    }
}
