//! The per-instruction insertion driver.
//!
//! The host walks the block in forward order and calls [`PerThread::insert_early`]
//! before clients instrument each instruction and [`PerThread::insert_late`]
//! after.  The late hook is where laziness pays off: application values are
//! restored at the last possible moment (the next app read, a volatile host
//! slot, or the end of the block), and re-spilled only when an app write
//! actually clobbers a value someone still needs.
//!
//! When a reserved register must observe an app read and keep its tool
//! value, the driver builds the temp-slot sandwich; with a write too the
//! emitted shape around the app instruction is exactly
//!
//! ```text
//!   spill tool -> tmp
//!   restore app -> reg
//!   <app instruction>
//!   spill reg -> appslot
//!   restore tmp -> reg
//! ```
//!
//! The fault rewriter depends on this shape, so changes here must be
//! mirrored there.

use log::debug;

use crate::aflags::{move_aflags_from_reg, restore_aflags, spill_aflags};
use crate::data_structures::{
    BbProperties, GprLive, InstIx, PerThread, Reg, RegClass, SpillSlot, AFLAGS_SLOT,
};
use crate::emit;
use crate::interface::{report_error, AppInstr, BlockCtx, CodeSink, RegMedError};
use crate::liveness;
use crate::reserve::restore_reg_now;

const MAX_FILE: usize = 64;

impl PerThread {
    /// Host analysis event: scan the whole block backward and fill the
    /// liveness vectors.  Must run before the per-instruction events.
    pub fn analyze_block<I: AppInstr>(&mut self, insns: &[I]) {
        liveness::analyze_block(self, insns);
    }

    /// Host early per-instruction event, before clients instrument the
    /// instruction at `ix`.  Advances the backward liveness cursor.
    pub fn insert_early(&mut self, ix: InstIx) {
        self.in_insertion = true;
        debug_assert!(self.live_idx > 0, "insertion ran past the block");
        self.live_idx = self.live_idx.saturating_sub(1);
        debug_assert_eq!(
            self.live_idx,
            self.block_len - 1 - ix.get_usize(),
            "early/late events out of step with analysis"
        );
    }

    /// Host late per-instruction event, after clients are done with the
    /// instruction at `ix`: lazy restores before it, re-spills after it.
    pub fn insert_late<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        ix: InstIx,
    ) -> Result<(), RegMedError> {
        let prior = cx.sink.clear_auto_predication();
        let res = self.insert_late_inner(cx, ix);
        cx.sink.set_auto_predication(prior);
        self.debug_check_pending();
        res
    }

    fn insert_late_inner<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        ix: InstIx,
    ) -> Result<(), RegMedError> {
        let i = ix.get_usize();
        debug_assert!(i < self.block_len);
        let is_last = i + 1 == self.block_len;
        let next = ix.plus(1);
        let num_gprs = self.univ.num_gprs as usize;
        let num_simds = self.univ.num_simds as usize;
        let cb = self.config.error_callback;
        let accum = self.univ.accumulator;

        // Restores that lazy unreserved registers would disturb are forced
        // eagerly when the block has internal flow.
        let lazy_unsafe = (self.bb_has_internal_flow
            && !self.bb_props.contains(BbProperties::IGNORE_CONTROL_FLOW))
            || self.bb_props.contains(BbProperties::CONTAINS_SPANNING_CONTROL_FLOW);

        // --- Before the instruction: restore the app flags if it needs them.
        let aflags_here = self.aflags_live_at(self.live_idx);
        if !self.aflags.native
            && (is_last
                || !cx.insns[i].flags_read().is_empty()
                // Writing just a subset must combine with the unwritten rest.
                || (!cx.insns[i].flags_written().is_empty() && !aflags_here.is_empty())
                // Host slots are not preserved across app instructions.
                || self
                    .aflags
                    .slot
                    .map_or(false, |s| s.get() >= self.config.num_gpr_slots))
        {
            debug!(
                "late @{}: flags={:?} in_use={}: lazily restoring aflags",
                self.live_idx, aflags_here, self.aflags.in_use
            );
            if let Err(e) = restore_aflags(self, cx, ix, false) {
                report_error(cb, e, "failed to restore flags before app read");
            }
            if !self.aflags.in_use {
                self.aflags.native = true;
                self.slots.set_owner(AFLAGS_SLOT, None);
            }
        }

        // --- Before the instruction: restore app values it reads.
        let mut restored_for_simd_read = [None::<SpillSlot>; MAX_FILE];
        for r in 0..num_simds {
            let reg = Reg::new(RegClass::SimdZmm, r as u8);
            if self.simd_state(reg).native {
                continue;
            }
            debug_assert!(self.config.num_simd_slots > 0, "vector spilled without slots");
            // The canonical alias covers reads at every width.
            let needed = is_last
                || cx.insns[i].reads_reg(reg)
                || (!self.simd_state(reg).in_use && lazy_unsafe);
            if !needed {
                continue;
            }
            if !self.simd_state(reg).in_use {
                debug!("late @{}: lazily restoring {:?}", self.live_idx, reg);
                if let Err(e) = restore_reg_now(self, cx, ix, reg) {
                    report_error(cb, e, "lazy restore failed");
                }
                debug_assert!(self.simd_pending_unreserved > 0, "should not go negative");
                self.simd_pending_unreserved -= 1;
            } else {
                let slot = match self.simd_state(reg).slot {
                    Some(s) => s,
                    None => continue,
                };
                let spilled_reg = match self.slots.simd_owner(slot) {
                    Some(r) => r,
                    None => {
                        report_error(cb, RegMedError::Internal, "invalid spilled register");
                        continue;
                    }
                };
                let tmp = match self.slots.find_free_simd_slot() {
                    Some(t) => t,
                    None => {
                        report_error(
                            cb,
                            RegMedError::OutOfSlots,
                            "failed to preserve tool value around app read",
                        );
                        continue;
                    }
                };
                debug!("late @{}: restoring {:?} for app read", self.live_idx, reg);
                emit::spill_simd_indirectly(self, cx, ix, spilled_reg, tmp);
                emit::restore_simd_indirectly(self, cx, ix, spilled_reg, slot, false);
                // The reload of the tool value lands after the instruction,
                // shared with the app re-spill if this instruction writes
                // too.  native stays false.
                restored_for_simd_read[r] = Some(tmp);
            }
        }

        let mut restored_for_read = [None::<SpillSlot>; MAX_FILE];
        for r in 0..num_gprs {
            let reg = Reg::gpr(r as u8);
            if self.gpr_state(reg).native {
                continue;
            }
            let inst = &cx.insns[i];
            let needed = is_last
                || inst.reads_reg(reg)
                // A partial write must combine with the rest of the reg.
                || (inst.writes_reg(reg) && !inst.writes_exact_reg(reg))
                // A conditional write is a read and a write, or our saved
                // copy would be wrong when the condition fails.
                || (inst.writes_reg(reg) && !inst.unconditionally_writes_reg(reg))
                || (!self.gpr_state(reg).in_use && lazy_unsafe)
                // Host slots are not preserved across app instructions.
                || self
                    .gpr_state(reg)
                    .slot
                    .map_or(false, |s| s.get() >= self.config.num_gpr_slots);
            if !needed {
                continue;
            }
            if !self.gpr_state(reg).in_use {
                debug!("late @{}: lazily restoring {:?}", self.live_idx, reg);
                if let Err(e) = restore_reg_now(self, cx, ix, reg) {
                    report_error(cb, e, "lazy restore failed");
                }
                debug_assert!(self.pending_unreserved > 0, "should not go negative");
                self.pending_unreserved -= 1;
            } else if self.aflags.xchg == Some(reg) {
                // Bail on keeping the flags in the register.
                move_aflags_from_reg(self, cx, ix, true);
            } else {
                // The tool's value needs to ride somewhere else across the
                // instruction; a fresh slot is the somewhere.  Clients are
                // told to budget an extra slot per cross-instruction
                // register for exactly this.
                let slot = match self.gpr_state(reg).slot {
                    Some(s) => s,
                    None => continue,
                };
                let tmp = match self.slots.find_free_slot() {
                    Some(t) => t,
                    None => {
                        report_error(
                            cb,
                            RegMedError::OutOfSlots,
                            "failed to preserve tool value around app read",
                        );
                        continue;
                    }
                };
                debug!("late @{}: restoring {:?} for app read", self.live_idx, reg);
                emit::spill_gpr_directly(self, cx.sink, ix, reg, tmp);
                emit::restore_gpr_directly(self, cx.sink, ix, reg, slot, false);
                // Tool reload emitted after the instruction; shared with the
                // app re-spill if it writes too.  native stays false.
                restored_for_read[r] = Some(tmp);
            }
        }

        // --- After the instruction: keep the spilled app flags current.
        if !cx.insns[i].flags_written().is_empty()
            // Skip when everything is rewritten later anyway.
            && (self.live_idx == 0 || !self.aflags_live_at(self.live_idx - 1).is_empty())
        {
            if self.aflags.in_use {
                debug!("late @{}: re-spilling aflags after app write", self.live_idx);
                if let Err(e) = spill_aflags(self, cx, next) {
                    report_error(cb, e, "failed to spill aflags after app write");
                }
                self.aflags.native = false;
            } else if !self.aflags.native
                || self.slots.owner(AFLAGS_SLOT).is_some()
                || (self.gpr_state(accum).in_use && self.aflags.xchg == Some(accum))
            {
                // The saved copy is stale; give up the slot.
                debug!("late @{}: giving up aflags slot after app write", self.live_idx);
                if self.gpr_state(accum).in_use && self.aflags.xchg == Some(accum) {
                    move_aflags_from_reg(self, cx, ix, true);
                }
                self.slots.set_owner(AFLAGS_SLOT, None);
                self.aflags.native = true;
            }
        }

        // --- After the instruction: keep spilled app register values current.
        for r in 0..num_simds {
            let reg = Reg::new(RegClass::SimdZmm, r as u8);
            if self.simd_state(reg).in_use {
                let slot = match self.simd_state(reg).slot {
                    Some(s) => s,
                    None => continue,
                };
                let spilled_reg = match self.slots.simd_owner(slot) {
                    Some(s) => s,
                    None => continue,
                };
                if !cx.insns[i].writes_reg(reg) {
                    continue;
                }
                // Skip when the value is dead beyond this write at the
                // width that was spilled.
                let dead_beyond = self.live_idx > 0
                    && self
                        .simd_live_at(reg, self.live_idx - 1)
                        .is_dead_for(spilled_reg.class());
                if !self.config.conservative && dead_beyond {
                    continue;
                }
                debug_assert!(self.config.num_simd_slots > 0, "vector spilled without slots");
                if let Some(tmp) = restored_for_simd_read[r].take() {
                    emit::spill_simd_indirectly(self, cx, next, spilled_reg, slot);
                    self.simd_state_mut(reg).ever_spilled = true;
                    emit::restore_simd_indirectly(self, cx, next, spilled_reg, tmp, true);
                } else {
                    let tmp = match self.slots.find_free_simd_slot() {
                        Some(t) => t,
                        None => {
                            report_error(
                                cb,
                                RegMedError::OutOfSlots,
                                "failed to preserve tool value wrt app write",
                            );
                            continue;
                        }
                    };
                    emit::spill_simd_indirectly(self, cx, ix, spilled_reg, tmp);
                    emit::spill_simd_indirectly(self, cx, next, spilled_reg, slot);
                    self.simd_state_mut(reg).ever_spilled = true;
                    emit::restore_simd_indirectly(self, cx, next, spilled_reg, tmp, true);
                }
            } else if !self.simd_state(reg).native && cx.insns[i].writes_reg(reg) {
                // An unreserved register that gets written just drops its
                // slot; the saved value is stale and the register is dead.
                if self.simd_state(reg).ever_spilled {
                    self.simd_state_mut(reg).ever_spilled = false;
                }
                if let Err(e) = restore_reg_now(self, cx, ix, reg) {
                    report_error(cb, e, "slot release on app write failed");
                }
                debug_assert!(self.simd_pending_unreserved > 0, "should not go negative");
                self.simd_pending_unreserved -= 1;
            }
        }

        for r in 0..num_gprs {
            let reg = Reg::gpr(r as u8);
            if self.gpr_state(reg).in_use {
                if !cx.insns[i].writes_reg(reg) {
                    continue;
                }
                // Skip when the value is dead beyond this write.
                let live_beyond = self.live_idx == 0
                    || self.gpr_live_at(reg, self.live_idx - 1) == GprLive::Live
                    || self.aflags.xchg == Some(reg);
                if !self.config.conservative && !live_beyond {
                    continue;
                }
                if self.aflags.xchg == Some(reg) {
                    // Bail on keeping the flags in the register.
                    move_aflags_from_reg(self, cx, ix, true);
                    continue;
                }
                if self.gpr_state(reg).xchg.is_some() {
                    report_error(
                        cb,
                        RegMedError::FeatureNotAvailable,
                        "exchange-parked values cannot cross an app write",
                    );
                    continue;
                }
                let slot = match self.gpr_state(reg).slot {
                    Some(s) => s,
                    None => continue,
                };
                debug!("late @{}: re-spilling {:?} after app write", self.live_idx, reg);
                if let Some(tmp) = restored_for_read[r].take() {
                    emit::spill_gpr_directly(self, cx.sink, next, reg, slot);
                    self.gpr_state_mut(reg).ever_spilled = true;
                    emit::restore_gpr_directly(self, cx.sink, next, reg, tmp, true);
                } else {
                    let tmp = match self.slots.find_free_slot() {
                        Some(t) => t,
                        None => {
                            report_error(
                                cb,
                                RegMedError::OutOfSlots,
                                "failed to preserve tool value wrt app write",
                            );
                            continue;
                        }
                    };
                    emit::spill_gpr_directly(self, cx.sink, ix, reg, tmp);
                    emit::spill_gpr_directly(self, cx.sink, next, reg, slot);
                    self.gpr_state_mut(reg).ever_spilled = true;
                    emit::restore_gpr_directly(self, cx.sink, next, reg, tmp, true);
                }
            } else if !self.gpr_state(reg).native && cx.insns[i].writes_reg(reg) {
                debug!(
                    "late @{}: dropping slot for unreserved {:?} after app write",
                    self.live_idx, reg
                );
                if self.gpr_state(reg).ever_spilled {
                    self.gpr_state_mut(reg).ever_spilled = false;
                }
                if let Err(e) = restore_reg_now(self, cx, ix, reg) {
                    report_error(cb, e, "slot release on app write failed");
                }
                debug_assert!(self.pending_unreserved > 0, "should not go negative");
                self.pending_unreserved -= 1;
            }
        }

        // --- Reload tool values for sandwiched registers the instruction
        // only read.
        for r in 0..num_simds {
            if let Some(tmp) = restored_for_simd_read[r].take() {
                if let Some(spilled_reg) = self.slots.simd_owner(tmp) {
                    emit::restore_simd_indirectly(self, cx, next, spilled_reg, tmp, true);
                }
            }
        }
        for r in 0..num_gprs {
            let reg = Reg::gpr(r as u8);
            if let Some(tmp) = restored_for_read[r].take() {
                emit::restore_gpr_directly(self, cx.sink, next, reg, tmp, true);
            }
        }

        if is_last {
            self.bb_props = BbProperties::empty();
            self.assert_all_native();
            self.in_insertion = false;
        }
        Ok(())
    }
}
