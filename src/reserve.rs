//! The reservation algorithm: picking a scratch register under constraints,
//! handing it out, and putting application values back.
//!
//! Selection order for a reservation:
//!   1. a register unreserved earlier but not yet lazily restored (its slot
//!      is inherited, no spill emitted);
//!   2. a register that is dead at this point (skipping the stack pointer,
//!      the stolen register, and the program counter where it is a GPR);
//!   3. the live register with the fewest application uses in the block;
//!   4. on the GPR side only: if the flags engine is parked in the
//!      accumulator and the accumulator is allowed, evict the flags and
//!      hand the accumulator out.

use log::debug;
use smallvec::SmallVec;

use crate::aflags::move_aflags_from_reg;
use crate::data_structures::{
    AllowedSet, GprLive, InstIx, PerThread, Reg, RegClass, SpillSlot, Writable, AFLAGS_SLOT,
};
use crate::emit::{self, unpredicated, CodeInst};
use crate::interface::{AppInstr, AppOperand, BlockCtx, CodeSink, RegMedError};
use crate::liveness;

//=============================================================================
// Internal reservation

/// Reserve a GPR.  Assumes liveness is already valid (computed by the block
/// scan inside the insertion pass, or by a forward scan otherwise).
pub(crate) fn reserve_gpr_internal<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
    allowed: Option<&AllowedSet>,
    only_if_no_spill: bool,
) -> Result<Reg, RegMedError> {
    let mut inherited_slot: Option<SpillSlot> = None;
    let mut chosen: Option<Reg> = None;
    let mut already_spilled = false;

    // First try a previously unreserved but not yet lazily restored
    // register.  This must come first to avoid accumulating slots beyond
    // the requested maximum.  Because an unreserved register's slot is
    // dropped when the app writes it, an unreserved-and-unspilled register
    // can never shadow a dead one here.
    if pt.pending_unreserved > 0 {
        for reg in pt.all_gprs() {
            let st = pt.gpr_state(reg);
            let usable = !st.native
                && !st.in_use
                && allowed.map_or(true, |a| a.contains(reg))
                && (!only_if_no_spill
                    || st.ever_spilled
                    || pt.gpr_live_at(reg, pt.live_idx) == GprLive::Dead);
            if usable {
                inherited_slot = st.slot;
                already_spilled = st.ever_spilled;
                chosen = Some(reg);
                pt.pending_unreserved -= 1;
                debug!(
                    "reserve @{}: using un-restored {:?} slot {:?}",
                    pt.live_idx, reg, inherited_slot
                );
                break;
            }
        }
    }

    if chosen.is_none() {
        // Look for a dead register, or failing that the least-used one.
        let mut best: Option<Reg> = None;
        let mut min_uses = u32::MAX;
        for reg in pt.all_gprs() {
            if pt.gpr_state(reg).in_use {
                continue;
            }
            // Avoid the stack pointer even when it looks dead, the host's
            // stolen register, and the program counter where it is a GPR.
            if reg == pt.univ.stack_pointer
                || Some(reg) == pt.univ.stolen
                || Some(reg) == pt.univ.program_counter
            {
                continue;
            }
            if let Some(a) = allowed {
                if !a.contains(reg) {
                    continue;
                }
            }
            if pt.gpr_live_at(reg, pt.live_idx) == GprLive::Dead {
                chosen = Some(reg);
                break;
            }
            if only_if_no_spill {
                continue;
            }
            if pt.gpr_state(reg).app_uses < min_uses {
                best = Some(reg);
                min_uses = pt.gpr_state(reg).app_uses;
            }
        }
        if chosen.is_none() {
            if let Some(b) = best {
                chosen = Some(b);
            } else {
                // If the flags still ride in the accumulator, evict them
                // (to slot 0 when reserved, or by restoring when the
                // reservation already lapsed) rather than fail.
                let accum = pt.univ.accumulator;
                if pt.gpr_state(accum).in_use
                    && pt.aflags.xchg == Some(accum)
                    && allowed.map_or(true, |a| a.contains(accum))
                {
                    debug!(
                        "reserve @{}: taking accumulator from unreserved aflags",
                        pt.live_idx
                    );
                    move_aflags_from_reg(pt, cx, at, true);
                    chosen = Some(accum);
                } else {
                    return Err(RegMedError::RegConflict);
                }
            }
        }
    }

    let reg = match chosen {
        Some(r) => r,
        None => return Err(RegMedError::RegConflict),
    };
    let slot = match inherited_slot {
        Some(s) => s,
        None => pt.slots.find_free_slot().ok_or(RegMedError::OutOfSlots)?,
    };

    debug_assert!(!pt.gpr_state(reg).in_use, "overlapping uses");
    pt.gpr_state_mut(reg).in_use = true;
    if !already_spilled {
        // Even if dead now, the register owns a slot in case the
        // reservation outlives the dead range.
        if pt.config.conservative || pt.gpr_live_at(reg, pt.live_idx) == GprLive::Live {
            debug!("reserve @{}: spilling {:?} to {:?}", pt.live_idx, reg, slot);
            emit::spill_gpr_directly(pt, cx.sink, at, reg, slot);
            pt.gpr_state_mut(reg).ever_spilled = true;
        } else {
            debug!("reserve @{}: no need to spill {:?} to {:?}", pt.live_idx, reg, slot);
            pt.slots.set_owner(slot, Some(reg));
            pt.gpr_state_mut(reg).ever_spilled = false;
        }
    } else {
        debug!("reserve @{}: {:?} already spilled to {:?}", pt.live_idx, reg, slot);
    }
    let st = pt.gpr_state_mut(reg);
    st.native = false;
    st.xchg = None;
    st.slot = Some(slot);
    Ok(reg)
}

/// Pick a vector register and slot for a reservation of `spill_class`.
/// Returns the register resized to the class width.
fn find_for_simd_reservation(
    pt: &mut PerThread,
    spill_class: RegClass,
    allowed: Option<&AllowedSet>,
    only_if_no_spill: bool,
) -> Result<(SpillSlot, Reg, bool), RegMedError> {
    if pt.config.num_simd_slots == 0 {
        return Err(RegMedError::Internal);
    }
    let mut inherited_slot: Option<SpillSlot> = None;
    let mut chosen: Option<Reg> = None;
    let mut already_spilled = false;

    if pt.simd_pending_unreserved > 0 {
        for reg in pt.all_simds() {
            let st = pt.simd_state(reg);
            let usable = !st.native
                && !st.in_use
                && allowed.map_or(true, |a| a.contains(reg))
                && (!only_if_no_spill
                    || st.ever_spilled
                    || pt.simd_live_at(reg, pt.live_idx).is_dead_for(spill_class));
            if usable {
                let slot = st.slot.ok_or(RegMedError::Internal)?;
                inherited_slot = Some(slot);
                // A resumable spill must have been made at this same width;
                // a narrower one does not cover the new reservation.
                let spilled_reg = pt.slots.simd_owner(slot);
                already_spilled =
                    st.ever_spilled && spilled_reg.map(Reg::class) == Some(spill_class);
                chosen = Some(reg);
                pt.simd_pending_unreserved -= 1;
                break;
            }
        }
    }

    if chosen.is_none() {
        let mut best: Option<Reg> = None;
        let mut min_uses = u32::MAX;
        for reg in pt.all_simds() {
            if pt.simd_state(reg).in_use {
                continue;
            }
            if let Some(a) = allowed {
                if !a.contains(reg) {
                    continue;
                }
            }
            if pt.simd_live_at(reg, pt.live_idx).is_dead_for(spill_class) {
                chosen = Some(reg);
                break;
            }
            if only_if_no_spill {
                continue;
            }
            if pt.simd_state(reg).app_uses < min_uses {
                best = Some(reg);
                min_uses = pt.simd_state(reg).app_uses;
            }
        }
        if chosen.is_none() {
            match best {
                Some(b) => chosen = Some(b),
                None => return Err(RegMedError::RegConflict),
            }
        }
    }

    let reg = match chosen {
        Some(r) => r,
        None => return Err(RegMedError::RegConflict),
    };
    let slot = match inherited_slot {
        Some(s) => s,
        None => pt
            .slots
            .find_free_simd_slot()
            .ok_or(RegMedError::OutOfSlots)?,
    };
    Ok((slot, reg.with_class(spill_class), already_spilled))
}

/// Reserve a vector register of `spill_class`.  Same liveness assumptions
/// as [`reserve_gpr_internal`].
pub(crate) fn reserve_simd_internal<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
    spill_class: RegClass,
    allowed: Option<&AllowedSet>,
    only_if_no_spill: bool,
) -> Result<Reg, RegMedError> {
    let (slot, reg, already_spilled) =
        find_for_simd_reservation(pt, spill_class, allowed, only_if_no_spill)?;

    debug_assert!(!pt.simd_state(reg).in_use, "overlapping uses");
    pt.simd_state_mut(reg).in_use = true;
    if !already_spilled {
        // Even if dead now, the reservation owns a slot in case it outlives
        // the dead range.
        if pt.config.conservative || pt.simd_live_at(reg, pt.live_idx).is_live() {
            debug!("reserve @{}: spilling {:?} to {:?}", pt.live_idx, reg, slot);
            emit::spill_simd_indirectly(pt, cx, at, reg, slot);
            pt.simd_state_mut(reg).ever_spilled = true;
        } else {
            debug!("reserve @{}: no need to spill {:?} to {:?}", pt.live_idx, reg, slot);
            pt.slots.set_simd_owner(slot, Some(reg));
            pt.simd_state_mut(reg).ever_spilled = false;
        }
    } else {
        debug!("reserve @{}: {:?} already spilled to {:?}", pt.live_idx, reg, slot);
    }
    let st = pt.simd_state_mut(reg);
    st.native = false;
    st.xchg = None;
    st.slot = Some(slot);
    Ok(reg)
}

pub(crate) fn reserve_internal<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
    spill_class: RegClass,
    allowed: Option<&AllowedSet>,
    only_if_no_spill: bool,
) -> Result<Reg, RegMedError> {
    match spill_class {
        RegClass::Gpr => reserve_gpr_internal(pt, cx, at, allowed, only_if_no_spill),
        RegClass::SimdXmm | RegClass::SimdYmm | RegClass::SimdZmm => {
            reserve_simd_internal(pt, cx, at, spill_class, allowed, only_if_no_spill)
        }
    }
}

/// Emit (or skip, if never spilled) the restore of one register right now,
/// releasing its slot.  Used for immediate unreserves and lazy restores.
pub(crate) fn restore_reg_now<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
    reg: Reg,
) -> Result<(), RegMedError> {
    if reg.is_gpr() {
        if pt.gpr_state(reg).ever_spilled {
            if pt.gpr_state(reg).xchg.is_some() {
                return Err(RegMedError::FeatureNotAvailable);
            }
            debug!("restore_now @{}: restoring {:?}", pt.live_idx, reg);
            let slot = pt.gpr_state(reg).slot.ok_or(RegMedError::Internal)?;
            emit::restore_gpr_directly(pt, cx.sink, at, reg, slot, true);
        } else {
            // Never written; just release the slot.
            debug!("restore_now @{}: {:?} never spilled", pt.live_idx, reg);
            if let Some(slot) = pt.gpr_state(reg).slot {
                pt.slots.set_owner(slot, None);
            }
        }
        pt.gpr_state_mut(reg).native = true;
    } else {
        let slot = pt.simd_state(reg).slot.ok_or(RegMedError::Internal)?;
        if pt.simd_state(reg).ever_spilled {
            let spilled_reg = pt.slots.simd_owner(slot).ok_or(RegMedError::Internal)?;
            emit::restore_simd_indirectly(pt, cx, at, spilled_reg, slot, true);
        } else {
            pt.slots.set_simd_owner(slot, None);
        }
        pt.simd_state_mut(reg).native = true;
    }
    Ok(())
}

/// Release a reservation.  Inside the insertion pass the restore is lazy;
/// outside it the app value comes back immediately.
pub(crate) fn unreserve_register_internal<I: AppInstr, S: CodeSink>(
    pt: &mut PerThread,
    cx: &mut BlockCtx<I, S>,
    at: InstIx,
    reg: Reg,
) -> Result<(), RegMedError> {
    if reg.is_gpr() {
        if !pt.gpr_state(reg).in_use {
            return Err(RegMedError::InvalidParameter);
        }
        debug!("unreserve @{}: {:?}", pt.live_idx, reg);
        if !pt.in_insertion {
            // No way to restore lazily out here; no attempt is made to
            // eliminate back-to-back spill/restore pairs either.
            restore_reg_now(pt, cx, at, reg)?;
        } else {
            // Restored lazily by the insertion driver, in case someone else
            // wants a local scratch meanwhile.
            pt.pending_unreserved += 1;
        }
        pt.gpr_state_mut(reg).in_use = false;
    } else {
        if !pt.simd_state(reg).in_use {
            return Err(RegMedError::InvalidParameter);
        }
        debug!("unreserve @{}: {:?}", pt.live_idx, reg);
        if !pt.in_insertion {
            restore_reg_now(pt, cx, at, reg)?;
        } else {
            pt.simd_pending_unreserved += 1;
        }
        pt.simd_state_mut(reg).in_use = false;
    }
    Ok(())
}

//=============================================================================
// Reservation info

/// Where a register's application value currently lives, as reported by
/// [`PerThread::reservation_info_ex`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueLocation {
    /// Nowhere recoverable (native, or never spilled).
    None,
    /// Parked in another register.
    InReg(Reg),
    /// A direct TLS word at this byte offset.
    TlsSlot { offs: u32 },
    /// A host-framework spill slot.
    HostSlot { slot: u32 },
}

/// Everything a client can learn about one register's reservation.
#[derive(Copy, Clone, Debug)]
pub struct ReservationInfo {
    /// Reserved by some client right now.
    pub reserved: bool,
    /// The architectural register still holds the application value.
    pub holds_app_value: bool,
    /// A recoverable copy of the application value exists somewhere.
    pub app_value_retained: bool,
    /// Where that copy lives.
    pub location: ValueLocation,
    /// The location is a host-framework slot, which is not preserved across
    /// application instructions.
    pub is_host_slot: bool,
    /// Raw slot offset: TLS byte offset for direct slots, host slot index
    /// for host slots.
    pub slot_offset: Option<u32>,
}

//=============================================================================
// Client-facing operations

impl PerThread {
    /// Reserve a scratch register of `spill_class`, constrained to
    /// `allowed` when given.  Returns the register; the client must
    /// unreserve it before the end of the block.
    pub fn reserve_register_ex<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
        spill_class: RegClass,
        allowed: Option<&AllowedSet>,
    ) -> Result<Reg, RegMedError> {
        self.check_spill_class(spill_class)?;
        liveness::ensure_liveness_at(self, cx.insns, at);
        let res = unpredicated(cx, |cx| {
            reserve_internal(self, cx, at, spill_class, allowed, false)
        });
        self.debug_check_pending();
        res
    }

    /// Reserve a GPR scratch register.
    pub fn reserve_register<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
        allowed: Option<&AllowedSet>,
    ) -> Result<Reg, RegMedError> {
        self.reserve_register_ex(cx, at, RegClass::Gpr, allowed)
    }

    /// Reserve a register only if one is available without a spill.
    pub fn reserve_dead_register_ex<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
        spill_class: RegClass,
        allowed: Option<&AllowedSet>,
    ) -> Result<Reg, RegMedError> {
        self.check_spill_class(spill_class)?;
        liveness::ensure_liveness_at(self, cx.insns, at);
        let res = unpredicated(cx, |cx| {
            reserve_internal(self, cx, at, spill_class, allowed, true)
        });
        self.debug_check_pending();
        res
    }

    /// Reserve a dead GPR.
    pub fn reserve_dead_register<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
        allowed: Option<&AllowedSet>,
    ) -> Result<Reg, RegMedError> {
        self.reserve_dead_register_ex(cx, at, RegClass::Gpr, allowed)
    }

    fn check_spill_class(&self, spill_class: RegClass) -> Result<(), RegMedError> {
        match spill_class {
            RegClass::Gpr => Ok(()),
            RegClass::SimdXmm => {
                if self.univ.num_simds == 0 {
                    Err(RegMedError::FeatureNotAvailable)
                } else {
                    Ok(())
                }
            }
            RegClass::SimdYmm | RegClass::SimdZmm => {
                // Full-width vector preservation is not wired up yet.
                if self.univ.num_simds == 0 {
                    Err(RegMedError::InvalidParameter)
                } else {
                    Err(RegMedError::FeatureNotAvailable)
                }
            }
        }
    }

    /// Release a reservation made by one of the reserve operations.
    pub fn unreserve_register<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
        reg: Reg,
    ) -> Result<(), RegMedError> {
        let res = unpredicated(cx, |cx| unreserve_register_internal(self, cx, at, reg));
        self.debug_check_pending();
        res
    }

    /// Emit code to materialise `app_reg`'s application value.  `stateful`
    /// lets the bookkeeping note a completed restore (the normal case);
    /// stateless callers leave the books untouched.
    pub fn restore_app_value<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
        app_reg: Reg,
        dst_reg: Reg,
        stateful: bool,
    ) -> Result<(), RegMedError> {
        let res = unpredicated(cx, |cx| {
            self.restore_app_value_inner(cx, at, app_reg, dst_reg, stateful)
        });
        self.debug_check_pending();
        res
    }

    fn restore_app_value_inner<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
        app_reg: Reg,
        dst_reg: Reg,
        stateful: bool,
    ) -> Result<(), RegMedError> {
        // The stolen register's value lives wherever the host keeps it; the
        // host refuses to load it onto itself.
        if Some(app_reg) == self.univ.stolen {
            if dst_reg == app_reg {
                return Err(RegMedError::InvalidParameter);
            }
            cx.sink.insert(
                at,
                CodeInst::LoadStolenValue {
                    dst: Writable::from_reg(dst_reg),
                },
            );
            return Ok(());
        }
        if app_reg.is_gpr() {
            if self.gpr_state(app_reg).native {
                debug!("app value @{}: {:?} already native", self.live_idx, app_reg);
                if dst_reg != app_reg {
                    cx.sink.insert(
                        at,
                        CodeInst::Move {
                            dst: Writable::from_reg(dst_reg),
                            src: app_reg,
                        },
                    );
                }
                return Ok(());
            }
            // The app value of a dead register may simply be gone.
            if !self.gpr_state(app_reg).ever_spilled {
                debug!("app value @{}: {:?} never spilled", self.live_idx, app_reg);
                return Err(RegMedError::NoAppValue);
            }
            if self.gpr_state(app_reg).xchg.is_some() {
                return Err(RegMedError::FeatureNotAvailable);
            }
            debug!("app value @{}: getting app value for {:?}", self.live_idx, app_reg);
            if self.aflags.xchg == Some(app_reg) {
                // Bail on keeping the flags in the register.
                move_aflags_from_reg(self, cx, at, stateful);
            } else {
                let release = stateful && !self.gpr_state(app_reg).in_use;
                let slot = self.gpr_state(app_reg).slot.ok_or(RegMedError::Internal)?;
                emit::restore_gpr_directly(self, cx.sink, at, app_reg, slot, release);
                if release {
                    self.gpr_state_mut(app_reg).native = true;
                    self.pending_unreserved -= 1;
                }
            }
        } else {
            if !dst_reg.is_simd() {
                return Err(RegMedError::InvalidParameter);
            }
            if self.simd_state(app_reg).native {
                if dst_reg != app_reg {
                    cx.sink.insert(
                        at,
                        CodeInst::Move {
                            dst: Writable::from_reg(dst_reg),
                            src: app_reg,
                        },
                    );
                }
                return Ok(());
            }
            if !self.simd_state(app_reg).ever_spilled {
                return Err(RegMedError::NoAppValue);
            }
            if self.simd_state(app_reg).xchg.is_some() {
                return Err(RegMedError::FeatureNotAvailable);
            }
            let release = stateful && !self.simd_state(app_reg).in_use;
            let slot = self.simd_state(app_reg).slot.ok_or(RegMedError::Internal)?;
            emit::restore_simd_indirectly(self, cx, at, app_reg, slot, release);
            if release {
                self.simd_state_mut(app_reg).native = true;
                self.simd_pending_unreserved -= 1;
            }
        }
        Ok(())
    }

    /// Materialise `app_reg`'s application value into `dst_reg`, updating
    /// the bookkeeping.
    pub fn get_app_value<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
        app_reg: Reg,
        dst_reg: Reg,
    ) -> Result<(), RegMedError> {
        self.restore_app_value(cx, at, app_reg, dst_reg, true)
    }

    /// Restore the application values of every register an operand uses,
    /// rewriting references to the stolen register through a swap register
    /// (allocated here if `swap` is empty, and reported back so the caller
    /// can unreserve it).
    pub fn restore_app_values<I: AppInstr, S: CodeSink, O: AppOperand>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        at: InstIx,
        opnd: &mut O,
        swap: &mut Option<Reg>,
    ) -> Result<(), RegMedError> {
        let mut no_app_value = false;

        // Vector registers first; their restores burn a scratch GPR, which
        // is easier to find before any GPR rewriting below.
        let regs: SmallVec<[Reg; 4]> = opnd.regs_used();
        for reg in regs.iter().copied().filter(|r| r.is_simd()) {
            match self.restore_app_value(cx, at, reg, reg, true) {
                Err(RegMedError::NoAppValue) => no_app_value = true,
                Err(e) => return Err(e),
                Ok(()) => {}
            }
        }
        for reg in regs.iter().copied().filter(|r| r.is_gpr()) {
            let mut dst = reg;
            if Some(reg) == self.univ.stolen {
                match *swap {
                    None => dst = self.reserve_register(cx, at, None)?,
                    Some(s) => dst = s,
                }
                if !opnd.replace_reg(reg, dst) {
                    return Err(RegMedError::Internal);
                }
                *swap = Some(dst);
            }
            match self.restore_app_value(cx, at, reg, dst, true) {
                Err(RegMedError::NoAppValue) => no_app_value = true,
                Err(e) => return Err(e),
                Ok(()) => {}
            }
        }
        if no_app_value {
            Err(RegMedError::NoAppValue)
        } else {
            Ok(())
        }
    }

    /// Restore an application value (or the flags, with `reg == None`)
    /// without releasing any reservation state, for code the client emits
    /// itself between `where_restore` and `where_respill` (clean calls).
    ///
    /// Returns `(restored, respilled)`: whether a restore was actually
    /// needed, and whether a compensating respill was emitted at
    /// `where_respill`.  A register whose app value was never retained
    /// reports `restored == false`.
    pub fn statelessly_restore_app_value<I: AppInstr, S: CodeSink>(
        &mut self,
        cx: &mut BlockCtx<I, S>,
        reg: Option<Reg>,
        where_restore: InstIx,
        where_respill: InstIx,
    ) -> Result<(bool, bool), RegMedError> {
        debug!("stateless restore @{}: {:?}", self.live_idx, reg);
        let res = match reg {
            None => unpredicated(cx, |cx| {
                crate::aflags::restore_aflags(self, cx, where_restore, false)
            }),
            Some(r) => {
                if r.is_gpr() && Some(r) == self.univ.stolen {
                    return Err(RegMedError::InvalidParameter);
                }
                self.restore_app_value(cx, where_restore, r, r, false)
            }
        };
        let restored = match res {
            Ok(()) => true,
            Err(RegMedError::NoAppValue) => false,
            Err(e) => return Err(e),
        };
        let mut respilled = false;
        if let Some(r) = reg {
            if self.aflags.xchg == Some(r) {
                // The restore above parked the flags word in slot 0; the
                // client's code runs, then the accumulator must carry the
                // flags again.
                let accum = self.univ.accumulator;
                unpredicated(cx, |cx| {
                    self.respill_parked_flags(cx.sink, where_respill, accum)
                });
                respilled = true;
            }
        }
        Ok((restored, respilled))
    }

    /// Reload the parked flags word from slot 0 into the accumulator
    /// without any state change.  Slot 0 has no owner on this path (the
    /// flags officially live in the accumulator), and the restore helper
    /// insists on ownership, so the owner is set just for the emitted load.
    fn respill_parked_flags<S: CodeSink>(&mut self, sink: &mut S, at: InstIx, accum: Reg) {
        self.slots.set_owner(AFLAGS_SLOT, Some(accum));
        emit::restore_gpr_directly(self, sink, at, accum, AFLAGS_SLOT, false);
        self.slots.set_owner(AFLAGS_SLOT, None);
    }

    /// Is `reg` dead at `at`?
    pub fn is_register_dead<I: AppInstr, S>(
        &mut self,
        cx: &BlockCtx<I, S>,
        at: InstIx,
        reg: Reg,
    ) -> Result<bool, RegMedError> {
        liveness::ensure_liveness_at(self, cx.insns, at);
        if reg.is_gpr() {
            if reg.index() >= self.gprs.len() {
                return Err(RegMedError::InvalidParameter);
            }
            Ok(self.gpr_live_at(reg, self.live_idx) == GprLive::Dead)
        } else {
            if reg.index() >= self.simds.len() {
                return Err(RegMedError::InvalidParameter);
            }
            Ok(self.simd_live_at(reg.widest(), self.live_idx) == crate::data_structures::SimdLive::ZmmDead)
        }
    }

    /// Report everything about one register's reservation (or the flags',
    /// with `reg == None`).
    pub fn reservation_info_ex(&self, reg: Option<Reg>) -> Result<ReservationInfo, RegMedError> {
        let st = match reg {
            None => &self.aflags,
            Some(r) if r.is_gpr() => {
                if r.index() >= self.gprs.len() {
                    return Err(RegMedError::InvalidParameter);
                }
                self.gpr_state(r)
            }
            Some(r) => {
                if r.index() >= self.simds.len() {
                    return Err(RegMedError::InvalidParameter);
                }
                self.simd_state(r)
            }
        };

        let mut info = ReservationInfo {
            reserved: st.in_use,
            holds_app_value: st.native,
            app_value_retained: false,
            location: ValueLocation::None,
            is_host_slot: false,
            slot_offset: None,
        };
        if st.native {
            return Ok(info);
        }
        if let Some(x) = st.xchg {
            info.app_value_retained = true;
            info.location = ValueLocation::InReg(x);
            return Ok(info);
        }
        info.app_value_retained = st.ever_spilled;
        let slot = match st.slot {
            Some(s) => s,
            None => return Ok(info),
        };
        match reg {
            // The flags slot may be owned by whichever carrier spilled it.
            None => {
                if self.slots.owner(slot).is_some() {
                    self.fill_slot_location(slot, &mut info);
                }
            }
            Some(r) if r.is_gpr() => {
                if self.slots.owner(slot) == Some(r) {
                    self.fill_slot_location(slot, &mut info);
                }
            }
            // An indirect SIMD slot is not addressable as a single operand;
            // only the retention bit is reported.
            Some(_) => {}
        }
        Ok(info)
    }

    fn fill_slot_location(&self, slot: SpillSlot, info: &mut ReservationInfo) {
        if slot.get() < self.config.num_gpr_slots {
            let offs = self.config.direct_slot_offs(slot);
            info.location = ValueLocation::TlsSlot { offs };
            info.is_host_slot = false;
            info.slot_offset = Some(offs);
        } else {
            let host_slot = slot.get() - self.config.num_gpr_slots;
            info.location = ValueLocation::HostSlot { slot: host_slot };
            info.is_host_slot = true;
            info.slot_offset = Some(host_slot);
        }
    }

    /// Highest spill slot ever used, for sizing slot requests.  Only
    /// tracked in debug builds.
    pub fn max_slots_used(&self) -> Result<u32, RegMedError> {
        #[cfg(debug_assertions)]
        {
            Ok(self.slots.max_slot_used())
        }
        #[cfg(not(debug_assertions))]
        {
            Err(RegMedError::FeatureNotAvailable)
        }
    }

    /// Accumulate client hints about the current block.  Interactions
    /// between multiple callers get messy, so the hints are simply OR'd.
    pub fn set_bb_properties(
        &mut self,
        props: crate::data_structures::BbProperties,
    ) -> Result<(), RegMedError> {
        self.bb_props |= props;
        debug!("bb properties are now {:?}", self.bb_props);
        Ok(())
    }

    /// Recompute the pending-unreserved counters from first principles in
    /// debug builds; they must match at every observation point.
    pub(crate) fn debug_check_pending(&self) {
        if cfg!(debug_assertions) {
            let n = self.gprs.iter().filter(|s| !s.native && !s.in_use).count() as u32;
            debug_assert_eq!(self.pending_unreserved, n, "pending accounting broken");
            let n = self.simds.iter().filter(|s| !s.native && !s.in_use).count() as u32;
            debug_assert_eq!(self.simd_pending_unreserved, n, "pending accounting broken");
        }
    }
}
