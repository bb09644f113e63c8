//! The top-level interface of the mediator: status codes, options, the
//! traits the host framework implements, and process-wide initialisation.

use log::info;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;

pub use crate::data_structures::{
    AFlags, AllowedSet, BbProperties, GprLive, InstIx, Map, PerThread, Reg, RegClass, RegState,
    RegUniverse, Set, SimdLive, SpillSlot, Writable, AFLAGS_SLOT,
};
pub use crate::emit::CodeInst;
pub use crate::reserve::{ReservationInfo, ValueLocation};
pub use crate::restore::{restore_state, SpillRestoreInfo};

/// Size in bytes of one direct (word) spill slot.
pub const WORD_SIZE: u32 = 8;

//=============================================================================
// Status codes

/// Failure codes returned by every fallible operation.  Out-parameters of
/// the original C interface became `Ok` payloads; everything else is one of
/// these.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RegMedError {
    /// Internal failure that fits no other category.
    Internal,
    /// A caller-supplied argument made no sense.
    InvalidParameter,
    /// Every candidate register is reserved or disallowed.
    RegConflict,
    /// No spill slot is free.
    OutOfSlots,
    /// The register was never spilled since the block started, so no
    /// application value is recoverable.
    NoAppValue,
    /// The resource is exclusively held already.
    InUse,
    /// The request names a capability this build or architecture lacks
    /// (256/512-bit SIMD preservation, exchange-based GPR parking).
    FeatureNotAvailable,
    /// The spill class is not a recognised class.
    InvalidSpillClass,
}

impl fmt::Display for RegMedError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RegMedError::Internal => "internal error",
            RegMedError::InvalidParameter => "invalid parameter",
            RegMedError::RegConflict => "no register satisfies the constraints",
            RegMedError::OutOfSlots => "out of spill slots",
            RegMedError::NoAppValue => "application value not retained",
            RegMedError::InUse => "resource already reserved",
            RegMedError::FeatureNotAvailable => "feature not available",
            RegMedError::InvalidSpillClass => "invalid spill class",
        };
        write!(fmt, "{}", s)
    }
}

impl std::error::Error for RegMedError {}

/// Called on internal inconsistencies (a client forgetting to unreserve at
/// block end, slot exhaustion in a mandatory path, and the like).  Return
/// true to let the mediator continue; false to abort.
pub type ErrorCallback = fn(RegMedError) -> bool;

//=============================================================================
// Options and process-wide state

/// Options passed to [`init`].  Multiple components may each call `init`;
/// their options are merged rather than replaced.
#[derive(Clone, Default)]
pub struct Options {
    /// How many direct TLS slots to dedicate to GPR spills for this caller.
    pub num_gpr_slots: u32,
    /// How many 64-byte SIMD slots to dedicate for this caller.
    pub num_simd_slots: u32,
    /// Spill a register on reservation even when liveness proves it dead.
    pub conservative: bool,
    /// Merge slot requests by maximum instead of by sum.
    pub do_not_sum_slots: bool,
    /// Receiver for internal-inconsistency reports.  First writer wins.
    pub error_callback: Option<ErrorCallback>,
}

/// Snapshot of the merged process options plus the TLS layout, captured per
/// thread at [`PerThread::new`] time.
#[derive(Clone)]
pub(crate) struct Config {
    pub num_gpr_slots: u32,
    pub num_simd_slots: u32,
    pub conservative: bool,
    pub error_callback: Option<ErrorCallback>,
    /// TLS byte offset of the hidden slot holding the pointer to the SIMD
    /// spill area.
    pub simd_ptr_offs: u32,
    /// TLS byte offset of direct slot 0; always `simd_ptr_offs + WORD_SIZE`.
    pub slot_offs: u32,
}

impl Config {
    /// TLS byte offset of a direct slot.
    pub fn direct_slot_offs(&self, slot: SpillSlot) -> u32 {
        debug_assert!(slot.get() < self.num_gpr_slots);
        self.slot_offs + slot.get() * WORD_SIZE
    }
}

struct Global {
    init_count: u32,
    num_gpr_slots: u32,
    num_simd_slots: u32,
    conservative: bool,
    do_not_sum_slots: bool,
    error_callback: Option<ErrorCallback>,
    tls_base: Option<u32>,
}

impl Global {
    const fn empty() -> Global {
        Global {
            init_count: 0,
            num_gpr_slots: 0,
            num_simd_slots: 0,
            conservative: false,
            do_not_sum_slots: false,
            error_callback: None,
            tls_base: None,
        }
    }
}

static GLOBAL: Mutex<Global> = Mutex::new(Global::empty());

fn updated_num_slots(do_not_sum: bool, cur: u32, new: u32) -> u32 {
    if do_not_sum {
        cur.max(new)
    } else {
        cur + new
    }
}

/// Process-wide initialisation.  Idempotent: each caller's options are
/// merged into the global record (slot counts sum unless `do_not_sum_slots`,
/// in which case the maximum wins; the conservative flag is OR'd; the error
/// callback is first-writer-wins).  The raw-TLS region backing the direct
/// slots is (re)allocated through `tls`, with one extra hidden slot in front
/// holding the pointer to the indirect SIMD area.
pub fn init(ops_in: &Options, tls: &mut dyn HostTls) -> Result<(), RegMedError> {
    let mut g = GLOBAL.lock();
    let prior_slots = g.num_gpr_slots;
    g.init_count += 1;
    if g.init_count == 1 {
        // One extra slot for the flags-in-accumulator sequence, rather than
        // documenting that every client must request 2 instead of 1.
        g.num_gpr_slots = 1;
    }

    g.num_gpr_slots = updated_num_slots(ops_in.do_not_sum_slots, g.num_gpr_slots, ops_in.num_gpr_slots);
    g.num_simd_slots =
        updated_num_slots(ops_in.do_not_sum_slots, g.num_simd_slots, ops_in.num_simd_slots);
    g.do_not_sum_slots = ops_in.do_not_sum_slots;

    // If anyone wants to be conservative, be conservative.
    g.conservative = g.conservative || ops_in.conservative;

    // The first callback wins.
    if g.error_callback.is_none() {
        g.error_callback = ops_in.error_callback;
    }

    if prior_slots > 0 {
        // +1 for the pointer to the indirect spill area.
        let base = g.tls_base.ok_or(RegMedError::Internal)?;
        tls.tls_free(base, prior_slots + 1)?;
    }

    // One extra leading slot for the pointer to the indirect SIMD area; the
    // direct GPR slots follow it.
    let base = tls
        .tls_alloc(g.num_gpr_slots + 1)
        .map_err(|_| RegMedError::OutOfSlots)?;
    g.tls_base = Some(base);

    info!(
        "init: count={} gpr_slots={} simd_slots={} conservative={}",
        g.init_count, g.num_gpr_slots, g.num_simd_slots, g.conservative
    );
    Ok(())
}

/// Process-wide teardown; real teardown runs on the transition to zero.  The
/// options record is reset so that a later re-initialisation starts clean.
pub fn exit(tls: &mut dyn HostTls) -> Result<(), RegMedError> {
    let mut g = GLOBAL.lock();
    if g.init_count == 0 {
        return Err(RegMedError::InvalidParameter);
    }
    g.init_count -= 1;
    if g.init_count != 0 {
        return Ok(());
    }
    if let Some(base) = g.tls_base {
        tls.tls_free(base, g.num_gpr_slots + 1)?;
    }
    // Support re-attach.
    *g = Global::empty();
    info!("exit: final teardown complete");
    Ok(())
}

pub(crate) fn current_config() -> Config {
    let g = GLOBAL.lock();
    let base = g.tls_base.unwrap_or(0);
    Config {
        num_gpr_slots: g.num_gpr_slots,
        num_simd_slots: g.num_simd_slots,
        conservative: g.conservative,
        error_callback: g.error_callback,
        simd_ptr_offs: base,
        slot_offs: base + WORD_SIZE,
    }
}

//=============================================================================
// Host-framework traits
//
// The mediator is a guest inside a larger DBI framework.  Everything it
// needs from that framework comes through these traits; everything it gives
// back is either bookkeeping state or `CodeInst` items for the host to
// lower.

/// One application instruction, as presented by the host's decoder.
///
/// Register queries must see through operand structure: `reads_reg` includes
/// addressing registers inside destination memory operands and conditionally
/// read sources.  For SIMD registers, queries must treat any alias overlap
/// as a hit (a query on the zmm name covers reads of the xmm name).
pub trait AppInstr {
    /// Does this instruction read `reg` (including addressing registers in
    /// destinations and conditional sources)?
    fn reads_reg(&self, reg: Reg) -> bool;

    /// Does this instruction read exactly `reg`, at its full width?
    fn reads_exact_reg(&self, reg: Reg) -> bool;

    /// Does some source operand read `reg` at a narrower width than the
    /// register itself?
    fn has_partial_read(&self, _reg: Reg) -> bool {
        false
    }

    /// Does this instruction write any part of `reg`?
    fn writes_reg(&self, reg: Reg) -> bool;

    /// Does this instruction write exactly `reg`, full width?  On 64-bit
    /// targets a 32-bit write that zero-extends into the full GPR counts.
    fn writes_exact_reg(&self, reg: Reg) -> bool;

    /// Does the write to `reg` happen regardless of any predicate?  The
    /// default claims all writes are unconditional.
    fn unconditionally_writes_reg(&self, reg: Reg) -> bool {
        self.writes_reg(reg)
    }

    /// Branch, call, or return.
    fn is_control_transfer(&self) -> bool;

    fn is_interrupt(&self) -> bool {
        false
    }
    fn is_syscall(&self) -> bool {
        false
    }

    /// A direct branch whose target is another instruction of this same
    /// block.
    fn targets_within_block(&self) -> bool {
        false
    }

    /// Arithmetic flags this instruction reads (including conditionally).
    fn flags_read(&self) -> AFlags;

    /// Arithmetic flags this instruction writes.
    fn flags_written(&self) -> AFlags;

    /// Every register appearing in an operand, paired with whether that
    /// operand is a memory reference.  Used for app-use counting; memory
    /// uses are deliberately double-counted, because memory-tracing tools
    /// must restore the base/index registers to compute addresses.
    fn operand_regs(&self) -> SmallVec<[(Reg, bool); 8]>;
}

/// An operand under construction by a client, whose register references can
/// be inspected and rewritten (used when a memory operand mentions the
/// stolen register).
pub trait AppOperand {
    fn regs_used(&self) -> SmallVec<[Reg; 4]>;
    fn replace_reg(&mut self, old: Reg, new: Reg) -> bool;
}

/// Receives the code the mediator emits.  `insert(i, ..)` places an
/// instruction immediately before app instruction `i`, after anything
/// already inserted at that point; index `block_len` names the point after
/// the last instruction.
pub trait CodeSink {
    fn insert(&mut self, before: InstIx, inst: CodeInst);

    /// Suspend the host's instrumentation auto-predication, returning an
    /// opaque token for the prior state.  Emitted spill/restore code must
    /// execute unconditionally.
    fn clear_auto_predication(&mut self) -> u64 {
        0
    }
    /// Restore the auto-predication state captured by
    /// [`CodeSink::clear_auto_predication`].
    fn set_auto_predication(&mut self, _prior: u64) {}
}

/// Raw thread-local-storage allocation, in bytes-offset terms.  Offsets are
/// stable process-wide; generated code reaches a slot as `tls:[offs]`.
pub trait HostTls {
    /// Allocate `num_slots` contiguous word slots; returns the byte offset
    /// of the first.
    fn tls_alloc(&mut self, num_slots: u32) -> Result<u32, RegMedError>;
    fn tls_free(&mut self, offs: u32, num_slots: u32) -> Result<(), RegMedError>;
}

/// The host framework's own spill-slot facility, used once our direct slots
/// run out.  These slots are not preserved across application instructions.
pub trait HostSlots {
    /// Total host slots that exist.
    fn num_slots(&self) -> u32;
    /// Highest slot reachable as a single memory operand from generated
    /// code.
    fn max_addressable_slot(&self) -> u32;
    /// TLS byte offset of an addressable host slot.
    fn slot_offs(&self, slot: u32) -> u32;
    /// Read a host slot's current value for the executing thread.
    fn read_slot(&self, slot: u32) -> u64;
}

/// A TLS word access recognised in cache code: a load or store of a GPR at a
/// raw offset.  `in_tls` distinguishes segment-based TLS from accesses into
/// the host's thread-private context block (whose offsets are zero-based).
#[derive(Copy, Clone, Debug)]
pub struct RawSlotAccess {
    pub in_tls: bool,
    pub offs: u32,
    pub reg: Reg,
    pub is_store: bool,
}

/// A vector move between a SIMD register and `[base + disp]`, the second
/// half of the indirect spill sequence.
#[derive(Copy, Clone, Debug)]
pub struct SimdBlockAccess {
    pub base: Reg,
    pub disp: u32,
    pub reg: Reg,
    pub is_store: bool,
}

/// One instruction decoded from the code cache during fault processing.
pub trait CacheInstr {
    /// If this is a GPR load/store against a raw TLS or context slot, say
    /// which.
    fn raw_slot_access(&self) -> Option<RawSlotAccess>;
    /// If this is a vector move against `[base + disp]`, say which.
    fn simd_block_access(&self) -> Option<SimdBlockAccess>;
    /// The flags-to-accumulator capture opcode.
    fn is_flags_capture(&self) -> bool;
    /// The accumulator-to-flags release opcode.
    fn is_flags_release(&self) -> bool;
    /// Does this instruction overwrite `reg`?
    fn writes_reg(&self, reg: Reg) -> bool;
}

/// The machine context being rewritten at a fault.
pub trait MachineContext {
    fn gpr(&self, reg: Reg) -> u64;
    fn set_gpr(&mut self, reg: Reg, value: u64);
    fn flags(&self) -> u64;
    fn set_flags(&mut self, value: u64);
    /// Overwrite the low `bytes.len()` bytes of a vector register.
    fn set_simd(&mut self, reg: Reg, bytes: &[u8]);
}

//=============================================================================
// Per-operation context

/// The block being instrumented plus the sink for emitted code.  Every
/// mediation operation takes one of these; during the insertion pass the
/// instructions are the block's, and outside it they are whatever forward
/// window of code follows the insertion point.
pub struct BlockCtx<'a, I, S> {
    pub insns: &'a [I],
    pub sink: &'a mut S,
}

impl<'a, I, S> BlockCtx<'a, I, S> {
    pub fn new(insns: &'a [I], sink: &'a mut S) -> Self {
        BlockCtx { insns, sink }
    }
}

//=============================================================================
// Error reporting

/// Route an internal inconsistency through the user callback; panic if the
/// callback declines (or none was registered).
pub(crate) fn report_error(cb: Option<ErrorCallback>, res: RegMedError, msg: &str) {
    if let Some(cb) = cb {
        if cb(res) {
            return;
        }
    }
    log::error!("{}: {}", res, msg);
    panic!("{}: {}", res, msg);
}
