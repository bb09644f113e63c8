//! Data structures for the whole crate: register identifiers, spill slots,
//! liveness values, the register universe, and the per-thread bookkeeping
//! record.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use std::fmt;

use crate::slots::SlotStore;

//=============================================================================
// Maps and sets

pub type Map<K, V> = FxHashMap<K, V>;
pub type Set<T> = FxHashSet<T>;

//=============================================================================
// Instruction indices
//
// Instructions within one basic block are numbered 0 .. block_len in program
// order.  Emitted code is positioned "before instruction i"; index block_len
// names the point after the last instruction.

macro_rules! define_index {
    ($Ix:ident, $prefix:expr) => {
        #[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $Ix(u32);

        impl $Ix {
            #[inline(always)]
            pub fn new(n: u32) -> Self {
                Self(n)
            }
            #[inline(always)]
            pub fn get(self) -> u32 {
                self.0
            }
            #[inline(always)]
            pub fn get_usize(self) -> usize {
                self.0 as usize
            }
            #[inline(always)]
            pub fn plus(self, delta: u32) -> Self {
                Self(self.0 + delta)
            }
        }

        impl fmt::Debug for $Ix {
            fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
                write!(fmt, "{}{}", $prefix, self.0)
            }
        }
    };
}

define_index!(InstIx, "i");

//=============================================================================
// Register classes and registers

/// The class a register is reserved from.  The three SIMD classes name the
/// same architectural file at different widths; aliases of one vector
/// register share an index (and hence a spill slot).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RegClass {
    Gpr,
    SimdXmm,
    SimdYmm,
    SimdZmm,
}

const NUM_REG_CLASSES: u32 = 4;

impl RegClass {
    pub fn rc_to_u32(self) -> u32 {
        match self {
            RegClass::Gpr => 0,
            RegClass::SimdXmm => 1,
            RegClass::SimdYmm => 2,
            RegClass::SimdZmm => 3,
        }
    }
    pub fn rc_from_u32(rc: u32) -> RegClass {
        match rc {
            0 => RegClass::Gpr,
            1 => RegClass::SimdXmm,
            2 => RegClass::SimdYmm,
            3 => RegClass::SimdZmm,
            _ => panic!("RegClass::rc_from_u32"),
        }
    }
    pub fn is_simd(self) -> bool {
        self != RegClass::Gpr
    }
    /// Bytes of one register of this class.
    pub fn size_bytes(self) -> usize {
        match self {
            RegClass::Gpr => 8,
            RegClass::SimdXmm => 16,
            RegClass::SimdYmm => 32,
            RegClass::SimdZmm => 64,
        }
    }
}

// Reg is a hardware register identifier.  For compactness and speed the two
// fields are packed into a single u32:
//
//   rc:3  index:8
//
// |rc| is the register class and |index| the zero-based index within that
// class's file.  SIMD aliases (xmm3/ymm3/zmm3) share index 3 and differ only
// in class.  This gives fast equality, cheap Copy, and a zero-based index
// baked in for arrays keyed by register.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reg {
    bits: u32,
}

impl Reg {
    pub fn new(rc: RegClass, index: u8) -> Reg {
        Reg {
            bits: (rc.rc_to_u32() << 8) | index as u32,
        }
    }
    pub fn gpr(index: u8) -> Reg {
        Reg::new(RegClass::Gpr, index)
    }
    pub fn class(self) -> RegClass {
        let rc = self.bits >> 8;
        debug_assert!(rc < NUM_REG_CLASSES);
        RegClass::rc_from_u32(rc)
    }
    pub fn index(self) -> usize {
        (self.bits & 0xff) as usize
    }
    pub fn is_gpr(self) -> bool {
        self.class() == RegClass::Gpr
    }
    pub fn is_simd(self) -> bool {
        self.class().is_simd()
    }
    /// The same architectural register viewed at a different width.  Only
    /// meaningful for SIMD registers.
    pub fn with_class(self, rc: RegClass) -> Reg {
        debug_assert!(self.is_simd() && rc.is_simd());
        Reg::new(rc, (self.bits & 0xff) as u8)
    }
    /// Widen a SIMD register to the canonical full-width alias, so that
    /// xmm/ymm/zmm views of one register index the same bookkeeping entry.
    pub fn widest(self) -> Reg {
        if self.is_simd() {
            self.with_class(RegClass::SimdZmm)
        } else {
            self
        }
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let prefix = match self.class() {
            RegClass::Gpr => "r",
            RegClass::SimdXmm => "xmm",
            RegClass::SimdYmm => "ymm",
            RegClass::SimdZmm => "zmm",
        };
        write!(fmt, "{}{}", prefix, self.index())
    }
}

/// A phantom-role wrapper for registers written by emitted code, to make
/// data-movement direction explicit at construction sites.
#[derive(Copy, Clone, Hash, PartialEq, Eq)]
pub struct Writable<R: Copy> {
    reg: R,
}

impl<R: Copy> Writable<R> {
    pub fn from_reg(reg: R) -> Writable<R> {
        Writable { reg }
    }
    pub fn to_reg(self) -> R {
        self.reg
    }
}

impl<R: Copy + fmt::Debug> fmt::Debug for Writable<R> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Writable({:?})", self.reg)
    }
}

//=============================================================================
// Spill slots

/// An indexed memory location backing one register's worth of spill space.
///
/// GPR slots and SIMD slots are independent spaces; a `SpillSlot` is
/// interpreted in the space of the register class it was allocated for.
/// GPR slot 0 is always reserved for the arithmetic flags; slots
/// `1 .. num_gpr_slots` are direct TLS slots; anything above that is
/// delegated to the host framework's own spill slots, which are not
/// preserved across application instructions.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SpillSlot(u32);

impl SpillSlot {
    pub fn new(n: u32) -> SpillSlot {
        SpillSlot(n)
    }
    pub fn get(self) -> u32 {
        self.0
    }
    pub fn get_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SpillSlot {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "S{}", self.0)
    }
}

/// The slot backing the arithmetic flags, always slot 0.
pub const AFLAGS_SLOT: SpillSlot = SpillSlot(0);

//=============================================================================
// Arithmetic flags

bitflags::bitflags! {
    /// The arithmetic flags, at their architectural bit positions in the
    /// flags register.  A set of these doubles as a liveness value: the
    /// flags an application instruction downstream reads before writing.
    /// Empty means every arithmetic flag is dead.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AFlags: u32 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const OF = 1 << 11;
    }
}

impl AFlags {
    /// The flags captured by a flags-to-accumulator instruction: SF, ZF, AF,
    /// PF and CF land in bits 15:8 of the accumulator at their low-byte
    /// positions.  OF needs the separate overflow-capture instruction.
    pub const LOW_BYTE: AFlags = AFlags::CF
        .union(AFlags::PF)
        .union(AFlags::AF)
        .union(AFlags::ZF)
        .union(AFlags::SF);
}

//=============================================================================
// Liveness values
//
// Liveness is local to one basic block and computed by a single backward
// pass, so a per-register vector of per-position values suffices; there is
// no fixpoint iteration.

/// Liveness of a GPR at one position.  `Unknown` only appears on the
/// forward-scan path used outside block-driven insertion, never in the
/// block-scan vectors.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GprLive {
    Dead,
    Live,
    Unknown,
}

/// Liveness of a vector register at one position: a six-point lattice
/// ordered
///
///   XmmDead < YmmDead < ZmmDead < XmmLive < YmmLive < ZmmLive
///
/// `WDead` means the low W bytes are dead; `WLive` means the low W bytes are
/// live.  The ordering makes "a larger register wins" expressible as a
/// monotone max, which is what [`SimdLive::join`] computes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum SimdLive {
    XmmDead,
    YmmDead,
    ZmmDead,
    XmmLive,
    YmmLive,
    ZmmLive,
    Unknown,
}

impl SimdLive {
    /// Lattice join: the larger of the two states, with `Unknown` as the
    /// absorbing top.
    pub fn join(self, other: SimdLive) -> SimdLive {
        if self == SimdLive::Unknown || other == SimdLive::Unknown {
            SimdLive::Unknown
        } else if self >= other {
            self
        } else {
            other
        }
    }

    /// The dead state corresponding to a spill class.
    pub fn dead_state_for(rc: RegClass) -> SimdLive {
        match rc {
            RegClass::SimdXmm => SimdLive::XmmDead,
            RegClass::SimdYmm => SimdLive::YmmDead,
            RegClass::SimdZmm => SimdLive::ZmmDead,
            RegClass::Gpr => panic!("dead_state_for: not a SIMD class"),
        }
    }

    /// True if this state makes a reservation of class `rc` free: the low
    /// bytes at that width are dead.
    pub fn is_dead_for(self, rc: RegClass) -> bool {
        self >= SimdLive::dead_state_for(rc) && self <= SimdLive::ZmmDead
    }

    pub fn is_live(self) -> bool {
        self >= SimdLive::XmmLive && self <= SimdLive::ZmmLive
    }
}

//=============================================================================
// The register universe

/// A read-only description of the registers on the host architecture, in the
/// mediator's view: how many GPRs and vector registers exist, and which GPRs
/// carry special roles.
///
/// The SIMD file is only engaged on architectures whose vector registers
/// need indirect spills; a universe with `num_simds == 0` makes every SIMD
/// spill class unavailable.
#[derive(Clone, Debug)]
pub struct RegUniverse {
    /// Number of general-purpose registers, indices `0 .. num_gprs`.
    pub num_gprs: u8,
    /// Number of vector registers (counted at full width), or 0 when the
    /// architecture has no indirectly-spilled vector file.
    pub num_simds: u8,
    /// The stack pointer.  Never handed out, even when dead.
    pub stack_pointer: Reg,
    /// A GPR the host framework reserves for its own use and asks us to
    /// avoid.
    pub stolen: Option<Reg>,
    /// The program counter, on architectures where it is addressable as a
    /// GPR.  Never handed out.
    pub program_counter: Option<Reg>,
    /// The accumulator used by the flags-to-register capture sequence.
    pub accumulator: Reg,
}

impl RegUniverse {
    /// A 16-GPR, 16-vector universe with the accumulator at index 0 and the
    /// stack pointer at index 4, matching the common 64-bit layout.
    pub fn x64() -> RegUniverse {
        RegUniverse {
            num_gprs: 16,
            num_simds: 16,
            stack_pointer: Reg::gpr(4),
            stolen: None,
            program_counter: None,
            accumulator: Reg::gpr(0),
        }
    }

    /// Check that the universe satisfies the invariants the mediator depends
    /// on, and panic if not.
    pub fn check_is_sane(&self) {
        let mut ok = self.num_gprs > 0 && (self.num_gprs as usize) <= 64;
        ok = ok && (self.num_simds as usize) <= 64;
        ok = ok
            && self.stack_pointer.is_gpr()
            && self.stack_pointer.index() < self.num_gprs as usize;
        ok = ok && self.accumulator.is_gpr() && self.accumulator.index() < self.num_gprs as usize;
        if let Some(r) = self.stolen {
            ok = ok && r.is_gpr() && r.index() < self.num_gprs as usize;
        }
        if let Some(r) = self.program_counter {
            ok = ok && r.is_gpr() && r.index() < self.num_gprs as usize;
        }
        if !ok {
            panic!("RegUniverse::check_is_sane: invalid RegUniverse");
        }
    }
}

//=============================================================================
// Allowed-register sets

/// A subset of one register class's file, used to constrain reservations.
/// Indices are class-file indices (SIMD aliases share an index).
#[derive(Clone, Copy, Debug)]
pub struct AllowedSet {
    bits: u64,
}

impl AllowedSet {
    pub fn all() -> AllowedSet {
        AllowedSet { bits: !0 }
    }
    pub fn none() -> AllowedSet {
        AllowedSet { bits: 0 }
    }
    pub fn set(&mut self, reg: Reg, allowed: bool) {
        let ix = reg.index();
        debug_assert!(ix < 64);
        if allowed {
            self.bits |= 1 << ix;
        } else {
            self.bits &= !(1 << ix);
        }
    }
    pub fn contains(&self, reg: Reg) -> bool {
        (self.bits >> reg.index()) & 1 != 0
    }
}

//=============================================================================
// Basic-block property hints

bitflags::bitflags! {
    /// Client-supplied hints about the block being instrumented.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BbProperties: u32 {
        /// The client promises that intra-block control flow does not
        /// endanger lazy restores, so they stay enabled.
        const IGNORE_CONTROL_FLOW = 1 << 0;
        /// Control flow spans app instructions in ways the scan cannot see;
        /// disable cross-instruction laziness for unreserved registers.
        const CONTAINS_SPANNING_CONTROL_FLOW = 1 << 1;
    }
}

//=============================================================================
// Per-register bookkeeping

/// Where the application's value for one register currently lives, plus the
/// reservation state.  One of these exists per GPR, per vector register, and
/// one more for the arithmetic flags.
///
/// Invariants between instructions:
///   - `native` implies `xchg` is `None` and no slot is owned.
///   - reserved and non-native implies exactly one of `xchg` set or `slot`
///     owned.
#[derive(Clone, Debug)]
pub struct RegState {
    /// Currently reserved by some client.
    pub in_use: bool,
    /// The application value is still in the architectural register.
    pub native: bool,
    /// Since reservation, the value has actually been written to a slot.  A
    /// register reserved while dead owns a slot but never writes it, and
    /// then there is nothing to restore.
    pub ever_spilled: bool,
    /// Number of uses by application instructions in this block, counted
    /// during analysis; used to pick the cheapest live register to steal.
    pub app_uses: u32,
    /// The owned slot, when `!native` and no exchange partner is set.
    pub slot: Option<SpillSlot>,
    /// An exchange partner: the value was parked in this (dead) register
    /// instead of memory.  Only the flags engine currently creates these.
    pub xchg: Option<Reg>,
}

impl RegState {
    pub fn new_native() -> RegState {
        RegState {
            in_use: false,
            native: true,
            ever_spilled: false,
            app_uses: 0,
            slot: None,
            xchg: None,
        }
    }
}

//=============================================================================
// Liveness vectors

/// Per-block, per-register sequences of liveness states, indexed by reverse
/// instruction position: index 0 is the last instruction of the block.
/// Cleared and refilled for every block; length equals the block's
/// instruction count (or 1 on the forward-scan path).
#[derive(Clone, Debug, Default)]
pub struct LivenessVectors {
    pub gpr: Vec<Vec<GprLive>>,
    pub simd: Vec<Vec<SimdLive>>,
    pub aflags: Vec<AFlags>,
}

impl LivenessVectors {
    pub fn new(num_gprs: usize, num_simds: usize) -> LivenessVectors {
        LivenessVectors {
            gpr: vec![Vec::new(); num_gprs],
            simd: vec![Vec::new(); num_simds],
            aflags: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        for v in &mut self.gpr {
            v.clear();
        }
        for v in &mut self.simd {
            v.clear();
        }
        self.aflags.clear();
    }
}

//=============================================================================
// The per-thread record

/// The complete mediation state for one application thread.  Each thread
/// owns a distinct record; nothing here is shared, and the host framework is
/// responsible for serialising basic-block building, so no locking happens
/// on this path.
pub struct PerThread {
    pub(crate) univ: RegUniverse,
    pub(crate) config: crate::interface::Config,

    /// Reverse liveness index of the current instruction; counts down as the
    /// insertion pass advances.
    pub(crate) live_idx: usize,
    pub(crate) block_len: usize,
    pub(crate) in_insertion: bool,

    pub(crate) gprs: Vec<RegState>,
    pub(crate) simds: Vec<RegState>,
    pub(crate) aflags: RegState,
    pub(crate) live: LivenessVectors,

    pub(crate) slots: SlotStore,

    /// Count of GPRs with `!native && !in_use` awaiting lazy restore.
    pub(crate) pending_unreserved: u32,
    /// Same, for vector registers.
    pub(crate) simd_pending_unreserved: u32,

    pub(crate) bb_props: BbProperties,
    pub(crate) bb_has_internal_flow: bool,
}

impl PerThread {
    /// Create the record for a newly started thread.  Every register starts
    /// native; the spill storage persists for the thread's lifetime.
    ///
    /// `host_slot_count` is how many of the host framework's own spill slots
    /// exist beyond our direct TLS slots.
    pub fn new(univ: RegUniverse, host_slot_count: u32) -> PerThread {
        let config = crate::interface::current_config();
        PerThread::with_config(univ, config, host_slot_count)
    }

    pub(crate) fn with_config(
        univ: RegUniverse,
        config: crate::interface::Config,
        host_slot_count: u32,
    ) -> PerThread {
        univ.check_is_sane();
        let num_gprs = univ.num_gprs as usize;
        let num_simds = univ.num_simds as usize;
        let slots = SlotStore::new(&config, host_slot_count);
        PerThread {
            univ,
            config,
            live_idx: 0,
            block_len: 0,
            in_insertion: false,
            gprs: vec![RegState::new_native(); num_gprs],
            simds: vec![RegState::new_native(); num_simds],
            aflags: RegState::new_native(),
            live: LivenessVectors::new(num_gprs, num_simds),
            slots,
            pending_unreserved: 0,
            simd_pending_unreserved: 0,
            bb_props: BbProperties::empty(),
            bb_has_internal_flow: false,
        }
    }

    pub fn universe(&self) -> &RegUniverse {
        &self.univ
    }

    //-------------------------------------------------------------------------
    // Backing-memory access for the host runtime.  Lowered spill code reads
    // and writes these locations when it executes; the fault rewriter reads
    // them back.

    pub fn read_spill_slot(&self, slot: SpillSlot) -> u64 {
        self.slots.read_direct(slot)
    }
    pub fn write_spill_slot(&mut self, slot: SpillSlot, value: u64) {
        self.slots.write_direct(slot, value);
    }
    pub fn read_simd_slot(&self, slot: SpillSlot, len: usize) -> &[u8] {
        self.slots.read_simd(slot, len)
    }
    pub fn write_simd_slot(&mut self, slot: SpillSlot, bytes: &[u8]) {
        self.slots.write_simd(slot, bytes);
    }

    pub(crate) fn gpr_state(&self, reg: Reg) -> &RegState {
        debug_assert!(reg.is_gpr());
        &self.gprs[reg.index()]
    }
    pub(crate) fn gpr_state_mut(&mut self, reg: Reg) -> &mut RegState {
        debug_assert!(reg.is_gpr());
        &mut self.gprs[reg.index()]
    }
    pub(crate) fn simd_state(&self, reg: Reg) -> &RegState {
        debug_assert!(reg.is_simd());
        &self.simds[reg.index()]
    }
    pub(crate) fn simd_state_mut(&mut self, reg: Reg) -> &mut RegState {
        debug_assert!(reg.is_simd());
        &mut self.simds[reg.index()]
    }

    pub(crate) fn gpr_live_at(&self, reg: Reg, idx: usize) -> GprLive {
        self.live.gpr[reg.index()][idx]
    }
    pub(crate) fn simd_live_at(&self, reg: Reg, idx: usize) -> SimdLive {
        self.live.simd[reg.index()][idx]
    }
    pub(crate) fn aflags_live_at(&self, idx: usize) -> AFlags {
        self.live.aflags[idx]
    }

    /// Iterate the GPR file.
    pub(crate) fn all_gprs(&self) -> impl Iterator<Item = Reg> {
        (0..self.univ.num_gprs).map(Reg::gpr)
    }
    /// Iterate the vector file at canonical (widest) width.
    pub(crate) fn all_simds(&self) -> impl Iterator<Item = Reg> {
        (0..self.univ.num_simds).map(|i| Reg::new(RegClass::SimdZmm, i))
    }

    /// Debug-build check of the conservation invariant: at the end of a
    /// block every register must be native, nothing may be reserved, and
    /// every slot must be free.
    pub(crate) fn assert_all_native(&self) {
        if cfg!(debug_assertions) {
            debug_assert!(!self.aflags.in_use, "client failed to unreserve aflags");
            debug_assert!(self.aflags.native, "client failed to unreserve aflags");
            for st in self.gprs.iter().chain(self.simds.iter()) {
                debug_assert!(!st.in_use, "client failed to unreserve a register");
                debug_assert!(st.native, "client failed to unreserve a register");
            }
            debug_assert!(self.slots.all_free(), "client failed to unreserve a register");
            debug_assert!(self.pending_unreserved == 0);
            debug_assert!(self.simd_pending_unreserved == 0);
        }
    }
}
