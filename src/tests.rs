//! Crate-level scenario tests.
//!
//! The mediator is driven with a miniature instruction set and a mock host.
//! A small machine executes the emitted code items against the per-thread
//! slot storage, so spills, restores, and fault rewrites are checked against
//! actual values rather than just instruction shapes.

use pretty_assertions::assert_eq;

use crate::interface::*;

//=============================================================================
// Mock ISA

#[derive(Clone, Debug, PartialEq)]
enum Inst {
    Nop,
    Read(Reg),
    Write(Reg),
    PartialWrite(Reg),
    CondWrite(Reg),
    LoadMem { base: Reg },
    Jmp,
    JmpLocal,
    ReadFlags(AFlags),
    WriteFlags(AFlags),
    SimdRead(Reg),
    SimdWrite(Reg),
}

impl AppInstr for Inst {
    fn reads_reg(&self, reg: Reg) -> bool {
        match self {
            Inst::Read(r) => *r == reg,
            Inst::LoadMem { base } => *base == reg,
            Inst::SimdRead(r) => reg.is_simd() && r.widest() == reg.widest(),
            _ => false,
        }
    }
    fn reads_exact_reg(&self, reg: Reg) -> bool {
        match self {
            Inst::Read(r) => *r == reg,
            Inst::SimdRead(r) => *r == reg,
            _ => false,
        }
    }
    fn writes_reg(&self, reg: Reg) -> bool {
        match self {
            Inst::Write(r) | Inst::PartialWrite(r) | Inst::CondWrite(r) => *r == reg,
            Inst::SimdWrite(r) => reg.is_simd() && r.widest() == reg.widest(),
            _ => false,
        }
    }
    fn writes_exact_reg(&self, reg: Reg) -> bool {
        match self {
            Inst::Write(r) => *r == reg,
            Inst::SimdWrite(r) => *r == reg,
            _ => false,
        }
    }
    fn unconditionally_writes_reg(&self, reg: Reg) -> bool {
        match self {
            Inst::CondWrite(_) => false,
            _ => self.writes_reg(reg),
        }
    }
    fn is_control_transfer(&self) -> bool {
        matches!(self, Inst::Jmp | Inst::JmpLocal)
    }
    fn targets_within_block(&self) -> bool {
        matches!(self, Inst::JmpLocal)
    }
    fn flags_read(&self) -> AFlags {
        match self {
            Inst::ReadFlags(f) => *f,
            _ => AFlags::empty(),
        }
    }
    fn flags_written(&self) -> AFlags {
        match self {
            Inst::WriteFlags(f) => *f,
            _ => AFlags::empty(),
        }
    }
    fn operand_regs(&self) -> smallvec::SmallVec<[(Reg, bool); 8]> {
        match self {
            Inst::Read(r) | Inst::Write(r) | Inst::PartialWrite(r) | Inst::CondWrite(r) => {
                smallvec::smallvec![(*r, false)]
            }
            Inst::LoadMem { base } => smallvec::smallvec![(*base, true)],
            Inst::SimdRead(r) | Inst::SimdWrite(r) => smallvec::smallvec![(r.widest(), false)],
            _ => smallvec::SmallVec::new(),
        }
    }
}

//=============================================================================
// Mock sink, host, machine

/// Collects emitted code and enforces the unpredicated-batch discipline:
/// every insertion must happen between clear/set of auto-predication.
#[derive(Default)]
struct Sink {
    items: Vec<(u32, CodeInst)>,
    pred_depth: i64,
}

impl CodeSink for Sink {
    fn insert(&mut self, before: InstIx, inst: CodeInst) {
        assert!(self.pred_depth > 0, "emission outside an unpredicated batch");
        self.items.push((before.get(), inst));
    }
    fn clear_auto_predication(&mut self) -> u64 {
        self.pred_depth += 1;
        (self.pred_depth - 1) as u64
    }
    fn set_auto_predication(&mut self, prior: u64) {
        self.pred_depth -= 1;
        assert_eq!(self.pred_depth as u64, prior, "predication tokens crossed");
    }
}

impl Sink {
    fn at(&self, ix: u32) -> Vec<CodeInst> {
        self.items
            .iter()
            .filter(|(p, _)| *p == ix)
            .map(|(_, c)| *c)
            .collect()
    }
    fn count(&self, f: impl Fn(CodeInst) -> bool) -> usize {
        self.items.iter().filter(|(_, c)| f(*c)).count()
    }
}

const HOST_SLOT_BASE: u32 = 0x400;

struct Host {
    slots: [u64; 8],
    next_alloc: u32,
}

impl Host {
    fn new() -> Host {
        Host {
            slots: [0; 8],
            next_alloc: 0x80,
        }
    }
}

impl HostSlots for Host {
    fn num_slots(&self) -> u32 {
        8
    }
    fn max_addressable_slot(&self) -> u32 {
        3
    }
    fn slot_offs(&self, slot: u32) -> u32 {
        HOST_SLOT_BASE + slot * WORD_SIZE
    }
    fn read_slot(&self, slot: u32) -> u64 {
        self.slots[slot as usize]
    }
}

impl HostTls for Host {
    fn tls_alloc(&mut self, num_slots: u32) -> Result<u32, RegMedError> {
        let base = self.next_alloc;
        self.next_alloc += num_slots * WORD_SIZE;
        Ok(base)
    }
    fn tls_free(&mut self, _offs: u32, _num_slots: u32) -> Result<(), RegMedError> {
        Ok(())
    }
}

fn test_config(num_gpr_slots: u32, num_simd_slots: u32) -> crate::interface::Config {
    crate::interface::Config {
        num_gpr_slots,
        num_simd_slots,
        conservative: false,
        error_callback: None,
        simd_ptr_offs: 0x80,
        slot_offs: 0x80 + WORD_SIZE,
    }
}

fn make_pt(num_gpr_slots: u32, num_simd_slots: u32) -> PerThread {
    let _ = env_logger::builder().is_test(true).try_init();
    PerThread::with_config(RegUniverse::x64(), test_config(num_gpr_slots, num_simd_slots), 8)
}

/// Drive a whole block through the analysis and insertion events, running
/// `client` between the early and late hooks of every instruction.
fn run_block(
    pt: &mut PerThread,
    insns: &[Inst],
    sink: &mut Sink,
    mut client: impl FnMut(&mut PerThread, &mut BlockCtx<Inst, Sink>, u32),
) {
    pt.analyze_block(insns);
    let mut cx = BlockCtx::new(insns, sink);
    for i in 0..insns.len() as u32 {
        pt.insert_early(InstIx::new(i));
        client(pt, &mut cx, i);
        pt.insert_late(&mut cx, InstIx::new(i)).unwrap();
    }
}

const SIMD_BASE: u64 = 0x51d0_0000;
const STOLEN_VAL: u64 = 0xdead_5701;

/// Executes emitted code and app instructions against the per-thread slot
/// storage, standing in for the real machine.
#[derive(Clone)]
struct Machine {
    gprs: [u64; 16],
    simds: [[u8; 16]; 16],
    flags: u64,
    host: [u64; 8],
    app_writes: u64,
}

impl Machine {
    fn fresh() -> Machine {
        let mut simds = [[0u8; 16]; 16];
        for (i, s) in simds.iter_mut().enumerate() {
            for (j, b) in s.iter_mut().enumerate() {
                *b = (0x40 + i * 16 + j) as u8;
            }
        }
        let mut gprs = [0u64; 16];
        for (i, g) in gprs.iter_mut().enumerate() {
            *g = 0x1000 + i as u64;
        }
        Machine {
            gprs,
            simds,
            flags: 0,
            host: [0; 8],
            app_writes: 0,
        }
    }

    fn exec_code(&mut self, pt: &mut PerThread, inst: &CodeInst) {
        let low = AFlags::LOW_BYTE.bits() as u64;
        match *inst {
            CodeInst::StoreTls { offs, src } => {
                let slot = SpillSlot::new((offs - pt_slot_offs(pt)) / WORD_SIZE);
                pt.slots.write_direct(slot, self.gprs[src.index()]);
            }
            CodeInst::LoadTls { offs, dst } => {
                let d = dst.to_reg().index();
                if offs == pt_simd_ptr_offs(pt) {
                    self.gprs[d] = SIMD_BASE;
                } else {
                    let slot = SpillSlot::new((offs - pt_slot_offs(pt)) / WORD_SIZE);
                    self.gprs[d] = pt.slots.read_direct(slot);
                }
            }
            CodeInst::StoreHostSlot { slot, src } => {
                self.host[slot as usize] = self.gprs[src.index()];
            }
            CodeInst::LoadHostSlot { slot, dst } => {
                self.gprs[dst.to_reg().index()] = self.host[slot as usize];
            }
            CodeInst::StoreSimd { base, disp, src } => {
                assert_eq!(self.gprs[base.index()], SIMD_BASE, "unloaded area pointer");
                let bytes = self.simds[src.index()];
                pt.slots.write_simd(SpillSlot::new(disp / 64), &bytes);
            }
            CodeInst::LoadSimd { base, disp, dst } => {
                assert_eq!(self.gprs[base.index()], SIMD_BASE, "unloaded area pointer");
                let mut b = [0u8; 16];
                b.copy_from_slice(pt.slots.read_simd(SpillSlot::new(disp / 64), 16));
                self.simds[dst.to_reg().index()] = b;
            }
            CodeInst::FlagsToAccum => {
                let a = accum_index();
                let byte = (self.flags & low) | 0x02;
                self.gprs[a] = (self.gprs[a] & !0xff00) | (byte << 8);
            }
            CodeInst::CaptureOverflow => {
                let a = accum_index();
                let of = (self.flags & AFlags::OF.bits() as u64) != 0;
                self.gprs[a] = (self.gprs[a] & !0xff) | of as u64;
            }
            CodeInst::MaterializeOverflow => {
                let a = accum_index();
                if self.gprs[a] & 0xff == 1 {
                    self.flags |= AFlags::OF.bits() as u64;
                } else {
                    self.flags &= !(AFlags::OF.bits() as u64);
                }
            }
            CodeInst::FlagsFromAccum => {
                let a = accum_index();
                let byte = (self.gprs[a] >> 8) & 0xff;
                self.flags = (self.flags & !low) | (byte & low);
            }
            CodeInst::Swap { a, b } => {
                self.gprs.swap(a.index(), b.index());
            }
            CodeInst::Move { dst, src } => {
                if src.is_gpr() {
                    self.gprs[dst.to_reg().index()] = self.gprs[src.index()];
                } else {
                    self.simds[dst.to_reg().index()] = self.simds[src.index()];
                }
            }
            CodeInst::LoadStolenValue { dst } => {
                self.gprs[dst.to_reg().index()] = STOLEN_VAL;
            }
        }
    }

    fn exec_app(&mut self, inst: &Inst) {
        match inst {
            Inst::Write(r) | Inst::CondWrite(r) => {
                self.app_writes += 1;
                self.gprs[r.index()] = 0xa000_0000 + self.app_writes;
            }
            Inst::PartialWrite(r) => {
                self.app_writes += 1;
                self.gprs[r.index()] =
                    (self.gprs[r.index()] & !0xffff) | 0xb000 | (self.app_writes & 0xfff);
            }
            Inst::WriteFlags(f) => {
                self.flags = (self.flags & !(AFlags::all().bits() as u64)) | f.bits() as u64;
            }
            Inst::SimdWrite(r) => {
                self.app_writes += 1;
                self.simds[r.index()] = [0x80 | (self.app_writes as u8 & 0x7f); 16];
            }
            _ => {}
        }
    }
}

fn accum_index() -> usize {
    RegUniverse::x64().accumulator.index()
}
fn pt_slot_offs(pt: &PerThread) -> u32 {
    pt.config.slot_offs
}
fn pt_simd_ptr_offs(pt: &PerThread) -> u32 {
    pt.config.simd_ptr_offs
}

//=============================================================================
// Cache-code modelling for the fault rewriter

#[derive(Clone, Debug)]
enum CacheOp {
    Code(CodeInst),
    App(Inst),
}

fn interleave(insns: &[Inst], sink: &Sink) -> Vec<CacheOp> {
    let mut out = Vec::new();
    for ix in 0..=insns.len() as u32 {
        for (p, ci) in &sink.items {
            if *p == ix {
                out.push(CacheOp::Code(*ci));
            }
        }
        if (ix as usize) < insns.len() {
            out.push(CacheOp::App(insns[ix as usize].clone()));
        }
    }
    out
}

struct CacheItem {
    raw: Option<RawSlotAccess>,
    simd: Option<SimdBlockAccess>,
    cap: bool,
    rel: bool,
    writes: Vec<Reg>,
}

impl CacheInstr for CacheItem {
    fn raw_slot_access(&self) -> Option<RawSlotAccess> {
        self.raw
    }
    fn simd_block_access(&self) -> Option<SimdBlockAccess> {
        self.simd
    }
    fn is_flags_capture(&self) -> bool {
        self.cap
    }
    fn is_flags_release(&self) -> bool {
        self.rel
    }
    fn writes_reg(&self, reg: Reg) -> bool {
        self.writes.contains(&reg)
    }
}

fn decode(stream: &[CacheOp], host: &Host) -> Vec<CacheItem> {
    stream
        .iter()
        .map(|op| {
            let mut item = CacheItem {
                raw: None,
                simd: None,
                cap: false,
                rel: false,
                writes: Vec::new(),
            };
            match op {
                CacheOp::Code(ci) => match *ci {
                    CodeInst::StoreTls { offs, src } => {
                        item.raw = Some(RawSlotAccess {
                            in_tls: true,
                            offs,
                            reg: src,
                            is_store: true,
                        });
                    }
                    CodeInst::LoadTls { offs, dst } => {
                        item.raw = Some(RawSlotAccess {
                            in_tls: true,
                            offs,
                            reg: dst.to_reg(),
                            is_store: false,
                        });
                        item.writes.push(dst.to_reg());
                    }
                    CodeInst::StoreHostSlot { slot, src } => {
                        item.raw = Some(RawSlotAccess {
                            in_tls: true,
                            offs: host.slot_offs(slot),
                            reg: src,
                            is_store: true,
                        });
                    }
                    CodeInst::LoadHostSlot { slot, dst } => {
                        item.raw = Some(RawSlotAccess {
                            in_tls: true,
                            offs: host.slot_offs(slot),
                            reg: dst.to_reg(),
                            is_store: false,
                        });
                        item.writes.push(dst.to_reg());
                    }
                    CodeInst::StoreSimd { base, disp, src } => {
                        item.simd = Some(SimdBlockAccess {
                            base,
                            disp,
                            reg: src,
                            is_store: true,
                        });
                    }
                    CodeInst::LoadSimd { base, disp, dst } => {
                        item.simd = Some(SimdBlockAccess {
                            base,
                            disp,
                            reg: dst.to_reg(),
                            is_store: false,
                        });
                        item.writes.push(dst.to_reg());
                    }
                    CodeInst::FlagsToAccum => item.cap = true,
                    CodeInst::FlagsFromAccum => item.rel = true,
                    CodeInst::CaptureOverflow | CodeInst::MaterializeOverflow => {}
                    CodeInst::Swap { a, b } => {
                        item.writes.push(a);
                        item.writes.push(b);
                    }
                    CodeInst::Move { dst, .. } | CodeInst::LoadStolenValue { dst } => {
                        item.writes.push(dst.to_reg());
                    }
                },
                CacheOp::App(inst) => match inst {
                    Inst::Write(r) | Inst::PartialWrite(r) | Inst::CondWrite(r) => {
                        item.writes.push(*r);
                    }
                    _ => {}
                },
            }
            item
        })
        .collect()
}

/// The fault's machine context.
#[derive(Clone, Debug, PartialEq)]
struct Ctx {
    gprs: [u64; 16],
    flags: u64,
    simds: [[u8; 16]; 16],
}

impl From<&Machine> for Ctx {
    fn from(m: &Machine) -> Ctx {
        Ctx {
            gprs: m.gprs,
            flags: m.flags,
            simds: m.simds,
        }
    }
}

impl MachineContext for Ctx {
    fn gpr(&self, reg: Reg) -> u64 {
        self.gprs[reg.index()]
    }
    fn set_gpr(&mut self, reg: Reg, value: u64) {
        self.gprs[reg.index()] = value;
    }
    fn flags(&self) -> u64 {
        self.flags
    }
    fn set_flags(&mut self, value: u64) {
        self.flags = value;
    }
    fn set_simd(&mut self, reg: Reg, bytes: &[u8]) {
        self.simds[reg.index()][..bytes.len()].copy_from_slice(bytes);
    }
}

/// Sync the mock host's slot values into the `HostSlots` view the rewriter
/// reads from.
fn sync_host(machine: &Machine, host: &mut Host) {
    host.slots = machine.host;
}

//=============================================================================
// Liveness

#[test]
fn backward_liveness_reads_writes_and_inherit() {
    let mut pt = make_pt(4, 0);
    let a = Reg::gpr(1);
    let b = Reg::gpr(2);
    // i0: write a   i1: write b   i2: use b
    let block = [Inst::Write(a), Inst::Write(b), Inst::Read(b)];
    pt.analyze_block(&block);
    // Reverse index 2 is the first instruction.
    assert_eq!(pt.gpr_live_at(a, 2), GprLive::Dead);
    assert_eq!(pt.gpr_live_at(b, 2), GprLive::Dead); // overwritten before the read
    assert_eq!(pt.gpr_live_at(b, 1), GprLive::Dead);
    assert_eq!(pt.gpr_live_at(b, 0), GprLive::Live);
    // An untouched register defaults to live at the block tail.
    assert_eq!(pt.gpr_live_at(Reg::gpr(3), 0), GprLive::Live);
}

#[test]
fn control_transfer_makes_everything_live() {
    let mut pt = make_pt(4, 0);
    let a = Reg::gpr(1);
    let block = [Inst::Write(a), Inst::Jmp];
    pt.analyze_block(&block);
    // At the transfer everything must be assumed read externally.
    assert_eq!(pt.gpr_live_at(a, 0), GprLive::Live);
    assert_eq!(pt.aflags_live_at(0), AFlags::all());
    // The write still kills the value above the transfer.
    assert_eq!(pt.gpr_live_at(a, 1), GprLive::Dead);
}

#[test]
fn backward_flags_write_kills_unless_read_first() {
    let mut pt = make_pt(4, 0);
    let block = [
        Inst::WriteFlags(AFlags::ZF),
        Inst::ReadFlags(AFlags::ZF),
    ];
    pt.analyze_block(&block);
    // Below the write the read is satisfied by the app's own result.
    assert!(!pt.aflags_live_at(1).contains(AFlags::ZF));
    assert!(pt.aflags_live_at(1).contains(AFlags::CF));
    // At the read itself ZF is of course live.
    assert!(pt.aflags_live_at(0).contains(AFlags::ZF));
}

#[test]
fn forward_scan_flag_reads_mask_prior_writes() {
    let mut pt = make_pt(4, 0);
    let window = [
        Inst::ReadFlags(AFlags::ZF),
        Inst::WriteFlags(AFlags::ZF | AFlags::CF),
        Inst::Jmp,
        // Beyond the transfer; must not be scanned.
        Inst::ReadFlags(AFlags::CF),
    ];
    let mut sink = Sink::default();
    let cx = BlockCtx::new(&window[..], &mut sink);
    let live = pt.aflags_liveness(&cx, InstIx::new(0)).unwrap();
    // ZF read before any write: live.  CF written before any read: dead.
    assert!(live.contains(AFlags::ZF));
    assert!(!live.contains(AFlags::CF));
    // Flags never touched in the window stay conservatively live.
    assert!(live.contains(AFlags::OF));
}

#[test]
fn forward_scan_gpr_first_touch_wins() {
    let mut pt = make_pt(4, 0);
    let a = Reg::gpr(1);
    let b = Reg::gpr(2);
    let c = Reg::gpr(3);
    let window = [Inst::Write(b), Inst::Read(a), Inst::Write(a), Inst::Jmp];
    let mut sink = Sink::default();
    let cx = BlockCtx::new(&window[..], &mut sink);
    assert!(!pt.is_register_dead(&cx, InstIx::new(0), a).unwrap());
    assert!(pt.is_register_dead(&cx, InstIx::new(0), b).unwrap());
    // Untouched before the transfer: conservatively live.
    assert!(!pt.is_register_dead(&cx, InstIx::new(0), c).unwrap());
}

#[test]
fn simd_liveness_promotes_to_read_width() {
    let mut pt = make_pt(4, 2);
    let x3 = Reg::new(RegClass::SimdXmm, 3);
    let z3 = x3.widest();
    let block = [Inst::Nop, Inst::SimdRead(x3), Inst::SimdWrite(x3)];
    pt.analyze_block(&block);
    // The exact-width write deadens only from live states.
    assert_eq!(pt.simd_live_at(z3, 0), SimdLive::XmmDead);
    assert_eq!(pt.simd_live_at(z3, 1), SimdLive::XmmLive);
    assert_eq!(pt.simd_live_at(z3, 2), SimdLive::XmmLive);
}

//=============================================================================
// Reservation scenarios

#[test]
fn dead_reservation_emits_no_spill() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let a = Reg::gpr(1);
    let b = Reg::gpr(2);
    let block = [Inst::Write(a), Inst::Write(b), Inst::Read(b)];
    let mut got = None;
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            let r = pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            pt.unreserve_register(cx, InstIx::new(0), r).unwrap();
            got = Some(r);
        }
    });
    assert_eq!(got, Some(a));
    // Dead everywhere it matters: no spill, no restore, nothing at all.
    assert_eq!(sink.items, vec![]);
}

#[test]
fn live_reservation_restores_lazily() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let a = Reg::gpr(1);
    let block = [Inst::Read(a), Inst::Nop, Inst::Read(a)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 1 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            let r = pt.reserve_register(cx, InstIx::new(1), Some(&allowed)).unwrap();
            assert_eq!(r, a);
        }
        if i == 2 {
            pt.unreserve_register(cx, InstIx::new(2), a).unwrap();
        }
    });
    // One spill at the reservation, one lazy restore before the app read.
    assert_eq!(sink.items.len(), 2);
    assert!(matches!(sink.at(1)[0], CodeInst::StoreTls { src, .. } if src == a));
    assert!(matches!(sink.at(2)[0], CodeInst::LoadTls { dst, .. } if dst.to_reg() == a));
}

#[test]
fn app_write_builds_the_temp_slot_sandwich() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let a = Reg::gpr(1);
    let block = [Inst::Nop, Inst::Write(a), Inst::Read(a)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            let r = pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            assert_eq!(r, a);
        }
        if i == 2 {
            pt.unreserve_register(cx, InstIx::new(2), a).unwrap();
        }
    });
    // Reserved while dead: no spill up front.  Around the app write:
    // tool value to a fresh slot, app result into the app slot, tool value
    // back.
    assert_eq!(sink.at(0), vec![]);
    let before = sink.at(1);
    let after = sink.at(2);
    let (app_slot, tmp_slot) = match (before[0], after[0], after[1]) {
        (
            CodeInst::StoreTls { offs: t1, src: s1 },
            CodeInst::StoreTls { offs: o, src: s2 },
            CodeInst::LoadTls { offs: t2, dst },
        ) => {
            assert_eq!((s1, s2, dst.to_reg()), (a, a, a));
            assert_eq!(t1, t2, "tool value must come back from the same slot");
            (o, t1)
        }
        other => panic!("unexpected sandwich shape: {:?}", other),
    };
    assert_ne!(app_slot, tmp_slot);
    // The lazy restore before the final read reads the app slot.
    assert!(matches!(after[2], CodeInst::LoadTls { offs, dst }
        if offs == app_slot && dst.to_reg() == a));
}

#[test]
fn read_and_write_sandwich_is_exactly_four_instructions() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let a = Reg::gpr(1);
    // The middle instruction's partial write is a read and a write: the
    // unwritten part of the register must combine with the app value.
    let block = [Inst::Nop, Inst::PartialWrite(a), Inst::Read(a)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
        }
        if i == 2 {
            pt.unreserve_register(cx, InstIx::new(2), a).unwrap();
        }
    });
    // At the middle instruction: spill tool -> tmp, restore app -> reg
    // before; spill reg -> appslot, restore tmp -> reg after.
    let before = sink.at(1);
    let after = sink.at(2);
    let app_slot = match before[..] {
        [CodeInst::StoreTls { offs: tmp, .. }, CodeInst::LoadTls { offs: app, .. }] => {
            assert_ne!(tmp, app);
            app
        }
        ref other => panic!("unexpected pre-sequence: {:?}", other),
    };
    match after[..2] {
        [CodeInst::StoreTls { offs: o1, .. }, CodeInst::LoadTls { offs: o2, .. }] => {
            assert_eq!(o1, app_slot, "app value must land in the app slot");
            assert_ne!(o2, app_slot, "tool value must come back from the temp");
        }
        ref other => panic!("unexpected post-sequence: {:?}", other),
    }
}

#[test]
fn conditional_write_gets_both_a_restore_and_a_respill() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let a = Reg::gpr(1);
    // If the condition fails, the register keeps its old app value, so the
    // app value must be in place before the instruction and re-saved after.
    let block = [Inst::Nop, Inst::CondWrite(a), Inst::Read(a)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
        }
        if i == 2 {
            pt.unreserve_register(cx, InstIx::new(2), a).unwrap();
        }
    });
    // Before: spill tool -> tmp, restore app.  After: spill app, reload tool.
    assert!(matches!(
        sink.at(1)[..],
        [CodeInst::StoreTls { .. }, CodeInst::LoadTls { .. }]
    ));
    assert!(matches!(
        sink.at(2)[..2],
        [CodeInst::StoreTls { .. }, CodeInst::LoadTls { .. }]
    ));
}

#[test]
fn internal_control_flow_disables_lazy_restores() {
    let a = Reg::gpr(1);
    let block = [Inst::Nop, Inst::JmpLocal, Inst::Nop, Inst::Read(a)];

    // With an intra-block branch, an unreserved register is restored before
    // the very next app instruction.
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            let r = pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            pt.unreserve_register(cx, InstIx::new(0), r).unwrap();
        }
    });
    assert!(matches!(
        sink.at(0)[..],
        [CodeInst::StoreTls { .. }, CodeInst::LoadTls { .. }]
    ));

    // The client hint turns laziness back on: the restore waits for the
    // actual app read.
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            pt.set_bb_properties(BbProperties::IGNORE_CONTROL_FLOW).unwrap();
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            let r = pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            pt.unreserve_register(cx, InstIx::new(0), r).unwrap();
        }
    });
    assert!(matches!(sink.at(0)[..], [CodeInst::StoreTls { .. }]));
    assert!(matches!(sink.at(3)[..], [CodeInst::LoadTls { .. }]));
}

#[test]
fn memory_operand_uses_count_double() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let b = Reg::gpr(2);
    let c = Reg::gpr(3);
    // b is used once as an address base (counts double); c once as a plain
    // read.  Both live; the reservation steals the cheaper one.
    let block = [Inst::LoadMem { base: b }, Inst::Read(c), Inst::Nop];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(b, true);
            allowed.set(c, true);
            let r = pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            assert_eq!(r, c);
            pt.unreserve_register(cx, InstIx::new(0), r).unwrap();
        }
    });
}

#[test]
fn reserve_dead_register_fails_without_a_dead_one() {
    let mut pt = make_pt(8, 0);
    let mut sink = Sink::default();
    let block = [Inst::Nop, Inst::Nop];
    pt.analyze_block(&block);
    pt.insert_early(InstIx::new(0));
    let mut cx = BlockCtx::new(&block[..], &mut sink);
    let err = pt.reserve_dead_register(&mut cx, InstIx::new(0), None);
    assert_eq!(err.unwrap_err(), RegMedError::RegConflict);
    // A plain reservation still succeeds by stealing the least-used reg.
    let r = pt.reserve_register(&mut cx, InstIx::new(0), None).unwrap();
    pt.unreserve_register(&mut cx, InstIx::new(0), r).unwrap();
    pt.insert_late(&mut cx, InstIx::new(0)).unwrap();
    pt.insert_early(InstIx::new(1));
    pt.insert_late(&mut cx, InstIx::new(1)).unwrap();
}

#[test]
fn never_spilled_register_has_no_app_value() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let a = Reg::gpr(1);
    let block = [Inst::Nop, Inst::Write(a), Inst::Read(a)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            // Dead at the reservation: nothing was saved, so there is
            // nothing to hand back.
            let err = pt.get_app_value(cx, InstIx::new(0), a, a);
            assert_eq!(err.unwrap_err(), RegMedError::NoAppValue);
        }
        if i == 2 {
            pt.unreserve_register(cx, InstIx::new(2), a).unwrap();
        }
    });
}

#[test]
fn unrestored_register_is_reused_without_a_second_spill() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let a = Reg::gpr(1);
    let block = [Inst::Nop, Inst::Nop, Inst::Read(a)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
        }
        if i == 1 {
            pt.unreserve_register(cx, InstIx::new(1), a).unwrap();
            // Immediately re-reserved: inherits the un-restored slot, and
            // no second spill appears.
            let r = pt.reserve_register(cx, InstIx::new(1), None).unwrap();
            assert_eq!(r, a);
        }
        if i == 2 {
            pt.unreserve_register(cx, InstIx::new(2), a).unwrap();
        }
    });
    let spills = sink.count(|c| matches!(c, CodeInst::StoreTls { .. }));
    assert_eq!(spills, 1);
}

#[test]
fn stack_pointer_and_stolen_register_are_never_chosen() {
    let mut univ = RegUniverse::x64();
    univ.stolen = Some(Reg::gpr(5));
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pt = PerThread::with_config(univ, test_config(20, 0), 8);
    let mut sink = Sink::default();
    // Everything is live at the transfer, so reservations steal the
    // least-used registers, walking the file in order.
    let block = [Inst::Jmp];
    pt.analyze_block(&block);
    pt.insert_early(InstIx::new(0));
    let mut cx = BlockCtx::new(&block[..], &mut sink);
    let mut got = Vec::new();
    for _ in 0..14 {
        got.push(pt.reserve_register(&mut cx, InstIx::new(0), None).unwrap());
    }
    assert!(!got.contains(&Reg::gpr(4)), "stack pointer handed out");
    assert!(!got.contains(&Reg::gpr(5)), "stolen register handed out");
    for r in got {
        pt.unreserve_register(&mut cx, InstIx::new(0), r).unwrap();
    }
    pt.insert_late(&mut cx, InstIx::new(0)).unwrap();
}

#[test]
fn standalone_reservation_restores_immediately() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let b = Reg::gpr(2);
    let window = [Inst::Nop, Inst::Write(b), Inst::Jmp];
    let mut cx = BlockCtx::new(&window[..], &mut sink);
    // Forward scan finds b dead; no code at all for reserve + unreserve.
    let r = pt.reserve_register(&mut cx, InstIx::new(0), None).unwrap();
    assert_eq!(r, b);
    pt.unreserve_register(&mut cx, InstIx::new(0), r).unwrap();
    assert_eq!(cx.sink.items.len(), 0);
    // A live register spills and restores eagerly out here.
    let mut allowed = AllowedSet::none();
    allowed.set(Reg::gpr(3), true);
    let r = pt.reserve_register(&mut cx, InstIx::new(0), Some(&allowed)).unwrap();
    pt.unreserve_register(&mut cx, InstIx::new(0), r).unwrap();
    assert_eq!(sink.items.len(), 2);
}

//=============================================================================
// Flags engine

#[test]
fn dead_flags_reservation_is_free() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    // All arithmetic flags rewritten before the transfer reads them.
    let block = [Inst::Nop, Inst::WriteFlags(AFlags::all()), Inst::Jmp];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            pt.reserve_aflags(cx, InstIx::new(0)).unwrap();
            assert_eq!(pt.aflags_liveness(cx, InstIx::new(0)).unwrap(), AFlags::empty());
            pt.unreserve_aflags(cx, InstIx::new(0)).unwrap();
        }
    });
    assert_eq!(sink.items, vec![]);
}

#[test]
fn flags_round_trip_preserves_the_app_flags() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let block = [Inst::Nop, Inst::Nop, Inst::ReadFlags(AFlags::ZF)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            pt.reserve_aflags(cx, InstIx::new(0)).unwrap();
        }
        if i == 1 {
            pt.unreserve_aflags(cx, InstIx::new(1)).unwrap();
        }
    });
    // The capture parks the flags in the accumulator.
    assert!(sink.count(|c| matches!(c, CodeInst::FlagsToAccum)) == 1);
    assert!(sink.count(|c| matches!(c, CodeInst::FlagsFromAccum)) == 1);

    let mut machine = Machine::fresh();
    machine.flags = (AFlags::CF | AFlags::SF | AFlags::OF).bits() as u64;
    let want = machine.flags;
    let accum = RegUniverse::x64().accumulator;
    let want_accum = machine.gprs[accum.index()];
    let stream = interleave(&block, &sink);
    for op in &stream {
        match op {
            CacheOp::Code(ci) => machine.exec_code(&mut pt, ci),
            CacheOp::App(i) => machine.exec_app(i),
        }
    }
    assert_eq!(machine.flags, want, "app flags damaged by the round trip");
    assert_eq!(machine.gprs[accum.index()], want_accum, "accumulator damaged");
}

#[test]
fn reserving_the_accumulator_evicts_parked_flags_to_slot_zero() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let accum = RegUniverse::x64().accumulator;
    let block = [Inst::Nop, Inst::Write(accum), Inst::ReadFlags(AFlags::ZF)];
    let mut machine = Machine::fresh();
    machine.flags = (AFlags::ZF | AFlags::OF).bits() as u64;
    let want_flags = machine.flags;
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            pt.reserve_aflags(cx, InstIx::new(0)).unwrap();
            // The accumulator was dead, so the capture parks there without
            // saving the old accumulator value anywhere.
            let info = pt.reservation_info_ex(None).unwrap();
            assert_eq!(info.location, ValueLocation::InReg(accum));

            let mut allowed = AllowedSet::none();
            allowed.set(accum, true);
            let r = pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            assert_eq!(r, accum, "the carrier must be evicted and handed out");
            // Eviction moved the captured word to the flags slot.
            let info = pt.reservation_info_ex(None).unwrap();
            assert!(matches!(info.location, ValueLocation::TlsSlot { .. }));
            pt.unreserve_register(cx, InstIx::new(0), r).unwrap();
            pt.unreserve_aflags(cx, InstIx::new(0)).unwrap();
        }
    });
    // The eviction stored the accumulator (carrying the flags) to slot 0.
    let slot0_offs = pt_slot_offs(&pt);
    assert!(sink
        .items
        .iter()
        .any(|(_, c)| matches!(*c, CodeInst::StoreTls { offs, src } if offs == slot0_offs && src == accum)));

    let stream = interleave(&block, &sink);
    for op in &stream {
        match op {
            CacheOp::Code(ci) => machine.exec_code(&mut pt, ci),
            CacheOp::App(i) => machine.exec_app(i),
        }
    }
    assert_eq!(machine.flags, want_flags, "app flags damaged by eviction");
}

#[test]
fn stateless_restore_of_the_carrier_respills_the_flags() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let accum = RegUniverse::x64().accumulator;
    let block = [Inst::Nop, Inst::Nop, Inst::ReadFlags(AFlags::ZF)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            pt.reserve_aflags(cx, InstIx::new(0)).unwrap();
            let (restored, respilled) = pt
                .statelessly_restore_app_value(cx, Some(accum), InstIx::new(0), InstIx::new(0))
                .unwrap();
            assert!(restored);
            assert!(respilled, "the carrier must be reloaded after the call");
            // Still parked as far as the books are concerned.
            let info = pt.reservation_info_ex(None).unwrap();
            assert_eq!(info.location, ValueLocation::InReg(accum));
        }
        if i == 1 {
            pt.unreserve_aflags(cx, InstIx::new(1)).unwrap();
        }
    });
}

//=============================================================================
// Fault rewriting

#[test]
fn fault_rewrite_is_correct_at_every_app_instruction() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let a = Reg::gpr(1);
    let block = [Inst::Read(a), Inst::Write(a), Inst::Read(a)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
        }
        if i == 2 {
            pt.unreserve_register(cx, InstIx::new(2), a).unwrap();
        }
    });

    let stream = interleave(&block, &sink);
    let mut host = Host::new();
    let items = decode(&stream, &host);

    // Reference: the app's view of `a` at each stream position.
    let a0 = Machine::fresh().gprs[a.index()];
    for (k, op) in stream.iter().enumerate() {
        if !matches!(op, CacheOp::App(_)) {
            continue;
        }
        // Execute everything before the fault point.
        let mut m = Machine::fresh();
        let mut expect_a = a0;
        for prior in &stream[..k] {
            match prior {
                CacheOp::Code(ci) => m.exec_code(&mut pt, ci),
                CacheOp::App(i) => {
                    m.exec_app(i);
                    if let Inst::Write(r) = i {
                        if *r == a {
                            expect_a = m.gprs[a.index()];
                        }
                    }
                }
            }
        }
        sync_host(&m, &mut host);
        let mut ctx = Ctx::from(&m);
        assert!(restore_state(&pt, &host, &items, k, &mut ctx));
        assert_eq!(ctx.gprs[a.index()], expect_a, "wrong app value at fault point {}", k);
    }
}

#[test]
fn fault_between_capture_and_release_reconstructs_flags_from_the_carrier() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let block = [Inst::Nop, Inst::Nop, Inst::ReadFlags(AFlags::ZF)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            pt.reserve_aflags(cx, InstIx::new(0)).unwrap();
        }
        if i == 1 {
            pt.unreserve_aflags(cx, InstIx::new(1)).unwrap();
        }
    });

    let stream = interleave(&block, &sink);
    let mut host = Host::new();
    let items = decode(&stream, &host);

    let mut m = Machine::fresh();
    m.flags = (AFlags::ZF | AFlags::OF | AFlags::CF).bits() as u64;
    let want = m.flags;

    // Fault at the second app instruction: the capture ran, the release has
    // not, and the app meanwhile trashed the flags' architectural state...
    let fault_at = stream
        .iter()
        .enumerate()
        .filter(|(_, op)| matches!(op, CacheOp::App(_)))
        .map(|(k, _)| k)
        .nth(1)
        .unwrap();
    for prior in &stream[..fault_at] {
        match prior {
            CacheOp::Code(ci) => m.exec_code(&mut pt, ci),
            CacheOp::App(i) => m.exec_app(i),
        }
    }
    // ...simulate the trashing that instrumentation between the hooks would
    // have done.
    let mut ctx = Ctx::from(&m);
    ctx.flags = 0;
    sync_host(&m, &mut host);
    assert!(restore_state(&pt, &host, &items, fault_at, &mut ctx));
    assert_eq!(ctx.flags & AFlags::all().bits() as u64, want, "flags not rebuilt");
}

#[test]
fn simd_reservation_spills_through_the_indirect_area() {
    let mut pt = make_pt(4, 2);
    let mut sink = Sink::default();
    let x3 = Reg::new(RegClass::SimdXmm, 3);
    let block = [Inst::Nop, Inst::SimdRead(x3), Inst::Nop];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(x3, true);
            let r = pt
                .reserve_register_ex(cx, InstIx::new(0), RegClass::SimdXmm, Some(&allowed))
                .unwrap();
            assert_eq!(r, x3);
        }
        if i == 2 {
            pt.unreserve_register(cx, InstIx::new(2), x3).unwrap();
        }
    });

    // The spill is the two-instruction indirect sequence: pointer load,
    // then an aligned store through it.
    let at0 = sink.at(0);
    let ptr_offs = pt_simd_ptr_offs(&pt);
    let pair = at0.windows(2).find(|w| {
        matches!(w[0], CodeInst::LoadTls { offs, .. } if offs == ptr_offs)
            && matches!(w[1], CodeInst::StoreSimd { .. })
    });
    assert!(pair.is_some(), "no indirect spill pair in {:?}", at0);

    // Fault at the first app instruction: both the scratch GPR and the
    // vector register must come back.
    let stream = interleave(&block, &sink);
    let mut host = Host::new();
    let items = decode(&stream, &host);
    let mut m = Machine::fresh();
    let scratch_orig = m.gprs;
    let x3_orig = m.simds[3];
    let fault_at = stream
        .iter()
        .position(|op| matches!(op, CacheOp::App(_)))
        .unwrap();
    for prior in &stream[..fault_at] {
        match prior {
            CacheOp::Code(ci) => m.exec_code(&mut pt, ci),
            CacheOp::App(i) => m.exec_app(i),
        }
    }
    sync_host(&m, &mut host);
    let mut ctx = Ctx::from(&m);
    assert!(restore_state(&pt, &host, &items, fault_at, &mut ctx));
    assert_eq!(ctx.simds[3], x3_orig, "vector register not rebuilt");
    assert_eq!(ctx.gprs, scratch_orig, "scratch GPR not rebuilt");
}

#[test]
fn classifier_reports_our_spills_and_ignores_foreign_tls() {
    let pt = make_pt(4, 2);
    let host = Host::new();
    let a = Reg::gpr(2);

    let ours = CacheItem {
        raw: Some(RawSlotAccess {
            in_tls: true,
            offs: pt_slot_offs(&pt) + WORD_SIZE,
            reg: a,
            is_store: true,
        }),
        simd: None,
        cap: false,
        rel: false,
        writes: vec![],
    };
    let info = pt.is_instr_spill_or_restore(&host, &ours, None);
    assert!(info.is_spill && !info.is_restore);
    assert_eq!(info.reg, Some(a));

    // A host slot in the addressable range is ours too.
    let host_slot = CacheItem {
        raw: Some(RawSlotAccess {
            in_tls: true,
            offs: host.slot_offs(1),
            reg: a,
            is_store: false,
        }),
        simd: None,
        cap: false,
        rel: false,
        writes: vec![],
    };
    let info = pt.is_instr_spill_or_restore(&host, &host_slot, None);
    assert!(info.is_restore);

    // The host's last addressable slot is left alone: the host itself
    // stores there without paired restores.
    let hidden = CacheItem {
        raw: Some(RawSlotAccess {
            in_tls: true,
            offs: host.slot_offs(host.max_addressable_slot()),
            reg: a,
            is_store: true,
        }),
        simd: None,
        cap: false,
        rel: false,
        writes: vec![],
    };
    let info = pt.is_instr_spill_or_restore(&host, &hidden, None);
    assert!(!info.is_spill && !info.is_restore);

    // Unrelated TLS traffic from another component.
    let foreign = CacheItem {
        raw: Some(RawSlotAccess {
            in_tls: true,
            offs: 0x9000,
            reg: a,
            is_store: true,
        }),
        simd: None,
        cap: false,
        rel: false,
        writes: vec![],
    };
    let info = pt.is_instr_spill_or_restore(&host, &foreign, None);
    assert!(!info.is_spill && !info.is_restore);
}

//=============================================================================
// Host-slot overflow

#[test]
fn direct_slot_exhaustion_falls_back_to_host_slots() {
    // Slot 0 is the flags'; with two direct slots only one GPR fits.
    let mut pt = make_pt(2, 0);
    let mut sink = Sink::default();
    let b = Reg::gpr(2);
    let c = Reg::gpr(3);
    let block = [Inst::Nop, Inst::Nop];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(b, true);
            pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            let mut allowed = AllowedSet::none();
            allowed.set(c, true);
            pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            let info = pt.reservation_info_ex(Some(c)).unwrap();
            assert!(info.is_host_slot, "second register must use a host slot");
            pt.unreserve_register(cx, InstIx::new(0), b).unwrap();
            pt.unreserve_register(cx, InstIx::new(0), c).unwrap();
        }
    });
    assert!(sink.count(|ci| matches!(ci, CodeInst::StoreHostSlot { .. })) >= 1);
    // Host slots are volatile across app instructions, so the value cannot
    // stay there lazily: it must be reloaded before the next instruction.
    assert!(sink.count(|ci| matches!(ci, CodeInst::LoadHostSlot { .. })) >= 1);
}

//=============================================================================
// Reservation info

#[test]
fn reservation_info_reports_the_slot() {
    let mut pt = make_pt(4, 0);
    let mut sink = Sink::default();
    let a = Reg::gpr(1);
    let block = [Inst::Read(a), Inst::Read(a)];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut allowed = AllowedSet::none();
            allowed.set(a, true);
            pt.reserve_register(cx, InstIx::new(0), Some(&allowed)).unwrap();
            let info = pt.reservation_info_ex(Some(a)).unwrap();
            assert!(info.reserved);
            assert!(!info.holds_app_value);
            assert!(info.app_value_retained);
            assert!(!info.is_host_slot);
            match info.location {
                ValueLocation::TlsSlot { offs } => {
                    assert_eq!(offs, pt_slot_offs(pt) + WORD_SIZE)
                }
                other => panic!("unexpected location {:?}", other),
            }
            pt.unreserve_register(cx, InstIx::new(0), a).unwrap();
        }
    });
}

#[test]
fn unreserved_registers_report_unreserved() {
    let pt = make_pt(4, 0);
    let info = pt.reservation_info_ex(Some(Reg::gpr(7))).unwrap();
    assert!(!info.reserved);
    assert!(info.holds_app_value);
    assert_eq!(info.location, ValueLocation::None);
}

//=============================================================================
// Process options

static INIT_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

#[test]
fn init_merges_options_and_counts() {
    let _g = INIT_LOCK.lock();
    let mut host = Host::new();
    init(
        &Options {
            num_gpr_slots: 3,
            num_simd_slots: 2,
            ..Default::default()
        },
        &mut host,
    )
    .unwrap();
    // One hidden extra slot for the flags carrier, plus the request.
    assert_eq!(crate::interface::current_config().num_gpr_slots, 4);

    init(
        &Options {
            num_gpr_slots: 2,
            num_simd_slots: 1,
            conservative: true,
            ..Default::default()
        },
        &mut host,
    )
    .unwrap();
    let cfg = crate::interface::current_config();
    assert_eq!(cfg.num_gpr_slots, 6);
    assert_eq!(cfg.num_simd_slots, 3);
    assert!(cfg.conservative);

    // Max instead of sum when requested.
    init(
        &Options {
            num_gpr_slots: 4,
            num_simd_slots: 9,
            do_not_sum_slots: true,
            ..Default::default()
        },
        &mut host,
    )
    .unwrap();
    let cfg = crate::interface::current_config();
    assert_eq!(cfg.num_gpr_slots, 6);
    assert_eq!(cfg.num_simd_slots, 9);

    exit(&mut host).unwrap();
    exit(&mut host).unwrap();
    exit(&mut host).unwrap();
    // Fully torn down: the record reset for re-attach.
    assert_eq!(crate::interface::current_config().num_gpr_slots, 0);
}

#[test]
fn exit_without_init_is_an_error() {
    let _g = INIT_LOCK.lock();
    let mut host = Host::new();
    assert_eq!(exit(&mut host).unwrap_err(), RegMedError::InvalidParameter);
}

//=============================================================================
// Spill classes

#[test]
fn wide_vector_classes_are_unavailable() {
    let mut pt = make_pt(4, 2);
    let mut sink = Sink::default();
    let block = [Inst::Nop];
    pt.analyze_block(&block);
    pt.insert_early(InstIx::new(0));
    let mut cx = BlockCtx::new(&block[..], &mut sink);
    assert_eq!(
        pt.reserve_register_ex(&mut cx, InstIx::new(0), RegClass::SimdYmm, None)
            .unwrap_err(),
        RegMedError::FeatureNotAvailable
    );
    assert_eq!(
        pt.reserve_register_ex(&mut cx, InstIx::new(0), RegClass::SimdZmm, None)
            .unwrap_err(),
        RegMedError::FeatureNotAvailable
    );
    pt.insert_late(&mut cx, InstIx::new(0)).unwrap();
}

#[test]
fn simd_is_absent_on_architectures_without_it() {
    let mut univ = RegUniverse::x64();
    univ.num_simds = 0;
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pt = PerThread::with_config(univ, test_config(4, 0), 8);
    let mut sink = Sink::default();
    let block = [Inst::Nop];
    pt.analyze_block(&block);
    pt.insert_early(InstIx::new(0));
    let mut cx = BlockCtx::new(&block[..], &mut sink);
    assert_eq!(
        pt.reserve_register_ex(&mut cx, InstIx::new(0), RegClass::SimdXmm, None)
            .unwrap_err(),
        RegMedError::FeatureNotAvailable
    );
    pt.insert_late(&mut cx, InstIx::new(0)).unwrap();
}

//=============================================================================
// Operand rewriting

struct MemOperand {
    regs: Vec<Reg>,
}

impl AppOperand for MemOperand {
    fn regs_used(&self) -> smallvec::SmallVec<[Reg; 4]> {
        self.regs.iter().copied().collect()
    }
    fn replace_reg(&mut self, old: Reg, new: Reg) -> bool {
        let mut hit = false;
        for r in &mut self.regs {
            if *r == old {
                *r = new;
                hit = true;
            }
        }
        hit
    }
}

#[test]
fn restore_app_values_swaps_out_the_stolen_register() {
    let mut univ = RegUniverse::x64();
    let stolen = Reg::gpr(5);
    univ.stolen = Some(stolen);
    let _ = env_logger::builder().is_test(true).try_init();
    let mut pt = PerThread::with_config(univ, test_config(4, 0), 8);
    let mut sink = Sink::default();
    let block = [Inst::Nop, Inst::Nop];
    run_block(&mut pt, &block, &mut sink, |pt, cx, i| {
        if i == 0 {
            let mut opnd = MemOperand {
                regs: vec![stolen, Reg::gpr(6)],
            };
            let mut swap = None;
            pt.restore_app_values(cx, InstIx::new(0), &mut opnd, &mut swap)
                .unwrap();
            let swap_reg = swap.expect("a swap register must have been allocated");
            assert!(opnd.regs.contains(&swap_reg));
            assert!(!opnd.regs.contains(&stolen));
            pt.unreserve_register(cx, InstIx::new(0), swap_reg).unwrap();
        }
    });
    // The stolen register's app value is materialised via the host.
    assert!(sink.count(|ci| matches!(ci, CodeInst::LoadStolenValue { .. })) == 1);
}
