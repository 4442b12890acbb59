//! The fetch/decode/execute loop: exception dispatch, IT-block predication,
//! SysTick advancement, and WFI/WFE sleep. Shaped as pick-next-work,
//! run-it, service-pending-interrupts, sleep-if-idle, run once per
//! instruction boundary.

use crate::cpu::{Cpu, Mode, Security};
use crate::decode::{self, Kind};
use crate::exception;
use crate::exec::{self, ExecOutcome};
use crate::mem::MemoryBus;
use crate::scs::Scs;

/// One full instruction step: service a pending exception if one is
/// eligible, otherwise fetch/decode/execute at the current PC.
///
/// Returns `false` when the CPU is sleeping (`WFI`/`WFE`) and no event
/// woke it, so the caller can advance virtual time without burning a step.
pub fn step(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs) -> bool {
    if scs.reset_requested {
        reset_to_vector(cpu, mem, scs);
        scs.reset_requested = false;
        return true;
    }

    if dispatch_pending_exception(cpu, mem, scs) {
        return true;
    }

    if cpu.sleeping {
        return false;
    }

    execute_one(cpu, mem, scs);
    true
}

/// Advances SysTick by one tick; called once per scheduler iteration
/// regardless of whether an instruction retired, so a sleeping core's
/// SysTick keeps counting. On wrap this only latches `scs.pend_st`;
/// [`dispatch_pending_exception`] arbitrates it against NVIC IRQs and
/// PendSV at the next step boundary rather than entering immediately, so a
/// higher-priority pending exception isn't preempted by SysTick.
pub fn tick_systick(cpu: &mut Cpu, _mem: &mut MemoryBus, scs: &mut Scs) {
    let wrapped = scs.systick.advance(1);
    if wrapped && scs.systick.tickint {
        scs.pend_st = true;
        cpu.sleeping = false;
        cpu.event_pending = true;
    }
}

fn execute_one(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs) {
    let pc = cpu.pc & !1;
    let hw1 = match exec::gated_fetch16(cpu, mem, scs, pc) {
        Some(v) => v,
        None => {
            deliver_fetch_fault(cpu, mem, scs, pc);
            return;
        }
    };
    let needs_hw2 = decode::is_32bit_prefix(hw1);
    let hw2 = if needs_hw2 {
        match exec::gated_fetch16(cpu, mem, scs, pc.wrapping_add(2)) {
            Some(v) => Some(v),
            None => {
                deliver_fetch_fault(cpu, mem, scs, pc.wrapping_add(2));
                return;
            }
        }
    } else {
        None
    };

    let dec = decode::decode(hw1, hw2);

    let skip = cpu.it.active() && !condition_matches(cpu, cpu.it.current_condition());
    let it_was_active = cpu.it.active();

    let outcome = if skip {
        ExecOutcome::Continue
    } else {
        exec::execute(cpu, mem, scs, &dec)
    };

    if outcome == ExecOutcome::Continue {
        let advanced_pc_itself = matches!(
            dec.kind,
            Kind::B | Kind::Bl
                | Kind::Bx
                | Kind::Blx
                | Kind::BCond
                | Kind::Cbz
                | Kind::Cbnz
                | Kind::Tbb
                | Kind::Tbh
                | Kind::Sg
                | Kind::Bxns
                | Kind::Blxns
        );
        let pc_unchanged = cpu.pc & !1 == pc;
        if !advanced_pc_itself && pc_unchanged {
            cpu.pc = pc.wrapping_add(dec.len as u32) | 1;
        }
        if it_was_active && dec.kind != Kind::It {
            cpu.it.advance();
        }
    }
}

fn condition_matches(cpu: &Cpu, cond: u8) -> bool {
    let (n, z, c, v) = (cpu.xpsr.n, cpu.xpsr.z, cpu.xpsr.c, cpu.xpsr.v);
    let base = match cond >> 1 {
        0b000 => z,
        0b001 => c,
        0b010 => n,
        0b011 => v,
        0b100 => c && !z,
        0b101 => n == v,
        0b110 => n == v && !z,
        _ => true,
    };
    base ^ (cond & 1 != 0 && cond != 0b1111)
}

fn deliver_fetch_fault(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs, _addr: u32) {
    // `access_gate` already recorded the specific fault inside
    // `gated_fetch16`; this just vectors to whichever handler is live.
    let handler_security = cpu.security;
    exception::enter(cpu, mem, scs, exception::VECT_MEMMANAGE, handler_security, cpu.pc);
}

/// SysTick and PendSV have no SHPR3 backing in this model, so they
/// arbitrate at these fixed priorities: SysTick at the top, PendSV at the
/// bottom, matching the usual convention of giving PendSV the lowest
/// priority so it only runs once nothing else wants the core.
const SYSTICK_PRIORITY: u8 = 0x00;
const PENDSV_PRIORITY: u8 = 0xFF;

enum PendingException {
    SysTick,
    Irq(usize),
    PendSv,
}

impl PendingException {
    fn vector(&self) -> u16 {
        match self {
            PendingException::SysTick => exception::VECT_SYSTICK,
            PendingException::Irq(irq) => exception::VECT_EXTERNAL_BASE + *irq as u16,
            PendingException::PendSv => exception::VECT_PENDSV,
        }
    }

    fn target(&self, cpu: &Cpu, scs: &Scs) -> Security {
        match self {
            PendingException::Irq(irq) => scs.nvic.target_security(*irq),
            PendingException::SysTick | PendingException::PendSv => cpu.security,
        }
    }
}

fn is_higher_priority(priority: u8, order: u8, best: &Option<(u8, u8, PendingException)>) -> bool {
    match best {
        None => true,
        Some((best_priority, best_order, _)) => (priority, order) < (*best_priority, *best_order),
    }
}

/// Picks the highest-priority pending exception among SysTick, the NVIC's
/// externally-routed IRQs, and PendSV (lower numeric priority wins; ties
/// broken SysTick, then IRQ, then PendSV).
fn next_pending_exception(scs: &Scs) -> Option<(PendingException, u8)> {
    let mut best: Option<(u8, u8, PendingException)> = None;

    if scs.pend_st && is_higher_priority(SYSTICK_PRIORITY, 0, &best) {
        best = Some((SYSTICK_PRIORITY, 0, PendingException::SysTick));
    }
    if let Some(irq) = scs.nvic.select() {
        let priority = scs.nvic.get(irq).map(|s| s.priority).unwrap_or(0);
        if is_higher_priority(priority, 1, &best) {
            best = Some((priority, 1, PendingException::Irq(irq)));
        }
    }
    if scs.pend_sv && is_higher_priority(PENDSV_PRIORITY, 2, &best) {
        best = Some((PENDSV_PRIORITY, 2, PendingException::PendSv));
    }
    best.map(|(priority, _, candidate)| (candidate, priority))
}

/// Selects and dispatches the highest-priority eligible pending exception,
/// honouring PRIMASK/FAULTMASK/BASEPRI of the *target* security state.
fn dispatch_pending_exception(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs) -> bool {
    let (candidate, priority) = match next_pending_exception(scs) {
        Some(c) => c,
        None => return false,
    };
    let target = candidate.target(cpu, scs);
    if exception_masked(cpu, target, priority) {
        return false;
    }

    match candidate {
        PendingException::SysTick => scs.pend_st = false,
        PendingException::Irq(irq) => {
            scs.nvic.set_pending(irq, false);
            scs.nvic.set_active(irq, true);
        }
        PendingException::PendSv => scs.pend_sv = false,
    }

    let vector = candidate.vector();
    let entered = exception::enter(cpu, mem, scs, vector, target, cpu.pc);
    if entered == exception::EntryOutcome::EscalatedToHardFault {
        scs.raise_hardfault(cpu.security);
        let _ = exception::enter(cpu, mem, scs, exception::VECT_HARDFAULT, cpu.security, cpu.pc);
    }
    cpu.sleeping = false;
    true
}

fn exception_masked(cpu: &Cpu, target: Security, priority: u8) -> bool {
    let bank = cpu.bank(target);
    bank.faultmask || bank.primask || (bank.basepri != 0 && priority >= bank.basepri)
}

fn reset_to_vector(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs) {
    cpu.reset();
    scs.reset_registers();
    // VTOR resets to the boot vector table's base, which for this emulator
    // is always Secure flash's base address (no separate boot ROM modelled).
    scs.set_vtor(Security::Secure, mem.flash_base_s);
    let vtor = scs.vtor(Security::Secure);
    let initial_sp = mem.raw_read(vtor, 4).unwrap_or(0);
    let initial_pc = mem.raw_read(vtor.wrapping_add(4), 4).unwrap_or(0);
    cpu.secure.msp = initial_sp;
    cpu.mode = Mode::Thread;
    cpu.security = Security::Secure;
    cpu.pc = initial_pc | 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocConfig;

    fn harness() -> (Cpu, MemoryBus, Scs) {
        let cfg = SocConfig::generic();
        let mut mem = MemoryBus::new(cfg.flash_base_s, cfg.flash_base_ns, cfg.flash_size);
        for bank in &cfg.ram_banks {
            mem.add_ram_bank(bank.base_s, bank.base_ns, bank.size);
        }
        (Cpu::default(), mem, Scs::new(cfg.num_irq))
    }

    #[test]
    fn reset_vector_boot_loads_sp_and_pc() {
        let (mut cpu, mut mem, mut scs) = harness();
        mem.flash_writable = true;
        mem.raw_write(0x0C00_0000, 4, 0x2000_8000);
        mem.raw_write(0x0C00_0004, 4, 0x0C00_1000);
        scs.reset_requested = true;
        assert!(step(&mut cpu, &mut mem, &mut scs));
        assert_eq!(cpu.secure.msp, 0x2000_8000);
        assert_eq!(cpu.pc, 0x0C00_1000 | 1);
        assert_eq!(cpu.security, Security::Secure);
    }

    #[test]
    fn fetch_decode_execute_advances_pc_by_instruction_length() {
        let (mut cpu, mut mem, mut scs) = harness();
        mem.flash_writable = true;
        // MOVS r0, #5 at the reset vector's target.
        mem.raw_write(0x0C00_0000, 4, 0x2000_0000);
        mem.raw_write(0x0C00_0004, 4, 0x0C00_1000);
        mem.raw_write(0x0C00_1000, 2, 0x2005);
        scs.reset_requested = true;
        step(&mut cpu, &mut mem, &mut scs);
        step(&mut cpu, &mut mem, &mut scs);
        assert_eq!(cpu.regs[0], 5);
        assert_eq!(cpu.pc, (0x0C00_1000 + 2) | 1);
    }

    #[test]
    fn wfi_sleeps_until_pending_irq() {
        let (mut cpu, mut mem, mut scs) = harness();
        cpu.sleeping = true;
        assert!(!step(&mut cpu, &mut mem, &mut scs));
        scs.nvic.set_enabled(0, true);
        scs.nvic.set_pending(0, true);
        scs.vtor[0] = 0x0C00_0000;
        mem.flash_writable = true;
        mem.raw_write(0x0C00_0000 + 16 * 4, 4, 0x0C00_2000);
        assert!(step(&mut cpu, &mut mem, &mut scs));
        assert_eq!(cpu.mode, Mode::Handler);
    }

    #[test]
    fn pendsv_enters_handler_when_set() {
        let (mut cpu, mut mem, mut scs) = harness();
        scs.vtor[0] = 0x0C00_0000;
        mem.flash_writable = true;
        mem.raw_write(0x0C00_0000 + 14 * 4, 4, 0x0C00_2000);
        scs.pend_sv = true;
        assert!(step(&mut cpu, &mut mem, &mut scs));
        assert_eq!(cpu.mode, Mode::Handler);
        assert_eq!(cpu.xpsr.ipsr, exception::VECT_PENDSV);
        assert!(!scs.pend_sv);
    }

    #[test]
    fn systick_outranks_pendsv_when_both_pending() {
        let (mut cpu, mut mem, mut scs) = harness();
        scs.vtor[0] = 0x0C00_0000;
        mem.flash_writable = true;
        mem.raw_write(0x0C00_0000 + 15 * 4, 4, 0x0C00_2000);
        mem.raw_write(0x0C00_0000 + 14 * 4, 4, 0x0C00_3000);
        scs.pend_sv = true;
        scs.pend_st = true;
        assert!(step(&mut cpu, &mut mem, &mut scs));
        assert_eq!(cpu.xpsr.ipsr, exception::VECT_SYSTICK);
        assert!(scs.pend_sv);
        assert!(!scs.pend_st);
    }

    #[test]
    fn basepri_masks_irq_at_or_below_threshold() {
        let (mut cpu, mut mem, mut scs) = harness();
        cpu.sleeping = true;
        scs.vtor[0] = 0x0C00_0000;
        mem.flash_writable = true;
        mem.raw_write(0x0C00_0000 + 16 * 4, 4, 0x0C00_2000);
        scs.nvic.set_enabled(0, true);
        scs.nvic.set_pending(0, true);
        scs.nvic.set_priority(0, 0x80);
        cpu.secure.basepri = 0x40;
        assert!(!step(&mut cpu, &mut mem, &mut scs));
        assert_eq!(cpu.mode, Mode::Thread);

        cpu.secure.basepri = 0x90;
        assert!(step(&mut cpu, &mut mem, &mut scs));
        assert_eq!(cpu.mode, Mode::Handler);
    }
}
