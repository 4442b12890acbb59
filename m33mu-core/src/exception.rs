//! EXC_RETURN encode/decode and exception entry/return.

use crate::cpu::{Cpu, ExceptionFrame, Mode, Security, Xpsr};
use crate::mem::MemoryBus;
use crate::scs::Scs;

pub const VECT_RESET: u16 = 1;
pub const VECT_NMI: u16 = 2;
pub const VECT_HARDFAULT: u16 = 3;
pub const VECT_MEMMANAGE: u16 = 4;
pub const VECT_BUSFAULT: u16 = 5;
pub const VECT_USAGEFAULT: u16 = 6;
pub const VECT_SECUREFAULT: u16 = 7;
pub const VECT_SVCALL: u16 = 11;
pub const VECT_DEBUGMON: u16 = 12;
pub const VECT_PENDSV: u16 = 14;
pub const VECT_SYSTICK: u16 = 15;
pub const VECT_EXTERNAL_BASE: u16 = 16;

/// Decoded `EXC_RETURN` value written to LR on exception entry and matched
/// against a PC write on exception return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcReturn {
    pub target_security: Security,
    pub to_thread: bool,
    pub use_psp: bool,
}

impl ExcReturn {
    /// `value[31:8] == 0xFFFFFF` identifies an EXC_RETURN write to PC.
    pub fn is_exc_return(value: u32) -> bool {
        value >> 8 == 0x00FF_FFFF
    }

    pub fn encode(&self) -> u32 {
        let mut value = 0xFFFF_FF80u32;
        if self.target_security == Security::Secure {
            value |= 1 << 6;
        }
        value |= 1 << 5; // reserved, always 1 on Armv8-M
        value |= 1 << 4; // no-FP-stacking convention (no FPU modelled)
        if self.to_thread {
            value |= 1 << 3;
            if self.use_psp {
                value |= 1 << 2;
            }
        }
        value
    }

    pub fn decode(value: u32) -> Option<Self> {
        if !Self::is_exc_return(value) {
            return None;
        }
        let target_security = if value & (1 << 6) != 0 {
            Security::Secure
        } else {
            Security::NonSecure
        };
        let to_thread = value & (1 << 3) != 0;
        let use_psp = to_thread && value & (1 << 2) != 0;
        Some(ExcReturn {
            target_security,
            to_thread,
            use_psp,
        })
    }
}

/// The BLXNS return-address sentinel. Not a valid `EXC_RETURN` pattern
/// (`[31:8]` does not equal `0xFFFFFF`), so `ExcReturn::is_exc_return`
/// never matches it; only `crate::tz::blxns` produces it.
pub const BLXNS_RETURN_SENTINEL: u32 = 0xDEAD_0001;

/// CFSR/HFSR/SFSR bit layout, one bit constant per named field, matching
/// real Armv8-M silicon.
pub mod fsr_bits {
    // MMFSR (CFSR bits [7:0])
    pub const MM_IACCVIOL: u32 = 0x01;
    pub const MM_DACCVIOL: u32 = 0x02;
    pub const MM_MUNSTKERR: u32 = 0x08;
    pub const MM_MSTKERR: u32 = 0x10;
    pub const MM_MLSPERR: u32 = 0x20;
    pub const MM_MMARVALID: u32 = 0x80;

    // BFSR (CFSR bits [15:8], this module's masks are pre-shifted into place)
    pub const BF_IBUSERR: u32 = 0x01 << 8;
    pub const BF_PRECISERR: u32 = 0x02 << 8;
    pub const BF_IMPRECISERR: u32 = 0x04 << 8;
    pub const BF_UNSTKERR: u32 = 0x08 << 8;
    pub const BF_STKERR: u32 = 0x10 << 8;
    pub const BF_LSPERR: u32 = 0x20 << 8;
    pub const BF_BFARVALID: u32 = 0x80 << 8;

    // UFSR (CFSR bits [31:16])
    pub const UF_UNDEFINSTR: u32 = 0x0001 << 16;
    pub const UF_INVSTATE: u32 = 0x0002 << 16;
    pub const UF_INVPC: u32 = 0x0004 << 16;
    pub const UF_NOCP: u32 = 0x0008 << 16;
    pub const UF_STKOF: u32 = 0x0010 << 16;
    pub const UF_UNALIGNED: u32 = 0x0100 << 16;
    pub const UF_DIVBYZERO: u32 = 0x0200 << 16;

    // HFSR
    pub const HF_VECTTBL: u32 = 0x0000_0002;
    pub const HF_FORCED: u32 = 0x4000_0000;

    // SFSR
    pub const SF_INVEP: u32 = 0x01;
    pub const SF_INVIS: u32 = 0x02;
    pub const SF_INVER: u32 = 0x04;
    pub const SF_AUVIOL: u32 = 0x08;
    pub const SF_INVTRAN: u32 = 0x10;
    pub const SF_LSPERR: u32 = 0x20;
    pub const SF_SFARVALID: u32 = 0x80;
}

/// SHCSR bit layout: one ACT bit per system exception that has one, plus
/// the ENA bits gating MemManage/BusFault/UsageFault/SecureFault delivery.
pub mod shcsr_bits {
    pub const MEMFAULTACT: u32 = 1 << 0;
    pub const BUSFAULTACT: u32 = 1 << 1;
    pub const USGFAULTACT: u32 = 1 << 3;
    pub const SECUREFAULTACT: u32 = 1 << 4; // Secure SHCSR only
    pub const SVCALLACT: u32 = 1 << 7;
    pub const MONITORACT: u32 = 1 << 8;
    pub const PENDSVACT: u32 = 1 << 10;
    pub const SYSTICKACT: u32 = 1 << 11;

    pub const MEMFAULTENA: u32 = 1 << 16;
    pub const BUSFAULTENA: u32 = 1 << 17;
    pub const USGFAULTENA: u32 = 1 << 18;
    pub const SECUREFAULTENA: u32 = 1 << 19; // Secure SHCSR only

    /// Bits firmware may legally set/clear via a direct SHCSR write.
    /// `Scs::write` masks a Non-secure write further, since
    /// SECUREFAULTENA/SECUREFAULTACT don't exist in the Non-secure view.
    pub const WRITABLE: u32 = MEMFAULTACT
        | BUSFAULTACT
        | USGFAULTACT
        | SECUREFAULTACT
        | SVCALLACT
        | MONITORACT
        | PENDSVACT
        | SYSTICKACT
        | MEMFAULTENA
        | BUSFAULTENA
        | USGFAULTENA
        | SECUREFAULTENA;
}

/// The SHCSR ACT bit set on entry to (and cleared on return from)
/// `vector`, or `None` for exceptions SHCSR doesn't track (HardFault, NMI,
/// externally-routed IRQs -- those live in the NVIC's own active bits).
fn act_bit_for(vector: u16) -> Option<u32> {
    match vector {
        VECT_MEMMANAGE => Some(shcsr_bits::MEMFAULTACT),
        VECT_BUSFAULT => Some(shcsr_bits::BUSFAULTACT),
        VECT_USAGEFAULT => Some(shcsr_bits::USGFAULTACT),
        VECT_SECUREFAULT => Some(shcsr_bits::SECUREFAULTACT),
        VECT_SVCALL => Some(shcsr_bits::SVCALLACT),
        VECT_PENDSV => Some(shcsr_bits::PENDSVACT),
        VECT_SYSTICK => Some(shcsr_bits::SYSTICKACT),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FaultKind {
    MemManage,
    BusFault,
    UsageFault,
    SecureFault,
    HardFault,
}

/// Outcome of attempting exception entry: whether stacking succeeded, and
/// whether it escalated to HardFault (stacking failures always escalate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Entered,
    EscalatedToHardFault,
}

/// Performs hardware stacking and vectors to `exception_number`'s handler.
///
/// `handler_security` selects which VTOR bank supplies the handler address
/// and which side takes Handler mode; for system exceptions this is always
/// the current security, for externally-routed IRQs it is chosen by ITNS.
/// `return_pc` is the address stacked for eventual `EXC_RETURN`: for IRQs
/// dispatched between instructions this is `cpu.pc` unchanged, for a
/// synchronous trap or fault raised while executing an instruction it is
/// that instruction's address plus its encoded length.
pub fn enter(
    cpu: &mut Cpu,
    mem: &mut MemoryBus,
    scs: &mut Scs,
    exception_number: u16,
    handler_security: Security,
    return_pc: u32,
) -> EntryOutcome {
    let preempted_security = cpu.security;
    let preempted_mode = cpu.mode;
    let used_psp = preempted_mode == Mode::Thread && cpu.bank(preempted_security).control_spsel;

    let frame = [
        cpu.regs[0],
        cpu.regs[1],
        cpu.regs[2],
        cpu.regs[3],
        cpu.regs[12],
        cpu.regs[14],
        return_pc | 1,
        cpu.xpsr.encode() | 0x0100_0000,
    ];

    let sp_before = cpu.active_sp();
    let new_sp = sp_before.wrapping_sub(32);
    let mut stacked_ok = true;
    for (i, word) in frame.iter().enumerate() {
        if !mem_store_word(mem, new_sp + (i as u32) * 4, *word) {
            stacked_ok = false;
            break;
        }
    }
    if !stacked_ok {
        return EntryOutcome::EscalatedToHardFault;
    }
    if !cpu.set_active_sp(new_sp) {
        return EntryOutcome::EscalatedToHardFault;
    }

    if !cpu.push_exception_frame(ExceptionFrame {
        exception_number,
        sp: new_sp,
        used_psp,
        security: preempted_security,
        handler_security,
    }) {
        return EntryOutcome::EscalatedToHardFault;
    }

    if let Some(bit) = act_bit_for(exception_number) {
        scs.faults_mut(handler_security).shcsr |= bit;
    }

    cpu.mode = Mode::Handler;
    cpu.security = handler_security;

    let mut xpsr = Xpsr {
        n: cpu.xpsr.n,
        z: cpu.xpsr.z,
        c: cpu.xpsr.c,
        v: cpu.xpsr.v,
        q: cpu.xpsr.q,
        ge: cpu.xpsr.ge,
        ipsr: exception_number,
        it: Default::default(),
    };
    std::mem::swap(&mut cpu.xpsr, &mut xpsr);

    // R13 is derived from `active_sp()`, which now reads the handler-side
    // MSP because `cpu.mode` is `Handler`; no explicit write needed here.

    let exc_return = ExcReturn {
        target_security: preempted_security,
        to_thread: preempted_mode == Mode::Thread,
        use_psp: used_psp,
    };
    cpu.regs[14] = exc_return.encode();

    EntryOutcome::Entered
}

/// Unwinds an exception return triggered by writing an `EXC_RETURN` value
/// to PC. Pops the matching frame off the exception-entry ring when
/// available; falls back to the architectural SP selection otherwise.
pub fn exc_return(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs, value: u32) -> bool {
    let decoded = match ExcReturn::decode(value) {
        Some(d) => d,
        None => return false,
    };

    let frame_record = cpu.pop_exception_frame();
    let sp = frame_record.map(|f| f.sp).unwrap_or_else(|| cpu.active_sp());

    if let Some(frame) = frame_record {
        if let Some(bit) = act_bit_for(frame.exception_number) {
            scs.faults_mut(frame.handler_security).shcsr &= !bit;
        }
    }

    let mut words = [0u32; 8];
    for (i, word) in words.iter_mut().enumerate() {
        match mem_load_word(mem, sp + (i as u32) * 4) {
            Some(w) => *word = w,
            None => return false,
        }
    }

    cpu.regs[0] = words[0];
    cpu.regs[1] = words[1];
    cpu.regs[2] = words[2];
    cpu.regs[3] = words[3];
    cpu.regs[12] = words[4];
    cpu.regs[14] = words[5];
    cpu.pc = words[6] | 1;
    let mut xpsr = Xpsr::decode(words[7]);
    if decoded.to_thread {
        xpsr.ipsr = 0;
    }
    cpu.xpsr = xpsr;

    cpu.security = decoded.target_security;
    cpu.mode = if decoded.to_thread {
        Mode::Thread
    } else {
        Mode::Handler
    };
    if decoded.to_thread {
        cpu.bank_mut(decoded.target_security).control_spsel = decoded.use_psp;
    }
    let _ = cpu.set_active_sp(sp.wrapping_add(32));
    true
}

fn mem_store_word(mem: &mut MemoryBus, addr: u32, value: u32) -> bool {
    mem.raw_write(addr, 4, value)
}

fn mem_load_word(mem: &mut MemoryBus, addr: u32) -> Option<u32> {
    mem.raw_read(addr, 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Cpu;
    use crate::mem::MemoryBus;
    use crate::scs::Scs;

    fn test_bus() -> MemoryBus {
        let mut mem = MemoryBus::new(0x0C00_0000, 0x0000_0000, 0x1000);
        mem.add_ram_bank(0x3000_0000, 0x2000_0000, 0x1000);
        mem
    }

    #[test]
    fn exc_return_encode_decode_round_trips() {
        for raw in [
            0xFFFF_FFF9u32,
            0xFFFF_FFF1,
            0xFFFF_FFFD,
            0xFFFF_FFB9,
            0xFFFF_FFB1,
            0xFFFF_FFBD,
        ] {
            let decoded = ExcReturn::decode(raw).unwrap();
            assert_eq!(decoded.encode(), raw, "mismatch for {raw:#010x}");
        }
    }

    #[test]
    fn blxns_sentinel_is_not_an_exc_return() {
        assert!(!ExcReturn::is_exc_return(BLXNS_RETURN_SENTINEL));
    }

    #[test]
    fn entry_then_return_restores_context() {
        let mut cpu = Cpu::default();
        let mut mem = test_bus();
        let mut scs = Scs::new(16);
        cpu.secure.psp = 0x2000_0800;
        cpu.secure.control_spsel = true;
        cpu.mode = Mode::Thread;
        cpu.security = Security::Secure;
        cpu.pc = 0x0C00_1000 | 1;
        cpu.regs[0] = 0x11;
        cpu.regs[14] = 0xAAAA_AAAA;

        let return_pc = cpu.pc;
        let outcome = enter(&mut cpu, &mut mem, &mut scs, VECT_SVCALL, Security::Secure, return_pc);
        assert!(matches!(outcome, EntryOutcome::Entered));
        assert_eq!(cpu.mode, Mode::Handler);
        assert_eq!(cpu.xpsr.ipsr, VECT_SVCALL);
        assert_eq!(cpu.regs[14], 0xFFFF_FFFD);
        assert_eq!(cpu.active_sp(), 0x2000_0800 - 32);
        assert_ne!(scs.faults(Security::Secure).shcsr & shcsr_bits::SVCALLACT, 0);

        let lr = cpu.regs[14];
        cpu.regs[0] = 0; // clobbered by the handler
        assert!(exc_return(&mut cpu, &mut mem, &mut scs, lr));
        assert_eq!(cpu.mode, Mode::Thread);
        assert_eq!(cpu.security, Security::Secure);
        assert_eq!(cpu.regs[0], 0x11);
        assert_eq!(cpu.pc, 0x0C00_1000 | 1);
        assert_eq!(cpu.active_sp(), 0x2000_0800);
        assert_eq!(scs.faults(Security::Secure).shcsr & shcsr_bits::SVCALLACT, 0);
    }
}
