//! Instruction execution: one handler per [`crate::decode::Kind`], mutating
//! CPU and memory through the gated bus.
//!
//! Organised as a table-of-handlers (a `match` compiled to a jump table)
//! rather than one enormous branch tree, per the Design Notes: each handler
//! takes the same `(cpu, mem, scs, dec)` tuple and returns an [`ExecOutcome`].

use crate::bits::{
    add_with_carry, bfc as bfc_op, bfi as bfi_op, clz, rbit, rev, rev16, revsh, sbfx, shift_c,
    thumb_expand_imm_c, ubfx, ShiftType,
};
use crate::cpu::Cpu;
use crate::decode::{Decoded, Kind, REG_NONE};
use crate::exception::{self, fsr_bits, ExcReturn};
use crate::mem::{AccessContext, AccessKind, MemoryBus};
use crate::scs::{self, Scs};
use crate::tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Continue,
    /// A fault was raised (and, where architectural, delivered); the
    /// scheduler should not advance ITSTATE/SysTick bookkeeping twice.
    Faulted,
}

/// Reads register `n`, treating PC reads as the architectural `pc + 4`
/// (the "fetch address" convention used throughout Thumb encodings).
fn read_reg_pc4(cpu: &Cpu, n: u8) -> u32 {
    if n == 15 {
        (cpu.pc & !1).wrapping_add(4)
    } else {
        cpu.read_reg(n)
    }
}

fn set_nz(cpu: &mut Cpu, result: u32) {
    cpu.xpsr.n = (result as i32) < 0;
    cpu.xpsr.z = result == 0;
}

fn set_nzcv(cpu: &mut Cpu, result: u32, carry: bool, overflow: bool) {
    set_nz(cpu, result);
    cpu.xpsr.c = carry;
    cpu.xpsr.v = overflow;
}

fn set_nzc(cpu: &mut Cpu, result: u32, carry: bool) {
    set_nz(cpu, result);
    cpu.xpsr.c = carry;
}

/// Centralised PC write: detects `EXC_RETURN` and the BLXNS sentinel before
/// falling back to an ordinary branch.
fn write_pc(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs, value: u32) -> ExecOutcome {
    if ExcReturn::is_exc_return(value) {
        if exception::exc_return(cpu, mem, scs, value) {
            return ExecOutcome::Continue;
        }
        return ExecOutcome::Faulted;
    }
    if tz::try_return_from_blxns(cpu, value) {
        return ExecOutcome::Continue;
    }
    cpu.pc = value | 1;
    ExecOutcome::Continue
}

fn raise_undefined(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs, dec: &Decoded) -> ExecOutcome {
    scs.raise_usagefault(cpu.security, fsr_bits::UF_UNDEFINSTR);
    deliver_sync_fault(cpu, mem, scs, exception::VECT_USAGEFAULT, dec);
    ExecOutcome::Faulted
}

/// `return_pc` for a synchronous trap/fault is always "the instruction
/// after the one that raised it" -- for `SVC`/`BKPT` that is the normal
/// call-return address, and faults are modelled as completing the
/// instruction boundary rather than re-executing it.
fn next_pc(cpu: &Cpu, dec: &Decoded) -> u32 {
    (cpu.pc & !1).wrapping_add(dec.len as u32)
}

fn deliver_sync_fault(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs, vector: u16, dec: &Decoded) {
    let handler_security = cpu.security;
    let handler_masked = match vector {
        v if v == exception::VECT_MEMMANAGE => scs.faults(handler_security).shcsr & (1 << 16) == 0,
        v if v == exception::VECT_BUSFAULT => scs.faults(handler_security).shcsr & (1 << 17) == 0,
        v if v == exception::VECT_USAGEFAULT => scs.faults(handler_security).shcsr & (1 << 18) == 0,
        _ => false,
    };
    let vector = if handler_masked {
        scs.raise_hardfault(handler_security);
        exception::VECT_HARDFAULT
    } else {
        vector
    };
    let return_pc = next_pc(cpu, dec);
    exception::enter(cpu, mem, scs, vector, handler_security, return_pc);
}

fn gated_read(
    cpu: &Cpu,
    mem: &mut MemoryBus,
    scs: &mut Scs,
    addr: u32,
    size: u8,
) -> Option<u32> {
    if scs::is_scs_window(addr) {
        return scs::scs_read(scs, cpu, addr, size);
    }
    let ctx = AccessContext {
        security: cpu.security,
        kind: AccessKind::Read,
    };
    if !scs.access_gate(cpu.security, ctx, addr, size) {
        return None;
    }
    mem.raw_read(addr, size)
}

fn gated_write(
    cpu: &Cpu,
    mem: &mut MemoryBus,
    scs: &mut Scs,
    addr: u32,
    size: u8,
    value: u32,
) -> bool {
    if scs::is_scs_window(addr) {
        return scs::scs_write(scs, cpu, addr, size, value);
    }
    let ctx = AccessContext {
        security: cpu.security,
        kind: AccessKind::Write,
    };
    if !scs.access_gate(cpu.security, ctx, addr, size) {
        return false;
    }
    mem.raw_write(addr, size, value)
}

pub fn gated_fetch16(cpu: &Cpu, mem: &mut MemoryBus, scs: &mut Scs, addr: u32) -> Option<u16> {
    let ctx = AccessContext {
        security: cpu.security,
        kind: AccessKind::Fetch,
    };
    if !scs.access_gate(cpu.security, ctx, addr, 2) {
        return None;
    }
    mem.raw_read(addr, 2).map(|v| v as u16)
}

/// Dispatches one decoded instruction. `cpu.pc` must still hold the
/// address of `dec` itself (the scheduler advances it by `dec.len` only
/// after a `Continue` outcome that didn't already overwrite PC); handlers
/// that need "the next instruction's address" -- `BL`/`BLXNS` return
/// addresses, synchronous fault stacking -- compute it via [`next_pc`].
pub fn execute(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs, dec: &Decoded) -> ExecOutcome {
    use Kind::*;
    match dec.kind {
        Undefined => return raise_undefined(cpu, mem, scs, dec),

        MovImm => {
            let (value, carry) = thumb_expand_imm_c(dec.imm, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, value);
            if dec.set_flags {
                set_nzc(cpu, value, carry);
            }
        }
        Movw => cpu.write_reg_plain(dec.rd, dec.imm),
        Movt => {
            let lo = cpu.read_reg(dec.rd) & 0xFFFF;
            cpu.write_reg_plain(dec.rd, (dec.imm << 16) | lo);
        }
        MvnImm => {
            let (value, carry) = thumb_expand_imm_c(dec.imm, cpu.xpsr.c);
            let value = !value;
            cpu.write_reg_plain(dec.rd, value);
            if dec.set_flags {
                set_nzc(cpu, value, carry);
            }
        }
        MvnReg => {
            let value = !read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, value);
            if dec.set_flags {
                set_nzc(cpu, value, cpu.xpsr.c);
            }
        }
        MovReg => {
            let value = read_reg_pc4(cpu, dec.rm);
            if dec.rd == 15 {
                return write_pc(cpu, mem, scs, value);
            }
            cpu.write_reg_plain(dec.rd, value);
            if dec.set_flags {
                set_nz(cpu, value);
            }
        }

        AddImm => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let (result, carry, overflow) = add_with_carry(rn, dec.imm, false);
            if dec.rd == 15 {
                return write_pc(cpu, mem, scs, result);
            }
            if dec.rd == 13 {
                if !cpu.set_active_sp(result) {
                    return stack_overflow(cpu, mem, scs, dec);
                }
            } else {
                cpu.write_reg_plain(dec.rd, result);
            }
            if dec.set_flags {
                set_nzcv(cpu, result, carry, overflow);
            }
        }
        AddReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let (result, carry, overflow) = add_with_carry(rn, rm, false);
            if dec.rd == 15 {
                return write_pc(cpu, mem, scs, result);
            }
            if dec.rd == 13 {
                if !cpu.set_active_sp(result) {
                    return stack_overflow(cpu, mem, scs, dec);
                }
            } else {
                cpu.write_reg_plain(dec.rd, result);
            }
            if dec.set_flags {
                set_nzcv(cpu, result, carry, overflow);
            }
        }
        AddSpImm => {
            let sp = cpu.active_sp();
            let (result, carry, overflow) = add_with_carry(sp, dec.imm, false);
            if !cpu.set_active_sp(result) {
                return stack_overflow(cpu, mem, scs, dec);
            }
            if dec.set_flags {
                set_nzcv(cpu, result, carry, overflow);
            }
        }
        SubSpImm => {
            let sp = cpu.active_sp();
            let (result, carry, overflow) = add_with_carry(sp, !dec.imm, true);
            if !cpu.set_active_sp(result) {
                return stack_overflow(cpu, mem, scs, dec);
            }
            if dec.set_flags {
                set_nzcv(cpu, result, carry, overflow);
            }
        }
        SubImm => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let (result, carry, overflow) = add_with_carry(rn, !dec.imm, true);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzcv(cpu, result, carry, overflow);
            }
        }
        SubReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let (result, carry, overflow) = add_with_carry(rn, !rm, true);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzcv(cpu, result, carry, overflow);
            }
        }
        RsbImm => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let (result, carry, overflow) = add_with_carry(!rn, dec.imm, true);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzcv(cpu, result, carry, overflow);
            }
        }
        AdcReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let (result, carry, overflow) = add_with_carry(rn, rm, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzcv(cpu, result, carry, overflow);
            }
        }
        SbcReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let (result, carry, overflow) = add_with_carry(rn, !rm, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzcv(cpu, result, carry, overflow);
            }
        }

        AndImm => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let (imm, carry) = thumb_expand_imm_c(dec.imm, cpu.xpsr.c);
            let result = rn & imm;
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        AndReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let result = rn & rm;
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nz(cpu, result);
            }
        }
        OrrImm => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let (imm, carry) = thumb_expand_imm_c(dec.imm, cpu.xpsr.c);
            let result = rn | imm;
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        OrrReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let result = rn | rm;
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nz(cpu, result);
            }
        }
        OrnReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let result = rn | !rm;
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nz(cpu, result);
            }
        }
        EorImm => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let (imm, carry) = thumb_expand_imm_c(dec.imm, cpu.xpsr.c);
            let result = rn ^ imm;
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        EorReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let result = rn ^ rm;
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nz(cpu, result);
            }
        }
        BicImm => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let (imm, carry) = thumb_expand_imm_c(dec.imm, cpu.xpsr.c);
            let result = rn & !imm;
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        BicReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let result = rn & !rm;
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nz(cpu, result);
            }
        }
        TstReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            set_nz(cpu, rn & rm);
        }
        TeqReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            set_nz(cpu, rn ^ rm);
        }
        CmpImm => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let (result, carry, overflow) = add_with_carry(rn, !dec.imm, true);
            set_nzcv(cpu, result, carry, overflow);
        }
        CmpReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let (result, carry, overflow) = add_with_carry(rn, !rm, true);
            set_nzcv(cpu, result, carry, overflow);
        }
        CmnReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let (result, carry, overflow) = add_with_carry(rn, rm, false);
            set_nzcv(cpu, result, carry, overflow);
        }

        LslImm => {
            let rm = read_reg_pc4(cpu, dec.rm);
            let (result, carry) = shift_c(rm, ShiftType::Lsl, dec.imm, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        LsrImm => {
            let rm = read_reg_pc4(cpu, dec.rm);
            let amount = if dec.imm == 0 { 32 } else { dec.imm };
            let (result, carry) = shift_c(rm, ShiftType::Lsr, amount, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        AsrImm => {
            let rm = read_reg_pc4(cpu, dec.rm);
            let amount = if dec.imm == 0 { 32 } else { dec.imm };
            let (result, carry) = shift_c(rm, ShiftType::Asr, amount, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        LslReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let amount = read_reg_pc4(cpu, dec.rm) & 0xFF;
            let (result, carry) = shift_c(rn, ShiftType::Lsl, amount, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        LsrReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let amount = read_reg_pc4(cpu, dec.rm) & 0xFF;
            let (result, carry) = shift_c(rn, ShiftType::Lsr, amount, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        AsrReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let amount = read_reg_pc4(cpu, dec.rm) & 0xFF;
            let (result, carry) = shift_c(rn, ShiftType::Asr, amount, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }
        RorReg => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let amount = read_reg_pc4(cpu, dec.rm) & 0xFF;
            let (result, carry) = shift_c(rn, ShiftType::Ror, amount, cpu.xpsr.c);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nzc(cpu, result, carry);
            }
        }

        Mul => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let result = rn.wrapping_mul(rm);
            cpu.write_reg_plain(dec.rd, result);
            if dec.set_flags {
                set_nz(cpu, result);
            }
        }
        Mla => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let ra = read_reg_pc4(cpu, dec.ra);
            cpu.write_reg_plain(dec.rd, rn.wrapping_mul(rm).wrapping_add(ra));
        }
        Mls => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            let ra = read_reg_pc4(cpu, dec.ra);
            cpu.write_reg_plain(dec.rd, ra.wrapping_sub(rn.wrapping_mul(rm)));
        }
        Umull => {
            let rn = read_reg_pc4(cpu, dec.rn) as u64;
            let rm = read_reg_pc4(cpu, dec.rm) as u64;
            let result = rn * rm;
            cpu.write_reg_plain(dec.rd, result as u32);
            cpu.write_reg_plain(dec.ra, (result >> 32) as u32);
        }
        Smull => {
            let rn = read_reg_pc4(cpu, dec.rn) as i32 as i64;
            let rm = read_reg_pc4(cpu, dec.rm) as i32 as i64;
            let result = (rn * rm) as u64;
            cpu.write_reg_plain(dec.rd, result as u32);
            cpu.write_reg_plain(dec.ra, (result >> 32) as u32);
        }
        Umlal => {
            let rn = read_reg_pc4(cpu, dec.rn) as u64;
            let rm = read_reg_pc4(cpu, dec.rm) as u64;
            let lo = read_reg_pc4(cpu, dec.rd) as u64;
            let hi = read_reg_pc4(cpu, dec.ra) as u64;
            let acc = (hi << 32) | lo;
            let result = acc.wrapping_add(rn * rm);
            cpu.write_reg_plain(dec.rd, result as u32);
            cpu.write_reg_plain(dec.ra, (result >> 32) as u32);
        }
        Smlal => {
            let rn = read_reg_pc4(cpu, dec.rn) as i32 as i64;
            let rm = read_reg_pc4(cpu, dec.rm) as i32 as i64;
            let lo = read_reg_pc4(cpu, dec.rd) as u64;
            let hi = read_reg_pc4(cpu, dec.ra) as u64;
            let acc = ((hi << 32) | lo) as i64;
            let result = acc.wrapping_add(rn * rm) as u64;
            cpu.write_reg_plain(dec.rd, result as u32);
            cpu.write_reg_plain(dec.ra, (result >> 32) as u32);
        }
        Umaal => {
            let rn = read_reg_pc4(cpu, dec.rn) as u64;
            let rm = read_reg_pc4(cpu, dec.rm) as u64;
            let rdlo = read_reg_pc4(cpu, dec.rd) as u64;
            let rdhi = read_reg_pc4(cpu, dec.ra) as u64;
            let result = rn * rm + rdlo + rdhi;
            cpu.write_reg_plain(dec.rd, result as u32);
            cpu.write_reg_plain(dec.ra, (result >> 32) as u32);
        }

        Ubfx => {
            let lsb = dec.imm & 0x1F;
            let width = (dec.imm >> 16) & 0x3F;
            let rn = read_reg_pc4(cpu, dec.rn);
            cpu.write_reg_plain(dec.rd, ubfx(rn, lsb, width));
        }
        Sbfx => {
            let lsb = dec.imm & 0x1F;
            let width = (dec.imm >> 16) & 0x3F;
            let rn = read_reg_pc4(cpu, dec.rn);
            cpu.write_reg_plain(dec.rd, sbfx(rn, lsb, width) as u32);
        }
        Bfi => {
            let lsb = dec.imm & 0x1F;
            let width = (dec.imm >> 16) & 0x3F;
            let rn = read_reg_pc4(cpu, dec.rn);
            let rd = read_reg_pc4(cpu, dec.rd);
            cpu.write_reg_plain(dec.rd, bfi_op(rd, rn, lsb, width));
        }
        Bfc => {
            let lsb = dec.imm & 0x1F;
            let width = (dec.imm >> 16) & 0x3F;
            let rd = read_reg_pc4(cpu, dec.rd);
            cpu.write_reg_plain(dec.rd, bfc_op(rd, lsb, width));
        }
        Udiv => {
            let rn = read_reg_pc4(cpu, dec.rn);
            let rm = read_reg_pc4(cpu, dec.rm);
            if rm == 0 {
                return divide_by_zero(cpu, mem, scs, dec, dec.rd);
            }
            cpu.write_reg_plain(dec.rd, rn / rm);
        }
        Sdiv => {
            let rn = read_reg_pc4(cpu, dec.rn) as i32;
            let rm = read_reg_pc4(cpu, dec.rm) as i32;
            if rm == 0 {
                return divide_by_zero(cpu, mem, scs, dec, dec.rd);
            }
            cpu.write_reg_plain(dec.rd, rn.wrapping_div(rm) as u32);
        }

        Uxtb => {
            let rm = read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, rm & 0xFF);
        }
        Uxth => {
            let rm = read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, rm & 0xFFFF);
        }
        Sxtb => {
            let rm = read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, (rm as i8) as i32 as u32);
        }
        Sxth => {
            let rm = read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, (rm as i16) as i32 as u32);
        }
        Rev => {
            let rm = read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, rev(rm));
        }
        Rev16 => {
            let rm = read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, rev16(rm));
        }
        Revsh => {
            let rm = read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, revsh(rm));
        }
        Rbit => {
            let rm = read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, rbit(rm));
        }
        Clz => {
            let rm = read_reg_pc4(cpu, dec.rm);
            cpu.write_reg_plain(dec.rd, clz(rm));
        }

        BCond => {
            if condition_holds(cpu, dec.cond) {
                let target = (read_reg_pc4(cpu, 15) as i64 + dec.imm as i32 as i64) as u32;
                return write_pc(cpu, mem, scs, target);
            }
        }
        B => {
            let target = (read_reg_pc4(cpu, 15) as i64 + dec.imm as i32 as i64) as u32;
            return write_pc(cpu, mem, scs, target);
        }
        Bl => {
            let ret = next_pc(cpu, dec) | 1;
            let target = (read_reg_pc4(cpu, 15) as i64 + dec.imm as i32 as i64) as u32;
            cpu.regs[14] = ret;
            return write_pc(cpu, mem, scs, target);
        }
        Bx => {
            let target = read_reg_pc4(cpu, dec.rm);
            if dec.rm == 14 && tz::try_return_from_blxns(cpu, cpu.regs[14]) {
                return ExecOutcome::Continue;
            }
            return write_pc(cpu, mem, scs, target);
        }
        Blx => {
            let target = read_reg_pc4(cpu, dec.rm);
            let ret = next_pc(cpu, dec) | 1;
            cpu.regs[14] = ret;
            return write_pc(cpu, mem, scs, target);
        }
        Cbz | Cbnz => {
            let rn = cpu.read_reg(dec.rn);
            let take = if dec.kind == Cbz { rn == 0 } else { rn != 0 };
            if take {
                let target = read_reg_pc4(cpu, 15).wrapping_add(dec.imm);
                return write_pc(cpu, mem, scs, target);
            }
        }
        Tbb | Tbh => {
            let rn_base = if dec.rn == 15 { cpu.pc & !1 } else { cpu.read_reg(dec.rn) };
            let rm = cpu.read_reg(dec.rm);
            let (size, index) = if dec.kind == Tbb {
                (1u8, rm)
            } else {
                (2u8, rm * 2)
            };
            let entry_addr = rn_base.wrapping_add(index);
            let entry_addr = if dec.rn == 15 {
                entry_addr.wrapping_add(4)
            } else {
                entry_addr
            };
            let half = match gated_read(cpu, mem, scs, entry_addr, size) {
                Some(v) => v,
                None => return mem_fault(cpu, mem, scs, dec, entry_addr, true),
            };
            let fetch_base = read_reg_pc4(cpu, 15);
            let target = fetch_base.wrapping_add(half * 2);
            return write_pc(cpu, mem, scs, target);
        }

        LdrImm | LdrReg | LdrLit => {
            let addr = match dec.kind {
                LdrImm => read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm),
                LdrReg => read_reg_pc4(cpu, dec.rn).wrapping_add(read_reg_pc4(cpu, dec.rm)),
                LdrLit => (read_reg_pc4(cpu, 15) & !0b11).wrapping_add(dec.imm),
                _ => unreachable!(),
            };
            let value = match gated_read(cpu, mem, scs, addr, 4) {
                Some(v) => v,
                None => return mem_fault(cpu, mem, scs, dec, addr, false),
            };
            if dec.rd == 15 {
                return write_pc(cpu, mem, scs, value);
            }
            cpu.write_reg_plain(dec.rd, value);
        }
        LdrbImm => {
            let addr = read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm);
            let value = match gated_read(cpu, mem, scs, addr, 1) {
                Some(v) => v,
                None => return mem_fault(cpu, mem, scs, dec, addr, false),
            };
            cpu.write_reg_plain(dec.rd, value & 0xFF);
        }
        LdrhImm => {
            let addr = read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm);
            let value = match gated_read(cpu, mem, scs, addr, 2) {
                Some(v) => v,
                None => return mem_fault(cpu, mem, scs, dec, addr, false),
            };
            cpu.write_reg_plain(dec.rd, value & 0xFFFF);
        }
        StrImm | StrReg => {
            let addr = match dec.kind {
                StrImm => read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm),
                StrReg => read_reg_pc4(cpu, dec.rn).wrapping_add(read_reg_pc4(cpu, dec.rm)),
                _ => unreachable!(),
            };
            let value = read_reg_pc4(cpu, dec.rd);
            if !gated_write(cpu, mem, scs, addr, 4, value) {
                return mem_fault(cpu, mem, scs, dec, addr, false);
            }
        }
        StrbImm => {
            let addr = read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm);
            let value = read_reg_pc4(cpu, dec.rd);
            if !gated_write(cpu, mem, scs, addr, 1, value) {
                return mem_fault(cpu, mem, scs, dec, addr, false);
            }
        }
        StrhImm => {
            let addr = read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm);
            let value = read_reg_pc4(cpu, dec.rd);
            if !gated_write(cpu, mem, scs, addr, 2, value) {
                return mem_fault(cpu, mem, scs, dec, addr, false);
            }
        }
        Ldrd => {
            let addr = read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm);
            let lo = gated_read(cpu, mem, scs, addr, 4);
            let hi = gated_read(cpu, mem, scs, addr.wrapping_add(4), 4);
            match (lo, hi) {
                (Some(lo), Some(hi)) => {
                    cpu.write_reg_plain(dec.rd, lo);
                    cpu.write_reg_plain(dec.ra, hi);
                }
                _ => return mem_fault(cpu, mem, scs, dec, addr, false),
            }
        }
        Strd => {
            let addr = read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm);
            let lo = read_reg_pc4(cpu, dec.rd);
            let hi = read_reg_pc4(cpu, dec.ra);
            if !gated_write(cpu, mem, scs, addr, 4, lo)
                || !gated_write(cpu, mem, scs, addr.wrapping_add(4), 4, hi)
            {
                return mem_fault(cpu, mem, scs, dec, addr, false);
            }
        }
        Ldrex => {
            let addr = read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm);
            let value = match gated_read(cpu, mem, scs, addr, 4) {
                Some(v) => v,
                None => return mem_fault(cpu, mem, scs, dec, addr, false),
            };
            cpu.exclusive_set(addr, 4);
            cpu.write_reg_plain(dec.rd, value);
        }
        Strex => {
            let addr = read_reg_pc4(cpu, dec.rn).wrapping_add(dec.imm);
            let value = read_reg_pc4(cpu, dec.rm);
            if cpu.exclusive_check_and_clear(addr, 4) {
                if !gated_write(cpu, mem, scs, addr, 4, value) {
                    return mem_fault(cpu, mem, scs, dec, addr, false);
                }
                cpu.write_reg_plain(dec.rd, 0);
            } else {
                cpu.write_reg_plain(dec.rd, 1);
            }
        }
        Clrex => cpu.exclusive_clear(),

        Ldm | Stm => {
            let mut addr = cpu.read_reg(dec.rn);
            let reg_list = dec.imm;
            let is_load = dec.kind == Ldm;
            let writeback = !(is_load && (reg_list & (1 << dec.rn)) != 0);
            for i in 0..8u8 {
                if reg_list & (1 << i) == 0 {
                    continue;
                }
                if is_load {
                    let value = match gated_read(cpu, mem, scs, addr, 4) {
                        Some(v) => v,
                        None => return mem_fault(cpu, mem, scs, dec, addr, false),
                    };
                    cpu.write_reg_plain(i, value);
                } else {
                    let value = cpu.read_reg(i);
                    if !gated_write(cpu, mem, scs, addr, 4, value) {
                        return mem_fault(cpu, mem, scs, dec, addr, false);
                    }
                }
                addr = addr.wrapping_add(4);
            }
            if writeback {
                cpu.write_reg_plain(dec.rn, addr);
            }
        }
        Push => {
            let reg_list = dec.imm & 0xFF;
            let has_lr = dec.imm & (1 << 15) != 0;
            let count = reg_list.count_ones() + has_lr as u32;
            let mut addr = cpu.active_sp().wrapping_sub(count * 4);
            if !cpu.set_active_sp(addr) {
                return stack_overflow(cpu, mem, scs, dec);
            }
            for i in 0..8u8 {
                if reg_list & (1 << i) == 0 {
                    continue;
                }
                let value = cpu.read_reg(i);
                if !gated_write(cpu, mem, scs, addr, 4, value) {
                    return mem_fault(cpu, mem, scs, dec, addr, false);
                }
                addr = addr.wrapping_add(4);
            }
            if has_lr {
                let value = cpu.regs[14];
                if !gated_write(cpu, mem, scs, addr, 4, value) {
                    return mem_fault(cpu, mem, scs, dec, addr, false);
                }
            }
        }
        Pop => {
            let reg_list = dec.imm & 0xFF;
            let has_pc = dec.imm & (1 << 15) != 0;
            let mut addr = cpu.active_sp();
            for i in 0..8u8 {
                if reg_list & (1 << i) == 0 {
                    continue;
                }
                let value = match gated_read(cpu, mem, scs, addr, 4) {
                    Some(v) => v,
                    None => return mem_fault(cpu, mem, scs, dec, addr, false),
                };
                cpu.write_reg_plain(i, value);
                addr = addr.wrapping_add(4);
            }
            let mut pc_target = None;
            if has_pc {
                match gated_read(cpu, mem, scs, addr, 4) {
                    Some(v) => pc_target = Some(v),
                    None => return mem_fault(cpu, mem, scs, dec, addr, false),
                }
                addr = addr.wrapping_add(4);
            }
            let _ = cpu.set_active_sp(addr);
            if let Some(target) = pc_target {
                return write_pc(cpu, mem, scs, target);
            }
        }

        Nop | Yield_ | Sev | Dsb | Dmb | Isb => {}
        Wfi => cpu.sleeping = true,
        Wfe => {
            if cpu.event_pending {
                cpu.event_pending = false;
            } else {
                cpu.sleeping = true;
            }
        }

        Cps => {
            let im_disable = dec.imm & (1 << 4) != 0;
            let affects_i = dec.imm & (1 << 1) != 0;
            let affects_f = dec.imm & 1 != 0;
            let sec = cpu.security;
            let bank = cpu.bank_mut(sec);
            if affects_i {
                bank.primask = im_disable;
            }
            if affects_f {
                bank.faultmask = im_disable;
            }
        }
        Tt => {
            // TT/TTT/TTA/TTAT region-lookup semantics aren't modelled; every
            // query reports no region (TTRESP == 0).
            cpu.write_reg_plain(dec.rd, 0);
        }

        Mrs => {
            let value = msr_sysm::read_special_register(cpu, dec.imm);
            cpu.write_reg_plain(dec.rd, value);
        }
        Msr => {
            let value = read_reg_pc4(cpu, dec.rn);
            msr_sysm::write_special_register(cpu, dec.imm, value);
        }

        Svc => deliver_sync_fault(cpu, mem, scs, exception::VECT_SVCALL, dec),
        Bkpt => return ExecOutcome::Faulted,
        It => {
            cpu.it = crate::it::ItState::from_it_instruction(dec.cond, (dec.imm & 0xF) as u8);
        }

        Sg => tz::sg(cpu),
        Bxns => {
            let target = cpu.read_reg(dec.rm);
            tz::bxns(cpu, target);
        }
        Blxns => {
            let target = cpu.read_reg(dec.rm);
            let ret = next_pc(cpu, dec);
            if !tz::blxns(cpu, target, ret) {
                return ExecOutcome::Faulted;
            }
        }
    }
    ExecOutcome::Continue
}

fn condition_holds(cpu: &Cpu, cond: u8) -> bool {
    let (n, z, c, v) = (cpu.xpsr.n, cpu.xpsr.z, cpu.xpsr.c, cpu.xpsr.v);
    (match cond >> 1 {
        0b000 => z,
        0b001 => c,
        0b010 => n,
        0b011 => v,
        0b100 => c && !z,
        0b101 => n == v,
        0b110 => n == v && !z,
        _ => true,
    })
    ^ (cond & 1 != 0 && cond != 0b1111)
}

/// Called after a gated memory access fails. `access_gate` already raised
/// MemManage/SecureFault for a permission denial; if the gate passed and
/// the bus simply has no backing at `addr`, this records a BusFault
/// instead before delivering.
fn mem_fault(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs, dec: &Decoded, addr: u32, is_exec: bool) -> ExecOutcome {
    let ctx = AccessContext {
        security: cpu.security,
        kind: if is_exec { AccessKind::Fetch } else { AccessKind::Read },
    };
    if scs::is_scs_window(addr) {
        deliver_sync_fault(cpu, mem, scs, exception::VECT_MEMMANAGE, dec);
        return ExecOutcome::Faulted;
    }
    if scs.access_gate(cpu.security, ctx, addr, 1) {
        scs.raise_busfault(cpu.security, addr);
        deliver_sync_fault(cpu, mem, scs, exception::VECT_BUSFAULT, dec);
    } else {
        deliver_sync_fault(cpu, mem, scs, exception::VECT_MEMMANAGE, dec);
    }
    ExecOutcome::Faulted
}

fn stack_overflow(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs, dec: &Decoded) -> ExecOutcome {
    scs.raise_usagefault(cpu.security, fsr_bits::UF_STKOF);
    deliver_sync_fault(cpu, mem, scs, exception::VECT_USAGEFAULT, dec);
    ExecOutcome::Faulted
}

fn divide_by_zero(cpu: &mut Cpu, mem: &mut MemoryBus, scs: &mut Scs, dec: &Decoded, rd: u8) -> ExecOutcome {
    if scs.ccr & (1 << 4) != 0 {
        scs.raise_usagefault(cpu.security, fsr_bits::UF_DIVBYZERO);
        deliver_sync_fault(cpu, mem, scs, exception::VECT_USAGEFAULT, dec);
        ExecOutcome::Faulted
    } else {
        if rd != REG_NONE {
            cpu.write_reg_plain(rd, 0);
        }
        ExecOutcome::Continue
    }
}

/// MRS/MSR special-register numbers (the `sysm` field) and the banked reads
/// and writes they perform. The `_NS` variants are the explicit Non-secure
/// alias: accessed from Non-secure code they're treated as a no-op/returns-0
/// rather than raising UsageFault, which is a simplification over real
/// silicon (see `DESIGN.md`).
mod msr_sysm {
    use super::Cpu;
    use crate::cpu::Security;

    pub const APSR: u32 = 0x00;
    pub const MSP: u32 = 0x08;
    pub const PSP: u32 = 0x09;
    pub const MSPLIM: u32 = 0x0A;
    pub const PSPLIM: u32 = 0x0B;
    pub const CONTROL: u32 = 0x14;
    pub const MSP_NS: u32 = 0x88;
    pub const PSP_NS: u32 = 0x89;
    pub const MSPLIM_NS: u32 = 0x8A;
    pub const PSPLIM_NS: u32 = 0x8B;
    pub const CONTROL_NS: u32 = 0x94;

    fn bank_security(cpu: &Cpu, sysm: u32) -> Option<Security> {
        if sysm & 0x80 != 0 {
            // Explicit Non-secure alias: only reachable when Secure, and
            // only for the registers that have one.
            if cpu.security != Security::Secure {
                return None;
            }
            Some(Security::NonSecure)
        } else {
            Some(cpu.security)
        }
    }

    pub fn read_special_register(cpu: &Cpu, sysm: u32) -> u32 {
        if sysm == APSR {
            return cpu.xpsr.encode() & 0xF800_0000;
        }
        let sec = match bank_security(cpu, sysm) {
            Some(s) => s,
            None => return 0,
        };
        match sysm & 0x7F {
            0x08 => cpu.bank(sec).msp,
            0x09 => cpu.bank(sec).psp,
            0x0A => cpu.bank(sec).msplim,
            0x0B => cpu.bank(sec).psplim,
            0x14 => {
                let bank = cpu.bank(sec);
                (bank.control_npriv as u32) | ((bank.control_spsel as u32) << 1)
            }
            _ => 0,
        }
    }

    pub fn write_special_register(cpu: &mut Cpu, sysm: u32, value: u32) {
        if sysm == APSR {
            let mut xpsr = cpu.xpsr;
            xpsr.n = value & (1 << 31) != 0;
            xpsr.z = value & (1 << 30) != 0;
            xpsr.c = value & (1 << 29) != 0;
            xpsr.v = value & (1 << 28) != 0;
            xpsr.q = value & (1 << 27) != 0;
            cpu.xpsr = xpsr;
            return;
        }
        let sec = match bank_security(cpu, sysm) {
            Some(s) => s,
            None => return,
        };
        match sysm & 0x7F {
            0x08 => cpu.bank_mut(sec).msp = value,
            0x09 => cpu.bank_mut(sec).psp = value,
            0x0A => cpu.bank_mut(sec).msplim = value,
            0x0B => cpu.bank_mut(sec).psplim = value,
            0x14 => {
                let bank = cpu.bank_mut(sec);
                bank.control_npriv = value & 1 != 0;
                bank.control_spsel = value & (1 << 1) != 0;
            }
            _ => {}
        }
    }
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
    fn umaal_accumulates_across_carry() {
        let (mut cpu, mut mem, mut scs) = harness();
        cpu.regs[0] = 0x0BAD_F00D;
        cpu.regs[5] = 0x00C0_FFEE;
        cpu.regs[11] = 0x0102_0304;
        cpu.regs[12] = 0x0506_0708;
        let dec = Decoded {
            kind: Kind::Umaal,
            rd: 11,
            rn: 0,
            rm: 5,
            ra: 12,
            imm: 0,
            cond: 0xE,
            len: 4,
            raw: 0,
            set_flags: false,
            undefined: false,
        };
        execute(&mut cpu, &mut mem, &mut scs, &dec);
        let expected = (0x0BAD_F00Du64 * 0x00C0_FFEEu64) + 0x0102_0304u64 + 0x0506_0708u64;
        let got = (cpu.regs[11] as u64) | ((cpu.regs[12] as u64) << 32);
        assert_eq!(got, expected);
    }

    #[test]
    fn tbb_computes_branch_target_from_table() {
        let (mut cpu, mut mem, mut scs) = harness();
        cpu.pc = 0x2000_1000 | 1;
        cpu.write_reg_plain(0, 0x2000_1000);
        assert!(mem.raw_write(0x2000_1003, 1, 5));
        cpu.write_reg_plain(1, 3);
        let dec = Decoded {
            kind: Kind::Tbb,
            rd: REG_NONE,
            rn: 0,
            rm: 1,
            ra: REG_NONE,
            imm: 0,
            cond: 0xE,
            len: 4,
            raw: 0,
            set_flags: false,
            undefined: false,
        };
        execute(&mut cpu, &mut mem, &mut scs, &dec);
        assert_eq!(cpu.pc, (0x2000_1000 + 4 + 2 * 5) | 1);
    }

    fn cps_dec(imm: u32) -> Decoded {
        Decoded {
            kind: Kind::Cps,
            rd: REG_NONE,
            rn: REG_NONE,
            rm: REG_NONE,
            ra: REG_NONE,
            imm,
            cond: 0xE,
            len: 2,
            raw: 0,
            set_flags: false,
            undefined: false,
        }
    }

    #[test]
    fn cpsid_i_sets_primask_only() {
        let (mut cpu, mut mem, mut scs) = harness();
        // im=1 (disable), affects I, not F
        execute(&mut cpu, &mut mem, &mut scs, &cps_dec(0b1_0010));
        assert!(cpu.secure.primask);
        assert!(!cpu.secure.faultmask);
    }

    #[test]
    fn cpsie_f_clears_faultmask_only() {
        let (mut cpu, mut mem, mut scs) = harness();
        cpu.secure.faultmask = true;
        cpu.secure.primask = true;
        // im=0 (enable), affects F, not I
        execute(&mut cpu, &mut mem, &mut scs, &cps_dec(0b0_0001));
        assert!(!cpu.secure.faultmask);
        assert!(cpu.secure.primask);
    }

    #[test]
    fn msr_then_mrs_round_trips_msp() {
        let (mut cpu, mut mem, mut scs) = harness();
        cpu.write_reg_plain(0, 0x2000_0800);
        let msr_dec = Decoded {
            kind: Kind::Msr,
            rd: REG_NONE,
            rn: 0,
            rm: REG_NONE,
            ra: REG_NONE,
            imm: msr_sysm::MSP,
            cond: 0xE,
            len: 4,
            raw: 0,
            set_flags: false,
            undefined: false,
        };
        execute(&mut cpu, &mut mem, &mut scs, &msr_dec);
        assert_eq!(cpu.secure.msp, 0x2000_0800);

        let mrs_dec = Decoded {
            kind: Kind::Mrs,
            rd: 1,
            rn: REG_NONE,
            rm: REG_NONE,
            ra: REG_NONE,
            imm: msr_sysm::MSP,
            cond: 0xE,
            len: 4,
            raw: 0,
            set_flags: false,
            undefined: false,
        };
        execute(&mut cpu, &mut mem, &mut scs, &mrs_dec);
        assert_eq!(cpu.regs[1], 0x2000_0800);
    }

    #[test]
    fn tt_reports_no_region_placeholder() {
        let (mut cpu, mut mem, mut scs) = harness();
        cpu.regs[2] = 0xDEAD_BEEF;
        let dec = Decoded {
            kind: Kind::Tt,
            rd: 2,
            rn: 0,
            rm: REG_NONE,
            ra: REG_NONE,
            imm: 0,
            cond: 0xE,
            len: 4,
            raw: 0,
            set_flags: false,
            undefined: false,
        };
        execute(&mut cpu, &mut mem, &mut scs, &dec);
        assert_eq!(cpu.regs[2], 0);
    }
}
