//! System Control Space: SCB, SysTick, MPU and SAU banks, memory-mapped at
//! `0xE000_E000` (and the Non-secure alias `0xE002_E000`).

use crate::cpu::{Cpu, Security};
use crate::exception::{
    fsr_bits, shcsr_bits, VECT_BUSFAULT, VECT_MEMMANAGE, VECT_SECUREFAULT, VECT_USAGEFAULT,
};
use crate::mem::{AccessContext, AccessKind, MemoryBus};
use crate::mpu::Mpu;
use crate::nvic::Nvic;
use crate::sau::{Sau, SauAttr};

pub const SCS_BASE_SECURE: u32 = 0xE000_E000;
pub const SCS_BASE_NONSECURE_ALIAS: u32 = 0xE002_E000;
pub const SCS_WINDOW_SIZE: u32 = 0x1000;

pub const OFF_CPUID: u32 = 0x000;
pub const OFF_ICSR: u32 = 0x004;
pub const OFF_VTOR: u32 = 0x008;
pub const OFF_AIRCR: u32 = 0x00C;
pub const OFF_SCR: u32 = 0x010;
pub const OFF_CCR: u32 = 0x014;
pub const OFF_SHPR1: u32 = 0x018;
pub const OFF_SHCSR: u32 = 0x024;
pub const OFF_CFSR: u32 = 0x028;
pub const OFF_HFSR: u32 = 0x02C;
pub const OFF_DFSR: u32 = 0x030;
pub const OFF_MMFAR: u32 = 0x034;
pub const OFF_BFAR: u32 = 0x038;
pub const OFF_AFSR: u32 = 0x03C;

pub const OFF_SYSTICK_CSR: u32 = 0x010;
pub const OFF_SYSTICK_RVR: u32 = 0x014;
pub const OFF_SYSTICK_CVR: u32 = 0x018;
pub const OFF_SYSTICK_CALIB: u32 = 0x01C;

pub const OFF_MPU_TYPE: u32 = 0x090;
pub const OFF_MPU_CTRL: u32 = 0x094;
pub const OFF_MPU_RNR: u32 = 0x098;
pub const OFF_MPU_RBAR: u32 = 0x09C;
pub const OFF_MPU_RLAR: u32 = 0x0A0;
pub const OFF_MPU_MAIR0: u32 = 0x0C0;
pub const OFF_MPU_MAIR1: u32 = 0x0C4;

pub const OFF_SAU_TYPE: u32 = 0x0CC;
pub const OFF_SAU_CTRL: u32 = 0x0D0;
pub const OFF_SAU_RNR: u32 = 0x0D4;
pub const OFF_SAU_RBAR: u32 = 0x0D8;
pub const OFF_SAU_RLAR: u32 = 0x0DC;
pub const OFF_SFSR: u32 = 0x0E4;
pub const OFF_SFAR: u32 = 0x0E8;

pub const OFF_NVIC_ISER: u32 = 0x100;
pub const OFF_NVIC_ICER: u32 = 0x180;
pub const OFF_NVIC_ISPR: u32 = 0x200;
pub const OFF_NVIC_ICPR: u32 = 0x280;
pub const OFF_NVIC_IABR: u32 = 0x300;
pub const OFF_NVIC_ITNS: u32 = 0x380;
pub const OFF_NVIC_IPR: u32 = 0x400;

const AIRCR_VECTKEY: u32 = 0x05FA;

const ICSR_PENDSTCLR: u32 = 1 << 25;
const ICSR_PENDSTSET: u32 = 1 << 26;
const ICSR_PENDSVCLR: u32 = 1 << 27;
const ICSR_PENDSVSET: u32 = 1 << 28;
const ICSR_ISRPENDING: u32 = 1 << 22;

/// SysTick's 24-bit down-counter and its banked (shared) control registers.
#[derive(Debug, Clone, Default)]
pub struct SysTick {
    pub enable: bool,
    pub tickint: bool,
    pub clksource_cpu: bool,
    pub reload: u32,
    pub current: u32,
    pub countflag: bool,
    pub calib_tenms: u32,
}

impl SysTick {
    /// Advances the counter by `cycles`, wrapping as many times as needed
    /// and latching `countflag`/the caller-visible "wrapped" signal.
    pub fn advance(&mut self, cycles: u64) -> bool {
        if !self.enable {
            return false;
        }
        let mut wrapped = false;
        let mut remaining = cycles;
        while remaining > 0 {
            if self.current == 0 {
                self.current = self.reload;
            }
            if self.current as u64 <= remaining {
                remaining -= self.current as u64;
                self.current = self.reload;
                wrapped = true;
                self.countflag = true;
            } else {
                self.current -= remaining as u32;
                remaining = 0;
            }
        }
        wrapped
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FaultRegisters {
    pub cfsr: u32,
    pub hfsr: u32,
    pub dfsr: u32,
    pub mmfar: u32,
    pub bfar: u32,
    pub afsr: u32,
    pub shcsr: u32,
}

pub struct Scs {
    pub vtor: [u32; 2], // indexed by Security as usize
    pub aircr_scratch: u32,
    pub scr: u32,
    pub ccr: u32,
    pub systick: SysTick,
    pub faults: [FaultRegisters; 2],
    pub mpu: [Mpu; 2],
    pub sau: Sau,
    pub nvic: Nvic,
    pub last_access_sec: Security,
    pub reset_requested: bool,
    /// Latched by `OFF_ICSR`'s PENDSVSET or a direct request; arbitrated
    /// (and cleared) by `sched::dispatch_pending_exception`.
    pub pend_sv: bool,
    /// Latched by SysTick wrap or `OFF_ICSR`'s PENDSTSET; arbitrated the
    /// same way.
    pub pend_st: bool,
}

fn idx(sec: Security) -> usize {
    match sec {
        Security::Secure => 0,
        Security::NonSecure => 1,
    }
}

impl Scs {
    pub fn new(num_irq: usize) -> Self {
        Scs {
            vtor: [0; 2],
            aircr_scratch: 0,
            scr: 0,
            ccr: 0,
            systick: SysTick::default(),
            faults: [FaultRegisters::default(); 2],
            mpu: [Mpu::default(), Mpu::default()],
            sau: Sau::default(),
            nvic: Nvic::new(num_irq),
            last_access_sec: Security::Secure,
            reset_requested: false,
            pend_sv: false,
            pend_st: false,
        }
    }

    /// Re-initialises to power-on-reset state while keeping the same
    /// `num_irq` sizing, mirroring `Cpu::reset`.
    pub fn reset_registers(&mut self) {
        let num_irq = self.nvic.len();
        *self = Scs::new(num_irq);
    }

    pub fn vtor(&self, sec: Security) -> u32 {
        self.vtor[idx(sec)]
    }

    pub fn set_vtor(&mut self, sec: Security, value: u32) {
        self.vtor[idx(sec)] = value;
    }

    pub fn mpu(&self, sec: Security) -> &Mpu {
        &self.mpu[idx(sec)]
    }

    pub fn mpu_mut(&mut self, sec: Security) -> &mut Mpu {
        &mut self.mpu[idx(sec)]
    }

    pub fn faults(&self, sec: Security) -> &FaultRegisters {
        &self.faults[idx(sec)]
    }

    pub fn faults_mut(&mut self, sec: Security) -> &mut FaultRegisters {
        &mut self.faults[idx(sec)]
    }

    /// Raises a MemManage, escalating to HardFault if disabled in SHCSR or
    /// if the caller asks for `force_hardfault` (used for double faults
    /// during exception entry).
    pub fn raise_memmanage(&mut self, sec: Security, addr: u32, is_exec: bool) {
        tracing::debug!(?sec, addr, is_exec, "memmanage");
        let f = self.faults_mut(sec);
        f.mmfar = addr;
        f.cfsr |= if is_exec {
            fsr_bits::MM_IACCVIOL
        } else {
            fsr_bits::MM_DACCVIOL
        } | fsr_bits::MM_MMARVALID;
    }

    pub fn raise_usagefault(&mut self, sec: Security, bit: u32) {
        tracing::debug!(?sec, bit, "usagefault");
        self.faults_mut(sec).cfsr |= bit;
    }

    /// Raised when an access clears the SAU/MPU gate but lands outside any
    /// backing flash/RAM/MMIO region -- a bus error rather than a
    /// permission violation.
    pub fn raise_busfault(&mut self, sec: Security, addr: u32) {
        tracing::debug!(?sec, addr, "busfault");
        let f = self.faults_mut(sec);
        f.bfar = addr;
        f.cfsr |= fsr_bits::BF_PRECISERR | fsr_bits::BF_BFARVALID;
    }

    pub fn raise_securefault(&mut self, addr: u32, bit: u32) {
        tracing::debug!(addr, bit, "securefault");
        self.sau.sfar = addr;
        self.sau.sfsr |= bit | fsr_bits::SF_SFARVALID;
    }

    pub fn raise_hardfault(&mut self, sec: Security) {
        tracing::warn!(?sec, "hardfault");
        self.faults_mut(sec).hfsr |= fsr_bits::HF_FORCED;
    }

    pub fn vector_for(&self, kind: &str) -> u16 {
        match kind {
            "memmanage" => VECT_MEMMANAGE,
            "busfault" => VECT_BUSFAULT,
            "usagefault" => VECT_USAGEFAULT,
            "securefault" => VECT_SECUREFAULT,
            _ => VECT_MEMMANAGE,
        }
    }

    /// The access-gate algorithm: combines caller security, SAU
    /// attribution, and MPU XN into an allow/deny decision, recording the
    /// relevant fault registers on denial.
    pub fn access_gate(
        &mut self,
        cpu_security: Security,
        ctx: AccessContext,
        addr: u32,
        _size: u8,
    ) -> bool {
        if is_scs_window(addr) {
            self.last_access_sec = cpu_security;
            return true;
        }

        let attr = self.sau.attr_for_addr(addr);
        let is_secure_mem = attr == SauAttr::Secure;
        let is_nsc = attr == SauAttr::Nsc;

        if cpu_security == Security::Secure && ctx.kind != AccessKind::Fetch {
            // Secure may read/write Non-secure memory.
        } else if cpu_security == Security::NonSecure && (is_secure_mem || (is_nsc && ctx.kind != AccessKind::Fetch))
        {
            let bit = if ctx.kind == AccessKind::Fetch {
                fsr_bits::SF_INVEP
            } else {
                fsr_bits::SF_AUVIOL
            };
            self.raise_securefault(addr, bit);
            self.raise_memmanage(cpu_security, addr, ctx.kind == AccessKind::Fetch);
            return false;
        }

        if ctx.kind == AccessKind::Fetch && self.mpu(cpu_security).is_xn_exec(addr) {
            self.raise_memmanage(cpu_security, addr, true);
            return false;
        }

        if !self.mpu(cpu_security).region_allows(addr) {
            self.raise_memmanage(cpu_security, addr, ctx.kind == AccessKind::Fetch);
            return false;
        }

        true
    }

    pub fn read(&mut self, sec: Security, off: u32, size: u8) -> Option<u32> {
        self.last_access_sec = sec;
        if let Some(bits) = nvic_bank_read(&self.nvic, sec, off, size) {
            return Some(bits);
        }
        Some(match off {
            OFF_CPUID => 0x410F_D213, // Cortex-M33 r1p3, per the Main ID Register encoding
            OFF_ICSR => self.icsr(),
            OFF_VTOR => self.vtor(sec),
            OFF_SCR => self.scr,
            OFF_CCR => self.ccr,
            OFF_SHCSR => self.faults(sec).shcsr,
            OFF_CFSR => self.faults(sec).cfsr,
            OFF_HFSR => self.faults(sec).hfsr,
            OFF_DFSR => self.faults(sec).dfsr,
            OFF_MMFAR => self.faults(sec).mmfar,
            OFF_BFAR => self.faults(sec).bfar,
            OFF_AFSR => self.faults(sec).afsr,
            OFF_SYSTICK_CSR => self.systick_csr_read(),
            OFF_SYSTICK_RVR => self.systick.reload,
            OFF_SYSTICK_CVR => self.systick.current,
            OFF_SYSTICK_CALIB => self.systick.calib_tenms & 0x00FF_FFFF,
            OFF_MPU_TYPE => (self.mpu(sec).regions.len() as u32) << 8,
            OFF_MPU_CTRL => self.mpu(sec).ctrl.get(),
            OFF_MPU_RNR => self.mpu(sec).rnr as u32,
            OFF_MPU_RBAR => self.mpu_region(sec).rbar,
            OFF_MPU_RLAR => self.mpu_region(sec).rlar,
            OFF_MPU_MAIR0 => self.mpu(sec).mair0,
            OFF_MPU_MAIR1 => self.mpu(sec).mair1,
            OFF_SAU_TYPE if sec == Security::Secure => self.sau.regions.len() as u32,
            OFF_SAU_CTRL if sec == Security::Secure => self.sau.ctrl.get(),
            OFF_SAU_RNR if sec == Security::Secure => self.sau.rnr as u32,
            OFF_SAU_RBAR if sec == Security::Secure => self.sau_region().rbar,
            OFF_SAU_RLAR if sec == Security::Secure => self.sau_region().rlar,
            OFF_SFSR if sec == Security::Secure => self.sau.sfsr,
            OFF_SFAR if sec == Security::Secure => self.sau.sfar,
            _ => return None,
        })
    }

    pub fn write(&mut self, sec: Security, off: u32, size: u8, value: u32) -> bool {
        self.last_access_sec = sec;
        if nvic_bank_write(&mut self.nvic, sec, off, size, value) {
            return true;
        }
        match off {
            OFF_ICSR => {
                if value & ICSR_PENDSVSET != 0 {
                    self.pend_sv = true;
                }
                if value & ICSR_PENDSVCLR != 0 {
                    self.pend_sv = false;
                }
                if value & ICSR_PENDSTSET != 0 {
                    self.pend_st = true;
                }
                if value & ICSR_PENDSTCLR != 0 {
                    self.pend_st = false;
                }
                true
            }
            OFF_VTOR => {
                self.vtor[idx(sec)] = value;
                true
            }
            OFF_AIRCR => {
                if value >> 16 != AIRCR_VECTKEY {
                    return false;
                }
                if value & (1 << 2) != 0 {
                    self.reset_requested = true;
                }
                true
            }
            OFF_SCR => {
                self.scr = value;
                true
            }
            OFF_CCR => {
                self.ccr = value;
                true
            }
            OFF_SHCSR => {
                let mut masked = value & shcsr_bits::WRITABLE;
                if sec == Security::NonSecure {
                    masked &= !(shcsr_bits::SECUREFAULTACT | shcsr_bits::SECUREFAULTENA);
                }
                self.faults_mut(sec).shcsr = masked;
                true
            }
            OFF_CFSR => {
                // CFSR is write-1-to-clear.
                self.faults_mut(sec).cfsr &= !value;
                true
            }
            OFF_HFSR => {
                self.faults_mut(sec).hfsr &= !value;
                true
            }
            OFF_MMFAR => {
                self.faults_mut(sec).mmfar = value;
                true
            }
            OFF_BFAR => {
                self.faults_mut(sec).bfar = value;
                true
            }
            OFF_SYSTICK_CSR => {
                self.systick.enable = value & 1 != 0;
                self.systick.tickint = value & (1 << 1) != 0;
                self.systick.clksource_cpu = value & (1 << 2) != 0;
                true
            }
            OFF_SYSTICK_RVR => {
                self.systick.reload = value & 0x00FF_FFFF;
                true
            }
            OFF_SYSTICK_CVR => {
                self.systick.current = 0;
                self.systick.countflag = false;
                true
            }
            OFF_MPU_CTRL => {
                self.mpu_mut(sec).ctrl.set(value);
                true
            }
            OFF_MPU_RNR => {
                self.mpu_mut(sec).rnr = value as u8 % crate::mpu::NUM_MPU_REGIONS as u8;
                true
            }
            OFF_MPU_RBAR => {
                let rnr = self.mpu(sec).rnr as usize;
                self.mpu_mut(sec).regions[rnr].rbar = value;
                true
            }
            OFF_MPU_RLAR => {
                let rnr = self.mpu(sec).rnr as usize;
                self.mpu_mut(sec).regions[rnr].rlar = value;
                true
            }
            OFF_MPU_MAIR0 => {
                self.mpu_mut(sec).mair0 = value;
                true
            }
            OFF_MPU_MAIR1 => {
                self.mpu_mut(sec).mair1 = value;
                true
            }
            OFF_SAU_CTRL if sec == Security::Secure => {
                self.sau.ctrl.set(value);
                true
            }
            OFF_SAU_RNR if sec == Security::Secure => {
                self.sau.rnr = value as u8 % crate::sau::NUM_SAU_REGIONS as u8;
                true
            }
            OFF_SAU_RBAR if sec == Security::Secure => {
                let rnr = self.sau.rnr as usize;
                self.sau.regions[rnr].rbar = value;
                true
            }
            OFF_SAU_RLAR if sec == Security::Secure => {
                let rnr = self.sau.rnr as usize;
                self.sau.regions[rnr].rlar = value;
                true
            }
            OFF_SFSR if sec == Security::Secure => {
                self.sau.sfsr &= !value;
                true
            }
            _ => false,
        }
    }

    fn mpu_region(&self, sec: Security) -> crate::mpu::MpuRegion {
        let rnr = self.mpu(sec).rnr as usize;
        self.mpu(sec).regions[rnr]
    }

    fn sau_region(&self) -> crate::sau::SauRegion {
        self.sau.regions[self.sau.rnr as usize]
    }

    fn icsr(&self) -> u32 {
        (self.nvic.has_pending() as u32) << 22
            | (self.pend_sv as u32) << 28
            | (self.pend_st as u32) << 26
    }

    fn systick_csr_read(&mut self) -> u32 {
        let mut value = 0u32;
        if self.systick.enable {
            value |= 1;
        }
        if self.systick.tickint {
            value |= 1 << 1;
        }
        if self.systick.clksource_cpu {
            value |= 1 << 2;
        }
        if self.systick.countflag {
            value |= 1 << 16;
        }
        self.systick.countflag = false; // read-to-clear
        value
    }
}

/// Byte span of one bit-per-IRQ bank (ISER/ICER/ISPR/ICPR/IABR/ITNS): one
/// bit per IRQ, rounded up to whole bytes.
fn nvic_bit_bank_bytes(nvic: &Nvic) -> u32 {
    ((nvic.len() + 7) / 8) as u32
}

/// Reads an MMIO access against one of the NVIC's banked registers,
/// returning `None` if `off` falls outside every known bank.
fn nvic_bank_read(nvic: &Nvic, _sec: Security, off: u32, size: u8) -> Option<u32> {
    let bank_bytes = nvic_bit_bank_bytes(nvic);
    let read_bits = |base: u32, get: &dyn Fn(usize) -> bool| -> Option<u32> {
        if off < base || off >= base + bank_bytes {
            return None;
        }
        let irq_base = ((off - base) * 8) as usize;
        let mut value = 0u32;
        for bit in 0..(size as usize * 8) {
            let irq = irq_base + bit;
            if irq < nvic.len() && get(irq) {
                value |= 1 << bit;
            }
        }
        Some(value)
    };
    if let Some(v) = read_bits(OFF_NVIC_ISER, &|i| nvic.get(i).is_some_and(|s| s.enabled)) {
        return Some(v);
    }
    if let Some(v) = read_bits(OFF_NVIC_ICER, &|i| nvic.get(i).is_some_and(|s| s.enabled)) {
        return Some(v);
    }
    if let Some(v) = read_bits(OFF_NVIC_ISPR, &|i| nvic.get(i).is_some_and(|s| s.pending)) {
        return Some(v);
    }
    if let Some(v) = read_bits(OFF_NVIC_ICPR, &|i| nvic.get(i).is_some_and(|s| s.pending)) {
        return Some(v);
    }
    if let Some(v) = read_bits(OFF_NVIC_IABR, &|i| nvic.get(i).is_some_and(|s| s.active)) {
        return Some(v);
    }
    if let Some(v) = read_bits(OFF_NVIC_ITNS, &|i| nvic.get(i).is_some_and(|s| s.target_ns)) {
        return Some(v);
    }
    if off >= OFF_NVIC_IPR && off < OFF_NVIC_IPR + nvic.len() as u32 {
        let irq_base = (off - OFF_NVIC_IPR) as usize;
        let mut value = 0u32;
        for (byte, irq) in (irq_base..irq_base + size as usize).enumerate() {
            if let Some(state) = nvic.get(irq) {
                value |= (state.priority as u32) << (byte * 8);
            }
        }
        return Some(value);
    }
    None
}

/// Writes an MMIO access against one of the NVIC's banked registers,
/// returning `false` if `off` falls outside every known bank.
fn nvic_bank_write(nvic: &mut Nvic, _sec: Security, off: u32, size: u8, value: u32) -> bool {
    let bank_bytes = nvic_bit_bank_bytes(nvic);
    let in_bank = |base: u32| off >= base && off < base + bank_bytes;

    if in_bank(OFF_NVIC_ISER) || in_bank(OFF_NVIC_ICER) || in_bank(OFF_NVIC_ISPR) || in_bank(OFF_NVIC_ICPR) {
        let base = if in_bank(OFF_NVIC_ISER) {
            OFF_NVIC_ISER
        } else if in_bank(OFF_NVIC_ICER) {
            OFF_NVIC_ICER
        } else if in_bank(OFF_NVIC_ISPR) {
            OFF_NVIC_ISPR
        } else {
            OFF_NVIC_ICPR
        };
        let irq_base = ((off - base) * 8) as usize;
        for bit in 0..(size as usize * 8) {
            if value & (1 << bit) == 0 {
                continue;
            }
            let irq = irq_base + bit;
            if irq >= nvic.len() {
                continue;
            }
            match base {
                OFF_NVIC_ISER => nvic.set_enabled(irq, true),
                OFF_NVIC_ICER => nvic.set_enabled(irq, false),
                OFF_NVIC_ISPR => nvic.set_pending(irq, true),
                OFF_NVIC_ICPR => nvic.set_pending(irq, false),
                _ => unreachable!(),
            }
        }
        return true;
    }

    if in_bank(OFF_NVIC_IABR) {
        // IABR is read-only; writes are ignored but still claim the address.
        return true;
    }

    if in_bank(OFF_NVIC_ITNS) {
        let irq_base = ((off - OFF_NVIC_ITNS) * 8) as usize;
        for bit in 0..(size as usize * 8) {
            let irq = irq_base + bit;
            if irq >= nvic.len() {
                continue;
            }
            nvic.set_target_security(irq, value & (1 << bit) != 0);
        }
        return true;
    }

    if off >= OFF_NVIC_IPR && off < OFF_NVIC_IPR + nvic.len() as u32 {
        let irq_base = (off - OFF_NVIC_IPR) as usize;
        for (byte, irq) in (irq_base..irq_base + size as usize).enumerate() {
            if irq >= nvic.len() {
                continue;
            }
            nvic.set_priority(irq, ((value >> (byte * 8)) & 0xFF) as u8);
        }
        return true;
    }

    false
}

pub fn is_scs_window(addr: u32) -> bool {
    (addr >= SCS_BASE_SECURE && addr < SCS_BASE_SECURE + SCS_WINDOW_SIZE)
        || (addr >= SCS_BASE_NONSECURE_ALIAS && addr < SCS_BASE_NONSECURE_ALIAS + SCS_WINDOW_SIZE)
}

/// Resolves an SCS-window address to `(security, offset)`, honouring the
/// Non-secure alias bank.
pub fn decode_scs_addr(addr: u32) -> Option<(Security, u32)> {
    if addr >= SCS_BASE_SECURE && addr < SCS_BASE_SECURE + SCS_WINDOW_SIZE {
        Some((Security::Secure, addr - SCS_BASE_SECURE))
    } else if addr >= SCS_BASE_NONSECURE_ALIAS && addr < SCS_BASE_NONSECURE_ALIAS + SCS_WINDOW_SIZE {
        Some((Security::NonSecure, addr - SCS_BASE_NONSECURE_ALIAS))
    } else {
        None
    }
}

/// Reads the memory-mapped SCS given the *caller's* CPU security (for
/// banking decisions independent of which window/alias was addressed).
pub fn scs_read(scs: &mut Scs, cpu: &Cpu, addr: u32, size: u8) -> Option<u32> {
    let (window_sec, off) = decode_scs_addr(addr)?;
    let _ = cpu;
    scs.read(window_sec, off, size)
}

pub fn scs_write(scs: &mut Scs, cpu: &Cpu, addr: u32, size: u8, value: u32) -> bool {
    let _ = cpu;
    match decode_scs_addr(addr) {
        Some((sec, off)) => scs.write(sec, off, size, value),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aircr_requires_vectkey() {
        let mut scs = Scs::new(16);
        assert!(!scs.write(Security::Secure, OFF_AIRCR, 4, 1 << 2));
        assert!(!scs.reset_requested);
        assert!(scs.write(Security::Secure, OFF_AIRCR, 4, (AIRCR_VECTKEY << 16) | (1 << 2)));
        assert!(scs.reset_requested);
    }

    #[test]
    fn vtor_is_banked() {
        let mut scs = Scs::new(16);
        scs.write(Security::Secure, OFF_VTOR, 4, 0x1000);
        scs.write(Security::NonSecure, OFF_VTOR, 4, 0x2000);
        assert_eq!(scs.vtor(Security::Secure), 0x1000);
        assert_eq!(scs.vtor(Security::NonSecure), 0x2000);
    }

    #[test]
    fn systick_wraps_and_sets_countflag() {
        let mut scs = Scs::new(16);
        scs.systick.enable = true;
        scs.systick.reload = 10;
        scs.systick.current = 10;
        assert!(scs.systick.advance(10));
        assert!(scs.systick.countflag);
    }

    #[test]
    fn scs_window_detection_covers_both_aliases() {
        assert!(is_scs_window(0xE000_E010));
        assert!(is_scs_window(0xE002_E010));
        assert!(!is_scs_window(0xE001_0000));
    }
}
