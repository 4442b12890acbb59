//! ARMv8-M Mainline / TrustZone-M core emulator.
//!
//! One module per hardware unit, each a Rust type rather than a set of
//! free functions over a process-wide global.

pub mod bits;
pub mod config;
pub mod cpu;
pub mod decode;
pub mod error;
pub mod exception;
pub mod exec;
pub mod it;
pub mod mem;
pub mod mpu;
pub mod nvic;
pub mod peripherals;
pub mod sau;
pub mod sched;
pub mod scs;
pub mod tz;

use config::SocConfig;
use cpu::Cpu;
use error::EmulatorError;
use mem::MemoryBus;
use scs::Scs;
use std::path::Path;

/// A flash image to load at construction time, optionally at an explicit
/// offset from the configured flash base.
pub struct FlashImage {
    pub bytes: Vec<u8>,
    pub offset: u32,
}

impl FlashImage {
    pub fn from_file(path: &Path, offset: u32) -> Result<Self, EmulatorError> {
        let bytes = std::fs::read(path).map_err(|source| EmulatorError::ImageIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(FlashImage { bytes, offset })
    }
}

/// Ties the CPU, memory bus, and system control space together and drives
/// the fetch/decode/execute loop. Owns no UI or debug-stub concerns --
/// those are bundled separately (`m33mu-cli`) and observe through
/// [`Emulator::cpu`]/[`Emulator::mem`]/[`Emulator::scs`].
pub struct Emulator {
    pub cpu: Cpu,
    pub mem: MemoryBus,
    pub scs: Scs,
    pub config: SocConfig,
}

impl Emulator {
    /// Builds the memory bus from `config`, loads every image, and performs
    /// a power-on reset, leaving the core ready to step.
    pub fn new(config: SocConfig, images: &[FlashImage]) -> Result<Self, EmulatorError> {
        let mut mem = MemoryBus::new(config.flash_base_s, config.flash_base_ns, config.flash_size);
        for bank in &config.ram_banks {
            mem.add_ram_bank(bank.base_s, bank.base_ns, bank.size);
        }
        mem.flash_writable = false;

        for image in images {
            let end = image.offset as usize + image.bytes.len();
            if end > mem.flash.len() {
                return Err(EmulatorError::ImageTooLarge {
                    path: Default::default(),
                    size: image.bytes.len(),
                    offset: image.offset,
                    flash_size: mem.flash.len(),
                });
            }
            mem.load_flash_image(&image.bytes, image.offset)?;
        }

        let mut scs = Scs::new(config.num_irq);
        scs.systick.calib_tenms = config.systick_calib_tenms;
        let mut cpu = Cpu::default();

        scs.reset_requested = true;
        sched::step(&mut cpu, &mut mem, &mut scs);

        Ok(Emulator {
            cpu,
            mem,
            scs,
            config,
        })
    }

    pub fn register_mmio(
        &mut self,
        base: u32,
        size: u32,
        device: Box<dyn mem::MmioDevice>,
    ) -> Result<(), EmulatorError> {
        self.mem.register_mmio(base, size, device)
    }

    /// Runs one scheduler step. Returns `false` if the core is sleeping
    /// (WFI/WFE) with no pending event, so the caller can advance virtual
    /// time instead of busy-looping.
    pub fn step(&mut self) -> bool {
        self.trace_pc();
        let sp_before = self.cpu.active_sp();
        let memwatch_before = self.read_memwatch();

        sched::tick_systick(&mut self.cpu, &mut self.mem, &mut self.scs);
        let advanced = sched::step(&mut self.cpu, &mut self.mem, &mut self.scs);

        self.trace_stack(sp_before);
        self.trace_memwatch(memwatch_before);
        advanced
    }

    /// Requests a core reset, honoured on the next [`Emulator::step`].
    pub fn request_reset(&mut self) {
        self.scs.reset_requested = true;
    }

    fn trace_pc(&self) {
        let Some((lo, hi)) = self.config.diagnostics.pc_trace else {
            return;
        };
        let pc = self.cpu.pc & !1;
        if pc >= lo && pc <= hi {
            tracing::trace!(pc, "pc-trace");
        }
    }

    fn trace_stack(&self, sp_before: u32) {
        let sp_after = self.cpu.active_sp();
        if self.config.diagnostics.stack_trace && sp_after != sp_before {
            tracing::debug!(sp_before, sp_after, "stack-trace");
        }
        let splim = self.cpu.active_splim();
        if self.config.diagnostics.splim_trace && splim != 0 && sp_after < splim.saturating_add(32) {
            tracing::warn!(sp = sp_after, splim, "splim-trace: approaching stack limit");
        }
    }

    fn read_memwatch(&mut self) -> Option<u32> {
        let (addr, size) = self.config.diagnostics.memwatch?;
        self.mem.raw_read(addr, size.clamp(1, 4) as u8)
    }

    fn trace_memwatch(&mut self, before: Option<u32>) {
        if self.config.diagnostics.memwatch.is_none() {
            return;
        }
        let after = self.read_memwatch();
        if after != before {
            let (addr, _) = self.config.diagnostics.memwatch.unwrap();
            tracing::debug!(addr, ?before, ?after, "memwatch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boots_from_loaded_image_and_executes() {
        let config = SocConfig::generic();
        let mut image = vec![0xFFu8; config.flash_size as usize];
        // word0 = initial MSP, word1 = reset PC.
        image[0..4].copy_from_slice(&0x3004_0000u32.to_le_bytes());
        image[4..8].copy_from_slice(&(config.flash_base_s + 0x100).to_le_bytes());
        // MOVS r0, #7 at the reset PC.
        let pc_off = 0x100usize;
        image[pc_off..pc_off + 2].copy_from_slice(&0x2007u16.to_le_bytes());

        let mut emu = Emulator::new(
            config,
            &[FlashImage {
                bytes: image,
                offset: 0,
            }],
        )
        .unwrap();
        assert_eq!(emu.cpu.secure.msp, 0x3004_0000);
        emu.step();
        assert_eq!(emu.cpu.regs[0], 7);
    }

    #[test]
    fn oversized_image_is_rejected() {
        let config = SocConfig::generic();
        let image = vec![0u8; config.flash_size as usize + 1];
        let err = Emulator::new(
            config,
            &[FlashImage {
                bytes: image,
                offset: 0,
            }],
        );
        assert!(matches!(err, Err(EmulatorError::ImageTooLarge { .. })));
    }
}
