//! The memory bus: flash/RAM backings plus a region table of MMIO devices.
//! Peripherals are `Box<dyn MmioDevice>` trait objects rather than addresses
//! over physical hardware, since the "hardware" here has no physical address
//! of its own -- only the owned Rust value does.

use crate::cpu::Security;
use crate::error::EmulatorError;

pub const ACCESS_SIZES: [u8; 3] = [1, 2, 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

#[derive(Debug, Clone, Copy)]
pub struct AccessContext {
    pub security: Security,
    pub kind: AccessKind,
}

/// Implemented by every bundled or external MMIO peripheral.
pub trait MmioDevice {
    fn read(&mut self, offset: u32, size: u8) -> Option<u32>;
    fn write(&mut self, offset: u32, size: u8, value: u32) -> bool;
}

struct MmioRegion {
    base: u32,
    size: u32,
    device: Box<dyn MmioDevice>,
}

#[derive(Debug, Clone, Copy)]
pub struct RamBankLayout {
    pub base_s: u32,
    pub base_ns: u32,
    pub size: u32,
    pub storage_offset: u32,
}

pub struct MemoryBus {
    pub flash_base_s: u32,
    pub flash_base_ns: u32,
    pub flash: Vec<u8>,
    pub flash_writable: bool,
    pub ram_banks: Vec<RamBankLayout>,
    pub ram: Vec<u8>,
    mmio: Vec<MmioRegion>,
}

impl MemoryBus {
    pub fn new(flash_base_s: u32, flash_base_ns: u32, flash_size: u32) -> Self {
        MemoryBus {
            flash_base_s,
            flash_base_ns,
            flash: vec![0xFF; flash_size as usize],
            flash_writable: false,
            ram_banks: Vec::new(),
            ram: Vec::new(),
            mmio: Vec::new(),
        }
    }

    pub fn add_ram_bank(&mut self, base_s: u32, base_ns: u32, size: u32) {
        let storage_offset = self.ram.len() as u32;
        self.ram.resize(self.ram.len() + size as usize, 0);
        self.ram_banks.push(RamBankLayout {
            base_s,
            base_ns,
            size,
            storage_offset,
        });
    }

    pub fn register_mmio(
        &mut self,
        base: u32,
        size: u32,
        device: Box<dyn MmioDevice>,
    ) -> Result<(), EmulatorError> {
        for region in &self.mmio {
            let a_end = base as u64 + size as u64;
            let b_end = region.base as u64 + region.size as u64;
            if (base as u64) < b_end && (region.base as u64) < a_end {
                return Err(EmulatorError::OverlappingMmioRegion {
                    new: (base, size),
                    existing: (region.base, region.size),
                });
            }
        }
        self.mmio.push(MmioRegion { base, size, device });
        Ok(())
    }

    /// Loads `image` into flash at `offset`. Overlapping loads warn and let
    /// the later image win.
    pub fn load_flash_image(&mut self, image: &[u8], offset: u32) -> Result<(), EmulatorError> {
        let end = offset as usize + image.len();
        if end > self.flash.len() {
            return Err(EmulatorError::ImageTooLarge {
                path: Default::default(),
                size: image.len(),
                offset,
                flash_size: self.flash.len(),
            });
        }
        if self.flash[offset as usize..end].iter().any(|&b| b != 0xFF) {
            tracing::warn!(offset, size = image.len(), "overlapping flash image load, later image wins");
        }
        self.flash[offset as usize..end].copy_from_slice(image);
        Ok(())
    }

    fn flash_offset(&self, addr: u32) -> Option<usize> {
        let from_s = addr.checked_sub(self.flash_base_s);
        if let Some(off) = from_s {
            if (off as usize) < self.flash.len() {
                return Some(off as usize);
            }
        }
        let from_ns = addr.checked_sub(self.flash_base_ns);
        if let Some(off) = from_ns {
            if (off as usize) < self.flash.len() {
                return Some(off as usize);
            }
        }
        None
    }

    fn ram_offset(&self, addr: u32) -> Option<usize> {
        for bank in &self.ram_banks {
            if let Some(off) = addr.checked_sub(bank.base_s) {
                if off < bank.size {
                    return Some((bank.storage_offset + off) as usize);
                }
            }
            if let Some(off) = addr.checked_sub(bank.base_ns) {
                if off < bank.size {
                    return Some((bank.storage_offset + off) as usize);
                }
            }
        }
        None
    }

    fn mmio_region_mut(&mut self, addr: u32) -> Option<(&mut MmioRegion, u32)> {
        self.mmio
            .iter_mut()
            .find(|r| addr >= r.base && addr < r.base.saturating_add(r.size))
            .map(|r| {
                let off = addr - r.base;
                (r, off)
            })
    }

    /// Reads `size` bytes (little-endian) with no access gating. Callers
    /// that need gating go through [`crate::scs::Scs::access_gate`] first.
    pub fn raw_read(&mut self, addr: u32, size: u8) -> Option<u32> {
        if let Some(off) = self.flash_offset(addr) {
            return read_le(&self.flash, off, size);
        }
        if let Some(off) = self.ram_offset(addr) {
            return read_le(&self.ram, off, size);
        }
        if let Some((region, off)) = self.mmio_region_mut(addr) {
            return region.device.read(off, size);
        }
        None
    }

    pub fn raw_write(&mut self, addr: u32, size: u8, value: u32) -> bool {
        if let Some(off) = self.flash_offset(addr) {
            if !self.flash_writable {
                return false;
            }
            return write_le(&mut self.flash, off, size, value);
        }
        if let Some(off) = self.ram_offset(addr) {
            return write_le(&mut self.ram, off, size, value);
        }
        if let Some((region, off)) = self.mmio_region_mut(addr) {
            return region.device.write(off, size, value);
        }
        false
    }
}

fn read_le(buf: &[u8], off: usize, size: u8) -> Option<u32> {
    let size = size as usize;
    if off + size > buf.len() {
        return None;
    }
    let mut bytes = [0u8; 4];
    bytes[..size].copy_from_slice(&buf[off..off + size]);
    Some(u32::from_le_bytes(bytes))
}

fn write_le(buf: &mut [u8], off: usize, size: u8, value: u32) -> bool {
    let size = size as usize;
    if off + size > buf.len() {
        return false;
    }
    let bytes = value.to_le_bytes();
    buf[off..off + size].copy_from_slice(&bytes[..size]);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_round_trips() {
        let mut bus = MemoryBus::new(0x0C00_0000, 0x0000_0000, 0x1000);
        bus.add_ram_bank(0x3000_0000, 0x2000_0000, 0x1000);
        assert!(bus.raw_write(0x2000_0010, 4, 0xDEAD_BEEF));
        assert_eq!(bus.raw_read(0x2000_0010, 4), Some(0xDEAD_BEEF));
        // Same bank, Secure alias, same bytes.
        assert_eq!(bus.raw_read(0x3000_0010, 4), Some(0xDEAD_BEEF));
    }

    #[test]
    fn flash_write_fails_without_callback() {
        let mut bus = MemoryBus::new(0x0C00_0000, 0x0000_0000, 0x1000);
        assert!(!bus.raw_write(0x0C00_0000, 4, 1));
        assert_eq!(bus.raw_read(0x0C00_0000, 4), Some(0xFFFF_FFFF));
    }

    struct Echo(u32);
    impl MmioDevice for Echo {
        fn read(&mut self, _offset: u32, _size: u8) -> Option<u32> {
            Some(self.0)
        }
        fn write(&mut self, _offset: u32, _size: u8, value: u32) -> bool {
            self.0 = value;
            true
        }
    }

    #[test]
    fn mmio_dispatches_to_registered_region() {
        let mut bus = MemoryBus::new(0x0C00_0000, 0x0000_0000, 0x1000);
        bus.register_mmio(0x4000_0000, 0x100, Box::new(Echo(7))).unwrap();
        assert_eq!(bus.raw_read(0x4000_0004, 4), Some(7));
        assert!(bus.raw_write(0x4000_0004, 4, 42));
        assert_eq!(bus.raw_read(0x4000_0004, 4), Some(42));
    }

    #[test]
    fn overlapping_mmio_is_rejected() {
        let mut bus = MemoryBus::new(0x0C00_0000, 0x0000_0000, 0x1000);
        bus.register_mmio(0x4000_0000, 0x100, Box::new(Echo(0))).unwrap();
        let err = bus.register_mmio(0x4000_0080, 0x100, Box::new(Echo(0)));
        assert!(err.is_err());
    }
}
