//! Armv8-M MPU model: one register bank per security state, eight regions
//! each, highest-numbered-enabled-region-wins lookup. RBAR/RLAR are held as
//! a plain owned array rather than addressed through a hardware pointer,
//! since there is no physical MPU behind this model.

use tock_registers::fields::FieldValue;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::InMemoryRegister;
use tock_registers::{register_bitfields, LocalRegisterCopy};

register_bitfields![u32,
    pub MPU_CTRL [
        PRIVDEFENA OFFSET(2) NUMBITS(1) [],
        HFNMIENA OFFSET(1) NUMBITS(1) [],
        ENABLE OFFSET(0) NUMBITS(1) [],
    ],
    pub MPU_RBAR [
        BASE OFFSET(5) NUMBITS(27) [],
        SH OFFSET(3) NUMBITS(2) [],
        AP OFFSET(1) NUMBITS(2) [],
        XN OFFSET(0) NUMBITS(1) [
            Enable = 0,
            Disable = 1,
        ],
    ],
    pub MPU_RLAR [
        LIMIT OFFSET(5) NUMBITS(27) [],
        PXN OFFSET(4) NUMBITS(1) [],
        ATTRINDX OFFSET(1) NUMBITS(3) [],
        ENABLE OFFSET(0) NUMBITS(1) [],
    ],
];

pub const NUM_MPU_REGIONS: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct MpuRegion {
    pub rbar: u32,
    pub rlar: u32,
}

#[derive(Debug, Clone)]
pub struct Mpu {
    pub ctrl: LocalRegisterCopy<u32, MPU_CTRL::Register>,
    pub rnr: u8,
    pub regions: [MpuRegion; NUM_MPU_REGIONS],
    pub mair0: u32,
    pub mair1: u32,
}

impl Default for Mpu {
    fn default() -> Self {
        Mpu {
            ctrl: LocalRegisterCopy::new(0),
            rnr: 0,
            regions: [MpuRegion::default(); NUM_MPU_REGIONS],
            mair0: 0,
            mair1: 0,
        }
    }
}

impl Mpu {
    pub fn enabled(&self) -> bool {
        self.ctrl.is_set(MPU_CTRL::ENABLE)
    }

    pub fn set_region(&mut self, index: usize, base: u32, limit: u32, xn: bool, enable: bool) {
        let rbar = InMemoryRegister::<u32, MPU_RBAR::Register>::new(0);
        rbar.write(
            MPU_RBAR::BASE.val(base >> 5)
                + if xn {
                    MPU_RBAR::XN::Disable
                } else {
                    MPU_RBAR::XN::Enable
                },
        );
        let rlar = InMemoryRegister::<u32, MPU_RLAR::Register>::new(0);
        let mut value: FieldValue<u32, MPU_RLAR::Register> = MPU_RLAR::LIMIT.val(limit >> 5);
        if enable {
            value += MPU_RLAR::ENABLE.val(1);
        }
        rlar.write(value);
        self.regions[index] = MpuRegion {
            rbar: rbar.get(),
            rlar: rlar.get(),
        };
    }

    /// Returns the highest-numbered enabled region covering `addr`, if any.
    fn matching_region(&self, addr: u32) -> Option<(usize, MpuRegion)> {
        self.regions
            .iter()
            .enumerate()
            .rev()
            .find(|(_, r)| {
                let rlar = LocalRegisterCopy::<u32, MPU_RLAR::Register>::new(r.rlar);
                if !rlar.is_set(MPU_RLAR::ENABLE) {
                    return false;
                }
                let rbar = LocalRegisterCopy::<u32, MPU_RBAR::Register>::new(r.rbar);
                let base = rbar.read(MPU_RBAR::BASE) << 5;
                let limit = (rlar.read(MPU_RLAR::LIMIT) << 5) | 0x1F;
                addr >= base && addr <= limit
            })
            .map(|(i, r)| (i, *r))
    }

    /// `true` iff fetching `addr` is blocked by execute-never.
    pub fn is_xn_exec(&self, addr: u32) -> bool {
        if !self.enabled() {
            return false;
        }
        match self.matching_region(addr) {
            Some((_, r)) => {
                let rbar = LocalRegisterCopy::<u32, MPU_RBAR::Register>::new(r.rbar);
                rbar.read(MPU_RBAR::XN) != 0
            }
            None => !self.ctrl.is_set(MPU_CTRL::PRIVDEFENA),
        }
    }

    /// `true` iff `addr` falls within some enabled region (the access
    /// permission check proper -- read/write AP bits are not modelled
    /// beyond XN, matching this crate's Non-goals).
    pub fn region_allows(&self, addr: u32) -> bool {
        if !self.enabled() {
            return true;
        }
        self.matching_region(addr).is_some() || self.ctrl.is_set(MPU_CTRL::PRIVDEFENA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_mpu_allows_everything() {
        let mpu = Mpu::default();
        assert!(!mpu.is_xn_exec(0x2000_0000));
        assert!(mpu.region_allows(0x2000_0000));
    }

    #[test]
    fn highest_numbered_enabled_region_wins() {
        let mut mpu = Mpu::default();
        mpu.ctrl.write(MPU_CTRL::ENABLE.val(1));
        mpu.set_region(0, 0x2000_0000, 0x2000_0FFF, true, true);
        mpu.set_region(1, 0x2000_0000, 0x2000_0FFF, false, true);
        assert!(!mpu.is_xn_exec(0x2000_0010));
        mpu.set_region(2, 0x2000_0000, 0x2000_0FFF, true, true);
        assert!(mpu.is_xn_exec(0x2000_0010));
    }

    #[test]
    fn disabled_region_is_skipped() {
        let mut mpu = Mpu::default();
        mpu.ctrl.write(MPU_CTRL::ENABLE.val(1));
        mpu.set_region(0, 0x2000_0000, 0x2000_0FFF, false, true);
        mpu.set_region(1, 0x2000_0000, 0x2000_0FFF, true, false);
        assert!(!mpu.is_xn_exec(0x2000_0010));
    }
}
