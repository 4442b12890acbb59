//! Property tests for invariants that should hold over all inputs, not just
//! the literal cases already covered by unit tests: SPLIM enforcement,
//! EXC_RETURN round-tripping, ITSTATE/xPSR encoding, SAU/MPU attribution,
//! memory round-trips, and the exclusive monitor.

use m33mu_core::cpu::{Cpu, Mode, Security, Xpsr};
use m33mu_core::exception::ExcReturn;
use m33mu_core::it::ItState;
use m33mu_core::mem::MemoryBus;
use m33mu_core::mpu::Mpu;
use m33mu_core::sau::{Sau, SAU_CTRL};
use proptest::prelude::*;

proptest! {
    /// `set_active_sp` either accepts a value at or above SPLIM, or leaves
    /// the stack pointer untouched -- never a partial or out-of-range write.
    #[test]
    fn active_sp_write_respects_splim(limit in any::<u32>(), value in any::<u32>()) {
        let mut cpu = Cpu::default();
        cpu.secure.msplim = limit;
        let before = cpu.active_sp();
        let accepted = cpu.set_active_sp(value);
        if limit != 0 && value < limit {
            prop_assert!(!accepted);
            prop_assert_eq!(cpu.active_sp(), before);
        } else {
            prop_assert!(accepted);
            prop_assert_eq!(cpu.active_sp(), value);
        }
    }

    /// Every value `ExcReturn` can itself produce decodes back to the same
    /// fields -- `use_psp` is only meaningful when `to_thread` is set, so
    /// it's derived from `to_thread` rather than sampled independently.
    #[test]
    fn exc_return_round_trips_for_all_field_combinations(
        secure in any::<bool>(),
        to_thread in any::<bool>(),
        use_psp_raw in any::<bool>(),
    ) {
        let original = ExcReturn {
            target_security: if secure { Security::Secure } else { Security::NonSecure },
            to_thread,
            use_psp: to_thread && use_psp_raw,
        };
        let encoded = original.encode();
        prop_assert!(ExcReturn::is_exc_return(encoded));
        let decoded = ExcReturn::decode(encoded).unwrap();
        prop_assert_eq!(decoded, original);
    }

    /// `ItState`'s xPSR-field split (`hi6`/`lo2`) is a bijection with the raw
    /// `cond<<4 | mask` form for every encodable IT instruction.
    #[test]
    fn it_state_xpsr_bits_round_trip(cond in 0u8..16, mask in 0u8..16) {
        let it = ItState::from_it_instruction(cond, mask);
        let reconstructed = ItState::from_xpsr_bits(it.hi6(), it.lo2());
        prop_assert_eq!(it, reconstructed);
        prop_assert_eq!(reconstructed.condition(), cond);
        prop_assert_eq!(reconstructed.pattern(), mask);
    }

    /// `Xpsr::encode`/`decode` round-trip every flag and field combination,
    /// not just the one literal case in `cpu.rs`.
    #[test]
    fn xpsr_round_trips_for_arbitrary_fields(
        n in any::<bool>(), z in any::<bool>(), c in any::<bool>(), v in any::<bool>(), q in any::<bool>(),
        ge in 0u8..16, ipsr in 0u16..512, cond in 0u8..16, mask in 0u8..16,
    ) {
        let xpsr = Xpsr {
            n, z, c, v, q, ge, ipsr,
            it: ItState::from_it_instruction(cond, mask),
        };
        let decoded = Xpsr::decode(xpsr.encode());
        prop_assert_eq!(decoded.n, n);
        prop_assert_eq!(decoded.z, z);
        prop_assert_eq!(decoded.c, c);
        prop_assert_eq!(decoded.v, v);
        prop_assert_eq!(decoded.q, q);
        prop_assert_eq!(decoded.ge, ge);
        prop_assert_eq!(decoded.ipsr, ipsr);
        prop_assert_eq!(decoded.it, xpsr.it);
    }

    /// With the SAU disabled, every address attributes Secure regardless of
    /// what the (inert) region table holds.
    #[test]
    fn sau_disabled_always_attributes_secure(
        addr in any::<u32>(),
        base in any::<u32>(),
        limit in any::<u32>(),
        nsc in any::<bool>(),
    ) {
        let mut sau = Sau::default();
        sau.set_region(0, base, limit, nsc, true);
        prop_assert_eq!(sau.attr_for_addr(addr), m33mu_core::sau::SauAttr::Secure);
    }

    /// With the SAU enabled and no region matching, attribution falls back
    /// to ALLNS for every address.
    #[test]
    fn sau_unmatched_address_follows_allns(addr in any::<u32>(), allns in any::<bool>()) {
        let mut sau = Sau::default();
        sau.ctrl.write(SAU_CTRL::ENABLE.val(1) + SAU_CTRL::ALLNS.val(allns as u32));
        let expected = if allns {
            m33mu_core::sau::SauAttr::NonSecure
        } else {
            m33mu_core::sau::SauAttr::Secure
        };
        prop_assert_eq!(sau.attr_for_addr(addr), expected);
    }

    /// A disabled MPU never blocks a fetch and never denies a region lookup,
    /// for any address.
    #[test]
    fn mpu_disabled_never_blocks_exec(addr in any::<u32>()) {
        let mpu = Mpu::default();
        prop_assert!(!mpu.is_xn_exec(addr));
        prop_assert!(mpu.region_allows(addr));
    }

    /// A word/halfword/byte written into a RAM bank reads back exactly the
    /// bytes written, for every in-bounds offset and size.
    #[test]
    fn ram_round_trips_for_arbitrary_offset_and_size(
        offset in 0u32..0xFF0,
        size_idx in 0usize..3,
        value in any::<u32>(),
    ) {
        let size = [1u8, 2, 4][size_idx];
        let mut bus = MemoryBus::new(0x0C00_0000, 0x0000_0000, 0x1000);
        bus.add_ram_bank(0x2000_0000, 0x3000_0000, 0x1000);
        let addr = 0x2000_0000u32 + offset;
        let masked = value & (0xFFFF_FFFFu64 >> (32 - size as u32 * 8)) as u32;
        prop_assert!(bus.raw_write(addr, size, masked));
        prop_assert_eq!(bus.raw_read(addr, size), Some(masked));
    }

    /// `STREX`-style exclusive check succeeds exactly once per `LDREX`-style
    /// set, for any address/size/security combination, and a mismatched
    /// address or size never matches.
    #[test]
    fn exclusive_monitor_matches_exactly_the_set_access(
        addr in any::<u32>(),
        other_addr in any::<u32>(),
        size_idx in 0usize..3,
        other_size_idx in 0usize..3,
    ) {
        let size = [1u8, 2, 4][size_idx];
        let other_size = [1u8, 2, 4][other_size_idx];
        let mut cpu = Cpu::default();
        cpu.mode = Mode::Thread;
        cpu.exclusive_set(addr, size);
        if other_addr == addr && other_size == size {
            prop_assert!(cpu.exclusive_check_and_clear(other_addr, other_size));
        } else {
            prop_assert!(!cpu.exclusive_check_and_clear(other_addr, other_size));
        }
        // Either way the monitor is consumed: a second check never matches.
        prop_assert!(!cpu.exclusive_check_and_clear(addr, size));
    }
}
