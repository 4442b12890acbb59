//! Typed configuration: per-SoC memory map and diagnostic toggles threaded
//! through construction instead of held as process-wide globals.

/// Memory-layout and clock parameters for one target SoC.
#[derive(Debug, Clone)]
pub struct SocConfig {
    pub flash_base_s: u32,
    pub flash_base_ns: u32,
    pub flash_size: u32,

    pub ram_banks: Vec<RamBank>,

    /// Number of externally-routable NVIC interrupt lines.
    pub num_irq: usize,
    pub cpu_hz: u64,
    /// SysTick `CALIB.TENMS` field, used when no explicit hertz override is set.
    pub systick_calib_tenms: u32,

    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Copy)]
pub struct RamBank {
    pub base_s: u32,
    pub base_ns: u32,
    pub size: u32,
}

/// Diagnostic toggles, read once at startup from CLI flags / environment
/// variables and never consulted as globals thereafter.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Inclusive PC range to trace, from `M33MU_PC_TRACE=start-end`.
    pub pc_trace: Option<(u32, u32)>,
    /// Address (and optional size) to watch for reads/writes, from `M33MU_MEMWATCH`.
    pub memwatch: Option<(u32, u32)>,
    pub stack_trace: bool,
    pub splim_trace: bool,
    /// 0 = off, 1 = info, 2 = debug, 3 = trace, from `M33MU_PROT_TRACE`.
    pub prot_trace: u8,
}

impl Diagnostics {
    /// Reads the documented `M33MU_*` variables once. Intended to be called
    /// exactly once, at process startup.
    pub fn from_env() -> Self {
        let pc_trace = std::env::var("M33MU_PC_TRACE").ok().and_then(|s| {
            let (lo, hi) = s.split_once('-')?;
            Some((parse_hex_or_dec(lo)?, parse_hex_or_dec(hi)?))
        });
        let memwatch = std::env::var("M33MU_MEMWATCH").ok().and_then(|s| {
            let (addr, size) = match s.split_once(':') {
                Some((a, sz)) => (a, parse_hex_or_dec(sz).unwrap_or(4)),
                None => (s.as_str(), 4),
            };
            Some((parse_hex_or_dec(addr)?, size))
        });
        let prot_trace = std::env::var("M33MU_PROT_TRACE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Diagnostics {
            pc_trace,
            memwatch,
            stack_trace: std::env::var_os("M33MU_STACK_TRACE").is_some(),
            splim_trace: std::env::var_os("M33MU_SPLIM_TRACE").is_some(),
            prot_trace,
        }
    }
}

fn parse_hex_or_dec(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

impl SocConfig {
    /// A small generic target used by tests and as the CLI default: 1 MiB
    /// flash, one 256 KiB RAM bank, 64 external IRQ lines.
    pub fn generic() -> Self {
        SocConfig {
            flash_base_s: 0x0C00_0000,
            flash_base_ns: 0x0000_0000,
            flash_size: 1024 * 1024,
            ram_banks: vec![RamBank {
                base_s: 0x3000_0000,
                base_ns: 0x2000_0000,
                size: 256 * 1024,
            }],
            num_irq: 64,
            cpu_hz: 48_000_000,
            systick_calib_tenms: 48_000_000 / 100,
            diagnostics: Diagnostics::default(),
        }
    }
}
