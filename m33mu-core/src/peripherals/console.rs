//! A single semihosting-style MMIO word: firmware writes an ASCII byte at
//! offset 0 to report pass/fail, used by the bundled integration tests'
//! firmware images so they don't need a real UART.

use crate::mem::MmioDevice;
use std::io::Write;

pub struct DebugConsole {
    sink: Box<dyn Write + Send>,
    pub last_byte: Option<u8>,
}

impl DebugConsole {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        DebugConsole {
            sink,
            last_byte: None,
        }
    }
}

impl MmioDevice for DebugConsole {
    fn read(&mut self, _offset: u32, _size: u8) -> Option<u32> {
        Some(self.last_byte.unwrap_or(0) as u32)
    }

    fn write(&mut self, offset: u32, _size: u8, value: u32) -> bool {
        if offset != 0 {
            return false;
        }
        let byte = value as u8;
        self.last_byte = Some(byte);
        let _ = self.sink.write_all(&[byte]);
        let _ = self.sink.flush();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_records_last_byte_and_forwards_to_sink() {
        let mut console = DebugConsole::new(Box::new(std::io::sink()));
        assert!(console.write(0, 1, b'P' as u32));
        assert_eq!(console.last_byte, Some(b'P'));
        assert_eq!(console.read(0, 1), Some(b'P' as u32));
    }

    #[test]
    fn write_outside_the_single_register_is_rejected() {
        let mut console = DebugConsole::new(Box::new(std::io::sink()));
        assert!(!console.write(4, 1, 0));
    }
}
