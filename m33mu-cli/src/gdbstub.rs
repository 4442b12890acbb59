//! A minimal GDB remote-serial-protocol server: pause/resume/step, mem/reg
//! read-write, and breakpoints, all expressed as one blocking TCP session
//! on the CLI's own thread. It observes an [`Emulator`]; the core has no
//! knowledge of it.

use anyhow::{Context, Result};
use m33mu_core::Emulator;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

pub fn serve(addr: &str, mut emu: Emulator) -> Result<()> {
    let listener = TcpListener::bind(addr).with_context(|| format!("binding GDB stub to {addr}"))?;
    tracing::info!(%addr, "GDB stub listening, awaiting client");
    let (stream, peer) = listener.accept()?;
    tracing::info!(%peer, "GDB client connected");
    let mut session = Session {
        stream,
        emu: &mut emu,
        breakpoints: Vec::new(),
    };
    session.run()
}

struct Session<'a> {
    stream: TcpStream,
    emu: &'a mut Emulator,
    breakpoints: Vec<u32>,
}

impl<'a> Session<'a> {
    fn run(&mut self) -> Result<()> {
        loop {
            let packet = match self.read_packet()? {
                Some(p) => p,
                None => return Ok(()),
            };
            self.dispatch(&packet)?;
        }
    }

    fn read_packet(&mut self) -> Result<Option<String>> {
        let mut byte = [0u8; 1];
        loop {
            if self.stream.read(&mut byte)? == 0 {
                return Ok(None);
            }
            match byte[0] {
                b'$' => break,
                0x03 => {
                    // Ctrl-C: halt and report immediately.
                    self.send_reply("S05")?;
                }
                _ => continue,
            }
        }
        let mut body = Vec::new();
        loop {
            if self.stream.read(&mut byte)? == 0 {
                return Ok(None);
            }
            if byte[0] == b'#' {
                break;
            }
            body.push(byte[0]);
        }
        let mut checksum = [0u8; 2];
        self.stream.read_exact(&mut checksum)?;
        self.stream.write_all(b"+")?;
        Ok(Some(String::from_utf8_lossy(&body).into_owned()))
    }

    fn send_reply(&mut self, body: &str) -> Result<()> {
        let checksum: u8 = body.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        write!(self.stream, "${body}#{checksum:02x}")?;
        self.stream.flush()?;
        Ok(())
    }

    fn dispatch(&mut self, packet: &str) -> Result<()> {
        let mut chars = packet.chars();
        match chars.next() {
            Some('?') => self.send_reply("S05"),
            Some('g') => self.read_registers(),
            Some('G') => self.write_registers(chars.as_str()),
            Some('m') => self.read_memory(chars.as_str()),
            Some('M') => self.write_memory(chars.as_str()),
            Some('c') => {
                self.resume();
                self.send_reply("S05")
            }
            Some('s') => {
                self.emu.step();
                self.send_reply("S05")
            }
            Some('Z') => self.set_breakpoint(chars.as_str()),
            Some('z') => self.clear_breakpoint(chars.as_str()),
            Some('k') => Ok(()),
            _ => self.send_reply(""),
        }
    }

    fn read_registers(&mut self) -> Result<()> {
        let mut out = String::new();
        for n in 0..13 {
            out.push_str(&hex_le(self.emu.cpu.regs[n]));
        }
        out.push_str(&hex_le(self.emu.cpu.active_sp()));
        out.push_str(&hex_le(self.emu.cpu.regs[14]));
        out.push_str(&hex_le(self.emu.cpu.pc & !1));
        out.push_str(&hex_le(self.emu.cpu.xpsr.encode()));
        self.send_reply(&out)
    }

    fn write_registers(&mut self, payload: &str) -> Result<()> {
        let words: Vec<u32> = payload
            .as_bytes()
            .chunks(8)
            .filter_map(|c| std::str::from_utf8(c).ok())
            .filter_map(parse_le_hex)
            .collect();
        for (n, value) in words.iter().take(13).enumerate() {
            self.emu.cpu.regs[n] = *value;
        }
        if let Some(pc) = words.get(15) {
            self.emu.cpu.pc = pc | 1;
        }
        self.send_reply("OK")
    }

    fn read_memory(&mut self, args: &str) -> Result<()> {
        let Some((addr, len)) = parse_addr_len(args) else {
            return self.send_reply("E01");
        };
        let mut out = String::new();
        for i in 0..len {
            match self.emu.mem.raw_read(addr.wrapping_add(i), 1) {
                Some(byte) => out.push_str(&format!("{:02x}", byte as u8)),
                None => return self.send_reply("E14"),
            }
        }
        self.send_reply(&out)
    }

    fn write_memory(&mut self, args: &str) -> Result<()> {
        let Some((header, data)) = args.split_once(':') else {
            return self.send_reply("E01");
        };
        let Some((addr, _len)) = parse_addr_len(header) else {
            return self.send_reply("E01");
        };
        for (i, chunk) in data.as_bytes().chunks(2).enumerate() {
            let Ok(text) = std::str::from_utf8(chunk) else {
                return self.send_reply("E01");
            };
            let Ok(byte) = u8::from_str_radix(text, 16) else {
                return self.send_reply("E01");
            };
            self.emu.mem.flash_writable = true;
            if !self.emu.mem.raw_write(addr.wrapping_add(i as u32), 1, byte as u32) {
                return self.send_reply("E14");
            }
        }
        self.send_reply("OK")
    }

    fn set_breakpoint(&mut self, args: &str) -> Result<()> {
        if let Some((addr, _)) = parse_z_packet(args) {
            if !self.breakpoints.contains(&addr) {
                self.breakpoints.push(addr);
            }
        }
        self.send_reply("OK")
    }

    fn clear_breakpoint(&mut self, args: &str) -> Result<()> {
        if let Some((addr, _)) = parse_z_packet(args) {
            self.breakpoints.retain(|&b| b != addr);
        }
        self.send_reply("OK")
    }

    fn resume(&mut self) {
        loop {
            self.emu.step();
            let pc = self.emu.cpu.pc & !1;
            if self.breakpoints.contains(&pc) {
                return;
            }
        }
    }
}

fn hex_le(value: u32) -> String {
    value
        .to_le_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn parse_le_hex(text: &str) -> Option<u32> {
    let mut bytes = [0u8; 4];
    for (i, chunk) in text.as_bytes().chunks(2).take(4).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        bytes[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(u32::from_le_bytes(bytes))
}

fn parse_addr_len(s: &str) -> Option<(u32, u32)> {
    let (addr, len) = s.split_once(',')?;
    Some((
        u32::from_str_radix(addr, 16).ok()?,
        u32::from_str_radix(len, 16).ok()?,
    ))
}

fn parse_z_packet(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.splitn(3, ',');
    let _kind = parts.next()?;
    let addr = u32::from_str_radix(parts.next()?, 16).ok()?;
    let len = u32::from_str_radix(parts.next()?, 16).ok()?;
    Some((addr, len))
}
