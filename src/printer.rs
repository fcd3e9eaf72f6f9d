// 1403 line printer.  A Write pulls channel bytes into the line buffer and
// prints on completion; carriage control moves the forms either as part of
// the write or through immediate control commands; the forms-control buffer
// drives channel skips and page boundaries.

use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::rc::{Rc, Weak};

use log::warn;

use crate::channel::ChanPtr;
use crate::debug::DebugMask;
use crate::dev_trace;
use crate::device::{sense, DevAddr, Device, DevRef, UnitStat};
use crate::error::{Error, Result};
use crate::event::Sched;
use crate::hollerith::{ebcdic_to_ascii, NO_ASCII};

/// Line buffer is wider than the print train so over-long writes park
/// harmlessly.
const LINE_BUF: usize = 140;
pub const PRINT_WIDTH: usize = 132;

const PRINT_TIME: u32 = 5000;
const CARRIAGE_TIME: u32 = 2000;
const UCS_TIME: u32 = 1000;

// Scheduler arguments.
const SRV_WRITE: i32 = 1;
const SRV_CARRIAGE: i32 = 2;
const SRV_UCS: i32 = 3;

// Device-unique sense bit: channel 9 passed under the print line.
pub const SENSE_CHAN9: u8 = 0x01;

/// Forms-control buffer entry: channel c marks bit `1 << (c-1)`, bit 0x1000
/// loops the tape back to the top of the form.
pub const FCB_TOF: u16 = 0x1000;

fn ch(c: u16) -> u16 {
    1 << (c - 1)
}

fn fcb_none() -> Vec<u16> {
    let mut tape = vec![0u16; 66];
    tape[0] = FCB_TOF | ch(1);
    tape
}

fn fcb_std1() -> Vec<u16> {
    let mut tape = vec![0u16; 66];
    tape[0] = FCB_TOF | ch(1);
    tape[59] = ch(9);
    tape[62] = ch(12);
    tape
}

fn fcb_legacy() -> Vec<u16> {
    let mut tape = vec![0u16; 66];
    tape[0] = FCB_TOF | ch(1);
    for (i, line) in (6..=42).step_by(6).enumerate() {
        tape[line] = ch(2 + i as u16);
    }
    tape[48] = ch(10);
    tape[54] = ch(11);
    tape[59] = ch(9);
    tape[62] = ch(12);
    tape
}

pub fn fcb_by_name(name: &str) -> Option<Vec<u16>> {
    match name.to_ascii_uppercase().as_str() {
        "LEGACY" => Some(fcb_legacy()),
        "STD1" => Some(fcb_std1()),
        "NONE" => Some(fcb_none()),
        _ => None,
    }
}

pub struct Printer1403 {
    addr: DevAddr,
    chan: ChanPtr,
    sched: Sched,
    me: Weak<RefCell<Printer1403>>,
    file: Option<File>,
    file_name: Option<String>,
    buf: [u8; LINE_BUF],
    col: usize,
    fcb: Vec<u16>,
    lines_per_page: usize,
    line: usize,
    cmd: u8,
    sense: u8,
    sup_datachk: bool,
    chan12_seen: bool,
    debug: DebugMask,
}

impl Printer1403 {
    pub fn new(addr: DevAddr, chan: &ChanPtr, sched: &Sched) -> Rc<RefCell<Printer1403>> {
        crate::device::wrap(
            Printer1403 {
                addr,
                chan: Rc::clone(chan),
                sched: sched.clone(),
                me: Weak::new(),
                file: None,
                file_name: None,
                buf: [0; LINE_BUF],
                col: 0,
                fcb: fcb_legacy(),
                lines_per_page: 66,
                line: 0,
                cmd: 0,
                sense: 0,
                sup_datachk: false,
                chan12_seen: false,
                debug: DebugMask::empty(),
            },
            |d, me| d.me = me,
        )
    }

    fn me(&self) -> DevRef {
        let me = self.me.upgrade().expect("printer registered");
        me
    }

    fn unit(&self) -> String {
        format!("1403 {:03x}", self.addr)
    }

    fn reject(&mut self) -> UnitStat {
        self.sense = sense::CMD_REJ;
        UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK
    }

    /// Completion status, folding in a deferred channel-12 exception.
    fn ending(&mut self) -> UnitStat {
        let mut st = UnitStat::CH_END | UnitStat::DEV_END;
        if self.chan12_seen {
            self.chan12_seen = false;
            st |= UnitStat::UNIT_EXC;
        }
        let hard = sense::EQUIP_CHK | sense::DATA_CHK;
        if self.sense & hard != 0 && !self.sup_datachk {
            st |= UnitStat::UNIT_CHK;
        }
        st
    }

    fn emit_line(&mut self) {
        let mut text: Vec<u8> = self.buf[..self.col.min(PRINT_WIDTH)]
            .iter()
            .map(|&e| match ebcdic_to_ascii(e) {
                NO_ASCII => b' ',
                c if c < 0x20 => b' ',
                c => c,
            })
            .collect();
        while text.last() == Some(&b' ') {
            text.pop();
        }
        text.push(b'\n');
        if let Some(f) = self.file.as_mut() {
            if let Err(e) = f.write_all(&text) {
                warn!("{}: output error: {}", self.unit(), e);
                self.sense = sense::EQUIP_CHK;
            }
        }
        self.col = 0;
        self.buf = [0; LINE_BUF];
    }

    fn page_feed(&mut self) {
        if let Some(f) = self.file.as_mut() {
            let _ = f.write_all(b"\x0c\n");
        }
        self.line = 0;
    }

    fn mark_channels(&mut self) {
        let mark = self.fcb.get(self.line).copied().unwrap_or(0);
        if mark & ch(9) != 0 {
            self.sense |= SENSE_CHAN9;
        }
        if mark & ch(12) != 0 {
            self.chan12_seen = true;
        }
    }

    fn space_lines(&mut self, n: usize) {
        for _ in 0..n {
            self.line += 1;
            let tof = self.fcb.get(self.line).map_or(false, |m| m & FCB_TOF != 0);
            if tof || self.line >= self.lines_per_page || self.line >= self.fcb.len() {
                self.page_feed();
            } else if let Some(f) = self.file.as_mut() {
                let _ = f.write_all(b"\n");
            }
            self.mark_channels();
        }
    }

    fn skip_to_channel(&mut self, c: u16) {
        for _ in 0..self.fcb.len() + 1 {
            self.line += 1;
            let tof = self.fcb.get(self.line).map_or(false, |m| m & FCB_TOF != 0);
            if tof || self.line >= self.lines_per_page || self.line >= self.fcb.len() {
                self.page_feed();
            }
            let mark = self.fcb.get(self.line).copied().unwrap_or(0);
            if mark & ch(c) != 0 {
                break;
            }
        }
        self.mark_channels();
    }
}

impl Device for Printer1403 {
    fn addr(&self) -> DevAddr {
        self.addr
    }

    fn start_io(&mut self) -> UnitStat {
        if self.cmd != 0 {
            UnitStat::BUSY
        } else {
            UnitStat::empty()
        }
    }

    fn start_cmd(&mut self, cmd: u8) -> UnitStat {
        if self.cmd != 0 {
            return UnitStat::BUSY;
        }
        dev_trace!(self.debug, DebugMask::CMD, &self.unit(), "cmd {:02x}", cmd);
        match cmd {
            // Sense transfers the single sense byte.
            0x04 => {
                let b = self.sense;
                self.chan.borrow_mut().chan_write_byte(self.addr, b);
                self.sense = 0;
                UnitStat::CH_END | UnitStat::DEV_END
            }
            // Block/allow data check.
            0x73 => {
                self.sup_datachk = true;
                UnitStat::CH_END | UnitStat::DEV_END
            }
            0x7b => {
                self.sup_datachk = false;
                UnitStat::CH_END | UnitStat::DEV_END
            }
            // Load UCS/UCB: drain and ignore the train image.
            0xf3 | 0xfb => {
                let mut left = 240;
                loop {
                    let (_, end) = self.chan.borrow_mut().chan_read_byte(self.addr);
                    left -= 1;
                    if end || left == 0 {
                        break;
                    }
                }
                self.cmd = cmd;
                self.sched.add_event(&self.me(), SRV_UCS, UCS_TIME);
                UnitStat::empty()
            }
            _ if cmd & 0x07 == 0x01 => {
                if self.file.is_none() {
                    self.sense = sense::INTERVENTION;
                    return UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK;
                }
                self.sense = 0;
                self.col = 0;
                loop {
                    let (b, end) = self.chan.borrow_mut().chan_read_byte(self.addr);
                    if self.col < LINE_BUF {
                        self.buf[self.col] = b;
                        self.col += 1;
                    }
                    if end || self.col >= PRINT_WIDTH {
                        break;
                    }
                }
                self.cmd = cmd;
                self.sched.add_event(&self.me(), SRV_WRITE, PRINT_TIME);
                UnitStat::empty()
            }
            0x03 => UnitStat::CH_END | UnitStat::DEV_END,
            _ if cmd & 0x07 == 0x03 => {
                let op = cmd >> 3;
                match op {
                    1..=3 => {
                        self.space_lines(op as usize);
                    }
                    0x10..=0x1b => {
                        self.skip_to_channel(op as u16 - 0x0f);
                    }
                    _ => return self.reject(),
                }
                self.cmd = cmd;
                self.sched.add_event(&self.me(), SRV_CARRIAGE, CARRIAGE_TIME);
                UnitStat::empty()
            }
            _ => self.reject(),
        }
    }

    fn halt_io(&mut self) -> UnitStat {
        if self.cmd != 0 {
            self.sched.cancel_event(&self.me(), SRV_WRITE);
            self.sched.cancel_event(&self.me(), SRV_CARRIAGE);
            self.sched.cancel_event(&self.me(), SRV_UCS);
            self.cmd = 0;
        }
        UnitStat::CH_END | UnitStat::DEV_END
    }

    fn reset(&mut self) {
        self.cmd = 0;
        self.sense = 0;
        self.col = 0;
        self.line = 0;
        self.chan12_seen = false;
        self.sup_datachk = false;
    }

    fn srv(&mut self, arg: i32) {
        match arg {
            SRV_WRITE => {
                self.emit_line();
                self.space_lines(1);
                self.cmd = 0;
                let st = self.ending();
                self.chan.borrow_mut().chan_end(self.addr, st);
            }
            SRV_CARRIAGE | SRV_UCS => {
                self.cmd = 0;
                let st = self.ending();
                self.chan.borrow_mut().chan_end(self.addr, st);
            }
            _ => {}
        }
    }

    fn attach(&mut self, file: &str) -> Result<()> {
        if self.file.is_some() {
            return Err(Error::AlreadyAttached(file.to_string()));
        }
        self.file = Some(File::create(file)?);
        self.file_name = Some(file.to_string());
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        match self.file.take() {
            Some(mut f) => {
                f.flush()?;
                self.file_name = None;
                Ok(())
            }
            None => Err(Error::NotAttached),
        }
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name.to_ascii_lowercase().as_str() {
            "fcb" => {
                self.fcb = fcb_by_name(value).ok_or_else(|| {
                    Error::Config { line: 0, reason: format!("unknown FCB {}", value) }
                })?;
                self.line = 0;
                Ok(())
            }
            "lpp" | "lines" => {
                let n: usize = value
                    .parse()
                    .map_err(|_| Error::Config { line: 0, reason: format!("bad line count {}", value) })?;
                if n == 0 || n > 100 {
                    return Err(Error::Config {
                        line: 0,
                        reason: format!("lines per page {} out of range", n),
                    });
                }
                self.lines_per_page = n;
                Ok(())
            }
            "file" => self.attach(value),
            _ => Err(Error::Config { line: 0, reason: format!("unknown option {}", name) }),
        }
    }

    fn show(&self) -> String {
        format!(
            "1403 {:03x} {} lpp={} line={}",
            self.addr,
            self.file_name.as_deref().unwrap_or("not attached"),
            self.lines_per_page,
            self.line
        )
    }

    fn set_debug(&mut self, mask: DebugMask) {
        self.debug = mask;
    }

    fn shutdown(&mut self) {
        let _ = self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, CAW_LOC, CC0, CC1};
    use crate::memory::Mem;
    use tempfile::NamedTempFile;

    fn setup() -> (Channel, Rc<RefCell<Printer1403>>, crate::memory::MemPtr, Sched) {
        let mem = Mem::new(64 * 1024);
        let sched = Sched::new();
        let mut chan = Channel::new(Rc::clone(&mem), sched.clone());
        let prt = Printer1403::new(0x00e, &chan.sys, &sched);
        chan.add_device(0x00e, prt.clone()).unwrap();
        (chan, prt, mem, sched)
    }

    fn put_ccw(mem: &crate::memory::MemPtr, at: u32, cmd: u8, addr: u32, flags: u8, count: u16) {
        let mut m = mem.borrow_mut();
        m.write_word(at, ((cmd as u32) << 24) | addr);
        m.write_word(at + 4, ((flags as u32) << 24) | count as u32);
    }

    #[test]
    fn write_prints_translated_line() {
        let (mut chan, prt, mem, sched) = setup();
        let out = NamedTempFile::new().unwrap();
        let path = out.path().to_str().unwrap().to_string();
        prt.borrow_mut().attach(&path).unwrap();
        {
            let mut m = mem.borrow_mut();
            m.write_word(CAW_LOC, 0x500);
            // "OK" in EBCDIC followed by blanks.
            m.write_word(0x600, 0xd6d2_4040);
        }
        put_ccw(&mem, 0x500, 0x01, 0x600, 0, 4);
        assert_eq!(chan.start_io(0x00e), CC0);
        sched.advance(PRINT_TIME + 1);
        assert_eq!(chan.next_interrupt(), Some(0x00e));
        prt.borrow_mut().detach().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("OK\n"), "got {:?}", text);
    }

    #[test]
    fn space_three_lines_control() {
        let (mut chan, prt, mem, sched) = setup();
        let out = NamedTempFile::new().unwrap();
        let path = out.path().to_str().unwrap().to_string();
        prt.borrow_mut().attach(&path).unwrap();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        // Space 3 lines: control with op 3.
        put_ccw(&mem, 0x500, 0x03 | (3 << 3), 0, 0, 1);
        assert_eq!(chan.start_io(0x00e), CC0);
        sched.advance(CARRIAGE_TIME + 1);
        assert_eq!(chan.next_interrupt(), Some(0x00e));
        assert_eq!(prt.borrow().line, 3);
    }

    #[test]
    fn invalid_carriage_op_is_rejected() {
        let (mut chan, prt, mem, _sched) = setup();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        // op 7 is neither a space nor a skip.
        put_ccw(&mem, 0x500, 0x03 | (7 << 3), 0, 0, 1);
        assert_eq!(chan.start_io(0x00e), CC1);
        assert_eq!(prt.borrow().sense, sense::CMD_REJ);
        let w1 = mem.borrow_mut().read_word(crate::channel::CSW_LOC + 4);
        assert_ne!((w1 >> 24) as u8 & UnitStat::UNIT_CHK.bits(), 0);
    }

    #[test]
    fn skip_to_channel_12_flags_exception() {
        let (mut chan, prt, mem, sched) = setup();
        let out = NamedTempFile::new().unwrap();
        prt.borrow_mut().attach(out.path().to_str().unwrap()).unwrap();
        prt.borrow_mut().set_option("fcb", "STD1").unwrap();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        // Skip to channel 12 (op 0x1b).
        put_ccw(&mem, 0x500, 0x03 | (0x1b << 3), 0, 0, 1);
        assert_eq!(chan.start_io(0x00e), CC0);
        sched.advance(CARRIAGE_TIME + 1);
        assert_eq!(prt.borrow().line, 62);
        // The exception rides the ending status.
        assert!(chan.next_interrupt().is_some());
        let w1 = mem.borrow_mut().read_word(crate::channel::CSW_LOC + 4);
        assert_ne!((w1 >> 24) as u8 & UnitStat::UNIT_EXC.bits(), 0);
    }

    #[test]
    fn page_wraps_at_form_length() {
        let (_chan, prt, _mem, _sched) = setup();
        let out = NamedTempFile::new().unwrap();
        let path = out.path().to_str().unwrap().to_string();
        prt.borrow_mut().attach(&path).unwrap();
        prt.borrow_mut().set_option("lpp", "3").unwrap();
        {
            let mut p = prt.borrow_mut();
            p.space_lines(1);
            p.space_lines(1);
            assert_eq!(p.line, 2);
            p.space_lines(1);
            // Wrapped to top of form.
            assert_eq!(p.line, 0);
        }
        prt.borrow_mut().detach().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains('\x0c'), "got {:?}", text);
    }

    #[test]
    fn sense_presents_and_clears() {
        let (mut chan, prt, mem, _sched) = setup();
        prt.borrow_mut().sense = sense::CMD_REJ;
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        put_ccw(&mem, 0x500, 0x04, 0x700, 0, 1);
        assert_eq!(chan.start_io(0x00e), CC1);
        assert_eq!(mem.borrow_mut().read_byte(0x700), sense::CMD_REJ);
        assert_eq!(prt.borrow().sense, 0);
    }
}
