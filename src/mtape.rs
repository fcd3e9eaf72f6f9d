// 2400-series magnetic tape drive.  Commands pace themselves through the
// scheduler one frame at a time; 7-track mode layers parity, an optional
// BCD/EBCDIC translator and the 4-to-3 data converter on top of the raw
// image codec.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::channel::ChanPtr;
use crate::debug::DebugMask;
use crate::dev_trace;
use crate::device::{sense, DevAddr, Device, DevRef, UnitStat};
use crate::error::{Error, Result};
use crate::event::Sched;
use crate::hollerith::{bcd_to_hol, even_parity, ebcdic_to_hol, hol_to_bcd, hol_to_ebcdic, ODD_PARITY};
use crate::tape::{RecStart, TapeCtx, TapeFormat};

const FRAME_TIME: u32 = 100;
const GAP_TIME: u32 = 2000;
const CTRL_TIME: u32 = 3000;
const REWIND_TIME: u32 = 1000;
const REWIND_FRAMES: u64 = 4096;

const SRV_READ: i32 = 1;
const SRV_READ_BWD: i32 = 2;
const SRV_WRITE: i32 = 3;
const SRV_SPACE: i32 = 4;
const SRV_CTRL: i32 = 5;
const SRV_REWIND: i32 = 6;

// Command codes; the 0xX7/0xXF control family is dispatched on cmd >> 3.
const CMD_WRITE: u8 = 0x01;
const CMD_READ: u8 = 0x02;
const CMD_SENSE: u8 = 0x04;
const CMD_READ_BWD: u8 = 0x0c;

/// Tape sense bytes beyond the common first byte.
pub mod tsense {
    pub const B1_7TRACK: u8 = 0x80;
    pub const B1_LOADPT: u8 = 0x40;
    pub const B1_NORING: u8 = 0x20;
    pub const B1_WRITE: u8 = 0x10;
    pub const B1_DENS: u8 = 0x08;

    pub const B3_VRC: u8 = 0x80;
    pub const B3_LRC: u8 = 0x40;
    pub const B3_SKEW: u8 = 0x20;
    pub const B3_CRC: u8 = 0x10;
    pub const B3_PE: u8 = 0x08;
    pub const B3_BACKWARD: u8 = 0x01;
}

const SENSE_LEN: usize = 14;

pub struct Tape2400 {
    addr: DevAddr,
    chan: ChanPtr,
    sched: Sched,
    me: Weak<RefCell<Tape2400>>,
    ctx: TapeCtx,
    seven_track: bool,
    density: u8,
    even_par: bool,
    converter: bool,
    translator: bool,
    write_ring: bool,
    // Data-converter state: phase counter and held bits.
    cc: u8,
    hold: u8,
    cmd: u8,
    in_record: bool,
    last_was_write: bool,
    rewinding: bool,
    unload: bool,
    sense: [u8; SENSE_LEN],
    debug: DebugMask,
}

impl Tape2400 {
    pub fn new(addr: DevAddr, chan: &ChanPtr, sched: &Sched) -> Rc<RefCell<Tape2400>> {
        crate::device::wrap(
            Tape2400 {
                addr,
                chan: Rc::clone(chan),
                sched: sched.clone(),
                me: Weak::new(),
                ctx: TapeCtx::new(TapeFormat::Tap),
                seven_track: false,
                density: 2,
                even_par: false,
                converter: false,
                translator: false,
                write_ring: true,
                cc: 0,
                hold: 0,
                cmd: 0,
                in_record: false,
                last_was_write: false,
                rewinding: false,
                unload: false,
                sense: [0; SENSE_LEN],
                debug: DebugMask::empty(),
            },
            |d, me| d.me = me,
        )
    }

    fn me(&self) -> DevRef {
        let me = self.me.upgrade().expect("tape registered");
        me
    }

    fn unit(&self) -> String {
        format!("2400 {:03x}", self.addr)
    }

    fn busy(&self) -> bool {
        self.cmd != 0 || self.rewinding
    }

    fn check_fail(&mut self, bits: u8) -> UnitStat {
        self.sense[0] |= bits;
        UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK
    }

    fn done(&mut self, st: UnitStat) {
        self.cmd = 0;
        self.in_record = false;
        self.chan.borrow_mut().chan_end(self.addr, st);
    }

    fn ok_done(&mut self) {
        let mut st = UnitStat::CH_END | UnitStat::DEV_END;
        if self.sense[0] != 0 {
            st |= UnitStat::UNIT_CHK;
        }
        self.done(st);
    }

    /// Applies parity (and checks it) on a raw 7-track frame, returning the
    /// 6-bit payload.
    fn strip_parity(&mut self, frame: u8) -> u8 {
        let v = frame & 0x3f;
        let want = if self.even_par { even_parity(v) } else { ODD_PARITY[v as usize] };
        if frame & 0x40 != want {
            self.sense[3] |= tsense::B3_VRC;
            self.sense[0] |= sense::DATA_CHK;
        }
        v
    }

    fn frame_parity(&self, v: u8) -> u8 {
        let v = v & 0x3f;
        v | if self.even_par { even_parity(v) } else { ODD_PARITY[v as usize] }
    }

    /// Data-converter read step: one tape frame in, zero or one CPU byte
    /// out.
    fn conv_read(&mut self, v: u8) -> Option<u8> {
        match self.cc {
            0 => {
                self.hold = v;
                self.cc = 1;
                None
            }
            1 => {
                let b = (self.hold << 2) | (v >> 4);
                self.hold = v & 0x0f;
                self.cc = 2;
                Some(b)
            }
            2 => {
                let b = (self.hold << 4) | (v >> 2);
                self.hold = v & 0x03;
                self.cc = 3;
                Some(b)
            }
            _ => {
                let b = (self.hold << 6) | v;
                self.hold = 0;
                self.cc = 0;
                Some(b)
            }
        }
    }

    /// Data-converter write step: one CPU byte in, one or two tape frames
    /// out.
    fn conv_write(&mut self, b: u8) -> (u8, Option<u8>) {
        match self.cc {
            0 => {
                self.cc = 1;
                let f = b >> 2;
                self.hold = b & 0x03;
                (f, None)
            }
            1 => {
                self.cc = 2;
                let f = (self.hold << 4) | (b >> 4);
                self.hold = b & 0x0f;
                (f, None)
            }
            _ => {
                self.cc = 0;
                let f = (self.hold << 2) | (b >> 6);
                self.hold = 0;
                (f, Some(b & 0x3f))
            }
        }
    }

    /// Remaining converter bits as a final short frame, if any.
    fn conv_flush(&mut self) -> Option<u8> {
        let f = match self.cc {
            1 => Some(self.hold << 4),
            2 => Some(self.hold << 2),
            _ => None,
        };
        self.cc = 0;
        self.hold = 0;
        f
    }

    fn deliver_byte(&mut self, b: u8) -> bool {
        self.chan.borrow_mut().chan_write_byte(self.addr, b)
    }

    /// One frame of a forward read.
    fn read_step(&mut self) {
        if !self.in_record {
            match self.ctx.read_forward_start() {
                Ok(RecStart::Record(_)) => {
                    self.in_record = true;
                    self.cc = 0;
                    self.hold = 0;
                }
                Ok(RecStart::Mark) => {
                    self.done(UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_EXC);
                    return;
                }
                Ok(RecStart::EndOfMedia) | Ok(RecStart::Bot) => {
                    let st = self.check_fail(sense::DATA_CHK);
                    self.done(st);
                    return;
                }
                Err(_) => {
                    let st = self.check_fail(sense::EQUIP_CHK);
                    self.done(st);
                    return;
                }
            }
        }
        match self.ctx.read_frame() {
            Ok(Some(frame)) => {
                let full = if self.seven_track {
                    let v = self.strip_parity(frame);
                    if self.converter {
                        match self.conv_read(v) {
                            Some(b) => self.deliver_byte(b),
                            None => false,
                        }
                    } else if self.translator {
                        let byte = hol_to_ebcdic(bcd_to_hol(v)).unwrap_or_else(|| {
                            self.sense[0] |= sense::DATA_CHK;
                            0
                        });
                        self.deliver_byte(byte)
                    } else {
                        self.deliver_byte(v)
                    }
                } else {
                    self.deliver_byte(frame)
                };
                if full {
                    // Channel is satisfied; skip the rest of the record.
                    if self.ctx.finish_record().is_err() {
                        self.sense[0] |= sense::EQUIP_CHK;
                    }
                    self.ok_done();
                } else {
                    self.sched.add_event(&self.me(), SRV_READ, FRAME_TIME);
                }
            }
            Ok(None) => {
                if self.ctx.finish_record().is_err() {
                    self.sense[0] |= sense::EQUIP_CHK;
                }
                self.ok_done();
            }
            Err(_) => {
                let st = self.check_fail(sense::EQUIP_CHK);
                self.done(st);
            }
        }
    }

    fn read_bwd_step(&mut self) {
        if !self.in_record {
            match self.ctx.read_backward_start() {
                Ok(RecStart::Record(_)) => self.in_record = true,
                Ok(RecStart::Mark) => {
                    self.done(UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_EXC);
                    return;
                }
                Ok(RecStart::Bot) | Ok(RecStart::EndOfMedia) => {
                    self.sense[1] |= tsense::B1_LOADPT;
                    let st = self.check_fail(sense::CMD_REJ);
                    self.done(st);
                    return;
                }
                Err(_) => {
                    let st = self.check_fail(sense::EQUIP_CHK);
                    self.done(st);
                    return;
                }
            }
        }
        self.sense[3] |= tsense::B3_BACKWARD;
        match self.ctx.read_frame() {
            Ok(Some(frame)) => {
                let byte = if self.seven_track {
                    let v = self.strip_parity(frame);
                    if self.translator {
                        hol_to_ebcdic(bcd_to_hol(v)).unwrap_or_else(|| {
                            self.sense[0] |= sense::DATA_CHK;
                            0
                        })
                    } else {
                        v
                    }
                } else {
                    frame
                };
                let full = self.deliver_byte(byte);
                if full {
                    if self.ctx.finish_record().is_err() {
                        self.sense[0] |= sense::EQUIP_CHK;
                    }
                    self.ok_done();
                } else {
                    self.sched.add_event(&self.me(), SRV_READ_BWD, FRAME_TIME);
                }
            }
            Ok(None) => {
                if self.ctx.finish_record().is_err() {
                    self.sense[0] |= sense::EQUIP_CHK;
                }
                self.ok_done();
            }
            Err(_) => {
                let st = self.check_fail(sense::EQUIP_CHK);
                self.done(st);
            }
        }
    }

    fn put_frame(&mut self, v: u8) -> Result<()> {
        let f = if self.seven_track { self.frame_parity(v) } else { v };
        self.ctx.write_frame(f)
    }

    fn write_step(&mut self) {
        if !self.in_record {
            if self.ctx.write_start().is_err() {
                let st = self.check_fail(sense::EQUIP_CHK);
                self.done(st);
                return;
            }
            self.in_record = true;
            self.cc = 0;
            self.hold = 0;
            self.last_was_write = true;
        }
        let (byte, end) = self.chan.borrow_mut().chan_read_byte(self.addr);
        let res = if self.seven_track {
            if self.converter {
                let (f1, f2) = self.conv_write(byte);
                let r = self.put_frame(f1);
                match (r, f2) {
                    (Ok(()), Some(f)) => self.put_frame(f),
                    (r, _) => r,
                }
            } else if self.translator {
                let v = ebcdic_to_hol(byte);
                let bcd = hol_to_bcd(v).unwrap_or_else(|| {
                    self.sense[0] |= sense::DATA_CHK;
                    0x10
                });
                self.put_frame(bcd)
            } else {
                self.put_frame(byte & 0x3f)
            }
        } else {
            self.put_frame(byte)
        };
        if res.is_err() {
            self.sense[0] |= sense::EQUIP_CHK;
            let _ = self.ctx.finish_record();
            let st = self.check_fail(0);
            self.done(st);
            return;
        }
        if end {
            if self.seven_track && self.converter {
                if let Some(f) = self.conv_flush() {
                    let _ = self.put_frame(f);
                }
            }
            if self.ctx.finish_record().is_err() {
                self.sense[0] |= sense::EQUIP_CHK;
            }
            self.ok_done();
        } else {
            self.sched.add_event(&self.me(), SRV_WRITE, FRAME_TIME);
        }
    }

    /// Record and file spacing, forward and backward.
    fn space_step(&mut self) {
        let op = self.cmd >> 3;
        let res = match op {
            4 | 5 => self.ctx.read_backward_start(),
            _ => self.ctx.read_forward_start(),
        };
        match res {
            Ok(RecStart::Record(_)) => {
                if self.ctx.finish_record().is_err() {
                    let st = self.check_fail(sense::EQUIP_CHK);
                    self.done(st);
                    return;
                }
                match op {
                    // Space file: keep going until a mark.
                    5 | 7 => self.sched.add_event(&self.me(), SRV_SPACE, GAP_TIME),
                    _ => self.ok_done(),
                }
            }
            Ok(RecStart::Mark) => match op {
                5 | 7 => self.ok_done(),
                _ => self.done(UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_EXC),
            },
            Ok(RecStart::Bot) => {
                self.sense[1] |= tsense::B1_LOADPT;
                match op {
                    5 => self.done(UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_EXC),
                    _ => {
                        let st = self.check_fail(sense::CMD_REJ);
                        self.done(st);
                    }
                }
            }
            Ok(RecStart::EndOfMedia) => {
                let st = self.check_fail(sense::DATA_CHK);
                self.done(st);
            }
            Err(_) => {
                let st = self.check_fail(sense::EQUIP_CHK);
                self.done(st);
            }
        }
    }

    fn rewind_step(&mut self) {
        match self.ctx.rewind_frames(REWIND_FRAMES) {
            Ok(true) => {
                self.rewinding = false;
                self.sense[1] |= tsense::B1_LOADPT;
                if self.unload {
                    self.unload = false;
                    let _ = self.ctx.detach();
                }
                self.chan.borrow_mut().set_dev_attn(self.addr, UnitStat::DEV_END);
            }
            Ok(false) => {
                self.sched.add_event(&self.me(), SRV_REWIND, REWIND_TIME);
            }
            Err(_) => {
                self.rewinding = false;
                self.sense[0] |= sense::EQUIP_CHK;
                self.chan
                    .borrow_mut()
                    .set_dev_attn(self.addr, UnitStat::DEV_END | UnitStat::UNIT_CHK);
            }
        }
    }

    fn fill_sense(&mut self) {
        self.sense[1] &= !(tsense::B1_7TRACK
            | tsense::B1_LOADPT
            | tsense::B1_NORING
            | tsense::B1_WRITE);
        if self.seven_track {
            self.sense[1] |= tsense::B1_7TRACK;
        }
        if self.ctx.at_bot() {
            self.sense[1] |= tsense::B1_LOADPT;
        }
        if !self.write_ring {
            self.sense[1] |= tsense::B1_NORING;
        }
        if self.last_was_write {
            self.sense[1] |= tsense::B1_WRITE;
        }
        self.sense[2] = 0xc0;
        self.sense[6] = 0x20 | self.density;
        self.sense[13] = if self.seven_track { 7 } else { 9 };
    }
}

impl Device for Tape2400 {
    fn addr(&self) -> DevAddr {
        self.addr
    }

    fn start_io(&mut self) -> UnitStat {
        if self.busy() {
            UnitStat::BUSY
        } else {
            UnitStat::empty()
        }
    }

    fn start_cmd(&mut self, cmd: u8) -> UnitStat {
        if self.busy() {
            return UnitStat::BUSY;
        }
        dev_trace!(self.debug, DebugMask::CMD, &self.unit(), "cmd {:02x}", cmd);
        if cmd == CMD_SENSE {
            self.fill_sense();
            for i in 0..SENSE_LEN {
                let b = self.sense[i];
                if self.chan.borrow_mut().chan_write_byte(self.addr, b) {
                    break;
                }
            }
            self.sense[0] = 0;
            self.sense[3] = 0;
            return UnitStat::CH_END | UnitStat::DEV_END;
        }
        // Mode set: density, parity, converter, translator.
        if cmd & 0x03 == 0x03 && cmd & 0x04 == 0 {
            if self.seven_track {
                self.density = (cmd >> 3) & 0x03;
                self.even_par = cmd & 0x20 != 0;
                self.converter = cmd & 0x40 != 0;
                self.translator = cmd & 0x80 != 0;
            }
            return UnitStat::CH_END | UnitStat::DEV_END;
        }
        if !self.ctx.attached() {
            return self.check_fail(sense::INTERVENTION);
        }
        self.sense = [0; SENSE_LEN];
        match cmd {
            CMD_READ => {
                self.last_was_write = false;
                self.cmd = cmd;
                self.sched.add_event(&self.me(), SRV_READ, GAP_TIME);
                UnitStat::empty()
            }
            CMD_READ_BWD => {
                if self.converter {
                    return self.check_fail(sense::CMD_REJ);
                }
                self.last_was_write = false;
                self.cmd = cmd;
                self.chan.borrow_mut().set_reverse(self.addr);
                self.sched.add_event(&self.me(), SRV_READ_BWD, GAP_TIME);
                UnitStat::empty()
            }
            CMD_WRITE => {
                if !self.write_ring {
                    self.sense[1] |= tsense::B1_NORING;
                    return self.check_fail(sense::CMD_REJ);
                }
                self.cmd = cmd;
                self.sched.add_event(&self.me(), SRV_WRITE, GAP_TIME);
                UnitStat::empty()
            }
            _ if cmd & 0x07 == 0x07 => {
                let op = cmd >> 3;
                match op {
                    // Rewind and rewind-unload.
                    0 | 1 => {
                        if self.ctx.at_bot() && op == 0 {
                            return UnitStat::CH_END | UnitStat::DEV_END;
                        }
                        if self.ctx.start_rewind().is_err() {
                            return self.check_fail(sense::EQUIP_CHK);
                        }
                        self.rewinding = true;
                        self.unload = op == 1;
                        self.sched.add_event(&self.me(), SRV_REWIND, REWIND_TIME);
                        UnitStat::CH_END
                    }
                    // Erase gap.
                    2 => {
                        if !self.write_ring {
                            return self.check_fail(sense::CMD_REJ);
                        }
                        self.cmd = cmd;
                        self.sched.add_event(&self.me(), SRV_CTRL, CTRL_TIME);
                        UnitStat::empty()
                    }
                    // Write tape mark.
                    3 => {
                        if !self.write_ring {
                            self.sense[1] |= tsense::B1_NORING;
                            return self.check_fail(sense::CMD_REJ);
                        }
                        self.cmd = cmd;
                        self.last_was_write = true;
                        self.sched.add_event(&self.me(), SRV_CTRL, CTRL_TIME);
                        UnitStat::empty()
                    }
                    // BSR, BSF, FSR, FSF.
                    4..=7 => {
                        self.last_was_write = false;
                        self.cmd = cmd;
                        self.sched.add_event(&self.me(), SRV_SPACE, GAP_TIME);
                        UnitStat::empty()
                    }
                    _ => self.check_fail(sense::CMD_REJ),
                }
            }
            _ => self.check_fail(sense::CMD_REJ),
        }
    }

    fn halt_io(&mut self) -> UnitStat {
        for arg in [SRV_READ, SRV_READ_BWD, SRV_WRITE, SRV_SPACE, SRV_CTRL].iter() {
            self.sched.cancel_event(&self.me(), *arg);
        }
        if self.in_record {
            let _ = self.ctx.finish_record();
            self.in_record = false;
        }
        self.cmd = 0;
        UnitStat::CH_END | UnitStat::DEV_END
    }

    fn reset(&mut self) {
        let me = self.me();
        for arg in [SRV_READ, SRV_READ_BWD, SRV_WRITE, SRV_SPACE, SRV_CTRL, SRV_REWIND].iter() {
            self.sched.cancel_event(&me, *arg);
        }
        if self.in_record {
            let _ = self.ctx.finish_record();
        }
        self.cmd = 0;
        self.in_record = false;
        self.rewinding = false;
        self.unload = false;
        self.sense = [0; SENSE_LEN];
        self.cc = 0;
        self.hold = 0;
    }

    fn srv(&mut self, arg: i32) {
        match arg {
            SRV_READ => self.read_step(),
            SRV_READ_BWD => self.read_bwd_step(),
            SRV_WRITE => self.write_step(),
            SRV_SPACE => self.space_step(),
            SRV_REWIND => self.rewind_step(),
            SRV_CTRL => {
                let op = self.cmd >> 3;
                if op == 3 {
                    if self.ctx.write_mark().is_err() {
                        self.sense[0] |= sense::EQUIP_CHK;
                    }
                }
                self.ok_done();
            }
            _ => {}
        }
    }

    fn attach(&mut self, file: &str) -> Result<()> {
        self.ctx.attach(file)
    }

    fn detach(&mut self) -> Result<()> {
        self.ctx.detach()
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name.to_ascii_lowercase().as_str() {
            "format" => {
                let fmt = TapeFormat::from_name(value).ok_or_else(|| Error::Config {
                    line: 0,
                    reason: format!("unknown tape format {}", value),
                })?;
                self.ctx.set_format(fmt);
                Ok(())
            }
            "7track" => {
                self.seven_track = true;
                Ok(())
            }
            "9track" => {
                self.seven_track = false;
                Ok(())
            }
            "ring" => {
                self.write_ring = true;
                Ok(())
            }
            "noring" => {
                self.write_ring = false;
                Ok(())
            }
            "file" => self.attach(value),
            _ => Err(Error::Config { line: 0, reason: format!("unknown option {}", name) }),
        }
    }

    fn show(&self) -> String {
        format!(
            "2400 {:03x} {} format={} {}",
            self.addr,
            self.ctx.file_name().unwrap_or("not attached"),
            self.ctx.format().name(),
            if self.seven_track { "7-track" } else { "9-track" }
        )
    }

    fn set_debug(&mut self, mask: DebugMask) {
        self.debug = mask;
    }

    fn rewind(&mut self) -> Result<()> {
        self.ctx.start_rewind()?;
        while !self.ctx.rewind_frames(REWIND_FRAMES)? {}
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.ctx.detach();
    }
}
