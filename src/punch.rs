// 2540 card punch.  A Write accepts up to 80 bytes, translates EBCDIC to
// Hollerith column by column, pads short cards with blanks and drops the
// card into the output deck.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::card::{CardCtx, CardMode, CardImage, CARD_COLS};
use crate::channel::ChanPtr;
use crate::debug::DebugMask;
use crate::dev_trace;
use crate::device::{sense, DevAddr, Device, DevRef, UnitStat};
use crate::error::{Error, Result};
use crate::event::Sched;
use crate::hollerith::ebcdic_to_hol;

const PUNCH_TIME: u32 = 20000;

const SRV_PUNCH: i32 = 1;

pub struct Punch2540 {
    addr: DevAddr,
    chan: ChanPtr,
    sched: Sched,
    me: Weak<RefCell<Punch2540>>,
    ctx: CardCtx,
    image: CardImage,
    busy: bool,
    sense: u8,
    debug: DebugMask,
}

impl Punch2540 {
    pub fn new(addr: DevAddr, chan: &ChanPtr, sched: &Sched) -> Rc<RefCell<Punch2540>> {
        crate::device::wrap(
            Punch2540 {
                addr,
                chan: Rc::clone(chan),
                sched: sched.clone(),
                me: Weak::new(),
                ctx: CardCtx::new(CardMode::Auto),
                image: [0; CARD_COLS],
                busy: false,
                sense: 0,
                debug: DebugMask::empty(),
            },
            |d, me| d.me = me,
        )
    }

    fn me(&self) -> DevRef {
        let me = self.me.upgrade().expect("punch registered");
        me
    }

    fn unit(&self) -> String {
        format!("2540P {:03x}", self.addr)
    }
}

impl Device for Punch2540 {
    fn addr(&self) -> DevAddr {
        self.addr
    }

    fn start_io(&mut self) -> UnitStat {
        if self.busy {
            UnitStat::BUSY
        } else {
            UnitStat::empty()
        }
    }

    fn start_cmd(&mut self, cmd: u8) -> UnitStat {
        if self.busy {
            return UnitStat::BUSY;
        }
        dev_trace!(self.debug, DebugMask::CMD, &self.unit(), "cmd {:02x}", cmd);
        match cmd {
            0x04 => {
                let b = self.sense;
                self.chan.borrow_mut().chan_write_byte(self.addr, b);
                self.sense = 0;
                UnitStat::CH_END | UnitStat::DEV_END
            }
            0x03 => UnitStat::CH_END | UnitStat::DEV_END,
            _ if cmd & 0x07 == 0x01 => {
                if !self.ctx.attached() {
                    self.sense = sense::INTERVENTION;
                    return UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK;
                }
                self.sense = 0;
                self.image = [0; CARD_COLS];
                for col in 0..CARD_COLS {
                    let (byte, end) = self.chan.borrow_mut().chan_read_byte(self.addr);
                    self.image[col] = ebcdic_to_hol(byte);
                    if end {
                        break;
                    }
                }
                self.busy = true;
                self.sched.add_event(&self.me(), SRV_PUNCH, PUNCH_TIME);
                UnitStat::empty()
            }
            _ => {
                self.sense = sense::CMD_REJ;
                UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK
            }
        }
    }

    fn halt_io(&mut self) -> UnitStat {
        self.sched.cancel_event(&self.me(), SRV_PUNCH);
        self.busy = false;
        UnitStat::CH_END | UnitStat::DEV_END
    }

    fn reset(&mut self) {
        self.sched.cancel_event(&self.me(), SRV_PUNCH);
        self.busy = false;
        self.sense = 0;
    }

    fn srv(&mut self, arg: i32) {
        if arg != SRV_PUNCH {
            return;
        }
        self.busy = false;
        let image = self.image;
        let st = match self.ctx.punch_card(&image) {
            Ok(()) => UnitStat::CH_END | UnitStat::DEV_END,
            Err(_) => {
                self.sense = sense::EQUIP_CHK;
                UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK
            }
        };
        self.chan.borrow_mut().chan_end(self.addr, st);
    }

    fn attach(&mut self, file: &str) -> Result<()> {
        self.ctx.attach(file, true, false)
    }

    fn detach(&mut self) -> Result<()> {
        self.ctx.detach()
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name.to_ascii_lowercase().as_str() {
            "format" | "mode" => {
                let mode = CardMode::from_name(value).ok_or_else(|| Error::Config {
                    line: 0,
                    reason: format!("unknown card format {}", value),
                })?;
                self.ctx.set_mode(mode);
                Ok(())
            }
            "file" => self.attach(value),
            _ => Err(Error::Config { line: 0, reason: format!("unknown option {}", name) }),
        }
    }

    fn show(&self) -> String {
        format!(
            "2540P {:03x} {} format={}",
            self.addr,
            self.ctx.file_name().unwrap_or("not attached"),
            self.ctx.mode().name()
        )
    }

    fn set_debug(&mut self, mask: DebugMask) {
        self.debug = mask;
    }

    fn shutdown(&mut self) {
        let _ = self.ctx.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, CAW_LOC, CC0};
    use crate::memory::Mem;
    use tempfile::NamedTempFile;

    fn setup() -> (Channel, Rc<RefCell<Punch2540>>, crate::memory::MemPtr, Sched) {
        let mem = Mem::new(64 * 1024);
        let sched = Sched::new();
        let mut chan = Channel::new(Rc::clone(&mem), sched.clone());
        let pun = Punch2540::new(0x00d, &chan.sys, &sched);
        chan.add_device(0x00d, pun.clone()).unwrap();
        (chan, pun, mem, sched)
    }

    fn put_ccw(mem: &crate::memory::MemPtr, at: u32, cmd: u8, addr: u32, count: u16) {
        let mut m = mem.borrow_mut();
        m.write_word(at, ((cmd as u32) << 24) | addr);
        m.write_word(at + 4, count as u32);
    }

    #[test]
    fn short_write_pads_with_blanks() {
        let (mut chan, pun, mem, sched) = setup();
        let out = NamedTempFile::new().unwrap();
        let path = out.path().to_str().unwrap().to_string();
        pun.borrow_mut().set_option("format", "text").unwrap();
        pun.borrow_mut().attach(&path).unwrap();
        {
            let mut m = mem.borrow_mut();
            m.write_word(CAW_LOC, 0x500);
            // "AB" in EBCDIC.
            m.write_word(0x600, 0xc1c2_0000);
        }
        put_ccw(&mem, 0x500, 0x01, 0x600, 2);
        assert_eq!(chan.start_io(0x00d), CC0);
        sched.advance(PUNCH_TIME + 1);
        assert_eq!(chan.next_interrupt(), Some(0x00d));
        pun.borrow_mut().detach().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "AB\n");
    }

    #[test]
    fn full_card_round_trips_through_reader_format() {
        let (mut chan, pun, mem, sched) = setup();
        let out = NamedTempFile::new().unwrap();
        let path = out.path().to_str().unwrap().to_string();
        pun.borrow_mut().set_option("format", "ebcdic").unwrap();
        pun.borrow_mut().attach(&path).unwrap();
        {
            let mut m = mem.borrow_mut();
            m.write_word(CAW_LOC, 0x500);
            for i in 0..20 {
                m.write_word(0x600 + i * 4, 0xc1c2_c3c4);
            }
        }
        put_ccw(&mem, 0x500, 0x01, 0x600, 80);
        assert_eq!(chan.start_io(0x00d), CC0);
        sched.advance(PUNCH_TIME + 1);
        chan.next_interrupt();
        pun.borrow_mut().detach().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 80);
        assert_eq!(&bytes[..4], &[0xc1, 0xc2, 0xc3, 0xc4]);
    }

    #[test]
    fn write_without_deck_is_intervention() {
        let (mut chan, pun, mem, _sched) = setup();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        put_ccw(&mem, 0x500, 0x01, 0x600, 2);
        assert_eq!(chan.start_io(0x00d), crate::channel::CC1);
        assert_eq!(pun.borrow().sense, sense::INTERVENTION);
    }
}
