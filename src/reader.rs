// 2540 card reader.  One Read delivers exactly one card, column by column,
// Hollerith translated to EBCDIC; the end-of-file card completes with unit
// exception and leaves an EOF pending for the following Read.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::card::{Card, CardCtx, CardMode, CARD_COLS};
use crate::channel::ChanPtr;
use crate::debug::DebugMask;
use crate::dev_trace;
use crate::device::{sense, DevAddr, Device, DevRef, UnitStat};
use crate::error::{Error, Result};
use crate::event::Sched;
use crate::hollerith::hol_to_ebcdic;

const READ_TIME: u32 = 10000;
const FEED_TIME: u32 = 2500;

const SRV_READ: i32 = 1;
const SRV_FEED: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Reading,
    FeedQueued,
}

pub struct Reader2540 {
    addr: DevAddr,
    chan: ChanPtr,
    sched: Sched,
    me: Weak<RefCell<Reader2540>>,
    ctx: CardCtx,
    state: State,
    eof_pending: bool,
    feed_cmd: bool,
    sense: u8,
    eof_option: bool,
    debug: DebugMask,
}

impl Reader2540 {
    pub fn new(addr: DevAddr, chan: &ChanPtr, sched: &Sched) -> Rc<RefCell<Reader2540>> {
        crate::device::wrap(
            Reader2540 {
                addr,
                chan: Rc::clone(chan),
                sched: sched.clone(),
                me: Weak::new(),
                ctx: CardCtx::new(CardMode::Auto),
                state: State::Idle,
                eof_pending: false,
                feed_cmd: false,
                sense: 0,
                eof_option: false,
                debug: DebugMask::empty(),
            },
            |d, me| d.me = me,
        )
    }

    fn me(&self) -> DevRef {
        let me = self.me.upgrade().expect("reader registered");
        me
    }

    fn unit(&self) -> String {
        format!("2540R {:03x}", self.addr)
    }

    fn deliver(&mut self, card: Card) {
        if card.err {
            self.sense |= sense::DATA_CHK;
        }
        let mut end = false;
        for col in 0..CARD_COLS {
            let hol = card.image[col] & 0xfff;
            let byte = match hol_to_ebcdic(hol) {
                Some(b) => b,
                None => {
                    self.sense |= sense::DATA_CHK;
                    0
                }
            };
            end = self.chan.borrow_mut().chan_write_byte(self.addr, byte);
            if end {
                break;
            }
        }
        dev_trace!(self.debug, DebugMask::DATA, &self.unit(), "card delivered, end={}", end);
        let mut st = UnitStat::CH_END | UnitStat::DEV_END;
        if self.sense & sense::DATA_CHK != 0 {
            st |= UnitStat::UNIT_CHK;
        }
        self.state = State::FeedQueued;
        self.sched.add_event(&self.me(), SRV_FEED, FEED_TIME);
        self.chan.borrow_mut().chan_end(self.addr, st);
    }
}

impl Device for Reader2540 {
    fn addr(&self) -> DevAddr {
        self.addr
    }

    fn start_io(&mut self) -> UnitStat {
        if self.state != State::Idle {
            UnitStat::BUSY
        } else {
            UnitStat::empty()
        }
    }

    fn start_cmd(&mut self, cmd: u8) -> UnitStat {
        if self.state != State::Idle {
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
            // Feed without data transfer; device end comes when the card
            // drops into the stacker.
            0x23 => {
                self.state = State::FeedQueued;
                self.feed_cmd = true;
                self.sched.add_event(&self.me(), SRV_FEED, FEED_TIME);
                UnitStat::CH_END
            }
            // Read, with stacker-select bits ignored.
            _ if cmd & 0x07 == 0x02 && cmd & 0x38 == 0 => {
                if self.eof_pending {
                    self.eof_pending = false;
                    return UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_EXC;
                }
                if !self.ctx.attached() {
                    self.sense = sense::INTERVENTION;
                    return UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK;
                }
                self.sense = 0;
                self.state = State::Reading;
                self.sched.add_event(&self.me(), SRV_READ, READ_TIME);
                UnitStat::empty()
            }
            _ => {
                self.sense = sense::CMD_REJ;
                UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK
            }
        }
    }

    fn halt_io(&mut self) -> UnitStat {
        self.sched.cancel_event(&self.me(), SRV_READ);
        self.sched.cancel_event(&self.me(), SRV_FEED);
        self.state = State::Idle;
        UnitStat::CH_END | UnitStat::DEV_END
    }

    fn reset(&mut self) {
        self.sched.cancel_event(&self.me(), SRV_READ);
        self.sched.cancel_event(&self.me(), SRV_FEED);
        self.state = State::Idle;
        self.sense = 0;
        self.eof_pending = false;
    }

    fn srv(&mut self, arg: i32) {
        match arg {
            SRV_READ => match self.ctx.parse_card() {
                Ok(Some(card)) if card.eof => {
                    self.eof_pending = true;
                    self.state = State::Idle;
                    self.chan.borrow_mut().chan_end(
                        self.addr,
                        UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_EXC,
                    );
                }
                Ok(Some(card)) => self.deliver(card),
                Ok(None) => {
                    // Hopper empty.
                    self.sense = sense::INTERVENTION;
                    self.state = State::Idle;
                    self.chan.borrow_mut().chan_end(
                        self.addr,
                        UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK,
                    );
                }
                Err(_) => {
                    self.sense = sense::EQUIP_CHK;
                    self.state = State::Idle;
                    self.chan.borrow_mut().chan_end(
                        self.addr,
                        UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK,
                    );
                }
            },
            SRV_FEED => {
                self.state = State::Idle;
                if self.feed_cmd {
                    self.feed_cmd = false;
                    self.chan.borrow_mut().set_dev_attn(self.addr, UnitStat::DEV_END);
                }
            }
            _ => {}
        }
    }

    fn attach(&mut self, file: &str) -> Result<()> {
        let eof = self.eof_option;
        self.ctx.attach(file, false, eof)
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
            "eof" => {
                self.eof_option = true;
                Ok(())
            }
            "noeof" => {
                self.eof_option = false;
                Ok(())
            }
            "file" => self.attach(value),
            _ => Err(Error::Config { line: 0, reason: format!("unknown option {}", name) }),
        }
    }

    fn show(&self) -> String {
        format!(
            "2540R {:03x} {} format={}",
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
