use std::cell::RefCell;
use std::rc::Rc;

use crate::debug::DebugMask;
use crate::error::{Error, Result};

/// 12-bit device address: channel number in the high 4 bits, unit in the
/// low 8.
pub type DevAddr = u16;

/// Sentinel meaning "no device address".
pub const NO_DEV: DevAddr = 0x100;

pub type DevRef = Rc<RefCell<dyn Device>>;

bitflags::bitflags! {
    /// CSW unit-status byte, presented on the wire exactly as S/370 defines
    /// it.
    pub struct UnitStat: u8 {
        const ATTN     = 0x80;
        const SMS      = 0x40;
        const CUE      = 0x20;
        const BUSY     = 0x10;
        const CH_END   = 0x08;
        const DEV_END  = 0x04;
        const UNIT_CHK = 0x02;
        const UNIT_EXC = 0x01;
    }
}

/// Canonical sense-byte bits shared by every device; the low bits are
/// device-unique and defined next to each device.
pub mod sense {
    pub const CMD_REJ: u8 = 0x80;
    pub const INTERVENTION: u8 = 0x40;
    pub const BUS_CHK: u8 = 0x20;
    pub const EQUIP_CHK: u8 = 0x10;
    pub const DATA_CHK: u8 = 0x08;
    pub const OVERRUN: u8 = 0x04;
}

/// One emulated device as the channel sees it.
///
/// `start_io`/`start_cmd`/`halt_io`/`reset`/`srv` are the required surface;
/// the rest are optional capabilities with refusing defaults.  `srv` is the
/// scheduler callback: devices pace themselves by scheduling future `srv`
/// invocations and decode the `arg` they passed.
pub trait Device {
    fn addr(&self) -> DevAddr;

    /// Probe at Start I/O time, before the first CCW is fetched.  Returns
    /// zero when the device can accept a command, or BUSY/unit status.
    fn start_io(&mut self) -> UnitStat;

    /// Issue one channel command.  A zero return means the operation is under
    /// way and the device has scheduled itself; an immediate status ends the
    /// command right away.
    fn start_cmd(&mut self, cmd: u8) -> UnitStat;

    /// Halt whatever is in progress.
    fn halt_io(&mut self) -> UnitStat;

    fn reset(&mut self);

    /// Scheduler callback.
    fn srv(&mut self, arg: i32);

    fn attach(&mut self, _file: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn detach(&mut self) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn set_option(&mut self, name: &str, _value: &str) -> Result<()> {
        Err(Error::Config { line: 0, reason: format!("unknown option {}", name) })
    }

    fn show(&self) -> String {
        String::new()
    }

    fn set_debug(&mut self, _mask: DebugMask) {}

    fn rewind(&mut self) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Final cleanup on emulator shutdown (flush files, drop attachments).
    fn shutdown(&mut self) {}
}

/// Wraps a freshly constructed device so it can hand the scheduler a handle
/// to itself.  Every concrete device keeps the returned `Weak` in a `me`
/// field and upgrades it when scheduling.
pub fn wrap<D: Device + 'static>(dev: D, set_me: impl FnOnce(&mut D, std::rc::Weak<RefCell<D>>)) -> Rc<RefCell<D>> {
    let rc = Rc::new(RefCell::new(dev));
    let weak = Rc::downgrade(&rc);
    set_me(&mut *rc.borrow_mut(), weak);
    rc
}
