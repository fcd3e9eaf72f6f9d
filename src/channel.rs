// Channel subsystem.  The CPU side sees start_io/test_io/halt_io/test_chan;
// devices see the byte pipes (chan_read_byte/chan_write_byte), chan_end and
// set_dev_attn.  Each configured device owns a subchannel holding the CCW
// in flight; pending interrupts queue FIFO until the CPU drains them.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use log::debug;

use crate::device::{DevAddr, DevRef, UnitStat};
use crate::event::Sched;
use crate::memory::MemPtr;

/// Real-storage locations fixed by the architecture.
pub const CSW_LOC: u32 = 0x40;
pub const CAW_LOC: u32 = 0x48;

pub const MAX_DEV: usize = 4096;

/// Transfer-in-channel command code.
const CMD_TIC: u8 = 0x08;

bitflags::bitflags! {
    pub struct CcwFlags: u8 {
        const CD   = 0x80;
        const CC   = 0x40;
        const SLI  = 0x20;
        const SKIP = 0x10;
        const PCI  = 0x08;
        const IDA  = 0x04;
    }
}

/// CSW channel-status byte.
pub mod chan_status {
    pub const PCI: u8 = 0x80;
    pub const ILEN: u8 = 0x40;
    pub const PROG_CHK: u8 = 0x20;
    pub const PROT_CHK: u8 = 0x10;
    pub const DATA_CHK: u8 = 0x08;
    pub const CTL_CHK: u8 = 0x04;
    pub const IFACE_CHK: u8 = 0x02;
    pub const CHAIN_CHK: u8 = 0x01;
}

/// Condition codes returned to the CPU.
pub const CC0: u8 = 0;
pub const CC1: u8 = 1;
pub const CC2: u8 = 2;
pub const CC3: u8 = 3;

#[derive(Debug, Clone, Copy)]
pub struct Ccw {
    pub cmd: u8,
    pub addr: u32,
    pub flags: CcwFlags,
    pub count: u16,
}

impl Ccw {
    /// Decodes the doubleword CCW wire format: command, 24-bit address,
    /// flags, 16-bit count.
    pub fn from_dword(dw: u64) -> Ccw {
        Ccw {
            cmd: (dw >> 56) as u8,
            addr: ((dw >> 32) & 0x00ff_ffff) as u32,
            flags: CcwFlags::from_bits_truncate((dw >> 24) as u8),
            count: dw as u16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csw {
    pub key: u8,
    pub ccw_addr: u32,
    pub unit: u8,
    pub chan: u8,
    pub count: u16,
}

impl Csw {
    pub fn words(&self) -> (u32, u32) {
        let w0 = ((self.key as u32 & 0xf) << 28) | (self.ccw_addr & 0x00ff_ffff);
        let w1 = ((self.unit as u32) << 24) | ((self.chan as u32) << 16) | self.count as u32;
        (w0, w1)
    }
}

/// Per-device subchannel: the CCW in flight plus accumulated status.
struct SubChan {
    ccw_addr: u32,
    cmd: u8,
    flags: CcwFlags,
    count: u16,
    data_addr: u32,
    key: u8,
    active: bool,
    reverse: bool,
    chain_pending: bool,
    moved: bool,
    status: UnitStat,
    chan_status: u8,
}

impl SubChan {
    fn new() -> SubChan {
        SubChan {
            ccw_addr: 0,
            cmd: 0,
            flags: CcwFlags::empty(),
            count: 0,
            data_addr: 0,
            key: 0,
            active: false,
            reverse: false,
            chain_pending: false,
            moved: false,
            status: UnitStat::empty(),
            chan_status: 0,
        }
    }

    fn csw(&self) -> Csw {
        Csw {
            key: self.key,
            ccw_addr: self.ccw_addr,
            unit: self.status.bits(),
            chan: self.chan_status,
            count: self.count,
        }
    }
}

/// Channel state shared with the devices: storage, subchannels, and the
/// pending-interrupt queue.  The device table itself lives in [`Channel`] so
/// devices can hold this without creating reference cycles.
pub struct ChanSys {
    mem: MemPtr,
    subs: HashMap<DevAddr, SubChan>,
    irq: VecDeque<(DevAddr, Csw)>,
    chain: Vec<DevAddr>,
}

pub type ChanPtr = Rc<RefCell<ChanSys>>;

impl ChanSys {
    pub fn new(mem: MemPtr) -> ChanPtr {
        Rc::new(RefCell::new(ChanSys {
            mem,
            subs: HashMap::new(),
            irq: VecDeque::new(),
            chain: Vec::new(),
        }))
    }

    pub fn mem(&self) -> MemPtr {
        Rc::clone(&self.mem)
    }

    fn register(&mut self, addr: DevAddr) {
        self.subs.entry(addr).or_insert_with(SubChan::new);
    }

    /// Marks the current command as transferring storage in descending
    /// order (read backward).
    pub fn set_reverse(&mut self, addr: DevAddr) {
        if let Some(sub) = self.subs.get_mut(&addr) {
            sub.reverse = true;
        }
    }

    /// Remaining byte count of the CCW in flight.
    pub fn remaining(&self, addr: DevAddr) -> u16 {
        self.subs.get(&addr).map_or(0, |s| s.count)
    }

    /// Fetches the next byte of the current CCW for the device.  The second
    /// element is true when the transfer is over, either because the count
    /// ran out without data chaining or because the channel detected an
    /// error.
    pub fn chan_read_byte(&mut self, addr: DevAddr) -> (u8, bool) {
        let sub = match self.subs.get_mut(&addr) {
            Some(s) if s.active => s,
            _ => return (0, true),
        };
        if sub.count == 0 && !Self::advance_chain_data(&self.mem, sub) {
            return (0, true);
        }
        let sub = self.subs.get_mut(&addr).expect("registered");
        let mut mem = self.mem.borrow_mut();
        if !mem.valid(sub.data_addr) {
            sub.chan_status |= chan_status::PROG_CHK;
            return (0, true);
        }
        if !mem.check_key(sub.data_addr, sub.key, false) {
            sub.chan_status |= chan_status::PROT_CHK;
            return (0, true);
        }
        let byte = mem.read_byte(sub.data_addr);
        drop(mem);
        Self::step(sub);
        let done = sub.count == 0 && !sub.flags.contains(CcwFlags::CD);
        (byte, done)
    }

    /// Stores one byte from the device into storage per the current CCW;
    /// returns true when the transfer is over.
    pub fn chan_write_byte(&mut self, addr: DevAddr, byte: u8) -> bool {
        let sub = match self.subs.get_mut(&addr) {
            Some(s) if s.active => s,
            _ => return true,
        };
        if sub.count == 0 && !Self::advance_chain_data(&self.mem, sub) {
            return true;
        }
        let sub = self.subs.get_mut(&addr).expect("registered");
        if !sub.flags.contains(CcwFlags::SKIP) {
            let mut mem = self.mem.borrow_mut();
            if !mem.valid(sub.data_addr) {
                sub.chan_status |= chan_status::PROG_CHK;
                return true;
            }
            if !mem.check_key(sub.data_addr, sub.key, true) {
                sub.chan_status |= chan_status::PROT_CHK;
                return true;
            }
            mem.write_byte(sub.data_addr, byte);
        }
        Self::step(sub);
        sub.count == 0 && !sub.flags.contains(CcwFlags::CD)
    }

    fn step(sub: &mut SubChan) {
        if sub.reverse {
            sub.data_addr = sub.data_addr.wrapping_sub(1);
        } else {
            sub.data_addr = sub.data_addr.wrapping_add(1);
        }
        sub.count -= 1;
        sub.moved = true;
    }

    /// Follows a data chain once the count runs out.  Returns false when no
    /// chain continues the transfer.
    fn advance_chain_data(mem: &MemPtr, sub: &mut SubChan) -> bool {
        if !sub.flags.contains(CcwFlags::CD) {
            return false;
        }
        let cmd = sub.cmd;
        match fetch_ccw(mem, sub.ccw_addr, sub.key) {
            Ok((ccw, next)) => {
                sub.ccw_addr = next;
                sub.flags = ccw.flags;
                sub.count = ccw.count;
                sub.data_addr = resolve_data_addr(mem, &ccw);
                sub.cmd = cmd;
                sub.count > 0
            }
            Err(status) => {
                sub.chan_status |= status;
                false
            }
        }
    }

    /// Channel-end (and possibly device-end) from the device.  Command
    /// chaining swallows the status and arranges the next command; the tail
    /// of a chain posts an interrupt.
    pub fn chan_end(&mut self, addr: DevAddr, status: UnitStat) {
        let sub = match self.subs.get_mut(&addr) {
            Some(s) => s,
            None => return,
        };
        sub.status |= status | UnitStat::CH_END;
        // A residual count on a command that transferred data is an
        // incorrect-length indication unless the CCW suppressed it.
        if status.contains(UnitStat::DEV_END)
            && sub.moved
            && sub.count != 0
            && !sub.flags.contains(CcwFlags::SLI)
        {
            sub.chan_status |= chan_status::ILEN;
        }
        let fail = sub.status.intersects(UnitStat::UNIT_CHK | UnitStat::UNIT_EXC)
            || sub.chan_status != 0;
        if sub.status.contains(UnitStat::DEV_END)
            && sub.flags.contains(CcwFlags::CC)
            && !fail
        {
            sub.chain_pending = true;
            sub.status = UnitStat::empty();
            self.chain.push(addr);
            return;
        }
        if sub.status.contains(UnitStat::DEV_END) || fail {
            let csw = sub.csw();
            sub.active = false;
            sub.status = UnitStat::empty();
            self.irq.push_back((addr, csw));
            debug!("chan: {:03x} irq {:02x}/{:02x}", addr, csw.unit, csw.chan);
        } else {
            // Channel end alone; device end arrives later via set_dev_attn.
            let csw = sub.csw();
            sub.status = UnitStat::empty();
            self.irq.push_back((addr, csw));
        }
    }

    /// Asynchronous status from the device: attention, deferred device-end,
    /// rewind completion and the like.
    pub fn set_dev_attn(&mut self, addr: DevAddr, status: UnitStat) {
        if let Some(sub) = self.subs.get_mut(&addr) {
            if sub.active
                && sub.flags.contains(CcwFlags::CC)
                && status.contains(UnitStat::DEV_END)
                && !status.intersects(UnitStat::UNIT_CHK | UnitStat::UNIT_EXC)
            {
                sub.chain_pending = true;
                self.chain.push(addr);
                return;
            }
            if status.contains(UnitStat::DEV_END) {
                sub.active = false;
            }
        }
        let csw = Csw { key: 0, ccw_addr: 0, unit: status.bits(), chan: 0, count: 0 };
        self.irq.push_back((addr, csw));
    }

    pub fn irq_pending(&self) -> bool {
        !self.irq.is_empty()
    }

    fn store_csw(&mut self, csw: &Csw) {
        let (w0, w1) = csw.words();
        let mut mem = self.mem.borrow_mut();
        mem.write_word(CSW_LOC, w0);
        mem.write_word(CSW_LOC + 4, w1);
    }
}

fn fetch_ccw(mem: &MemPtr, at: u32, key: u8) -> std::result::Result<(Ccw, u32), u8> {
    let mut m = mem.borrow_mut();
    if at & 7 != 0 || !m.valid(at) {
        return Err(chan_status::PROG_CHK);
    }
    if !m.check_key(at, key, false) {
        return Err(chan_status::PROT_CHK);
    }
    let ccw = Ccw::from_dword(m.read_dword(at));
    drop(m);
    if ccw.cmd & 0x0f == CMD_TIC {
        // Transfer in channel: follow the pointer, once.
        let target = ccw.addr;
        let mut m = mem.borrow_mut();
        if target & 7 != 0 || !m.valid(target) {
            return Err(chan_status::PROG_CHK);
        }
        let next = Ccw::from_dword(m.read_dword(target));
        drop(m);
        if next.cmd & 0x0f == CMD_TIC || next.cmd == 0 {
            return Err(chan_status::PROG_CHK);
        }
        if next.count == 0 {
            return Err(chan_status::PROG_CHK);
        }
        return Ok((next, target + 8));
    }
    if ccw.cmd == 0 || ccw.count == 0 {
        return Err(chan_status::PROG_CHK);
    }
    Ok((ccw, at + 8))
}

fn resolve_data_addr(mem: &MemPtr, ccw: &Ccw) -> u32 {
    if ccw.flags.contains(CcwFlags::IDA) {
        let mut m = mem.borrow_mut();
        m.read_word(ccw.addr & !3) & 0x00ff_ffff
    } else {
        ccw.addr
    }
}

/// The channel facade the CPU talks to: the device table plus the shared
/// channel state and the scheduler.
pub struct Channel {
    devices: Vec<Option<DevRef>>,
    pub sys: ChanPtr,
    sched: Sched,
}

impl Channel {
    pub fn new(mem: MemPtr, sched: Sched) -> Channel {
        let mut devices = Vec::with_capacity(MAX_DEV);
        devices.resize_with(MAX_DEV, || None);
        Channel { devices, sys: ChanSys::new(mem), sched }
    }

    pub fn add_device(&mut self, addr: DevAddr, dev: DevRef) -> crate::error::Result<()> {
        let slot = self
            .devices
            .get_mut(addr as usize)
            .ok_or(crate::error::Error::BadAddress(format!("{:03x}", addr)))?;
        if slot.is_some() {
            return Err(crate::error::Error::DuplicateDevice(addr));
        }
        *slot = Some(dev);
        self.sys.borrow_mut().register(addr);
        Ok(())
    }

    pub fn device(&self, addr: DevAddr) -> Option<DevRef> {
        self.devices.get(addr as usize).and_then(|d| d.clone())
    }

    pub fn devices(&self) -> impl Iterator<Item = (DevAddr, &DevRef)> + '_ {
        self.devices
            .iter()
            .enumerate()
            .filter_map(|(a, d)| d.as_ref().map(|d| (a as DevAddr, d)))
    }

    /// Start I/O: fetch the CAW and the first CCW, then hand the command to
    /// the device.
    pub fn start_io(&mut self, addr: DevAddr) -> u8 {
        let dev = match self.device(addr) {
            Some(d) => d,
            None => return CC3,
        };
        {
            let mut sys = self.sys.borrow_mut();
            if let Some(i) = sys.irq.iter().position(|(a, _)| *a == addr) {
                let (_, csw) = sys.irq.remove(i).expect("indexed");
                sys.store_csw(&csw);
                return CC1;
            }
            if let Some(sub) = sys.subs.get(&addr) {
                if sub.active || sub.chain_pending {
                    return CC2;
                }
            }
        }
        let guard = self.sched.enter();
        let probe = dev.borrow_mut().start_io();
        drop(guard);
        if probe.contains(UnitStat::BUSY) {
            return CC2;
        }
        let (key, ccw_ptr) = {
            let sys = self.sys.borrow();
            let caw = sys.mem.borrow_mut().read_word(CAW_LOC);
            (((caw >> 24) & 0xf0) as u8, caw & 0x00ff_ffff)
        };
        if ccw_ptr & 7 != 0 {
            return self.post_check(addr, key, ccw_ptr, chan_status::PROG_CHK);
        }
        let mem = self.sys.borrow().mem();
        match fetch_ccw(&mem, ccw_ptr, key) {
            Ok((ccw, next)) => self.issue(addr, &dev, key, ccw, next, true),
            Err(status) => self.post_check(addr, key, ccw_ptr, status),
        }
    }

    fn issue(&mut self, addr: DevAddr, dev: &DevRef, key: u8, ccw: Ccw, next: u32, initial: bool) -> u8 {
        let mem = self.sys.borrow().mem();
        {
            let mut sys = self.sys.borrow_mut();
            let data_addr = resolve_data_addr(&mem, &ccw);
            let sub = sys.subs.get_mut(&addr).expect("registered");
            sub.ccw_addr = next;
            sub.cmd = ccw.cmd;
            sub.flags = ccw.flags;
            sub.count = ccw.count;
            sub.data_addr = data_addr;
            sub.key = key;
            sub.active = true;
            sub.reverse = false;
            sub.chain_pending = false;
            sub.moved = false;
            sub.status = UnitStat::empty();
            sub.chan_status = 0;
        }
        let guard = self.sched.enter();
        let status = dev.borrow_mut().start_cmd(ccw.cmd);
        drop(guard);
        self.run_chains();
        if status.is_empty() {
            return CC0;
        }
        // Immediate completion.
        let mut sys = self.sys.borrow_mut();
        let sub = sys.subs.get_mut(&addr).expect("registered");
        sub.status |= status;
        if status.contains(UnitStat::DEV_END)
            && sub.moved
            && sub.count != 0
            && !sub.flags.contains(CcwFlags::SLI)
        {
            sub.chan_status |= chan_status::ILEN;
        }
        if status.contains(UnitStat::DEV_END)
            && sub.flags.contains(CcwFlags::CC)
            && sub.chan_status == 0
            && !status.intersects(UnitStat::UNIT_CHK | UnitStat::UNIT_EXC)
        {
            sub.chain_pending = true;
            sub.status = UnitStat::empty();
            sys.chain.push(addr);
            drop(sys);
            self.run_chains();
            return CC0;
        }
        sub.active = false;
        let csw = sub.csw();
        sub.status = UnitStat::empty();
        if initial {
            sys.store_csw(&csw);
        } else {
            // Tail of a command chain: present the ending as an interrupt.
            sys.irq.push_back((addr, csw));
        }
        CC1
    }

    fn post_check(&mut self, addr: DevAddr, key: u8, ccw_ptr: u32, status: u8) -> u8 {
        let csw =
            Csw { key, ccw_addr: ccw_ptr, unit: 0, chan: status, count: 0 };
        let mut sys = self.sys.borrow_mut();
        if let Some(sub) = sys.subs.get_mut(&addr) {
            sub.active = false;
        }
        sys.store_csw(&csw);
        CC1
    }

    /// Test I/O: drain one pending interrupt for the device, or report its
    /// state.
    pub fn test_io(&mut self, addr: DevAddr) -> u8 {
        if self.device(addr).is_none() {
            return CC3;
        }
        let mut sys = self.sys.borrow_mut();
        if let Some(i) = sys.irq.iter().position(|(a, _)| *a == addr) {
            let (_, csw) = sys.irq.remove(i).expect("indexed");
            sys.store_csw(&csw);
            return CC1;
        }
        if sys.subs.get(&addr).map_or(false, |s| s.active || s.chain_pending) {
            return CC2;
        }
        CC0
    }

    /// Halt I/O on the addressed device.
    pub fn halt_io(&mut self, addr: DevAddr) -> u8 {
        let dev = match self.device(addr) {
            Some(d) => d,
            None => return CC3,
        };
        let active = {
            let sys = self.sys.borrow();
            sys.subs.get(&addr).map_or(false, |s| s.active)
        };
        if !active {
            return CC0;
        }
        let guard = self.sched.enter();
        let status = dev.borrow_mut().halt_io();
        drop(guard);
        let mut sys = self.sys.borrow_mut();
        let sub = sys.subs.get_mut(&addr).expect("registered");
        sub.status |= status;
        sub.active = false;
        let csw = sub.csw();
        sub.status = UnitStat::empty();
        sys.store_csw(&csw);
        CC1
    }

    /// Test channel: probes the channel number in the high four address
    /// bits.
    pub fn test_chan(&self, chan: u8) -> u8 {
        let sys = self.sys.borrow();
        let on_chan = |a: &DevAddr| (a >> 8) as u8 == chan;
        if sys.subs.iter().any(|(a, s)| on_chan(a) && s.active) {
            return CC2;
        }
        if sys.irq.iter().any(|(a, _)| on_chan(a)) {
            return CC1;
        }
        CC0
    }

    /// Pops the next pending I/O interrupt, storing its CSW.  The CPU loop
    /// calls this when interrupts are enabled.
    pub fn next_interrupt(&mut self) -> Option<DevAddr> {
        let mut sys = self.sys.borrow_mut();
        let (addr, csw) = sys.irq.pop_front()?;
        sys.store_csw(&csw);
        Some(addr)
    }

    /// Runs deferred command chaining: fetches the next CCW of any chain
    /// whose device-end arrived and issues the command.
    pub fn run_chains(&mut self) {
        loop {
            let addr = {
                let mut sys = self.sys.borrow_mut();
                match sys.chain.pop() {
                    Some(a) => a,
                    None => return,
                }
            };
            let dev = match self.device(addr) {
                Some(d) => d,
                None => continue,
            };
            let (key, ccw_addr) = {
                let mut sys = self.sys.borrow_mut();
                let sub = sys.subs.get_mut(&addr).expect("registered");
                if !sub.chain_pending {
                    continue;
                }
                sub.chain_pending = false;
                (sub.key, sub.ccw_addr)
            };
            let mem = self.sys.borrow().mem();
            match fetch_ccw(&mem, ccw_addr, key) {
                Ok((ccw, next)) => {
                    self.issue(addr, &dev, key, ccw, next, false);
                }
                Err(status) => {
                    let mut sys = self.sys.borrow_mut();
                    let sub = sys.subs.get_mut(&addr).expect("registered");
                    sub.chan_status |= status;
                    sub.active = false;
                    let csw = sub.csw();
                    sub.status = UnitStat::empty();
                    sys.irq.push_back((addr, csw));
                }
            }
        }
    }

    /// System reset: drop interrupts, clear subchannels, reset devices.
    pub fn reset_all(&mut self) {
        {
            let mut sys = self.sys.borrow_mut();
            sys.irq.clear();
            sys.chain.clear();
            for sub in sys.subs.values_mut() {
                *sub = SubChan::new();
            }
        }
        let guard = self.sched.enter();
        for (_, dev) in self.devices() {
            dev.borrow_mut().reset();
        }
        drop(guard);
    }

    pub fn shutdown(&mut self) {
        let guard = self.sched.enter();
        for (_, dev) in self.devices() {
            dev.borrow_mut().shutdown();
        }
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{wrap, Device};
    use crate::memory::Mem;
    use std::rc::Weak;

    // A device that transfers a fixed byte pattern through the channel as
    // soon as the command is issued.
    struct PipeDev {
        addr: DevAddr,
        chan: ChanPtr,
        emit: Vec<u8>,
        got: Vec<u8>,
        cmds: Vec<u8>,
        me: Weak<RefCell<PipeDev>>,
    }

    impl PipeDev {
        fn new(addr: DevAddr, chan: &ChanPtr) -> Rc<RefCell<PipeDev>> {
            wrap(
                PipeDev {
                    addr,
                    chan: Rc::clone(chan),
                    emit: Vec::new(),
                    got: Vec::new(),
                    cmds: Vec::new(),
                    me: Weak::new(),
                },
                |d, me| d.me = me,
            )
        }
    }

    impl Device for PipeDev {
        fn addr(&self) -> DevAddr {
            self.addr
        }
        fn start_io(&mut self) -> UnitStat {
            UnitStat::empty()
        }
        fn start_cmd(&mut self, cmd: u8) -> UnitStat {
            self.cmds.push(cmd);
            match cmd & 0x0f {
                0x01 => {
                    // Write: pull bytes from storage.
                    loop {
                        let (b, end) = self.chan.borrow_mut().chan_read_byte(self.addr);
                        if end && self.chan.borrow().remaining(self.addr) == 0 {
                            self.got.push(b);
                            break;
                        }
                        self.got.push(b);
                        if end {
                            break;
                        }
                    }
                    UnitStat::CH_END | UnitStat::DEV_END
                }
                0x02 => {
                    // Read: push bytes into storage.
                    let emit = self.emit.clone();
                    for b in emit {
                        if self.chan.borrow_mut().chan_write_byte(self.addr, b) {
                            break;
                        }
                    }
                    UnitStat::CH_END | UnitStat::DEV_END
                }
                0x03 => UnitStat::CH_END | UnitStat::DEV_END,
                _ => UnitStat::UNIT_CHK,
            }
        }
        fn halt_io(&mut self) -> UnitStat {
            UnitStat::CH_END | UnitStat::DEV_END
        }
        fn reset(&mut self) {}
        fn srv(&mut self, _arg: i32) {}
    }

    fn setup() -> (Channel, Rc<RefCell<PipeDev>>, MemPtr) {
        let mem = Mem::new(64 * 1024);
        let sched = Sched::new();
        let mut chan = Channel::new(Rc::clone(&mem), sched);
        let dev = PipeDev::new(0x00a, &chan.sys);
        chan.add_device(0x00a, dev.clone()).unwrap();
        (chan, dev, mem)
    }

    fn put_ccw(mem: &MemPtr, at: u32, cmd: u8, addr: u32, flags: u8, count: u16) {
        let mut m = mem.borrow_mut();
        m.write_word(at, ((cmd as u32) << 24) | addr);
        m.write_word(at + 4, ((flags as u32) << 24) | count as u32);
    }

    #[test]
    fn write_command_pulls_bytes_from_storage() {
        let (mut chan, dev, mem) = setup();
        {
            let mut m = mem.borrow_mut();
            m.write_word(CAW_LOC, 0x500);
            m.write_word(0x600, u32::from_be_bytes(*b"DATA"));
        }
        put_ccw(&mem, 0x500, 0x01, 0x600, 0, 4);
        assert_eq!(chan.start_io(0x00a), CC1);
        assert_eq!(dev.borrow().got, b"DATA");
        // CSW shows the completed transfer.
        let w1 = mem.borrow_mut().read_word(CSW_LOC + 4);
        assert_eq!(w1 >> 24, (UnitStat::CH_END | UnitStat::DEV_END).bits() as u32);
        assert_eq!(w1 & 0xffff, 0);
    }

    #[test]
    fn read_command_stores_bytes() {
        let (mut chan, dev, mem) = setup();
        dev.borrow_mut().emit = b"HELLO".to_vec();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        put_ccw(&mem, 0x500, 0x02, 0x700, 0, 5);
        assert_eq!(chan.start_io(0x00a), CC1);
        let m = &mem;
        let mut got = Vec::new();
        for i in 0..5 {
            got.push(m.borrow_mut().read_byte(0x700 + i));
        }
        assert_eq!(got, b"HELLO");
    }

    #[test]
    fn data_chaining_continues_the_same_command() {
        let (mut chan, dev, mem) = setup();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        // Two bytes at 0x600 chained to two bytes at 0x680.
        put_ccw(&mem, 0x500, 0x01, 0x600, CcwFlags::CD.bits(), 2);
        put_ccw(&mem, 0x508, 0xff, 0x680, 0, 2);
        {
            let mut m = mem.borrow_mut();
            m.write_word(0x600, u32::from_be_bytes(*b"AB\0\0"));
            m.write_word(0x680, u32::from_be_bytes(*b"CD\0\0"));
        }
        assert_eq!(chan.start_io(0x00a), CC1);
        assert_eq!(dev.borrow().got, b"ABCD");
        // The data-chain CCW keeps the original command.
        assert_eq!(dev.borrow().cmds, vec![0x01]);
    }

    #[test]
    fn command_chaining_issues_next_command() {
        let (mut chan, dev, mem) = setup();
        dev.borrow_mut().emit = b"XY".to_vec();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        put_ccw(&mem, 0x500, 0x01, 0x600, CcwFlags::CC.bits(), 1);
        put_ccw(&mem, 0x508, 0x02, 0x700, 0, 2);
        mem.borrow_mut().write_word(0x600, 0x5a00_0000);
        assert_eq!(chan.start_io(0x00a), CC0);
        assert_eq!(dev.borrow().cmds, vec![0x01, 0x02]);
        assert_eq!(mem.borrow_mut().read_byte(0x700), b'X');
        // Interrupt pending from the tail of the chain.
        assert_eq!(chan.next_interrupt(), Some(0x00a));
    }

    #[test]
    fn tic_redirects_the_chain() {
        let (mut chan, dev, mem) = setup();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        // TIC at 0x500 to the real CCW at 0x560.
        put_ccw(&mem, 0x500, 0x08, 0x560, 0, 1);
        put_ccw(&mem, 0x560, 0x03, 0, 0, 1);
        assert_eq!(chan.start_io(0x00a), CC1);
        assert_eq!(dev.borrow().cmds, vec![0x03]);
    }

    #[test]
    fn invalid_ccw_is_a_program_check() {
        let (mut chan, _dev, mem) = setup();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        put_ccw(&mem, 0x500, 0x00, 0x600, 0, 4);
        assert_eq!(chan.start_io(0x00a), CC1);
        let w1 = mem.borrow_mut().read_word(CSW_LOC + 4);
        assert_eq!((w1 >> 16) as u8, chan_status::PROG_CHK);
    }

    #[test]
    fn protection_check_on_fetch_from_protected_block() {
        let (mut chan, dev, mem) = setup();
        {
            let mut m = mem.borrow_mut();
            // Give the data block a different key and set the CAW key.
            m.set_key(0x800, 0x20);
            m.write_word(CAW_LOC, 0x3000_0000 | 0x500);
        }
        put_ccw(&mem, 0x500, 0x02, 0x800, 0, 4);
        dev.borrow_mut().emit = b"Z".to_vec();
        assert_eq!(chan.start_io(0x00a), CC1);
        let w1 = mem.borrow_mut().read_word(CSW_LOC + 4);
        assert_ne!((w1 >> 16) as u8 & chan_status::PROT_CHK, 0);
    }

    #[test]
    fn missing_device_is_cc3() {
        let (mut chan, _dev, _mem) = setup();
        assert_eq!(chan.start_io(0x123), CC3);
        assert_eq!(chan.test_io(0x123), CC3);
    }

    #[test]
    fn test_io_drains_attention() {
        let (mut chan, _dev, mem) = setup();
        chan.sys.borrow_mut().set_dev_attn(0x00a, UnitStat::ATTN | UnitStat::DEV_END);
        assert_eq!(chan.test_io(0x00a), CC1);
        let w1 = mem.borrow_mut().read_word(CSW_LOC + 4);
        assert_eq!(
            (w1 >> 24) as u8,
            (UnitStat::ATTN | UnitStat::DEV_END).bits()
        );
        assert_eq!(chan.test_io(0x00a), CC0);
    }

    #[test]
    fn skip_flag_suppresses_stores() {
        let (mut chan, dev, mem) = setup();
        dev.borrow_mut().emit = b"ZAP".to_vec();
        mem.borrow_mut().write_word(CAW_LOC, 0x500);
        put_ccw(&mem, 0x500, 0x02, 0x700, CcwFlags::SKIP.bits(), 3);
        assert_eq!(chan.start_io(0x00a), CC1);
        assert_eq!(mem.borrow_mut().read_byte(0x700), 0);
    }
}
