// Terminal registry and the terminal device.  The registry maps device
// addresses to bindings, listen ports to ordered binding lists and group
// names to ports; telnet connection threads route through it under a single
// lock held only across the scan-and-mark step.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crate::bus::TermConn;
use crate::channel::ChanPtr;
use crate::debug::DebugMask;
use crate::dev_trace;
use crate::device::{sense, DevAddr, Device, UnitStat};
use crate::error::{Error, Result};
use crate::event::Sched;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermModel {
    Line,
    M3270(u8),
}

impl TermModel {
    pub fn name(&self) -> String {
        match self {
            TermModel::Line => "line".to_string(),
            TermModel::M3270(n) => format!("3270-{}", n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub addr: DevAddr,
    pub model: TermModel,
    pub port: u16,
    pub group: String,
    pub in_use: bool,
}

#[derive(Default)]
struct Inner {
    by_addr: HashMap<DevAddr, Binding>,
    ports: HashMap<u16, Vec<DevAddr>>,
    groups: HashMap<String, u16>,
}

/// Shared between configuration and the telnet threads.
#[derive(Default)]
pub struct TermRegistry {
    inner: Mutex<Inner>,
}

impl TermRegistry {
    pub fn new() -> Arc<TermRegistry> {
        Arc::new(TermRegistry::default())
    }

    pub fn register(
        &self,
        addr: DevAddr,
        model: TermModel,
        port: u16,
        group: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("terminal registry");
        if inner.by_addr.contains_key(&addr) {
            return Err(Error::DuplicateDevice(addr));
        }
        inner.by_addr.insert(
            addr,
            Binding { addr, model, port, group: group.to_string(), in_use: false },
        );
        inner.ports.entry(port).or_insert_with(Vec::new).push(addr);
        if !group.is_empty() {
            inner.groups.insert(group.to_string(), port);
        }
        Ok(())
    }

    /// Ports with at least one terminal bound; each gets a listener.
    pub fn ports(&self) -> Vec<u16> {
        let inner = self.inner.lock().expect("terminal registry");
        let mut v: Vec<u16> = inner.ports.keys().copied().collect();
        v.sort_unstable();
        v
    }

    /// Routes an incoming session: an address-shaped group binds that exact
    /// device, a known group walks its members, anything else takes the
    /// first free device of the right model on the port.  The winner is
    /// marked in use before the lock drops.
    pub fn find_terminal(&self, port: u16, group: &str, model: TermModel) -> Option<DevAddr> {
        let mut inner = self.inner.lock().expect("terminal registry");
        if !group.is_empty() && group.len() <= 4 && group.chars().all(|c| c.is_ascii_hexdigit()) {
            if let Ok(addr) = DevAddr::from_str_radix(group, 16) {
                if let Some(b) = inner.by_addr.get_mut(&addr) {
                    if b.port == port && !b.in_use && b.model == model {
                        b.in_use = true;
                        return Some(addr);
                    }
                }
                // An address-shaped group that exists but cannot be used
                // falls through to the generic scans.
            }
        }
        let candidates: Vec<DevAddr> = inner.ports.get(&port)?.clone();
        if !group.is_empty() && inner.groups.get(group) == Some(&port) {
            for addr in candidates.iter() {
                if let Some(b) = inner.by_addr.get_mut(addr) {
                    if b.group == group && !b.in_use && b.model == model {
                        b.in_use = true;
                        return Some(*addr);
                    }
                }
            }
        }
        for addr in candidates.iter() {
            if let Some(b) = inner.by_addr.get_mut(addr) {
                if !b.in_use && b.model == model {
                    b.in_use = true;
                    return Some(*addr);
                }
            }
        }
        None
    }

    pub fn release(&self, addr: DevAddr) {
        let mut inner = self.inner.lock().expect("terminal registry");
        if let Some(b) = inner.by_addr.get_mut(&addr) {
            b.in_use = false;
        }
    }

    pub fn in_use(&self, addr: DevAddr) -> bool {
        let inner = self.inner.lock().expect("terminal registry");
        inner.by_addr.get(&addr).map_or(false, |b| b.in_use)
    }
}

/// The channel-visible terminal.  Output bytes go straight to the bound
/// connection; input queues until the guest reads it, announced with an
/// attention interrupt.
pub struct TermDev {
    addr: DevAddr,
    chan: ChanPtr,
    model: TermModel,
    conn: Option<TermConn>,
    input: VecDeque<u8>,
    sense: u8,
    debug: DebugMask,
}

impl TermDev {
    pub fn new(
        addr: DevAddr,
        model: TermModel,
        chan: &ChanPtr,
        _sched: &Sched,
    ) -> Rc<RefCell<TermDev>> {
        Rc::new(RefCell::new(TermDev {
            addr,
            chan: Rc::clone(chan),
            model,
            conn: None,
            input: VecDeque::new(),
            sense: 0,
            debug: DebugMask::empty(),
        }))
    }

    pub fn model(&self) -> TermModel {
        self.model
    }

    pub fn connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Binds the accepted connection; called by the bus consumer on
    /// TelConnect.
    pub fn connect(&mut self, conn: TermConn) {
        dev_trace!(self.debug, DebugMask::CONN, &self.unit(), "connect from {}", conn.peer());
        self.conn = Some(conn);
        self.input.clear();
        self.chan.borrow_mut().set_dev_attn(self.addr, UnitStat::ATTN | UnitStat::DEV_END);
    }

    pub fn disconnect(&mut self) {
        if let Some(mut c) = self.conn.take() {
            c.close();
        }
        self.input.clear();
        self.chan.borrow_mut().set_dev_attn(self.addr, UnitStat::ATTN | UnitStat::DEV_END);
    }

    /// Queues received bytes and raises attention.
    pub fn push_input(&mut self, data: &[u8]) {
        self.input.extend(data.iter().copied());
        self.chan.borrow_mut().set_dev_attn(self.addr, UnitStat::ATTN);
    }

    fn unit(&self) -> String {
        format!("term {:03x}", self.addr)
    }
}

impl Device for TermDev {
    fn addr(&self) -> DevAddr {
        self.addr
    }

    fn start_io(&mut self) -> UnitStat {
        UnitStat::empty()
    }

    fn start_cmd(&mut self, cmd: u8) -> UnitStat {
        match cmd {
            0x04 => {
                let b = self.sense;
                self.chan.borrow_mut().chan_write_byte(self.addr, b);
                self.sense = 0;
                UnitStat::CH_END | UnitStat::DEV_END
            }
            0x03 => UnitStat::CH_END | UnitStat::DEV_END,
            _ if cmd & 0x07 == 0x01 => {
                if self.conn.is_none() {
                    self.sense = sense::INTERVENTION;
                    return UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK;
                }
                let mut out = Vec::new();
                loop {
                    let (b, end) = self.chan.borrow_mut().chan_read_byte(self.addr);
                    out.push(b);
                    if end {
                        break;
                    }
                }
                if let Some(c) = self.conn.as_mut() {
                    if c.send(&out).is_err() {
                        self.sense = sense::EQUIP_CHK;
                        return UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK;
                    }
                }
                UnitStat::CH_END | UnitStat::DEV_END
            }
            _ if cmd & 0x07 == 0x02 => {
                if self.input.is_empty() {
                    return UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_EXC;
                }
                while let Some(b) = self.input.pop_front() {
                    if self.chan.borrow_mut().chan_write_byte(self.addr, b) {
                        break;
                    }
                }
                UnitStat::CH_END | UnitStat::DEV_END
            }
            _ => {
                self.sense = sense::CMD_REJ;
                UnitStat::CH_END | UnitStat::DEV_END | UnitStat::UNIT_CHK
            }
        }
    }

    fn halt_io(&mut self) -> UnitStat {
        UnitStat::CH_END | UnitStat::DEV_END
    }

    fn reset(&mut self) {
        self.input.clear();
        self.sense = 0;
    }

    fn srv(&mut self, _arg: i32) {}

    fn show(&self) -> String {
        format!(
            "term {:03x} {} {}",
            self.addr,
            self.model.name(),
            if self.conn.is_some() { "connected" } else { "free" }
        )
    }

    fn set_debug(&mut self, mask: DebugMask) {
        self.debug = mask;
    }

    fn shutdown(&mut self) {
        if let Some(mut c) = self.conn.take() {
            c.close();
        }
    }
}
