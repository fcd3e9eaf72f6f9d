// Machine construction: the frozen model registry and the factories that
// wire configured devices into the channel, the scheduler and the terminal
// registry.  The inventory is fixed at compile time; configuration only
// instantiates it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::bus::{master_bus, BusRx, BusTx};
use crate::channel::Channel;
use crate::config::{ConfigLine, RegKind};
use crate::debug::{self, DebugMask};
use crate::device::{DevAddr, NO_DEV};
use crate::error::{Error, Result};
use crate::event::Sched;
use crate::memory::{Mem, MemPtr, DEFAULT_MEM_SIZE};
use crate::mtape::Tape2400;
use crate::printer::Printer1403;
use crate::punch::Punch2540;
use crate::reader::Reader2540;
use crate::terminal::{TermDev, TermModel, TermRegistry};

pub const DEFAULT_TELNET_PORT: u16 = 3270;

/// Everything the virtual-time side of the emulator owns, plus the handles
/// the wall-clock tasks need.
pub struct Machine {
    pub mem: MemPtr,
    pub sched: Sched,
    pub chan: Channel,
    pub registry: Arc<TermRegistry>,
    pub terms: HashMap<DevAddr, Rc<RefCell<TermDev>>>,
    pub bus_tx: BusTx,
    pub bus_rx: BusRx,
    pub default_port: u16,
    pub ipl_dev: Option<DevAddr>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine").finish_non_exhaustive()
    }
}

type Factory = fn(&mut Machine, &ConfigLine) -> Result<()>;

struct ModelEntry {
    name: &'static str,
    kind: RegKind,
    factory: Factory,
}

/// The device registry: populated here, frozen for the life of the process.
static MODELS: &[ModelEntry] = &[
    ModelEntry { name: "1403", kind: RegKind::Model, factory: cfg_1403 },
    ModelEntry { name: "2540R", kind: RegKind::Model, factory: cfg_2540r },
    ModelEntry { name: "2540P", kind: RegKind::Model, factory: cfg_2540p },
    ModelEntry { name: "2400", kind: RegKind::Model, factory: cfg_2400 },
    ModelEntry { name: "3270", kind: RegKind::Model, factory: cfg_3270 },
    ModelEntry { name: "PORT", kind: RegKind::Option, factory: cfg_port },
    ModelEntry { name: "MEMORY", kind: RegKind::Option, factory: cfg_memory },
    ModelEntry { name: "IPL", kind: RegKind::Option, factory: cfg_ipl },
    ModelEntry { name: "DEBUGFILE", kind: RegKind::Option, factory: cfg_debugfile },
    ModelEntry { name: "DEBUG", kind: RegKind::Options, factory: cfg_debug },
];

pub fn lookup_model(name: &str) -> Option<(&'static str, RegKind)> {
    MODELS
        .iter()
        .find(|e| e.name.eq_ignore_ascii_case(name))
        .map(|e| (e.name, e.kind))
}

/// Builds a machine from parsed configuration lines.
pub fn build(lines: &[ConfigLine]) -> Result<Machine> {
    let mut mem_size = DEFAULT_MEM_SIZE;
    for line in lines {
        if line.model.eq_ignore_ascii_case("MEMORY") {
            mem_size = parse_mem_size(line)?;
        }
    }
    let mem = Mem::new(mem_size);
    let sched = Sched::new();
    let chan = Channel::new(Rc::clone(&mem), sched.clone());
    let (bus_tx, bus_rx) = master_bus();
    let mut machine = Machine {
        mem,
        sched,
        chan,
        registry: TermRegistry::new(),
        terms: HashMap::new(),
        bus_tx,
        bus_rx,
        default_port: DEFAULT_TELNET_PORT,
        ipl_dev: None,
    };
    for line in lines {
        apply_line(&mut machine, line)?;
    }
    Ok(machine)
}

fn apply_line(machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let entry = MODELS
        .iter()
        .find(|e| e.name.eq_ignore_ascii_case(&line.model))
        .ok_or_else(|| Error::config(line.line_no, format!("{}: no such device model", line.model)))?;
    match entry.kind {
        RegKind::Model => {
            if line.addr().is_none() {
                return Err(Error::config(
                    line.line_no,
                    format!("{} needs a device address", entry.name),
                ));
            }
        }
        RegKind::Option => {
            if line.first.is_none() || !line.options.is_empty() {
                return Err(Error::config(
                    line.line_no,
                    format!("{} takes exactly one value", entry.name),
                ));
            }
        }
        RegKind::Options => {}
        RegKind::Switch => {
            if line.first.is_some() || !line.options.is_empty() {
                return Err(Error::config(
                    line.line_no,
                    format!("{} takes no arguments", entry.name),
                ));
            }
        }
    }
    (entry.factory)(machine, line)
}

/// Runs every option on the line through the device's option handler;
/// bare extras are flags.
fn apply_options(
    dev: &Rc<RefCell<dyn crate::device::Device>>,
    line: &ConfigLine,
) -> Result<()> {
    for opt in &line.options {
        dev.borrow_mut()
            .set_option(&opt.name, &opt.value)
            .map_err(|e| at_line(e, line.line_no))?;
        for extra in &opt.extra {
            dev.borrow_mut()
                .set_option(extra, "")
                .map_err(|e| at_line(e, line.line_no))?;
        }
    }
    Ok(())
}

fn at_line(e: Error, line_no: usize) -> Error {
    let reason = match e {
        Error::Config { reason, .. } => reason,
        other => other.to_string(),
    };
    Error::Config { line: line_no, reason }
}

fn cfg_1403(machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let addr = line.addr().expect("checked by dispatch");
    let dev = Printer1403::new(addr, &machine.chan.sys, &machine.sched);
    let handle: crate::device::DevRef = dev.clone();
    apply_options(&handle, line)?;
    machine.chan.add_device(addr, handle).map_err(|e| at_line(e, line.line_no))
}

fn cfg_2540r(machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let addr = line.addr().expect("checked by dispatch");
    let dev = Reader2540::new(addr, &machine.chan.sys, &machine.sched);
    let handle: crate::device::DevRef = dev.clone();
    apply_options(&handle, line)?;
    machine.chan.add_device(addr, handle).map_err(|e| at_line(e, line.line_no))
}

fn cfg_2540p(machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let addr = line.addr().expect("checked by dispatch");
    let dev = Punch2540::new(addr, &machine.chan.sys, &machine.sched);
    let handle: crate::device::DevRef = dev.clone();
    apply_options(&handle, line)?;
    machine.chan.add_device(addr, handle).map_err(|e| at_line(e, line.line_no))
}

fn cfg_2400(machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let addr = line.addr().expect("checked by dispatch");
    let dev = Tape2400::new(addr, &machine.chan.sys, &machine.sched);
    let handle: crate::device::DevRef = dev.clone();
    apply_options(&handle, line)?;
    machine.chan.add_device(addr, handle).map_err(|e| at_line(e, line.line_no))
}

fn cfg_3270(machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let addr = line.addr().expect("checked by dispatch");
    let mut port = machine.default_port;
    let mut group = String::new();
    let mut model = TermModel::M3270(2);
    for opt in &line.options {
        match opt.name.to_ascii_lowercase().as_str() {
            "port" => {
                port = opt.value.parse().map_err(|_| {
                    Error::config(line.line_no, format!("bad port {}", opt.value))
                })?;
            }
            "group" => group = opt.value.clone(),
            "model" => {
                model = match opt.value.to_ascii_lowercase().as_str() {
                    "line" => TermModel::Line,
                    n => {
                        let n: u8 = n.parse().map_err(|_| {
                            Error::config(line.line_no, format!("bad model {}", opt.value))
                        })?;
                        if !(1..=5).contains(&n) {
                            return Err(Error::config(
                                line.line_no,
                                format!("model {} out of range", n),
                            ));
                        }
                        TermModel::M3270(n)
                    }
                };
            }
            other => {
                return Err(Error::config(line.line_no, format!("unknown option {}", other)))
            }
        }
    }
    let dev = TermDev::new(addr, model, &machine.chan.sys, &machine.sched);
    machine
        .registry
        .register(addr, model, port, &group)
        .map_err(|e| at_line(e, line.line_no))?;
    machine.terms.insert(addr, dev.clone());
    machine.chan.add_device(addr, dev).map_err(|e| at_line(e, line.line_no))
}

fn cfg_port(machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let value = line.first.as_deref().expect("checked by dispatch");
    machine.default_port = value
        .parse()
        .map_err(|_| Error::config(line.line_no, format!("bad port {}", value)))?;
    Ok(())
}

fn cfg_memory(_machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    // Size was consumed by the pre-scan in build(); validate only.
    parse_mem_size(line).map(|_| ())
}

fn parse_mem_size(line: &ConfigLine) -> Result<usize> {
    let value = line
        .first
        .as_deref()
        .ok_or_else(|| Error::config(line.line_no, "MEMORY takes a size"))?;
    let upper = value.to_ascii_uppercase();
    let (digits, mult) = match upper.strip_suffix('M') {
        Some(d) => (d, 1 << 20),
        None => match upper.strip_suffix('K') {
            Some(d) => (d, 1 << 10),
            None => (upper.as_str(), 1),
        },
    };
    let n: usize = digits
        .parse()
        .map_err(|_| Error::config(line.line_no, format!("bad memory size {}", value)))?;
    let size = n * mult;
    if size == 0 || size > (1 << 24) {
        return Err(Error::config(line.line_no, format!("memory size {} out of range", value)));
    }
    Ok(size)
}

fn cfg_ipl(machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let addr = line
        .addr()
        .ok_or_else(|| Error::config(line.line_no, "IPL takes a device address"))?;
    machine.ipl_dev = Some(addr);
    Ok(())
}

fn cfg_debugfile(_machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let value = line.first.as_deref().expect("checked by dispatch");
    debug::open_debug_file(value).map_err(|e| at_line(Error::Io(e), line.line_no))
}

fn cfg_debug(machine: &mut Machine, line: &ConfigLine) -> Result<()> {
    let mut tags: Vec<&str> = Vec::new();
    let addr = match line.addr() {
        Some(a) => a,
        None => {
            // No address: the first token, if any, is itself a tag and the
            // mask applies everywhere.
            if let Some(first) = line.first.as_deref() {
                tags.push(first);
            }
            NO_DEV
        }
    };
    for opt in &line.options {
        tags.push(&opt.name);
        for extra in &opt.extra {
            tags.push(extra);
        }
    }
    let mask = DebugMask::from_tags(tags.into_iter())
        .ok_or_else(|| Error::config(line.line_no, "unknown debug tag"))?;
    if addr == NO_DEV {
        for (_, dev) in machine.chan.devices() {
            dev.borrow_mut().set_debug(mask);
        }
    } else {
        let dev = machine
            .chan
            .device(addr)
            .ok_or_else(|| Error::config(line.line_no, format!("{:03x}: no such device", addr)))?;
        dev.borrow_mut().set_debug(mask);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_text;

    #[test]
    fn full_machine_builds_from_config() {
        let text = "\
# a small system
MEMORY 64K
PORT 3270
2540R 00C
2540P 00D
1403 00E lpp=60 fcb=STD1
2400 180 format=tap
3270 010 group=tso
3270 011 group=tso
";
        let lines = parse_text(text).unwrap();
        let machine = build(&lines).unwrap();
        assert_eq!(machine.mem.borrow().size(), 64 * 1024);
        assert!(machine.chan.device(0x00c).is_some());
        assert!(machine.chan.device(0x00e).is_some());
        assert!(machine.chan.device(0x180).is_some());
        assert_eq!(machine.terms.len(), 2);
        assert_eq!(machine.registry.ports(), vec![3270]);
    }

    #[test]
    fn unknown_model_stops_the_load() {
        let lines = parse_text("9999 00C\n").unwrap();
        let err = build(&lines).unwrap_err();
        match err {
            Error::Config { line, .. } => assert_eq!(line, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn duplicate_address_is_fatal() {
        let lines = parse_text("2540R 00C\n2540P 00C\n").unwrap();
        let err = build(&lines).unwrap_err();
        match err {
            Error::Config { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn model_without_address_is_fatal() {
        let lines = parse_text("1403\n").unwrap();
        assert!(build(&lines).is_err());
    }

    #[test]
    fn option_kind_rejects_extra_options() {
        let lines = parse_text("PORT 3270 extra=1\n").unwrap();
        assert!(build(&lines).is_err());
    }

    #[test]
    fn debug_line_sets_device_mask() {
        let lines = parse_text("2540R 00C\nDEBUG 00C CMD,DATA\n").unwrap();
        assert!(build(&lines).is_ok());
    }
}
