pub mod bus;
pub mod card;
pub mod channel;
pub mod config;
pub mod debug;
pub mod device;
pub mod error;
pub mod event;
pub mod hollerith;
pub mod ibm370;
pub mod memory;
pub mod mtape;
pub mod printer;
pub mod punch;
pub mod reader;
pub mod tape;
pub mod telnet;
pub mod terminal;
pub mod timer;

use bus::Message;
use crossbeam_channel::RecvTimeoutError;
use error::Result;
use ibm370::Machine;
use log::{info, warn};
use telnet::TelnetServer;
use timer::IntervalTimer;

/// A parsed machine description, ready to be instantiated.
pub struct Configuration {
    pub lines: Vec<config::ConfigLine>,
}

impl Configuration {
    pub fn from_file(path: &str) -> Result<Configuration> {
        Ok(Configuration { lines: config::load_file(path)? })
    }

    pub fn from_text(text: &str) -> Result<Configuration> {
        Ok(Configuration { lines: config::parse_text(text)? })
    }
}

/// The assembled emulator: the virtual-time machine plus the wall-clock
/// telnet listeners and the interval timer.  The CPU interpreter drives it
/// through `advance` and the channel operations; the master bus delivers
/// everything the wall-clock side produces.
pub struct Emulator {
    pub machine: Machine,
    telnet: Option<TelnetServer>,
    timer: Option<IntervalTimer>,
}

impl Emulator {
    pub fn new(config: Configuration) -> Result<Emulator> {
        let machine = ibm370::build(&config.lines)?;
        let ports = machine.registry.ports();
        let telnet = TelnetServer::start(&ports, &machine.bus_tx, &machine.registry)?;
        let timer = IntervalTimer::start(machine.bus_tx.clone());
        Ok(Emulator { machine, telnet: Some(telnet), timer: Some(timer) })
    }

    /// Advances virtual time, firing due device events and running deferred
    /// command chains.
    pub fn advance(&mut self, units: u32) {
        self.machine.sched.advance(units);
        self.machine.chan.run_chains();
    }

    pub fn start_io(&mut self, addr: device::DevAddr) -> u8 {
        let cc = self.machine.chan.start_io(addr);
        self.machine.chan.run_chains();
        cc
    }

    pub fn test_io(&mut self, addr: device::DevAddr) -> u8 {
        self.machine.chan.test_io(addr)
    }

    pub fn halt_io(&mut self, addr: device::DevAddr) -> u8 {
        self.machine.chan.halt_io(addr)
    }

    pub fn test_chan(&self, chan: u8) -> u8 {
        self.machine.chan.test_chan(chan)
    }

    pub fn next_interrupt(&mut self) -> Option<device::DevAddr> {
        self.machine.chan.next_interrupt()
    }

    /// System reset: clears the channel and resets every device.
    pub fn reset(&mut self) {
        self.machine.chan.reset_all();
    }

    /// Handles one master-bus message.  Returns false on shutdown.
    pub fn dispatch(&mut self, msg: Message) -> bool {
        match msg {
            Message::TimeClock => {}
            Message::TelConnect { dev, conn } => match self.machine.terms.get(&dev) {
                Some(term) => term.borrow_mut().connect(conn),
                None => warn!("connect for unknown terminal {:03x}", dev),
            },
            Message::TelReceive { dev, data } => {
                if let Some(term) = self.machine.terms.get(&dev) {
                    term.borrow_mut().push_input(&data);
                }
            }
            Message::TelDisconnect { dev } => {
                if let Some(term) = self.machine.terms.get(&dev) {
                    term.borrow_mut().disconnect();
                }
            }
            Message::Ipl { dev } => {
                info!("IPL request for {:03x}", dev);
                self.machine.ipl_dev = Some(dev);
            }
            Message::Shutdown => return false,
        }
        true
    }

    /// Minimal supervisor loop used by the binary: drain the bus, advance
    /// simulated time, repeat until shutdown.
    pub fn run(&mut self) {
        loop {
            match self.machine.bus_rx.recv_timeout(std::time::Duration::from_millis(1)) {
                Ok(msg) => {
                    if !self.dispatch(msg) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
            self.advance(1000);
        }
    }

    /// Orderly teardown: stop the wall-clock tasks, then let every device
    /// flush and detach.
    pub fn shutdown(mut self) {
        if let Some(t) = self.telnet.take() {
            t.shutdown();
        }
        if let Some(t) = self.timer.take() {
            t.shutdown();
        }
        self.machine.chan.shutdown();
    }
}
