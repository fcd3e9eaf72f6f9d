// Telnet front end: per-port listener threads, a per-connection read loop,
// and a negotiation state machine kept free of socket calls so it can be
// driven byte by byte in tests.  Incoming sessions announce a terminal type,
// get routed through the terminal registry and then only speak through the
// master bus.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};

use crate::bus::{BusTx, Message, TermConn};
use crate::device::DevAddr;
use crate::error::{Error, Result};
use crate::terminal::{TermModel, TermRegistry};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_BINARY: u8 = 0;
pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_TTYPE: u8 = 24;
pub const OPT_EOR: u8 = 25;
pub const OPT_LINEMODE: u8 = 34;
pub const OPT_NEW_ENVIRON: u8 = 39;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

const ENV_IS: u8 = 0;
const ENV_SEND: u8 = 1;
const ENV_VAR: u8 = 0;
const ENV_VALUE: u8 = 1;

// Per-option negotiation flags.
const SENT_WILL: u8 = 0x01;
const SENT_WONT: u8 = 0x02;
const SENT_DO: u8 = 0x04;
const SENT_DONT: u8 = 0x08;
const RCVD_WILL: u8 = 0x10;
const RCVD_DO: u8 = 0x20;

const REJECTION: &[u8] = b"No matching terminal type found\r\n";

/// How long a session may dawdle before it is routed as a plain line
/// terminal.
const NEGOTIATE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegState {
    Data,
    Iac,
    Will,
    Wont,
    Do,
    Dont,
    Sb,
    SbData,
    SbIac,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// One byte of user data.
    Data(u8),
    /// The client announced its terminal type ("" when it refused).
    TermType(String),
}

/// Negotiation state machine.  `process_byte` performs no I/O; replies pile
/// up in the output buffer for the caller to flush.
pub struct Session {
    state: NegState,
    opts: [u8; 256],
    sb_opt: u8,
    sb_buf: Vec<u8>,
    out: Vec<u8>,
    pub user: Option<String>,
}

impl Session {
    pub fn new() -> Session {
        let mut s = Session {
            state: NegState::Data,
            opts: [0; 256],
            sb_opt: 0,
            sb_buf: Vec::new(),
            out: Vec::new(),
            user: None,
        };
        // Canonical opening: refuse line mode, offer echo, suppress-go-ahead
        // and binary, ask for the terminal type.
        s.put(&[IAC, WONT, OPT_LINEMODE]);
        s.opts[OPT_LINEMODE as usize] |= SENT_WONT;
        s.put(&[IAC, WILL, OPT_ECHO]);
        s.opts[OPT_ECHO as usize] |= SENT_WILL;
        s.put(&[IAC, WILL, OPT_SGA]);
        s.opts[OPT_SGA as usize] |= SENT_WILL;
        s.put(&[IAC, WILL, OPT_BINARY]);
        s.opts[OPT_BINARY as usize] |= SENT_WILL;
        s.put(&[IAC, DO, OPT_TTYPE]);
        s.opts[OPT_TTYPE as usize] |= SENT_DO;
        s
    }

    fn put(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub fn process_byte(&mut self, b: u8) -> Option<SessionEvent> {
        match self.state {
            NegState::Data => {
                if b == IAC {
                    self.state = NegState::Iac;
                    None
                } else {
                    Some(SessionEvent::Data(b))
                }
            }
            NegState::Iac => match b {
                WILL => {
                    self.state = NegState::Will;
                    None
                }
                WONT => {
                    self.state = NegState::Wont;
                    None
                }
                DO => {
                    self.state = NegState::Do;
                    None
                }
                DONT => {
                    self.state = NegState::Dont;
                    None
                }
                SB => {
                    self.state = NegState::Sb;
                    None
                }
                IAC => {
                    self.state = NegState::Data;
                    Some(SessionEvent::Data(IAC))
                }
                _ => {
                    // NOP, GA and friends.
                    self.state = NegState::Data;
                    None
                }
            },
            NegState::Will => {
                self.state = NegState::Data;
                self.on_will(b)
            }
            NegState::Wont => {
                self.state = NegState::Data;
                self.on_wont(b)
            }
            NegState::Do => {
                self.state = NegState::Data;
                self.on_do(b);
                None
            }
            NegState::Dont => {
                self.state = NegState::Data;
                self.on_dont(b);
                None
            }
            NegState::Sb => {
                self.sb_opt = b;
                self.sb_buf.clear();
                self.state = NegState::SbData;
                None
            }
            NegState::SbData => {
                if b == IAC {
                    self.state = NegState::SbIac;
                } else {
                    self.sb_buf.push(b);
                }
                None
            }
            NegState::SbIac => {
                if b == SE {
                    self.state = NegState::Data;
                    self.on_subnegotiation()
                } else {
                    if b == IAC {
                        self.sb_buf.push(IAC);
                    }
                    self.state = NegState::SbData;
                    None
                }
            }
        }
    }

    fn on_will(&mut self, opt: u8) -> Option<SessionEvent> {
        self.opts[opt as usize] |= RCVD_WILL;
        match opt {
            OPT_TTYPE => {
                // Ask for the name right away.
                self.put(&[IAC, SB, OPT_TTYPE, TTYPE_SEND, IAC, SE]);
                None
            }
            OPT_NEW_ENVIRON => {
                self.put(&[IAC, SB, OPT_NEW_ENVIRON, ENV_SEND, IAC, SE]);
                None
            }
            OPT_BINARY | OPT_SGA | OPT_EOR => {
                if self.opts[opt as usize] & SENT_DO == 0 {
                    self.opts[opt as usize] |= SENT_DO;
                    self.put(&[IAC, DO, opt]);
                }
                None
            }
            _ => {
                if self.opts[opt as usize] & SENT_DONT == 0 {
                    self.opts[opt as usize] |= SENT_DONT;
                    self.put(&[IAC, DONT, opt]);
                }
                None
            }
        }
    }

    fn on_wont(&mut self, opt: u8) -> Option<SessionEvent> {
        self.opts[opt as usize] &= !RCVD_WILL;
        if self.opts[opt as usize] & SENT_DONT == 0 {
            self.opts[opt as usize] |= SENT_DONT;
            self.put(&[IAC, DONT, opt]);
        }
        if opt == OPT_TTYPE {
            // No terminal type coming; the router treats this as line mode.
            return Some(SessionEvent::TermType(String::new()));
        }
        None
    }

    fn on_do(&mut self, opt: u8) {
        self.opts[opt as usize] |= RCVD_DO;
        match opt {
            OPT_ECHO | OPT_SGA | OPT_BINARY | OPT_EOR => {
                if self.opts[opt as usize] & SENT_WILL == 0 {
                    self.opts[opt as usize] |= SENT_WILL;
                    self.put(&[IAC, WILL, opt]);
                }
            }
            _ => {
                if self.opts[opt as usize] & SENT_WONT == 0 {
                    self.opts[opt as usize] |= SENT_WONT;
                    self.put(&[IAC, WONT, opt]);
                }
            }
        }
    }

    fn on_dont(&mut self, opt: u8) {
        self.opts[opt as usize] &= !RCVD_DO;
        if self.opts[opt as usize] & SENT_WONT == 0 {
            self.opts[opt as usize] |= SENT_WONT;
            self.put(&[IAC, WONT, opt]);
        }
    }

    fn on_subnegotiation(&mut self) -> Option<SessionEvent> {
        match self.sb_opt {
            OPT_TTYPE => {
                if self.sb_buf.first() == Some(&TTYPE_IS) {
                    let name: String =
                        self.sb_buf[1..].iter().map(|&b| b as char).collect();
                    return Some(SessionEvent::TermType(name));
                }
                None
            }
            OPT_NEW_ENVIRON => {
                if self.sb_buf.first() == Some(&ENV_IS) {
                    self.parse_environ();
                }
                None
            }
            _ => None,
        }
    }

    /// VAR USER from the NEW-ENVIRON reply; everything else is ignored.
    fn parse_environ(&mut self) {
        let mut i = 1;
        while i < self.sb_buf.len() {
            if self.sb_buf[i] != ENV_VAR {
                break;
            }
            i += 1;
            let mut name = String::new();
            while i < self.sb_buf.len() && self.sb_buf[i] > ENV_VALUE {
                name.push(self.sb_buf[i] as char);
                i += 1;
            }
            if i < self.sb_buf.len() && self.sb_buf[i] == ENV_VALUE {
                i += 1;
                let mut value = String::new();
                while i < self.sb_buf.len() && self.sb_buf[i] > ENV_VALUE {
                    value.push(self.sb_buf[i] as char);
                    i += 1;
                }
                if name.eq_ignore_ascii_case("USER") {
                    self.user = Some(value);
                }
            }
        }
    }
}

/// Parses a terminal-type string into model, extended-attribute flag and
/// requested group, e.g. `IBM-3278-2-E@tso`.
pub fn parse_term_type(name: &str) -> (TermModel, bool, String) {
    let (name, group) = match name.find('@') {
        Some(i) => (&name[..i], name[i + 1..].to_string()),
        None => (name, String::new()),
    };
    let upper = name.to_ascii_uppercase();
    let mut model = TermModel::Line;
    let mut extended = false;
    if let Some(rest) = upper.strip_prefix("IBM-") {
        let mut parts = rest.split('-');
        let display = parts.next().unwrap_or("");
        if matches!(
            display,
            "3277" | "3270" | "3178" | "3278" | "3179" | "3180" | "3287" | "3279"
        ) {
            let mut number = 2u8;
            for part in parts {
                if part == "E" {
                    extended = true;
                } else if let Ok(n) = part.parse::<u8>() {
                    if (1..=5).contains(&n) {
                        number = n;
                    }
                }
            }
            model = TermModel::M3270(number);
        }
    }
    (model, extended, group)
}

/// One listening port.  The accept loop runs on its own thread and hands
/// each connection to a connection thread.
pub struct Listener {
    pub port: u16,
    done: Option<Sender<()>>,
    stopped: Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Listener {
    pub fn start(port: u16, bus: BusTx, registry: Arc<TermRegistry>) -> Result<Listener> {
        let sock = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| Error::Telnet(format!("port {}: {}", port, e)))?;
        let local_port = sock.local_addr().map_err(Error::Io)?.port();
        sock.set_nonblocking(true).map_err(Error::Io)?;
        let (done_tx, done_rx) = bounded::<()>(0);
        let (stopped_tx, stopped_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            accept_loop(sock, local_port, bus, registry, done_rx);
            let _ = stopped_tx.try_send(());
        });
        info!("telnet: listening on port {}", local_port);
        Ok(Listener { port: local_port, done: Some(done_tx), stopped: stopped_rx, handle: Some(handle) })
    }

    /// Closes the done channel and waits at most one second.
    pub fn shutdown(mut self) {
        self.done.take();
        match self.stopped.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                if let Some(h) = self.handle.take() {
                    let _ = h.join();
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                warn!("telnet: listener on {} did not stop; abandoning", self.port);
            }
        }
    }
}

fn accept_loop(
    sock: TcpListener,
    port: u16,
    bus: BusTx,
    registry: Arc<TermRegistry>,
    done: Receiver<()>,
) {
    loop {
        match sock.accept() {
            Ok((stream, peer)) => {
                debug!("telnet: connection from {} on port {}", peer, port);
                let bus = bus.clone();
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    connection(stream, peer.to_string(), port, bus, registry);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                match done.recv_timeout(Duration::from_millis(50)) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    _ => return,
                }
            }
            Err(e) => {
                warn!("telnet: accept failed on port {}: {}", port, e);
                return;
            }
        }
    }
}

fn connection(
    mut stream: TcpStream,
    peer: String,
    port: u16,
    bus: BusTx,
    registry: Arc<TermRegistry>,
) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(Duration::from_millis(100)));
    let mut session = Session::new();
    if flush(&mut stream, &mut session).is_err() {
        return;
    }
    let started = Instant::now();
    let mut dev: Option<DevAddr> = None;
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for &b in buf[..n].iter() {
                    match session.process_byte(b) {
                        Some(SessionEvent::Data(x)) => {
                            if dev.is_some() {
                                pending.push(x);
                            }
                        }
                        Some(SessionEvent::TermType(name)) => {
                            if dev.is_none() {
                                match route(&name, port, &stream, &peer, &bus, &registry) {
                                    Some(addr) => dev = Some(addr),
                                    None => {
                                        let _ = stream.write_all(REJECTION);
                                        return;
                                    }
                                }
                            }
                        }
                        None => {}
                    }
                }
                if flush(&mut stream, &mut session).is_err() {
                    break;
                }
                if let Some(addr) = dev {
                    if !pending.is_empty()
                        && bus
                            .send(Message::TelReceive { dev: addr, data: std::mem::take(&mut pending) })
                            .is_err()
                    {
                        break;
                    }
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if dev.is_none() && started.elapsed() > NEGOTIATE_DEADLINE {
                    // Never announced a type; route as a line terminal.
                    match route("", port, &stream, &peer, &bus, &registry) {
                        Some(addr) => dev = Some(addr),
                        None => {
                            let _ = stream.write_all(REJECTION);
                            return;
                        }
                    }
                }
            }
            Err(_) => break,
        }
    }
    if let Some(addr) = dev {
        let _ = bus.send(Message::TelDisconnect { dev: addr });
        registry.release(addr);
        debug!("telnet: {} disconnected from {:03x}", peer, addr);
    }
}

fn route(
    name: &str,
    port: u16,
    stream: &TcpStream,
    peer: &str,
    bus: &BusTx,
    registry: &TermRegistry,
) -> Option<DevAddr> {
    let (model, _extended, group) = parse_term_type(name);
    let addr = registry.find_terminal(port, &group, model)?;
    let writer = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => {
            registry.release(addr);
            return None;
        }
    };
    let conn = TermConn::new(writer, peer.to_string());
    if bus.send(Message::TelConnect { dev: addr, conn }).is_err() {
        registry.release(addr);
        return None;
    }
    info!("telnet: {} ({}) bound to {:03x}", peer, model.name(), addr);
    Some(addr)
}

fn flush(stream: &mut TcpStream, session: &mut Session) -> std::io::Result<()> {
    let out = session.take_output();
    if out.is_empty() {
        Ok(())
    } else {
        stream.write_all(&out)
    }
}

/// All configured listeners.
pub struct TelnetServer {
    listeners: Vec<Listener>,
}

impl TelnetServer {
    pub fn start(ports: &[u16], bus: &BusTx, registry: &Arc<TermRegistry>) -> Result<TelnetServer> {
        let mut listeners = Vec::new();
        for &port in ports {
            listeners.push(Listener::start(port, bus.clone(), Arc::clone(registry))?);
        }
        Ok(TelnetServer { listeners })
    }

    pub fn ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|l| l.port).collect()
    }

    pub fn shutdown(self) {
        for l in self.listeners {
            l.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(session: &mut Session, bytes: &[u8]) -> Vec<SessionEvent> {
        bytes.iter().filter_map(|&b| session.process_byte(b)).collect()
    }

    #[test]
    fn opening_offer_is_canonical() {
        let mut s = Session::new();
        assert_eq!(
            s.take_output(),
            vec![
                IAC, WONT, OPT_LINEMODE,
                IAC, WILL, OPT_ECHO,
                IAC, WILL, OPT_SGA,
                IAC, WILL, OPT_BINARY,
                IAC, DO, OPT_TTYPE,
            ]
        );
    }

    #[test]
    fn will_ttype_requests_the_name() {
        let mut s = Session::new();
        s.take_output();
        assert!(feed(&mut s, &[IAC, WILL, OPT_TTYPE]).is_empty());
        assert_eq!(s.take_output(), vec![IAC, SB, OPT_TTYPE, TTYPE_SEND, IAC, SE]);
    }

    #[test]
    fn ttype_subnegotiation_yields_the_name() {
        let mut s = Session::new();
        s.take_output();
        let mut bytes = vec![IAC, SB, OPT_TTYPE, TTYPE_IS];
        bytes.extend_from_slice(b"IBM-3278-2@tso");
        bytes.extend_from_slice(&[IAC, SE]);
        let events = feed(&mut s, &bytes);
        assert_eq!(events, vec![SessionEvent::TermType("IBM-3278-2@tso".to_string())]);
    }

    #[test]
    fn unknown_options_are_refused() {
        let mut s = Session::new();
        s.take_output();
        feed(&mut s, &[IAC, WILL, 200]);
        assert_eq!(s.take_output(), vec![IAC, DONT, 200]);
        feed(&mut s, &[IAC, DO, 201]);
        assert_eq!(s.take_output(), vec![IAC, WONT, 201]);
    }

    #[test]
    fn escaped_iac_is_data() {
        let mut s = Session::new();
        s.take_output();
        let events = feed(&mut s, &[b'A', IAC, IAC, b'B']);
        assert_eq!(
            events,
            vec![
                SessionEvent::Data(b'A'),
                SessionEvent::Data(IAC),
                SessionEvent::Data(b'B'),
            ]
        );
    }

    #[test]
    fn wont_ttype_means_line_mode() {
        let mut s = Session::new();
        s.take_output();
        let events = feed(&mut s, &[IAC, WONT, OPT_TTYPE]);
        assert_eq!(events, vec![SessionEvent::TermType(String::new())]);
    }

    #[test]
    fn environ_user_is_captured() {
        let mut s = Session::new();
        s.take_output();
        let mut bytes = vec![IAC, SB, OPT_NEW_ENVIRON, ENV_IS, ENV_VAR];
        bytes.extend_from_slice(b"USER");
        bytes.push(ENV_VALUE);
        bytes.extend_from_slice(b"herc");
        bytes.extend_from_slice(&[IAC, SE]);
        feed(&mut s, &bytes);
        assert_eq!(s.user.as_deref(), Some("herc"));
    }

    #[test]
    fn term_type_parsing() {
        assert_eq!(parse_term_type("IBM-3278-2"), (TermModel::M3270(2), false, String::new()));
        assert_eq!(
            parse_term_type("IBM-3278-4-E@tso"),
            (TermModel::M3270(4), true, "tso".to_string())
        );
        assert_eq!(parse_term_type("IBM-3279"), (TermModel::M3270(2), false, String::new()));
        assert_eq!(parse_term_type("VT100"), (TermModel::Line, false, String::new()));
        assert_eq!(parse_term_type("xterm@ops"), (TermModel::Line, false, "ops".to_string()));
        assert_eq!(parse_term_type(""), (TermModel::Line, false, String::new()));
    }
}
