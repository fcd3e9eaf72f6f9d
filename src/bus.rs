// Master message bus: the one FIFO pipe between the wall-clock tasks
// (telnet, interval timer) and the single virtual-time consumer.

use std::fmt;
use std::io::Write;
use std::net::{Shutdown, TcpStream};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::device::DevAddr;

/// Writer half of an accepted telnet connection, handed to the consumer on
/// connect.
pub struct TermConn {
    stream: TcpStream,
    peer: String,
}

impl TermConn {
    pub fn new(stream: TcpStream, peer: String) -> TermConn {
        TermConn { stream, peer }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes)
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl fmt::Debug for TermConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TermConn({})", self.peer)
    }
}

#[derive(Debug)]
pub enum Message {
    /// Interval-timer tick.
    TimeClock,
    /// A telnet session was routed to the terminal at `dev`.
    TelConnect { dev: DevAddr, conn: TermConn },
    /// Bytes arrived from the session bound to `dev`.
    TelReceive { dev: DevAddr, data: Vec<u8> },
    /// The session bound to `dev` went away.
    TelDisconnect { dev: DevAddr },
    /// Boot request for the given device.
    Ipl { dev: DevAddr },
    Shutdown,
}

pub type BusTx = Sender<Message>;
pub type BusRx = Receiver<Message>;

pub fn master_bus() -> (BusTx, BusRx) {
    unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_arrive_in_order() {
        let (tx, rx) = master_bus();
        tx.send(Message::TimeClock).unwrap();
        tx.send(Message::Ipl { dev: 0x00c }).unwrap();
        tx.send(Message::Shutdown).unwrap();
        assert!(matches!(rx.recv().unwrap(), Message::TimeClock));
        assert!(matches!(rx.recv().unwrap(), Message::Ipl { dev: 0x00c }));
        assert!(matches!(rx.recv().unwrap(), Message::Shutdown));
    }
}
