// Interval timer: a wall-clock ticker thread posting TimeClock messages on
// the master bus while enabled.  Shutdown closes the done channel and waits
// at most one second before abandoning the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use log::debug;

use crate::bus::{BusTx, Message};

/// Nominal tick period, about 150 Hz.
pub const TICK_MICROS: u64 = 6666;

pub struct IntervalTimer {
    enabled: Arc<AtomicBool>,
    done: Option<Sender<()>>,
    stopped: Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl IntervalTimer {
    pub fn start(bus: BusTx) -> IntervalTimer {
        let enabled = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = bounded::<()>(0);
        let (stopped_tx, stopped_rx) = bounded::<()>(1);
        let run = Arc::clone(&enabled);
        let handle = thread::spawn(move || {
            let ticker = tick(Duration::from_micros(TICK_MICROS));
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if run.load(Ordering::Relaxed)
                            && bus.send(Message::TimeClock).is_err()
                        {
                            break;
                        }
                    }
                    recv(done_rx) -> _ => break,
                }
            }
            let _ = stopped_tx.try_send(());
        });
        IntervalTimer { enabled, done: Some(done_tx), stopped: stopped_rx, handle: Some(handle) }
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Stops the ticker, waiting at most one second for the thread to wind
    /// down.
    pub fn shutdown(mut self) {
        self.done.take();
        match self.stopped.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                if let Some(h) = self.handle.take() {
                    let _ = h.join();
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                debug!("interval timer did not stop in time; abandoning");
            }
        }
    }
}
