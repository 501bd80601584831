use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};
use crate::application::ApplicationLayer;
use crate::connection::connection_state::ConnectionState;

#[derive(Default)]
struct Recorded {
    messages: Vec<(u8, Vec<u8>)>,
    states: Vec<(u8, ConnectionState)>,
    link_status: Vec<bool>,
}

/// An [ApplicationLayer] that records everything it is notified of, with blocking accessors for
///  waiting on notifications from the protocol engine's worker threads
#[derive(Default)]
pub struct RecordingApplication {
    recorded: Mutex<Recorded>,
    changed: Condvar,
}

impl RecordingApplication {
    pub fn messages(&self) -> Vec<(u8, Vec<u8>)> {
        self.recorded.lock().messages.clone()
    }

    pub fn states(&self, port: u8) -> Vec<ConnectionState> {
        self.recorded.lock().states.iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn link_status(&self) -> Vec<bool> {
        self.recorded.lock().link_status.clone()
    }

    /// Waits until at least `n` messages were delivered, returning the first `n`. Returns `None`
    ///  on timeout.
    pub fn wait_for_messages(&self, n: usize, timeout: Duration) -> Option<Vec<(u8, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;
        let mut recorded = self.recorded.lock();
        while recorded.messages.len() < n {
            if self.changed.wait_until(&mut recorded, deadline).timed_out() {
                return None;
            }
        }
        Some(recorded.messages[..n].to_vec())
    }

    /// Waits until a port reached a given connection state. Returns `false` on timeout.
    pub fn wait_for_state(&self, port: u8, state: ConnectionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut recorded = self.recorded.lock();
        while !recorded.states.contains(&(port, state)) {
            if self.changed.wait_until(&mut recorded, deadline).timed_out() {
                return false;
            }
        }
        true
    }

    fn record(&self, f: impl FnOnce(&mut Recorded)) {
        f(&mut self.recorded.lock());
        self.changed.notify_all();
    }
}

impl ApplicationLayer for RecordingApplication {
    fn deliver_to_application(&self, port: u8, message: Vec<u8>) -> anyhow::Result<()> {
        self.record(|r| r.messages.push((port, message)));
        Ok(())
    }

    fn on_connection_state_changed(&self, port: u8, state: ConnectionState) {
        self.record(|r| r.states.push((port, state)));
    }

    fn on_link_status_changed(&self, is_available: bool) {
        self.record(|r| r.link_status.push(is_available));
    }
}
