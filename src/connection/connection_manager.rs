use std::sync::Arc;
use std::time::{Duration, Instant};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::config::S3tpConfig;
use crate::connection::connection::Connection;
use crate::connection::connection_events::{ConnectionEvent, ConnectionListener};
use crate::connection::connection_state::{ConnectionOptions, ConnectionRole, ConnectionState};
use crate::error::{S3tpError, S3tpResult};
use crate::sequence::SerialNumber;
use crate::wire::packet::Packet;
use crate::wire::packet_header::{MessageType, PacketFlags, PacketHeader};

/// A connection with its own lock, and a condition variable that is signalled whenever the
///  connection's state changes or room becomes available in its queues or window
struct ConnectionHandle {
    connection: Mutex<Connection>,
    changed: Condvar,
}

/// Owns the connections, at most one per local port.
///
/// Each connection has its own lock, so traffic on one port does not block other ports; the
///  table has a separate lock. NB: The table lock may be acquired before a connection's lock,
///  never the other way around. No lock is held while calling the listener.
pub struct ConnectionManager {
    config: Arc<S3tpConfig>,
    connections: Mutex<FxHashMap<u8, Arc<ConnectionHandle>>>,
    listener: Arc<dyn ConnectionListener>,
}

impl ConnectionManager {
    pub fn new(config: Arc<S3tpConfig>, listener: Arc<dyn ConnectionListener>) -> ConnectionManager {
        ConnectionManager {
            config,
            connections: Default::default(),
            listener,
        }
    }

    fn get(&self, local_port: u8) -> Option<Arc<ConnectionHandle>> {
        self.connections.lock().get(&local_port).cloned()
    }

    /// Runs `f` on a connection and fans out the events it raised
    fn with_connection<R>(&self, local_port: u8, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let handle = self.get(local_port)?;
        let (result, events) = {
            let mut connection = handle.connection.lock();
            let result = f(&mut connection);
            (result, connection.drain_events())
        };
        handle.changed.notify_all();
        self.dispatch(local_port, &handle, events);
        Some(result)
    }

    fn dispatch(&self, local_port: u8, handle: &Arc<ConnectionHandle>, events: Vec<ConnectionEvent>) {
        let mut disconnected = false;
        for event in events {
            trace!("connection event: {:?}", event);
            disconnected |= event.is_disconnect();
            self.listener.on_connection_event(event);
        }

        if disconnected {
            let mut connections = self.connections.lock();
            // the port may have been reused by a new connection in the meantime
            if connections.get(&local_port).is_some_and(|h| Arc::ptr_eq(h, handle)) {
                debug!("removing connection on port {}", local_port);
                connections.remove(&local_port);
            }
        }
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn state(&self, local_port: u8) -> Option<ConnectionState> {
        self.get(local_port)
            .map(|h| h.connection.lock().state())
    }

    /// Opens a connection as the initiator and starts the handshake
    pub fn open(&self, local_port: u8, remote_port: u8, channel: u8, options: ConnectionOptions) -> S3tpResult<()> {
        for port in [local_port, remote_port] {
            if port > PacketHeader::MAX_PORT {
                return Err(S3tpError::InvalidPort(port));
            }
        }

        let (handle, events) = {
            let mut connections = self.connections.lock();
            if connections.contains_key(&local_port) {
                return Err(S3tpError::PortBusy(local_port));
            }

            let mut connection = Connection::new(self.config.clone(), ConnectionRole::Initiator, local_port, remote_port, channel, options);
            connection.open(Instant::now())?;
            let events = connection.drain_events();

            let handle = Arc::new(ConnectionHandle {
                connection: Mutex::new(connection),
                changed: Condvar::new(),
            });
            connections.insert(local_port, handle.clone());
            (handle, events)
        };

        debug!("opening connection {} -> {} on channel {}", local_port, remote_port, channel);
        self.dispatch(local_port, &handle, events);
        Ok(())
    }

    /// Routes a connection packet to the connection on its destination port. A SYN for a port
    ///  without a connection creates one if the listener accepts it, and is refused with SYN+RST
    ///  otherwise.
    pub fn handle_inbound(&self, packet: Packet) -> S3tpResult<()> {
        debug_assert_eq!(packet.header.message_type, MessageType::Connection);
        let local_port = packet.port();

        if let Some(result) = self.with_connection(local_port, |c| c.handle_packet(packet.clone())) {
            return result;
        }

        if packet.header.flags == PacketFlags::SYN {
            return self.on_unsolicited_syn(packet);
        }

        if !packet.has_flags(PacketFlags::RST) {
            self.reject(&packet, PacketFlags::RST);
        }
        Err(S3tpError::PortNotOpen(local_port))
    }

    fn on_unsolicited_syn(&self, syn: Packet) -> S3tpResult<()> {
        let local_port = syn.port();
        let remote_port = syn.header.src_port;

        let Some(options) = self.listener.accept_connection(local_port, remote_port) else {
            debug!("refusing connection from {} on port {}", remote_port, local_port);
            self.reject(&syn, PacketFlags::SYN | PacketFlags::RST);
            return Err(S3tpError::PortNotOpen(local_port));
        };

        let (handle, events) = {
            let mut connections = self.connections.lock();
            if connections.contains_key(&local_port) {
                // a concurrent SYN created the connection between our lookup and the table lock
                drop(connections);
                return self.with_connection(local_port, |c| c.handle_packet(syn))
                    .unwrap_or(Err(S3tpError::PortNotOpen(local_port)));
            }

            let mut connection = Connection::new(self.config.clone(), ConnectionRole::Responder, local_port, remote_port, syn.channel, options);
            connection.on_syn(&syn, Instant::now())?;
            let events = connection.drain_events();

            let handle = Arc::new(ConnectionHandle {
                connection: Mutex::new(connection),
                changed: Condvar::new(),
            });
            connections.insert(local_port, handle.clone());
            (handle, events)
        };

        debug!("accepted connection from {} on port {}", remote_port, local_port);
        self.dispatch(local_port, &handle, events);
        Ok(())
    }

    fn reject(&self, packet: &Packet, flags: PacketFlags) {
        let mut header = PacketHeader::new(packet.port(), packet.header.src_port, MessageType::Connection);
        header.flags = flags;
        header.ack = packet.header.rel_seq.next();
        let reply = Packet::new(header, Bytes::new(), packet.channel);

        self.listener.on_connection_event(ConnectionEvent::Rejected { local_port: packet.port(), reply });
    }

    pub fn close(&self, local_port: u8) -> S3tpResult<()> {
        self.with_connection(local_port, |c| c.close(Instant::now()))
            .unwrap_or(Err(S3tpError::PortNotOpen(local_port)))
    }

    pub fn reset(&self, local_port: u8) -> S3tpResult<()> {
        self.with_connection(local_port, |c| c.reset())
            .ok_or(S3tpError::PortNotOpen(local_port))
    }

    /// resets all connections, e.g. on shutdown
    pub fn reset_all(&self) {
        let ports: Vec<u8> = self.connections.lock().keys().copied().collect();
        for port in ports {
            let _ = self.reset(port);
        }
    }

    /// Sends the fragments of a message through a connection, failing with `QueueFull` if the
    ///  connection has no room for them right now. See [Connection::send_out_packets].
    pub fn send(&self, local_port: u8, packets: Vec<Packet>, assign_fragment_seqs: impl FnOnce(&mut [Packet])) -> S3tpResult<()> {
        self.with_connection(local_port, |c| c.send_out_packets(packets, Instant::now(), assign_fragment_seqs))
            .unwrap_or(Err(S3tpError::NotConnected(local_port)))
    }

    /// Like [ConnectionManager::send], but waits up to `timeout` for room in the connection's
    ///  outbound queue and transmission window
    pub fn send_blocking(&self, local_port: u8, packets: Vec<Packet>, timeout: Duration, assign_fragment_seqs: impl FnOnce(&mut [Packet])) -> S3tpResult<()> {
        let handle = self.get(local_port)
            .ok_or(S3tpError::NotConnected(local_port))?;
        let deadline = Instant::now() + timeout;

        let (result, events) = {
            let mut connection = handle.connection.lock();
            loop {
                match connection.check_send(&packets) {
                    Err(S3tpError::QueueFull) => {
                        trace!("connection {} is full - waiting", local_port);
                        if handle.changed.wait_until(&mut connection, deadline).timed_out() {
                            return Err(S3tpError::QueueFull);
                        }
                    }
                    Err(e) => return Err(e),
                    Ok(()) => break,
                }
            }
            let result = connection.send_out_packets(packets, Instant::now(), assign_fragment_seqs);
            (result, connection.drain_events())
        };

        self.dispatch(local_port, &handle, events);
        result
    }

    pub fn take_outbound(&self, local_port: u8) -> Vec<Packet> {
        self.with_connection(local_port, |c| c.take_outbound())
            .unwrap_or_default()
    }

    pub fn requeue_outbound(&self, local_port: u8, packets: Vec<Packet>) {
        if self.with_connection(local_port, |c| c.requeue_outbound(packets)).is_none() {
            debug!("connection on port {} is gone - dropping outbound packets", local_port);
        }
    }

    pub fn take_inbound(&self, local_port: u8) -> Vec<Packet> {
        self.with_connection(local_port, |c| c.take_inbound())
            .unwrap_or_default()
    }

    /// drives retransmission for all connections
    pub fn tick(&self, now: Instant) {
        let ports: Vec<u8> = self.connections.lock().keys().copied().collect();
        for port in ports {
            self.with_connection(port, |c| c.on_tick(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{OnceLock, Weak};
    use std::thread;
    use mockall::predicate::eq;
    use rstest::rstest;
    use crate::connection::connection_events::MockConnectionListener;

    /// Accepts or refuses all connections and records all events. Like the protocol engine, it
    ///  takes outbound packets as soon as they are available.
    struct RecordingListener {
        accept: Option<ConnectionOptions>,
        manager: OnceLock<Weak<ConnectionManager>>,
        events: Mutex<Vec<ConnectionEvent>>,
        outbound: Mutex<Vec<Packet>>,
    }
    impl RecordingListener {
        fn take_events(&self) -> Vec<ConnectionEvent> {
            std::mem::take(&mut *self.events.lock())
        }

        fn take_outbound(&self) -> Vec<Packet> {
            std::mem::take(&mut *self.outbound.lock())
        }

        fn states(&self, local_port: u8) -> Vec<ConnectionState> {
            self.events.lock().iter()
                .filter_map(|e| match e {
                    ConnectionEvent::StateChanged(data) if data.local_port == local_port => Some(data.new_state),
                    _ => None,
                })
                .collect()
        }
    }
    impl ConnectionListener for RecordingListener {
        fn on_connection_event(&self, event: ConnectionEvent) {
            self.events.lock().push(event.clone());

            match event {
                ConnectionEvent::OutboundAvailable { local_port } => {
                    if let Some(manager) = self.manager.get().and_then(|m| m.upgrade()) {
                        let packets = manager.take_outbound(local_port);
                        self.outbound.lock().extend(packets);
                    }
                }
                ConnectionEvent::Rejected { reply, .. } => self.outbound.lock().push(reply),
                _ => {}
            }
        }

        fn accept_connection(&self, _local_port: u8, _remote_port: u8) -> Option<ConnectionOptions> {
            self.accept
        }
    }

    fn new_manager(config: Arc<S3tpConfig>, accept: Option<ConnectionOptions>) -> (Arc<ConnectionManager>, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener {
            accept,
            manager: OnceLock::new(),
            events: Default::default(),
            outbound: Default::default(),
        });
        let manager = Arc::new(ConnectionManager::new(config, listener.clone()));
        let _ = listener.manager.set(Arc::downgrade(&manager));
        (manager, listener)
    }

    fn pump(from: &RecordingListener, to: &ConnectionManager) {
        for packet in from.take_outbound() {
            let _ = to.handle_inbound(packet);
        }
    }

    fn syn(src_port: u8, dst_port: u8) -> Packet {
        let mut header = PacketHeader::new(src_port, dst_port, MessageType::Connection);
        header.flags = PacketFlags::SYN;
        header.rel_seq = 41;
        Packet::new(header, Bytes::new(), 3)
    }

    fn fragment(payload: &'static [u8]) -> Packet {
        Packet::new(PacketHeader::new(0, 0, MessageType::Connection), Bytes::from_static(payload), 0)
    }

    struct Peers {
        a: Arc<ConnectionManager>,
        listener_a: Arc<RecordingListener>,
        b: Arc<ConnectionManager>,
        listener_b: Arc<RecordingListener>,
    }

    fn connected_peers(config: S3tpConfig) -> Peers {
        let config = Arc::new(config);
        let (a, listener_a) = new_manager(config.clone(), None);
        let (b, listener_b) = new_manager(config, Some(ConnectionOptions::empty()));

        a.open(5, 9, 1, ConnectionOptions::empty()).unwrap();
        pump(&listener_a, &b);
        pump(&listener_b, &a);
        pump(&listener_a, &b);
        Peers { a, listener_a, b, listener_b }
    }

    #[test]
    fn test_open() {
        let (manager, listener) = new_manager(Arc::new(S3tpConfig::default()), None);

        manager.open(5, 9, 1, ConnectionOptions::empty()).unwrap();
        assert_eq!(manager.state(5), Some(ConnectionState::Connecting));
        assert!(matches!(manager.open(5, 10, 1, ConnectionOptions::empty()), Err(S3tpError::PortBusy(5))));
        assert!(matches!(manager.open(128, 10, 1, ConnectionOptions::empty()), Err(S3tpError::InvalidPort(128))));
        assert!(matches!(manager.open(6, 200, 1, ConnectionOptions::empty()), Err(S3tpError::InvalidPort(200))));

        assert!(listener.take_events().contains(&ConnectionEvent::OutboundAvailable { local_port: 5 }));
        let syn = listener.take_outbound();
        assert_eq!(syn.len(), 1);
        assert_eq!(syn[0].header.flags, PacketFlags::SYN);
    }

    #[test]
    fn test_syn_refused() {
        let mut listener = MockConnectionListener::new();
        listener.expect_accept_connection()
            .with(eq(9), eq(5))
            .times(1)
            .returning(|_, _| None);
        listener.expect_on_connection_event()
            .withf(|e| matches!(e, ConnectionEvent::Rejected { local_port: 9, reply }
                if reply.header.flags == PacketFlags::SYN | PacketFlags::RST
                    && reply.header.src_port == 9
                    && reply.port() == 5
                    && reply.header.ack == 42
                    && reply.channel == 3))
            .times(1)
            .return_const(());

        let manager = ConnectionManager::new(Arc::new(S3tpConfig::default()), Arc::new(listener));
        assert!(matches!(manager.handle_inbound(syn(5, 9)), Err(S3tpError::PortNotOpen(9))));
        assert_eq!(manager.num_connections(), 0);
    }

    #[test]
    fn test_syn_accepted() {
        let mut listener = MockConnectionListener::new();
        listener.expect_accept_connection()
            .with(eq(9), eq(5))
            .times(1)
            .returning(|_, _| Some(ConnectionOptions::RETRANSMIT));
        listener.expect_on_connection_event()
            .withf(|e| matches!(e, ConnectionEvent::OutboundAvailable { local_port: 9 }))
            .times(1)
            .return_const(());
        listener.expect_on_connection_event()
            .withf(|e| matches!(e, ConnectionEvent::StateChanged(data) if data.new_state == ConnectionState::Connecting))
            .times(1)
            .return_const(());

        let manager = ConnectionManager::new(Arc::new(S3tpConfig::default()), Arc::new(listener));
        manager.handle_inbound(syn(5, 9)).unwrap();
        assert_eq!(manager.state(9), Some(ConnectionState::Connecting));

        let syn_ack = manager.take_outbound(9);
        assert_eq!(syn_ack.len(), 1);
        assert_eq!(syn_ack[0].header.flags, PacketFlags::SYN | PacketFlags::ACK);
        assert_eq!(syn_ack[0].header.ack, 42);
        assert_eq!(syn_ack[0].channel, 3);
    }

    #[rstest]
    #[case::data(PacketFlags::DATA | PacketFlags::ACK, true)]
    #[case::fin(PacketFlags::FIN, true)]
    #[case::rst(PacketFlags::RST, false)]
    fn test_packet_for_unknown_port(#[case] flags: PacketFlags, #[case] expect_reject: bool) {
        let (manager, listener) = new_manager(Arc::new(S3tpConfig::default()), None);

        let mut header = PacketHeader::new(5, 9, MessageType::Connection);
        header.flags = flags;
        assert!(matches!(manager.handle_inbound(Packet::new(header, Bytes::new(), 0)), Err(S3tpError::PortNotOpen(9))));

        let rejected = listener.take_outbound();
        assert_eq!(!rejected.is_empty(), expect_reject);
        for reply in rejected {
            assert_eq!(reply.header.flags, PacketFlags::RST);
            assert_eq!(reply.port(), 5);
        }
    }

    #[test]
    fn test_handshake_and_close() {
        let peers = connected_peers(S3tpConfig::default());
        assert_eq!(peers.a.state(5), Some(ConnectionState::Connected));
        assert_eq!(peers.b.state(9), Some(ConnectionState::Connected));

        peers.a.close(5).unwrap();
        assert!(matches!(peers.a.close(5), Err(S3tpError::AlreadyClosing(5))));
        pump(&peers.listener_a, &peers.b);
        assert_eq!(peers.b.state(9), None);
        pump(&peers.listener_b, &peers.a);
        assert_eq!(peers.a.state(5), None);

        assert_eq!(peers.a.num_connections(), 0);
        assert_eq!(peers.b.num_connections(), 0);
        assert_eq!(peers.listener_a.states(5), vec![ConnectionState::Connecting, ConnectionState::Connected, ConnectionState::Disconnecting, ConnectionState::Disconnected]);
        assert_eq!(peers.listener_b.states(9), vec![ConnectionState::Connecting, ConnectionState::Connected, ConnectionState::Disconnected]);

        assert!(matches!(peers.a.close(5), Err(S3tpError::PortNotOpen(5))));
        assert!(matches!(peers.a.send(5, vec![fragment(b"x")], |_| {}), Err(S3tpError::NotConnected(5))));
    }

    #[test]
    fn test_data_is_routed() {
        let peers = connected_peers(S3tpConfig::default());
        peers.listener_b.take_events();

        peers.a.send(5, vec![fragment(b"hello")], |_| {}).unwrap();
        pump(&peers.listener_a, &peers.b);

        assert!(peers.listener_b.take_events().contains(&ConnectionEvent::InboundAvailable { local_port: 9 }));
        let inbound = peers.b.take_inbound(9);
        assert_eq!(inbound.len(), 1);
        assert_eq!(&inbound[0].payload[..], b"hello");
    }

    #[test]
    fn test_reset_all() {
        let peers = connected_peers(S3tpConfig::default());

        peers.a.reset_all();
        assert_eq!(peers.a.num_connections(), 0);
        assert_eq!(peers.listener_a.states(5), vec![ConnectionState::Connecting, ConnectionState::Connected, ConnectionState::Resetting, ConnectionState::Disconnected]);

        let rst = peers.listener_a.take_outbound();
        assert_eq!(rst.len(), 1);
        assert!(rst[0].has_flags(PacketFlags::RST));

        peers.b.handle_inbound(rst[0].clone()).unwrap();
        assert_eq!(peers.b.num_connections(), 0);
    }

    #[test]
    fn test_send_blocking_times_out() {
        let peers = connected_peers(S3tpConfig { transmission_window: 1, ..Default::default() });
        peers.a.send(5, vec![fragment(b"x")], |_| {}).unwrap();

        let start = Instant::now();
        assert!(matches!(peers.a.send_blocking(5, vec![fragment(b"y")], Duration::from_millis(50), |_| {}), Err(S3tpError::QueueFull)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_send_blocking_resumes_on_ack() {
        let peers = connected_peers(S3tpConfig { transmission_window: 1, ..Default::default() });
        peers.a.send(5, vec![fragment(b"x")], |_| {}).unwrap();
        pump(&peers.listener_a, &peers.b);

        let sender = peers.a.clone();
        let blocked = thread::spawn(move || sender.send_blocking(5, vec![fragment(b"y")], Duration::from_secs(5), |_| {}));

        thread::sleep(Duration::from_millis(20));
        pump(&peers.listener_b, &peers.a);

        assert!(blocked.join().unwrap().is_ok());
    }

    #[test]
    fn test_tick_retransmits() {
        let config = S3tpConfig {
            retransmission_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let (manager, listener) = new_manager(Arc::new(config), None);

        manager.open(5, 9, 1, ConnectionOptions::RETRANSMIT).unwrap();
        let syn = listener.take_outbound();

        manager.tick(Instant::now() + Duration::from_millis(10));
        assert_eq!(listener.take_outbound(), syn);
    }
}
