//! The network stack driver task.
//!
//! Owns the smoltcp interface, the socket set and the link endpoint queues.
//! One loop iteration drains pending commands and inbound frames, polls the
//! interface, pumps bytes between sockets and their stream channels, and
//! flushes outbound frames towards the TUN. Between iterations it sleeps on
//! whichever comes first: a new frame, a command, a wake notification or the
//! interface's own timer deadline.

use super::link::ChannelDevice;
use super::stream::AcceptedConn;
use super::{
    ConnId, StackCmd, TcpForwardFn, TcpForwarderRequest, CONN_CHANNEL_CAPACITY, LINK_QUEUE_SIZE,
    MAX_IN_FLIGHT_TCP_ATTEMPTS, TCP_RECEIVE_BUFFER_SIZE, TCP_SEND_BUFFER_SIZE,
};
use crate::error::{VnetError, VnetResult};
use bytes::Bytes;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::{Duration as SmolDuration, Instant as SmolInstant};
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpListenEndpoint, IpProtocol, Ipv4Packet, Ipv6Packet,
    TcpPacket,
};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

/// Upper bound on how long the driver sleeps when smoltcp has no timer
/// pending.
const POLL_INTERVAL_MAX: Duration = Duration::from_millis(100);

/// Keep-alive probing interval for accepted connections.
const KEEP_ALIVE_INTERVAL: SmolDuration = SmolDuration::from_secs(75);

struct PendingAttempt {
    /// The intercepted SYN, held until the attempt completes one way or the
    /// other.
    syn: Vec<u8>,
}

struct ConnState {
    id: ConnId,
    /// Receive side of the stream; `None` once EOF has been delivered.
    read_tx: Option<mpsc::Sender<Bytes>>,
    write_rx: mpsc::Receiver<Bytes>,
    /// Chunk accepted from the stream but not yet fitted into the socket's
    /// send buffer.
    pending_write: Option<Bytes>,
    peer_events: CancellationToken,
    /// Close requested by the stream or supervisor; honored once buffered
    /// writes have drained.
    close_requested: bool,
    /// A FIN has been issued via `socket.close()`.
    closing: bool,
    established: bool,
    saw_active: bool,
}

pub(crate) struct StackDriver {
    iface: Interface,
    device: ChannelDevice,
    sockets: SocketSet<'static>,
    conns: HashMap<SocketHandle, ConnState>,
    conn_ids: HashMap<ConnId, SocketHandle>,
    attempts: HashMap<ConnId, PendingAttempt>,
    local_addrs: HashSet<IpAddr>,
    frames_in: mpsc::Receiver<Vec<u8>>,
    frames_open: bool,
    frames_out: Option<mpsc::Sender<Vec<u8>>>,
    cmds_rx: mpsc::UnboundedReceiver<StackCmd>,
    cmds_open: bool,
    cmds_tx: mpsc::UnboundedSender<StackCmd>,
    wake: Arc<Notify>,
    destroy: CancellationToken,
    endpoint_closed: CancellationToken,
    forward_tcp: TcpForwardFn,
}

impl StackDriver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        nic_addr: Ipv6Addr,
        frames_in: mpsc::Receiver<Vec<u8>>,
        frames_out: mpsc::Sender<Vec<u8>>,
        cmds_rx: mpsc::UnboundedReceiver<StackCmd>,
        cmds_tx: mpsc::UnboundedSender<StackCmd>,
        wake: Arc<Notify>,
        destroy: CancellationToken,
        endpoint_closed: CancellationToken,
        forward_tcp: TcpForwardFn,
    ) -> VnetResult<Self> {
        let mut device = ChannelDevice::new();
        let config = IfaceConfig::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, SmolInstant::now());

        // Registered addresses are tracked in `local_addrs`; the interface
        // itself accepts every destination so unregistered ones still draw a
        // reset from the TCP layer.
        iface.set_any_ip(true);
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(nic_addr), 64));
        });

        // Pass all outbound IP packets to the NIC, regardless of destination.
        iface
            .routes_mut()
            .add_default_ipv6_route(nic_addr)
            .map_err(|e| VnetError::stack(format!("installing IPv6 default route: {e:?}")))?;

        Ok(Self {
            iface,
            device,
            sockets: SocketSet::new(vec![]),
            conns: HashMap::new(),
            conn_ids: HashMap::new(),
            attempts: HashMap::new(),
            local_addrs: HashSet::new(),
            frames_in,
            frames_open: true,
            frames_out: Some(frames_out),
            cmds_rx,
            cmds_open: true,
            cmds_tx,
            wake,
            destroy,
            endpoint_closed,
            forward_tcp,
        })
    }

    pub(crate) async fn run(mut self) {
        log::debug!("Network stack driver started.");
        loop {
            self.drain_cmds();
            self.drain_frames();

            let now = SmolInstant::now();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
            self.pump_connections();
            self.flush_outbound();

            if self.endpoint_closed.is_cancelled() && self.frames_out.is_some() {
                // Closing the link endpoint unblocks the stack-to-TUN
                // forwarder.
                self.frames_out = None;
            }
            if self.destroy.is_cancelled() {
                break;
            }

            let delay = self
                .iface
                .poll_delay(now, &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(POLL_INTERVAL_MAX);

            tokio::select! {
                _ = self.destroy.cancelled() => break,
                frame = self.frames_in.recv(), if self.frames_open => match frame {
                    Some(frame) => self.handle_inbound_frame(frame),
                    None => self.frames_open = false,
                },
                cmd = self.cmds_rx.recv(), if self.cmds_open => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => self.cmds_open = false,
                },
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.teardown();
        log::debug!("Network stack driver finished.");
    }

    fn drain_cmds(&mut self) {
        if !self.cmds_open {
            return;
        }
        loop {
            match self.cmds_rx.try_recv() {
                Ok(cmd) => self.handle_cmd(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.cmds_open = false;
                    break;
                }
            }
        }
    }

    fn drain_frames(&mut self) {
        if !self.frames_open {
            return;
        }
        while self.device.inbound.len() < LINK_QUEUE_SIZE {
            match self.frames_in.try_recv() {
                Ok(frame) => self.handle_inbound_frame(frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.frames_open = false;
                    break;
                }
            }
        }
    }

    fn handle_cmd(&mut self, cmd: StackCmd) {
        match cmd {
            StackCmd::RegisterAddress { addr, reply } => {
                self.local_addrs.insert(addr);
                let _ = reply.send(());
            }
            StackCmd::Accept { id, reply } => self.accept_attempt(id, reply),
            StackCmd::Refuse { id } => self.refuse_attempt(id),
            StackCmd::Close { handle } => self.close_conn(handle),
        }
    }

    /// Route one frame from the TUN. SYNs for registered addresses become
    /// forwarder requests with the frame held back; everything else goes
    /// straight into the link endpoint.
    fn handle_inbound_frame(&mut self, frame: Vec<u8>) {
        if let Some(id) = syn_conn_id(&frame) {
            if self.attempts.contains_key(&id) {
                // SYN retransmission while the attempt is still undecided.
                return;
            }
            if !self.conn_ids.contains_key(&id) && self.local_addrs.contains(&id.local.ip()) {
                if self.attempts.len() >= MAX_IN_FLIGHT_TCP_ATTEMPTS {
                    log::debug!("{id}: dropping SYN, in-flight attempt budget exhausted.");
                    return;
                }
                self.attempts.insert(id, PendingAttempt { syn: frame });
                let request = TcpForwarderRequest::new(id, self.cmds_tx.clone(), self.wake.clone());
                (self.forward_tcp)(request);
                return;
            }
        }
        self.inject_inbound(frame);
    }

    fn inject_inbound(&mut self, frame: Vec<u8>) {
        if self.device.inbound.len() >= LINK_QUEUE_SIZE {
            // Inbound endpoint queue full; drop rather than block.
            return;
        }
        self.device.inbound.push_back(frame);
    }

    /// Complete an attempt without a reset: create the listening endpoint,
    /// release the held SYN into it, and hand the connection halves back.
    fn accept_attempt(&mut self, id: ConnId, reply: oneshot::Sender<VnetResult<AcceptedConn>>) {
        let Some(attempt) = self.attempts.remove(&id) else {
            let _ = reply.send(Err(VnetError::stack(
                "creating TCP endpoint: unknown connection attempt",
            )));
            return;
        };

        let mut socket = TcpSocket::new(
            SocketBuffer::new(vec![0; TCP_RECEIVE_BUFFER_SIZE]),
            SocketBuffer::new(vec![0; TCP_SEND_BUFFER_SIZE]),
        );
        let local = IpListenEndpoint {
            addr: Some(ip_address(id.local.ip())),
            port: id.local.port(),
        };
        if let Err(e) = socket.listen(local) {
            // No socket will match the held SYN, so releasing it draws a
            // reset from the stack.
            self.inject_inbound(attempt.syn);
            let _ = reply.send(Err(VnetError::stack(format!(
                "creating TCP endpoint: {e:?}"
            ))));
            return;
        }
        socket.set_keep_alive(Some(KEEP_ALIVE_INTERVAL));

        let handle = self.sockets.add(socket);
        let (read_tx, read_rx) = mpsc::channel(CONN_CHANNEL_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(CONN_CHANNEL_CAPACITY);
        let peer_events = CancellationToken::new();
        self.conns.insert(
            handle,
            ConnState {
                id,
                read_tx: Some(read_tx),
                write_rx,
                pending_write: None,
                peer_events: peer_events.clone(),
                close_requested: false,
                closing: false,
                established: false,
                saw_active: false,
            },
        );
        self.conn_ids.insert(id, handle);
        self.inject_inbound(attempt.syn);

        let _ = reply.send(Ok(AcceptedConn {
            handle,
            read_rx,
            write_tx,
            peer_events,
            cmds: self.cmds_tx.clone(),
            wake: self.wake.clone(),
        }));
    }

    /// Complete an attempt with a TCP reset: releasing the held SYN without a
    /// matching socket makes the stack refuse it.
    fn refuse_attempt(&mut self, id: ConnId) {
        if let Some(attempt) = self.attempts.remove(&id) {
            log::debug!("{id}: completing connection attempt with reset.");
            self.inject_inbound(attempt.syn);
        }
    }

    fn close_conn(&mut self, handle: SocketHandle) {
        if let Some(conn) = self.conns.get_mut(&handle) {
            conn.close_requested = true;
        }
    }

    /// Move bytes between every socket and its stream channels, watch for
    /// peer events, and collect finished connections.
    fn pump_connections(&mut self) {
        let mut finished: Vec<SocketHandle> = Vec::new();
        for (&handle, conn) in self.conns.iter_mut() {
            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            if socket.is_active() {
                conn.saw_active = true;
            }
            // may_send is true from Established onwards, including CloseWait.
            if socket.may_send() {
                conn.established = true;
            }

            // Stack -> stream: drain received bytes into the read channel.
            while socket.can_recv() {
                let Some(read_tx) = conn.read_tx.as_ref() else {
                    break;
                };
                if read_tx.capacity() == 0 {
                    break;
                }
                let chunk = match socket.recv(|buf| (buf.len(), Bytes::copy_from_slice(buf))) {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                };
                if chunk.is_empty() {
                    break;
                }
                if read_tx.try_send(chunk).is_err() {
                    break;
                }
            }
            // End of stream once the peer is done sending and the receive
            // buffer has drained.
            if conn.read_tx.is_some()
                && conn.established
                && !socket.may_recv()
                && !socket.can_recv()
            {
                conn.read_tx = None;
            }

            // Stream -> stack: fit buffered writes into the send buffer.
            let mut drained = false;
            loop {
                if let Some(pending) = conn.pending_write.take() {
                    if !socket.can_send() {
                        conn.pending_write = Some(pending);
                        break;
                    }
                    match socket.send_slice(&pending) {
                        Ok(n) if n < pending.len() => {
                            conn.pending_write = Some(pending.slice(n..));
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => {
                            conn.pending_write = Some(pending);
                            break;
                        }
                    }
                }
                match conn.write_rx.try_recv() {
                    Ok(chunk) => conn.pending_write = Some(chunk),
                    Err(TryRecvError::Empty) => {
                        drained = true;
                        break;
                    }
                    Err(TryRecvError::Disconnected) => {
                        drained = true;
                        conn.close_requested = true;
                        break;
                    }
                }
            }
            if conn.close_requested && !conn.closing && drained && conn.pending_write.is_none() {
                conn.closing = true;
                socket.close();
            }

            // Peer FIN, reset, or transport error.
            let state = socket.state();
            let peer_done = match state {
                TcpState::CloseWait | TcpState::Closing | TcpState::LastAck => true,
                TcpState::Closed | TcpState::TimeWait => conn.saw_active,
                _ => false,
            };
            if peer_done {
                conn.peer_events.cancel();
            }

            if state == TcpState::Closed {
                finished.push(handle);
            }
        }

        for handle in finished {
            if let Some(conn) = self.conns.remove(&handle) {
                log::debug!("{}: TCP connection finished.", conn.id);
                self.conn_ids.remove(&conn.id);
                conn.peer_events.cancel();
                self.sockets.remove(handle);
            }
        }
    }

    /// Drain outbound frames from the link endpoint towards the TUN.
    fn flush_outbound(&mut self) {
        while let Some(frame) = self.device.outbound.pop_front() {
            let Some(frames_out) = self.frames_out.as_ref() else {
                self.device.outbound.clear();
                return;
            };
            match frames_out.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Outbound endpoint queue full; drop and let TCP
                    // retransmit.
                }
                Err(TrySendError::Closed(_)) => {
                    self.frames_out = None;
                    self.device.outbound.clear();
                    return;
                }
            }
        }
    }

    /// Release all transport state. Pending attempts and queued packets are
    /// discarded; streams observe EOF and write failures.
    fn teardown(&mut self) {
        for (handle, conn) in self.conns.drain() {
            self.sockets.get_mut::<TcpSocket>(handle).abort();
            conn.peer_events.cancel();
        }
        self.conn_ids.clear();
        self.attempts.clear();
        self.device.inbound.clear();
        self.device.outbound.clear();
    }
}

fn ip_address(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6),
    }
}

/// Parse a frame just far enough to recognize an initial TCP SYN and extract
/// its 4-tuple. Returns `None` for anything that is not a SYN-without-ACK.
fn syn_conn_id(frame: &[u8]) -> Option<ConnId> {
    match frame.first()? >> 4 {
        4 => {
            let ip = Ipv4Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
            (tcp.syn() && !tcp.ack()).then(|| ConnId {
                local: SocketAddr::new(IpAddr::V4(ip.dst_addr()), tcp.dst_port()),
                remote: SocketAddr::new(IpAddr::V4(ip.src_addr()), tcp.src_port()),
            })
        }
        6 => {
            let ip = Ipv6Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
            (tcp.syn() && !tcp.ack()).then(|| ConnId {
                local: SocketAddr::new(IpAddr::V6(ip.dst_addr()), tcp.dst_port()),
                remote: SocketAddr::new(IpAddr::V6(ip.src_addr()), tcp.src_port()),
            })
        }
        _ => None,
    }
}
