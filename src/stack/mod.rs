//! In-process network stack façade.
//!
//! The VNet terminates TCP itself: frames that arrive over the TUN device are
//! fed to a smoltcp interface bound to a single virtual NIC behind a software
//! link endpoint, and inbound connection attempts to registered addresses are
//! handed to the manager as [`TcpForwarderRequest`]s. smoltcp supplies the
//! wire formats, the TCP state machine and the socket buffers; everything it
//! owns lives inside one driver task ([`driver::StackDriver`]) that the rest
//! of the crate reaches through channels.

pub(crate) mod driver;
mod link;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;

use crate::error::{VnetError, VnetResult};
use smoltcp::iface::SocketHandle;
use smoltcp::wire::{IpAddress, IpCidr};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use driver::StackDriver;
use stream::AcceptedConn;

/// MTU of the virtual NIC, matching the TUN device configuration.
pub const MTU: usize = 1500;

/// Packets queued by the software link endpoint in each direction. Beyond
/// this the endpoint drops inbound frames and defers outbound ones.
pub(crate) const LINK_QUEUE_SIZE: usize = 512;

/// Receive/send buffer sizes for accepted TCP endpoints.
pub(crate) const TCP_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;
pub(crate) const TCP_SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum number of inbound connection attempts that may sit between SYN
/// interception and user-space completion. Further SYNs are dropped and the
/// client retransmits.
pub(crate) const MAX_IN_FLIGHT_TCP_ATTEMPTS: usize = 1024;

/// Per-connection channel depths between the driver and a stream object.
pub(crate) const CONN_CHANNEL_CAPACITY: usize = 32;

/// TCP 4-tuple identifying an inbound connection.
///
/// `local` is the VNet-side destination address the client connected to;
/// `remote` is the client's own address on the host side of the TUN.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}

/// Commands accepted by the stack driver.
pub(crate) enum StackCmd {
    /// Treat `addr` as local: SYNs addressed to it become forwarder requests.
    /// Acknowledged once the driver has applied the registration.
    RegisterAddress {
        addr: IpAddr,
        reply: oneshot::Sender<()>,
    },
    /// Complete an attempt without a reset: create the endpoint, finish the
    /// handshake and hand back the connection halves.
    Accept {
        id: ConnId,
        reply: oneshot::Sender<VnetResult<AcceptedConn>>,
    },
    /// Complete an attempt with a TCP reset.
    Refuse { id: ConnId },
    /// Close an accepted connection once its outbound data has drained.
    Close { handle: SocketHandle },
}

/// Callback invoked by the driver for every intercepted SYN.
pub(crate) type TcpForwardFn = Box<dyn Fn(TcpForwarderRequest) + Send + Sync>;

/// One inbound TCP connection attempt delivered by the stack.
///
/// Every request resolves to exactly one completion: [`create_endpoint`]
/// finishes the handshake (no reset), while dropping the request unaccepted
/// refuses the attempt with a TCP reset. The drop guard makes leaking a slot
/// from the attempt budget impossible.
///
/// [`create_endpoint`]: TcpForwarderRequest::create_endpoint
pub(crate) struct TcpForwarderRequest {
    id: ConnId,
    cmds: mpsc::UnboundedSender<StackCmd>,
    wake: Arc<Notify>,
    completed: bool,
}

impl TcpForwarderRequest {
    pub(crate) fn new(id: ConnId, cmds: mpsc::UnboundedSender<StackCmd>, wake: Arc<Notify>) -> Self {
        Self {
            id,
            cmds,
            wake,
            completed: false,
        }
    }

    /// The 4-tuple of the intercepted SYN.
    pub(crate) fn id(&self) -> ConnId {
        self.id
    }

    /// Complete the attempt without a reset, equivalent to sending SYN-ACK.
    pub(crate) async fn create_endpoint(mut self) -> VnetResult<AcceptedConn> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.completed = true;
        self.cmds
            .send(StackCmd::Accept {
                id: self.id,
                reply: reply_tx,
            })
            .map_err(|_| VnetError::stack("creating TCP endpoint: network stack is gone"))?;
        self.wake.notify_one();
        reply_rx
            .await
            .map_err(|_| VnetError::stack("creating TCP endpoint: attempt dropped by the stack"))?
    }
}

impl Drop for TcpForwarderRequest {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.cmds.send(StackCmd::Refuse { id: self.id });
            self.wake.notify_one();
        }
    }
}

/// Handle to the stack driver shared by the manager and connection objects.
#[derive(Clone)]
pub(crate) struct Netstack {
    cmds: mpsc::UnboundedSender<StackCmd>,
    wake: Arc<Notify>,
    destroy: CancellationToken,
    endpoint_closed: CancellationToken,
}

impl Netstack {
    /// Register `addr` as a protocol address on the virtual NIC.
    ///
    /// Returns once the driver has applied the registration, so any SYN the
    /// stack delivers afterwards sees the address as local.
    pub(crate) async fn add_protocol_address(&self, addr: IpAddr) -> VnetResult<()> {
        let _ = protocol_address(addr)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmds
            .send(StackCmd::RegisterAddress {
                addr,
                reply: reply_tx,
            })
            .map_err(|_| VnetError::stack("adding protocol address: network stack is gone"))?;
        self.wake.notify_one();
        reply_rx
            .await
            .map_err(|_| VnetError::stack("adding protocol address: network stack is gone"))
    }

    /// Close the software link endpoint, unblocking the stack-to-TUN
    /// forwarder.
    pub(crate) fn close_endpoint(&self) {
        self.endpoint_closed.cancel();
        self.wake.notify_one();
    }

    /// Tear down the stack, releasing all sockets and pending packets. The
    /// driver task finishes shortly after.
    pub(crate) fn destroy(&self) {
        self.destroy.cancel();
        self.wake.notify_one();
    }
}

/// Everything `create_stack` produces: the shared handle, the two link
/// endpoint halves for the packet forwarders, and the unspawned driver.
pub(crate) struct StackHandles {
    pub netstack: Netstack,
    pub frames_in: mpsc::Sender<Vec<u8>>,
    pub frames_out: mpsc::Receiver<Vec<u8>>,
    pub driver: StackDriver,
}

/// Build the network stack: one virtual NIC with `nic_addr` assigned, an
/// IPv6 default route, and TCP interception wired to `forward_tcp`.
pub(crate) fn create_stack(nic_addr: Ipv6Addr, forward_tcp: TcpForwardFn) -> VnetResult<StackHandles> {
    let (frames_in_tx, frames_in_rx) = mpsc::channel(LINK_QUEUE_SIZE);
    let (frames_out_tx, frames_out_rx) = mpsc::channel(LINK_QUEUE_SIZE);
    let (cmds_tx, cmds_rx) = mpsc::unbounded_channel();
    let wake = Arc::new(Notify::new());
    let destroy = CancellationToken::new();
    let endpoint_closed = CancellationToken::new();

    let driver = StackDriver::new(
        nic_addr,
        frames_in_rx,
        frames_out_tx,
        cmds_rx,
        cmds_tx.clone(),
        wake.clone(),
        destroy.clone(),
        endpoint_closed.clone(),
        forward_tcp,
    )?;

    Ok(StackHandles {
        netstack: Netstack {
            cmds: cmds_tx,
            wake,
            destroy,
            endpoint_closed,
        },
        frames_in: frames_in_tx,
        frames_out: frames_out_rx,
        driver,
    })
}

/// Classify an address for protocol registration. The protocol is inferred
/// from the prefix length: 32 means IPv4, 128 means IPv6, anything else is a
/// parameter error.
pub(crate) fn protocol_address(addr: IpAddr) -> VnetResult<IpCidr> {
    let cidr = match addr {
        IpAddr::V4(v4) => IpCidr::new(IpAddress::Ipv4(v4), 32),
        IpAddr::V6(v6) => IpCidr::new(IpAddress::Ipv6(v6), 128),
    };
    match cidr.prefix_len() {
        32 | 128 => Ok(cidr),
        other => Err(VnetError::bad_parameter(format!(
            "unhandled prefix length {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn protocol_address_ipv6() {
        let cidr = protocol_address(IpAddr::V6("fd00::2".parse().unwrap())).unwrap();
        assert_eq!(cidr.prefix_len(), 128);
    }

    #[test]
    fn protocol_address_ipv4() {
        let cidr = protocol_address(IpAddr::V4(Ipv4Addr::new(100, 64, 0, 2))).unwrap();
        assert_eq!(cidr.prefix_len(), 32);
    }

    #[test]
    fn conn_id_display() {
        let id = ConnId {
            local: "[fd00::2]:80".parse().unwrap(),
            remote: "[fd00::aaaa]:40000".parse().unwrap(),
        };
        assert_eq!(id.to_string(), "[fd00::aaaa]:40000 -> [fd00::2]:80");
    }
}
