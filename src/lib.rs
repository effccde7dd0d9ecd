//! vnet library
//!
//! A userspace virtual network: the process presents itself to the host OS
//! as a point-to-point TUN interface and terminates TCP connections
//! addressed to a private IPv6 range internally. Applications on the host
//! reach in-process [`TcpHandler`]s simply by connecting to an address
//! obtained from [`Manager::bind_handler`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            vnet                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  TUN device ◄──► link endpoint ◄──► TCP/IP stack ◄──► handler│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Raw L3 frames are shuttled between the TUN device and an in-process
//! TCP/IP stack (smoltcp). Inbound TCP connection attempts to registered
//! addresses are intercepted and offered to the bound handler, which decides
//! whether to accept the connection (completing the handshake) or refuse it
//! (the client sees a reset).
//!
//! Opening and configuring the OS TUN interface, installing host routes, and
//! mapping logical services onto handlers are left to the embedding
//! application.

pub mod config;
pub mod error;
mod forward;
pub mod manager;
pub mod stack;
pub mod tun;

// Re-exports for convenience
pub use config::{random_ipv6_prefix, Config};
pub use error::{VnetError, VnetResult};
pub use manager::{Manager, TcpConnector, TcpHandler};
pub use stack::stream::VnetStream;
pub use stack::{ConnId, MTU};
pub use tun::{TunDevice, HEADER_RESERVE};
