//! VNet manager configuration.

use crate::error::{VnetError, VnetResult};
use crate::tun::TunDevice;
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::Ipv6Addr;
use std::sync::Arc;

/// Configuration for [`Manager`](crate::Manager).
///
/// The manager takes ownership of `tun` and closes it before
/// [`Manager::run`](crate::Manager::run) returns.
#[derive(Clone)]
pub struct Config {
    /// The OS TUN virtual network interface.
    pub tun: Arc<dyn TunDevice>,
    /// IPv6 ULA prefix used for all VNet addresses assigned in this instance.
    pub ipv6_prefix: Ipv6Addr,
}

impl Config {
    /// Validate the configuration.
    pub fn check(&self) -> VnetResult<()> {
        if self.ipv6_prefix.octets()[0] != 0xfd {
            return Err(VnetError::bad_parameter(
                "ipv6_prefix must be an IPv6 ULA address",
            ));
        }
        Ok(())
    }
}

/// Generate a Unique Local IPv6 Unicast Address used as the /64 prefix for
/// all v6 addresses in a VNet instance.
///
/// ```text
/// |   8 bits   |  40 bits   |  16 bits  |          64 bits           |
/// +------------+------------+-----------+----------------------------+
/// | ULA Prefix | Global ID  | Subnet ID |        Interface ID        |
/// +------------+------------+-----------+----------------------------+
/// ```
///
/// The ULA prefix is always `0xfd`, the Global ID is random per instance and
/// the Subnet ID is always zero. The random bytes span bytes 1-5 of the
/// address, so the effective entropy is 40 bits.
pub fn random_ipv6_prefix() -> VnetResult<Ipv6Addr> {
    let mut bytes = [0u8; 16];
    bytes[0] = 0xfd;
    OsRng
        .try_fill_bytes(&mut bytes[1..6])
        .map_err(|e| VnetError::stack_with_source("generating IPv6 prefix", e))?;
    Ok(Ipv6Addr::from(bytes))
}
