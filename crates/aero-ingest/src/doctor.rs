use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, SocketAddrV4};

use crate::config::{ConfigStore, NetworkConfig};

pub fn check_network(config: &ConfigStore) -> Result<NetworkConfig> {
    let net = NetworkConfig::from_store(config).context("network config")?;
    anyhow::ensure!(net.local_port != 0, "network/localPort must be nonzero for a fixed sender target");
    anyhow::ensure!(!net.local_address.is_multicast(), "network/localAddress must be a unicast address");
    Ok(net)
}

/// Binds (and immediately releases) the configured endpoint with the same
/// options the receiver uses.
pub fn check_bind(net: &NetworkConfig) -> Result<()> {
    let addr = SocketAddrV4::new(net.local_address, net.local_port);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("open UDP socket")?;
    socket.set_reuse_address(true).context("set SO_REUSEADDR")?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .with_context(|| format!("bind {}", addr))?;
    Ok(())
}
