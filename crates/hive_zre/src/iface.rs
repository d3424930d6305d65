//! Local interface lookup and mailbox port scanning.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use if_addrs::{IfAddr, get_if_addrs};
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::NetworkError;

/// An IPv4 interface usable for ZRE traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

impl InterfaceInfo {
    /// Build from an address and netmask, deriving the broadcast address
    /// when none was reported.
    pub fn new(
        name: impl Into<String>,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        broadcast: Option<Ipv4Addr>,
    ) -> Self {
        let broadcast = broadcast.unwrap_or_else(|| broadcast_for(address, netmask));
        Self {
            name: name.into(),
            address,
            netmask,
            broadcast,
        }
    }
}

/// `address | !netmask`.
pub fn broadcast_for(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address) | !u32::from(netmask))
}

/// Find the IPv4 interface named `name`, or the first non-loopback IPv4
/// interface when no name is given.
pub fn local_ipv4_interface(name: Option<&str>) -> Result<InterfaceInfo, NetworkError> {
    let interfaces = get_if_addrs()?;
    interfaces
        .into_iter()
        .filter(|iface| match name {
            Some(wanted) => iface.name == wanted,
            None => !iface.is_loopback(),
        })
        .find_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some(InterfaceInfo::new(
                iface.name,
                v4.ip,
                v4.netmask,
                v4.broadcast,
            )),
            IfAddr::V6(_) => None,
        })
        .ok_or_else(|| NetworkError::NoInterface(name.map(str::to_string)))
}

/// Bind a TCP listener on `address`, trying `start_port` and each port above
/// it until one is free. Port 0 asks the OS for any free port.
pub async fn bind_free_port(address: IpAddr, start_port: u16) -> Result<TcpListener, NetworkError> {
    if start_port == 0 {
        let addr = SocketAddr::new(address, 0);
        return TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source });
    }

    let mut last_err = None;
    for port in start_port..=u16::MAX {
        let addr = SocketAddr::new(address, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                debug!("mailbox bound on {addr}");
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                last_err = Some((addr, e));
            }
            Err(source) => return Err(NetworkError::Bind { addr, source }),
        }
    }

    let (addr, source) = last_err.unwrap_or_else(|| {
        (
            SocketAddr::new(address, start_port),
            io::Error::from(io::ErrorKind::AddrInUse),
        )
    });
    Err(NetworkError::Bind { addr, source })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_derivation() {
        let info = InterfaceInfo::new(
            "eth0",
            Ipv4Addr::new(192, 168, 1, 42),
            Ipv4Addr::new(255, 255, 255, 0),
            None,
        );
        assert_eq!(info.broadcast, Ipv4Addr::new(192, 168, 1, 255));

        assert_eq!(
            broadcast_for(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 0, 0, 0)),
            Ipv4Addr::new(10, 255, 255, 255)
        );

        // A reported broadcast address wins.
        let info = InterfaceInfo::new(
            "eth0",
            Ipv4Addr::new(192, 168, 1, 42),
            Ipv4Addr::new(255, 255, 255, 0),
            Some(Ipv4Addr::new(192, 168, 1, 254)),
        );
        assert_eq!(info.broadcast, Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_unknown_interface_name() {
        let err = local_ipv4_interface(Some("definitely-not-an-interface0")).unwrap_err();
        assert!(matches!(err, NetworkError::NoInterface(Some(_))));
    }

    #[tokio::test]
    async fn test_bind_free_port_skips_taken() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let first = bind_free_port(localhost, 0).await.unwrap();
        let taken = first.local_addr().unwrap().port();
        if taken == u16::MAX {
            return;
        }

        let next = bind_free_port(localhost, taken).await.unwrap();
        assert!(next.local_addr().unwrap().port() > taken);
    }
}
