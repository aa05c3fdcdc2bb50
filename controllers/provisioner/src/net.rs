//! Advertise address selection.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::{debug, warn};

/// Well-known public address used only to pick the default-route interface
const ROUTE_PROBE: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 53);

/// Address of the interface that carries the default route.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel for the
/// route. Loopback and unspecified results are rejected.
pub fn host_interface_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(ROUTE_PROBE).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    usable(ip).then_some(ip)
}

fn usable(ip: IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

/// Pick the address advertised in the join command.
///
/// An explicit bind address wins unless it is empty, unparsable or
/// unspecified (`0.0.0.0`, `::`). Otherwise the host interface from `choose`
/// is used, and loopback as a last resort.
pub fn advertise_ip<F>(bind_address: &str, choose: F) -> IpAddr
where
    F: FnOnce() -> Option<IpAddr>,
{
    if !bind_address.is_empty() {
        match bind_address.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => return ip,
            Ok(_) => debug!(bind_address, "Unspecified bind address, choosing host interface"),
            Err(_) => warn!(bind_address, "Bind address is not an IP, choosing host interface"),
        }
    }

    match choose().filter(|ip| usable(*ip)) {
        Some(ip) => ip,
        None => {
            warn!("No usable host interface, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
