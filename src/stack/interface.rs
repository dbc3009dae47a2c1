use super::state::ip_address_from_std;
use crate::device::TunDevice;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpCidr};
use std::net::IpAddr;

/// Builds the virtual interface and the pooled TCP sockets the flow manager
/// hands out. UDP bypasses smoltcp entirely; datagrams are framed by hand.
pub(super) fn build_interface_and_sockets(
    mut device: TunDevice,
    ipv4_gateway: IpAddr,
    ipv6_gateway: Option<IpAddr>,
    tcp_socket_count: usize,
    tcp_buffer_size: usize,
) -> (TunDevice, Interface, SocketSet<'static>, Vec<SocketHandle>) {
    let mut config = IfaceConfig::new(HardwareAddress::Ip);
    config.random_seed = 0;
    let mut interface = Interface::new(config, &mut device, Instant::from_millis(0));
    // Terminate every routed destination, not just the interface address.
    interface.set_any_ip(true);
    interface.update_ip_addrs(|ip_addrs| {
        ip_addrs.clear();
        let _ = ip_addrs.push(IpCidr::new(ip_address_from_std(ipv4_gateway), 24));
        if let Some(ipv6) = ipv6_gateway {
            let _ = ip_addrs.push(IpCidr::new(ip_address_from_std(ipv6), 64));
        }
    });
    {
        let routes = interface.routes_mut();
        if let IpAddr::V4(gateway) = ipv4_gateway {
            routes
                .add_default_ipv4_route(smoltcp::wire::Ipv4Address::from_bytes(&gateway.octets()))
                .ok();
        }
        if let Some(IpAddr::V6(gateway)) = ipv6_gateway {
            routes
                .add_default_ipv6_route(smoltcp::wire::Ipv6Address::from_bytes(&gateway.octets()))
                .ok();
        }
    }

    let mut sockets = SocketSet::new(Vec::new());
    let mut tcp_pool = Vec::with_capacity(tcp_socket_count);
    for _ in 0..tcp_socket_count {
        let socket = TcpSocket::new(
            TcpSocketBuffer::new(vec![0; tcp_buffer_size]),
            TcpSocketBuffer::new(vec![0; tcp_buffer_size]),
        );
        let handle = sockets.add(socket);
        tcp_pool.push(handle);
    }

    (device, interface, sockets, tcp_pool)
}
