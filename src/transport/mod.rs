mod tcp;
mod udp;

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{Arc, Weak, atomic::AtomicU32},
    thread,
};

use anyhow::{Result, bail};
use codec::{
    Body, Envelope,
    types::{NodeId, NodeInfo},
};
use tokio::net::TcpListener;

use crate::hub::NetworkHub;

/// Frames that serialize larger than this leave through a short-lived
/// TCP connection instead of a datagram.
pub const TCP_THRESHOLD_SIZE: usize = 1300;

/// One datagram read.
const UDP_RECV_SIZE: usize = 1500;

/// Per-connection stream read buffer.
const TCP_RECV_SIZE: usize = 8192;

/// The dual-stack datagram/stream transport.
///
/// One UDP socket and one TCP listener per address family, all on the
/// same port; either family may be missing when its bind failed at
/// startup. Inbound traffic is decoded here and dispatched to the hub,
/// outbound traffic enters through [`Transport::send_to_peer`].
pub struct Transport {
    port: u16,
    udp4: Option<Arc<UdpSocket>>,
    udp6: Option<Arc<UdpSocket>>,
    self_ipv4: Option<Ipv4Addr>,
    self_ipv6: Option<Ipv6Addr>,
    max_connections: u32,
    connections: AtomicU32,
    runtime: tokio::runtime::Handle,
}

impl Transport {
    /// Bind the UDP socket pair. Bind failures are logged and tolerated
    /// here; [`Transport::start`] gives up only when the TCP side is
    /// fully dead too.
    pub fn new(port: u16, max_connections: u32) -> Result<Self> {
        let udp4 = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                log::error!("udp socket bind failed for IPv4: port={port}, err={e}");
                None
            }
        };

        let udp6 = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)) {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                log::error!("udp socket bind failed for IPv6: port={port}, err={e}");
                None
            }
        };

        let (self_ipv4, self_ipv6) = discover_addresses();
        Ok(Self {
            port,
            udp4,
            udp6,
            self_ipv4,
            self_ipv6,
            max_connections,
            connections: AtomicU32::new(0),
            runtime: tokio::runtime::Handle::current(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Addressing information other peers should use to reach this node.
    pub fn self_node_info(&self, node_id: NodeId) -> NodeInfo {
        NodeInfo::new(
            node_id,
            self.self_ipv4.or(Some(Ipv4Addr::LOCALHOST)),
            self.self_ipv6,
            self.port,
        )
    }

    /// Start the receive loops: one thread per UDP family, one accept
    /// task per TCP family.
    pub async fn start(self: &Arc<Self>, hub: Weak<NetworkHub>) -> Result<()> {
        for (socket, is_v4) in [(&self.udp4, true), (&self.udp6, false)] {
            if let Some(socket) = socket {
                let socket = socket.clone();
                let hub = hub.clone();
                thread::Builder::new()
                    .name(format!("udp{}-recv", if is_v4 { "4" } else { "6" }))
                    .spawn(move || udp::recv_loop(socket, is_v4, hub))?;
            }
        }

        let mut stream_bound = false;
        for addr in [
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, self.port)),
        ] {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    stream_bound = true;
                    tokio::spawn(tcp::accept_loop(self.clone(), listener, hub.clone()));
                }
                Err(e) => {
                    log::error!("tcp listener bind failed: addr={addr}, err={e}");
                }
            }
        }

        // Single-stack and even single-kind operation is degraded but
        // survivable; a node with no socket at all is not.
        if !stream_bound && self.udp4.is_none() && self.udp6.is_none() {
            bail!("failed to bind any socket on port {}", self.port);
        }

        Ok(())
    }

    /// Send one envelope towards a peer, choosing the framing mode from
    /// the serialized size.
    ///
    /// Oversize frames are written by a short-lived worker so the caller
    /// never blocks on connection setup; failures of either path are
    /// logged and reported as `false`, never raised.
    pub fn send_to_peer(&self, peer: &NodeInfo, envelope: &Envelope) -> bool {
        let bytes = envelope.to_bytes();
        if bytes.len() > TCP_THRESHOLD_SIZE {
            return self.send_stream(peer, bytes);
        }

        self.send_datagram(peer, &bytes)
    }

    /// Convenience wrapper building the MsgPack envelope first.
    pub fn send_body(&self, peer: &NodeInfo, body: &Body) -> bool {
        match Envelope::msgpack(body) {
            Ok(envelope) => self.send_to_peer(peer, &envelope),
            Err(e) => {
                log::error!("message body encode failed: err={e}");
                false
            }
        }
    }

    fn send_datagram(&self, peer: &NodeInfo, bytes: &[u8]) -> bool {
        let v4_route = self.udp4.as_ref().zip(peer.ipv4);
        let v6_route = self.udp6.as_ref().zip(peer.ipv6);
        let (socket, addr): (_, SocketAddr) = if let Some((socket, ipv4)) = v4_route {
            (socket, (ipv4, peer.port).into())
        } else if let Some((socket, ipv6)) = v6_route {
            (socket, (ipv6, peer.port).into())
        } else {
            log::warn!("no usable address family for peer: node={}", peer.node_id);
            return false;
        };

        match socket.send_to(bytes, addr) {
            Ok(_) => {
                log::trace!("udp socket send: size={}, addr={addr}", bytes.len());
                true
            }
            Err(e) => {
                log::warn!("udp socket send failed: addr={addr}, err={e}");
                false
            }
        }
    }

    fn send_stream(&self, peer: &NodeInfo, bytes: bytes::Bytes) -> bool {
        let Some(addr) = peer.socket_addr() else {
            log::warn!("no usable address family for peer: node={}", peer.node_id);
            return false;
        };

        self.runtime.spawn(tcp::send_once(addr, bytes));
        true
    }
}

/// Learn the addresses this host would use to reach the outside, by
/// dialing a well-known anchor per family. No packet is actually sent.
fn discover_addresses() -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let ipv4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect(("8.8.8.8", 80))?;
            socket.local_addr()
        })
        .ok()
        .and_then(|addr| match addr {
            SocketAddr::V4(addr) => Some(*addr.ip()),
            SocketAddr::V6(_) => None,
        })
        .or(Some(Ipv4Addr::LOCALHOST));

    let ipv6 = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect(("2001:4860:4860::8888", 80))?;
            socket.local_addr()
        })
        .ok()
        .and_then(|addr| match addr {
            SocketAddr::V6(addr) => Some(*addr.ip()),
            SocketAddr::V4(_) => None,
        });

    (ipv4, ipv6)
}
