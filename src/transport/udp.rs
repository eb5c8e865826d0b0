use std::{
    io::ErrorKind::ConnectionReset,
    net::UdpSocket,
    sync::{Arc, Weak},
};

use codec::Decoder;

use crate::hub::NetworkHub;

/// Datagram receive loop, one per bound address family.
///
/// Each datagram carries whole frames; whatever partial frame is left
/// after draining is discarded, since the next datagram can never
/// complete it.
pub fn recv_loop(socket: Arc<UdpSocket>, is_v4: bool, hub: Weak<NetworkHub>) {
    let local_addr = socket.local_addr().ok();
    let mut buffer = [0u8; super::UDP_RECV_SIZE];
    let mut decoder = Decoder::default();

    loop {
        // Note: a send to a vanished host can surface here as a
        // connection reset; that is the peer's problem, not ours.
        let (size, addr) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) if e.kind() == ConnectionReset => continue,
            Err(e) => {
                log::error!("udp socket receive failed: interface={local_addr:?}, err={e}");
                break;
            }
        };

        let Some(hub) = hub.upgrade() else {
            break;
        };

        log::trace!("udp socket receive: size={size}, addr={addr}, interface={local_addr:?}");

        decoder.feed(&buffer[..size]);
        loop {
            match decoder.next() {
                Ok(Some(envelope)) => hub.dispatch_datagram(is_v4, addr, envelope),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("udp frame decode failed: addr={addr}, err={e}");
                    break;
                }
            }
        }

        decoder.reset();
    }
}
