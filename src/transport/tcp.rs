use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    sync::atomic::Ordering,
};

use bytes::Bytes;
use codec::Decoder;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use super::Transport;
use crate::hub::NetworkHub;

/// Stream accept loop, one per bound address family.
///
/// Every connection gets its own task and decoder; frames arriving on
/// one connection are dispatched in arrival order. The remote address is
/// deliberately not forwarded to the domains: stream senders are
/// identified by the node ids inside their messages.
pub async fn accept_loop(transport: Arc<Transport>, listener: TcpListener, hub: Weak<NetworkHub>) {
    let local_addr = listener.local_addr().ok();

    while let Ok((socket, addr)) = listener.accept().await {
        if transport.connections.load(Ordering::Relaxed) >= transport.max_connections {
            log::warn!("tcp connection limit reached, dropping: addr={addr}");
            continue;
        }

        let Some(hub) = hub.upgrade() else {
            break;
        };

        transport.connections.fetch_add(1, Ordering::Relaxed);
        log::info!("tcp socket accept: addr={addr}, interface={local_addr:?}");

        let transport = transport.clone();
        tokio::spawn(async move {
            read_connection(socket, addr, &hub).await;
            transport.connections.fetch_sub(1, Ordering::Relaxed);
            log::info!("tcp socket disconnect: addr={addr}, interface={local_addr:?}");
        });
    }

    log::error!("tcp server close: interface={local_addr:?}");
}

async fn read_connection(mut socket: TcpStream, addr: SocketAddr, hub: &Arc<NetworkHub>) {
    let mut buffer = [0u8; super::TCP_RECV_SIZE];
    let mut decoder = Decoder::default();

    loop {
        let size = match socket.read(&mut buffer).await {
            // A zero read means the peer closed the connection.
            Ok(0) | Err(_) => break,
            Ok(size) => size,
        };

        log::trace!("tcp socket receive: size={size}, addr={addr}");

        decoder.feed(&buffer[..size]);
        loop {
            match decoder.next() {
                Ok(Some(envelope)) => hub.dispatch_stream(envelope),
                Ok(None) => break,
                Err(e) => {
                    // The offending frame is dropped, the connection
                    // stays up.
                    log::warn!("tcp frame decode failed: addr={addr}, err={e}");
                    break;
                }
            }
        }
    }
}

/// Write one oversize frame over a fresh connection and close it.
pub async fn send_once(addr: SocketAddr, bytes: Bytes) {
    match TcpStream::connect(addr).await {
        Ok(mut socket) => {
            if let Err(e) = socket.write_all(&bytes).await {
                log::warn!("tcp socket send failed: addr={addr}, err={e}");
            } else {
                log::trace!("tcp socket send: size={}, addr={addr}", bytes.len());
            }

            let _ = socket.shutdown().await;
        }
        Err(e) => {
            log::warn!("tcp connect failed: addr={addr}, err={e}");
        }
    }
}
