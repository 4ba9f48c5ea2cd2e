//! DNS wire listeners.
//!
//! Deliberately thin: decode a message, hand it to the engine, encode the
//! reply. UDP answers each datagram in its own task; TCP frames messages
//! with the standard 2-byte length prefix and handles each connection in
//! its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::Result;
use crate::resolver::Protocol;

/// Maximum size of a DNS datagram we accept, with headroom for EDNS.
const MAX_PACKET_SIZE: usize = 4096;

/// Bind every configured interface and spawn its listener tasks. With no
/// interfaces configured, listen on all addresses at the standard port.
pub async fn spawn_listeners(
    engine: Arc<Engine>,
    config: &Config,
) -> Result<Vec<JoinHandle<()>>> {
    let network = &config.network;
    let mut handles = Vec::new();

    let interfaces: Vec<(SocketAddr, bool, bool)> = if network.interfaces.is_empty() {
        vec![(SocketAddr::from(([0, 0, 0, 0], 53)), true, true)]
    } else {
        network
            .interfaces
            .iter()
            .map(|interface| {
                (
                    SocketAddr::new(interface.ip, interface.port()),
                    interface.udp(network),
                    interface.tcp(network),
                )
            })
            .collect()
    };

    for (address, udp, tcp) in interfaces {
        if udp {
            let socket = UdpSocket::bind(address).await?;
            info!("listening on udp://{address}");
            handles.push(tokio::spawn(run_udp(Arc::clone(&engine), socket)));
        }
        if tcp {
            let listener = TcpListener::bind(address).await?;
            info!("listening on tcp://{address}");
            handles.push(tokio::spawn(run_tcp(Arc::clone(&engine), listener)));
        }
    }

    Ok(handles)
}

async fn run_udp(engine: Arc<Engine>, socket: UdpSocket) {
    let socket = Arc::new(socket);
    let mut buffer = [0u8; MAX_PACKET_SIZE];

    loop {
        let (length, peer) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(err) => {
                warn!("udp receive failed: {err}");
                continue;
            }
        };

        let request = match Message::from_bytes(&buffer[..length]) {
            Ok(request) => request,
            Err(err) => {
                debug!("dropping undecodable datagram from {peer}: {err}");
                continue;
            }
        };

        let engine = Arc::clone(&engine);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let (response, _, _) = engine.handle(peer.ip(), Protocol::Udp, &request).await;
            match response.to_bytes() {
                Ok(bytes) => {
                    if let Err(err) = socket.send_to(&bytes, peer).await {
                        warn!("udp send to {peer} failed: {err}");
                    }
                }
                Err(err) => warn!("could not encode response for {peer}: {err}"),
            }
        });
    }
}

async fn run_tcp(engine: Arc<Engine>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_tcp_client(Arc::clone(&engine), stream, peer));
            }
            Err(err) => warn!("tcp accept failed: {err}"),
        }
    }
}

/// Serve one client connection: length-prefixed messages until EOF.
async fn handle_tcp_client(engine: Arc<Engine>, mut stream: TcpStream, peer: SocketAddr) {
    loop {
        let mut length_buffer = [0u8; 2];
        if stream.read_exact(&mut length_buffer).await.is_err() {
            return;
        }
        let length = usize::from(u16::from_be_bytes(length_buffer));
        if length == 0 || length > MAX_PACKET_SIZE {
            return;
        }

        let mut buffer = vec![0u8; length];
        if stream.read_exact(&mut buffer).await.is_err() {
            return;
        }

        let request = match Message::from_bytes(&buffer) {
            Ok(request) => request,
            Err(err) => {
                debug!("dropping undecodable message from {peer}: {err}");
                return;
            }
        };

        let (response, _, _) = engine.handle(peer.ip(), Protocol::Tcp, &request).await;
        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("could not encode response for {peer}: {err}");
                return;
            }
        };
        let Ok(frame_length) = u16::try_from(bytes.len()) else {
            return;
        };

        if stream.write_all(&frame_length.to_be_bytes()).await.is_err()
            || stream.write_all(&bytes).await.is_err()
        {
            return;
        }
    }
}
