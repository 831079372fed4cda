//! TCP connection setup and the receive task

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::timers::DIAL_TIMEOUT;
use super::Shared;
use crate::bgp::endec::{self, HEADER_LEN};
use crate::bgp::{Codec, Error, MalformedUpdate, Message, MessageType, Treatment};
use crate::config::Neighbor;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

/// Sending half of a session
pub(super) type Writer = FramedWrite<OwnedWriteHalf, Codec>;

/// Connect to `neighbor` from its configured local address
pub(super) async fn dial(neighbor: &Neighbor) -> io::Result<TcpStream> {
    let remote = SocketAddr::new(neighbor.neighbor_address, neighbor.transport.remote_port);
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = neighbor.transport.local_address {
        socket.bind(SocketAddr::new(local, 0))?;
    }
    tokio::time::timeout(DIAL_TIMEOUT, socket.connect(remote))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))?
}

/// Apply the socket options of `neighbor` to a new connection
pub(super) fn configure(stream: &TcpStream, neighbor: &Neighbor) {
    let addr = neighbor.neighbor_address;
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("{addr}: cannot set TCP_NODELAY: {e}");
    }
    let ttl = if neighbor.ttl_security.enabled {
        Some(255)
    } else if neighbor.ebgp_multihop.enabled {
        Some(u32::from(neighbor.ebgp_multihop.multihop_ttl))
    } else {
        None
    };
    if let Some(ttl) = ttl {
        if let Err(e) = stream.set_ttl(ttl) {
            log::warn!("{addr}: cannot set TTL to {ttl}: {e}");
        }
    }
}

/// What the receive task passes on
#[derive(Debug)]
pub(super) enum Inbound {
    Message(Message),
    /// An UPDATE whose errors allow the session to stay up
    Malformed(Box<MalformedUpdate>),
    /// A message that cannot be accepted; the session must be reset
    Invalid(Error),
    /// The connection broke or the peer closed it
    Closed(io::Error),
}

enum ReadError {
    Io(io::Error),
    Decode(Error),
}

/// Read one message: the fixed header first, then exactly the body
///
/// The decode context is taken once the header is in, so a body is always
/// parsed with what the session has agreed on by then.
async fn read_message(reader: &mut OwnedReadHalf, shared: &Shared) -> Result<Message, ReadError> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(ReadError::Io)?;
    let header = endec::decode_header(&header).map_err(ReadError::Decode)?;
    let mut body = vec![0u8; header.body_len()];
    reader.read_exact(&mut body).await.map_err(ReadError::Io)?;
    let ctx = shared
        .negotiated()
        .map(|negotiated| negotiated.decode_context())
        .unwrap_or_default();
    endec::decode_body(header.type_, Bytes::from(body), &ctx).map_err(ReadError::Decode)
}

/// Read messages until the connection ends or a message cannot be accepted
///
/// Lenient UPDATE error handling is applied here when the neighbor allows it.
/// After an OPEN, nothing more is read until the session has processed it:
/// a peer may pipeline its KEEPALIVE and first UPDATE right behind the OPEN,
/// and those can only be parsed with the negotiated options.
pub(super) async fn receive(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Inbound>,
    token: CancellationToken,
) {
    let addr = shared.neighbor_address;
    let mut negotiated = shared.negotiated.subscribe();
    loop {
        let result = tokio::select! {
            () = token.cancelled() => return,
            result = read_message(&mut reader, &shared) => result,
        };
        let is_open = matches!(result, Ok(Message::Open(_)));
        let inbound = match result {
            Ok(message) => {
                log::trace!("{addr}: received {message:?}");
                shared.counters.received.count(message.message_type());
                Inbound::Message(message)
            }
            Err(ReadError::Decode(Error::MalformedUpdate(malformed))) => {
                shared.counters.received.count(MessageType::Update);
                let lenient = shared
                    .config
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .error_handling
                    .treat_as_withdraw;
                if lenient && malformed.treatment() < Treatment::SessionReset {
                    log::warn!("{addr}: {malformed}");
                    shared.counters.received.discard();
                    Inbound::Malformed(malformed)
                } else {
                    Inbound::Invalid(Error::MalformedUpdate(malformed))
                }
            }
            Err(ReadError::Decode(e)) => Inbound::Invalid(e),
            Err(ReadError::Io(e)) => Inbound::Closed(e),
        };
        let last = matches!(inbound, Inbound::Invalid(_) | Inbound::Closed(_));
        if tx.send(inbound).await.is_err() || last {
            return;
        }
        if is_open {
            let processed = async { negotiated.wait_for(Option::is_some).await.is_ok() };
            tokio::select! {
                () = token.cancelled() => return,
                processed = processed => {
                    if !processed {
                        return;
                    }
                }
            }
        }
    }
}
