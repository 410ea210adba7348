//! Non-blocking UDP transport
//!
//! Receiving never blocks: an empty socket is reported as
//! [`Received::WouldBlock`], which is the normal "nothing more this tick"
//! signal. Sending is fire-and-forget.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use bytes::Bytes;
use log::debug;

use crate::error::TransportError;
use crate::protocol::MAX_PACKET_SIZE;

/// Outcome of a single non-blocking receive.
#[derive(Debug)]
pub enum Received {
    Data(Bytes, SocketAddr),
    WouldBlock,
    Error(io::Error),
}

/// Anything that can fire a datagram at a peer.
pub trait DatagramSink {
    /// Send one datagram. `Ok(false)` means the socket would have blocked and
    /// the datagram was dropped.
    fn send_datagram(&self, payload: &[u8], addr: SocketAddr) -> io::Result<bool>;
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&self, payload: &[u8], addr: SocketAddr) -> io::Result<bool> {
        match self.send_to(payload, addr) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A bound, non-blocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    buf: Box<[u8]>,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            socket,
            // One spare byte so an oversized datagram shows up as such
            // instead of being silently cut to size.
            buf: vec![0u8; MAX_PACKET_SIZE + 1].into_boxed_slice(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one datagram. Datagrams larger than `MAX_PACKET_SIZE` are
    /// discarded, since their tail would be lost.
    pub fn recv(&mut self) -> Received {
        loop {
            if let Some(received) = self.recv_one() {
                return received;
            }
        }
    }

    fn recv_one(&mut self) -> Option<Received> {
        let received = match self.socket.recv_from(&mut self.buf) {
            Ok((len, addr)) if len > MAX_PACKET_SIZE => {
                debug!("dropping oversized datagram from {}", addr);
                return None;
            }
            Ok((len, addr)) => Received::Data(Bytes::copy_from_slice(&self.buf[..len]), addr),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Received::WouldBlock,
            // ICMP port-unreachable from a peer that went away surfaces here on
            // some platforms; the liveness timeout handles that peer.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!("ignoring connection reset on UDP socket");
                Received::WouldBlock
            }
            Err(e) => Received::Error(e),
        };
        Some(received)
    }

    /// Drain everything currently queued on the socket.
    pub fn recv_batch(&mut self) -> Result<Vec<(Bytes, SocketAddr)>, TransportError> {
        let mut batch = Vec::new();
        loop {
            match self.recv() {
                Received::Data(bytes, addr) => batch.push((bytes, addr)),
                Received::WouldBlock => return Ok(batch),
                Received::Error(e) => return Err(TransportError::Receive(e)),
            }
        }
    }
}

impl DatagramSink for UdpTransport {
    fn send_datagram(&self, payload: &[u8], addr: SocketAddr) -> io::Result<bool> {
        self.socket.send_datagram(payload, addr)
    }
}
