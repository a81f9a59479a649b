use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::protocol::MAX_PACKET_SIZE;

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Datagram-level UDP wrapper. Packet encoding, scrambling and dispatch
/// live above this; the endpoint only moves bounded byte buffers.
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: [u8; MAX_PACKET_SIZE],
    stats: NetworkStats,
    running: Arc<AtomicBool>,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: [0u8; MAX_PACKET_SIZE],
            stats: NetworkStats::default(),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Second handle onto the same socket, for a dedicated receive thread.
    pub fn clone_socket(&self) -> io::Result<UdpSocket> {
        self.socket.try_clone()
    }

    pub fn send_to(&mut self, payload: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if payload.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "packet exceeds MTU",
            ));
        }

        let bytes = self.socket.send_to(payload, addr)?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        Ok(bytes)
    }

    /// Drains every pending datagram. Returns an empty vec when nothing is
    /// queued.
    pub fn receive(&mut self) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
        let mut datagrams = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += size as u64;
                    datagrams.push((self.recv_buffer[..size].to_vec(), addr));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(datagrams)
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Best-effort: a receive already in flight may still complete once
    /// after this; callers treat that late delivery as a no-op.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
