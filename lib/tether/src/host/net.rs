//! Socket stack. Sockets are named on the wire by small 1-based IDs from a
//! bounded table, never by host descriptors.

use crate::host::{HostError, HostResult};
use crate::logging;
use crate::table::{SlotTable, SOCKET_LIMIT};
use socket2::{Domain, Protocol, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Layout of the 16-bit socket setup word. The values mirror the constants
/// compiled into the target and must change in lockstep with it.
pub const SOCKET_PROTOCOL_MASK: u16 = 0x000f;
pub const SOCKET_PROTOCOL_TCP: u16 = 0x0000;
pub const SOCKET_PROTOCOL_UDP: u16 = 0x0001;
/// Set for bind/listen, clear for connect.
pub const SOCKET_DIRECTION_MASK: u16 = 0x0010;

pub const MODE_BLOCKING: u16 = 0;
pub const MODE_NONBLOCKING: u16 = 1;

/// Receive timeout selecting the blocking variant.
pub const TIMEOUT_INFINITE: u32 = 0xffff_ffff;

enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
}

pub struct NetStack {
    table: SlotTable<Socket>,
    log: logging::Logger,
}

impl NetStack {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> NetStack {
        NetStack {
            table: SlotTable::new(SOCKET_LIMIT),
            log: logging::child_or_discard(log.into()),
        }
    }

    /// Creates a socket per the setup word: TCP or UDP, bound or connected
    /// to `host:port`. Returns the socket ID the target uses from then on.
    pub fn open(&mut self, host: &str, port: u16, setup: u16) -> HostResult<u16> {
        let bind = setup & SOCKET_DIRECTION_MASK != 0;

        let socket = match setup & SOCKET_PROTOCOL_MASK {
            SOCKET_PROTOCOL_TCP if bind => Socket::Listener(TcpListener::bind((host, port))?),
            SOCKET_PROTOCOL_TCP => Socket::Stream(TcpStream::connect((host, port))?),
            SOCKET_PROTOCOL_UDP if bind => {
                Socket::Datagram(Self::bind_udp_reuse(Self::resolve(host, port)?)?)
            }
            SOCKET_PROTOCOL_UDP => {
                let socket = UdpSocket::bind(("0.0.0.0", 0))?;
                socket.connect((host, port))?;
                Socket::Datagram(socket)
            }
            _ => return Err(HostError::Unsupported),
        };

        let id = self.table.insert(socket).ok_or(HostError::Exhausted)? as u16;

        logging::debug!(self.log, "socket opened";
                        "context" => "open",
                        "socket" => id,
                        "setup" => setup,
                        "bind" => bind);

        Ok(id)
    }

    /// Waits for a peer on a bound socket. Returns the bind socket to keep
    /// listening on, the connected client socket, and the peer address in
    /// dotted text form truncated to `ip_capacity` bytes.
    ///
    /// For TCP the bind socket is returned unchanged. For UDP the bound
    /// socket is connected to the first peer that sends a datagram and
    /// handed back as the client, while a fresh socket bound to the same
    /// local address replaces it as the bind socket.
    pub fn accept(&mut self, id: u16, ip_capacity: usize) -> HostResult<(u16, u16, Vec<u8>)> {
        match self.table.get(u32::from(id)) {
            Some(Socket::Listener(_)) => self.accept_stream(id, ip_capacity),
            Some(Socket::Datagram(_)) => self.accept_datagram(id, ip_capacity),
            Some(Socket::Stream(_)) => Err(HostError::Unsupported),
            None => Err(HostError::StaleHandle),
        }
    }

    fn accept_stream(&mut self, id: u16, ip_capacity: usize) -> HostResult<(u16, u16, Vec<u8>)> {
        let (stream, peer) = match self.table.get(u32::from(id)) {
            Some(Socket::Listener(listener)) => listener.accept()?,
            _ => return Err(HostError::StaleHandle),
        };

        let client = self
            .table
            .insert(Socket::Stream(stream))
            .ok_or(HostError::Exhausted)? as u16;

        logging::debug!(self.log, "stream accepted";
                        "context" => "accept",
                        "bind_socket" => id,
                        "client_socket" => client,
                        "peer" => %peer);

        Ok((id, client, Self::peer_text(peer, ip_capacity)))
    }

    fn accept_datagram(&mut self, id: u16, ip_capacity: usize) -> HostResult<(u16, u16, Vec<u8>)> {
        let (peer, local) = match self.table.get(u32::from(id)) {
            Some(Socket::Datagram(socket)) => {
                let mut probe = [0u8; 1];
                let (_, peer) = socket.peek_from(&mut probe)?;
                socket.connect(peer)?;
                (peer, socket.local_addr()?)
            }
            _ => return Err(HostError::StaleHandle),
        };

        let fresh = Self::bind_udp_reuse(local)?;
        let replacement = self
            .table
            .insert(Socket::Datagram(fresh))
            .ok_or(HostError::Exhausted)? as u16;

        logging::debug!(self.log, "datagram peer adopted";
                        "context" => "accept",
                        "client_socket" => id,
                        "bind_socket" => replacement,
                        "peer" => %peer);

        // The formerly-bound socket is now the connected client; the fresh
        // one takes over listening duty.
        Ok((replacement, id, Self::peer_text(peer, ip_capacity)))
    }

    pub fn set_blocking(&mut self, id: u16, blocking: bool) -> HostResult<()> {
        match self.table.get(u32::from(id)) {
            Some(Socket::Listener(listener)) => listener.set_nonblocking(!blocking)?,
            Some(Socket::Stream(stream)) => stream.set_nonblocking(!blocking)?,
            Some(Socket::Datagram(socket)) => socket.set_nonblocking(!blocking)?,
            None => return Err(HostError::StaleHandle),
        }

        Ok(())
    }

    /// Receives up to `size` bytes. `TIMEOUT_INFINITE` blocks until data
    /// arrives; any other value bounds the wait in milliseconds. A timed
    /// out or would-block receive yields an empty buffer.
    pub fn recv(&mut self, id: u16, size: usize, timeout_ms: u32) -> HostResult<Vec<u8>> {
        let timeout = match timeout_ms {
            TIMEOUT_INFINITE => None,
            // A zero timeout would disable the deadline entirely.
            0 => Some(Duration::from_millis(1)),
            ms => Some(Duration::from_millis(u64::from(ms))),
        };

        let mut data = vec![0u8; size];

        let received = match self.table.get_mut(u32::from(id)) {
            Some(Socket::Stream(stream)) => {
                stream.set_read_timeout(timeout)?;
                stream.read(&mut data)
            }
            Some(Socket::Datagram(socket)) => {
                socket.set_read_timeout(timeout)?;
                socket.recv(&mut data)
            }
            _ => return Err(HostError::StaleHandle),
        };

        match received {
            Ok(count) => data.truncate(count),
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => data.truncate(0),
                _ => return Err(err.into()),
            },
        }

        Ok(data)
    }

    pub fn send(&mut self, id: u16, data: &[u8]) -> HostResult<u32> {
        let sent = match self.table.get_mut(u32::from(id)) {
            Some(Socket::Stream(stream)) => stream.write(data)?,
            Some(Socket::Datagram(socket)) => socket.send(data)?,
            _ => return Err(HostError::StaleHandle),
        };

        Ok(sent as u32)
    }

    /// Releases the socket. Streams are shut down in both directions first.
    pub fn shutdown(&mut self, id: u16) -> HostResult<()> {
        let socket = self
            .table
            .remove(u32::from(id))
            .ok_or(HostError::StaleHandle)?;

        if let Socket::Stream(stream) = &socket {
            let _ = stream.shutdown(Shutdown::Both);
        }

        logging::debug!(self.log, "socket released"; "context" => "shutdown", "socket" => id);

        Ok(())
    }

    fn resolve(host: &str, port: u16) -> HostResult<SocketAddr> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(HostError::Unsupported)
    }

    /// UDP bind with SO_REUSEADDR, so the accept swap can stand up a second
    /// socket on the address the connected one still occupies.
    fn bind_udp_reuse(addr: SocketAddr) -> HostResult<UdpSocket> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = socket2::Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        Ok(socket.into())
    }

    fn peer_text(peer: SocketAddr, capacity: usize) -> Vec<u8> {
        let mut text = peer.ip().to_string().into_bytes();
        text.push(0);
        text.truncate(capacity);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net;
    use std::thread;

    fn local_port(stack: &NetStack, id: u16) -> u16 {
        match stack.table.get(u32::from(id)) {
            Some(Socket::Listener(listener)) => listener.local_addr().unwrap().port(),
            Some(Socket::Datagram(socket)) => socket.local_addr().unwrap().port(),
            Some(Socket::Stream(stream)) => stream.local_addr().unwrap().port(),
            None => panic!("no such socket"),
        }
    }

    #[test]
    fn test_tcp_session() {
        let mut stack = NetStack::new(None);

        let bind = stack
            .open("127.0.0.1", 0, SOCKET_PROTOCOL_TCP | SOCKET_DIRECTION_MASK)
            .unwrap();
        let port = local_port(&stack, bind);

        let peer = thread::spawn(move || {
            let mut stream = net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"ping").unwrap();

            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).unwrap();
            reply
        });

        let (still_bound, client, ip) = stack.accept(bind, 64).unwrap();

        assert_eq!(still_bound, bind);
        assert_eq!(ip, b"127.0.0.1\0");

        assert_eq!(stack.recv(client, 16, TIMEOUT_INFINITE).unwrap(), b"ping");
        assert_eq!(stack.send(client, b"pong").unwrap(), 4);

        assert_eq!(&peer.join().unwrap(), b"pong");

        stack.shutdown(client).unwrap();
        stack.shutdown(bind).unwrap();
        assert_eq!(stack.shutdown(bind).unwrap_err(), HostError::StaleHandle);
    }

    #[test]
    fn test_udp_accept_swaps_sockets() {
        let mut stack = NetStack::new(None);

        let bind = stack
            .open("127.0.0.1", 0, SOCKET_PROTOCOL_UDP | SOCKET_DIRECTION_MASK)
            .unwrap();
        let port = local_port(&stack, bind);

        let sender = net::UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        sender.send_to(b"hello", ("127.0.0.1", port)).unwrap();

        let (new_bind, client, ip) = stack.accept(bind, 64).unwrap();

        // The old socket became the client and a fresh one took its place.
        assert_eq!(client, bind);
        assert_ne!(new_bind, bind);
        assert_eq!(ip, b"127.0.0.1\0");
        assert_eq!(local_port(&stack, new_bind), port);

        assert_eq!(stack.recv(client, 16, TIMEOUT_INFINITE).unwrap(), b"hello");

        stack.shutdown(client).unwrap();
        stack.shutdown(new_bind).unwrap();
    }

    #[test]
    fn test_recv_timeout_yields_empty() {
        let mut stack = NetStack::new(None);

        let bind = stack
            .open("127.0.0.1", 0, SOCKET_PROTOCOL_UDP | SOCKET_DIRECTION_MASK)
            .unwrap();

        assert_eq!(stack.recv(bind, 16, 20).unwrap(), b"");

        stack.shutdown(bind).unwrap();
    }

    #[test]
    fn test_accept_ip_truncation() {
        assert_eq!(NetStack::peer_text("127.0.0.1:9".parse().unwrap(), 4), b"127.".to_vec());
        assert_eq!(NetStack::peer_text("127.0.0.1:9".parse().unwrap(), 0), Vec::<u8>::new());
    }

    #[test]
    fn test_open_rejects_unknown_protocol() {
        let mut stack = NetStack::new(None);

        assert_eq!(
            stack.open("127.0.0.1", 0, 0x0002).unwrap_err(),
            HostError::Unsupported
        );
    }

    #[test]
    fn test_stale_socket_operations() {
        let mut stack = NetStack::new(None);

        assert_eq!(stack.send(7, b"x").unwrap_err(), HostError::StaleHandle);
        assert_eq!(
            stack.recv(7, 4, TIMEOUT_INFINITE).unwrap_err(),
            HostError::StaleHandle
        );
        assert_eq!(
            stack.set_blocking(7, true).unwrap_err(),
            HostError::StaleHandle
        );
    }
}
