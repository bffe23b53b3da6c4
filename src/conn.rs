//! Packet decoding and the connection tuple
//!
//! Every queued packet is reduced to a `Connection`: addresses as strings (so
//! they can later be swapped for hostnames), ports for TCP/UDP and the IP
//! protocol. The transport payload rides along for DNS observation.

use std::fmt;
use std::net::IpAddr;

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};

use crate::error::PacketError;

pub const DNS_PORT: u16 = 53;

/// IP protocol of a connection. Only TCP and UDP are subject to rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
    Other(u8),
}

impl Proto {
    pub fn from_ip_number(number: u8) -> Self {
        match number {
            6 => Proto::Tcp,
            17 => Proto::Udp,
            n => Proto::Other(n),
        }
    }

    pub fn is_tracked(self) -> bool {
        matches!(self, Proto::Tcp | Proto::Udp)
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => f.write_str("tcp"),
            Proto::Udp => f.write_str("udp"),
            Proto::Other(1) => f.write_str("icmp"),
            Proto::Other(2) => f.write_str("igmp"),
            Proto::Other(47) => f.write_str("gre"),
            Proto::Other(50) => f.write_str("esp"),
            Proto::Other(51) => f.write_str("ah"),
            Proto::Other(58) => f.write_str("ipv6-icmp"),
            Proto::Other(132) => f.write_str("sctp"),
            Proto::Other(n) => write!(f, "ip-{}", n),
        }
    }
}

/// A connection as seen in one packet.
///
/// `src`/`dst` start out as raw addresses; `with_hosts` produces the resolved
/// variant used for rule matching and logging. Ports are `None` for
/// protocols without ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connection {
    pub src: String,
    pub dst: String,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub proto: Proto,
}

impl Connection {
    pub fn new(
        src: impl Into<String>,
        src_port: Option<u16>,
        dst: impl Into<String>,
        dst_port: Option<u16>,
        proto: Proto,
    ) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            src_port,
            dst_port,
            proto,
        }
    }

    /// The same connection seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst.clone(),
            dst: self.src.clone(),
            src_port: self.dst_port,
            dst_port: self.src_port,
            proto: self.proto,
        }
    }

    pub fn with_hosts(&self, src: String, dst: String) -> Self {
        Self {
            src,
            dst,
            src_port: self.src_port,
            dst_port: self.dst_port,
            proto: self.proto,
        }
    }
}

struct PortDisplay(Option<u16>);

impl fmt::Display for PortDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(port) => write!(f, "{}", port),
            None => f.write_str("-"),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {}:{} -> {}:{}",
            self.proto,
            self.src,
            PortDisplay(self.src_port),
            self.dst,
            PortDisplay(self.dst_port)
        )
    }
}

/// A decoded packet: its connection plus the transport payload.
#[derive(Debug)]
pub struct Packet<'a> {
    pub conn: Connection,
    pub payload: &'a [u8],
}

fn malformed<E: fmt::Debug>(layer: &'static str) -> impl FnOnce(E) -> PacketError {
    move |e| PacketError::Malformed {
        layer,
        reason: format!("{:?}", e),
    }
}

/// Decode a raw IP packet as handed over by the kernel queue.
pub fn parse(data: &[u8]) -> Result<Packet<'_>, PacketError> {
    let version = data.first().ok_or(PacketError::Empty)? >> 4;

    // Parse IP header, bounding the transport slice by the declared length
    let (src, dst, number, transport) = match version {
        4 => {
            let ip = Ipv4HeaderSlice::from_slice(data).map_err(malformed("ipv4"))?;
            let header_len = ip.slice().len();
            let end = (ip.total_len() as usize).clamp(header_len, data.len());
            (
                IpAddr::V4(ip.source_addr()),
                IpAddr::V4(ip.destination_addr()),
                ip.protocol(),
                &data[header_len..end],
            )
        }
        6 => {
            let ip = Ipv6HeaderSlice::from_slice(data).map_err(malformed("ipv6"))?;
            let header_len = ip.slice().len();
            let end = (header_len + ip.payload_length() as usize).min(data.len());
            (
                IpAddr::V6(ip.source_addr()),
                IpAddr::V6(ip.destination_addr()),
                ip.next_header(),
                &data[header_len..end],
            )
        }
        v => return Err(PacketError::Version(v)),
    };

    // Parse transport layer
    let proto = Proto::from_ip_number(number);
    let (src_port, dst_port, payload) = match proto {
        Proto::Tcp => {
            let tcp = TcpHeaderSlice::from_slice(transport).map_err(malformed("tcp"))?;
            let header_len = tcp.slice().len();
            (
                Some(tcp.source_port()),
                Some(tcp.destination_port()),
                &transport[header_len..],
            )
        }
        Proto::Udp => {
            let udp = UdpHeaderSlice::from_slice(transport).map_err(malformed("udp"))?;
            let header_len = udp.slice().len();
            (
                Some(udp.source_port()),
                Some(udp.destination_port()),
                &transport[header_len..],
            )
        }
        Proto::Other(_) => (None, None, transport),
    };

    Ok(Packet {
        conn: Connection::new(src.to_string(), src_port, dst.to_string(), dst_port, proto),
        payload,
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn parses_ipv4_udp() {
        let data = udp4([10, 0, 0, 2], 40000, [1, 1, 1, 1], 53, b"abc");
        let packet = parse(&data).unwrap();

        assert_eq!(
            packet.conn,
            Connection::new("10.0.0.2", Some(40000), "1.1.1.1", Some(53), Proto::Udp)
        );
        assert_eq!(packet.payload, b"abc");
    }

    #[test]
    fn parses_ipv4_tcp_and_skips_header() {
        let data = tcp4([10, 0, 0, 2], 51000, [93, 184, 216, 34], 80, b"GET /");
        let packet = parse(&data).unwrap();

        assert_eq!(packet.conn.proto, Proto::Tcp);
        assert_eq!(packet.conn.dst_port, Some(80));
        assert_eq!(packet.payload, b"GET /");
    }

    #[test]
    fn parses_ipv6_tcp() {
        let mut src = [0u8; 16];
        src[15] = 1;
        let mut dst = [0u8; 16];
        dst[0] = 0x20;
        dst[1] = 0x01;
        dst[15] = 2;
        let builder = PacketBuilder::ipv6(src, dst, 64).tcp(50000, 443, 1, 1024);
        let mut data = Vec::new();
        builder.write(&mut data, &[]).unwrap();

        let packet = parse(&data).unwrap();
        assert_eq!(packet.conn.src, "::1");
        assert_eq!(packet.conn.dst, "2001::2");
        assert_eq!(packet.conn.dst_port, Some(443));
    }

    #[test]
    fn untracked_protocols_have_no_ports() {
        let data = raw4([10, 0, 0, 2], [8, 8, 8, 8], 1);
        let packet = parse(&data).unwrap();

        assert_eq!(packet.conn.proto, Proto::Other(1));
        assert_eq!(packet.conn.src_port, None);
        assert_eq!(packet.conn.to_string(), "icmp | 10.0.0.2:- -> 8.8.8.8:-");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse(&[]), Err(PacketError::Empty)));
        assert!(matches!(parse(&[0x10, 0, 0]), Err(PacketError::Version(1))));
        assert!(parse(&[0x45, 0, 0]).is_err());

        // IPv4 header claiming TCP with a truncated TCP header
        let mut data = raw4([10, 0, 0, 2], [8, 8, 8, 8], 6);
        data.truncate(24);
        data[2] = 0;
        data[3] = 24;
        assert!(parse(&data).is_err());
    }

    #[test]
    fn display_matches_log_format() {
        let conn = Connection::new("10.0.0.2", Some(40000), "google.com", Some(80), Proto::Tcp);
        assert_eq!(conn.to_string(), "tcp | 10.0.0.2:40000 -> google.com:80");
        assert_eq!(conn.reversed().to_string(), "tcp | google.com:80 -> 10.0.0.2:40000");
    }

    #[test]
    fn protocol_names() {
        assert_eq!(Proto::from_ip_number(17), Proto::Udp);
        assert_eq!(Proto::Other(58).to_string(), "ipv6-icmp");
        assert_eq!(Proto::Other(200).to_string(), "ip-200");
        assert!(!Proto::Other(1).is_tracked());
    }
}
