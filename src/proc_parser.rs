use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::rules::Transport;

/// `st` value of a listening TCP socket.
pub const TCP_LISTEN: u8 = 0x0A;
/// `st` value of an unconnected UDP socket.
pub const UDP_UNCONNECTED: u8 = 0x07;

/// Connection info from /proc/net/tcp or /proc/net/udp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEntry {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub state: u8,
    pub inode: u64,
}

impl NetEntry {
    /// A socket waiting for peers rather than talking to one.
    pub fn is_listener(&self, transport: Transport) -> bool {
        match transport {
            Transport::Tcp => self.state == TCP_LISTEN,
            Transport::Udp => self.state == UDP_UNCONNECTED && self.remote_port == 0,
        }
    }
}

pub fn read_net_entries(transport: Transport) -> Vec<NetEntry> {
    let files = match transport {
        Transport::Tcp => ["/proc/net/tcp", "/proc/net/tcp6"],
        Transport::Udp => ["/proc/net/udp", "/proc/net/udp6"],
    };

    let mut entries = Vec::new();
    for path in files {
        if let Ok(file) = File::open(path) {
            let reader = BufReader::new(file);
            for line in reader.lines().skip(1).map_while(Result::ok) {
                if let Some(entry) = parse_net_line(&line) {
                    entries.push(entry);
                }
            }
        }
    }
    entries
}

pub fn parse_net_line(line: &str) -> Option<NetEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let (local_addr, local_port) = parse_hex_address(parts[1])?;
    let (remote_addr, remote_port) = parse_hex_address(parts[2])?;
    let state = u8::from_str_radix(parts[3], 16).ok()?;
    let inode = parts[9].parse::<u64>().ok()?;

    Some(NetEntry {
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        state,
        inode,
    })
}

fn parse_hex_address(s: &str) -> Option<(IpAddr, u16)> {
    let (hex_addr, hex_port) = s.split_once(':')?;
    let port = u16::from_str_radix(hex_port, 16).ok()?;

    match hex_addr.len() {
        8 => {
            // IPv4: stored as little-endian hex
            let bytes = u32::from_str_radix(hex_addr, 16).ok()?;
            Some((IpAddr::V4(Ipv4Addr::from(bytes.swap_bytes())), port))
        }
        32 => {
            // IPv6: 4 groups of 4 bytes, each group is little-endian
            let mut octets = [0u8; 16];
            for i in 0..4 {
                let group = u32::from_str_radix(&hex_addr[i * 8..(i + 1) * 8], 16).ok()?;
                octets[i * 4..(i + 1) * 4].copy_from_slice(&group.swap_bytes().to_be_bytes());
            }
            Some((IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Unmap `::ffff:a.b.c.d` so dual-stack sockets compare equal to IPv4 packets.
pub fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
