//! Process identification module
//! Reads /proc to find which process owns a socket and what it is running.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::IpAddr;

use log::debug;

use crate::conn::Connection;
use crate::proc_parser::{self, canonical, NetEntry};
use crate::rules::Transport;

/// Identity of a process as shown in verdict logs and prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMeta {
    pub pid: u32,
    pub path: String,
    pub args: String,
}

/// `pid path args` of a possibly unknown owner, `-` standing in for unknowns.
pub struct Owner<'a>(pub Option<&'a ProcessMeta>);

impl fmt::Display for Owner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(meta) if meta.args.is_empty() => write!(f, "{} {} -", meta.pid, meta.path),
            Some(meta) => write!(f, "{} {} {}", meta.pid, meta.path, meta.args),
            None => f.write_str("- - -"),
        }
    }
}

/// Live view of the kernel's socket tables.
pub trait SocketTable: Send + Sync {
    /// Owner of the socket carrying `conn`, matched in either orientation.
    fn owner(&self, conn: &Connection) -> Option<ProcessMeta>;

    /// Every listening socket as `(transport, local port, pid)`.
    fn listeners(&self) -> Vec<(Transport, u16, u32)>;
}

/// `SocketTable` backed by /proc/net and /proc/<pid>/fd.
#[derive(Debug, Default)]
pub struct ProcSocketTable;

impl ProcSocketTable {
    pub fn new() -> Self {
        Self
    }
}

impl SocketTable for ProcSocketTable {
    fn owner(&self, conn: &Connection) -> Option<ProcessMeta> {
        let transport = Transport::of(conn.proto)?;
        let src = canonical(conn.src.parse::<IpAddr>().ok()?);
        let dst = canonical(conn.dst.parse::<IpAddr>().ok()?);
        let (sport, dport) = (conn.src_port?, conn.dst_port?);

        let entries = proc_parser::read_net_entries(transport);
        let matches = |e: &NetEntry, local: (IpAddr, u16), remote: (IpAddr, u16)| {
            canonical(e.local_addr) == local.0
                && e.local_port == local.1
                && canonical(e.remote_addr) == remote.0
                && e.remote_port == remote.1
        };
        let inode = entries
            .iter()
            .find(|e| matches(e, (src, sport), (dst, dport)) || matches(e, (dst, dport), (src, sport)))?
            .inode;

        let pid = *socket_owners().get(&inode)?;
        read_meta(pid)
    }

    fn listeners(&self) -> Vec<(Transport, u16, u32)> {
        let owners = socket_owners();
        let mut found = Vec::new();
        for transport in [Transport::Tcp, Transport::Udp] {
            for entry in proc_parser::read_net_entries(transport) {
                if !entry.is_listener(transport) {
                    continue;
                }
                if let Some(&pid) = owners.get(&entry.inode) {
                    found.push((transport, entry.local_port, pid));
                }
            }
        }
        found
    }
}

fn pids() -> impl Iterator<Item = u32> {
    fs::read_dir("/proc")
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
}

/// Map of socket inode to owning pid, built from every readable fd table.
fn socket_owners() -> HashMap<u64, u32> {
    let mut owners = HashMap::new();
    for pid in pids() {
        let fds = match fs::read_dir(format!("/proc/{}/fd", pid)) {
            Ok(fds) => fds,
            Err(_) => continue,
        };
        for fd in fds.flatten() {
            if let Ok(link) = fs::read_link(fd.path()) {
                if let Some(inode) = socket_inode(&link.to_string_lossy()) {
                    owners.insert(inode, pid);
                }
            }
        }
    }
    owners
}

fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

/// Split a NUL-separated /proc cmdline into program and argument string.
/// Kernel threads have an empty cmdline and yield `None`.
pub fn split_cmdline(raw: &[u8]) -> Option<(String, String)> {
    let raw = String::from_utf8_lossy(raw);
    let mut parts = raw.split('\0').filter(|p| !p.is_empty());
    let program = parts.next()?.to_string();
    let args = parts.collect::<Vec<_>>().join(" ");
    Some((program, args))
}

/// Read the command line of `pid`, resolving a bare program name through its exe link.
pub fn read_meta(pid: u32) -> Option<ProcessMeta> {
    let raw = fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let (mut path, args) = split_cmdline(&raw)?;

    if !path.contains('/') {
        if let Ok(exe) = fs::read_link(format!("/proc/{}/exe", pid)) {
            path = clean_exe_path(&exe.to_string_lossy());
        }
    }
    Some(ProcessMeta { pid, path, args })
}

/// Every user-space process currently running.
pub fn running_processes() -> Vec<ProcessMeta> {
    let found: Vec<ProcessMeta> = pids().filter_map(read_meta).collect();
    debug!("Found {} running processes", found.len());
    found
}

fn clean_exe_path(path: &str) -> String {
    path.trim_end_matches(" (deleted)").to_string()
}
