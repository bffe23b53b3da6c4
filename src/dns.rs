//! DNS observation
//! Learns address to hostname mappings from DNS responses passing through the queue.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record};
use log::{debug, error, info, warn};
use parking_lot::RwLock;

use crate::config::is_regular_or_missing;
use crate::conn::{Connection, Packet, Proto, DNS_PORT};

pub const LOCALHOST: &str = "localhost";
const PERSIST_QUEUE: usize = 4096;
const LOCALHOST_REFRESH: Duration = Duration::from_secs(5);

/// A learned `hostname address` pair.
pub type HostRecord = (String, String);

pub struct DnsStore {
    // Key: address -> hostname
    hosts: RwLock<HashMap<String, String>>,
    localhosts: RwLock<HashSet<String>>,
    persist: Sender<HostRecord>,
    dump_dir: PathBuf,
}

impl DnsStore {
    /// Create an empty store. Changed mappings are sent to the returned receiver
    /// for `run_persister`.
    pub fn new(dump_dir: PathBuf) -> (Self, Receiver<HostRecord>) {
        let (tx, rx) = bounded(PERSIST_QUEUE);
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            localhosts: RwLock::new(HashSet::from([LOCALHOST.to_string()])),
            persist: tx,
            dump_dir,
        };
        (store, rx)
    }

    /// Load previously learned names. A missing file is created empty.
    pub fn load_hosts(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
            info!("Created empty hosts file {}", path.display());
            return Ok(0);
        }

        let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let mut hosts = self.hosts.write();
        let mut loaded = 0;
        for line in content.lines() {
            match line.split_whitespace().collect::<Vec<_>>()[..] {
                [name, addr] => {
                    hosts.insert(addr.to_string(), name.to_string());
                    loaded += 1;
                }
                [] => {}
                _ => warn!("Skipping bad hosts line {:?}", line),
            }
        }
        info!("Loaded {} hosts from {}", loaded, path.display());
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    /// Hostname last seen for `addr`, or `addr` itself.
    pub fn resolve(&self, addr: &str) -> String {
        self.hosts
            .read()
            .get(addr)
            .cloned()
            .unwrap_or_else(|| addr.to_string())
    }

    /// `conn` with both addresses replaced by their hostnames.
    pub fn resolve_conn(&self, conn: &Connection) -> Connection {
        conn.with_hosts(self.resolve(&conn.src), self.resolve(&conn.dst))
    }

    pub fn is_localhost(&self, addr: &str) -> bool {
        self.localhosts.read().contains(addr)
    }

    /// A DNS answer arriving at this host.
    pub fn is_inbound_dns(&self, conn: &Connection) -> bool {
        conn.src_port == Some(DNS_PORT) && self.is_localhost(&conn.dst)
    }

    pub fn add_localhost(&self, addr: &str) {
        if self.localhosts.write().insert(addr.to_string()) {
            debug!("Local address {}", addr);
        }
        self.hosts.write().insert(addr.to_string(), LOCALHOST.to_string());
    }

    /// Re-enumerate the addresses of every local interface.
    pub fn refresh_localhosts(&self) -> Result<()> {
        let ifaces = get_if_addrs::get_if_addrs().context("failed to list interfaces")?;
        for iface in ifaces {
            self.add_localhost(&iface.ip().to_string());
        }
        Ok(())
    }

    /// Load the hosts file, then seed local addresses so they win over any
    /// persisted name.
    pub fn start(&self, hosts_file: &Path) -> Result<usize> {
        let loaded = self.load_hosts(hosts_file)?;
        self.refresh_localhosts()?;
        Ok(loaded)
    }

    pub fn run_localhost_watcher(&self) -> Result<()> {
        loop {
            self.refresh_localhosts()?;
            thread::sleep(LOCALHOST_REFRESH);
        }
    }

    /// Learn from `packet` if it is a DNS message. Never fails; unparsable
    /// payloads are dumped for inspection.
    pub fn observe(&self, packet: &Packet<'_>) {
        let conn = &packet.conn;
        if !conn.proto.is_tracked() || (conn.src_port != Some(DNS_PORT) && conn.dst_port != Some(DNS_PORT)) {
            return;
        }

        // DNS over TCP carries a two byte length prefix
        let payload = match conn.proto {
            Proto::Tcp => packet.payload.get(2..).unwrap_or_default(),
            _ => packet.payload,
        };
        if payload.is_empty() {
            return;
        }

        match Message::from_vec(payload) {
            Ok(msg) => {
                for (name, addr) in answers(&msg) {
                    self.learn(name, addr);
                }
            }
            Err(e) => self.dump_failure(payload, &e),
        }
    }

    fn learn(&self, name: String, addr: String) {
        {
            let mut hosts = self.hosts.write();
            if hosts.get(&addr) == Some(&name) {
                return;
            }
            hosts.insert(addr.clone(), name.clone());
        }

        info!("DNS {} {}", name, addr);
        match self.persist.try_send((name, addr)) {
            Ok(()) => {}
            Err(TrySendError::Full((name, addr))) => {
                warn!("Hosts persistence queue full, not saving {} {}", name, addr)
            }
            Err(TrySendError::Disconnected(_)) => error!("Hosts persister is gone"),
        }
    }

    fn dump_failure(&self, payload: &[u8], err: &dyn std::fmt::Display) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = self.dump_dir.join(format!("dns-fail-{}.bin", nanos));
        match fs::write(&path, payload) {
            Ok(()) => warn!("Failed to parse DNS payload ({}), dumped to {}", err, path.display()),
            Err(e) => error!("Failed to parse DNS payload ({}) and to dump it: {}", err, e),
        }
    }
}

fn owner_name(record: &Record) -> String {
    record.name().to_string().trim_end_matches('.').to_string()
}

/// `(hostname, address)` pairs in a DNS answer section. When the answer
/// contains a CNAME chain, addresses are named after the first alias, which
/// is the name the client asked for.
pub fn answers(msg: &Message) -> Vec<HostRecord> {
    let alias = msg
        .answers()
        .iter()
        .find(|r| matches!(r.data(), Some(RData::CNAME(_))))
        .map(owner_name);

    msg.answers()
        .iter()
        .filter_map(|record| {
            let addr = match record.data() {
                Some(RData::A(a)) => (**a).to_string(),
                Some(RData::AAAA(aaaa)) => (**aaaa).to_string(),
                _ => return None,
            };
            let name = alias.clone().unwrap_or_else(|| owner_name(record));
            Some((name, addr))
        })
        .collect()
}

/// Append learned mappings to the hosts file, batching whatever is queued.
pub fn run_persister(path: &Path, rx: Receiver<HostRecord>) -> Result<()> {
    while let Ok(first) = rx.recv() {
        let batch: Vec<HostRecord> = std::iter::once(first).chain(rx.try_iter()).collect();
        if !is_regular_or_missing(path) {
            anyhow::bail!("refusing to write hosts to non-regular file {}", path.display());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        for (name, addr) in &batch {
            writeln!(file, "{} {}", name, addr).with_context(|| format!("failed to append to {}", path.display()))?;
        }
        debug!("Persisted {} hosts", batch.len());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Name;

    pub fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    /// Wire form of a response carrying `records` as answers.
    pub fn response(records: Vec<Record>) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Response);
        for record in records {
            msg.add_answer(record);
        }
        msg.to_vec().unwrap()
    }

    pub fn a(owner: &str, ip: [u8; 4]) -> Record {
        Record::from_rdata(name(owner), 60, RData::A(A::new(ip[0], ip[1], ip[2], ip[3])))
    }
}
