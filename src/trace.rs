//! Connection ownership tracking
//! Correlates kernel trace events (connect, fork, exec, exit) into a map from
//! connection 4-tuple to the process that owns it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use log::{debug, info};
use parking_lot::Mutex;

use crate::conn::Connection;
use crate::error::{NotFound, TraceLineError};
use crate::proc_parser::canonical;
use crate::process::{ProcessMeta, SocketTable};
use crate::rules::Transport;

const GC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connect,
    Fork,
    Exit,
    Exec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Connect {
        pid: u32,
        src: String,
        sport: u16,
        dst: String,
        dport: u16,
    },
    Fork {
        pid: u32,
        child: u32,
    },
    Exit {
        pid: u32,
    },
    Exec {
        pid: u32,
        path: String,
        args: String,
    },
}

fn number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, TraceLineError> {
    value.parse().map_err(|_| TraceLineError::Number {
        field,
        value: value.to_string(),
    })
}

fn need(fields: &[&str], expected: usize) -> Result<(), TraceLineError> {
    if fields.len() < expected {
        return Err(TraceLineError::FieldCount {
            expected,
            got: fields.len(),
        });
    }
    Ok(())
}

/// Normalise a traced address to the form packets are printed in.
fn normalize_addr(addr: &str) -> String {
    match addr.parse::<IpAddr>() {
        Ok(ip) => canonical(ip).to_string(),
        Err(_) => addr.to_string(),
    }
}

impl TraceEvent {
    /// Parse one line of a trace helper's output.
    ///
    /// Connect lines are `pid comm src sport dst dport`; the command name may
    /// contain spaces, so the address fields are taken from the end.
    pub fn parse(kind: EventKind, line: &str) -> Result<Self, TraceLineError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match kind {
            EventKind::Connect => {
                need(&fields, 5)?;
                let tail = &fields[fields.len() - 4..];
                Ok(TraceEvent::Connect {
                    pid: number("pid", fields[0])?,
                    src: normalize_addr(tail[0]),
                    sport: number("sport", tail[1])?,
                    dst: normalize_addr(tail[2]),
                    dport: number("dport", tail[3])?,
                })
            }
            EventKind::Fork => {
                need(&fields, 2)?;
                Ok(TraceEvent::Fork {
                    pid: number("pid", fields[0])?,
                    child: number("child pid", fields[1])?,
                })
            }
            EventKind::Exit => {
                need(&fields, 1)?;
                Ok(TraceEvent::Exit {
                    pid: number("pid", fields[0])?,
                })
            }
            EventKind::Exec => {
                need(&fields, 2)?;
                Ok(TraceEvent::Exec {
                    pid: number("pid", fields[0])?,
                    path: fields[1].to_string(),
                    args: fields[2..].join(" "),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnKey {
    src: String,
    sport: u16,
    dst: String,
    dport: u16,
}

impl ConnKey {
    fn of(conn: &Connection) -> Option<Self> {
        Some(Self {
            src: conn.src.clone(),
            sport: conn.src_port?,
            dst: conn.dst.clone(),
            dport: conn.dst_port?,
        })
    }

    fn reversed(&self) -> Self {
        Self {
            src: self.dst.clone(),
            sport: self.dport,
            dst: self.src.clone(),
            dport: self.sport,
        }
    }
}

struct ConnRecord {
    pid: u32,
    seen: Instant,
    released: Option<Instant>,
}

#[derive(Default)]
struct Tables {
    pids: HashMap<u32, ProcessMeta>,
    exited: HashMap<u32, Instant>,
    conns: HashMap<ConnKey, ConnRecord>,
    listening: HashMap<(Transport, u16), u32>,
}

/// Channels the trace helpers feed, one per event class.
pub struct TraceReceivers {
    pub connect: Receiver<TraceEvent>,
    pub fork: Receiver<TraceEvent>,
    pub exit: Receiver<TraceEvent>,
    pub exec: Receiver<TraceEvent>,
}

pub struct TraceStore {
    tables: Mutex<Tables>,
    refresh: Sender<()>,
    grace: Duration,
    conn_ttl: Duration,
}

impl TraceStore {
    /// The returned receiver yields listener refresh requests; at most one is
    /// ever outstanding.
    pub fn new(grace: Duration, conn_ttl: Duration) -> (Self, Receiver<()>) {
        let (tx, rx) = bounded(1);
        let store = Self {
            tables: Mutex::new(Tables::default()),
            refresh: tx,
            grace,
            conn_ttl,
        };
        (store, rx)
    }

    /// Record processes that were running before tracing started.
    pub fn seed(&self, processes: Vec<ProcessMeta>) {
        let mut tables = self.tables.lock();
        for meta in processes {
            tables.pids.entry(meta.pid).or_insert(meta);
        }
        info!("Seeded {} running processes", tables.pids.len());
    }

    pub fn apply(&self, event: TraceEvent) {
        self.apply_at(event, Instant::now())
    }

    fn apply_at(&self, event: TraceEvent, now: Instant) {
        let mut tables = self.tables.lock();
        match event {
            TraceEvent::Connect {
                pid,
                src,
                sport,
                dst,
                dport,
            } => {
                let key = ConnKey { src, sport, dst, dport };
                let record = || ConnRecord {
                    pid,
                    seen: now,
                    released: None,
                };
                tables.conns.insert(key.reversed(), record());
                tables.conns.insert(key, record());
            }
            TraceEvent::Fork { pid, child } => {
                if let Some(parent) = tables.pids.get(&pid).cloned() {
                    tables.pids.insert(child, ProcessMeta { pid: child, ..parent });
                    tables.exited.remove(&child);
                }
            }
            TraceEvent::Exit { pid } => {
                tables.exited.insert(pid, now);
            }
            TraceEvent::Exec { pid, path, args } => {
                tables.pids.insert(pid, ProcessMeta { pid, path, args });
                tables.exited.remove(&pid);
            }
        }
    }

    /// The process owning `conn` (raw addresses). For connections to a local
    /// port the listening socket's owner is consulted after the 4-tuple map;
    /// a miss there queues a listener refresh.
    pub fn owner_of(&self, conn: &Connection, dst_is_local: bool) -> Result<ProcessMeta, NotFound> {
        let key = ConnKey::of(conn).ok_or(NotFound)?;
        {
            let tables = self.tables.lock();
            if let Some(record) = tables.conns.get(&key) {
                if let Some(meta) = tables.pids.get(&record.pid) {
                    return Ok(meta.clone());
                }
            }
            if !dst_is_local {
                return Err(NotFound);
            }
            let transport = Transport::of(conn.proto).ok_or(NotFound)?;
            if let Some(pid) = tables.listening.get(&(transport, key.dport)) {
                if let Some(meta) = tables.pids.get(pid) {
                    return Ok(meta.clone());
                }
            }
        }

        if self.refresh.try_send(()).is_ok() {
            debug!("Listener miss on {}, refreshing", conn);
        }
        Err(NotFound)
    }

    /// False once an exit event arrived, even while the record is retained.
    pub fn is_alive(&self, pid: u32) -> bool {
        let tables = self.tables.lock();
        tables.pids.contains_key(&pid) && !tables.exited.contains_key(&pid)
    }

    /// Ask the kernel directly. Used once retries are exhausted.
    pub fn online_lookup(&self, conn: &Connection, dst_is_local: bool, table: &dyn SocketTable) -> Option<ProcessMeta> {
        let meta = table.owner(conn).or_else(|| {
            if !dst_is_local {
                return None;
            }
            let transport = Transport::of(conn.proto)?;
            let port = conn.dst_port?;
            let (_, _, pid) = table
                .listeners()
                .into_iter()
                .find(|&(t, p, _)| t == transport && p == port)?;
            crate::process::read_meta(pid)
        })?;

        self.tables.lock().pids.entry(meta.pid).or_insert_with(|| meta.clone());
        Some(meta)
    }

    /// The verdict for `conn` is final; forget its ownership after the grace period.
    pub fn release(&self, conn: &Connection) {
        let Some(key) = ConnKey::of(conn) else {
            return;
        };
        let now = Instant::now();
        let mut tables = self.tables.lock();
        for k in [key.reversed(), key] {
            if let Some(record) = tables.conns.get_mut(&k) {
                record.released.get_or_insert(now);
            }
        }
    }

    pub fn set_listeners(&self, listeners: Vec<(Transport, u16, u32)>) {
        let listening = listeners
            .into_iter()
            .map(|(transport, port, pid)| ((transport, port), pid))
            .collect();
        self.tables.lock().listening = listening;
    }

    /// Serve listener refresh requests from `owner_of` misses.
    pub fn run_listener_refresher(&self, table: &dyn SocketTable, requests: Receiver<()>) -> Result<()> {
        while requests.recv().is_ok() {
            let listeners = table.listeners();
            for &(_, _, pid) in &listeners {
                if !self.is_alive(pid) {
                    if let Some(meta) = crate::process::read_meta(pid) {
                        let mut tables = self.tables.lock();
                        tables.pids.insert(pid, meta);
                        tables.exited.remove(&pid);
                    }
                }
            }
            debug!("Refreshed {} listening sockets", listeners.len());
            self.set_listeners(listeners);
        }
        Ok(())
    }

    pub fn gc_at(&self, now: Instant) {
        let grace = self.grace;
        let conn_ttl = self.conn_ttl;
        let mut tables = self.tables.lock();

        let gone: Vec<u32> = tables
            .exited
            .iter()
            .filter(|&(_, &at)| now.saturating_duration_since(at) >= grace)
            .map(|(&pid, _)| pid)
            .collect();
        for pid in gone {
            tables.exited.remove(&pid);
            tables.pids.remove(&pid);
            tables.listening.retain(|_, owner| *owner != pid);
        }

        tables.conns.retain(|_, record| match record.released {
            Some(at) => now.saturating_duration_since(at) < grace,
            None => now.saturating_duration_since(record.seen) < conn_ttl,
        });
    }

    /// `(pids, conns)` currently tracked.
    pub fn sizes(&self) -> (usize, usize) {
        let tables = self.tables.lock();
        (tables.pids.len(), tables.conns.len())
    }

    /// Drain every trace channel into the store, collecting garbage once a second.
    pub fn run_consumer(&self, rx: TraceReceivers) -> Result<()> {
        let ticker = tick(GC_INTERVAL);
        loop {
            let event = select! {
                recv(rx.connect) -> ev => Some(ev),
                recv(rx.fork) -> ev => Some(ev),
                recv(rx.exit) -> ev => Some(ev),
                recv(rx.exec) -> ev => Some(ev),
                recv(ticker) -> _ => None,
            };
            match event {
                Some(ev) => self.apply(ev.map_err(|_| anyhow!("trace channel closed"))?),
                None => self.gc_at(Instant::now()),
            }
        }
    }
}
