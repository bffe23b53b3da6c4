//! Verdict pipeline
//!
//! Every queued packet passes through `Pipeline::judge`. Packets with a
//! matching rule are decided at once; the rest are parked with a `Repeat`
//! verdict while the owning process is looked up and the user is asked.
//! Each repeat re-enters here and advances the connection's pending state
//! until a final verdict comes out.
//!
//! Final verdicts are logged as `<action> <connection> <pid> <path> <args>`.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::conn::{self, Connection};
use crate::dns::DnsStore;
use crate::error::NotFound;
use crate::process::{Owner, ProcessMeta, SocketTable};
use crate::prompt::{PromptBridge, PromptRequest};
use crate::rules::{Action, Check, RuleStore};
use crate::stats::{Sizes, Stats};
use crate::trace::TraceStore;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    /// Hand the packet back to the kernel to be queued again.
    Repeat,
}

impl From<Action> for Verdict {
    fn from(action: Action) -> Self {
        match action {
            Action::Allow => Verdict::Allow,
            Action::Deny => Verdict::Deny,
        }
    }
}

/// Tunables of the pending state machine.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Owner lookups in the trace store before asking the kernel directly.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// A connection still undecided this long after it was first seen is
    /// denied; one the kernel stopped repeating is dropped after as long.
    pub pending_ttl: Duration,
    pub ephemeral_ports: RangeInclusive<u16>,
}

impl Settings {
    pub fn from_config(config: &Config, ephemeral_ports: RangeInclusive<u16>) -> Self {
        Self {
            max_attempts: config.retry.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            pending_ttl: config.pending_ttl(),
            ephemeral_ports,
        }
    }
}

/// The shared stores a pipeline consults.
pub struct Stores {
    pub dns: Arc<DnsStore>,
    pub rules: Arc<RuleStore>,
    pub trace: Arc<TraceStore>,
    pub prompts: Arc<PromptBridge>,
    pub sockets: Arc<dyn SocketTable>,
}

enum Stage {
    /// Waiting for the trace store to learn who owns the connection.
    Owner { attempts: u32, not_before: Instant },
    /// Queued for the user. `conn` is the resolved connection that was asked about.
    Prompt {
        conn: Connection,
        meta: Option<ProcessMeta>,
    },
}

struct Pending {
    stage: Stage,
    created: Instant,
    touched: Instant,
}

/// What to do once the pending table lock is released.
enum Step {
    Wait,
    Ask(Option<ProcessMeta>),
    Online,
    Poll {
        asked: Connection,
        meta: Option<ProcessMeta>,
        expired: bool,
    },
}

type VerdictSink = Box<dyn Fn(&str) + Send + Sync>;

pub struct Pipeline {
    dns: Arc<DnsStore>,
    rules: Arc<RuleStore>,
    trace: Arc<TraceStore>,
    prompts: Arc<PromptBridge>,
    sockets: Arc<dyn SocketTable>,
    stats: Stats,
    // Keyed by the raw connection as it appears in the packet
    pending: Mutex<HashMap<Connection, Pending>>,
    settings: Settings,
    verdicts: VerdictSink,
}

impl Pipeline {
    pub fn new(stores: Stores, settings: Settings) -> Self {
        info!(
            "Pipeline ready: {} owner lookups {}ms apart, ephemeral ports {}-{}",
            settings.max_attempts,
            settings.retry_delay.as_millis(),
            settings.ephemeral_ports.start(),
            settings.ephemeral_ports.end()
        );
        Self {
            dns: stores.dns,
            rules: stores.rules,
            trace: stores.trace,
            prompts: stores.prompts,
            sockets: stores.sockets,
            stats: Stats::default(),
            pending: Mutex::new(HashMap::new()),
            settings,
            verdicts: Box::new(|line| info!("{}", line)),
        }
    }

    /// Route final verdict lines to `sink` instead of the log.
    pub fn with_verdict_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.verdicts = Box::new(sink);
        self
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Decide what happens to one queued packet.
    pub fn judge(&self, data: &[u8]) -> Verdict {
        let verdict = self.judge_packet(data, Instant::now());
        self.stats.record(verdict);
        verdict
    }

    fn judge_packet(&self, data: &[u8], now: Instant) -> Verdict {
        let packet = match conn::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Passing unparsable packet: {}", e);
                return Verdict::Allow;
            }
        };
        self.dns.observe(&packet);

        let raw = packet.conn;
        // Answers to our own queries and non TCP/UDP traffic pass unlogged
        if self.dns.is_inbound_dns(&raw) || !raw.proto.is_tracked() {
            return Verdict::Allow;
        }

        let conn = self.orient(self.dns.resolve_conn(&raw));
        let dst_is_local = self.dns.is_localhost(&conn.dst);

        if let Check::Decided(action) = self.rules.check(&conn, dst_is_local) {
            let meta = self.trace.owner_of(&raw, self.dns.is_localhost(&raw.dst)).ok();
            return self.finalize(&raw, &conn, action, meta.as_ref());
        }
        self.advance(raw, conn, dst_is_local, now)
    }

    /// Flip a reply travelling from a remote peer back to a local ephemeral
    /// port so it reads as the outbound connection it belongs to.
    fn orient(&self, conn: Connection) -> Connection {
        let reply = !self.dns.is_localhost(&conn.src)
            && self.dns.is_localhost(&conn.dst)
            && conn
                .dst_port
                .is_some_and(|port| self.settings.ephemeral_ports.contains(&port));
        if reply {
            conn.reversed()
        } else {
            conn
        }
    }

    /// Move an undecided connection one step through its pending stages.
    fn advance(&self, raw: Connection, conn: Connection, dst_is_local: bool, now: Instant) -> Verdict {
        let raw_dst_local = self.dns.is_localhost(&raw.dst);

        let step = {
            let mut pending = self.pending.lock();
            let entry = pending.entry(raw.clone()).or_insert_with(|| Pending {
                stage: Stage::Owner {
                    attempts: 0,
                    not_before: now,
                },
                created: now,
                touched: now,
            });
            entry.touched = now;
            let expired = now.saturating_duration_since(entry.created) >= self.settings.pending_ttl;

            match &mut entry.stage {
                Stage::Prompt { conn: asked, meta } => Step::Poll {
                    asked: asked.clone(),
                    meta: meta.clone(),
                    expired,
                },
                Stage::Owner { not_before, .. } if now < *not_before => Step::Wait,
                Stage::Owner { attempts, not_before } => match self.trace.owner_of(&raw, raw_dst_local) {
                    Ok(meta) => Step::Ask(Some(meta)),
                    Err(NotFound) => {
                        *attempts += 1;
                        *not_before = now + self.settings.retry_delay;
                        if *attempts >= self.settings.max_attempts {
                            Step::Online
                        } else {
                            Step::Wait
                        }
                    }
                },
            }
        };

        match step {
            Step::Wait => Verdict::Repeat,
            Step::Ask(meta) => self.ask(raw, conn, dst_is_local, meta),
            Step::Online => {
                let meta = self.trace.online_lookup(&raw, raw_dst_local, self.sockets.as_ref());
                if meta.is_none() {
                    warn!(
                        "No owner for {} after {} attempts",
                        conn, self.settings.max_attempts
                    );
                }
                self.ask(raw, conn, dst_is_local, meta)
            }
            Step::Poll { asked, meta, expired } => self.poll(&raw, &asked, meta, expired),
        }
    }

    fn ask(&self, raw: Connection, conn: Connection, dst_is_local: bool, meta: Option<ProcessMeta>) -> Verdict {
        if let Some(m) = &meta {
            if !self.trace.is_alive(m.pid) {
                info!("Owner {} of {} is gone", m.pid, conn);
                return self.finalize(&raw, &conn, Action::Deny, meta.as_ref());
            }
        }

        let req = PromptRequest {
            conn: conn.clone(),
            dst_is_local,
            meta: meta.clone(),
        };
        if !self.prompts.enqueue(req) {
            return self.finalize(&raw, &conn, Action::Deny, meta.as_ref());
        }

        if let Some(entry) = self.pending.lock().get_mut(&raw) {
            entry.stage = Stage::Prompt { conn, meta };
        }
        Verdict::Repeat
    }

    fn poll(&self, raw: &Connection, asked: &Connection, meta: Option<ProcessMeta>, expired: bool) -> Verdict {
        if let Some(action) = self.prompts.take_decision(asked) {
            return self.finalize(raw, asked, action, meta.as_ref());
        }
        if let Some(m) = &meta {
            if !self.trace.is_alive(m.pid) {
                info!("Owner {} of {} exited while waiting for the user", m.pid, asked);
                return self.finalize(raw, asked, Action::Deny, meta.as_ref());
            }
        }
        if expired {
            warn!("No answer for {} within {}s", asked, self.settings.pending_ttl.as_secs());
            return self.finalize(raw, asked, Action::Deny, meta.as_ref());
        }
        Verdict::Repeat
    }

    fn finalize(&self, raw: &Connection, conn: &Connection, action: Action, meta: Option<&ProcessMeta>) -> Verdict {
        (self.verdicts)(&verdict_line(action, conn, meta));
        self.trace.release(raw);

        let done = self.pending.lock().remove(raw);
        if let Some(Pending {
            stage: Stage::Prompt { conn: asked, .. },
            ..
        }) = done
        {
            self.prompts.forget(&asked);
        }
        Verdict::from(action)
    }

    /// Drop pending connections the kernel stopped repeating.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let ttl = self.settings.pending_ttl;
        let mut asked = Vec::new();
        let mut dropped = 0;
        self.pending.lock().retain(|raw, entry| {
            let keep = now.saturating_duration_since(entry.touched) < ttl;
            if !keep {
                if let Stage::Prompt { conn, .. } = &entry.stage {
                    asked.push(conn.clone());
                }
                debug!("Dropping stale pending {}", raw);
                dropped += 1;
            }
            keep
        });
        for conn in &asked {
            self.prompts.forget(conn);
        }
        self.prompts.sweep_at(now, ttl);
        dropped
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn sizes(&self) -> Sizes {
        let (pids, conns) = self.trace.sizes();
        Sizes {
            rules: self.rules.len(),
            hosts: self.dns.len(),
            pids,
            conns,
            pending: self.pending_len(),
            prompts: self.prompts.len(),
        }
    }

    /// Expire timed rules and stale pending connections once a second.
    pub fn run_housekeeping(&self) -> Result<()> {
        loop {
            let now = Instant::now();
            let expired = self.rules.gc_at(now);
            self.sweep_at(now);
            if expired > 0 {
                debug!("Expired {} rules", expired);
            }
            thread::sleep(HOUSEKEEPING_INTERVAL);
        }
    }
}

/// The log line for a final verdict.
pub fn verdict_line(action: Action, conn: &Connection, meta: Option<&ProcessMeta>) -> String {
    format!("{} {} {}", action, conn, Owner(meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::fixtures::{raw4, tcp4, udp4};
    use crate::conn::Proto;
    use crate::dns::fixtures::{a, response};
    use crate::dns::HostRecord;
    use crate::process::fakes::StaticTable;
    use crate::prompt::fakes::ScriptedPrompter;
    use crate::rules::{DurationSpec, Port, RuleKey, RuleProto, Side, Transport};
    use crate::stats::Counters;
    use crate::trace::TraceEvent;
    use crossbeam_channel::Receiver;
    use std::fs;

    const LOCAL: [u8; 4] = [10, 0, 0, 2];
    const REMOTE: [u8; 4] = [93, 184, 216, 34];
    const CURL: u32 = 4242;

    struct Harness {
        _dir: tempfile::TempDir,
        pipeline: Pipeline,
        dns: Arc<DnsStore>,
        rules: Arc<RuleStore>,
        trace: Arc<TraceStore>,
        prompts: Arc<PromptBridge>,
        requests: Receiver<PromptRequest>,
        lines: Arc<Mutex<Vec<String>>>,
        _hosts: Receiver<HostRecord>,
    }

    impl Harness {
        fn new(rules: &str) -> Self {
            Self::with_table(rules, StaticTable::default(), 3)
        }

        fn with_table(rules: &str, table: StaticTable, max_attempts: u32) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let rules_file = dir.path().join("rules");
            fs::write(&rules_file, rules).unwrap();

            let (dns, hosts) = DnsStore::new(dir.path().to_path_buf());
            dns.add_localhost("10.0.0.2");
            let store = RuleStore::new(rules_file, Vec::new());
            store.reconcile().unwrap();
            let (trace, _refresh) = TraceStore::new(Duration::from_secs(10), Duration::from_secs(600));
            let (prompts, requests) = PromptBridge::new();

            let dns = Arc::new(dns);
            let rules = Arc::new(store);
            let trace = Arc::new(trace);
            let prompts = Arc::new(prompts);
            let stores = Stores {
                dns: dns.clone(),
                rules: rules.clone(),
                trace: trace.clone(),
                prompts: prompts.clone(),
                sockets: Arc::new(table),
            };
            let settings = Settings {
                max_attempts,
                retry_delay: Duration::ZERO,
                pending_ttl: Duration::from_secs(300),
                ephemeral_ports: 32768..=60999,
            };

            let lines = Arc::new(Mutex::new(Vec::new()));
            let sink = lines.clone();
            let pipeline =
                Pipeline::new(stores, settings).with_verdict_sink(move |line| sink.lock().push(line.to_string()));

            Self {
                _dir: dir,
                pipeline,
                dns,
                rules,
                trace,
                prompts,
                requests,
                lines,
                _hosts: hosts,
            }
        }

        /// Register `curl` as the owner of an outbound TCP connection.
        fn curl_connects(&self, sport: u16, dst: [u8; 4], dport: u16) {
            self.trace.apply(TraceEvent::Exec {
                pid: CURL,
                path: "/usr/bin/curl".into(),
                args: "-s example.com".into(),
            });
            self.trace.apply(TraceEvent::Connect {
                pid: CURL,
                src: "10.0.0.2".into(),
                sport,
                dst: std::net::Ipv4Addr::from(dst).to_string(),
                dport,
            });
        }

        fn answer(&self, answers: &[&str]) -> ScriptedPrompter {
            let prompter = ScriptedPrompter::new(answers);
            self.prompts.drain(&self.requests, &self.rules, &prompter);
            prompter
        }
    }

    #[test]
    fn permanent_allow_is_final_on_first_pass() {
        let h = Harness::new("allow example.com 443 tcp\n");
        h.dns.observe(&conn::parse(&udp4(
            [1, 1, 1, 1],
            53,
            LOCAL,
            40000,
            &response(vec![a("example.com.", REMOTE)]),
        ))
        .unwrap());

        let packet = tcp4(LOCAL, 50000, REMOTE, 443, b"");
        assert_eq!(h.pipeline.judge(&packet), Verdict::Allow);
        assert_eq!(h.pipeline.judge(&packet), Verdict::Allow);

        assert_eq!(h.pipeline.pending_len(), 0);
        assert!(h.requests.is_empty());
        assert_eq!(h.pipeline.stats().snapshot().repeated, 0);
    }

    #[test]
    fn deny_rule_denies() {
        let h = Harness::new("deny 93.184.216.34 * tcp\n");
        assert_eq!(h.pipeline.judge(&tcp4(LOCAL, 50000, REMOTE, 443, b"")), Verdict::Deny);
    }

    #[test]
    fn exact_rule_beats_wildcard() {
        let h = Harness::new("deny *.example.com * tcp\nallow api.example.com 443 tcp\n");
        h.dns.observe(&conn::parse(&udp4(
            [1, 1, 1, 1],
            53,
            LOCAL,
            40000,
            &response(vec![a("api.example.com.", REMOTE)]),
        ))
        .unwrap());

        assert_eq!(h.pipeline.judge(&tcp4(LOCAL, 50000, REMOTE, 443, b"")), Verdict::Allow);
        assert_eq!(h.pipeline.judge(&tcp4(LOCAL, 50001, REMOTE, 80, b"")), Verdict::Deny);
    }

    #[test]
    fn resolver_then_named_destination() {
        let h = Harness::new("allow 1.1.1.1 53 udp\nallow google.com 80 tcp\n");
        let google = [142, 250, 1, 1];

        assert_eq!(h.pipeline.judge(&udp4(LOCAL, 40000, [1, 1, 1, 1], 53, b"")), Verdict::Allow);
        let answer = udp4([1, 1, 1, 1], 53, LOCAL, 40000, &response(vec![a("google.com.", google)]));
        assert_eq!(h.pipeline.judge(&answer), Verdict::Allow);
        assert_eq!(h.pipeline.judge(&tcp4(LOCAL, 51000, google, 80, b"")), Verdict::Allow);

        assert_eq!(h.dns.resolve("142.250.1.1"), "google.com");
        assert_eq!(
            h.pipeline.stats().snapshot(),
            Counters {
                total: 3,
                allowed: 3,
                denied: 0,
                repeated: 0
            }
        );
        assert_eq!(
            verdict_line(
                Action::Allow,
                &Connection::new("localhost", Some(51000), "google.com", Some(80), Proto::Tcp),
                None
            ),
            "allow tcp | localhost:51000 -> google.com:80 - - -"
        );
    }

    #[test]
    fn repeated_dns_answers_change_nothing() {
        let h = Harness::new("");
        let answer = udp4([1, 1, 1, 1], 53, LOCAL, 40000, &response(vec![a("example.com.", REMOTE)]));

        for _ in 0..3 {
            assert_eq!(h.pipeline.judge(&answer), Verdict::Allow);
        }
        assert_eq!(h.dns.resolve("93.184.216.34"), "example.com");
        assert_eq!(h.pipeline.pending_len(), 0);
    }

    #[test]
    fn untracked_and_garbage_packets_pass() {
        let h = Harness::new("");
        assert_eq!(h.pipeline.judge(&raw4(LOCAL, REMOTE, 1)), Verdict::Allow);
        assert_eq!(h.pipeline.judge(&[0x45, 0x00]), Verdict::Allow);
        assert_eq!(h.pipeline.pending_len(), 0);
    }

    #[test]
    fn expired_timed_rule_no_longer_matches() {
        let h = Harness::new("");
        let key = RuleKey::new(
            "93.184.216.34",
            Port::Num(443),
            RuleProto::new(Transport::Tcp, Side::Destination),
        );
        h.rules
            .add(Action::Allow, DurationSpec::Timed(Duration::from_secs(60)), key)
            .unwrap();
        assert_eq!(h.pipeline.judge(&tcp4(LOCAL, 50000, REMOTE, 443, b"")), Verdict::Allow);

        assert_eq!(h.rules.gc_at(Instant::now() + Duration::from_secs(61)), 1);
        assert_eq!(h.pipeline.judge(&tcp4(LOCAL, 50000, REMOTE, 443, b"")), Verdict::Repeat);
    }

    #[test]
    fn local_service_needs_both_sides() {
        let h = Harness::new("allow localhost 8000 tcp\n");
        let inbound = tcp4(REMOTE, 50000, LOCAL, 8000, b"");
        assert_eq!(h.pipeline.judge(&inbound), Verdict::Repeat);

        fs::write(
            h.rules.rules_file(),
            "allow localhost 8000 tcp\nallow 93.184.216.34 8000 tcp-src\n",
        )
        .unwrap();
        h.rules.reconcile().unwrap();
        assert_eq!(h.pipeline.judge(&inbound), Verdict::Allow);
        assert_eq!(h.pipeline.pending_len(), 0);
    }

    #[test]
    fn unknown_connection_is_prompted_and_remembered() {
        let h = Harness::new("");
        h.curl_connects(50000, REMOTE, 443);
        let packet = tcp4(LOCAL, 50000, REMOTE, 443, b"");

        assert_eq!(h.pipeline.judge(&packet), Verdict::Repeat);
        assert_eq!(h.pipeline.judge(&packet), Verdict::Repeat);
        assert_eq!(h.requests.len(), 1);

        let prompter = h.answer(&["forever no allow yes"]);
        assert_eq!(
            prompter.asked.lock()[0],
            "tcp | localhost:50000 -> 93.184.216.34:443 4242 /usr/bin/curl -s example.com"
        );

        assert_eq!(h.pipeline.judge(&packet), Verdict::Allow);
        assert_eq!(h.pipeline.pending_len(), 0);
        assert!(h.prompts.is_empty());
        assert_eq!(
            fs::read_to_string(h.rules.rules_file()).unwrap(),
            "allow 93.184.216.34 443 tcp\n"
        );

        // The stored rule answers the next connection directly
        assert_eq!(h.pipeline.judge(&tcp4(LOCAL, 50001, REMOTE, 443, b"")), Verdict::Allow);
    }

    #[test]
    fn once_answer_applies_to_this_connection_only() {
        let h = Harness::new("");
        h.curl_connects(50000, REMOTE, 443);
        let packet = tcp4(LOCAL, 50000, REMOTE, 443, b"");

        assert_eq!(h.pipeline.judge(&packet), Verdict::Repeat);
        h.answer(&["once no deny yes"]);
        assert_eq!(h.pipeline.judge(&packet), Verdict::Deny);
        assert!(h.rules.is_empty());
    }

    #[test]
    fn unreachable_prompt_denies_without_a_rule() {
        let h = Harness::new("");
        h.curl_connects(50000, REMOTE, 443);
        let packet = tcp4(LOCAL, 50000, REMOTE, 443, b"");

        assert_eq!(h.pipeline.judge(&packet), Verdict::Repeat);
        let prompter = ScriptedPrompter::unreachable();
        h.prompts.drain(&h.requests, &h.rules, &prompter);

        assert_eq!(h.pipeline.judge(&packet), Verdict::Deny);
        assert!(h.rules.is_empty());
        assert_eq!(fs::read_to_string(h.rules.rules_file()).unwrap(), "");
    }

    #[test]
    fn owner_exit_while_waiting_denies() {
        let h = Harness::new("");
        h.curl_connects(50000, REMOTE, 443);
        let packet = tcp4(LOCAL, 50000, REMOTE, 443, b"");

        assert_eq!(h.pipeline.judge(&packet), Verdict::Repeat);
        h.trace.apply(TraceEvent::Exit { pid: CURL });
        assert_eq!(h.pipeline.judge(&packet), Verdict::Deny);
        assert_eq!(h.pipeline.pending_len(), 0);
    }

    #[test]
    fn exited_owner_is_denied_before_prompting() {
        let h = Harness::new("");
        h.curl_connects(50000, REMOTE, 443);
        h.trace.apply(TraceEvent::Exit { pid: CURL });

        assert_eq!(h.pipeline.judge(&tcp4(LOCAL, 50000, REMOTE, 443, b"")), Verdict::Deny);
        assert!(h.requests.is_empty());
    }

    #[test]
    fn owner_lookup_falls_back_to_the_kernel() {
        let meta = ProcessMeta {
            pid: 777,
            path: "/usr/bin/wget".into(),
            args: String::new(),
        };
        let table = StaticTable {
            owner: Some(meta.clone()),
            ..StaticTable::default()
        };
        let h = Harness::with_table("", table, 3);
        let packet = tcp4(LOCAL, 50000, REMOTE, 443, b"");

        for _ in 0..3 {
            assert_eq!(h.pipeline.judge(&packet), Verdict::Repeat);
        }
        let req = h.requests.try_recv().unwrap();
        assert_eq!(req.meta, Some(meta));
        assert!(h.trace.is_alive(777));
    }

    #[test]
    fn unknown_owner_is_still_prompted() {
        let h = Harness::with_table("", StaticTable::default(), 1);
        let packet = tcp4(LOCAL, 50000, REMOTE, 443, b"");

        assert_eq!(h.pipeline.judge(&packet), Verdict::Repeat);
        let prompter = h.answer(&["once no allow yes"]);
        assert!(prompter.asked.lock()[0].ends_with(" - - -"));
        assert_eq!(h.pipeline.judge(&packet), Verdict::Allow);
    }

    #[test]
    fn retries_wait_for_the_delay() {
        let h = Harness::new("");
        let raw = Connection::new("10.0.0.2", Some(50000), "93.184.216.34", Some(443), Proto::Tcp);
        let conn = Connection::new("localhost", Some(50000), "93.184.216.34", Some(443), Proto::Tcp);
        let start = Instant::now();

        h.pipeline.pending.lock().insert(
            raw.clone(),
            Pending {
                stage: Stage::Owner {
                    attempts: 1,
                    not_before: start + Duration::from_secs(1),
                },
                created: start,
                touched: start,
            },
        );
        assert_eq!(h.pipeline.advance(raw.clone(), conn.clone(), false, start), Verdict::Repeat);
        assert!(matches!(
            h.pipeline.pending.lock()[&raw].stage,
            Stage::Owner { attempts: 1, .. }
        ));

        let later = start + Duration::from_secs(2);
        assert_eq!(h.pipeline.advance(raw.clone(), conn, false, later), Verdict::Repeat);
        assert!(matches!(
            h.pipeline.pending.lock()[&raw].stage,
            Stage::Owner { attempts: 2, .. }
        ));
    }

    #[test]
    fn reply_to_ephemeral_port_is_flipped() {
        let h = Harness::new("allow 93.184.216.34 443 tcp\n");
        h.curl_connects(50000, REMOTE, 443);

        // Remote 443 -> local 50000 reads as local 50000 -> remote 443
        assert_eq!(h.pipeline.judge(&tcp4(REMOTE, 443, LOCAL, 50000, b"")), Verdict::Allow);

        let flipped = h.pipeline.orient(Connection::new(
            "93.184.216.34",
            Some(443),
            "localhost",
            Some(50000),
            Proto::Tcp,
        ));
        assert_eq!(flipped.dst, "93.184.216.34");
        assert_eq!(flipped.dst_port, Some(443));

        let service = Connection::new("93.184.216.34", Some(50000), "localhost", Some(22), Proto::Tcp);
        assert_eq!(h.pipeline.orient(service.clone()), service);
    }

    #[test]
    fn stale_pending_connections_are_swept() {
        let h = Harness::new("");
        h.curl_connects(50000, REMOTE, 443);
        assert_eq!(h.pipeline.judge(&tcp4(LOCAL, 50000, REMOTE, 443, b"")), Verdict::Repeat);
        assert_eq!(h.pipeline.sizes().pending, 1);

        assert_eq!(h.pipeline.sweep_at(Instant::now()), 0);
        assert_eq!(h.pipeline.sweep_at(Instant::now() + Duration::from_secs(301)), 1);
        assert_eq!(h.pipeline.pending_len(), 0);
    }

    #[test]
    fn unanswered_prompt_is_denied_after_the_ttl() {
        let h = Harness::new("");
        h.curl_connects(50000, REMOTE, 443);
        let packet = tcp4(LOCAL, 50000, REMOTE, 443, b"");
        let start = Instant::now();

        assert_eq!(h.pipeline.judge_packet(&packet, start), Verdict::Repeat);
        assert_eq!(h.requests.len(), 1);
        for secs in 1..300 {
            let now = start + Duration::from_secs(secs);
            assert_eq!(h.pipeline.judge_packet(&packet, now), Verdict::Repeat);
            h.pipeline.sweep_at(now);
        }
        assert_eq!(h.pipeline.pending_len(), 1);

        let now = start + Duration::from_secs(300);
        assert_eq!(h.pipeline.judge_packet(&packet, now), Verdict::Deny);
        assert_eq!(h.pipeline.pending_len(), 0);
        assert_eq!(
            *h.lines.lock(),
            ["deny tcp | localhost:50000 -> 93.184.216.34:443 4242 /usr/bin/curl -s example.com"]
        );
    }

    #[test]
    fn deferred_connection_logs_one_line() {
        let h = Harness::new("");
        h.curl_connects(50000, REMOTE, 443);
        let packet = tcp4(LOCAL, 50000, REMOTE, 443, b"");

        for _ in 0..5 {
            assert_eq!(h.pipeline.judge(&packet), Verdict::Repeat);
        }
        assert!(h.lines.lock().is_empty());

        h.answer(&["forever no allow yes"]);
        assert_eq!(h.pipeline.judge(&packet), Verdict::Allow);
        assert_eq!(
            *h.lines.lock(),
            ["allow tcp | localhost:50000 -> 93.184.216.34:443 4242 /usr/bin/curl -s example.com"]
        );
        assert_eq!(h.pipeline.stats().snapshot().repeated, 5);

        // Each later packet of an allowed connection is its own attempt
        assert_eq!(h.pipeline.judge(&packet), Verdict::Allow);
        assert_eq!(h.lines.lock().len(), 2);
    }

    #[test]
    fn inbound_dns_and_untracked_protocols_are_not_logged() {
        let h = Harness::new("allow 1.1.1.1 53 udp\n");
        let answer = udp4([1, 1, 1, 1], 53, LOCAL, 40000, &response(vec![a("example.com.", REMOTE)]));

        assert_eq!(h.pipeline.judge(&answer), Verdict::Allow);
        assert_eq!(h.pipeline.judge(&raw4(LOCAL, REMOTE, 1)), Verdict::Allow);
        assert_eq!(h.pipeline.judge(&raw4(REMOTE, LOCAL, 47)), Verdict::Allow);
        assert_eq!(h.pipeline.judge(&[0x45, 0x00]), Verdict::Allow);
        assert!(h.lines.lock().is_empty());

        assert_eq!(h.pipeline.judge(&udp4(LOCAL, 40000, [1, 1, 1, 1], 53, b"")), Verdict::Allow);
        assert_eq!(*h.lines.lock(), ["allow udp | localhost:40000 -> 1.1.1.1:53 - - -"]);
    }
}
