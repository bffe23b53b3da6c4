//! Rules management module
//! Matches connections against allow/deny rules keyed by destination, port and protocol.
//!
//! Rule file format, one rule per line, `#` starts a comment:
//! `<allow|deny> <dst> <port|*> <tcp|udp|tcp-src|udp-src>`

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use parking_lot::RwLock;

use crate::config::{is_regular_or_missing, Config};
use crate::conn::{Connection, Proto};
use crate::error::RuleParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    Deny,
}

impl FromStr for Action {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            other => Err(RuleParseError::Action(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => f.write_str("allow"),
            Action::Deny => f.write_str("deny"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Any,
    Num(u16),
}

impl FromStr for Port {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Port::Any);
        }
        s.parse::<u16>()
            .map(Port::Num)
            .map_err(|_| RuleParseError::Port(s.to_string()))
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Any => f.write_str("*"),
            Port::Num(n) => write!(f, "{}", n),
        }
    }
}

/// Transport protocols rules can be written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn of(proto: Proto) -> Option<Self> {
        match proto {
            Proto::Tcp => Some(Transport::Tcp),
            Proto::Udp => Some(Transport::Udp),
            Proto::Other(_) => None,
        }
    }
}

/// Which end of a connection a rule names.
///
/// Destination rules name the host being connected to. Source rules only
/// exist for connections to a local service and name the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Destination,
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleProto {
    pub transport: Transport,
    pub side: Side,
}

impl RuleProto {
    pub fn new(transport: Transport, side: Side) -> Self {
        Self { transport, side }
    }
}

impl FromStr for RuleProto {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transport, side) = match s {
            "tcp" => (Transport::Tcp, Side::Destination),
            "udp" => (Transport::Udp, Side::Destination),
            "tcp-src" => (Transport::Tcp, Side::Source),
            "udp-src" => (Transport::Udp, Side::Source),
            other => return Err(RuleParseError::Proto(other.to_string())),
        };
        Ok(Self { transport, side })
    }
}

impl fmt::Display for RuleProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match (self.transport, self.side) {
            (Transport::Tcp, Side::Destination) => "tcp",
            (Transport::Udp, Side::Destination) => "udp",
            (Transport::Tcp, Side::Source) => "tcp-src",
            (Transport::Udp, Side::Source) => "udp-src",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub dst: String,
    pub port: Port,
    pub proto: RuleProto,
}

impl RuleKey {
    pub fn new(dst: impl Into<String>, port: Port, proto: RuleProto) -> Self {
        Self {
            dst: dst.into(),
            port,
            proto,
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.dst, self.port, self.proto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Applied to a single decision and never stored.
    Once,
    Timed { ttl: Duration, start: Instant },
    /// Backed by a rule file line.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleValue {
    pub action: Action,
    pub lifetime: Lifetime,
}

impl RuleValue {
    pub fn permanent(action: Action) -> Self {
        Self {
            action,
            lifetime: Lifetime::Permanent,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.lifetime {
            Lifetime::Timed { ttl, start } => now.saturating_duration_since(start) > ttl,
            Lifetime::Once | Lifetime::Permanent => false,
        }
    }
}

/// How long a newly decided rule should live.
///
/// ```
/// use std::time::Duration;
/// use appwall::rules::DurationSpec;
///
/// assert_eq!("5-minute".parse::<DurationSpec>(), Ok(DurationSpec::Timed(Duration::from_secs(300))));
/// assert_eq!("forever".parse::<DurationSpec>(), Ok(DurationSpec::Forever));
/// assert!("5-days".parse::<DurationSpec>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationSpec {
    Once,
    Timed(Duration),
    Forever,
}

impl FromStr for DurationSpec {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || RuleParseError::Duration(s.to_string());
        match s {
            "once" => return Ok(DurationSpec::Once),
            "forever" => return Ok(DurationSpec::Forever),
            _ => {}
        }

        let (amount, unit) = s.split_once('-').ok_or_else(bad)?;
        let amount: u64 = amount.parse().map_err(|_| bad())?;
        let unit_secs = match unit {
            "minute" | "minutes" => 60,
            "hour" | "hours" => 60 * 60,
            _ => return Err(bad()),
        };
        amount
            .checked_mul(unit_secs)
            .map(|secs| DurationSpec::Timed(Duration::from_secs(secs)))
            .ok_or_else(bad)
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationSpec::Once => f.write_str("once"),
            DurationSpec::Forever => f.write_str("forever"),
            DurationSpec::Timed(d) if d.as_secs() % 3600 == 0 => write!(f, "{}-hour", d.as_secs() / 3600),
            DurationSpec::Timed(d) => write!(f, "{}-minute", d.as_secs() / 60),
        }
    }
}

/// One parsed rule file line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub key: RuleKey,
}

impl FromStr for Rule {
    type Err = RuleParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [action, dst, port, proto] = fields[..] else {
            return Err(RuleParseError::FieldCount(fields.len()));
        };

        Ok(Rule {
            action: action.parse()?,
            key: RuleKey::new(dst, port.parse()?, proto.parse()?),
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.key)
    }
}

/// Outcome of judging a connection against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Decided(Action),
    /// At least one required side has no rule yet.
    Missing,
}

/// `*.` followed by the last two labels of `host`.
pub fn subdomain_wildcard(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    let start = labels.len().saturating_sub(2);
    format!("*.{}", labels[start..].join("."))
}

/// Keys that may govern `dst`/`port`, most specific first.
pub fn candidate_keys(dst: &str, port: u16, proto: RuleProto) -> Vec<RuleKey> {
    let exact = Port::Num(port);
    let wildcard = subdomain_wildcard(dst);
    let mut keys = vec![
        RuleKey::new(dst, exact, proto),
        RuleKey::new(dst, Port::Any, proto),
        RuleKey::new(wildcard.clone(), exact, proto),
        RuleKey::new(wildcard, Port::Any, proto),
    ];

    if let Ok(addr) = dst.parse::<Ipv4Addr>() {
        let [a, b, c, _] = addr.octets();
        let prefixes = [
            format!("{}.{}.{}.*", a, b, c),
            format!("{}.{}.*.*", a, b),
            format!("{}.*.*.*", a),
        ];
        for port in [exact, Port::Any] {
            for prefix in &prefixes {
                keys.push(RuleKey::new(prefix.as_str(), port, proto));
            }
        }
    }
    keys
}

/// Strip the comment and surrounding whitespace from a rule file line.
fn rule_text(line: &str) -> Option<&str> {
    let text = line.split('#').next().unwrap_or("").trim();
    (!text.is_empty()).then_some(text)
}

pub struct RuleStore {
    rules: RwLock<HashMap<RuleKey, RuleValue>>,
    rules_file: PathBuf,
    extra_files: Vec<PathBuf>,
}

impl RuleStore {
    pub fn new(rules_file: PathBuf, extra_files: Vec<PathBuf>) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            rules_file,
            extra_files,
        }
    }

    /// Create the store for `config` and load every rule file once.
    pub fn load(config: &Config) -> Result<Self> {
        let store = Self::new(config.rules_file.clone(), config.extra_rules_files.clone());
        store.reconcile()?;
        info!("Loaded {} rules from {}", store.len(), store.rules_file.display());
        Ok(store)
    }

    pub fn rules_file(&self) -> &Path {
        &self.rules_file
    }

    /// Every file permanent rules are read from, primary last.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files = self.extra_files.clone();
        files.push(self.rules_file.clone());
        files
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    pub fn get(&self, key: &RuleKey) -> Option<RuleValue> {
        self.rules.read().get(key).copied()
    }

    /// The most specific live rule for `dst`/`port`/`proto`.
    pub fn lookup(&self, dst: &str, port: u16, proto: RuleProto) -> Option<RuleValue> {
        let keys = candidate_keys(dst, port, proto);
        let now = Instant::now();
        let rules = self.rules.read();
        keys.iter()
            .filter_map(|key| rules.get(key))
            .find(|value| !value.is_expired(now))
            .copied()
    }

    /// The rule governing one side of `conn`, looked up with resolved hosts.
    ///
    /// Untracked protocols always yield a permanent allow.
    pub fn match_side(&self, conn: &Connection, side: Side) -> Option<RuleValue> {
        let (Some(transport), Some(port)) = (Transport::of(conn.proto), conn.dst_port) else {
            return Some(RuleValue::permanent(Action::Allow));
        };
        let host = match side {
            Side::Destination => &conn.dst,
            Side::Source => &conn.src,
        };
        self.lookup(host, port, RuleProto::new(transport, side))
    }

    /// Judge `conn`. Connections to a local service need both a destination
    /// and a source rule to be allowed; a deny on either side decides.
    pub fn check(&self, conn: &Connection, dst_is_local: bool) -> Check {
        let mut sides = vec![Side::Destination];
        if dst_is_local && conn.proto.is_tracked() {
            sides.push(Side::Source);
        }

        let mut missing = false;
        for side in sides {
            match self.match_side(conn, side) {
                Some(RuleValue { action: Action::Deny, .. }) => return Check::Decided(Action::Deny),
                Some(_) => {}
                None => missing = true,
            }
        }

        if missing {
            Check::Missing
        } else {
            Check::Decided(Action::Allow)
        }
    }

    /// Store a freshly decided rule. `Forever` rules are also appended to the
    /// rule file; `Once` rules are not stored at all.
    pub fn add(&self, action: Action, duration: DurationSpec, key: RuleKey) -> Result<()> {
        let lifetime = match duration {
            DurationSpec::Once => return Ok(()),
            DurationSpec::Timed(ttl) => Lifetime::Timed {
                ttl,
                start: Instant::now(),
            },
            DurationSpec::Forever => Lifetime::Permanent,
        };

        let rule = Rule { action, key };
        let changed = self.insert(rule.key.clone(), RuleValue { action, lifetime });
        if changed && duration == DurationSpec::Forever {
            append_rule(&self.rules_file, &rule)?;
            info!("Added permanent rule {}", rule);
        } else if changed {
            info!("Added temporary rule {} {}", duration, rule);
        }
        Ok(())
    }

    /// Last write wins; returns whether the stored value changed.
    fn insert(&self, key: RuleKey, value: RuleValue) -> bool {
        let mut rules = self.rules.write();
        if rules.get(&key) == Some(&value) {
            return false;
        }
        debug!("Rule {} {} -> {:?}", value.action, key, value.lifetime);
        rules.insert(key, value);
        true
    }

    /// Re-read every rule file and make the permanent rules match them exactly.
    ///
    /// The resolved rule set is built off-lock and swapped in under a single
    /// write lock, so readers never see a shadowed duplicate. Returns how
    /// many rules were added, changed or removed.
    pub fn reconcile(&self) -> Result<usize> {
        let mut resolved: HashMap<RuleKey, Action> = HashMap::new();

        for path in &self.extra_files {
            match read_rule_file(path) {
                Ok(rules) => resolved.extend(rules),
                Err(e) => warn!("Skipping rule file {}: {:#}", path.display(), e),
            }
        }

        if !self.rules_file.exists() {
            create_rule_file(&self.rules_file)?;
        }
        resolved.extend(read_rule_file(&self.rules_file)?);

        let mut changes = 0;
        let mut rules = self.rules.write();
        rules.retain(|key, value| {
            let stale = value.lifetime == Lifetime::Permanent && !resolved.contains_key(key);
            if stale {
                info!("Removed rule {} {}", value.action, key);
                changes += 1;
            }
            !stale
        });
        for (key, action) in resolved {
            let value = RuleValue::permanent(action);
            match rules.insert(key.clone(), value) {
                None => info!("Added rule {} {}", action, key),
                Some(old) if old != value => info!("Changed rule {} {} -> {}", old.action, key, action),
                Some(_) => continue,
            }
            changes += 1;
        }
        Ok(changes)
    }

    /// Drop timed rules that have expired by `now`. Returns how many went.
    pub fn gc_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.rules.write().retain(|key, value| {
            let expired = value.is_expired(now);
            if expired {
                info!("GC expired rule {} {}", value.action, key);
                removed += 1;
            }
            !expired
        });
        removed
    }

    pub fn gc(&self) -> usize {
        self.gc_at(Instant::now())
    }

    /// Consume a drop file of `<N>-minute|<N>-hour <rule>` lines as timed rules.
    ///
    /// The file is renamed before reading so lines appended meanwhile land in
    /// a fresh file. Returns the number of rules applied.
    pub fn apply_temp_rules(&self, path: &Path) -> Result<usize> {
        let claimed = path.with_extension(format!("applying.{}", std::process::id()));
        match fs::rename(path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("failed to claim {}", path.display())),
        }

        let content = fs::read_to_string(&claimed);
        fs::remove_file(&claimed).with_context(|| format!("failed to remove {}", claimed.display()))?;
        let content = content.with_context(|| format!("failed to read {}", claimed.display()))?;

        let mut applied = 0;
        for line in content.lines().filter_map(rule_text) {
            match parse_temp_rule(line) {
                Ok((ttl, rule)) => {
                    self.add(rule.action, DurationSpec::Timed(ttl), rule.key)?;
                    applied += 1;
                }
                Err(e) => warn!("Bad temp rule {:?}: {}", line, e),
            }
        }
        Ok(applied)
    }
}

fn parse_temp_rule(line: &str) -> Result<(Duration, Rule), RuleParseError> {
    let (duration, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    match duration.parse::<DurationSpec>()? {
        DurationSpec::Timed(ttl) => Ok((ttl, rest.parse::<Rule>()?)),
        _ => Err(RuleParseError::Duration(duration.to_string())),
    }
}

/// Parse a rule file. A line nearer the top wins over later lines with the same key.
fn read_rule_file(path: &Path) -> Result<HashMap<RuleKey, Action>> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;

    let mut rules = HashMap::new();
    for line in content.lines().filter_map(rule_text) {
        match line.parse::<Rule>() {
            Ok(rule) => {
                rules.entry(rule.key).or_insert(rule.action);
            }
            Err(e) => error!("Invalid rule {:?} in {}: {}", line, path.display(), e),
        }
    }
    Ok(rules)
}

fn create_rule_file(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    info!("Created empty rules file {}", path.display());
    Ok(())
}

fn append_rule(path: &Path, rule: &Rule) -> Result<()> {
    // Refuse to follow a symlink planted in place of the rules file
    if !is_regular_or_missing(path) {
        anyhow::bail!("refusing to write rules to non-regular file {}", path.display());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{}", rule).with_context(|| format!("failed to append to {}", path.display()))
}
