//! Interactive prompt bridge
//!
//! Connections without a rule are queued here. A single worker asks the
//! desktop user about each one through an external prompt program, turns the
//! answer into a rule and records the resulting action for the pipeline to
//! pick up on the packet's next pass.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::config::PromptConfig;
use crate::conn::Connection;
use crate::error::PromptError;
use crate::process::{Owner, ProcessMeta};
use crate::rules::{subdomain_wildcard, Action, DurationSpec, Port, RuleKey, RuleProto, RuleStore, Side, Transport};

const QUEUE_SIZE: usize = 1024;
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Something that can put a question to the user and return the raw answer.
pub trait Prompter: Send + Sync {
    fn ask(&self, text: &str) -> Result<String, PromptError>;
}

/// Runs the prompt program on the user's display via `su`.
pub struct CommandPrompter {
    user: String,
    display: String,
    program: String,
    timeout: Duration,
}

impl CommandPrompter {
    pub fn new(config: &PromptConfig) -> Result<Self> {
        let user = match &config.user {
            Some(user) => user.clone(),
            None => only_user(Path::new("/home"))?,
        };
        info!("Prompting as user {} on display {}", user, config.display);
        Ok(Self {
            user,
            display: config.display.clone(),
            program: config.program.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

impl Prompter for CommandPrompter {
    fn ask(&self, text: &str) -> Result<String, PromptError> {
        let script = format!("DISPLAY={} {} {}", self.display, self.program, shell_quote(text));
        let mut cmd = Command::new("su");
        cmd.arg(&self.user).arg("-c").arg(script);
        run_prompt(cmd, self.timeout)
    }
}

/// Run `cmd` and return its stdout, killing it once `timeout` has passed.
pub fn run_prompt(mut cmd: Command, timeout: Duration) -> Result<String, PromptError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(PromptError::Spawn)?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait().map_err(PromptError::Spawn)? {
            break status;
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                warn!("Failed to kill prompt {}: {}", child.id(), e);
            }
            let _ = child.wait();
            return Err(PromptError::Timeout(timeout));
        }
        thread::sleep(WAIT_POLL);
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_string(&mut stdout).map_err(PromptError::Spawn)?;
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr);
    }

    if !status.success() {
        return Err(PromptError::Failed {
            status,
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(stdout)
}

/// The single user with a home directory under `home`.
pub fn only_user(home: &Path) -> Result<String> {
    let users: Vec<String> = fs::read_dir(home)
        .with_context(|| format!("failed to list {}", home.display()))?
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();

    match users.as_slice() {
        [user] => Ok(user.clone()),
        [] => bail!("no user under {}, set prompt.user in the config", home.display()),
        _ => bail!(
            "several users under {} ({}), set prompt.user in the config",
            home.display(),
            users.join(", ")
        ),
    }
}

/// Quote `s` as a single shell word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The four tokens a prompt answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer {
    pub duration: DurationSpec,
    /// Cover every subdomain of the registrable domain.
    pub subdomains: bool,
    pub action: Action,
    /// Only the connection's port rather than all ports.
    pub this_port: bool,
}

fn yes_no(token: &str) -> Result<bool, String> {
    match token {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(format!("expected yes or no, got {:?}", other)),
    }
}

impl FromStr for Answer {
    type Err = PromptError;

    fn from_str(output: &str) -> Result<Self, Self::Err> {
        let bad = |reason: String| PromptError::BadAnswer {
            output: output.to_string(),
            reason,
        };
        let tokens: Vec<&str> = output.split_whitespace().collect();
        let [duration, subdomains, action, ports] = tokens[..] else {
            return Err(bad(format!("expected 4 tokens, got {}", tokens.len())));
        };

        Ok(Answer {
            duration: duration.parse::<DurationSpec>().map_err(|e| bad(e.to_string()))?,
            subdomains: yes_no(subdomains).map_err(bad)?,
            action: action.parse::<Action>().map_err(|e| bad(e.to_string()))?,
            this_port: yes_no(ports).map_err(bad)?,
        })
    }
}

impl Answer {
    /// The rule key this answer creates for one side of `conn`.
    pub fn key(&self, conn: &Connection, transport: Transport, side: Side) -> RuleKey {
        let host = match side {
            Side::Destination => &conn.dst,
            Side::Source => &conn.src,
        };
        let dst = if self.subdomains {
            subdomain_wildcard(host)
        } else {
            host.clone()
        };
        let port = match (self.this_port, conn.dst_port) {
            (true, Some(port)) => Port::Num(port),
            _ => Port::Any,
        };
        RuleKey::new(dst, port, RuleProto::new(transport, side))
    }
}

/// A connection waiting for the user, with resolved hosts.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub conn: Connection,
    pub dst_is_local: bool,
    pub meta: Option<ProcessMeta>,
}

/// Prompt text for one side of a request.
pub fn describe(req: &PromptRequest, transport: Transport, side: Side) -> String {
    let conn = &req.conn;
    let port = |p: Option<u16>| p.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
    format!(
        "{} | {}:{} -> {}:{} {}",
        RuleProto::new(transport, side),
        conn.src,
        port(conn.src_port),
        conn.dst,
        port(conn.dst_port),
        Owner(req.meta.as_ref())
    )
}

pub struct PromptBridge {
    queue: Sender<PromptRequest>,
    queued: Mutex<HashSet<Connection>>,
    decisions: Mutex<HashMap<Connection, (Action, Instant)>>,
}

impl PromptBridge {
    pub fn new() -> (Self, Receiver<PromptRequest>) {
        let (tx, rx) = bounded(QUEUE_SIZE);
        let bridge = Self {
            queue: tx,
            queued: Mutex::new(HashSet::new()),
            decisions: Mutex::new(HashMap::new()),
        };
        (bridge, rx)
    }

    /// Queue `req` unless its connection is already queued or decided.
    /// Returns false when the queue is full.
    pub fn enqueue(&self, req: PromptRequest) -> bool {
        if self.decisions.lock().contains_key(&req.conn) {
            return true;
        }
        let mut queued = self.queued.lock();
        if queued.contains(&req.conn) {
            return true;
        }
        let conn = req.conn.clone();
        match self.queue.try_send(req) {
            Ok(()) => {
                queued.insert(conn);
                true
            }
            Err(e) => {
                warn!("Prompt queue rejected {}: {}", conn, e);
                false
            }
        }
    }

    /// Claim the user's decision for `conn`, if one was made.
    pub fn take_decision(&self, conn: &Connection) -> Option<Action> {
        self.decisions.lock().remove(conn).map(|(action, _)| action)
    }

    /// Drop any state for a connection the pipeline gave up on.
    pub fn forget(&self, conn: &Connection) {
        self.decisions.lock().remove(conn);
    }

    /// Drop decisions nobody claimed within `ttl`.
    pub fn sweep_at(&self, now: Instant, ttl: Duration) -> usize {
        let mut decisions = self.decisions.lock();
        let before = decisions.len();
        decisions.retain(|_, &mut (_, at)| now.saturating_duration_since(at) < ttl);
        before - decisions.len()
    }

    /// Connections queued or decided but not yet claimed.
    pub fn len(&self) -> usize {
        self.queued.lock().len() + self.decisions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decide `req`, prompting for each side that still lacks a rule.
    ///
    /// Rules are matched again first since one may have been added while the
    /// request sat in the queue. A failed prompt denies without storing a rule.
    pub fn decide(&self, req: &PromptRequest, rules: &RuleStore, prompter: &dyn Prompter) -> Action {
        let Some(transport) = Transport::of(req.conn.proto) else {
            return Action::Allow;
        };
        let mut sides = vec![Side::Destination];
        if req.dst_is_local {
            sides.push(Side::Source);
        }

        for side in sides {
            if let Some(rule) = rules.match_side(&req.conn, side) {
                if rule.action == Action::Deny {
                    return Action::Deny;
                }
                continue;
            }

            let text = describe(req, transport, side);
            let answer = match prompter.ask(&text).and_then(|out| out.parse::<Answer>()) {
                Ok(answer) => answer,
                Err(e) => {
                    error!("Failed to prompt for {}: {}", text, e);
                    return Action::Deny;
                }
            };

            let key = answer.key(&req.conn, transport, side);
            if let Err(e) = rules.add(answer.action, answer.duration, key) {
                error!("Failed to store rule for {}: {:#}", text, e);
            }
            if answer.action == Action::Deny {
                return Action::Deny;
            }
        }
        Action::Allow
    }

    fn finish(&self, conn: Connection, action: Action) {
        // Publish before unqueueing so a concurrent enqueue never re-prompts
        self.decisions.lock().insert(conn.clone(), (action, Instant::now()));
        self.queued.lock().remove(&conn);
    }

    /// Handle queued requests one at a time, forever.
    pub fn run(&self, requests: Receiver<PromptRequest>, rules: &RuleStore, prompter: &dyn Prompter) -> Result<()> {
        while let Ok(req) = requests.recv() {
            let action = self.decide(&req, rules, prompter);
            self.finish(req.conn, action);
        }
        Ok(())
    }

    /// Handle whatever is queued right now without blocking.
    pub fn drain(&self, requests: &Receiver<PromptRequest>, rules: &RuleStore, prompter: &dyn Prompter) -> usize {
        let mut handled = 0;
        for req in requests.try_iter() {
            let action = self.decide(&req, rules, prompter);
            self.finish(req.conn, action);
            handled += 1;
        }
        handled
    }
}
