//! Trace helper processes
//! Spawns the line-oriented kernel trace helpers and tails their output into
//! the correlator's channels. Any helper dying takes the daemon down with it.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Sender};
use log::{info, warn};

use crate::config::TraceConfig;
use crate::trace::{EventKind, TraceEvent, TraceReceivers};
use crate::worker;

const QUEUE_SIZE: usize = 64 * 1024;
const FATAL_PREFIX: &str = "fatal error:";

/// Start every helper in `config` and return the channels they feed.
/// TCP and UDP connection events share one channel.
pub fn start(config: &TraceConfig) -> Result<TraceReceivers> {
    let (connect_tx, connect) = bounded(QUEUE_SIZE);
    let (fork_tx, fork) = bounded(QUEUE_SIZE);
    let (exit_tx, exit) = bounded(QUEUE_SIZE);
    let (exec_tx, exec) = bounded(QUEUE_SIZE);

    let sources = [
        ("trace-tcp", &config.tcp, EventKind::Connect, connect_tx.clone()),
        ("trace-udp", &config.udp, EventKind::Connect, connect_tx),
        ("trace-fork", &config.fork, EventKind::Fork, fork_tx),
        ("trace-exit", &config.exit, EventKind::Exit, exit_tx),
        ("trace-exec", &config.exec, EventKind::Exec, exec_tx),
    ];
    for (name, argv, kind, tx) in sources {
        spawn_source(name, argv, kind, tx)?;
    }

    Ok(TraceReceivers {
        connect,
        fork,
        exit,
        exec,
    })
}

fn spawn_source(name: &'static str, argv: &[String], kind: EventKind, tx: Sender<TraceEvent>) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .with_context(|| format!("empty command line for {}", name))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {} ({})", name, program))?;
    info!("Started {} as pid {}: {}", name, child.id(), argv.join(" "));

    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;

    worker::spawn(name, move || tail(name, kind, BufReader::new(stdout), &tx))?;
    worker::spawn(&format!("{}-stderr", name), move || tail_stderr(name, BufReader::new(stderr)))?;
    worker::spawn(&format!("{}-monitor", name), move || {
        let status = child.wait().with_context(|| format!("failed to wait for {}", name))?;
        bail!("{} exited with {}", name, status)
    })?;
    Ok(())
}

/// Read one line as bytes, returning `None` at end of stream.
fn next_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<()>> {
    buf.clear();
    let n = reader.read_until(b'\n', buf)?;
    Ok((n > 0).then_some(()))
}

/// Forward parsed events from `reader` to `tx` until the stream ends.
/// Malformed and non UTF-8 lines are skipped; a fatal line or the end of the
/// stream is an error.
pub fn tail<R: BufRead>(name: &str, kind: EventKind, mut reader: R, tx: &Sender<TraceEvent>) -> Result<()> {
    info!("Tailing {}", name);
    let mut buf = Vec::new();
    while next_line(&mut reader, &mut buf)?.is_some() {
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim_end(),
            Err(_) => {
                warn!("Failed to utf-8 decode {} line {:?}", name, String::from_utf8_lossy(&buf));
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        if line.starts_with(FATAL_PREFIX) {
            bail!("{} {}", name, line);
        }

        match TraceEvent::parse(kind, line) {
            Ok(event) => tx.send(event).with_context(|| format!("{} consumer is gone", name))?,
            Err(e) => warn!("Bad {} line {:?}: {}", name, line, e),
        }
    }
    bail!("{} closed its output", name)
}

fn tail_stderr<R: BufRead>(name: &str, mut reader: R) -> Result<()> {
    let mut buf = Vec::new();
    while next_line(&mut reader, &mut buf)?.is_some() {
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        if line.starts_with(FATAL_PREFIX) {
            bail!("{} {}", name, line);
        }
        if !line.is_empty() {
            warn!("{}: {}", name, line);
        }
    }
    bail!("{} closed its error output", name)
}
