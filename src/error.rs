//! Error types shared across the daemon.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Reasons a queued packet could not be decoded into a connection.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("unsupported IP version {0}")]
    Version(u8),

    #[error("malformed {layer} header: {reason}")]
    Malformed { layer: &'static str, reason: String },
}

/// A line of a rule file that could not be turned into a rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("expected \"action dst dst_port proto\", got {0} fields")]
    FieldCount(usize),

    #[error("ports should be numbers or *, was {0}")]
    Port(String),

    #[error("bad proto, should be one of tcp, udp, tcp-src, udp-src, was {0}")]
    Proto(String),

    #[error("bad action, should be one of allow, deny, was {0}")]
    Action(String),

    #[error("bad duration, should be once, <N>-minute, <N>-hour or forever, was {0}")]
    Duration(String),
}

/// A trace line that does not match the shape its source promises.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceLineError {
    #[error("expected at least {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },

    #[error("bad {field}: {value}")]
    Number { field: &'static str, value: String },
}

/// Failures of the interactive prompt collaborator.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to run prompt program: {0}")]
    Spawn(#[source] io::Error),

    #[error("prompt program exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    #[error("unexpected prompt output {output:?}: {reason}")]
    BadAnswer { output: String, reason: String },

    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

/// The correlator has no owner for a connection yet.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection owner not known yet")]
pub struct NotFound;
