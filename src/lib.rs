//! Per-application firewall
//!
//! Packets queued by netfilter are matched against user rules keyed by
//! hostname, port and protocol. Connections without a rule are attributed to
//! the owning process through kernel trace events and put to the desktop
//! user, whose answer becomes a new rule.

pub mod config;
pub mod conn;
pub mod dns;
pub mod error;
pub mod netfilter;
pub mod pipeline;
pub mod proc_parser;
pub mod process;
pub mod prompt;
pub mod rule_watcher;
pub mod rules;
pub mod stats;
pub mod trace;
pub mod trace_source;
pub mod worker;
