//! appwall daemon
//!
//! Wires the stores, the trace helpers and the prompt worker together and
//! runs the netfilter queue loop on the main thread.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info};

use appwall::config::{self, ConfigManager, CONFIG_PATH};
use appwall::dns::{self, DnsStore};
use appwall::netfilter::KernelQueue;
use appwall::pipeline::{Pipeline, Settings, Stores};
use appwall::process::{self, ProcSocketTable, SocketTable};
use appwall::prompt::{CommandPrompter, PromptBridge};
use appwall::rule_watcher::RuleWatcher;
use appwall::rules::RuleStore;
use appwall::trace::TraceStore;
use appwall::{trace_source, worker};

/// Per-application firewall daemon.
#[derive(Parser, Debug)]
#[command(name = "appwalld", version, about = "Per-application firewall using Netfilter Queue")]
struct Cli {
    /// JSON configuration file.
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Override the permanent rules file from the config.
    #[arg(short = 'r', long = "rules", value_name = "PATH")]
    rules: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()) {
        error!("FATAL {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    info!("appwall daemon starting...");

    // SAFETY: geteuid has no preconditions
    if unsafe { libc::geteuid() } != 0 {
        bail!("must run as root");
    }

    let manager = ConfigManager::new(&cli.config);
    if let Some(rules) = cli.rules {
        manager.set_rules_file(rules);
    }
    let config = manager.get();

    let (trace, refresh_rx) = TraceStore::new(config.grace_period(), config.conn_ttl());
    let trace = Arc::new(trace);
    trace.seed(process::running_processes());

    let (dns, hosts_rx) = DnsStore::new(config.dns_dump_dir.clone());
    let dns = Arc::new(dns);
    dns.start(&config.hosts_file)?;

    let rules = Arc::new(RuleStore::load(&config)?);
    let (prompts, prompt_rx) = PromptBridge::new();
    let prompts = Arc::new(prompts);
    let prompter = CommandPrompter::new(&config.prompt)?;
    let sockets: Arc<dyn SocketTable> = Arc::new(ProcSocketTable::new());

    let pipeline = Arc::new(Pipeline::new(
        Stores {
            dns: dns.clone(),
            rules: rules.clone(),
            trace: trace.clone(),
            prompts: prompts.clone(),
            sockets: sockets.clone(),
        },
        Settings::from_config(&config, config::ephemeral_port_range()),
    ));

    let hosts_file = config.hosts_file.clone();
    worker::spawn("dns-persister", move || dns::run_persister(&hosts_file, hosts_rx))?;

    let d = dns.clone();
    worker::spawn("localhost-watcher", move || d.run_localhost_watcher())?;

    let watcher = RuleWatcher::new(rules.files(), config.temp_rules_file.clone())?;
    let r = rules.clone();
    worker::spawn("rule-watcher", move || watcher.run(&r))?;

    let p = pipeline.clone();
    worker::spawn("housekeeping", move || p.run_housekeeping())?;

    let receivers = trace_source::start(&config.trace).context("failed to start trace helpers")?;
    let t = trace.clone();
    worker::spawn("trace-consumer", move || t.run_consumer(receivers))?;

    let t = trace.clone();
    let s = sockets.clone();
    worker::spawn("listener-refresher", move || t.run_listener_refresher(s.as_ref(), refresh_rx))?;

    let b = prompts.clone();
    let r = rules.clone();
    worker::spawn("prompt", move || b.run(prompt_rx, &r, &prompter))?;

    if config.log_sizes {
        let p = pipeline.clone();
        worker::spawn("size-logger", move || p.stats().run_size_logger(|| p.sizes()))?;
    }

    KernelQueue::open(config.queue_num, pipeline)?.run();
    info!("Daemon stopped");
    Ok(())
}
