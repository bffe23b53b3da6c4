//! Background workers
//!
//! A firewall that keeps running with one of its helpers dead is worse than
//! one that is down, so every worker is fatal to the whole process when it
//! returns, fails or panics.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::error;

/// Spawn a named worker thread. The body is expected to loop forever.
pub fn spawn<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let worker = name.to_string();
    thread::Builder::new()
        .name(worker.clone())
        .spawn(move || {
            match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(Ok(())) => error!("FATAL {} exited prematurely", worker),
                Ok(Err(e)) => error!("FATAL {} failed: {:#}", worker, e),
                Err(_) => error!("FATAL {} panicked", worker),
            }
            std::process::exit(1);
        })
        .with_context(|| format!("failed to spawn worker {}", name))
}
