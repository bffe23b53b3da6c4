//! Netfilter queue binding
//! Feeds every queued packet through the pipeline and hands the verdict back
//! to the kernel.

use std::sync::Arc;

use anyhow::{bail, Result};
use log::{debug, info};
use nfqueue::{CopyMode, Message, Queue};

use crate::pipeline::{Pipeline, Verdict};

/// Mark carried by denied packets. An iptables rule matching it rejects
/// them, so the application sees a refused connection instead of a timeout.
pub const REJECT_MARK: u32 = 101285;

const COPY_RANGE: u32 = 0xFFFF;

/// How a pipeline verdict is expressed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelVerdict {
    Accept,
    AcceptMarked(u32),
    Repeat,
}

impl From<Verdict> for KernelVerdict {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Allow => KernelVerdict::Accept,
            Verdict::Deny => KernelVerdict::AcceptMarked(REJECT_MARK),
            Verdict::Repeat => KernelVerdict::Repeat,
        }
    }
}

fn packet_handler(msg: &Message, pipeline: &mut Arc<Pipeline>) {
    let payload = msg.get_payload();
    match KernelVerdict::from(pipeline.judge(payload)) {
        KernelVerdict::Accept => msg.set_verdict(nfqueue::Verdict::Accept),
        KernelVerdict::AcceptMarked(mark) => msg.set_verdict_full(nfqueue::Verdict::Accept, mark, payload),
        KernelVerdict::Repeat => msg.set_verdict(nfqueue::Verdict::Repeat),
    }
}

pub struct KernelQueue {
    queue: Queue<Arc<Pipeline>>,
    num: u16,
}

impl KernelQueue {
    /// Bind queue `num` for IPv4 and IPv6 and route its packets to `pipeline`.
    pub fn open(num: u16, pipeline: Arc<Pipeline>) -> Result<Self> {
        let mut queue = Queue::new(pipeline);
        queue.open();

        for (family, name) in [(libc::AF_INET, "AF_INET"), (libc::AF_INET6, "AF_INET6")] {
            if queue.unbind(family) != 0 {
                debug!("Unbind {} returned non-zero (first run?)", name);
            }
            if queue.bind(family) != 0 {
                queue.close();
                bail!("failed to bind {}", name);
            }
        }

        queue.create_queue(num, packet_handler);
        queue.set_mode(CopyMode::CopyPacket, COPY_RANGE);
        info!("Listening on NFQUEUE {}", num);

        Ok(Self { queue, num })
    }

    /// Process packets until the queue is torn down.
    pub fn run(mut self) {
        info!("Ready to process packets!");
        self.queue.run_loop();
        info!("NFQUEUE {} stopped", self.num);
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_is_an_accept_with_the_reject_mark() {
        assert_eq!(KernelVerdict::from(Verdict::Allow), KernelVerdict::Accept);
        assert_eq!(KernelVerdict::from(Verdict::Deny), KernelVerdict::AcceptMarked(REJECT_MARK));
        assert_eq!(KernelVerdict::from(Verdict::Repeat), KernelVerdict::Repeat);
    }
}
