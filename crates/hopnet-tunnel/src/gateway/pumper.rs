//! Worker pool that flushes pumped gateways.
//!
//! Gateways with work are pushed onto one unbounded channel; each worker
//! pops a gateway, pumps one bounded batch, and requeues the gateway at the
//! back if its pre-queue is still not empty. A gateway sits in the channel
//! at most once at a time.
//!
//! With zero threads the pump runs inline on the thread that asked for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::Result;

use super::PumpedTunnelGateway;

enum PumpTask {
    Pump(Arc<PumpedTunnelGateway>),
    Stop,
}

pub struct TunnelGatewayPumper {
    tx: Sender<PumpTask>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    inline: bool,
    stopping: AtomicBool,
}

impl TunnelGatewayPumper {
    /// Start `threads` workers named `GW Pumper {i}`. Zero pumps inline.
    ///
    /// # Errors
    ///
    /// - [`crate::TunnelError::Io`] if a worker cannot be spawned
    pub fn new(threads: usize) -> Result<Arc<Self>> {
        let (tx, rx) = unbounded();
        let pumper = Arc::new(Self {
            tx: tx.clone(),
            threads: Mutex::new(Vec::with_capacity(threads)),
            inline: threads == 0,
            stopping: AtomicBool::new(false),
        });
        for i in 0..threads {
            let rx: Receiver<PumpTask> = rx.clone();
            let tx = tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("GW Pumper {i}"))
                .spawn(move || run(rx, tx))?;
            pumper
                .threads
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
        }
        if threads > 0 {
            info!(threads, "gateway pumper started");
        }
        Ok(pumper)
    }

    /// Ask for `gateway` to be pumped.
    pub fn want_pumping(&self, gateway: Arc<PumpedTunnelGateway>) {
        if self.stopping.load(Ordering::Acquire) || !gateway.mark_queued() {
            return;
        }
        if self.inline {
            loop {
                gateway.clear_queued();
                if !gateway.pump() || !gateway.mark_queued() {
                    break;
                }
            }
            return;
        }
        let _ = self.tx.send(PumpTask::Pump(gateway));
    }

    /// Stop and join every worker. Queued pumps are discarded.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for _ in 0..handles.len() {
            let _ = self.tx.send(PumpTask::Stop);
        }
        for handle in handles {
            let _ = handle.join();
        }
        debug!("gateway pumper stopped");
    }
}

fn run(rx: Receiver<PumpTask>, tx: Sender<PumpTask>) {
    while let Ok(task) = rx.recv() {
        let PumpTask::Pump(gateway) = task else {
            break;
        };
        gateway.clear_queued();
        if gateway.pump() && gateway.mark_queued() {
            let _ = tx.send(PumpTask::Pump(gateway));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_joins_workers() {
        let pumper = TunnelGatewayPumper::new(3).expect("pumper");
        assert_eq!(pumper.threads.lock().expect("lock").len(), 3);
        pumper.shutdown();
        assert!(pumper.threads.lock().expect("lock").is_empty());
        pumper.shutdown();
    }

    #[test]
    fn test_inline_mode() {
        let pumper = TunnelGatewayPumper::new(0).expect("pumper");
        assert!(pumper.inline);
        pumper.shutdown();
    }
}
