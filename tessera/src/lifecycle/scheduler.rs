//! The lifecycle worker thread
//!
//! Triggers arriving within one batch window are folded into a single run
//! of the pipeline. A forced request or a shutdown closes the window early.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::{agents, Activities, Trigger};
use crate::compaction;
use crate::db::inner::{Counters, DbInner};
use crate::{Result, TesseraError};

/// Triggers gathered during one window
#[derive(Default)]
struct Batch {
    activities: Activities,
    waiters: Vec<Sender<Result<()>>>,
    repairs: Vec<(String, Sender<Result<usize>>)>,
    shutdown: bool,
}

impl Batch {
    fn add(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Opportunistic => self.activities |= Activities::POLICY,
            Trigger::Forced { activities, done } => {
                self.activities |= activities;
                self.waiters.push(done);
            }
            Trigger::Repair { table, done } => self.repairs.push((table, done)),
            Trigger::Shutdown => self.shutdown = true,
        }
    }

    /// Someone is waiting, close the window now
    fn is_urgent(&self) -> bool {
        self.shutdown || !self.waiters.is_empty() || !self.repairs.is_empty()
    }
}

struct Worker {
    inner: Arc<DbInner>,
    triggers: Receiver<Trigger>,
}

/// Start the worker for `inner`, fed by `triggers`
pub(crate) fn spawn(inner: Arc<DbInner>, triggers: Receiver<Trigger>) -> Result<JoinHandle<()>> {
    let worker = Worker { inner, triggers };
    thread::Builder::new()
        .name("tessera-lifecycle".into())
        .spawn(move || worker.run())
        .map_err(TesseraError::Io)
}

impl Worker {
    fn run(self) {
        log::debug!("lifecycle worker started");
        loop {
            let Some(batch) = self.next_batch() else {
                break;
            };
            let shutdown = batch.shutdown;
            self.process(batch);
            if shutdown {
                break;
            }
        }
        log::debug!("lifecycle worker stopped");
    }

    /// Block for the first trigger, then gather more until the window
    /// closes. `None` once every sender is gone.
    fn next_batch(&self) -> Option<Batch> {
        let mut batch = Batch::default();
        batch.add(self.triggers.recv().ok()?);

        let deadline = Instant::now() + self.inner.config.batch_window();
        while !batch.is_urgent() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.triggers.recv_timeout(deadline - now) {
                Ok(trigger) => batch.add(trigger),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    batch.shutdown = true;
                    break;
                }
            }
        }
        while let Ok(trigger) = self.triggers.try_recv() {
            batch.add(trigger);
        }
        Some(batch)
    }

    fn process(&self, batch: Batch) {
        Counters::bump(&self.inner.counters.lifecycle_batches, 1);
        if !batch.activities.is_empty() {
            log::trace!("lifecycle batch: {:?}", batch.activities);
            match agents::run(&self.inner, batch.activities) {
                Ok(()) => {
                    for done in batch.waiters {
                        let _ = done.send(Ok(()));
                    }
                }
                Err(e) => {
                    log::error!("lifecycle batch {:?} failed: {}", batch.activities, e);
                    let e = Arc::new(e);
                    if batch.waiters.is_empty() {
                        self.inner.record_fault(e);
                    } else {
                        for done in batch.waiters {
                            let _ = done.send(Err(TesseraError::Lifecycle(e.clone())));
                        }
                    }
                }
            }
        } else {
            for done in batch.waiters {
                let _ = done.send(Ok(()));
            }
        }

        for (table, done) in batch.repairs {
            let _ = done.send(compaction::repair_tombstones(&self.inner, &table));
        }
    }
}
