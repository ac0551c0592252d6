//! Worker hand-off
//!
//! The session and its tree are confined to one thread. Data computations
//! can run elsewhere: their inputs are snapshotted on the meta thread, the
//! operator runs on a worker and the outcome comes back as a [`Commit`]
//! that the meta thread publishes when it drains the queue.

use crate::controller::{DcId, DcState};
use crate::data::Column;
use crate::error::{CalcError, Result};
use crate::session::Session;
use crate::suspend::NoSuspend;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outcome of a worker computation, waiting to be published
#[derive(Debug)]
pub struct Commit {
    /// Controller the computation was for
    pub dc: DcId,
    /// Payload or the failure of the operator
    pub outcome: std::result::Result<Column, CalcError>,
    /// Time the worker spent
    pub elapsed: Duration,
    pub(crate) fingerprint: Option<crate::cache::CacheKey>,
}

/// Commits posted by workers, drained by the meta thread
#[derive(Debug, Clone, Default)]
pub struct MetaQueue {
    inner: Arc<(Mutex<VecDeque<Commit>>, Condvar)>,
}

impl MetaQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a finished computation to the meta thread
    pub fn post(&self, commit: Commit) {
        let (lock, ready) = &*self.inner;
        lock.lock().push_back(commit);
        ready.notify_all();
    }

    /// Take every queued commit, oldest first
    pub fn drain(&self) -> Vec<Commit> {
        self.inner.0.lock().drain(..).collect()
    }

    /// Block until something is queued or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, ready) = &*self.inner;
        let mut queue = lock.lock();
        if queue.is_empty() {
            ready.wait_for(&mut queue, timeout);
        }
        !queue.is_empty()
    }

    /// Number of commits waiting
    pub fn len(&self) -> usize {
        self.inner.0.lock().len()
    }

    /// Nothing waiting?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Session {
    /// Compute `dc` on a worker thread
    ///
    /// Arguments are computed here first. Returns `None` when the data is
    /// already available or a computation is already in flight.
    pub fn spawn_calc(&mut self, dc: DcId) -> Result<Option<JoinHandle<()>>> {
        self.assert_owner();
        self.make_result(dc)?;
        match self.dcs.dc(dc).state {
            DcState::DataReady | DcState::DataPending => return Ok(None),
            DcState::DataFailed => return Err(self.dc_error(dc)),
            _ => {}
        }
        let args: Vec<DcId> = self.dcs.dc(dc).arg_dcs().collect();
        for arg in args {
            self.calc_dc_certain(arg)?;
        }
        if self.dcs.dc(dc).oper.is_none() {
            // sources and literals have nothing to compute
            self.calc_dc_certain(dc)?;
            return Ok(None);
        }
        let job = self.prepare_job(dc)?;
        self.dcs.dc_mut(dc).state = DcState::DataPending;
        self.pending += 1;

        let queue = self.queue.clone();
        let key = self.dcs.dc(dc).key.to_string();
        debug!(%key, "computation handed to worker");
        let handle = std::thread::Builder::new()
            .name(format!("treecalc-dc{}", dc.index()))
            .spawn(move || {
                let started = Instant::now();
                let outcome = job.run(&NoSuspend).map_err(|interrupt| match interrupt {
                    crate::error::Interrupt::Failed(error) => error,
                    crate::error::Interrupt::Suspended => CalcError::IllegalExpression {
                        message: format!("{} suspended on a worker", key),
                    },
                });
                queue.post(Commit {
                    dc,
                    outcome,
                    elapsed: started.elapsed(),
                    fingerprint: job.fingerprint,
                });
            })
            .map_err(|e| CalcError::IllegalExpression {
                message: format!("cannot start worker: {}", e),
            });
        match handle {
            Ok(handle) => Ok(Some(handle)),
            Err(error) => {
                self.pending -= 1;
                self.dcs.dc_mut(dc).state = DcState::MetaReady;
                Err(error)
            }
        }
    }

    /// Publish every queued commit; returns how many were processed
    pub fn process_meta_queue(&mut self) -> usize {
        let commits = self.queue.drain();
        if commits.is_empty() {
            return 0;
        }
        let _blocker = self.suspend.blocker();
        let n = commits.len();
        for commit in commits {
            self.pending = self.pending.saturating_sub(1);
            let live = self
                .dcs
                .get(commit.dc)
                .is_some_and(|d| d.state == DcState::DataPending);
            if !live {
                trace!(dc = ?commit.dc, "stale commit dropped");
                continue;
            }
            // the outcome is memoized on the controller either way
            let _ = self.finish_job(commit.dc, commit.fingerprint, commit.outcome, commit.elapsed);
        }
        debug!(commits = n, "meta queue processed");
        n
    }

    /// Computations handed to workers and not yet published
    pub fn pending_commits(&self) -> usize {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn posts_wake_a_waiting_reader() {
        let queue = MetaQueue::new();
        let worker = queue.clone();
        let handle = thread::spawn(move || {
            worker.post(Commit {
                dc: dummy_dc(),
                outcome: Ok(Column::Bool(vec![true])),
                elapsed: Duration::ZERO,
                fingerprint: None,
            });
        });
        let mut got = false;
        for _ in 0..100 {
            if queue.wait(Duration::from_millis(50)) {
                got = true;
                break;
            }
        }
        handle.join().unwrap();
        assert!(got);
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }

    fn dummy_dc() -> DcId {
        let mut session = Session::new();
        session.get_or_create_dc(treecalc_expr::Expr::UInt(1))
    }
}
