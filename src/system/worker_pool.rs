//! Bounded pool of cluster workers.
//!
//! Jobs are queued on a crossbeam channel before the workers start; each
//! worker drains the queue until it is empty and then exits. Workers are
//! scoped threads, so they may borrow the run's components.

use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::error::Result;

use super::messages::{ClusterDone, ClusterJob};

/// Run `handler` over every job on `workers` threads and collect the results.
///
/// Returns once every worker has joined. The result order is unspecified.
pub fn run_cluster_jobs<F>(workers: usize, jobs: Vec<ClusterJob>, handler: F) -> Result<Vec<ClusterDone>>
where
    F: Fn(ClusterJob) -> ClusterDone + Sync,
{
    let total = jobs.len();
    let workers = workers.clamp(1, total.max(1));
    let (job_tx, job_rx) = unbounded::<ClusterJob>();
    let (done_tx, done_rx) = unbounded::<ClusterDone>();
    for job in jobs {
        // The receiver is alive until the end of this function.
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    info!("Processing {} clusters on {} workers", total, workers);
    let handler = &handler;
    thread::scope(|scope| -> Result<()> {
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            thread::Builder::new()
                .name(format!("cluster-worker-{}", worker))
                .spawn_scoped(scope, move || worker_loop(worker, job_rx, done_tx, handler))?;
        }
        Ok(())
    })?;
    drop(done_tx);

    Ok(done_rx.try_iter().collect())
}

fn worker_loop<F>(worker: usize, jobs: Receiver<ClusterJob>, done: Sender<ClusterDone>, handler: &F)
where
    F: Fn(ClusterJob) -> ClusterDone,
{
    debug!("Worker {} started", worker);
    let mut processed = 0;
    // The queue is closed before workers start, so recv fails once it is drained.
    while let Ok(job) = jobs.recv() {
        let _ = done.send(handler(job));
        processed += 1;
    }
    debug!("Worker {} exiting after {} clusters", worker, processed);
}
