//! Worker reactor threads.

use std::io;
use std::thread::{self, JoinHandle};

use reactor::{Handle, Reactor};

/// A worker reactor running on its own thread.
pub struct Worker {
    pub handle: Handle,
    pub join: JoinHandle<()>,
}

/// Spawn `count` worker reactors, returning their handles once every loop
/// is constructed.
pub fn spawn_workers(count: usize) -> io::Result<Vec<Worker>> {
    let mut workers = Vec::with_capacity(count);
    for worker_id in 0..count {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let join = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                let reactor = match Reactor::new() {
                    Ok(reactor) => reactor,
                    Err(e) => {
                        tracing::error!(worker_id, "failed to create worker reactor: {e}");
                        return;
                    }
                };
                tx.send(reactor.handle()).expect("spawner went away");
                if let Err(e) = reactor.run() {
                    tracing::error!(worker_id, "worker reactor failed: {e}");
                }
            })?;
        let handle = rx
            .recv()
            .map_err(|_| io::Error::other("worker reactor failed to start"))?;
        workers.push(Worker { handle, join });
    }
    Ok(workers)
}

/// Stop every worker loop and wait for the threads to exit.
pub fn join_workers(workers: Vec<Worker>) {
    for worker in &workers {
        worker.handle.shutdown();
    }
    for worker in workers {
        let _ = worker.join.join();
    }
}
