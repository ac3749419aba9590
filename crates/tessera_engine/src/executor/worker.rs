//! Worker threads driving task execution.
//!
//! Each node runs a fixed ring of worker threads. A task is owned by exactly
//! one worker; the owner repeatedly calls `execute` for one bounded step at a
//! time. Neighboring workers compare their measured loads after every sweep
//! and migrate a task when the difference exceeds the configured threshold.
//!
//! A task whose step fails is removed, closed, and reported to its query's
//! coordinator, which escalates the failure to a query abort. One broken
//! query never takes the worker thread down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::WorkerTask;
use crate::message::registry::TaskRegistry;
use crate::message::sender::MappingSender;

#[derive(Debug)]
pub(crate) struct WorkerState {
    index: usize,
    tasks: Mutex<Vec<Arc<dyn WorkerTask>>>,
}

impl WorkerState {
    fn new(index: usize) -> Self {
        WorkerState {
            index,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_task(&self, task: Arc<dyn WorkerTask>) {
        self.tasks.lock().push(task);
    }

    /// Sum of static estimates, used for initial placement.
    pub(crate) fn estimated_load(&self) -> u64 {
        self.tasks
            .lock()
            .iter()
            .map(|t| t.estimated_load())
            .fold(0, u64::saturating_add)
    }

    pub(crate) fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// One sweep over the owned tasks. Returns whether any task did work.
    pub(crate) fn run_once(&self, registry: &TaskRegistry, sender: &MappingSender) -> bool {
        let mut busy = false;
        let mut tasks = self.tasks.lock();
        let mut i = 0;
        while i < tasks.len() {
            let task = tasks[i].clone();
            if task.is_in_final_state() {
                tasks.remove(i);
                registry.deregister(task.id());
                continue;
            }
            if !task.is_started() {
                i += 1;
                continue;
            }
            if task.has_input() || task.has_to_perform_final_steps() {
                match task.execute() {
                    Ok(()) => {
                        busy = true;
                        if task.is_in_final_state() {
                            debug!(id = %task.id(), "task finished");
                            tasks.remove(i);
                            registry.deregister(task.id());
                            continue;
                        }
                    }
                    Err(e) => {
                        warn!(id = %task.id(), error = %e.msg(), "task step failed");
                        task.close();
                        registry.deregister(task.id());
                        if let Err(send_err) =
                            sender.send_query_task_failed(task.coordinator_id(), e.msg())
                        {
                            warn!(error = %send_err, "failure report not delivered");
                        }
                        tasks.remove(i);
                        continue;
                    }
                }
            }
            i += 1;
        }
        busy
    }
}

/// Migrate one task from the more loaded of the pair to the other when
/// their measured loads diverge. Locks are taken in index order, so
/// concurrent pairwise rebalances cannot deadlock. A worker never gives
/// away its last task.
pub(crate) fn rebalance(a: &Arc<WorkerState>, b: &Arc<WorkerState>, threshold: u64) {
    if Arc::ptr_eq(a, b) {
        return;
    }
    let (first, second) = if a.index < b.index { (a, b) } else { (b, a) };
    let mut first_tasks = first.tasks.lock();
    let mut second_tasks = second.tasks.lock();

    let load = |tasks: &[Arc<dyn WorkerTask>]| {
        tasks
            .iter()
            .map(|t| t.current_load())
            .fold(0u64, u64::saturating_add)
    };
    let first_load = load(&first_tasks);
    let second_load = load(&second_tasks);
    let (from, to, difference) = if first_load >= second_load {
        (&mut first_tasks, &mut second_tasks, first_load - second_load)
    } else {
        (&mut second_tasks, &mut first_tasks, second_load - first_load)
    };
    if difference <= threshold || from.len() <= 1 {
        return;
    }
    let lightest = from
        .iter()
        .enumerate()
        .min_by_key(|(_, t)| t.current_load())
        .map(|(i, _)| i)
        .expect("from holds more than one task");
    let task = from.remove(lightest);
    debug!(id = %task.id(), "task migrated between workers");
    to.push(task);
}

/// The worker threads of one node.
#[derive(Debug)]
pub(crate) struct WorkerRing {
    workers: Vec<Arc<WorkerState>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerRing {
    pub(crate) fn spawn(
        thread_count: usize,
        idle_sleep: Duration,
        unbalance_threshold: u64,
        registry: Arc<TaskRegistry>,
        sender: Arc<MappingSender>,
    ) -> Self {
        let thread_count = std::cmp::max(1, thread_count);
        let workers: Vec<Arc<WorkerState>> =
            (0..thread_count).map(|i| Arc::new(WorkerState::new(i))).collect();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let me = workers[i].clone();
            let neighbor = workers[(i + 1) % thread_count].clone();
            let registry = registry.clone();
            let sender = sender.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("tessera_worker_{i}"))
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        let busy = me.run_once(&registry, &sender);
                        rebalance(&me, &neighbor, unbalance_threshold);
                        if !busy {
                            thread::sleep(idle_sleep);
                        }
                    }
                })
                .expect("worker thread spawn");
            handles.push(handle);
        }
        WorkerRing {
            workers,
            handles: Mutex::new(handles),
            shutdown,
        }
    }

    /// The worker with the smallest estimated load takes the next task.
    pub(crate) fn assign(&self, task: Arc<dyn WorkerTask>) {
        let worker = self
            .workers
            .iter()
            .min_by_key(|w| w.estimated_load())
            .expect("ring has at least one worker");
        worker.add_task(task);
    }

    #[cfg(test)]
    pub(crate) fn workers(&self) -> &[Arc<WorkerState>] {
        &self.workers
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerRing {
    fn drop(&mut self) {
        self.shutdown();
    }
}
