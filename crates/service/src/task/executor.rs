use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::lock_utils::lock_recover;

type TaskJobFn = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    task_id: String,
    job: TaskJobFn,
}

/// Fixed pool of named worker threads fed by an unbounded queue. A task id can
/// be queued once at a time; the mark is cleared when its job returns or panics.
pub struct TaskExecutor {
    sender: Sender<QueuedTask>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl TaskExecutor {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = unbounded::<QueuedTask>();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        for index in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let pending = pending.clone();
            let spawned = thread::Builder::new()
                .name(format!("relay-task-worker-{index}"))
                .spawn(move || task_worker_loop(receiver, pending));
            if let Err(err) = spawned {
                log::warn!("event=task_worker_spawn_failed index={} err={}", index, err);
            }
        }
        Self { sender, pending }
    }

    pub fn submit<F>(&self, task_id: &str, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let id = task_id.trim();
        if id.is_empty() {
            return false;
        }
        if !lock_recover(&self.pending, "pending_relay_tasks").insert(id.to_string()) {
            log::warn!("event=task_enqueue_duplicate task_id={}", id);
            return false;
        }
        let queued = QueuedTask {
            task_id: id.to_string(),
            job: Box::new(job),
        };
        if self.sender.send(queued).is_err() {
            lock_recover(&self.pending, "pending_relay_tasks").remove(id);
            return false;
        }
        true
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        lock_recover(&self.pending, "pending_relay_tasks").contains(task_id.trim())
    }
}

fn task_worker_loop(receiver: Receiver<QueuedTask>, pending: Arc<Mutex<HashSet<String>>>) {
    while let Ok(queued) = receiver.recv() {
        let QueuedTask { task_id, job } = queued;
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            log::warn!("event=task_job_panicked task_id={}", task_id);
        }
        lock_recover(&pending, "pending_relay_tasks").remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn same_task_id_is_deduplicated_until_finish() {
        let executor = TaskExecutor::new(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        assert!(executor.submit("task_a", move || {
            let _ = release_rx.recv();
            let _ = done_tx.send(());
        }));
        assert!(!executor.submit("task_a", || {}));
        assert!(executor.is_pending("task_a"));

        release_tx.send(()).expect("release job");
        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("job finished");
        for _ in 0..50 {
            if !executor.is_pending("task_a") {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!executor.is_pending("task_a"));
        assert!(!executor.submit("  ", || {}));
    }

    #[test]
    fn panicking_job_keeps_worker_alive() {
        let executor = TaskExecutor::new(1);
        assert!(executor.submit("task_panic", || panic!("boom")));
        let (tx, rx) = mpsc::channel::<u32>();
        assert!(executor.submit("task_after", move || {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("next job"), 7);
    }
}
