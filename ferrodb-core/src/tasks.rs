// src/tasks.rs
// Persistent background work: a FIFO of index-update tasks per database
// and the worker that drains it.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, tick, Sender};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::storage::StorageInner;
use crate::{log_debug, log_error, log_warn};

pub const TASKS_BUCKET: &str = "tasks";

/// Tasks claimed per database per worker pass.
pub const TASK_PROCESS_COUNT: usize = 10;

const WORKER_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskAction {
    UpdateView,
}

/// One unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Assigned from the tasks bucket sequence; 0 until persisted.
    #[serde(default)]
    pub id: u64,
    pub action: TaskAction,
    pub db_name: String,
    /// Canonical DDFN string of the index to update
    pub design_doc_fn: String,
    pub active_since: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Total number of things to process
    pub processing_total: usize,
    /// Number of things processed
    pub processed: usize,
}

impl Task {
    pub fn update_view(db_name: &str, design_doc_fn: &str) -> Task {
        Task {
            id: 0,
            action: TaskAction::UpdateView,
            db_name: db_name.to_string(),
            design_doc_fn: design_doc_fn.to_string(),
            active_since: None,
            updated_at: None,
            processing_total: 0,
            processed: 0,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Task id={} action={:?} db={} fn={:?} {}/{}>",
            self.id,
            self.action,
            self.db_name,
            self.design_doc_fn,
            self.processed,
            self.processing_total
        )
    }
}

impl Database {
    /// Append tasks inside the current write batch.
    pub(crate) fn add_tasks_tx(
        &self,
        tx: &mut crate::engine::WriteTransaction<'_>,
        tasks: &[Task],
    ) -> Result<()> {
        tx.ensure_bucket(TASKS_BUCKET);
        for task in tasks {
            let data = serde_json::to_vec(task)?;
            tx.put_with_sequence(
                TASKS_BUCKET,
                Vec::new(),
                data,
                Box::new(|_k, seq| (Some(seq.to_be_bytes().to_vec()), None)),
            );
        }
        Ok(())
    }

    /// Append tasks in their own transaction.
    pub fn add_tasks(&self, tasks: &[Task]) -> Result<()> {
        self.engine().write(|tx| self.add_tasks_tx(tx, tasks))
    }

    /// Claim up to `count` tasks by stamping their `active_since`.
    pub fn get_tasks(&self, count: usize) -> Result<Vec<Task>> {
        self.engine().write(|tx| {
            let mut tasks = Vec::new();
            let mut cursor = tx.cursor(TASKS_BUCKET)?;
            let mut entry = cursor.first()?;
            let mut claims = Vec::new();
            while let Some((key, value)) = entry {
                if tasks.len() >= count {
                    break;
                }
                let mut task: Task = serde_json::from_slice(&value)?;
                task.id = decode_task_id(&key);
                task.active_since = Some(Utc::now());
                claims.push((key, serde_json::to_vec(&task)?));
                tasks.push(task);
                entry = cursor.next()?;
            }
            for (key, value) in claims {
                tx.put(TASKS_BUCKET, key, value);
            }
            Ok(tasks)
        })
    }

    /// Read up to `count` tasks without claiming them.
    pub fn peek_tasks(&self, count: usize) -> Result<Vec<Task>> {
        self.engine().read(|tx| {
            let mut tasks = Vec::new();
            let mut cursor = tx.cursor(TASKS_BUCKET)?;
            let mut entry = cursor.first()?;
            while let Some((key, value)) = entry {
                if tasks.len() >= count {
                    break;
                }
                let mut task: Task = serde_json::from_slice(&value)?;
                task.id = decode_task_id(&key);
                tasks.push(task);
                entry = cursor.next()?;
            }
            Ok(tasks)
        })
    }

    /// Rewrite a claimed task (progress reporting).
    pub fn update_task(&self, task: &mut Task) -> Result<()> {
        task.updated_at = Some(Utc::now());
        let data = serde_json::to_vec(task)?;
        let key = task.id.to_be_bytes().to_vec();
        self.engine().write(|tx| {
            tx.put(TASKS_BUCKET, key.clone(), data.clone());
            Ok(())
        })
    }

    /// Delete completed tasks.
    pub fn complete_tasks(&self, tasks: &[Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.engine().write(|tx| {
            for task in tasks {
                tx.delete(TASKS_BUCKET, task.id.to_be_bytes().to_vec());
            }
            Ok(())
        })
    }

    /// Number of queued tasks.
    pub fn task_count(&self) -> Result<usize> {
        self.engine()
            .read(|tx| Ok(tx.bucket_stats(TASKS_BUCKET)?.keys as usize))
    }

    /// Process one claimed task: dispatch to the named index's rebuild.
    pub fn process_task(&self, task: &mut Task) -> Result<()> {
        let idx = self.index(&task.design_doc_fn).ok_or_else(|| {
            DbError::NotFound
        })?;
        match task.action {
            TaskAction::UpdateView => self.rebuild(task, &idx),
        }
    }
}

fn decode_task_id(key: &[u8]) -> u64 {
    <[u8; 8]>::try_from(key)
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

/// The background task worker: one dedicated thread per process,
/// polling every 500 ms and draining each database's queue in bounded
/// chunks.
pub struct TaskWorker {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl TaskWorker {
    pub(crate) fn spawn(storage: Arc<StorageInner>) -> TaskWorker {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(WORKER_TICK);

        let handle = std::thread::spawn(move || loop {
            crossbeam::select! {
                recv(shutdown_rx) -> _ => break,
                recv(ticker) -> _ => {
                    if let Err(err) = process_all_tasks(&storage) {
                        log_error!("failed processing of all tasks: {}", err);
                    }
                }
            }
        });

        TaskWorker {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn process_all_tasks(storage: &StorageInner) -> Result<()> {
    for db in storage.all_databases() {
        process_tasks_for_database(&db)?;
    }
    Ok(())
}

fn process_tasks_for_database(db: &Database) -> Result<()> {
    loop {
        let mut tasks = db.get_tasks(TASK_PROCESS_COUNT)?;
        for task in tasks.iter_mut() {
            log_debug!("processing {}", task);
            if let Err(err) = db.process_task(task) {
                // errors are logged and the task completed anyway; a
                // follow-up design doc update re-enqueues the work
                log_warn!("failed to process {} due to: {}", task, err);
            }
        }
        db.complete_tasks(&tasks)?;
        if tasks.len() < TASK_PROCESS_COUNT {
            break;
        }
    }
    Ok(())
}
