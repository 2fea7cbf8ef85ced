// src/storage.rs
// Owner of the database directory: opens, creates, deletes and lists
// databases and runs the background task worker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::reducer::{default_reducer_engines, ReducerEngines};
use crate::tasks::TaskWorker;
use crate::viewserver::{default_view_engines, ViewEngines};
use crate::{log_info, log_warn};

pub(crate) struct StorageInner {
    path: PathBuf,
    dbs: RwLock<HashMap<String, Arc<Database>>>,
    view_engines: ViewEngines,
    reducer_engines: ReducerEngines,
}

impl StorageInner {
    pub(crate) fn all_databases(&self) -> Vec<Arc<Database>> {
        self.dbs.read().values().cloned().collect()
    }
}

/// All databases below one directory.
pub struct Storage {
    inner: Arc<StorageInner>,
    worker: Option<TaskWorker>,
}

impl Storage {
    /// Open the directory with the built-in engine registry (rhai) and
    /// start the background task worker.
    pub fn open(path: &Path) -> Result<Storage> {
        Storage::open_with_engines(path, default_view_engines(), default_reducer_engines())
    }

    /// Open with a custom language registry; the embedder may register
    /// additional view server languages (e.g. "javascript").
    pub fn open_with_engines(
        path: &Path,
        view_engines: ViewEngines,
        reducer_engines: ReducerEngines,
    ) -> Result<Storage> {
        std::fs::create_dir_all(path)?;

        let inner = Arc::new(StorageInner {
            path: path.to_path_buf(),
            dbs: RwLock::new(HashMap::new()),
            view_engines,
            reducer_engines,
        });

        let mut storage = Storage {
            inner,
            worker: None,
        };
        storage.reload_databases()?;
        storage.worker = Some(TaskWorker::spawn(storage.inner.clone()));
        Ok(storage)
    }

    /// Scan the storage directory and open every database in it.
    pub fn reload_databases(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.inner.path)?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir() || name.ends_with(".d") {
                continue;
            }
            match self.create_database(&name) {
                Ok(db) => log_info!("loaded database {:?}", db.name()),
                Err(err) => {
                    log_warn!("loading database {:?} failed: {}", name, err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Open (or create) a database by name.
    pub fn create_database(&self, name: &str) -> Result<Arc<Database>> {
        validate_database_name(name)?;

        if let Some(db) = self.inner.dbs.read().get(name) {
            return Ok(db.clone());
        }

        let db = Database::open(
            name,
            &self.inner.path,
            self.inner.view_engines.clone(),
            self.inner.reducer_engines.clone(),
        )?;
        self.inner
            .dbs
            .write()
            .insert(name.to_string(), db.clone());
        Ok(db)
    }

    /// Drop a database with its files, attachments and search indices.
    pub fn delete_database(&self, name: &str) -> Result<()> {
        let db = self
            .inner
            .dbs
            .write()
            .remove(name)
            .ok_or(DbError::NotFound)?;
        drop(db);

        let engine_dir = self.inner.path.join(name);
        if engine_dir.exists() {
            std::fs::remove_dir_all(engine_dir)?;
        }
        let data_dir = self.inner.path.join(format!("{}.d", name));
        if data_dir.exists() {
            std::fs::remove_dir_all(data_dir)?;
        }
        Ok(())
    }

    /// Look up an open database.
    pub fn database(&self, name: &str) -> Result<Arc<Database>> {
        self.inner
            .dbs
            .read()
            .get(name)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    /// Names of all open databases.
    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.dbs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Stop the background worker and drop all database handles.
    pub fn close(mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.inner.dbs.write().clear();
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

fn validate_database_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with(".d")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$' | '(' | ')' | '+'));
    if !valid {
        return Err(DbError::BadRequest(format!(
            "invalid database name {:?}",
            name
        )));
    }
    Ok(())
}
