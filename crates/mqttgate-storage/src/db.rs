//! Shared redb handles keyed by path.
//!
//! redb allows one open handle per file per process. The config, schema and
//! document stores may sit on the same file, so they all go through this
//! cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use redb::Database;

use crate::error::open_error;
use crate::Result;

fn db_cache() -> &'static RwLock<HashMap<String, Arc<Database>>> {
    static CACHE: OnceLock<RwLock<HashMap<String, Arc<Database>>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Get or open a database, creating the file and its parent directory.
pub fn get_or_open_db<P: AsRef<Path>>(path: P) -> Result<Arc<Database>> {
    let path_ref = path.as_ref();
    let key = path_ref.to_string_lossy().to_string();

    if let Some(db) = db_cache().read().get(&key) {
        return Ok(db.clone());
    }

    let mut cache = db_cache().write();
    if let Some(db) = cache.get(&key) {
        return Ok(db.clone());
    }

    let db = if path_ref.exists() {
        Database::open(path_ref).map_err(|e| open_error(path_ref, e))?
    } else {
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Database::create(path_ref).map_err(|e| open_error(path_ref, e))?
    };

    let db = Arc::new(db);
    cache.insert(key, db.clone());
    Ok(db)
}

/// Drop the cached handle for `path`. The file closes once every store
/// holding it is dropped.
pub fn close_db<P: AsRef<Path>>(path: P) -> Option<Arc<Database>> {
    let key = path.as_ref().to_string_lossy().to_string();
    db_cache().write().remove(&key)
}
