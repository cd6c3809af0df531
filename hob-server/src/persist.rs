//! Object storage: one `<objects_dir>/<name>/.identity/object.json` per object.

use std::path::{Path, PathBuf};

use hob_core::Object;
use tracing::{debug, warn};

const IDENTITY_DIR: &str = ".identity";
const OBJECT_FILE: &str = "object.json";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("object name {0:?} is not a valid directory name")]
    BadName(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid object file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn object_path(dir: &Path, name: &str) -> Result<PathBuf, PersistError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(PersistError::BadName(name.to_string()));
    }
    Ok(dir.join(name).join(IDENTITY_DIR).join(OBJECT_FILE))
}

/// Write `object` under `dir`, creating its folders as needed.
pub fn save_object(dir: &Path, object: &Object) -> Result<PathBuf, PersistError> {
    let path = object_path(dir, &object.name)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let json = serde_json::to_vec_pretty(object).map_err(|source| PersistError::Json {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&path, json).map_err(io_err(&path))?;
    debug!(object = %object.id, path = %path.display(), "object saved");
    Ok(path)
}

pub fn load_object(path: &Path) -> Result<Object, PersistError> {
    let bytes = std::fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&bytes).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Load every object stored under `dir`, ordered by folder name. A missing `dir` holds no
/// objects; unreadable object files are skipped with a warning.
pub fn load_objects(dir: &Path) -> Result<Vec<Object>, PersistError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut folders: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err(dir))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    folders.sort();

    let mut out = Vec::new();
    for folder in folders {
        let path = folder.join(IDENTITY_DIR).join(OBJECT_FILE);
        if !path.exists() {
            continue;
        }
        match load_object(&path) {
            Ok(o) => out.push(o),
            Err(e) => warn!("skipping object: {e}"),
        }
    }
    Ok(out)
}
