//! Shared atomic JSON-file persistence for the registries (spec §6).
//!
//! Every registry is a single JSON array written with a write-to-temp-then-
//! rename pattern so a crash mid-write never leaves a truncated file behind.

use crate::error::EngineResult;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

pub fn load<T: DeserializeOwned + Default>(path: &Path) -> EngineResult<T> {
    match std::fs::read(path) {
        Ok(bytes) => {
            if bytes.is_empty() {
                Ok(T::default())
            } else {
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

pub fn save<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp: PathBuf = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
