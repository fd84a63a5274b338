//! Folder configs (spec §6: `folders.json`), a thin side-table describing
//! the folder tree hosts and credentials can be filed under. Folder
//! *membership* lives on `Host`/`Credential` records themselves; this
//! registry only tracks which folders exist and their nesting, so the
//! embedding UI can render an empty folder before anything is filed in it.

use crate::error::EngineResult;
use crate::models::Folder;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct FolderRegistry {
    path: PathBuf,
    folders: Mutex<Vec<Folder>>,
}

impl FolderRegistry {
    pub fn load(path: PathBuf) -> EngineResult<Self> {
        let folders: Vec<Folder> = super::storage::load(&path)?;
        Ok(Self {
            path,
            folders: Mutex::new(folders),
        })
    }

    fn persist(&self, folders: &[Folder]) -> EngineResult<()> {
        super::storage::save(&self.path, folders)
    }

    pub fn list(&self) -> Vec<Folder> {
        self.folders.lock().unwrap().clone()
    }

    pub fn create(&self, name: String, parent: Option<String>) -> EngineResult<()> {
        let mut folders = self.folders.lock().unwrap();
        if !folders.iter().any(|f| f.name == name) {
            folders.push(Folder { name, parent });
        }
        self.persist(&folders)
    }

    pub fn rename(&self, old: &str, new: &str) -> EngineResult<usize> {
        let mut folders = self.folders.lock().unwrap();
        let mut count = 0;
        for folder in folders.iter_mut() {
            if folder.name == old {
                folder.name = new.to_string();
                count += 1;
            }
            if folder.parent.as_deref() == Some(old) {
                folder.parent = Some(new.to_string());
                count += 1;
            }
        }
        if count > 0 {
            self.persist(&folders)?;
        }
        Ok(count)
    }

    pub fn delete(&self, name: &str) -> EngineResult<()> {
        let mut folders = self.folders.lock().unwrap();
        folders.retain(|f| f.name != name);
        self.persist(&folders)
    }
}
