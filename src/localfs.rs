//! C8 — Local FS Service (spec §4.7): a `std::fs`/`walkdir` mirror of C7's
//! `FileEntry` shape so the Transfer Queue can treat both sides of a
//! transfer uniformly. No sandboxing — the embedding host is trusted to
//! pass paths it wants exposed.

use crate::error::{EngineError, EngineResult};
use crate::models::{FileEntry, FileKind};
use std::fs;
use std::path::Path;

fn entry_from_metadata(name: String, path: String, metadata: &fs::Metadata) -> FileEntry {
    let kind = if metadata.file_type().is_symlink() {
        FileKind::Symlink
    } else if metadata.is_dir() {
        FileKind::Directory
    } else {
        FileKind::File
    };

    #[cfg(unix)]
    let (permissions, owner_uid, owner_gid) = {
        use std::os::unix::fs::MetadataExt;
        (metadata.mode() & 0o7777, metadata.uid(), metadata.gid())
    };
    #[cfg(not(unix))]
    let (permissions, owner_uid, owner_gid) = (0o644u32, 0u32, 0u32);

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    FileEntry {
        name,
        path,
        kind,
        size: metadata.len(),
        permissions,
        mtime,
        owner_uid,
        owner_gid,
        owner_name: None,
    }
}

pub fn list_files(dir: &Path) -> EngineResult<Vec<FileEntry>> {
    let mut out = Vec::new();
    let read_dir = fs::read_dir(dir).map_err(|e| EngineError::NotFound(format!("{}: {e}", dir.display())))?;
    for entry in read_dir {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path().to_string_lossy().to_string();
        out.push(entry_from_metadata(name, path, &metadata));
    }
    Ok(out)
}

pub fn stat(path: &Path) -> EngineResult<FileEntry> {
    let metadata = fs::symlink_metadata(path).map_err(|e| EngineError::NotFound(format!("{}: {e}", path.display())))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());
    Ok(entry_from_metadata(name, path.to_string_lossy().to_string(), &metadata))
}

pub fn mkdir(path: &Path) -> EngineResult<()> {
    fs::create_dir_all(path).map_err(EngineError::from)
}

pub fn delete(path: &Path, is_dir: bool) -> EngineResult<()> {
    if is_dir {
        fs::remove_dir_all(path).map_err(EngineError::from)
    } else {
        fs::remove_file(path).map_err(EngineError::from)
    }
}

pub fn rename(from: &Path, to: &Path) -> EngineResult<()> {
    fs::rename(from, to).map_err(EngineError::from)
}

pub fn copy(from: &Path, to: &Path) -> EngineResult<()> {
    if from.is_dir() {
        for entry in walkdir::WalkDir::new(from) {
            let entry = entry.map_err(|e| EngineError::Transport(e.to_string()))?;
            let rel = entry.path().strip_prefix(from).unwrap();
            let dest = to.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)?;
            } else {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &dest)?;
            }
        }
        Ok(())
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to).map(|_| ()).map_err(EngineError::from)
    }
}

/// Total size of a directory tree, for a transfer job's `size_bytes` hint.
pub fn dir_size(path: &Path) -> EngineResult<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|e| EngineError::Transport(e.to_string()))?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(|e| EngineError::Transport(e.to_string()))?.len();
        }
    }
    Ok(total)
}

pub fn calculate_checksum(path: &Path, algo: &str) -> EngineResult<String> {
    use md5::{Digest as Md5Digest, Md5};
    use sha1::{Digest as Sha1Digest, Sha1};
    use sha2::{Digest as Sha2Digest, Sha256};
    use std::io::Read;

    enum Hasher {
        Sha256(Sha256),
        Sha1(Sha1),
        Md5(Md5),
    }

    let mut hasher = match algo {
        "sha256" => Hasher::Sha256(Sha256::new()),
        "sha1" => Hasher::Sha1(Sha1::new()),
        "md5" => Hasher::Md5(Md5::new()),
        other => return Err(EngineError::Conflict(format!("unsupported checksum algorithm: {other}"))),
    };

    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        match &mut hasher {
            Hasher::Sha256(h) => h.update(&buf[..n]),
            Hasher::Sha1(h) => h.update(&buf[..n]),
            Hasher::Md5(h) => h.update(&buf[..n]),
        }
    }

    Ok(match hasher {
        Hasher::Sha256(h) => hex::encode(h.finalize()),
        Hasher::Sha1(h) => hex::encode(h.finalize()),
        Hasher::Md5(h) => hex::encode(h.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_files_roundtrips_a_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let entries = list_files(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 5);
    }

    #[test]
    fn checksum_matches_known_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"abc").unwrap();
        let hash = calculate_checksum(&file, "sha256").unwrap();
        assert_eq!(hash, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn copy_directory_recurses() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/f.txt"), b"x").unwrap();
        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("copy");
        copy(src.path(), &target).unwrap();
        assert!(target.join("sub/f.txt").exists());
    }
}
