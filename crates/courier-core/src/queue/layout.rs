//! On-disk layout of the queue directory.
//!
//! One file per item, named `<stem>.<suffix>` where the suffix encodes the
//! status (`queued`, `processing`, `completed`, `error`). Failed items also
//! get a `<stem>.error.info` sidecar with `{error, timestamp, attempts}`.
//!
//! Every write goes through a `*.tmp` file that is fsynced and renamed into
//! place, and a status change is a single rename, so at any instant an item
//! is visible under exactly one suffix.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ItemStatus, QueueItem};
use crate::domain::ids::file_stem;
use crate::error::{QueueError, QueueResult};

const SIDECAR_SUFFIX: &str = ".error.info";
const TMP_SUFFIX: &str = ".tmp";

/// Sidecar written next to a failed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
}

/// An item found while scanning the directory.
#[derive(Debug)]
pub(crate) struct ScannedItem {
    pub item: QueueItem,
    pub path: PathBuf,
}

/// Result of a directory scan.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub items: Vec<ScannedItem>,
    /// Files that looked like items but could not be read or parsed.
    pub skipped: usize,
}

/// Maps item state to paths inside the queue directory.
#[derive(Debug, Clone)]
pub(crate) struct DirLayout {
    dir: PathBuf,
}

impl DirLayout {
    /// Open (and create if needed) the queue directory.
    pub fn open(dir: &Path) -> QueueResult<Self> {
        fs::create_dir_all(dir).map_err(|e| QueueError::io(dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn item_path(&self, id: &str, status: ItemStatus) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem(id), status.suffix()))
    }

    pub fn sidecar_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", file_stem(id), SIDECAR_SUFFIX))
    }

    /// Write `bytes` to `path` via an fsynced temp file and a rename.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> QueueResult<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let result = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(QueueError::io(path, e));
        }
        Ok(())
    }

    /// Persist `item`, moving its file if the status changed since `previous`.
    ///
    /// The new content is first written over the old file, then the old file
    /// is renamed to the new suffix. A crash between the two steps leaves the
    /// item under its old suffix, which is what the loader trusts.
    ///
    /// The error sidecar of a failing item is written before the rename, so
    /// an error return always leaves the item under its previous suffix.
    pub fn write_item(&self, item: &QueueItem, previous: Option<ItemStatus>) -> QueueResult<()> {
        let bytes = serde_json::to_vec_pretty(item)?;
        let target = self.item_path(&item.id, item.status);

        if item.status == ItemStatus::Failed {
            let info = ErrorInfo {
                error: item.last_error.clone(),
                timestamp: item.updated_at,
                attempts: item.attempts,
            };
            let info = serde_json::to_vec_pretty(&info)?;
            self.write_atomic(&self.sidecar_path(&item.id), &info)?;
        }

        match previous {
            Some(prev) if prev != item.status => {
                let source = self.item_path(&item.id, prev);
                self.write_atomic(&source, &bytes)?;
                fs::rename(&source, &target).map_err(|e| QueueError::io(&target, e))?;
                debug!(id = %item.id, from = %prev, to = %item.status, "moved item file");
            }
            _ => self.write_atomic(&target, &bytes)?,
        }

        if previous == Some(ItemStatus::Failed) && item.status != ItemStatus::Failed {
            // the move is done; a leftover sidecar is ignored by the loader
            if let Err(e) = remove_if_exists(&self.sidecar_path(&item.id)) {
                warn!(id = %item.id, error = %e, "could not remove error sidecar");
            }
        }
        Ok(())
    }

    /// Delete the item file and its sidecar.
    pub fn remove_item(&self, id: &str, status: ItemStatus) -> QueueResult<()> {
        remove_if_exists(&self.item_path(id, status))?;
        remove_if_exists(&self.sidecar_path(id))
    }

    pub fn read_error_info(&self, id: &str) -> Option<ErrorInfo> {
        let bytes = fs::read(self.sidecar_path(id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Reconstruct every item from the directory listing.
    ///
    /// The suffix is authoritative for the status; the file body supplies
    /// everything else. Leftover temp files are removed, unreadable files
    /// are skipped with a warning.
    pub fn scan(&self) -> QueueResult<Scan> {
        let entries = fs::read_dir(&self.dir).map_err(|e| QueueError::io(&self.dir, e))?;
        let mut scan = Scan::default();

        for entry in entries {
            let entry = entry.map_err(|e| QueueError::io(&self.dir, e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(TMP_SUFFIX) {
                debug!(path = %path.display(), "removing interrupted write");
                remove_if_exists(&path)?;
                continue;
            }
            if name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            let Some(status) = name
                .rsplit_once('.')
                .and_then(|(_, suffix)| ItemStatus::from_suffix(suffix))
            else {
                continue;
            };

            let mut item = match read_item(&path) {
                Ok(item) => item,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable queue file");
                    scan.skipped += 1;
                    continue;
                }
            };
            item.status = status;
            if status == ItemStatus::Failed && item.last_error.is_none() {
                if let Some(info) = self.read_error_info(&item.id) {
                    item.last_error = info.error;
                    item.attempts = item.attempts.max(info.attempts);
                }
            }
            scan.items.push(ScannedItem { item, path });
        }
        Ok(scan)
    }
}

fn read_item(path: &Path) -> QueueResult<QueueItem> {
    let bytes = fs::read(path).map_err(|e| QueueError::io(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) fn remove_if_exists(path: &Path) -> QueueResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(QueueError::io(path, e)),
    }
}
