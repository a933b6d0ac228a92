//! Periodic workspace snapshots: `snapshots/<unix_ts>.tar`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Archive `workspace.json`, `design/`, and `state/` into a tar file named
/// by the current unix timestamp. Returns the snapshot path.
pub(super) fn write_snapshot(dir: &Path) -> Result<PathBuf, StoreError> {
    let snapshots = dir.join("snapshots");
    fs::create_dir_all(&snapshots).map_err(|e| StoreError::io(&snapshots, e))?;

    let ts = chrono::Utc::now().timestamp();
    let path = snapshots.join(format!("{ts}.tar"));
    let file = fs::File::create(&path).map_err(|e| StoreError::io(&path, e))?;
    let mut builder = tar::Builder::new(file);

    let metadata = dir.join("workspace.json");
    if metadata.exists() {
        builder
            .append_path_with_name(&metadata, "workspace.json")
            .map_err(|e| StoreError::io(&metadata, e))?;
    }
    for sub in ["design", "state"] {
        let src = dir.join(sub);
        if src.is_dir() {
            builder
                .append_dir_all(sub, &src)
                .map_err(|e| StoreError::io(&src, e))?;
        }
    }

    let mut file = builder.into_inner().map_err(|e| StoreError::io(&path, e))?;
    std::io::Write::flush(&mut file).map_err(|e| StoreError::io(&path, e))?;
    file.sync_all().map_err(|e| StoreError::io(&path, e))?;
    Ok(path)
}
