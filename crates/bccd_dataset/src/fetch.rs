//! Fetching the source corpus.

use std::path::Path;
use std::process::Command;

use crate::types::{DatasetError, DatasetResult};

/// Clone the corpus repository into `dest` via the system `git`.
pub fn clone_corpus(url: &str, dest: &Path) -> DatasetResult<()> {
    println!("cloning corpus from {url} into {}", dest.display());
    let status = Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(dest)
        .status()
        .map_err(|e| DatasetError::Fetch {
            msg: format!("failed to run git: {e}"),
        })?;
    if !status.success() {
        return Err(DatasetError::Fetch {
            msg: format!("git clone exited with {status}"),
        });
    }
    Ok(())
}
