//! Dataset manifest (`data.yaml`) written at the dataset root.
//!
//! The manifest is the sole contract between the preparer and the training
//! driver: dataset root, relative image dirs per split, and the ordered
//! class index to name mapping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::types::{ClassTable, DatasetError, DatasetResult};

pub const MANIFEST_FILE: &str = "data.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Dataset root, relative to the manifest location.
    pub path: String,
    /// Train image directory relative to `path`.
    pub train: String,
    /// Val image directory relative to `path`.
    pub val: String,
    /// Class index to name mapping; keys are dense from 0.
    pub names: BTreeMap<usize, String>,
}

impl Manifest {
    /// Manifest for the standard `images/{train,val}` layout.
    pub fn for_layout(classes: &ClassTable) -> Self {
        Self {
            path: ".".into(),
            train: "images/train".into(),
            val: "images/val".into(),
            names: classes
                .names()
                .iter()
                .enumerate()
                .map(|(i, n)| (i, n.clone()))
                .collect(),
        }
    }

    /// Class names in index order.
    pub fn class_names(&self) -> Vec<String> {
        self.names.values().cloned().collect()
    }

    pub fn save(&self, path: &Path) -> DatasetResult<()> {
        let data = serde_yaml::to_string(self).map_err(|e| DatasetError::Yaml {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, data).map_err(|e| DatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn load(path: &Path) -> DatasetResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| DatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&raw).map_err(|e| DatasetError::Yaml {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_class_order() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(MANIFEST_FILE);
        let manifest = Manifest::for_layout(&ClassTable::bccd());
        manifest.save(&path).unwrap();
        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.class_names(), vec!["RBC", "WBC", "Platelets"]);
        assert_eq!(loaded.train, "images/train");
        assert_eq!(loaded.val, "images/val");
        assert_eq!(loaded.path, ".");
    }
}
