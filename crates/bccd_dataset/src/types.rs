//! Core types, error definitions, and data structures for bccd_dataset.

use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("xml parse error at {path}: {msg}")]
    Xml { path: PathBuf, msg: String },
    #[error("missing required element <{element}> in {path}")]
    MissingElement { element: &'static str, path: PathBuf },
    #[error("invalid value for <{element}> in {path}: {msg}")]
    InvalidValue {
        element: &'static str,
        path: PathBuf,
        msg: String,
    },
    #[error("output directory {path} already exists (overwrite disabled)")]
    OutputExists { path: PathBuf },
    #[error("corpus fetch failed: {msg}")]
    Fetch { msg: String },
    #[error("manifest error at {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Bounding box in absolute pixel coordinates, as declared by the annotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

/// Bounding box in normalized center-width-height form (fractions of image size).
///
/// Values are not clamped; a source box extending past the image edge yields
/// components outside [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YoloBox {
    pub cx: f64,
    pub cy: f64,
    pub w: f64,
    pub h: f64,
}

impl YoloBox {
    pub fn in_unit_range(&self) -> bool {
        [self.cx, self.cy, self.w, self.h]
            .iter()
            .all(|v| (0.0..=1.0).contains(v))
    }
}

#[derive(Debug, Clone)]
pub struct VocObject {
    pub name: String,
    pub difficult: bool,
    pub bbox: PixelBox,
}

/// One parsed annotation record: declared image size plus annotated objects.
#[derive(Debug, Clone)]
pub struct VocAnnotation {
    pub width: u32,
    pub height: u32,
    pub objects: Vec<VocObject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

/// Ordered class names; the position of a name is its label index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTable {
    names: Vec<String>,
}

impl ClassTable {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// The three BCCD blood-cell classes in their canonical order.
    pub fn bccd() -> Self {
        Self::new(vec!["RBC".into(), "WBC".into(), "Platelets".into()])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::bccd()
    }
}

/// What to do when the output root already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Remove the existing tree and rebuild it (with a console warning).
    Replace,
    /// Refuse to touch an existing tree.
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct SplitCounts {
    pub records: usize,
    pub objects: usize,
    pub empty_labels: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareSummary {
    pub discovered: usize,
    pub train: SplitCounts,
    pub val: SplitCounts,
    pub skipped_missing_image: usize,
    pub skipped_zero_dims: usize,
    pub dropped_difficult: usize,
    pub dropped_unknown_class: usize,
    pub out_of_bounds_boxes: usize,
}
