//! BCCD dataset preparation: Pascal VOC annotations to YOLO labels.
//!
//! This crate provides utilities for:
//! - Parsing per-image VOC annotation XML
//! - Converting pixel bounding boxes to normalized center-width-height form
//! - Deterministic train/val splitting
//! - Writing the `data.yaml` manifest consumed by the training driver

pub mod convert;
pub mod fetch;
pub mod manifest;
pub mod prepare;
pub mod split;
pub mod types;
pub mod voc;

pub use convert::{format_label_line, to_yolo};
pub use fetch::clone_corpus;
pub use manifest::{Manifest, MANIFEST_FILE};
pub use prepare::{prepare, PrepareConfig, IMAGE_EXTENSIONS};
pub use split::split_stems;
pub use types::*;
pub use voc::{parse_annotation_file, parse_annotation_str};
