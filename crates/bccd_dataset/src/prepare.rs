//! The dataset preparation pipeline.
//!
//! Discovers annotation XML files, assigns a deterministic train/val split,
//! converts each record into a YOLO label file, copies the matching image,
//! and writes the `data.yaml` manifest. Single-threaded and blocking;
//! concurrent runs against one output root are undefined.

use std::fs;
use std::path::{Path, PathBuf};

use crate::convert::{format_label_line, to_yolo};
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::split::split_stems;
use crate::types::{
    ClassTable, DatasetError, DatasetResult, OverwritePolicy, PrepareSummary, Split, SplitCounts,
};
use crate::voc::parse_annotation_file;

/// Image extensions tried when locating the file for an annotation stem.
pub const IMAGE_EXTENSIONS: [&str; 2] = ["jpg", "jpeg"];

#[derive(Debug, Clone)]
pub struct PrepareConfig {
    pub source_root: PathBuf,
    /// Annotation subdirectory relative to the source root.
    pub annotations_subdir: String,
    /// Image subdirectory relative to the source root.
    pub images_subdir: String,
    pub output_root: PathBuf,
    pub classes: ClassTable,
    pub train_ratio: f64,
    pub seed: u64,
    pub overwrite: OverwritePolicy,
}

impl PrepareConfig {
    pub fn new(source_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            annotations_subdir: "Annotations".into(),
            images_subdir: "JPEGImages".into(),
            output_root: output_root.into(),
            classes: ClassTable::bccd(),
            train_ratio: 0.8,
            seed: 42,
            overwrite: OverwritePolicy::Replace,
        }
    }
}

pub fn prepare(cfg: &PrepareConfig) -> DatasetResult<PrepareSummary> {
    let annotations_dir = cfg.source_root.join(&cfg.annotations_subdir);
    let stems = discover_stems(&annotations_dir)?;
    println!(
        "found {} annotation files under {}",
        stems.len(),
        annotations_dir.display()
    );

    let (train_stems, val_stems) = split_stems(stems.clone(), cfg.train_ratio, cfg.seed);

    reset_output_root(&cfg.output_root, cfg.overwrite)?;
    for split in [Split::Train, Split::Val] {
        for kind in ["images", "labels"] {
            let dir = cfg.output_root.join(kind).join(split.as_str());
            fs::create_dir_all(&dir).map_err(|e| DatasetError::Io {
                path: dir.clone(),
                source: e,
            })?;
        }
    }

    let mut summary = PrepareSummary {
        discovered: stems.len(),
        ..Default::default()
    };
    process_split(cfg, &train_stems, Split::Train, &mut summary)?;
    process_split(cfg, &val_stems, Split::Val, &mut summary)?;

    Manifest::for_layout(&cfg.classes).save(&cfg.output_root.join(MANIFEST_FILE))?;

    println!(
        "train: {} records ({} objects), val: {} records ({} objects)",
        summary.train.records, summary.train.objects, summary.val.records, summary.val.objects
    );
    if summary.out_of_bounds_boxes > 0 {
        eprintln!(
            "warning: {} boxes extend beyond image bounds; normalized values left unclamped",
            summary.out_of_bounds_boxes
        );
    }
    Ok(summary)
}

/// Stems of all `.xml` files in the annotations directory. Ordering is left
/// to the split step, which sorts before shuffling.
fn discover_stems(dir: &Path) -> DatasetResult<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| DatasetError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut stems = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("xml") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            stems.push(stem.to_string());
        }
    }
    Ok(stems)
}

fn reset_output_root(root: &Path, policy: OverwritePolicy) -> DatasetResult<()> {
    if !root.exists() {
        return Ok(());
    }
    match policy {
        OverwritePolicy::Fail => Err(DatasetError::OutputExists {
            path: root.to_path_buf(),
        }),
        OverwritePolicy::Replace => {
            println!("warning: {} exists and will be overwritten", root.display());
            fs::remove_dir_all(root).map_err(|e| DatasetError::Io {
                path: root.to_path_buf(),
                source: e,
            })
        }
    }
}

fn process_split(
    cfg: &PrepareConfig,
    stems: &[String],
    split: Split,
    summary: &mut PrepareSummary,
) -> DatasetResult<()> {
    let annotations_dir = cfg.source_root.join(&cfg.annotations_subdir);
    let images_dir = cfg.source_root.join(&cfg.images_subdir);
    let label_out = cfg.output_root.join("labels").join(split.as_str());
    let image_out = cfg.output_root.join("images").join(split.as_str());

    let mut counts = SplitCounts::default();
    for stem in stems {
        let xml_path = annotations_dir.join(format!("{stem}.xml"));
        // Malformed annotations are fatal; no partial dataset is valid.
        let record = parse_annotation_file(&xml_path)?;
        if record.width == 0 || record.height == 0 {
            summary.skipped_zero_dims += 1;
            continue;
        }
        let Some(img_src) = locate_image(&images_dir, stem) else {
            summary.skipped_missing_image += 1;
            continue;
        };

        let mut lines = Vec::new();
        for obj in &record.objects {
            if obj.difficult {
                summary.dropped_difficult += 1;
                continue;
            }
            let Some(class_id) = cfg.classes.index_of(&obj.name) else {
                summary.dropped_unknown_class += 1;
                continue;
            };
            let yolo = to_yolo(record.width, record.height, &obj.bbox);
            if !yolo.in_unit_range() {
                summary.out_of_bounds_boxes += 1;
            }
            lines.push(format_label_line(class_id, &yolo));
        }

        // The label file and image copy happen even with zero retained
        // objects; the record passed the dimension and image checks.
        let mut body = lines.join("\n");
        if !lines.is_empty() {
            body.push('\n');
        }
        let label_path = label_out.join(format!("{stem}.txt"));
        fs::write(&label_path, body).map_err(|e| DatasetError::Io {
            path: label_path.clone(),
            source: e,
        })?;
        let img_dst = image_out.join(format!("{stem}.jpg"));
        fs::copy(&img_src, &img_dst).map_err(|e| DatasetError::Io {
            path: img_dst.clone(),
            source: e,
        })?;

        counts.records += 1;
        counts.objects += lines.len();
        if lines.is_empty() {
            counts.empty_labels += 1;
        }
    }

    match split {
        Split::Train => summary.train = counts,
        Split::Val => summary.val = counts,
    }
    Ok(())
}

fn locate_image(images_dir: &Path, stem: &str) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| images_dir.join(format!("{stem}.{ext}")))
        .find(|p| p.exists())
}
