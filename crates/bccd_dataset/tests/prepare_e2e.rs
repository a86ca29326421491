//! End-to-end tests for the prepare pipeline against synthetic VOC corpora.

use std::fs;
use std::path::{Path, PathBuf};

use bccd_dataset::{
    clone_corpus, prepare, ClassTable, DatasetError, OverwritePolicy, PrepareConfig, MANIFEST_FILE,
};
use image::{Rgb, RgbImage};

struct ObjectSpec {
    name: &'static str,
    difficult: bool,
    bbox: [f64; 4], // xmin, ymin, xmax, ymax
}

fn annotation_xml(width: u32, height: u32, objects: &[ObjectSpec]) -> String {
    let mut xml = format!(
        "<annotation>\n  <folder>JPEGImages</folder>\n  <size>\n    <width>{width}</width>\n    <height>{height}</height>\n    <depth>3</depth>\n  </size>\n"
    );
    for obj in objects {
        xml.push_str(&format!(
            "  <object>\n    <name>{}</name>\n    <pose>Unspecified</pose>\n    <difficult>{}</difficult>\n    <bndbox>\n      <xmin>{}</xmin>\n      <ymin>{}</ymin>\n      <xmax>{}</xmax>\n      <ymax>{}</ymax>\n    </bndbox>\n  </object>\n",
            obj.name,
            if obj.difficult { 1 } else { 0 },
            obj.bbox[0],
            obj.bbox[1],
            obj.bbox[2],
            obj.bbox[3],
        ));
    }
    xml.push_str("</annotation>\n");
    xml
}

fn write_record(root: &Path, stem: &str, width: u32, height: u32, objects: &[ObjectSpec]) {
    write_record_ext(root, stem, width, height, objects, "jpg");
}

fn write_record_ext(
    root: &Path,
    stem: &str,
    width: u32,
    height: u32,
    objects: &[ObjectSpec],
    ext: &str,
) {
    let annotations = root.join("Annotations");
    let images = root.join("JPEGImages");
    fs::create_dir_all(&annotations).unwrap();
    fs::create_dir_all(&images).unwrap();
    fs::write(
        annotations.join(format!("{stem}.xml")),
        annotation_xml(width, height, objects),
    )
    .unwrap();
    let img = RgbImage::from_pixel(8, 8, Rgb([200, 40, 40]));
    img.save(images.join(format!("{stem}.{ext}"))).unwrap();
}

fn list_stems(dir: &Path) -> Vec<String> {
    let mut stems: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| {
                    e.path()
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default();
    stems.sort();
    stems
}

fn default_config(source: &Path, output: &Path) -> PrepareConfig {
    PrepareConfig::new(source, output)
}

fn wbc_object() -> ObjectSpec {
    ObjectSpec {
        name: "WBC",
        difficult: false,
        bbox: [100.0, 50.0, 200.0, 150.0],
    }
}

#[test]
fn labels_and_images_match_per_split() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    for i in 0..10 {
        write_record(&source, &format!("BloodImage_{i:05}"), 640, 480, &[wbc_object()]);
    }

    let summary = prepare(&default_config(&source, &output)).unwrap();
    assert_eq!(summary.discovered, 10);
    assert_eq!(summary.train.records, 8);
    assert_eq!(summary.val.records, 2);

    for split in ["train", "val"] {
        let labels = list_stems(&output.join("labels").join(split));
        let images = list_stems(&output.join("images").join(split));
        assert_eq!(labels, images, "mismatched stems in {split}");
        assert!(!labels.is_empty());
    }
    assert!(output.join(MANIFEST_FILE).exists());
}

#[test]
fn worked_example_label_line() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record(&source, "BloodImage_00000", 640, 480, &[wbc_object()]);

    prepare(&default_config(&source, &output)).unwrap();

    // A single record lands in val (train gets floor(0.8 * 1) = 0).
    let label = output.join("labels/val/BloodImage_00000.txt");
    let body = fs::read_to_string(label).unwrap();
    assert_eq!(body, "1 0.234375 0.208333 0.15625 0.208333\n");
}

#[test]
fn difficult_and_unknown_objects_are_dropped() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record(
        &source,
        "BloodImage_00000",
        640,
        480,
        &[
            wbc_object(),
            ObjectSpec {
                name: "WBC",
                difficult: true,
                bbox: [10.0, 10.0, 20.0, 20.0],
            },
            ObjectSpec {
                name: "Eosinophil",
                difficult: false,
                bbox: [30.0, 30.0, 40.0, 40.0],
            },
        ],
    );

    let summary = prepare(&default_config(&source, &output)).unwrap();
    assert_eq!(summary.dropped_difficult, 1);
    assert_eq!(summary.dropped_unknown_class, 1);

    let body = fs::read_to_string(output.join("labels/val/BloodImage_00000.txt")).unwrap();
    assert_eq!(body.lines().count(), 1);
}

#[test]
fn record_with_no_retained_objects_keeps_empty_label_and_image() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record(
        &source,
        "BloodImage_00000",
        640,
        480,
        &[ObjectSpec {
            name: "Eosinophil",
            difficult: false,
            bbox: [30.0, 30.0, 40.0, 40.0],
        }],
    );

    let summary = prepare(&default_config(&source, &output)).unwrap();
    assert_eq!(summary.val.records, 1);
    assert_eq!(summary.val.empty_labels, 1);

    let body = fs::read_to_string(output.join("labels/val/BloodImage_00000.txt")).unwrap();
    assert!(body.is_empty());
    assert!(output.join("images/val/BloodImage_00000.jpg").exists());
}

#[test]
fn zero_dimension_record_is_excluded_entirely() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record(&source, "BloodImage_00000", 0, 480, &[wbc_object()]);

    let summary = prepare(&default_config(&source, &output)).unwrap();
    assert_eq!(summary.skipped_zero_dims, 1);
    assert_eq!(summary.train.records + summary.val.records, 0);
    assert!(list_stems(&output.join("labels/val")).is_empty());
    assert!(list_stems(&output.join("images/val")).is_empty());
}

#[test]
fn missing_image_record_is_skipped_without_error() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record(&source, "BloodImage_00000", 640, 480, &[wbc_object()]);
    fs::remove_file(source.join("JPEGImages/BloodImage_00000.jpg")).unwrap();

    let summary = prepare(&default_config(&source, &output)).unwrap();
    assert_eq!(summary.skipped_missing_image, 1);
    assert_eq!(summary.train.records + summary.val.records, 0);
}

#[test]
fn jpeg_extension_fallback_copies_as_jpg() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record_ext(&source, "BloodImage_00000", 640, 480, &[wbc_object()], "jpeg");

    let summary = prepare(&default_config(&source, &output)).unwrap();
    assert_eq!(summary.val.records, 1);
    assert!(output.join("images/val/BloodImage_00000.jpg").exists());
}

#[test]
fn malformed_annotation_aborts_the_run() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record(&source, "BloodImage_00000", 640, 480, &[wbc_object()]);
    // Strip the <size> block from a second record.
    let annotations = source.join("Annotations");
    fs::write(
        annotations.join("BloodImage_00001.xml"),
        "<annotation><folder>JPEGImages</folder></annotation>",
    )
    .unwrap();

    let err = prepare(&default_config(&source, &output)).unwrap_err();
    assert!(matches!(err, DatasetError::MissingElement { element: "size", .. }));
}

#[test]
fn overwrite_replaces_previous_outputs() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    for i in 0..3 {
        write_record(&source, &format!("BloodImage_{i:05}"), 640, 480, &[wbc_object()]);
    }

    prepare(&default_config(&source, &output)).unwrap();
    let stale = output.join("labels/train/stale.txt");
    fs::write(&stale, "0 0.5 0.5 0.1 0.1\n").unwrap();

    prepare(&default_config(&source, &output)).unwrap();
    assert!(!stale.exists());
}

#[test]
fn no_overwrite_policy_fails_on_existing_output() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record(&source, "BloodImage_00000", 640, 480, &[wbc_object()]);

    prepare(&default_config(&source, &output)).unwrap();

    let mut cfg = default_config(&source, &output);
    cfg.overwrite = OverwritePolicy::Fail;
    let err = prepare(&cfg).unwrap_err();
    assert!(matches!(err, DatasetError::OutputExists { .. }));
}

#[test]
fn repeated_runs_assign_identical_splits() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    for i in 0..12 {
        write_record(&source, &format!("BloodImage_{i:05}"), 640, 480, &[wbc_object()]);
    }

    let splits: Vec<(Vec<String>, Vec<String>)> = [temp.path().join("a"), temp.path().join("b")]
        .iter()
        .map(|output: &PathBuf| {
            prepare(&default_config(&source, output)).unwrap();
            (
                list_stems(&output.join("labels/train")),
                list_stems(&output.join("labels/val")),
            )
        })
        .collect();
    assert_eq!(splits[0], splits[1]);
}

#[test]
fn out_of_bounds_boxes_are_counted_but_kept() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record(
        &source,
        "BloodImage_00000",
        640,
        480,
        &[ObjectSpec {
            name: "RBC",
            difficult: false,
            bbox: [600.0, 0.0, 700.0, 100.0],
        }],
    );

    let summary = prepare(&default_config(&source, &output)).unwrap();
    assert_eq!(summary.out_of_bounds_boxes, 1);
    let body = fs::read_to_string(output.join("labels/val/BloodImage_00000.txt")).unwrap();
    assert_eq!(body.lines().count(), 1);
    assert!(body.starts_with("0 "));
}

#[test]
fn clone_from_missing_source_fails() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("no-such-repo");
    let dest = temp.path().join("checkout");

    let err = clone_corpus(missing.to_str().unwrap(), &dest).unwrap_err();
    assert!(matches!(err, DatasetError::Fetch { .. }));
}

#[test]
fn custom_class_table_reindexes_labels() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("corpus");
    let output = temp.path().join("dataset");
    write_record(&source, "BloodImage_00000", 640, 480, &[wbc_object()]);

    let mut cfg = default_config(&source, &output);
    cfg.classes = ClassTable::new(vec!["WBC".into()]);
    prepare(&cfg).unwrap();

    let body = fs::read_to_string(output.join("labels/val/BloodImage_00000.txt")).unwrap();
    assert!(body.starts_with("0 "));
}
