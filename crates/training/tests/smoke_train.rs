use std::fs;
use std::path::Path;

use bccd_dataset::{ClassTable, Manifest, Split, MANIFEST_FILE};
use image::{Rgb, RgbImage};
use training::util::{run_train, BackendKind, OptimizerKind, TrainArgs};

fn write_split(root: &Path, split: Split, count: usize) {
    let images = root.join("images").join(split.as_str());
    let labels = root.join("labels").join(split.as_str());
    fs::create_dir_all(&images).unwrap();
    fs::create_dir_all(&labels).unwrap();
    for i in 0..count {
        let stem = format!("BloodImage_{i:05}");
        let img = RgbImage::from_pixel(8, 8, Rgb([180, 30, 30]));
        img.save(images.join(format!("{stem}.jpg"))).unwrap();
        fs::write(
            labels.join(format!("{stem}.txt")),
            "0 0.5 0.5 0.25 0.25\n1 0.25 0.25 0.1 0.1\n",
        )
        .unwrap();
    }
}

#[test]
fn one_epoch_train_saves_checkpoint_and_validates() {
    let temp = tempfile::tempdir().unwrap();
    let dataset = temp.path().join("dataset");
    write_split(&dataset, Split::Train, 4);
    write_split(&dataset, Split::Val, 2);
    Manifest::for_layout(&ClassTable::bccd())
        .save(&dataset.join(MANIFEST_FILE))
        .unwrap();

    let project = temp.path().join("runs");
    let args = TrainArgs {
        data: dataset.join(MANIFEST_FILE).display().to_string(),
        image_size: 8,
        batch_size: 2,
        epochs: 1,
        backend: BackendKind::NdArray,
        max_boxes: 4,
        lr: 1e-3,
        optimizer: OptimizerKind::Adam,
        workers: 2,
        pretrained: None,
        checkpoint_out: None,
        lambda_box: 1.0,
        lambda_obj: 1.0,
        lambda_cls: 1.0,
        run_name: "smoke".into(),
        project: project.display().to_string(),
        iou_thresh: 0.5,
        obj_thresh: 0.5,
        quiet: true,
    };
    run_train(args).unwrap();
    assert!(project.join("smoke/cell_detector.bin").exists());
}

#[test]
fn checkpoint_out_overrides_default_path() {
    let temp = tempfile::tempdir().unwrap();
    let dataset = temp.path().join("dataset");
    write_split(&dataset, Split::Train, 2);
    write_split(&dataset, Split::Val, 1);
    Manifest::for_layout(&ClassTable::bccd())
        .save(&dataset.join(MANIFEST_FILE))
        .unwrap();

    let ckpt = temp.path().join("checkpoints/custom.bin");
    let project = temp.path().join("runs");
    let args = TrainArgs {
        data: dataset.join(MANIFEST_FILE).display().to_string(),
        image_size: 8,
        batch_size: 2,
        epochs: 1,
        backend: BackendKind::NdArray,
        max_boxes: 4,
        lr: 1e-3,
        optimizer: OptimizerKind::Adam,
        workers: 1,
        pretrained: None,
        checkpoint_out: Some(ckpt.display().to_string()),
        lambda_box: 1.0,
        lambda_obj: 1.0,
        lambda_cls: 1.0,
        run_name: "smoke".into(),
        project: project.display().to_string(),
        iou_thresh: 0.5,
        obj_thresh: 0.5,
        quiet: true,
    };
    run_train(args).unwrap();
    assert!(ckpt.exists());
    assert!(!project.join("smoke/cell_detector.bin").exists());
}

#[test]
fn training_without_samples_fails() {
    let temp = tempfile::tempdir().unwrap();
    let dataset = temp.path().join("dataset");
    for split in [Split::Train, Split::Val] {
        fs::create_dir_all(dataset.join("images").join(split.as_str())).unwrap();
        fs::create_dir_all(dataset.join("labels").join(split.as_str())).unwrap();
    }
    Manifest::for_layout(&ClassTable::bccd())
        .save(&dataset.join(MANIFEST_FILE))
        .unwrap();

    let args = TrainArgs {
        data: dataset.join(MANIFEST_FILE).display().to_string(),
        image_size: 8,
        batch_size: 2,
        epochs: 1,
        backend: BackendKind::NdArray,
        max_boxes: 4,
        lr: 1e-3,
        optimizer: OptimizerKind::Sgd,
        workers: 1,
        pretrained: None,
        checkpoint_out: None,
        lambda_box: 1.0,
        lambda_obj: 1.0,
        lambda_cls: 1.0,
        run_name: "smoke".into(),
        project: temp.path().join("runs").display().to_string(),
        iou_thresh: 0.5,
        obj_thresh: 0.5,
        quiet: true,
    };
    assert!(run_train(args).is_err());
}
