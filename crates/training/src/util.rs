//! Training driver: argument parsing, the epoch loop, and evaluation.

use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dataset::{collate, load_split, Batch, YoloSample};
use crate::model::{CellDetector, CellDetectorConfig};
use crate::TrainBackend;
use bccd_dataset::Split;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train the blood-cell detector against a prepared YOLO dataset"
)]
pub struct TrainArgs {
    /// Dataset manifest (data.yaml) produced by the prepare step.
    #[arg(long, default_value = "datasets/BCCD/data.yaml")]
    pub data: String,
    /// Square input size images are resized to.
    #[arg(long, default_value_t = 640)]
    pub image_size: u32,
    /// Batch size.
    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,
    /// Number of epochs.
    #[arg(long, default_value_t = 50)]
    pub epochs: usize,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Maximum boxes per image (pads/truncates to this for training).
    #[arg(long, default_value_t = 64)]
    pub max_boxes: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f32,
    /// Optimizer selection.
    #[arg(long, value_enum, default_value_t = OptimizerKind::Adam)]
    pub optimizer: OptimizerKind,
    /// Worker threads for image decoding during batch collation.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,
    /// Checkpoint to initialize from (transfer learning).
    #[arg(long)]
    pub pretrained: Option<String>,
    /// Checkpoint output path (defaults to <project>/<run-name>/cell_detector.bin).
    #[arg(long)]
    pub checkpoint_out: Option<String>,
    /// Loss weight for box regression.
    #[arg(long, default_value_t = 1.0)]
    pub lambda_box: f32,
    /// Loss weight for objectness.
    #[arg(long, default_value_t = 1.0)]
    pub lambda_obj: f32,
    /// Loss weight for classification.
    #[arg(long, default_value_t = 1.0)]
    pub lambda_cls: f32,
    /// Run directory name under the project root.
    #[arg(long, default_value = "bccd_run")]
    pub run_name: String,
    /// Project root run directories are written into.
    #[arg(long, default_value = "runs")]
    pub project: String,
    /// IoU threshold for the post-training validation pass.
    #[arg(long, default_value_t = 0.5)]
    pub iou_thresh: f32,
    /// Objectness threshold for the post-training validation pass.
    #[arg(long, default_value_t = 0.5)]
    pub obj_thresh: f32,
    /// Suppress per-epoch progress lines.
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

type ADBackend = Autodiff<TrainBackend>;

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;

    let manifest_path = Path::new(&args.data);
    let (manifest, train_samples) = load_split(manifest_path, Split::Train)?;
    if train_samples.is_empty() {
        anyhow::bail!("no training samples under {}", manifest_path.display());
    }
    let num_classes = manifest.names.len().max(1);

    let ckpt_path = match &args.checkpoint_out {
        Some(p) => PathBuf::from(p),
        None => Path::new(&args.project)
            .join(&args.run_name)
            .join("cell_detector.bin"),
    };
    if let Some(parent) = ckpt_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let device = <ADBackend as Backend>::Device::default();
    let mut model = CellDetector::<ADBackend>::new(
        CellDetectorConfig {
            max_boxes: args.max_boxes,
            num_classes,
            ..Default::default()
        },
        &device,
    );
    if let Some(pre) = &args.pretrained {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        model = model
            .load_file(Path::new(pre), &recorder, &device)
            .map_err(|e| anyhow::anyhow!("failed to load pretrained weights {pre}: {e}"))?;
    }

    model = match args.optimizer {
        OptimizerKind::Adam => {
            train_loop(&args, model, AdamConfig::new().init(), &train_samples)?
        }
        OptimizerKind::Sgd => train_loop(&args, model, SgdConfig::new().init(), &train_samples)?,
    };

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(&ckpt_path, &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
    println!("Saved checkpoint to {}", ckpt_path.display());

    // Validation pass on the held-out split; framework errors propagate as-is.
    let (_, val_samples) = load_split(manifest_path, Split::Val)?;
    if val_samples.is_empty() {
        println!("no validation samples; skipping validation");
        return Ok(());
    }
    let metrics = evaluate(&model.valid(), &val_samples, &EvalConfig::from_train_args(&args))?;
    println!(
        "validation accuracy: {:.4} (precision {:.4}, recall {:.4})",
        metrics.accuracy, metrics.precision, metrics.recall
    );
    Ok(())
}

fn train_loop<O>(
    args: &TrainArgs,
    mut model: CellDetector<ADBackend>,
    mut optim: O,
    samples: &[YoloSample],
) -> anyhow::Result<CellDetector<ADBackend>>
where
    O: Optimizer<CellDetector<ADBackend>, ADBackend>,
{
    let batch_size = args.batch_size.max(1);
    for epoch in 0..args.epochs {
        let mut losses = Vec::new();
        for chunk in samples.chunks(batch_size) {
            let batch = collate::<ADBackend>(chunk, args.image_size, args.max_boxes, args.workers)?;
            let loss = detection_loss(args, &model, &batch);
            let loss_detached = loss.clone().detach();
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(args.lr as f64, model, grads);

            let loss_val: f32 = loss_detached
                .into_data()
                .to_vec::<f32>()
                .unwrap_or_default()
                .into_iter()
                .next()
                .unwrap_or(0.0);
            losses.push(loss_val);
        }
        let avg_loss: f32 = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f32>() / losses.len() as f32
        };
        if !args.quiet {
            println!("epoch {epoch}: avg loss {avg_loss:.4}");
        }
    }
    Ok(model)
}

fn detection_loss(
    args: &TrainArgs,
    model: &CellDetector<ADBackend>,
    batch: &Batch<ADBackend>,
) -> Tensor<ADBackend, 1> {
    let features = CellDetector::pool_features(batch.images.clone());
    let (pred_boxes, pred_scores, class_logits) = model.forward(features);

    let (obj_targets, box_targets, box_weights, class_targets) = build_greedy_targets(
        pred_boxes.clone(),
        batch.boxes.clone(),
        batch.classes.clone(),
        batch.box_mask.clone(),
        model.num_classes(),
    );
    // Objectness BCE; unassigned prediction slots have a 0.0 target.
    let eps = 1e-6;
    let pred_scores_clamped = pred_scores.clamp(eps, 1.0 - eps);
    let obj_targets_inv = Tensor::<ADBackend, 2>::ones(obj_targets.dims(), &obj_targets.device())
        - obj_targets.clone();
    let obj_loss = -((obj_targets.clone() * pred_scores_clamped.clone().log())
        + (obj_targets_inv
            * (Tensor::<ADBackend, 2>::ones(
                pred_scores_clamped.dims(),
                &pred_scores_clamped.device(),
            ) - pred_scores_clamped)
                .log()))
    .sum()
    .div_scalar((obj_targets.dims()[0] * obj_targets.dims()[1]) as f32);

    let matched = box_weights.clone().sum().div_scalar(4.0);
    let matched_scalar = matched
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(0.0);

    // Box regression and classification losses on matched preds only.
    let box_err = (pred_boxes - box_targets.clone()).abs() * box_weights.clone();
    let log_probs = log_softmax(class_logits, 2);
    let cls_err = -(class_targets * log_probs);
    let (box_loss, cls_loss) = if matched_scalar > 0.0 {
        (
            box_err.sum().div_scalar(matched_scalar),
            cls_err.sum().div_scalar(matched_scalar),
        )
    } else {
        // Zero scalars in the same tensor rank as the div output (rank 1).
        let device = box_weights.device();
        (
            Tensor::<ADBackend, 1>::from_data(TensorData::new(vec![0.0f32; 1], [1]), &device),
            Tensor::<ADBackend, 1>::from_data(TensorData::new(vec![0.0f32; 1], [1]), &device),
        )
    };

    box_loss * args.lambda_box + obj_loss * args.lambda_obj + cls_loss * args.lambda_cls
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            println!("note: built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

pub fn load_checkpoint<P: AsRef<Path>>(
    path: P,
    device: &<TrainBackend as Backend>::Device,
    max_boxes: usize,
    num_classes: usize,
) -> Result<CellDetector<TrainBackend>, RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    CellDetector::<TrainBackend>::new(
        CellDetectorConfig {
            max_boxes,
            num_classes,
            ..Default::default()
        },
        device,
    )
    .load_file(path.as_ref(), &recorder, device)
}

/// Assign each ground-truth box to its best prediction by IoU (greedy, per
/// sample) and derive objectness / box / class targets from the assignment.
pub fn build_greedy_targets<B: Backend>(
    pred_boxes: Tensor<B, 3>,
    gt_boxes: Tensor<B, 3>,
    gt_classes: Tensor<B, 2>,
    gt_mask: Tensor<B, 2>,
    num_classes: usize,
) -> (Tensor<B, 2>, Tensor<B, 3>, Tensor<B, 3>, Tensor<B, 3>) {
    let batch = pred_boxes.dims()[0];
    let max_pred = pred_boxes.dims()[1];
    let max_gt = gt_boxes.dims()[1];

    let gt_mask_vec = gt_mask
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    let gt_boxes_vec = gt_boxes
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    let gt_classes_vec = gt_classes
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    let pred_boxes_vec = pred_boxes
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();

    let mut obj_targets = vec![0.0f32; batch * max_pred];
    let mut box_targets = vec![0.0f32; batch * max_pred * 4];
    let mut box_weights = vec![0.0f32; batch * max_pred * 4];
    let mut class_targets = vec![0.0f32; batch * max_pred * num_classes];

    for b in 0..batch {
        for g in 0..max_gt {
            let mask_idx = b * max_gt + g;
            if gt_mask_vec.get(mask_idx).copied().unwrap_or(0.0) < 0.5 {
                continue;
            }
            let gb = [
                gt_boxes_vec[(b * max_gt + g) * 4],
                gt_boxes_vec[(b * max_gt + g) * 4 + 1],
                gt_boxes_vec[(b * max_gt + g) * 4 + 2],
                gt_boxes_vec[(b * max_gt + g) * 4 + 3],
            ];

            let mut best_iou = -1.0f32;
            let mut best_p = 0usize;
            for p in 0..max_pred {
                let pb = [
                    pred_boxes_vec[(b * max_pred + p) * 4],
                    pred_boxes_vec[(b * max_pred + p) * 4 + 1],
                    pred_boxes_vec[(b * max_pred + p) * 4 + 2],
                    pred_boxes_vec[(b * max_pred + p) * 4 + 3],
                ];
                let iou = iou_xyxy(pb, gb);
                if iou > best_iou {
                    best_iou = iou;
                    best_p = p;
                }
            }

            let obj_idx = b * max_pred + best_p;
            obj_targets[obj_idx] = 1.0;
            let bt_base = (b * max_pred + best_p) * 4;
            box_targets[bt_base..bt_base + 4].copy_from_slice(&gb);
            box_weights[bt_base..bt_base + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
            let class = (gt_classes_vec[mask_idx] as usize).min(num_classes - 1);
            class_targets[obj_idx * num_classes + class] = 1.0;
        }
    }

    let device = &B::Device::default();
    let obj_targets =
        Tensor::<B, 2>::from_data(TensorData::new(obj_targets, [batch, max_pred]), device);
    let box_targets =
        Tensor::<B, 3>::from_data(TensorData::new(box_targets, [batch, max_pred, 4]), device);
    let box_weights =
        Tensor::<B, 3>::from_data(TensorData::new(box_weights, [batch, max_pred, 4]), device);
    let class_targets = Tensor::<B, 3>::from_data(
        TensorData::new(class_targets, [batch, max_pred, num_classes]),
        device,
    );

    (obj_targets, box_targets, box_weights, class_targets)
}

pub fn iou_xyxy(a: [f32; 4], b: [f32; 4]) -> f32 {
    let ax0 = a[0].min(a[2]);
    let ay0 = a[1].min(a[3]);
    let ax1 = a[0].max(a[2]);
    let ay1 = a[1].max(a[3]);
    let bx0 = b[0].min(b[2]);
    let by0 = b[1].min(b[3]);
    let bx1 = b[0].max(b[2]);
    let by1 = b[1].max(b[3]);

    let inter_x0 = ax0.max(bx0);
    let inter_y0 = ay0.max(by0);
    let inter_x1 = ax1.min(bx1);
    let inter_y1 = ay1.min(by1);

    let inter_w = (inter_x1 - inter_x0).max(0.0);
    let inter_h = (inter_y1 - inter_y0).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (ax1 - ax0).max(0.0) * (ay1 - ay0).max(0.0);
    let area_b = (bx1 - bx0).max(0.0) * (by1 - by0).max(0.0);
    let denom = area_a + area_b - inter_area;
    if denom <= 0.0 {
        0.0
    } else {
        inter_area / denom
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvalConfig {
    pub image_size: u32,
    pub batch_size: usize,
    pub max_boxes: usize,
    pub workers: usize,
    pub obj_thresh: f32,
    pub iou_thresh: f32,
}

impl EvalConfig {
    pub fn from_train_args(args: &TrainArgs) -> Self {
        Self {
            image_size: args.image_size,
            batch_size: args.batch_size.max(1),
            max_boxes: args.max_boxes,
            workers: args.workers,
            obj_thresh: args.obj_thresh,
            iou_thresh: args.iou_thresh,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvalMetrics {
    pub precision: f32,
    pub recall: f32,
    /// Detection accuracy: TP / (TP + FP + FN) at the IoU threshold with
    /// class agreement. The single summary metric reported after training.
    pub accuracy: f32,
}

pub fn evaluate<B: Backend>(
    model: &CellDetector<B>,
    samples: &[YoloSample],
    cfg: &EvalConfig,
) -> anyhow::Result<EvalMetrics> {
    let max_boxes = cfg.max_boxes.max(1);
    let num_classes = model.num_classes();
    let mut total_tp = 0f32;
    let mut total_fp = 0f32;
    let mut total_fn = 0f32;

    for chunk in samples.chunks(cfg.batch_size.max(1)) {
        let batch = collate::<B>(chunk, cfg.image_size, max_boxes, cfg.workers)?;
        let features = CellDetector::pool_features(batch.images.clone());
        let (pred_boxes, pred_scores, class_logits) = model.forward(features);

        let pred_boxes_vec = pred_boxes.into_data().to_vec::<f32>().unwrap_or_default();
        let scores_vec = pred_scores.into_data().to_vec::<f32>().unwrap_or_default();
        let logits_vec = class_logits.into_data().to_vec::<f32>().unwrap_or_default();
        let gt_boxes_vec = batch.boxes.into_data().to_vec::<f32>().unwrap_or_default();
        let gt_classes_vec = batch
            .classes
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        let gt_mask_vec = batch
            .box_mask
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();

        let max_pred = model.max_boxes();
        for b in 0..chunk.len() {
            let positive: Vec<usize> = (0..max_pred)
                .filter(|p| scores_vec[b * max_pred + p] > cfg.obj_thresh)
                .collect();
            let mut used = vec![false; max_pred];
            for g in 0..max_boxes {
                if gt_mask_vec[b * max_boxes + g] < 0.5 {
                    continue;
                }
                let gb = [
                    gt_boxes_vec[(b * max_boxes + g) * 4],
                    gt_boxes_vec[(b * max_boxes + g) * 4 + 1],
                    gt_boxes_vec[(b * max_boxes + g) * 4 + 2],
                    gt_boxes_vec[(b * max_boxes + g) * 4 + 3],
                ];
                let gt_class = gt_classes_vec[b * max_boxes + g] as usize;

                let mut best_iou = 0.0f32;
                let mut best_p: Option<usize> = None;
                for &p in &positive {
                    if used[p] {
                        continue;
                    }
                    let pb = [
                        pred_boxes_vec[(b * max_pred + p) * 4],
                        pred_boxes_vec[(b * max_pred + p) * 4 + 1],
                        pred_boxes_vec[(b * max_pred + p) * 4 + 2],
                        pred_boxes_vec[(b * max_pred + p) * 4 + 3],
                    ];
                    let iou = iou_xyxy(pb, gb);
                    if iou > best_iou {
                        best_iou = iou;
                        best_p = Some(p);
                    }
                }

                match best_p {
                    Some(p) if best_iou >= cfg.iou_thresh => {
                        let logits = &logits_vec
                            [(b * max_pred + p) * num_classes..(b * max_pred + p + 1) * num_classes];
                        let pred_class = argmax(logits);
                        if pred_class == gt_class {
                            used[p] = true;
                            total_tp += 1.0;
                        } else {
                            total_fn += 1.0;
                        }
                    }
                    _ => total_fn += 1.0,
                }
            }
            total_fp += positive.iter().filter(|&&p| !used[p]).count() as f32;
        }
    }

    let precision = if total_tp + total_fp > 0.0 {
        total_tp / (total_tp + total_fp)
    } else {
        0.0
    };
    let recall = if total_tp + total_fn > 0.0 {
        total_tp / (total_tp + total_fn)
    } else {
        0.0
    };
    let denom = total_tp + total_fp + total_fn;
    let accuracy = if denom > 0.0 { total_tp / denom } else { 1.0 };
    Ok(EvalMetrics {
        precision,
        recall,
        accuracy,
    })
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}
