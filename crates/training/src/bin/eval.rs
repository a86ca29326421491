use clap::Parser;

use bccd_dataset::Split;
use training::dataset::load_split;
use training::util::{evaluate, load_checkpoint, validate_backend_choice, BackendKind, EvalConfig};
use training::{CellDetector, CellDetectorConfig, TrainBackend};

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate a cell detector checkpoint on the validation split (precision/recall by IoU)"
)]
struct Args {
    /// Dataset manifest (data.yaml) produced by the prepare step.
    #[arg(long, default_value = "datasets/BCCD/data.yaml")]
    data: String,
    /// Checkpoint path to load.
    #[arg(long)]
    checkpoint: Option<String>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    /// Square input size images are resized to.
    #[arg(long, default_value_t = 640)]
    image_size: u32,
    /// Maximum boxes per image (pads/truncates to this for collation).
    #[arg(long, default_value_t = 64)]
    max_boxes: usize,
    /// Batch size.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    /// Worker threads for image decoding during batch collation.
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// IoU threshold for a true positive.
    #[arg(long, default_value_t = 0.5)]
    iou_thresh: f32,
    /// Objectness threshold for counting a prediction.
    #[arg(long, default_value_t = 0.5)]
    obj_thresh: f32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let manifest_path = std::path::Path::new(&args.data);
    let (manifest, samples) = load_split(manifest_path, Split::Val)?;
    if samples.is_empty() {
        println!("No validation samples under {}", manifest_path.display());
        return Ok(());
    }
    let num_classes = manifest.names.len().max(1);

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let model = match &args.checkpoint {
        Some(p) => load_checkpoint(p, &device, args.max_boxes, num_classes).unwrap_or_else(|e| {
            println!("Failed to load checkpoint {p}; using fresh model ({e})");
            CellDetector::<TrainBackend>::new(
                CellDetectorConfig {
                    max_boxes: args.max_boxes,
                    num_classes,
                    ..Default::default()
                },
                &device,
            )
        }),
        None => {
            println!("No checkpoint provided; using fresh CellDetector");
            CellDetector::<TrainBackend>::new(
                CellDetectorConfig {
                    max_boxes: args.max_boxes,
                    num_classes,
                    ..Default::default()
                },
                &device,
            )
        }
    };

    let cfg = EvalConfig {
        image_size: args.image_size,
        batch_size: args.batch_size,
        max_boxes: args.max_boxes,
        workers: args.workers,
        obj_thresh: args.obj_thresh,
        iou_thresh: args.iou_thresh,
    };
    let metrics = evaluate(&model, &samples, &cfg)?;
    println!(
        "precision {:.4}, recall {:.4}, accuracy {:.4}",
        metrics.precision, metrics.recall, metrics.accuracy
    );
    Ok(())
}
