use clap::Parser;
use std::path::PathBuf;

use bccd_dataset::{clone_corpus, prepare, ClassTable, OverwritePolicy, PrepareConfig};

#[derive(Parser, Debug)]
#[command(
    name = "prepare",
    about = "Convert a VOC-annotated corpus into a YOLO train/val dataset with a data.yaml manifest"
)]
struct Args {
    /// Local corpus root containing the annotation and image subdirectories.
    #[arg(long, default_value = "temp_download/BCCD")]
    source_root: PathBuf,
    /// Optional git URL to clone the corpus from before preparing.
    #[arg(long)]
    clone_url: Option<String>,
    /// Directory the cloned checkout is placed in (removed after preparation).
    #[arg(long, default_value = "temp_download")]
    clone_dir: PathBuf,
    /// Output dataset root.
    #[arg(long, default_value = "datasets/BCCD")]
    output_root: PathBuf,
    /// Annotations subdirectory relative to the source root.
    #[arg(long, default_value = "Annotations")]
    annotations_subdir: String,
    /// Images subdirectory relative to the source root.
    #[arg(long, default_value = "JPEGImages")]
    images_subdir: String,
    /// Comma-separated class names defining the label indices.
    #[arg(long, value_delimiter = ',')]
    classes: Option<Vec<String>>,
    /// Fraction of records assigned to the train split.
    #[arg(long, default_value_t = 0.8)]
    train_ratio: f64,
    /// Shuffle seed for the train/val split.
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Fail instead of replacing a pre-existing output root.
    #[arg(long, default_value_t = false)]
    no_overwrite: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cloned = args.clone_url.is_some();
    if let Some(url) = &args.clone_url {
        if args.clone_dir.exists() {
            std::fs::remove_dir_all(&args.clone_dir)?;
        }
        clone_corpus(url, &args.clone_dir)?;
    }

    let cfg = PrepareConfig {
        source_root: args.source_root,
        annotations_subdir: args.annotations_subdir,
        images_subdir: args.images_subdir,
        output_root: args.output_root.clone(),
        classes: args.classes.map(ClassTable::new).unwrap_or_default(),
        train_ratio: args.train_ratio,
        seed: args.seed,
        overwrite: if args.no_overwrite {
            OverwritePolicy::Fail
        } else {
            OverwritePolicy::Replace
        },
    };
    let summary = prepare(&cfg)?;

    if cloned && args.clone_dir.exists() {
        std::fs::remove_dir_all(&args.clone_dir)?;
    }

    if summary.skipped_missing_image + summary.skipped_zero_dims > 0 {
        println!(
            "skipped {} records (missing image: {}, zero dimensions: {})",
            summary.skipped_missing_image + summary.skipped_zero_dims,
            summary.skipped_missing_image,
            summary.skipped_zero_dims
        );
    }
    println!("dataset ready at {}", args.output_root.display());
    Ok(())
}
