#![recursion_limit = "256"]

pub mod dataset;
pub mod model;
pub mod util;

pub use dataset::{collate, load_split, Batch, LabeledBox, YoloSample};
pub use model::{CellDetector, CellDetectorConfig};
pub use util::{run_train, TrainArgs};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
