//! Loading prepared YOLO datasets into Burn batches.

use bccd_dataset::{Manifest, Split, YoloBox};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::imageops::FilterType;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy)]
pub struct LabeledBox {
    pub class: usize,
    pub bbox: YoloBox,
}

#[derive(Debug, Clone)]
pub struct YoloSample {
    pub image: PathBuf,
    pub boxes: Vec<LabeledBox>,
}

#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    pub images: Tensor<B, 4>,
    /// Normalized xyxy boxes per sample (shape: [batch, max_boxes, 4]).
    pub boxes: Tensor<B, 3>,
    /// Class index per box slot, stored as f32 (shape: [batch, max_boxes]).
    pub classes: Tensor<B, 2>,
    /// Mask indicating which box slots are populated (shape: [batch, max_boxes]).
    pub box_mask: Tensor<B, 2>,
}

/// Load one split of a prepared dataset via its `data.yaml` manifest.
///
/// The preparer guarantees each label file has a same-stem image; a tree
/// that violates that invariant fails loudly here.
pub fn load_split(
    manifest_path: &Path,
    split: Split,
) -> anyhow::Result<(Manifest, Vec<YoloSample>)> {
    let manifest = Manifest::load(manifest_path)?;
    let root = manifest_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&manifest.path);
    let images_dir = match split {
        Split::Train => root.join(&manifest.train),
        Split::Val => root.join(&manifest.val),
    };
    let labels_dir = root.join("labels").join(split.as_str());

    let mut label_paths: Vec<PathBuf> = fs::read_dir(&labels_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("txt"))
        .collect();
    label_paths.sort();

    let mut samples = Vec::new();
    for label_path in label_paths {
        let stem = label_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let image = images_dir.join(format!("{stem}.jpg"));
        if !image.exists() {
            anyhow::bail!(
                "image file missing for label {}: {}",
                label_path.display(),
                image.display()
            );
        }
        let boxes = parse_label_file(&label_path)?;
        samples.push(YoloSample { image, boxes });
    }
    Ok((manifest, samples))
}

fn parse_label_file(path: &Path) -> anyhow::Result<Vec<LabeledBox>> {
    let raw = fs::read_to_string(path)?;
    let mut boxes = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            anyhow::bail!(
                "malformed label line {} in {}: expected 5 fields, got {}",
                lineno + 1,
                path.display(),
                fields.len()
            );
        }
        let class: usize = fields[0]
            .parse()
            .map_err(|e| anyhow::anyhow!("bad class index in {}: {e}", path.display()))?;
        let mut coords = [0.0f64; 4];
        for (slot, field) in coords.iter_mut().zip(&fields[1..]) {
            *slot = field
                .parse()
                .map_err(|e| anyhow::anyhow!("bad coordinate in {}: {e}", path.display()))?;
        }
        boxes.push(LabeledBox {
            class,
            bbox: YoloBox {
                cx: coords[0],
                cy: coords[1],
                w: coords[2],
                h: coords[3],
            },
        });
    }
    Ok(boxes)
}

/// Collate samples into a batch, resizing every image to `image_size` square.
///
/// Image decoding is spread over `workers` threads. Boxes are normalized, so
/// the resize leaves them untouched; they are converted from
/// center-width-height to xyxy for IoU matching and padded or truncated to
/// `max_boxes` with a populate mask.
pub fn collate<B: Backend>(
    samples: &[YoloSample],
    image_size: u32,
    max_boxes: usize,
    workers: usize,
) -> anyhow::Result<Batch<B>> {
    if samples.is_empty() {
        anyhow::bail!("cannot collate empty batch");
    }
    let max_boxes = max_boxes.max(1);
    let side = image_size as usize;
    let batch = samples.len();

    let mut image_buf: Vec<f32> = Vec::with_capacity(batch * 3 * side * side);
    for plane in decode_images(samples, image_size, workers)? {
        image_buf.extend_from_slice(&plane);
    }

    let mut boxes_buf = vec![0.0f32; batch * max_boxes * 4];
    let mut class_buf = vec![0.0f32; batch * max_boxes];
    let mut mask_buf = vec![0.0f32; batch * max_boxes];

    for (b, sample) in samples.iter().enumerate() {
        for (i, lb) in sample.boxes.iter().take(max_boxes).enumerate() {
            let bb = &lb.bbox;
            let x0 = (bb.cx - bb.w / 2.0) as f32;
            let y0 = (bb.cy - bb.h / 2.0) as f32;
            let x1 = (bb.cx + bb.w / 2.0) as f32;
            let y1 = (bb.cy + bb.h / 2.0) as f32;
            let base = (b * max_boxes + i) * 4;
            boxes_buf[base..base + 4].copy_from_slice(&[x0, y0, x1, y1]);
            class_buf[b * max_boxes + i] = lb.class as f32;
            mask_buf[b * max_boxes + i] = 1.0;
        }
    }

    let device = &B::Device::default();
    let images = Tensor::<B, 4>::from_data(
        TensorData::new(image_buf, [batch, 3, side, side]),
        device,
    );
    let boxes =
        Tensor::<B, 3>::from_data(TensorData::new(boxes_buf, [batch, max_boxes, 4]), device);
    let classes =
        Tensor::<B, 2>::from_data(TensorData::new(class_buf, [batch, max_boxes]), device);
    let box_mask =
        Tensor::<B, 2>::from_data(TensorData::new(mask_buf, [batch, max_boxes]), device);

    Ok(Batch {
        images,
        boxes,
        classes,
        box_mask,
    })
}

/// Decode every sample image into a normalized CHW plane, in sample order.
fn decode_images(
    samples: &[YoloSample],
    image_size: u32,
    workers: usize,
) -> anyhow::Result<Vec<Vec<f32>>> {
    let workers = workers.clamp(1, samples.len());
    if workers == 1 {
        return samples
            .iter()
            .map(|s| decode_image(&s.image, image_size))
            .collect();
    }

    let chunk = samples.len().div_ceil(workers);
    std::thread::scope(|scope| {
        let handles: Vec<_> = samples
            .chunks(chunk)
            .map(|part| {
                scope.spawn(move || {
                    part.iter()
                        .map(|s| decode_image(&s.image, image_size))
                        .collect::<anyhow::Result<Vec<Vec<f32>>>>()
                })
            })
            .collect();
        let mut planes = Vec::with_capacity(samples.len());
        for handle in handles {
            let part = handle
                .join()
                .map_err(|_| anyhow::anyhow!("image decode worker panicked"))?;
            planes.extend(part?);
        }
        Ok(planes)
    })
}

fn decode_image(path: &Path, image_size: u32) -> anyhow::Result<Vec<f32>> {
    let img = image::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open image {path:?}: {e}"))?
        .resize_exact(image_size, image_size, FilterType::Triangle)
        .to_rgb8();

    let side = image_size as usize;
    let mut plane = Vec::with_capacity(3 * side * side);
    for c in 0..3 {
        for y in 0..image_size {
            for x in 0..image_size {
                plane.push(img.get_pixel(x, y)[c] as f32 / 255.0);
            }
        }
    }
    Ok(plane)
}
