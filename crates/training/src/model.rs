//! Burn module for the blood-cell detector.
//!
//! A small multibox head over pooled image features: linear stem, hidden
//! blocks, then box / objectness / class heads. The training driver treats
//! this as an opaque collaborator; no architecture work happens elsewhere.

use burn::module::Module;
use burn::nn;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Debug, Clone)]
pub struct CellDetectorConfig {
    pub hidden: usize,
    pub depth: usize,
    pub max_boxes: usize,
    pub num_classes: usize,
    /// Pooled feature dimension fed to the stem (per-channel image means).
    pub input_dim: usize,
}

impl Default for CellDetectorConfig {
    fn default() -> Self {
        Self {
            hidden: 128,
            depth: 2,
            max_boxes: 64,
            num_classes: 3,
            input_dim: 3,
        }
    }
}

#[derive(Debug, Module)]
pub struct CellDetector<B: Backend> {
    stem: nn::Linear<B>,
    blocks: Vec<nn::Linear<B>>,
    box_head: nn::Linear<B>,
    score_head: nn::Linear<B>,
    class_head: nn::Linear<B>,
    max_boxes: usize,
    num_classes: usize,
}

impl<B: Backend> CellDetector<B> {
    pub fn new(cfg: CellDetectorConfig, device: &B::Device) -> Self {
        let max_boxes = cfg.max_boxes.max(1);
        let num_classes = cfg.num_classes.max(1);
        let stem = nn::LinearConfig::new(cfg.input_dim, cfg.hidden).init(device);
        let mut blocks = Vec::new();
        for _ in 0..cfg.depth {
            blocks.push(nn::LinearConfig::new(cfg.hidden, cfg.hidden).init(device));
        }
        let box_head = nn::LinearConfig::new(cfg.hidden, max_boxes * 4).init(device);
        let score_head = nn::LinearConfig::new(cfg.hidden, max_boxes).init(device);
        let class_head = nn::LinearConfig::new(cfg.hidden, max_boxes * num_classes).init(device);
        Self {
            stem,
            blocks,
            box_head,
            score_head,
            class_head,
            max_boxes,
            num_classes,
        }
    }

    pub fn max_boxes(&self) -> usize {
        self.max_boxes
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Pool a [batch, 3, H, W] image tensor into per-channel means.
    pub fn pool_features(images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, _, _] = images.dims();
        images.mean_dim(3).mean_dim(2).reshape([batch, channels])
    }

    /// Forward pass: boxes [B, max_boxes, 4] (xyxy, sigmoid-squashed and
    /// min/max ordered), objectness scores [B, max_boxes], class logits
    /// [B, max_boxes, num_classes].
    pub fn forward(&self, input: Tensor<B, 2>) -> (Tensor<B, 3>, Tensor<B, 2>, Tensor<B, 3>) {
        let mut x = relu(self.stem.forward(input));
        for block in &self.blocks {
            x = relu(block.forward(x));
        }
        let boxes_flat = sigmoid(self.box_head.forward(x.clone()));
        let scores = sigmoid(self.score_head.forward(x.clone()));
        let class_logits = self.class_head.forward(x);
        let batch = boxes_flat.dims()[0];
        let boxes = boxes_flat.reshape([batch, self.max_boxes, 4]);
        let class_logits = class_logits.reshape([batch, self.max_boxes, self.num_classes]);

        // Enforce x0 <= x1, y0 <= y1 within [0,1] using arithmetic.
        let x0 = boxes.clone().slice([0..batch, 0..self.max_boxes, 0..1]);
        let y0 = boxes.clone().slice([0..batch, 0..self.max_boxes, 1..2]);
        let x1 = boxes.clone().slice([0..batch, 0..self.max_boxes, 2..3]);
        let y1 = boxes.clone().slice([0..batch, 0..self.max_boxes, 3..4]);

        let dx = x0.clone() - x1.clone();
        let dy = y0.clone() - y1.clone();
        let half = 0.5;

        let x_min = (x0.clone() + x1.clone() - dx.clone().abs()) * half;
        let x_max = (x0 + x1 + dx.abs()) * half;
        let y_min = (y0.clone() + y1.clone() - dy.clone().abs()) * half;
        let y_max = (y0 + y1 + dy.abs()) * half;

        let boxes_ordered = Tensor::cat(vec![x_min, y_min, x_max, y_max], 2);

        (boxes_ordered, scores, class_logits)
    }
}
