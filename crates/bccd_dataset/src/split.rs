//! Deterministic train/val split assignment.

use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Partition annotation stems into train and val lists.
///
/// Stems are sorted before shuffling so the assignment is independent of
/// filesystem enumeration order; the seeded shuffle makes repeated runs over
/// the same input set reproducible. The train list gets
/// `floor(train_ratio * n)` entries, val the remainder.
pub fn split_stems(
    mut stems: Vec<String>,
    train_ratio: f64,
    seed: u64,
) -> (Vec<String>, Vec<String>) {
    stems.sort();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    stems.shuffle(&mut rng);
    let cut = (stems.len() as f64 * train_ratio.clamp(0.0, 1.0)).floor() as usize;
    let val = stems.split_off(cut);
    (stems, val)
}
