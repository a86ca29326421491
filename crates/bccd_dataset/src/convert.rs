//! Coordinate conversion to the YOLO label format.

use crate::types::{PixelBox, YoloBox};

/// Convert a pixel-space box to normalized center-width-height form.
///
/// No clamping is performed: a box extending past the image edge yields
/// values outside [0, 1], which downstream consumers must tolerate.
pub fn to_yolo(width: u32, height: u32, b: &PixelBox) -> YoloBox {
    let w = f64::from(width);
    let h = f64::from(height);
    YoloBox {
        cx: (b.xmin + b.xmax) / 2.0 / w,
        cy: (b.ymin + b.ymax) / 2.0 / h,
        w: (b.xmax - b.xmin) / w,
        h: (b.ymax - b.ymin) / h,
    }
}

/// One label-file line: `<class_index> <cx> <cy> <w> <h>`.
pub fn format_label_line(class_id: usize, b: &YoloBox) -> String {
    format!(
        "{} {} {} {} {}",
        class_id,
        format_coord(b.cx),
        format_coord(b.cy),
        format_coord(b.w),
        format_coord(b.h)
    )
}

/// Render a coordinate with at most six decimal places, trailing zeros trimmed.
fn format_coord(v: f64) -> String {
    let s = format!("{v:.6}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}
