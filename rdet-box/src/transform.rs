//! Delta transforms between anchors and rotated boxes.
//!
//! Rotated boxes are rows of `[cx, cy, w, h, theta]` with `theta` in
//! degrees. Regression deltas follow the usual center/size/angle
//! parameterization: offsets are relative to the anchor extents, sizes are
//! log-ratios, and the angle delta is expressed in radians on the wire and
//! converted back to degrees on decode.

use std::f64::consts::PI;

use burn::tensor::{backend::Backend, Tensor};

/// Per-channel normalization factors for the five delta channels
/// `[dx, dy, dw, dh, dtheta]`. Encode multiplies by them, decode divides.
pub type ScaleFactors = [f64; 5];

/// Decode regression deltas into absolute rotated boxes.
///
/// Inverse of [`rbox_encode`]. The expression is built from differentiable
/// tensor ops, so gradients flow from the decoded boxes back into `deltas`.
///
/// # Shapes
///
/// - anchors: `[num_anchors, 5]` rotated boxes
/// - deltas: `[num_anchors, 5]`
/// - output: `[num_anchors, 5]`
pub fn rbox_decode<B: Backend>(
    anchors: Tensor<B, 2>,
    deltas: Tensor<B, 2>,
    scale_factors: Option<ScaleFactors>,
) -> Tensor<B, 2> {
    assertions(&anchors, &deltas);

    let deltas = match scale_factors {
        Some(factors) => scale_columns(deltas, factors, false),
        None => deltas,
    };

    let anchor_cx = anchors.clone().narrow(1, 0, 1);
    let anchor_cy = anchors.clone().narrow(1, 1, 1);
    let anchor_w = anchors.clone().narrow(1, 2, 1);
    let anchor_h = anchors.clone().narrow(1, 3, 1);
    let anchor_theta = anchors.narrow(1, 4, 1);

    let dx = deltas.clone().narrow(1, 0, 1);
    let dy = deltas.clone().narrow(1, 1, 1);
    let dw = deltas.clone().narrow(1, 2, 1);
    let dh = deltas.clone().narrow(1, 3, 1);
    let dtheta = deltas.narrow(1, 4, 1);

    let cx = dx * anchor_w.clone() + anchor_cx;
    let cy = dy * anchor_h.clone() + anchor_cy;
    let w = dw.exp() * anchor_w;
    let h = dh.exp() * anchor_h;
    let theta = dtheta.mul_scalar(180.0 / PI) + anchor_theta;

    Tensor::cat(vec![cx, cy, w, h, theta], 1)
}

/// Encode ground-truth rotated boxes as regression deltas against anchors.
///
/// # Shapes
///
/// - anchors: `[num_anchors, 5]` rotated boxes
/// - gt_boxes: `[num_anchors, 5]` rotated boxes, row-aligned with anchors
/// - output: `[num_anchors, 5]`
pub fn rbox_encode<B: Backend>(
    anchors: Tensor<B, 2>,
    gt_boxes: Tensor<B, 2>,
    scale_factors: Option<ScaleFactors>,
) -> Tensor<B, 2> {
    assertions(&anchors, &gt_boxes);

    let anchor_cx = anchors.clone().narrow(1, 0, 1);
    let anchor_cy = anchors.clone().narrow(1, 1, 1);
    let anchor_w = anchors.clone().narrow(1, 2, 1);
    let anchor_h = anchors.clone().narrow(1, 3, 1);
    let anchor_theta = anchors.narrow(1, 4, 1);

    let gt_cx = gt_boxes.clone().narrow(1, 0, 1);
    let gt_cy = gt_boxes.clone().narrow(1, 1, 1);
    let gt_w = gt_boxes.clone().narrow(1, 2, 1);
    let gt_h = gt_boxes.clone().narrow(1, 3, 1);
    let gt_theta = gt_boxes.narrow(1, 4, 1);

    let dx = (gt_cx - anchor_cx) / anchor_w.clone();
    let dy = (gt_cy - anchor_cy) / anchor_h.clone();
    let dw = (gt_w / anchor_w).log();
    let dh = (gt_h / anchor_h).log();
    let dtheta = (gt_theta - anchor_theta).mul_scalar(PI / 180.0);

    let deltas = Tensor::cat(vec![dx, dy, dw, dh, dtheta], 1);
    match scale_factors {
        Some(factors) => scale_columns(deltas, factors, true),
        None => deltas,
    }
}

/// Convert axis-aligned anchors `[x1, y1, x2, y2]` to rotated form.
///
/// Extents use the inclusive pixel convention (`x2 - x1 + 1`). The x-extent
/// lands in the `h` slot and the y-extent in the `w` slot; with
/// `theta = -90` the rotated rectangle covers the same axis-aligned region.
///
/// # Shapes
///
/// - anchors: `[num_anchors, 4]`
/// - output: `[num_anchors, 5]`
pub fn hbox_to_rbox<B: Backend>(anchors: Tensor<B, 2>) -> Tensor<B, 2> {
    let dims = anchors.dims();
    assert_eq!(
        dims[1], 4,
        "Axis-aligned anchors must have 4 columns, got shape {dims:?}"
    );

    let x1 = anchors.clone().narrow(1, 0, 1);
    let y1 = anchors.clone().narrow(1, 1, 1);
    let x2 = anchors.clone().narrow(1, 2, 1);
    let y2 = anchors.narrow(1, 3, 1);

    let cx = (x1.clone() + x2.clone()).div_scalar(2.0);
    let cy = (y1.clone() + y2.clone()).div_scalar(2.0);
    let h = (x2 - x1).add_scalar(1.0);
    let w = (y2 - y1).add_scalar(1.0);
    let theta = cx.ones_like().mul_scalar(-90.0);

    Tensor::cat(vec![cx, cy, w, h, theta], 1)
}

fn scale_columns<B: Backend>(
    deltas: Tensor<B, 2>,
    factors: ScaleFactors,
    encode: bool,
) -> Tensor<B, 2> {
    let columns = (0..5)
        .map(|i| {
            let column = deltas.clone().narrow(1, i, 1);
            if encode {
                column.mul_scalar(factors[i])
            } else {
                column.div_scalar(factors[i])
            }
        })
        .collect();
    Tensor::cat(columns, 1)
}

fn assertions<B: Backend>(anchors: &Tensor<B, 2>, deltas: &Tensor<B, 2>) {
    let anchor_dims = anchors.dims();
    let delta_dims = deltas.dims();
    assert_eq!(
        anchor_dims[1], 5,
        "Rotated anchors must have 5 columns, got shape {anchor_dims:?}"
    );
    assert_eq!(
        anchor_dims, delta_dims,
        "Shape of anchors ({anchor_dims:?}) must match deltas ({delta_dims:?})"
    );
}
