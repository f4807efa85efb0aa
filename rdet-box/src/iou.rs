//! Pairwise rotated-rectangle intersection over union.
//!
//! Overlap between two rotated rectangles is computed on the host: corner
//! expansion, convex polygon clipping (Sutherland-Hodgman) and shoelace
//! area. The tensor wrapper round-trips through [`burn::tensor::TensorData`],
//! so the returned overlap tensor carries no gradient history — callers that
//! need the overlap as a training signal multiply it against a
//! differentiable term instead.

use core::f32::consts::PI;

use burn::tensor::{backend::Backend, Tensor};

/// Guard added to the union before division, matching the reference
/// implementation of the overlap routine.
const AREA_EPS: f32 = 1e-5;

type Point = [f32; 2];

/// Row-aligned IoU between two sets of rotated boxes `[cx, cy, w, h, theta]`
/// with `theta` in degrees.
///
/// Returns one overlap ratio per row pair, in `[0, 1]` for boxes with
/// positive extents. This is pairwise, not all-pairs: `out[i]` compares
/// `boxes_a[i]` with `boxes_b[i]`.
pub fn rotated_iou(boxes_a: &[[f32; 5]], boxes_b: &[[f32; 5]]) -> Vec<f32> {
    assert_eq!(
        boxes_a.len(),
        boxes_b.len(),
        "Pairwise IoU requires equally many boxes, got {} and {}",
        boxes_a.len(),
        boxes_b.len()
    );

    boxes_a
        .iter()
        .zip(boxes_b)
        .map(|(a, b)| {
            let clipped = clip_polygon(corners(a).to_vec(), &corners(b));
            let inter = if clipped.len() >= 3 {
                polygon_area(&clipped)
            } else {
                0.0
            };
            let area_a = a[2] * a[3];
            let area_b = b[2] * b[3];
            inter / (area_a + area_b - inter + AREA_EPS)
        })
        .collect()
}

/// Tensor front end for [`rotated_iou`].
///
/// # Shapes
///
/// - boxes_a: `[num_boxes, 5]`
/// - boxes_b: `[num_boxes, 5]`
/// - output: `[num_boxes]`, constant with respect to both inputs
pub fn rotated_iou_tensor<B: Backend>(
    boxes_a: Tensor<B, 2>,
    boxes_b: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let a_dims = boxes_a.dims();
    let b_dims = boxes_b.dims();
    assert_eq!(
        a_dims, b_dims,
        "Shape of boxes_a ({a_dims:?}) must match boxes_b ({b_dims:?})"
    );
    assert_eq!(
        a_dims[1], 5,
        "Rotated boxes must have 5 columns, got shape {a_dims:?}"
    );

    let device = boxes_a.device();
    let overlaps = rotated_iou(&to_rows(boxes_a), &to_rows(boxes_b));
    Tensor::from_floats(overlaps.as_slice(), &device)
}

fn to_rows<B: Backend>(boxes: Tensor<B, 2>) -> Vec<[f32; 5]> {
    let data = boxes.into_data().convert::<f32>();
    let values = data.as_slice::<f32>().unwrap();
    values
        .chunks_exact(5)
        .map(|row| [row[0], row[1], row[2], row[3], row[4]])
        .collect()
}

/// Corner coordinates in counter-clockwise order.
fn corners(rbox: &[f32; 5]) -> [Point; 4] {
    let [cx, cy, w, h, theta] = *rbox;
    let radians = theta * PI / 180.0;
    let (sin_t, cos_t) = (libm::sinf(radians), libm::cosf(radians));

    let offsets = [
        [w / 2.0, h / 2.0],
        [-w / 2.0, h / 2.0],
        [-w / 2.0, -h / 2.0],
        [w / 2.0, -h / 2.0],
    ];
    offsets.map(|[ox, oy]| {
        [
            cx + cos_t * ox - sin_t * oy,
            cy + sin_t * ox + cos_t * oy,
        ]
    })
}

fn polygon_area(points: &[Point]) -> f32 {
    let mut doubled = 0.0;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        doubled += p[0] * q[1] - q[0] * p[1];
    }
    doubled.abs() / 2.0
}

/// Sutherland-Hodgman clip of a convex subject polygon against a convex,
/// counter-clockwise clip rectangle.
fn clip_polygon(subject: Vec<Point>, clip: &[Point; 4]) -> Vec<Point> {
    let mut output = subject;
    for i in 0..clip.len() {
        let edge_start = clip[i];
        let edge_end = clip[(i + 1) % clip.len()];

        let input = core::mem::take(&mut output);
        if input.is_empty() {
            break;
        }

        let mut prev = *input.last().unwrap();
        for point in input {
            let point_inside = inside(edge_start, edge_end, point);
            if point_inside != inside(edge_start, edge_end, prev) {
                output.push(line_intersection(prev, point, edge_start, edge_end));
            }
            if point_inside {
                output.push(point);
            }
            prev = point;
        }
    }
    output
}

/// Left of (or on) the directed edge `a -> b`.
fn inside(a: Point, b: Point, p: Point) -> bool {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0]) >= 0.0
}

/// Intersection of segment `p -> q` with the infinite line through `a -> b`.
fn line_intersection(p: Point, q: Point, a: Point, b: Point) -> Point {
    let segment = [q[0] - p[0], q[1] - p[1]];
    let edge = [b[0] - a[0], b[1] - a[1]];
    let denom = edge[0] * segment[1] - edge[1] * segment[0];
    if denom.abs() < f32::EPSILON {
        // parallel within float precision; the endpoint is as good as any
        return q;
    }
    let t = (edge[0] * (a[1] - p[1]) - edge[1] * (a[0] - p[0])) / denom;
    [p[0] + t * segment[0], p[1] + t * segment[1]]
}
