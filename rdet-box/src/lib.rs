//! Rotated bounding-box geometry for anchor-based detection.
//!
//! This crate provides the geometric primitives a rotated-object detector
//! needs around its regression head:
//!
//! - [`rbox_decode`] / [`rbox_encode`]: delta transforms between anchors and
//!   absolute rotated boxes `[cx, cy, w, h, theta]` (degrees), with optional
//!   per-channel scale factors
//! - [`hbox_to_rbox`]: axis-aligned to rotated anchor conversion
//! - [`rotated_iou`] / [`rotated_iou_tensor`]: pairwise rotated-rectangle
//!   overlap ratios
//!
//! The transforms are differentiable Burn tensor expressions. The overlap
//! routine runs on host data and returns constants; see [`rotated_iou_tensor`]
//! for the implications on gradient flow.

mod iou;
mod transform;

pub use iou::{rotated_iou, rotated_iou_tensor};
pub use transform::{hbox_to_rbox, rbox_decode, rbox_encode, ScaleFactors};
