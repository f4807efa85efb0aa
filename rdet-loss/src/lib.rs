//! Training losses for anchor-based rotated-object detection.
//!
//! This crate computes the classification and box-regression losses of a
//! rotated-object detector on the Burn deep learning framework. All loss
//! functions share the same anchor-state protocol: every input tensor is a
//! parallel array over the anchor axis, and a per-anchor integer state
//! (`-1` ignore, `0` negative, `1` positive) selects which rows each loss
//! sees.
//!
//! ## Loss functions
//!
//! - **[`FocalLoss`]**: binary focal loss over non-ignored anchors,
//!   numerically stable logit formulation
//! - **[`SmoothL1Loss`]**: smooth-L1 regression over positive anchors with
//!   optional per-anchor weights
//! - **[`IouSmoothL1LogLoss`]** / **[`IouSmoothL1ExpLoss`]**: smooth-L1
//!   reweighted by the rotated overlap between decoded predictions and
//!   ground truth
//! - **[`AngleFocalLoss`]**: positive-only focal loss for an auxiliary
//!   angle-classification head, epsilon-guarded cross-entropy
//! - **[`DetectionLoss`]**: the components above combined under one
//!   configuration with per-component weights
//!
//! ## Normalization and gradient isolation
//!
//! Every loss reduces as `sum / max(1, #positive anchors)`. The normalizer
//! and the IoU reweighting factors are constants for backpropagation: the
//! normalizer is computed on the host, and the factors are explicitly
//! detached so gradients only flow through the live smooth-L1 term. This
//! boundary changes gradients, not forward values, and is part of the
//! contract.
//!
//! ## Usage example
//!
//! ```rust
//! use rdet_loss::{FocalLoss, FocalLossConfig, SmoothL1LossConfig};
//!
//! fn build_losses() -> (FocalLoss, rdet_loss::SmoothL1Loss) {
//!     let focal = FocalLossConfig::new().with_gamma(2.0).init();
//!     let smooth_l1 = SmoothL1LossConfig::new().with_sigma(3.0).init();
//!     (focal, smooth_l1)
//! }
//! ```

mod anchor;
mod angle_focal;
mod detection;
mod focal;
mod iou_smooth_l1;
mod smooth_l1;

pub use anchor::{
    filter_indices, gather_rows, non_ignored_indices, positive_indices, positive_normalizer,
};
pub use angle_focal::{AngleFocalLoss, AngleFocalLossConfig};
pub use detection::{
    DetectionBatch, DetectionLoss, DetectionLossConfig, DetectionLossError, RegressionLoss,
    RegressionVariant,
};
pub use focal::{FocalLoss, FocalLossConfig};
pub use iou_smooth_l1::{
    AnchorMethod, IouSmoothL1ExpLoss, IouSmoothL1ExpLossConfig, IouSmoothL1LogLoss,
    IouSmoothL1LogLossConfig,
};
pub use smooth_l1::{SmoothL1Loss, SmoothL1LossConfig};
