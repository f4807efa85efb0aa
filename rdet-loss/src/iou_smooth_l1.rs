//! IoU-reweighted smooth-L1 losses for rotated-box regression.
//!
//! Both variants rescale the per-anchor smooth-L1 sum by a factor derived
//! from the rotated overlap between the decoded predictions and the
//! ground-truth boxes:
//!
//! - log variant: `-ln(overlap) / (reg_loss + epsilon)`
//! - exp variant: `(exp(alpha * (1 - overlap)^beta) - 1) / (reg_loss + epsilon)`
//!
//! The factor itself is detached: badly localized boxes receive a larger
//! effective loss, but gradients only flow through the live smooth-L1 term
//! the factor multiplies. A factor of this shape explodes as the overlap
//! approaches zero and vanishes at a perfect match, regardless of the raw
//! residual magnitude.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Ignored, Module, ModuleDisplay},
    tensor::{backend::Backend, Int, Tensor},
};
use rdet_box::{hbox_to_rbox, rbox_decode, rotated_iou_tensor, ScaleFactors};

use crate::anchor::{gather_rows, positive_indices, positive_normalizer};
use crate::smooth_l1::smooth_l1_elementwise;

/// Anchor-box representation produced by the anchor generator.
#[derive(Config, Debug, PartialEq)]
pub enum AnchorMethod {
    /// Axis-aligned `[x1, y1, x2, y2]` anchors, converted to rotated form
    /// on the fly (except in refine stages, which already operate on
    /// rotated boxes).
    Horizontal,
    /// Rotated `[cx, cy, w, h, theta]` anchors.
    Rotated,
}

/// Configuration for creating an [IoU smooth-L1 log loss](IouSmoothL1LogLoss).
#[derive(Config, Debug)]
pub struct IouSmoothL1LogLossConfig {
    /// Transition point control for the smooth-L1 term. Default: 3.0
    #[config(default = 3.0)]
    pub sigma: f64,

    /// Guard added to the detached regression loss before division.
    /// Default: 1e-5
    #[config(default = 1e-5)]
    pub epsilon: f64,

    /// Per-channel delta normalization factors, if the encoder used any.
    #[config(default = "None")]
    pub anchor_scale_factors: Option<ScaleFactors>,

    /// Anchor-box representation.
    #[config(default = "AnchorMethod::Rotated")]
    pub method: AnchorMethod,
}

impl IouSmoothL1LogLossConfig {
    /// Initialize [IoU smooth-L1 log loss](IouSmoothL1LogLoss).
    pub fn init(&self) -> IouSmoothL1LogLoss {
        assertions(self.sigma, self.epsilon);
        IouSmoothL1LogLoss {
            sigma: self.sigma,
            epsilon: self.epsilon,
            anchor_scale_factors: Ignored(self.anchor_scale_factors),
            method: Ignored(self.method.clone()),
        }
    }
}

/// IoU-reweighted smooth-L1 loss, logarithmic variant.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct IouSmoothL1LogLoss {
    /// Transition point control for the smooth-L1 term.
    pub sigma: f64,
    /// Guard added to the detached regression loss before division.
    pub epsilon: f64,
    /// Per-channel delta normalization factors.
    pub anchor_scale_factors: Ignored<Option<ScaleFactors>>,
    /// Anchor-box representation.
    pub method: Ignored<AnchorMethod>,
}

impl Default for IouSmoothL1LogLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDisplay for IouSmoothL1LogLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("sigma", &self.sigma)
            .add("epsilon", &self.epsilon)
            .optional()
    }
}

impl IouSmoothL1LogLoss {
    /// Create a new loss with default configuration.
    pub fn new() -> Self {
        IouSmoothL1LogLossConfig::new().init()
    }

    /// Compute the reweighted regression loss over positive anchors.
    ///
    /// `is_refine` marks refine-stage calls whose anchors are already
    /// rotated even under the horizontal method.
    ///
    /// # Shapes
    ///
    /// - targets: `[num_anchors, 5]` encoded deltas
    /// - preds: `[num_anchors, 5]` raw regression outputs
    /// - anchor_state: `[num_anchors]`
    /// - target_boxes: `[num_anchors, 6]` ground-truth rotated boxes plus a
    ///   trailing class column (stripped before the overlap computation)
    /// - anchors: `[num_anchors, 4]` (horizontal method, first stage) or
    ///   `[num_anchors, 5]`
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        targets: Tensor<B, 2>,
        preds: Tensor<B, 2>,
        anchor_state: Tensor<B, 1, Int>,
        target_boxes: Tensor<B, 2>,
        anchors: Tensor<B, 2>,
        is_refine: bool,
    ) -> Tensor<B, 1> {
        let device = preds.device();
        let terms = regression_terms(
            self.sigma * self.sigma,
            &self.method.0,
            self.anchor_scale_factors.0,
            targets,
            preds,
            &anchor_state,
            target_boxes,
            anchors,
            is_refine,
        );
        let Some((regression_loss, overlaps)) = terms else {
            return Tensor::zeros([1], &device);
        };

        let iou_factor = overlaps.log().neg().detach()
            / regression_loss.clone().detach().add_scalar(self.epsilon);

        (regression_loss * iou_factor)
            .sum()
            .div_scalar(positive_normalizer(&anchor_state))
    }
}

/// Configuration for creating an [IoU smooth-L1 exp loss](IouSmoothL1ExpLoss).
#[derive(Config, Debug)]
pub struct IouSmoothL1ExpLossConfig {
    /// Transition point control for the smooth-L1 term. Default: 3.0
    #[config(default = 3.0)]
    pub sigma: f64,

    /// Steepness of the reweighting curve. Default: 1.0
    #[config(default = 1.0)]
    pub alpha: f64,

    /// Shape of the reweighting curve. Default: 1.0
    #[config(default = 1.0)]
    pub beta: f64,

    /// Guard added to the detached regression loss before division.
    /// Default: 1e-5
    #[config(default = 1e-5)]
    pub epsilon: f64,

    /// Per-channel delta normalization factors, if the encoder used any.
    #[config(default = "None")]
    pub anchor_scale_factors: Option<ScaleFactors>,

    /// Anchor-box representation.
    #[config(default = "AnchorMethod::Rotated")]
    pub method: AnchorMethod,
}

impl IouSmoothL1ExpLossConfig {
    /// Initialize [IoU smooth-L1 exp loss](IouSmoothL1ExpLoss).
    pub fn init(&self) -> IouSmoothL1ExpLoss {
        assertions(self.sigma, self.epsilon);
        assert!(
            self.alpha > 0.0 && self.beta > 0.0,
            "Alpha and beta for IouSmoothL1ExpLoss must be positive, got {} and {}",
            self.alpha,
            self.beta
        );
        IouSmoothL1ExpLoss {
            sigma: self.sigma,
            alpha: self.alpha,
            beta: self.beta,
            epsilon: self.epsilon,
            anchor_scale_factors: Ignored(self.anchor_scale_factors),
            method: Ignored(self.method.clone()),
        }
    }
}

/// IoU-reweighted smooth-L1 loss, exponential variant.
///
/// Identical to the log variant except for the reweighting curve, whose
/// steepness is tunable through `alpha` and `beta`.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct IouSmoothL1ExpLoss {
    /// Transition point control for the smooth-L1 term.
    pub sigma: f64,
    /// Steepness of the reweighting curve.
    pub alpha: f64,
    /// Shape of the reweighting curve.
    pub beta: f64,
    /// Guard added to the detached regression loss before division.
    pub epsilon: f64,
    /// Per-channel delta normalization factors.
    pub anchor_scale_factors: Ignored<Option<ScaleFactors>>,
    /// Anchor-box representation.
    pub method: Ignored<AnchorMethod>,
}

impl Default for IouSmoothL1ExpLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDisplay for IouSmoothL1ExpLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("sigma", &self.sigma)
            .add("alpha", &self.alpha)
            .add("beta", &self.beta)
            .add("epsilon", &self.epsilon)
            .optional()
    }
}

impl IouSmoothL1ExpLoss {
    /// Create a new loss with default configuration.
    pub fn new() -> Self {
        IouSmoothL1ExpLossConfig::new().init()
    }

    /// Compute the reweighted regression loss over positive anchors.
    ///
    /// Same contract as [`IouSmoothL1LogLoss::forward`].
    pub fn forward<B: Backend>(
        &self,
        targets: Tensor<B, 2>,
        preds: Tensor<B, 2>,
        anchor_state: Tensor<B, 1, Int>,
        target_boxes: Tensor<B, 2>,
        anchors: Tensor<B, 2>,
        is_refine: bool,
    ) -> Tensor<B, 1> {
        let device = preds.device();
        let terms = regression_terms(
            self.sigma * self.sigma,
            &self.method.0,
            self.anchor_scale_factors.0,
            targets,
            preds,
            &anchor_state,
            target_boxes,
            anchors,
            is_refine,
        );
        let Some((regression_loss, overlaps)) = terms else {
            return Tensor::zeros([1], &device);
        };

        let curve = (overlaps.ones_like() - overlaps)
            .powf_scalar(self.beta)
            .mul_scalar(self.alpha)
            .exp()
            .sub_scalar(1.0);
        let iou_factor =
            curve.detach() / regression_loss.clone().detach().add_scalar(self.epsilon);

        (regression_loss * iou_factor)
            .sum()
            .div_scalar(positive_normalizer(&anchor_state))
    }
}

/// Shared pipeline: filter positives, decode predictions, compute the
/// per-anchor smooth-L1 sum and the rotated overlap against the
/// class-stripped target boxes. `None` when no anchor is positive.
#[allow(clippy::too_many_arguments)]
fn regression_terms<B: Backend>(
    sigma_squared: f64,
    method: &AnchorMethod,
    scale_factors: Option<ScaleFactors>,
    targets: Tensor<B, 2>,
    preds: Tensor<B, 2>,
    anchor_state: &Tensor<B, 1, Int>,
    target_boxes: Tensor<B, 2>,
    anchors: Tensor<B, 2>,
    is_refine: bool,
) -> Option<(Tensor<B, 2>, Tensor<B, 2>)> {
    shape_assertions(
        &targets,
        &preds,
        anchor_state,
        &target_boxes,
        &anchors,
        method,
        is_refine,
    );

    let kept = positive_indices(anchor_state);
    if kept.is_empty() {
        return None;
    }

    let anchors = match method {
        AnchorMethod::Horizontal if !is_refine => hbox_to_rbox(anchors),
        _ => anchors,
    };

    let preds = gather_rows(preds, &kept);
    let targets = gather_rows(targets, &kept);
    let target_boxes = gather_rows(target_boxes, &kept);
    let anchors = gather_rows(anchors, &kept);

    let boxes_pred = rbox_decode(anchors, preds.clone(), scale_factors);

    let regression_loss = smooth_l1_elementwise(preds - targets, sigma_squared).sum_dim(1);

    let gt_boxes = target_boxes.narrow(1, 0, 5);
    let overlaps = rotated_iou_tensor(boxes_pred, gt_boxes).reshape([-1, 1]);

    Some((regression_loss, overlaps))
}

fn shape_assertions<B: Backend>(
    targets: &Tensor<B, 2>,
    preds: &Tensor<B, 2>,
    anchor_state: &Tensor<B, 1, Int>,
    target_boxes: &Tensor<B, 2>,
    anchors: &Tensor<B, 2>,
    method: &AnchorMethod,
    is_refine: bool,
) {
    let target_dims = targets.dims();
    let pred_dims = preds.dims();
    let [num_anchors] = anchor_state.dims();
    let box_dims = target_boxes.dims();
    let anchor_dims = anchors.dims();

    assert_eq!(
        target_dims, pred_dims,
        "Shape of targets ({target_dims:?}) must match predictions ({pred_dims:?})"
    );
    assert_eq!(
        target_dims[1], 5,
        "Rotated regression targets must have 5 columns, got shape {target_dims:?}"
    );
    assert_eq!(
        target_dims[0], num_anchors,
        "Anchor count in targets ({}) must match anchor_state ({num_anchors})",
        target_dims[0]
    );
    assert_eq!(
        box_dims,
        [num_anchors, 6],
        "Target boxes must be [num_anchors, 6] (5 coordinates plus class), got {box_dims:?}"
    );

    let expected_anchor_cols = match method {
        AnchorMethod::Horizontal if !is_refine => 4,
        _ => 5,
    };
    assert_eq!(
        anchor_dims,
        [num_anchors, expected_anchor_cols],
        "Anchors must be [num_anchors, {expected_anchor_cols}] for this method, got {anchor_dims:?}"
    );
}

fn assertions(sigma: f64, epsilon: f64) {
    assert!(sigma > 0.0, "Sigma must be positive, got {sigma}");
    assert!(epsilon > 0.0, "Epsilon must be positive, got {epsilon}");
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::Autodiff,
        tensor::{TensorData, Tolerance},
    };

    use super::*;
    use crate::tests::TestBackend;

    fn single_positive_inputs(
        device: &<TestBackend as Backend>::Device,
    ) -> (
        Tensor<TestBackend, 2>,
        Tensor<TestBackend, 2>,
        Tensor<TestBackend, 1, Int>,
        Tensor<TestBackend, 2>,
        Tensor<TestBackend, 2>,
    ) {
        // anchor and target box are both axis-aligned 10x10 squares, offset
        // by (1, 1): overlap = 81 / (119 + 1e-5)
        let targets = Tensor::from_data(TensorData::from([[0.1, 0.1, 0.1, 0.1, 0.1]]), device);
        let preds = Tensor::zeros([1, 5], device);
        let anchor_state = Tensor::from_data(TensorData::from([1]), device);
        let target_boxes =
            Tensor::from_data(TensorData::from([[1.0, 1.0, 10.0, 10.0, -90.0, 2.0]]), device);
        let anchors = Tensor::from_data(TensorData::from([[0.0, 0.0, 10.0, 10.0, -90.0]]), device);
        (targets, preds, anchor_state, target_boxes, anchors)
    }

    #[test]
    fn iou_log_loss_matches_reference_value() {
        let device = Default::default();
        let loss = IouSmoothL1LogLoss::new();
        let (targets, preds, anchor_state, target_boxes, anchors) =
            single_positive_inputs(&device);

        let result = loss.forward(targets, preds, anchor_state, target_boxes, anchors, false);

        // reg = 5 * 0.5 * 9 * 0.01 = 0.225, factor = -ln(ov) / (reg + eps)
        let overlap = 81.0_f64 / (119.0 + 1e-5);
        let reg = 0.225_f64;
        let expected = reg * (-overlap.ln()) / (reg + 1e-5);
        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([expected]), Tolerance::relative(1e-4));
    }

    #[test]
    fn iou_exp_loss_matches_reference_value() {
        let device = Default::default();
        let loss = IouSmoothL1ExpLoss::new();
        let (targets, preds, anchor_state, target_boxes, anchors) =
            single_positive_inputs(&device);

        let result = loss.forward(targets, preds, anchor_state, target_boxes, anchors, false);

        let overlap = 81.0_f64 / (119.0 + 1e-5);
        let reg = 0.225_f64;
        let expected = reg * ((1.0 - overlap).exp() - 1.0) / (reg + 1e-5);
        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([expected]), Tolerance::relative(1e-4));
    }

    #[test]
    fn iou_log_loss_perfect_overlap_contributes_nothing() {
        let device = Default::default();
        let loss = IouSmoothL1LogLoss::new();

        // the decoded prediction lands exactly on the target box, so the
        // -ln(overlap) numerator vanishes no matter how large the residual
        // against the encoded targets is
        let targets = Tensor::<TestBackend, 2>::zeros([1, 5], &device);
        let preds = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.1, 0.1, 0.0, 0.0, 0.0]]),
            &device,
        );
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([1]), &device);
        let target_boxes = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1.0, 1.0, 10.0, 10.0, -90.0, 1.0]]),
            &device,
        );
        let anchors = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.0, 0.0, 10.0, 10.0, -90.0]]),
            &device,
        );

        let result = loss.forward(targets, preds, anchor_state, target_boxes, anchors, false);

        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([0.0]), Tolerance::absolute(1e-4));
    }

    #[test]
    fn iou_exp_loss_perfect_overlap_contributes_nothing() {
        let device = Default::default();
        let loss = IouSmoothL1ExpLoss::new();

        let targets = Tensor::<TestBackend, 2>::zeros([1, 5], &device);
        let preds = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.1, 0.1, 0.0, 0.0, 0.0]]),
            &device,
        );
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([1]), &device);
        let target_boxes = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1.0, 1.0, 10.0, 10.0, -90.0, 1.0]]),
            &device,
        );
        let anchors = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.0, 0.0, 10.0, 10.0, -90.0]]),
            &device,
        );

        let result = loss.forward(targets, preds, anchor_state, target_boxes, anchors, false);

        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([0.0]), Tolerance::absolute(1e-4));
    }

    #[test]
    fn iou_log_loss_converts_horizontal_anchors() {
        let device = Default::default();
        let loss = IouSmoothL1LogLossConfig::new()
            .with_method(AnchorMethod::Horizontal)
            .init();

        // [x1, y1, x2, y2] = [-5, -5, 4, 4] converts to the rotated box
        // [-0.5, -0.5, 10, 10, -90]; with zero deltas the decoded box equals
        // the matching target, so the loss collapses to ~0
        let targets = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.1, 0.1, 0.1, 0.1, 0.1]]),
            &device,
        );
        let preds = Tensor::<TestBackend, 2>::zeros([1, 5], &device);
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([1]), &device);
        let target_boxes = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[-0.5, -0.5, 10.0, 10.0, -90.0, 1.0]]),
            &device,
        );
        let anchors = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[-5.0, -5.0, 4.0, 4.0]]),
            &device,
        );

        let result = loss.forward(targets, preds, anchor_state, target_boxes, anchors, false);

        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([0.0]), Tolerance::absolute(1e-4));
    }

    #[test]
    fn iou_log_loss_refine_stage_takes_rotated_anchors() {
        let device = Default::default();
        let loss = IouSmoothL1LogLossConfig::new()
            .with_method(AnchorMethod::Horizontal)
            .init();
        let (targets, preds, anchor_state, target_boxes, anchors) =
            single_positive_inputs(&device);

        // refine stages feed 5-column anchors even under the horizontal
        // method; this must take the rotated path unchanged
        let result = loss.forward(targets, preds, anchor_state, target_boxes, anchors, true);

        let overlap = 81.0_f64 / (119.0 + 1e-5);
        let reg = 0.225_f64;
        let expected = reg * (-overlap.ln()) / (reg + 1e-5);
        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([expected]), Tolerance::relative(1e-4));
    }

    #[test]
    fn iou_log_loss_zero_positives_returns_zero() {
        let device = Default::default();
        let loss = IouSmoothL1LogLoss::new();
        let (targets, preds, _, target_boxes, anchors) = single_positive_inputs(&device);
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0]), &device);

        let result = loss.forward(targets, preds, anchor_state, target_boxes, anchors, false);

        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([0.0]), Tolerance::default());
    }

    #[test]
    fn iou_log_loss_gradient_flows_only_through_smooth_l1() {
        type AutodiffBackend = Autodiff<TestBackend>;
        let device = Default::default();
        let loss = IouSmoothL1LogLoss::new();

        let targets = Tensor::<AutodiffBackend, 2>::from_data(
            TensorData::from([[0.1, 0.1, 0.1, 0.1, 0.1]]),
            &device,
        );
        let preds = Tensor::<AutodiffBackend, 2>::zeros([1, 5], &device).require_grad();
        let anchor_state =
            Tensor::<AutodiffBackend, 1, Int>::from_data(TensorData::from([1]), &device);
        let target_boxes = Tensor::<AutodiffBackend, 2>::from_data(
            TensorData::from([[1.0, 1.0, 10.0, 10.0, -90.0, 2.0]]),
            &device,
        );
        let anchors = Tensor::<AutodiffBackend, 2>::from_data(
            TensorData::from([[0.0, 0.0, 10.0, 10.0, -90.0]]),
            &device,
        );

        let result = loss.forward(
            targets,
            preds.clone(),
            anchor_state,
            target_boxes,
            anchors,
            false,
        );
        let grads = result.backward();
        let grad = preds.grad(&grads).unwrap();

        // with the factor detached, the gradient is factor * d/dp of the
        // quadratic branch: factor * sigma^2 * (p - t) = factor * -0.9
        let overlap = 81.0_f64 / (119.0 + 1e-5);
        let factor = (-overlap.ln()) / (0.225 + 1e-5);
        let per_element = factor * -0.9;
        let expected = TensorData::from([[
            per_element,
            per_element,
            per_element,
            per_element,
            per_element,
        ]]);
        grad.into_data()
            .assert_approx_eq::<f32>(&expected, Tolerance::relative(1e-3));
    }

    #[test]
    #[should_panic = "Target boxes must be [num_anchors, 6]"]
    fn iou_log_loss_rejects_target_boxes_without_class_column() {
        let device = Default::default();
        let loss = IouSmoothL1LogLoss::new();
        let (targets, preds, anchor_state, _, anchors) = single_positive_inputs(&device);
        let target_boxes = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1.0, 1.0, 10.0, 10.0, -90.0]]),
            &device,
        );

        let _result = loss.forward(targets, preds, anchor_state, target_boxes, anchors, false);
    }

    #[test]
    #[should_panic = "Anchors must be [num_anchors, 4]"]
    fn iou_log_loss_horizontal_method_rejects_rotated_anchors() {
        let device = Default::default();
        let loss = IouSmoothL1LogLossConfig::new()
            .with_method(AnchorMethod::Horizontal)
            .init();
        let (targets, preds, anchor_state, target_boxes, anchors) =
            single_positive_inputs(&device);

        let _result = loss.forward(targets, preds, anchor_state, target_boxes, anchors, false);
    }

    #[test]
    fn iou_exp_loss_display_shows_curve_parameters() {
        let loss = IouSmoothL1ExpLossConfig::new()
            .with_alpha(2.0)
            .with_beta(0.5)
            .init();

        let display_str = format!("{loss}");
        assert!(display_str.contains("IouSmoothL1ExpLoss"));
        assert!(display_str.contains("alpha: 2"));
        assert!(display_str.contains("beta: 0.5"));
    }
}
