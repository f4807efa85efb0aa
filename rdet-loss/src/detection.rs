//! Integrated loss for anchor-based rotated detectors.
//!
//! Combines the focal classification loss, one regression variant and the
//! optional angle head under a single configuration with per-component
//! weights. The shared pieces of the configuration (anchor method, scale
//! factors, epsilon) are injected into the component losses once at
//! construction.

use std::collections::HashMap;

use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, cast::ToElement, Int, Tensor},
};
use thiserror::Error;

use crate::angle_focal::{AngleFocalLoss, AngleFocalLossConfig};
use crate::focal::{FocalLoss, FocalLossConfig};
use crate::iou_smooth_l1::{
    AnchorMethod, IouSmoothL1ExpLoss, IouSmoothL1ExpLossConfig, IouSmoothL1LogLoss,
    IouSmoothL1LogLossConfig,
};
use crate::smooth_l1::{SmoothL1Loss, SmoothL1LossConfig};
use rdet_box::ScaleFactors;

/// Errors that can occur when evaluating the integrated detection loss.
#[derive(Debug, Error)]
pub enum DetectionLossError {
    /// The angle head is enabled but the batch carries no angle tensors.
    #[error("angle head is enabled (angle_weight > 0) but the batch has no angle labels/predictions")]
    MissingAngleInputs,

    /// Two co-indexed tensors disagree on the number of anchors.
    #[error("co-indexed tensor '{name}' has {actual} anchors, anchor_state has {expected}")]
    AnchorCountMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Which regression loss the detector trains with.
#[derive(Config, Debug, PartialEq)]
pub enum RegressionVariant {
    /// Plain smooth-L1 on the encoded deltas.
    SmoothL1,
    /// IoU-reweighted smooth-L1, logarithmic curve.
    IouLog,
    /// IoU-reweighted smooth-L1, exponential curve.
    IouExp,
}

/// Configuration for creating a [Detection loss](DetectionLoss).
#[derive(Config, Debug)]
pub struct DetectionLossConfig {
    /// Anchor-box representation.
    #[config(default = "AnchorMethod::Rotated")]
    pub method: AnchorMethod,

    /// Per-channel delta normalization factors, if the encoder used any.
    #[config(default = "None")]
    pub anchor_scale_factors: Option<ScaleFactors>,

    /// Shared numeric guard for the component losses. Default: 1e-5
    #[config(default = 1e-5)]
    pub epsilon: f64,

    /// Regression loss variant. Default: IoU-reweighted, log curve
    #[config(default = "RegressionVariant::IouLog")]
    pub regression: RegressionVariant,

    /// Smooth-L1 transition point control. Default: 3.0
    #[config(default = 3.0)]
    pub sigma: f64,

    /// Steepness of the exponential reweighting curve (exp variant only).
    /// Default: 1.0
    #[config(default = 1.0)]
    pub reweight_alpha: f64,

    /// Shape of the exponential reweighting curve (exp variant only).
    /// Default: 1.0
    #[config(default = 1.0)]
    pub reweight_beta: f64,

    /// Focal-loss class-balance weight. Default: 0.25
    #[config(default = "Some(0.25)")]
    pub focal_alpha: Option<f64>,

    /// Focal-loss focusing exponent. Default: 2.0
    #[config(default = 2.0)]
    pub focal_gamma: f64,

    /// Weight of the classification component. Default: 1.0
    #[config(default = 1.0)]
    pub cls_weight: f64,

    /// Weight of the regression component. Default: 1.0
    #[config(default = 1.0)]
    pub reg_weight: f64,

    /// Weight of the auxiliary angle head; `0.0` disables it. Default: 0.0
    #[config(default = 0.0)]
    pub angle_weight: f64,
}

impl DetectionLossConfig {
    /// Initialize [Detection loss](DetectionLoss).
    pub fn init(&self) -> DetectionLoss {
        self.assertions();

        let focal = FocalLossConfig::new()
            .with_alpha(self.focal_alpha)
            .with_gamma(self.focal_gamma)
            .init();

        let regression = match self.regression {
            RegressionVariant::SmoothL1 => RegressionLoss::SmoothL1(
                SmoothL1LossConfig::new().with_sigma(self.sigma).init(),
            ),
            RegressionVariant::IouLog => RegressionLoss::IouLog(
                IouSmoothL1LogLossConfig::new()
                    .with_sigma(self.sigma)
                    .with_epsilon(self.epsilon)
                    .with_anchor_scale_factors(self.anchor_scale_factors)
                    .with_method(self.method.clone())
                    .init(),
            ),
            RegressionVariant::IouExp => RegressionLoss::IouExp(
                IouSmoothL1ExpLossConfig::new()
                    .with_sigma(self.sigma)
                    .with_alpha(self.reweight_alpha)
                    .with_beta(self.reweight_beta)
                    .with_epsilon(self.epsilon)
                    .with_anchor_scale_factors(self.anchor_scale_factors)
                    .with_method(self.method.clone())
                    .init(),
            ),
        };

        let angle = (self.angle_weight > 0.0)
            .then(|| AngleFocalLossConfig::new().with_epsilon(self.epsilon).init());

        DetectionLoss {
            focal,
            regression,
            angle,
            cls_weight: self.cls_weight,
            reg_weight: self.reg_weight,
            angle_weight: self.angle_weight,
        }
    }

    fn assertions(&self) {
        assert!(
            self.cls_weight >= 0.0 && self.reg_weight >= 0.0 && self.angle_weight >= 0.0,
            "Component weights for DetectionLoss must be non-negative, got {}, {} and {}",
            self.cls_weight,
            self.reg_weight,
            self.angle_weight
        );
        assert!(
            self.epsilon > 0.0,
            "Epsilon for DetectionLoss must be positive, got {}",
            self.epsilon
        );
    }
}

/// The configured regression component.
#[derive(Module, Clone, Debug)]
pub enum RegressionLoss {
    /// Plain smooth-L1 on the encoded deltas.
    SmoothL1(SmoothL1Loss),
    /// IoU-reweighted smooth-L1, logarithmic curve.
    IouLog(IouSmoothL1LogLoss),
    /// IoU-reweighted smooth-L1, exponential curve.
    IouExp(IouSmoothL1ExpLoss),
}

/// Per-head tensors for one flattened batch of anchors.
///
/// All tensors are parallel arrays over the anchor axis. The angle tensors
/// are only required when the angle head is enabled.
#[derive(Clone, Debug)]
pub struct DetectionBatch<B: Backend> {
    /// Classification targets, `[num_anchors, num_classes]`.
    pub cls_labels: Tensor<B, 2>,
    /// Classification logits, `[num_anchors, num_classes]`.
    pub cls_preds: Tensor<B, 2>,
    /// Encoded regression targets, `[num_anchors, 5]`.
    pub reg_targets: Tensor<B, 2>,
    /// Raw regression outputs, `[num_anchors, 5]`.
    pub reg_preds: Tensor<B, 2>,
    /// Anchor states, `[num_anchors]`.
    pub anchor_state: Tensor<B, 1, Int>,
    /// Ground-truth rotated boxes plus class column, `[num_anchors, 6]`.
    pub target_boxes: Tensor<B, 2>,
    /// Anchor geometry, `[num_anchors, 4]` or `[num_anchors, 5]`.
    pub anchors: Tensor<B, 2>,
    /// Angle-bin targets, `[num_anchors, num_bins]`.
    pub angle_labels: Option<Tensor<B, 2>>,
    /// Angle-bin logits, `[num_anchors, num_bins]`.
    pub angle_preds: Option<Tensor<B, 2>>,
}

/// Integrated loss for anchor-based rotated detectors.
#[derive(Module, Clone, Debug)]
pub struct DetectionLoss {
    /// Classification component.
    pub focal: FocalLoss,
    /// Regression component.
    pub regression: RegressionLoss,
    /// Angle head component, present when `angle_weight > 0`.
    pub angle: Option<AngleFocalLoss>,
    /// Weight of the classification component.
    pub cls_weight: f64,
    /// Weight of the regression component.
    pub reg_weight: f64,
    /// Weight of the angle head component.
    pub angle_weight: f64,
}

impl DetectionLoss {
    /// Create a new detection loss with default configuration.
    pub fn new() -> Self {
        DetectionLossConfig::new().init()
    }

    /// Compute the weighted total loss.
    ///
    /// # Errors
    ///
    /// Returns [`DetectionLossError::MissingAngleInputs`] when the angle
    /// head is enabled without angle tensors, and
    /// [`DetectionLossError::AnchorCountMismatch`] when the batch tensors
    /// disagree on the anchor count.
    pub fn forward<B: Backend>(
        &self,
        batch: DetectionBatch<B>,
        is_refine: bool,
    ) -> Result<Tensor<B, 1>, DetectionLossError> {
        self.validate(&batch)?;

        let cls_loss = self
            .focal
            .forward(
                batch.cls_labels,
                batch.cls_preds,
                batch.anchor_state.clone(),
            )
            .mul_scalar(self.cls_weight);

        let reg_loss = self
            .regression_component(
                batch.reg_targets,
                batch.reg_preds,
                batch.anchor_state.clone(),
                batch.target_boxes,
                batch.anchors,
                is_refine,
            )
            .mul_scalar(self.reg_weight);

        let mut total = cls_loss + reg_loss;

        if let Some(ref angle_loss) = self.angle {
            let labels = batch
                .angle_labels
                .ok_or(DetectionLossError::MissingAngleInputs)?;
            let preds = batch
                .angle_preds
                .ok_or(DetectionLossError::MissingAngleInputs)?;
            total = total
                + angle_loss
                    .forward(labels, preds, batch.anchor_state)
                    .mul_scalar(self.angle_weight);
        }

        Ok(total)
    }

    /// Compute the weighted total loss together with a per-component
    /// breakdown keyed by `"classification"`, `"regression"`, `"angle"` and
    /// `"total"` (weighted values).
    ///
    /// # Errors
    ///
    /// Same as [`DetectionLoss::forward`].
    pub fn forward_detailed<B: Backend>(
        &self,
        batch: DetectionBatch<B>,
        is_refine: bool,
    ) -> Result<(Tensor<B, 1>, HashMap<String, f64>), DetectionLossError> {
        self.validate(&batch)?;

        let mut loss_dict = HashMap::new();

        let cls_loss = self
            .focal
            .forward(
                batch.cls_labels,
                batch.cls_preds,
                batch.anchor_state.clone(),
            )
            .mul_scalar(self.cls_weight);
        loss_dict.insert(
            "classification".to_owned(),
            cls_loss.clone().into_scalar().to_f64(),
        );

        let reg_loss = self
            .regression_component(
                batch.reg_targets,
                batch.reg_preds,
                batch.anchor_state.clone(),
                batch.target_boxes,
                batch.anchors,
                is_refine,
            )
            .mul_scalar(self.reg_weight);
        loss_dict.insert(
            "regression".to_owned(),
            reg_loss.clone().into_scalar().to_f64(),
        );

        let mut total = cls_loss + reg_loss;

        if let Some(ref angle_loss) = self.angle {
            let labels = batch
                .angle_labels
                .ok_or(DetectionLossError::MissingAngleInputs)?;
            let preds = batch
                .angle_preds
                .ok_or(DetectionLossError::MissingAngleInputs)?;
            let angle = angle_loss
                .forward(labels, preds, batch.anchor_state)
                .mul_scalar(self.angle_weight);
            loss_dict.insert("angle".to_owned(), angle.clone().into_scalar().to_f64());
            total = total + angle;
        }

        loss_dict.insert("total".to_owned(), total.clone().into_scalar().to_f64());

        Ok((total, loss_dict))
    }

    fn regression_component<B: Backend>(
        &self,
        targets: Tensor<B, 2>,
        preds: Tensor<B, 2>,
        anchor_state: Tensor<B, 1, Int>,
        target_boxes: Tensor<B, 2>,
        anchors: Tensor<B, 2>,
        is_refine: bool,
    ) -> Tensor<B, 1> {
        match &self.regression {
            RegressionLoss::SmoothL1(loss) => loss.forward(targets, preds, anchor_state, None),
            RegressionLoss::IouLog(loss) => loss.forward(
                targets,
                preds,
                anchor_state,
                target_boxes,
                anchors,
                is_refine,
            ),
            RegressionLoss::IouExp(loss) => loss.forward(
                targets,
                preds,
                anchor_state,
                target_boxes,
                anchors,
                is_refine,
            ),
        }
    }

    fn validate<B: Backend>(
        &self,
        batch: &DetectionBatch<B>,
    ) -> Result<(), DetectionLossError> {
        let [num_anchors] = batch.anchor_state.dims();
        let counts = [
            ("cls_labels", batch.cls_labels.dims()[0]),
            ("cls_preds", batch.cls_preds.dims()[0]),
            ("reg_targets", batch.reg_targets.dims()[0]),
            ("reg_preds", batch.reg_preds.dims()[0]),
            ("target_boxes", batch.target_boxes.dims()[0]),
            ("anchors", batch.anchors.dims()[0]),
        ];
        for (name, actual) in counts {
            if actual != num_anchors {
                return Err(DetectionLossError::AnchorCountMismatch {
                    name,
                    expected: num_anchors,
                    actual,
                });
            }
        }
        Ok(())
    }
}

impl Default for DetectionLoss {
    fn default() -> Self {
        Self::new()
    }
}
