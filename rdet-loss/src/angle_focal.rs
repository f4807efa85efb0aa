//! Focal loss for the auxiliary angle-classification head.
//!
//! Two deliberate differences from [`crate::FocalLoss`]: only positive
//! anchors enter the sum (the angle head has no meaningful target on
//! background anchors), and the cross-entropy uses the explicit
//! epsilon-guarded form `-y*ln(sigmoid(p) + eps) - (1-y)*ln(1 - sigmoid(p) + eps)`.
//! The guarded form is the documented alternate formulation, less stable
//! near saturated logits than the logit formulation, and is kept distinct on
//! purpose.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    tensor::{activation::sigmoid, backend::Backend, Int, Tensor},
};

use crate::anchor::{gather_rows, positive_indices, positive_normalizer};

/// Configuration for creating an [Angle focal loss](AngleFocalLoss).
#[derive(Config, Debug)]
pub struct AngleFocalLossConfig {
    /// Class-balance weight applied to positive labels; `None` disables the
    /// factor entirely. Default: 0.25
    #[config(default = "Some(0.25)")]
    pub alpha: Option<f64>,

    /// Focusing exponent; `0.0` reduces to plain cross-entropy. Default: 2.0
    #[config(default = 2.0)]
    pub gamma: f64,

    /// Guard added inside the logarithms. Default: 1e-5
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

impl AngleFocalLossConfig {
    /// Initialize [Angle focal loss](AngleFocalLoss).
    pub fn init(&self) -> AngleFocalLoss {
        self.assertions();
        AngleFocalLoss {
            alpha: self.alpha,
            gamma: self.gamma,
            epsilon: self.epsilon,
        }
    }

    fn assertions(&self) {
        if let Some(alpha) = self.alpha {
            assert!(
                (0.0..=1.0).contains(&alpha),
                "Alpha for AngleFocalLoss must be in [0, 1], got {alpha}"
            );
        }
        assert!(
            self.gamma >= 0.0,
            "Gamma for AngleFocalLoss must be non-negative, got {}",
            self.gamma
        );
        assert!(
            self.epsilon > 0.0,
            "Epsilon for AngleFocalLoss must be positive, got {}",
            self.epsilon
        );
    }
}

/// Focal loss over positive anchors for angle classification.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct AngleFocalLoss {
    /// Class-balance weight applied to positive labels.
    pub alpha: Option<f64>,
    /// Focusing exponent.
    pub gamma: f64,
    /// Guard added inside the logarithms.
    pub epsilon: f64,
}

impl Default for AngleFocalLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDisplay for AngleFocalLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        let content = content
            .add("gamma", &self.gamma)
            .add("epsilon", &self.epsilon);
        match self.alpha {
            Some(alpha) => content.add("alpha", &alpha).optional(),
            None => content.optional(),
        }
    }
}

impl AngleFocalLoss {
    /// Create a new angle focal loss with default configuration.
    pub fn new() -> Self {
        AngleFocalLossConfig::new().init()
    }

    /// Compute the focal loss over positive anchors only.
    ///
    /// The per-entry losses are summed and divided by
    /// `max(1, #positive anchors)`.
    ///
    /// # Shapes
    ///
    /// - labels: `[num_anchors, num_bins]` binary angle targets
    /// - preds: `[num_anchors, num_bins]` raw logits
    /// - anchor_state: `[num_anchors]`
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        labels: Tensor<B, 2>,
        preds: Tensor<B, 2>,
        anchor_state: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        self.assertions(&labels, &preds, &anchor_state);

        let device = preds.device();
        let kept = positive_indices(&anchor_state);
        if kept.is_empty() {
            return Tensor::zeros([1], &device);
        }

        let labels = gather_rows(labels, &kept);
        let preds = gather_rows(preds, &kept);

        let probs = sigmoid(preds);
        let one_minus_labels = labels.ones_like() - labels.clone();
        let one_minus_probs = probs.ones_like() - probs.clone();

        // epsilon-guarded cross-entropy; see the module docs for why this
        // is not the stable logit formulation
        let cross_entropy = (labels.clone() * probs.clone().add_scalar(self.epsilon).log()
            + one_minus_labels.clone() * one_minus_probs.clone().add_scalar(self.epsilon).log())
        .neg();

        let p_t = labels.clone() * probs + one_minus_labels * one_minus_probs;

        let modulating = if self.gamma != 0.0 {
            (p_t.ones_like() - p_t).powf_scalar(self.gamma)
        } else {
            p_t.ones_like()
        };

        let alpha_weight = match self.alpha {
            Some(alpha) => labels.clone().mul_scalar(alpha)
                + (labels.ones_like() - labels).mul_scalar(1.0 - alpha),
            None => labels.ones_like(),
        };

        let loss = modulating * alpha_weight * cross_entropy;
        loss.sum().div_scalar(positive_normalizer(&anchor_state))
    }

    fn assertions<B: Backend>(
        &self,
        labels: &Tensor<B, 2>,
        preds: &Tensor<B, 2>,
        anchor_state: &Tensor<B, 1, Int>,
    ) {
        let label_dims = labels.dims();
        let pred_dims = preds.dims();
        let [num_anchors] = anchor_state.dims();
        assert_eq!(
            label_dims, pred_dims,
            "Shape of labels ({label_dims:?}) must match predictions ({pred_dims:?})"
        );
        assert_eq!(
            label_dims[0], num_anchors,
            "Anchor count in labels ({}) must match anchor_state ({num_anchors})",
            label_dims[0]
        );
    }
}
