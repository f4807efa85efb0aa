//! Focal loss for anchor classification.
//!
//! Lin et al., "Focal Loss for Dense Object Detection", 2017.
//!
//! The per-entry cross-entropy uses the numerically stable logit
//! formulation `max(x, 0) - x*y + log(1 + exp(-|x|))`, which cannot hit
//! `log(0)` even for saturated logits. Anchors marked ignore (state `-1`)
//! are excluded from the sum; the normalizer counts positive anchors only,
//! so negatives contribute loss without inflating the denominator.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    tensor::{activation::sigmoid, backend::Backend, Int, Tensor},
};

use crate::anchor::{gather_rows, non_ignored_indices, positive_normalizer};

/// Configuration for creating a [Focal loss](FocalLoss).
#[derive(Config, Debug)]
pub struct FocalLossConfig {
    /// Class-balance weight applied to positive labels; `None` disables the
    /// factor entirely. Default: 0.25
    #[config(default = "Some(0.25)")]
    pub alpha: Option<f64>,

    /// Focusing exponent; `0.0` reduces to plain cross-entropy. Default: 2.0
    #[config(default = 2.0)]
    pub gamma: f64,
}

impl FocalLossConfig {
    /// Initialize [Focal loss](FocalLoss).
    pub fn init(&self) -> FocalLoss {
        self.assertions();
        FocalLoss {
            alpha: self.alpha,
            gamma: self.gamma,
        }
    }

    fn assertions(&self) {
        if let Some(alpha) = self.alpha {
            assert!(
                (0.0..=1.0).contains(&alpha),
                "Alpha for FocalLoss must be in [0, 1], got {alpha}"
            );
        }
        assert!(
            self.gamma >= 0.0,
            "Gamma for FocalLoss must be non-negative, got {}",
            self.gamma
        );
    }
}

/// Focal loss for anchor classification.
///
/// Down-weights well-classified entries via a `(1 - p_t)^gamma` modulating
/// factor so training concentrates on hard anchors.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct FocalLoss {
    /// Class-balance weight applied to positive labels.
    pub alpha: Option<f64>,
    /// Focusing exponent.
    pub gamma: f64,
}

impl Default for FocalLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDisplay for FocalLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        let content = content.add("gamma", &self.gamma);
        match self.alpha {
            Some(alpha) => content.add("alpha", &alpha).optional(),
            None => content.optional(),
        }
    }
}

impl FocalLoss {
    /// Create a new focal loss with default configuration.
    pub fn new() -> Self {
        FocalLossConfig::new().init()
    }

    /// Compute the focal loss over non-ignored anchors.
    ///
    /// The reduction is fixed by contract: the per-entry losses of every
    /// anchor with state `!= -1` are summed and divided by
    /// `max(1, #positive anchors)`.
    ///
    /// # Shapes
    ///
    /// - labels: `[num_anchors, num_classes]` binary targets
    /// - preds: `[num_anchors, num_classes]` raw logits
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
        let kept = non_ignored_indices(&anchor_state);
        if kept.is_empty() {
            return Tensor::zeros([1], &device);
        }

        let labels = gather_rows(labels, &kept);
        let preds = gather_rows(preds, &kept);

        // stable BCE with logits: max(x, 0) - x*y + log(1 + exp(-|x|))
        let cross_entropy = preds.clone().clamp_min(0.0) - preds.clone() * labels.clone()
            + (-preds.clone().abs()).exp().add_scalar(1.0).log();

        // p_t: predicted probability of the true class
        let probs = sigmoid(preds);
        let p_t = labels.clone() * probs.clone()
            + (labels.ones_like() - labels.clone()) * (probs.ones_like() - probs);

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
