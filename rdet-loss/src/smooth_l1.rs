//! Smooth-L1 regression loss over positive anchors.
//!
//! Quadratic below the `1/sigma^2` cutoff, linear above it:
//!
//! ```text
//! f(d) = 0.5 * (sigma * d)^2        if d < 1 / sigma^2
//!        d - 0.5 / sigma^2          otherwise
//! ```
//!
//! Both branches agree at the cutoff, so the loss is continuous in the
//! residual.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::anchor::{gather_rows, positive_indices, positive_normalizer};

/// Elementwise smooth-L1 of a residual tensor.
pub(crate) fn smooth_l1_elementwise<B: Backend>(
    diff: Tensor<B, 2>,
    sigma_squared: f64,
) -> Tensor<B, 2> {
    let diff = diff.abs();
    let cutoff = 1.0 / sigma_squared;
    let quadratic = diff.clone().powf_scalar(2.0).mul_scalar(0.5 * sigma_squared);
    let linear = diff.clone().sub_scalar(0.5 * cutoff);
    linear.mask_where(diff.lower_elem(cutoff), quadratic)
}

/// Configuration for creating a [Smooth-L1 loss](SmoothL1Loss).
#[derive(Config, Debug)]
pub struct SmoothL1LossConfig {
    /// Transition point control; the quadratic region ends at `1/sigma^2`.
    /// Default: 3.0
    #[config(default = 3.0)]
    pub sigma: f64,
}

impl SmoothL1LossConfig {
    /// Initialize [Smooth-L1 loss](SmoothL1Loss).
    pub fn init(&self) -> SmoothL1Loss {
        self.assertions();
        SmoothL1Loss { sigma: self.sigma }
    }

    fn assertions(&self) {
        assert!(
            self.sigma > 0.0,
            "Sigma for SmoothL1Loss must be positive, got {}",
            self.sigma
        );
    }
}

/// Smooth-L1 regression loss over positive anchors.
///
/// Robust to outliers: large residuals grow linearly instead of
/// quadratically.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct SmoothL1Loss {
    /// Transition point control.
    pub sigma: f64,
}

impl Default for SmoothL1Loss {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDisplay for SmoothL1Loss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content.add("sigma", &self.sigma).optional()
    }
}

impl SmoothL1Loss {
    /// Create a new smooth-L1 loss with default configuration.
    pub fn new() -> Self {
        SmoothL1LossConfig::new().init()
    }

    /// Compute the smooth-L1 loss over positive anchors.
    ///
    /// With a weight vector, per-element losses are summed across the
    /// feature axis, scaled by the anchor's weight and then summed; without
    /// one the elementwise losses are summed directly. Either sum is divided
    /// by `max(1, #positive anchors)`.
    ///
    /// # Shapes
    ///
    /// - targets: `[num_anchors, dims]` encoded deltas
    /// - preds: `[num_anchors, dims]` raw regression outputs
    /// - anchor_state: `[num_anchors]`
    /// - weight: `[num_anchors]` per-anchor scale, optional
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        targets: Tensor<B, 2>,
        preds: Tensor<B, 2>,
        anchor_state: Tensor<B, 1, Int>,
        weight: Option<Tensor<B, 1>>,
    ) -> Tensor<B, 1> {
        self.assertions(&targets, &preds, &anchor_state, weight.as_ref());

        let device = preds.device();
        let kept = positive_indices(&anchor_state);
        if kept.is_empty() {
            return Tensor::zeros([1], &device);
        }

        let preds = gather_rows(preds, &kept);
        let targets = gather_rows(targets, &kept);

        let loss = smooth_l1_elementwise(preds - targets, self.sigma * self.sigma);

        let total = match weight {
            Some(weight) => {
                let per_anchor = loss.sum_dim(1);
                let weight = gather_rows(weight, &kept).reshape([-1, 1]);
                (per_anchor * weight).sum()
            }
            None => loss.sum(),
        };

        total.div_scalar(positive_normalizer(&anchor_state))
    }

    fn assertions<B: Backend>(
        &self,
        targets: &Tensor<B, 2>,
        preds: &Tensor<B, 2>,
        anchor_state: &Tensor<B, 1, Int>,
        weight: Option<&Tensor<B, 1>>,
    ) {
        let target_dims = targets.dims();
        let pred_dims = preds.dims();
        let [num_anchors] = anchor_state.dims();
        assert_eq!(
            target_dims, pred_dims,
            "Shape of targets ({target_dims:?}) must match predictions ({pred_dims:?})"
        );
        assert_eq!(
            target_dims[0], num_anchors,
            "Anchor count in targets ({}) must match anchor_state ({num_anchors})",
            target_dims[0]
        );
        if let Some(weight) = weight {
            let [weight_len] = weight.dims();
            assert_eq!(
                weight_len, num_anchors,
                "Weight length ({weight_len}) must match anchor_state ({num_anchors})"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{TensorData, Tolerance};

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn smooth_l1_loss_quadratic_branch_matches_reference_value() {
        let device = Default::default();
        let loss = SmoothL1Loss::new();

        // all diffs 0.1 < 1/9: per element 0.5 * 9 * 0.01 = 0.045,
        // five elements, one positive anchor
        let targets = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.1, 0.1, 0.1, 0.1, 0.1]]),
            &device,
        );
        let preds = Tensor::<TestBackend, 2>::zeros([1, 5], &device);
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([1]), &device);

        let result = loss.forward(targets, preds, anchor_state, None);

        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([0.225]), Tolerance::default());
    }

    #[test]
    fn smooth_l1_loss_branches_agree_at_cutoff() {
        let device = Default::default();
        let loss = SmoothL1Loss::new();

        // at |d| = 1/sigma^2 both formulas give 0.5/sigma^2 = 1/18
        let cutoff = 1.0 / 9.0;
        let targets =
            Tensor::<TestBackend, 2>::from_data(TensorData::from([[cutoff]]), &device);
        let preds = Tensor::<TestBackend, 2>::zeros([1, 1], &device);
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([1]), &device);

        let result = loss.forward(targets, preds, anchor_state, None);

        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([1.0 / 18.0]), Tolerance::default());
    }

    #[test]
    fn smooth_l1_loss_applies_per_anchor_weights() {
        let device = Default::default();
        let loss = SmoothL1Loss::new();

        // per-anchor sums are 0.225 each; weighted 2.0 and 0.5 then divided
        // by two positives
        let targets = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.1, 0.1, 0.1, 0.1, 0.1], [0.1, 0.1, 0.1, 0.1, 0.1]]),
            &device,
        );
        let preds = Tensor::<TestBackend, 2>::zeros([2, 5], &device);
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([1, 1]), &device);
        let weight =
            Tensor::<TestBackend, 1>::from_data(TensorData::from([2.0, 0.5]), &device);

        let result = loss.forward(targets, preds, anchor_state, Some(weight));

        let expected = 0.225 * 2.5 / 2.0;
        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([expected]), Tolerance::default());
    }

    #[test]
    fn smooth_l1_loss_ignores_non_positive_anchors() {
        let device = Default::default();
        let loss = SmoothL1Loss::new();

        // the huge residual sits on a background anchor and must not count
        let targets = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[100.0, 100.0], [0.1, 0.1]]),
            &device,
        );
        let preds = Tensor::<TestBackend, 2>::zeros([2, 2], &device);
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0, 1]), &device);

        let result = loss.forward(targets, preds, anchor_state, None);

        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([0.09]), Tolerance::default());
    }

    #[test]
    fn smooth_l1_loss_zero_positives_returns_zero() {
        let device = Default::default();
        let loss = SmoothL1Loss::new();

        let targets = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[5.0, 5.0], [3.0, 3.0]]),
            &device,
        );
        let preds = Tensor::<TestBackend, 2>::zeros([2, 2], &device);
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0, -1]), &device);

        let result = loss.forward(targets, preds, anchor_state, None);

        result
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::from([0.0]), Tolerance::default());
    }

    #[test]
    #[should_panic = "Sigma for SmoothL1Loss must be positive"]
    fn smooth_l1_loss_config_rejects_non_positive_sigma() {
        let _loss = SmoothL1LossConfig::new().with_sigma(0.0).init();
    }

    #[test]
    #[should_panic = "Weight length"]
    fn smooth_l1_loss_forward_mismatched_weight_panics() {
        let device = Default::default();
        let loss = SmoothL1Loss::new();

        let targets = Tensor::<TestBackend, 2>::zeros([2, 5], &device);
        let preds = Tensor::<TestBackend, 2>::zeros([2, 5], &device);
        let anchor_state =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([1, 1]), &device);
        let weight = Tensor::<TestBackend, 1>::from_data(TensorData::from([1.0]), &device);

        let _result = loss.forward(targets, preds, anchor_state, Some(weight));
    }

    #[test]
    fn smooth_l1_loss_display_shows_sigma() {
        let loss = SmoothL1LossConfig::new().with_sigma(2.0).init();

        let display_str = format!("{loss}");
        assert!(display_str.contains("SmoothL1Loss"));
        assert!(display_str.contains("sigma: 2"));
    }
}
