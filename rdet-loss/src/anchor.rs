//! Anchor-state filtering shared by the loss functions.
//!
//! Each anchor carries an integer state: `-1` ignore, `0` negative
//! (background), `1` positive (matched to a ground-truth box). All tensors
//! fed into the losses are parallel arrays over the anchor axis, so row
//! selection and the loss normalizer both derive from this single state
//! vector.
//!
//! Index selection and counting run on the host. The resulting indices and
//! the normalizer are plain values, constant with respect to every learnable
//! tensor — the gradient-isolation the losses require holds by construction.

use burn::tensor::{backend::Backend, Int, Tensor};

/// Indices of anchors whose state satisfies `keep`, in ascending order.
pub fn filter_indices<B: Backend>(
    anchor_state: &Tensor<B, 1, Int>,
    keep: impl Fn(i64) -> bool,
) -> Vec<i32> {
    let data = anchor_state.clone().into_data().convert::<i64>();
    let states = data.as_slice::<i64>().unwrap();
    states
        .iter()
        .enumerate()
        .filter(|(_, &state)| keep(state))
        .map(|(index, _)| index as i32)
        .collect()
}

/// Indices of anchors that participate in classification (state `!= -1`).
pub fn non_ignored_indices<B: Backend>(anchor_state: &Tensor<B, 1, Int>) -> Vec<i32> {
    filter_indices(anchor_state, |state| state != -1)
}

/// Indices of positive (matched) anchors.
pub fn positive_indices<B: Backend>(anchor_state: &Tensor<B, 1, Int>) -> Vec<i32> {
    filter_indices(anchor_state, |state| state == 1)
}

/// Loss normalizer: the number of positive anchors, floored at one.
///
/// The floor keeps batches without positives well-defined (the summed loss
/// is zero, so the result is an exact zero rather than NaN).
pub fn positive_normalizer<B: Backend>(anchor_state: &Tensor<B, 1, Int>) -> f64 {
    (positive_indices(anchor_state).len() as f64).max(1.0)
}

/// Gather rows of a co-indexed tensor, preserving the order of `indices`.
pub fn gather_rows<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    indices: &[i32],
) -> Tensor<B, D> {
    let device = tensor.device();
    let indices = Tensor::<B, 1, Int>::from_ints(indices, &device);
    tensor.select(0, indices)
}
