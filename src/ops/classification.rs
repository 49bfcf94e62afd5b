//! Cross-entropy losses over label channels and label sequences.

use burn::tensor::{Int, Tensor, TensorData, activation::log_softmax, backend::Backend};

use super::output::LossOutput;
use super::permutation::{PermutationSearch, summed_min_cost};
use super::sequence::{check_lengths, extract_valid, extract_valid_labels};
use crate::errors::{Result, SeparationError};

/// Host-side check that every label indexes one of `num_classes` classes.
fn check_labels<B: Backend, const D: usize>(
    labels: &Tensor<B, D, Int>,
    num_classes: usize,
    context: &str,
) -> Result<()> {
    let values: Vec<i64> = labels
        .to_data()
        .convert::<i64>()
        .to_vec()
        .map_err(|err| SeparationError::TensorData {
            message: format!("{err:?}"),
        })?;
    if let Some(label) = values
        .iter()
        .find(|&&label| label < 0 || label as usize >= num_classes)
    {
        return Err(SeparationError::shape(
            context,
            format!("labels in 0..{num_classes}"),
            label,
        ));
    }
    Ok(())
}

/// Permutation-invariant cross-entropy between `nrS` output channels and
/// `nrS` labels.
///
/// `labels` `[batch, nrS]`, `logits` `[batch, nrS, classes]`. A permutation
/// costs the mean over channels of the sparse softmax cross-entropy; the
/// per-example minimum is summed. Normalizer: the batch size.
pub fn crossentropy_multi_loss<B: Backend>(
    labels: Tensor<B, 2, Int>,
    logits: Tensor<B, 3>,
) -> Result<LossOutput<B>> {
    let [batch_size, num_sources, num_classes] = logits.dims();
    if labels.dims() != [batch_size, num_sources] {
        return Err(SeparationError::shape(
            "multi labels",
            format!("{:?}", [batch_size, num_sources]),
            format!("{:?}", labels.dims()),
        ));
    }
    if num_classes == 0 {
        return Err(SeparationError::shape("logit classes", "at least 1", 0));
    }
    let search = PermutationSearch::new(num_sources)?;
    check_labels(&labels, num_classes, "multi labels")?;

    // pairs[b, i, j] = -log p(labels[b, j] | output channel i) / nrS
    let index = labels
        .reshape([batch_size, 1, num_sources])
        .expand([batch_size, num_sources, num_sources]);
    let pairs = log_softmax(logits, 2)
        .gather(2, index)
        .neg()
        .div_scalar(num_sources as f32);

    let loss = summed_min_cost(&search, pairs)?;
    Ok(LossOutput::with_count(loss, batch_size as f32))
}

/// Cross-entropy over label sequences with an end-of-sequence label.
///
/// `targets` `[batch, target_time]`, `logits` `[batch, logit_time, classes]`.
/// Every valid logit frame except each example's last is scored against the
/// valid targets; the last frame is scored against the end-of-sequence
/// class `classes - 1`. Each example therefore needs
/// `logit_length == target_length + 1`. Normalizer: the number of scored
/// frames.
pub fn cross_entropy_eos_loss<B: Backend>(
    targets: Tensor<B, 2, Int>,
    logits: Tensor<B, 3>,
    logit_seq_length: &[usize],
    target_seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let [batch_size, logit_time, num_classes] = logits.dims();
    let [_, target_time] = targets.dims();
    check_lengths(logit_seq_length, batch_size, logit_time)?;
    check_lengths(target_seq_length, batch_size, target_time)?;
    if num_classes == 0 {
        return Err(SeparationError::shape("logit classes", "at least 1", 0));
    }
    if let Some(index) = logit_seq_length.iter().position(|&length| length == 0) {
        return Err(SeparationError::degenerate(format!(
            "example {index} has no logit frame for the end-of-sequence label"
        )));
    }
    if let Some(index) = logit_seq_length
        .iter()
        .zip(target_seq_length)
        .position(|(&logit, &target)| logit != target + 1)
    {
        return Err(SeparationError::shape(
            format!("logit length of example {index}"),
            format!("target length + 1 = {}", target_seq_length[index] + 1),
            logit_seq_length[index],
        ));
    }

    let device = logits.device();
    let final_rows: Vec<i64> = logit_seq_length
        .iter()
        .enumerate()
        .map(|(batch, &length)| (batch * logit_time + length - 1) as i64)
        .collect();
    let final_logits = logits
        .clone()
        .reshape([batch_size * logit_time, num_classes])
        .select(
            0,
            Tensor::from_data(TensorData::new(final_rows, [batch_size]), &device),
        );

    let body_lengths: Vec<usize> = logit_seq_length.iter().map(|length| length - 1).collect();
    let body_logits: Tensor<B, 2> = extract_valid(logits, &body_lengths)?;
    let body_targets = extract_valid_labels(targets, target_seq_length)?;
    check_labels(&body_targets, num_classes, "sequence targets")?;
    let eos_targets =
        Tensor::<B, 1, Int>::full([batch_size], (num_classes - 1) as i64, &device);

    let stacked_logits = Tensor::cat(vec![body_logits, final_logits], 0);
    let stacked_targets = Tensor::cat(vec![body_targets, eos_targets], 0);
    let count = stacked_targets.dims()[0];

    let loss = log_softmax(stacked_logits, 1)
        .gather(1, stacked_targets.reshape([count, 1]))
        .neg()
        .sum();
    Ok(LossOutput::with_count(loss, count as f32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;
    type Device = <TestBackend as Backend>::Device;

    const TOLERANCE: f32 = 1e-5;

    #[test]
    fn test_single_source_is_plain_cross_entropy() {
        let device = Device::default();
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[2], [0]], &device);
        let logits = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0, 2.0, 3.0]], [[0.0, 0.0, 0.0]]],
            &device,
        );

        let (loss, norm) = crossentropy_multi_loss(labels, logits).unwrap().to_scalars();
        assert!((loss - (0.40760596 + 1.0986123)).abs() < TOLERANCE, "loss = {loss}");
        assert_eq!(norm, 2.0);
    }

    #[test]
    fn test_multi_label_order_does_not_matter() {
        let device = Device::default();
        let logits = Tensor::<TestBackend, 3>::from_floats(
            [[[4.0, 0.0, -1.0], [0.5, 0.2, 3.0]]],
            &device,
        );
        let ordered = Tensor::<TestBackend, 2, Int>::from_ints([[0, 2]], &device);
        let swapped = Tensor::<TestBackend, 2, Int>::from_ints([[2, 0]], &device);

        let (a, _) = crossentropy_multi_loss(ordered, logits.clone()).unwrap().to_scalars();
        let (b, _) = crossentropy_multi_loss(swapped, logits).unwrap().to_scalars();
        assert!((a - b).abs() < TOLERANCE);
    }

    #[test]
    fn test_multi_label_shape_checked() {
        let device = Device::default();
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[0, 1, 2]], &device);
        let logits = Tensor::<TestBackend, 3>::zeros([1, 2, 3], &device);
        assert!(matches!(
            crossentropy_multi_loss(labels, logits),
            Err(SeparationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_eos_loss_uniform_logits() {
        let device = Device::default();
        // Example 0: two targets and three logit frames; example 1: no
        // target, one logit frame. Uniform logits score ln(3) everywhere.
        let targets = Tensor::<TestBackend, 2, Int>::from_ints([[0, 1], [0, 0]], &device);
        let logits = Tensor::<TestBackend, 3>::zeros([2, 3, 3], &device);

        let (loss, norm) = cross_entropy_eos_loss(targets, logits, &[3, 1], &[2, 0])
            .unwrap()
            .to_scalars();
        assert_eq!(norm, 4.0);
        assert!((loss - 4.0 * 3.0f32.ln()).abs() < TOLERANCE);
    }

    #[test]
    fn test_eos_loss_scores_final_frame_against_eos() {
        let device = Device::default();
        let targets = Tensor::<TestBackend, 2, Int>::from_ints([[1]], &device);
        // frame 0 is confident in class 1, frame 1 in the EOS class 2
        let logits = Tensor::<TestBackend, 3>::from_floats(
            [[[-30.0, 30.0, -30.0], [-30.0, -30.0, 30.0]]],
            &device,
        );

        let (loss, norm) = cross_entropy_eos_loss(targets, logits, &[2], &[1])
            .unwrap()
            .to_scalars();
        assert!(loss.abs() < TOLERANCE);
        assert_eq!(norm, 2.0);
    }

    #[test]
    fn test_eos_loss_needs_a_frame() {
        let device = Device::default();
        let targets = Tensor::<TestBackend, 2, Int>::from_ints([[0]], &device);
        let logits = Tensor::<TestBackend, 3>::zeros([1, 1, 2], &device);
        assert!(matches!(
            cross_entropy_eos_loss(targets, logits, &[0], &[0]),
            Err(SeparationError::DegenerateInput { .. })
        ));
    }

    #[test]
    fn test_multi_label_outside_classes() {
        let device = Device::default();
        let logits = Tensor::<TestBackend, 3>::zeros([1, 2, 3], &device);

        for labels in [[[0, 3]], [[-1, 1]]] {
            let labels = Tensor::<TestBackend, 2, Int>::from_ints(labels, &device);
            match crossentropy_multi_loss(labels, logits.clone()) {
                Err(SeparationError::ShapeMismatch { context, .. }) => assert_eq!(context, "multi labels"),
                other => panic!("expected a label error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_eos_targets_outside_classes() {
        let device = Device::default();
        // the padded target 9 is never read
        let targets = Tensor::<TestBackend, 2, Int>::from_ints([[1, 9], [5, 9]], &device);
        let logits = Tensor::<TestBackend, 3>::zeros([2, 3, 3], &device);

        assert!(cross_entropy_eos_loss(targets.clone(), logits.clone(), &[2, 1], &[1, 0]).is_ok());
        assert!(matches!(
            cross_entropy_eos_loss(targets, logits, &[2, 2], &[1, 1]),
            Err(SeparationError::ShapeMismatch { .. })
        ));
    }
}
