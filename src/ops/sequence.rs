//! Masked reductions over padded, variable-length batches.
//!
//! Every helper here works from the host-side length vector: the valid row
//! indices are computed once and the tensor is touched by a single gather,
//! so the cost does not depend on looping over examples in tensor code.

use burn::tensor::{Int, Tensor, TensorData, backend::Backend};

use crate::errors::{Result, SeparationError};

/// Checks a length vector against a padded tensor's `[batch, max_time]`.
pub fn check_lengths(seq_length: &[usize], batch_size: usize, max_time: usize) -> Result<()> {
    if seq_length.len() != batch_size {
        return Err(SeparationError::shape(
            "sequence lengths",
            format!("{batch_size} entries"),
            seq_length.len(),
        ));
    }
    if let Some((index, length)) = seq_length
        .iter()
        .enumerate()
        .find(|(_, length)| **length > max_time)
    {
        return Err(SeparationError::shape(
            format!("sequence length of example {index}"),
            format!("at most {max_time}"),
            length,
        ));
    }
    Ok(())
}

/// `(batch, time)` coordinates of every valid frame, batch-major then
/// time-major.
pub fn valid_indices(seq_length: &[usize]) -> Vec<(usize, usize)> {
    seq_length
        .iter()
        .enumerate()
        .flat_map(|(batch, &length)| (0..length).map(move |time| (batch, time)))
        .collect()
}

fn flat_rows(seq_length: &[usize], max_time: usize) -> Vec<i64> {
    valid_indices(seq_length)
        .into_iter()
        .map(|(batch, time)| (batch * max_time + time) as i64)
        .collect()
}

fn index_tensor<B: Backend>(rows: Vec<i64>, device: &B::Device) -> Tensor<B, 1, Int> {
    let count = rows.len();
    Tensor::from_data(TensorData::new(rows, [count]), device)
}

/// Float `[batch, max_time]` mask: 1.0 for frames inside the sequence.
pub fn sequence_mask<B: Backend>(
    seq_length: &[usize],
    max_time: usize,
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    let batch_size = seq_length.len();
    check_lengths(seq_length, batch_size, max_time)?;

    let lengths: Vec<i64> = seq_length.iter().map(|&length| length as i64).collect();
    let lengths = Tensor::<B, 1, Int>::from_data(TensorData::new(lengths, [batch_size]), device)
        .reshape([batch_size, 1])
        .expand([batch_size, max_time]);
    let times = Tensor::<B, 1, Int>::arange(0..max_time as i64, device)
        .reshape([1, max_time])
        .expand([batch_size, max_time]);

    Ok(times.lower(lengths).float())
}

/// Combines a `[batch, time, feat]` bin mask with the sequence mask so
/// padding never counts, whatever the producer put in `usedbins`.
pub fn valid_bin_weights<B: Backend>(
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<Tensor<B, 3>> {
    let [batch_size, max_time, _] = usedbins.dims();
    check_lengths(seq_length, batch_size, max_time)?;
    let mask = sequence_mask::<B>(seq_length, max_time, &usedbins.device())?;
    Ok(usedbins * mask.reshape([batch_size, max_time, 1]))
}

/// Gathers the valid frames of a padded `[batch, max_time, ...]` tensor into
/// a flat `[sum(lengths), ...]` tensor. `D2` must be `D - 1`.
pub fn extract_valid<B: Backend, const D: usize, const D2: usize>(
    padded: Tensor<B, D>,
    seq_length: &[usize],
) -> Result<Tensor<B, D2>> {
    if D < 2 || D2 + 1 != D {
        return Err(SeparationError::shape(
            "extract_valid output rank",
            D.saturating_sub(1),
            D2,
        ));
    }
    let dims = padded.dims();
    let (batch_size, max_time) = (dims[0], dims[1]);
    check_lengths(seq_length, batch_size, max_time)?;

    let inner: usize = dims[2..].iter().product();
    let rows = flat_rows(seq_length, max_time);
    let mut out_dims = vec![rows.len()];
    out_dims.extend_from_slice(&dims[2..]);
    let shape: [usize; D2] = out_dims
        .try_into()
        .map_err(|_| SeparationError::shape("extract_valid output rank", D - 1, D2))?;

    let device = padded.device();
    if rows.is_empty() {
        return Ok(Tensor::zeros(shape, &device));
    }
    let gathered = padded
        .reshape([batch_size * max_time, inner])
        .select(0, index_tensor::<B>(rows, &device));
    Ok(gathered.reshape(shape))
}

/// [`extract_valid`] for integer label sequences `[batch, max_time]`.
pub fn extract_valid_labels<B: Backend>(
    padded: Tensor<B, 2, Int>,
    seq_length: &[usize],
) -> Result<Tensor<B, 1, Int>> {
    let [batch_size, max_time] = padded.dims();
    check_lengths(seq_length, batch_size, max_time)?;

    let rows = flat_rows(seq_length, max_time);
    let device = padded.device();
    if rows.is_empty() {
        return Ok(Tensor::zeros([0], &device));
    }
    Ok(padded
        .reshape([batch_size * max_time])
        .select(0, index_tensor::<B>(rows, &device)))
}

/// Sparse view of padded label sequences.
#[derive(Debug, Clone)]
pub struct SparseSequence<B: Backend> {
    /// `(batch, time)` coordinate of each value.
    pub indices: Vec<(usize, usize)>,
    /// Values at those coordinates.
    pub values: Tensor<B, 1, Int>,
    /// Shape of the padded tensor.
    pub dense_shape: [usize; 2],
}

/// Converts padded `[batch, max_time]` labels to a sparse representation
/// holding only the valid entries.
pub fn dense_sequence_to_sparse<B: Backend>(
    sequences: Tensor<B, 2, Int>,
    seq_length: &[usize],
) -> Result<SparseSequence<B>> {
    let dense_shape = sequences.dims();
    let values = extract_valid_labels(sequences, seq_length)?;
    Ok(SparseSequence {
        indices: valid_indices(seq_length),
        values,
        dense_shape,
    })
}

/// Reverses every example along time inside its own length; padding stays
/// in place.
pub fn reverse_sequences<B: Backend>(
    padded: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<Tensor<B, 3>> {
    let [batch_size, max_time, features] = padded.dims();
    check_lengths(seq_length, batch_size, max_time)?;
    if batch_size * max_time == 0 {
        return Ok(padded);
    }

    let rows: Vec<i64> = seq_length
        .iter()
        .enumerate()
        .flat_map(|(batch, &length)| {
            (0..max_time).map(move |time| {
                let source = if time < length { length - 1 - time } else { time };
                (batch * max_time + source) as i64
            })
        })
        .collect();

    let device = padded.device();
    Ok(padded
        .reshape([batch_size * max_time, features])
        .select(0, index_tensor::<B>(rows, &device))
        .reshape([batch_size, max_time, features]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn numbered_batch(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 3> {
        // value = 10 * batch + time
        Tensor::from_floats(
            [
                [[0.0], [1.0], [2.0]],
                [[10.0], [11.0], [12.0]],
                [[20.0], [21.0], [22.0]],
            ],
            device,
        )
    }

    #[test]
    fn test_valid_indices_order() {
        assert_eq!(
            valid_indices(&[3, 0, 2]),
            vec![(0, 0), (0, 1), (0, 2), (2, 0), (2, 1)]
        );
    }

    #[test]
    fn test_extract_valid_skips_empty_example() {
        let device = <TestBackend as Backend>::Device::default();
        let flat: Tensor<TestBackend, 2> = extract_valid(numbered_batch(&device), &[3, 0, 2]).unwrap();

        assert_eq!(flat.dims(), [5, 1]);
        let values: Vec<f32> = flat.to_data().to_vec().unwrap();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 20.0, 21.0]);
    }

    #[test]
    fn test_extract_valid_rejects_bad_lengths() {
        let device = <TestBackend as Backend>::Device::default();

        let too_long = extract_valid::<TestBackend, 3, 2>(numbered_batch(&device), &[4, 0, 2]);
        assert!(matches!(too_long, Err(SeparationError::ShapeMismatch { .. })));

        let wrong_batch = extract_valid::<TestBackend, 3, 2>(numbered_batch(&device), &[1, 1]);
        assert!(matches!(wrong_batch, Err(SeparationError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_sequence_mask() {
        let device = <TestBackend as Backend>::Device::default();
        let mask = sequence_mask::<TestBackend>(&[2, 0, 3], 3, &device).unwrap();
        let values: Vec<f32> = mask.to_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_extract_valid_labels_and_sparse() {
        let device = <TestBackend as Backend>::Device::default();
        let labels = Tensor::<TestBackend, 2, Int>::from_ints([[1, 2, 9], [3, 9, 9]], &device);

        let sparse = dense_sequence_to_sparse(labels, &[2, 1]).unwrap();
        assert_eq!(sparse.indices, vec![(0, 0), (0, 1), (1, 0)]);
        assert_eq!(sparse.dense_shape, [2, 3]);
        let values: Vec<i64> = sparse.values.to_data().to_vec().unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_reverse_sequences_keeps_padding() {
        let device = <TestBackend as Backend>::Device::default();
        let reversed = reverse_sequences(numbered_batch(&device), &[3, 0, 2]).unwrap();
        let values: Vec<f32> = reversed.to_data().to_vec().unwrap();
        assert_eq!(
            values,
            vec![2.0, 1.0, 0.0, 10.0, 11.0, 12.0, 21.0, 20.0, 22.0]
        );
    }
}
