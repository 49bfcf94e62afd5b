//! Permutation search for permutation-invariant losses.
//!
//! The cost of assigning output channel `i` to target channel `j` is computed
//! once per example (`nrS²` pairs). A permutation `p` then costs
//! `sum_k pair[p[k], k]`, which for all permutations at once is a single
//! matmul against a 0/1 selection matrix.

use burn::tensor::{Tensor, TensorData, backend::Backend};

use crate::errors::{Result, SeparationError};

/// Largest supported number of sources; `8!` permutations is the ceiling.
pub const MAX_SOURCES: usize = 8;

/// All permutations of `0..n` in lexicographic order.
pub fn permutations(n: usize) -> Vec<Vec<usize>> {
    let mut current: Vec<usize> = (0..n).collect();
    let mut all = vec![current.clone()];
    while next_permutation(&mut current) {
        all.push(current.clone());
    }
    all
}

fn next_permutation(values: &mut [usize]) -> bool {
    if values.len() < 2 {
        return false;
    }
    let mut pivot = values.len() - 1;
    while pivot > 0 && values[pivot - 1] >= values[pivot] {
        pivot -= 1;
    }
    if pivot == 0 {
        return false;
    }
    let mut successor = values.len() - 1;
    while values[successor] <= values[pivot - 1] {
        successor -= 1;
    }
    values.swap(pivot - 1, successor);
    values[pivot..].reverse();
    true
}

/// Minimizes a pairwise assignment cost over every channel permutation.
#[derive(Debug, Clone)]
pub struct PermutationSearch {
    num_sources: usize,
    permutations: Vec<Vec<usize>>,
}

impl PermutationSearch {
    /// Fails unless `1 <= num_sources <= MAX_SOURCES`.
    pub fn new(num_sources: usize) -> Result<Self> {
        if num_sources == 0 || num_sources > MAX_SOURCES {
            return Err(SeparationError::configuration(
                "nrS",
                format!(
                    "permutation search needs between 1 and {MAX_SOURCES} sources, got {num_sources}"
                ),
            ));
        }
        Ok(Self {
            num_sources,
            permutations: permutations(num_sources),
        })
    }

    pub fn num_sources(&self) -> usize {
        self.num_sources
    }

    /// Permutations in enumeration (lexicographic) order.
    pub fn permutations(&self) -> &[Vec<usize>] {
        &self.permutations
    }

    /// `[nrS * nrS, nrS!]` matrix with a 1 at `(p[k] * nrS + k, p)`.
    pub fn selection_matrix<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let n = self.num_sources;
        let count = self.permutations.len();
        let mut data = vec![0.0f32; n * n * count];
        for (column, permutation) in self.permutations.iter().enumerate() {
            for (target, &output) in permutation.iter().enumerate() {
                data[(output * n + target) * count + column] = 1.0;
            }
        }
        Tensor::from_data(TensorData::new(data, [n * n, count]), device)
    }

    fn check_pairs(&self, dims: [usize; 3]) -> Result<()> {
        let [_, outputs, targets] = dims;
        if outputs != self.num_sources || targets != self.num_sources {
            return Err(SeparationError::shape(
                "pairwise permutation costs",
                format!("[batch, {0}, {0}]", self.num_sources),
                format!("{dims:?}"),
            ));
        }
        Ok(())
    }

    /// Cost of every permutation per example, `[batch, nrS!]`, from pairwise
    /// costs `[batch, nrS(outputs), nrS(targets)]`.
    pub fn permutation_costs<B: Backend>(&self, pair_costs: Tensor<B, 3>) -> Result<Tensor<B, 2>> {
        let dims = pair_costs.dims();
        self.check_pairs(dims)?;
        let n = self.num_sources;
        let selection = self.selection_matrix::<B>(&pair_costs.device());
        Ok(pair_costs.reshape([dims[0], n * n]).matmul(selection))
    }

    /// Per-example minimum permutation cost, `[batch]`.
    pub fn min_cost<B: Backend>(&self, pair_costs: Tensor<B, 3>) -> Result<Tensor<B, 1>> {
        let batch_size = pair_costs.dims()[0];
        Ok(self
            .permutation_costs(pair_costs)?
            .min_dim(1)
            .reshape([batch_size]))
    }

    /// Host-side arg-min per example; the first minimum in enumeration order
    /// wins ties.
    pub fn best_permutations<B: Backend>(&self, pair_costs: Tensor<B, 3>) -> Result<Vec<Vec<usize>>> {
        let costs = self.permutation_costs(pair_costs)?;
        let [batch_size, count] = costs.dims();
        let values: Vec<f32> = costs
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|err| SeparationError::TensorData {
                message: format!("{err:?}"),
            })?;

        Ok((0..batch_size)
            .map(|batch| {
                let row = &values[batch * count..(batch + 1) * count];
                let mut best = 0;
                for (index, &cost) in row.iter().enumerate() {
                    if cost < row[best] {
                        best = index;
                    }
                }
                self.permutations[best].clone()
            })
            .collect())
    }
}

/// Squared-error pairwise costs between reconstructions and targets.
///
/// `recs` and `targets` are `[batch, time, feat, nrS]`, `weights` is
/// `[batch, time, feat]`. Returns `[batch, nrS(recs), nrS(targets)]` with
/// `sum_{t,f} w * (recs[.., i] - targets[.., j])²`.
pub fn squared_error_pairs<B: Backend>(
    recs: Tensor<B, 4>,
    targets: Tensor<B, 4>,
    weights: Tensor<B, 3>,
) -> Result<Tensor<B, 3>> {
    let dims = recs.dims();
    if targets.dims() != dims {
        return Err(SeparationError::shape(
            "reconstruction targets",
            format!("{dims:?}"),
            format!("{:?}", targets.dims()),
        ));
    }
    let [batch_size, time, feat, n] = dims;
    if weights.dims() != [batch_size, time, feat] {
        return Err(SeparationError::shape(
            "reconstruction weights",
            format!("{:?}", [batch_size, time, feat]),
            format!("{:?}", weights.dims()),
        ));
    }

    // Σw(r - t)² = Σw·r² + Σw·t² - 2·Σ(w·r)t
    let bins = time * feat;
    let shape = [batch_size, n, n];
    let recs = recs.reshape([batch_size, bins, n]);
    let targets = targets.reshape([batch_size, bins, n]);
    let weights = weights.reshape([batch_size, bins, 1]).expand([batch_size, bins, n]);

    let weighted_recs = recs.clone() * weights.clone();
    let rec_energy = (weighted_recs.clone() * recs)
        .sum_dim(1)
        .reshape([batch_size, n, 1])
        .expand(shape);
    let target_energy = (targets.clone().powf_scalar(2.0) * weights)
        .sum_dim(1)
        .expand(shape);
    let cross = weighted_recs.swap_dims(1, 2).matmul(targets);

    Ok(rec_energy + target_energy - cross.mul_scalar(2.0))
}

/// Sum over the batch of the per-example minimum, as a single-element tensor.
pub(crate) fn summed_min_cost<B: Backend>(
    search: &PermutationSearch,
    pair_costs: Tensor<B, 3>,
) -> Result<Tensor<B, 1>> {
    log::trace!(
        "permutation search over {} candidates for pair costs {:?}",
        search.permutations.len(),
        pair_costs.dims()
    );
    Ok(search.min_cost(pair_costs)?.sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_permutations_lexicographic() {
        assert_eq!(
            permutations(3),
            vec![
                vec![0, 1, 2],
                vec![0, 2, 1],
                vec![1, 0, 2],
                vec![1, 2, 0],
                vec![2, 0, 1],
                vec![2, 1, 0],
            ]
        );
        assert_eq!(permutations(1), vec![vec![0]]);
        assert_eq!(permutations(5).len(), 120);
    }

    #[test]
    fn test_search_bounds() {
        assert!(matches!(
            PermutationSearch::new(0),
            Err(SeparationError::Configuration { .. })
        ));
        assert!(matches!(
            PermutationSearch::new(MAX_SOURCES + 1),
            Err(SeparationError::Configuration { .. })
        ));
        assert_eq!(PermutationSearch::new(1).unwrap().permutations().len(), 1);
    }

    fn swapped_channels(
        device: &<TestBackend as Backend>::Device,
    ) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 4>) {
        // [batch=1, time=1, feat=2, nrS=2]: recs channels [1,0] and [0,1],
        // targets channels [0,1] and [1,0].
        let recs = Tensor::from_floats([[[[1.0, 0.0], [0.0, 1.0]]]], device);
        let targets = Tensor::from_floats([[[[0.0, 1.0], [1.0, 0.0]]]], device);
        (recs, targets)
    }

    #[test]
    fn test_swapped_channels_cost_zero() {
        let device = <TestBackend as Backend>::Device::default();
        let (recs, targets) = swapped_channels(&device);
        let weights = Tensor::ones([1, 1, 2], &device);
        let search = PermutationSearch::new(2).unwrap();

        let pairs = squared_error_pairs(recs, targets, weights).unwrap();
        let pair_values: Vec<f32> = pairs.to_data().to_vec().unwrap();
        assert_eq!(pair_values, vec![2.0, 0.0, 0.0, 2.0]);

        let costs: Vec<f32> = search
            .permutation_costs(pairs.clone())
            .unwrap()
            .to_data()
            .to_vec()
            .unwrap();
        assert_eq!(costs, vec![4.0, 0.0]);

        let min: f32 = search.min_cost(pairs.clone()).unwrap().sum().into_scalar();
        assert_eq!(min, 0.0);
        assert_eq!(search.best_permutations(pairs).unwrap(), vec![vec![1, 0]]);
    }

    #[test]
    fn test_cost_invariant_to_output_order() {
        let device = <TestBackend as Backend>::Device::default();
        let (recs, targets) = swapped_channels(&device);
        let weights = Tensor::<TestBackend, 3>::ones([1, 1, 2], &device);
        let search = PermutationSearch::new(2).unwrap();
        let swap = Tensor::from_ints([1, 0], &device);

        let original = squared_error_pairs(recs.clone(), targets.clone(), weights.clone()).unwrap();
        let reordered = squared_error_pairs(recs.select(3, swap), targets, weights).unwrap();

        let a: f32 = search.min_cost(original).unwrap().sum().into_scalar();
        let b: f32 = search.min_cost(reordered).unwrap().sum().into_scalar();
        assert_eq!(a, b);
    }

    #[test]
    fn test_ties_keep_first_permutation() {
        let device = <TestBackend as Backend>::Device::default();
        let search = PermutationSearch::new(3).unwrap();
        let pairs = Tensor::<TestBackend, 3>::ones([2, 3, 3], &device);
        assert_eq!(
            search.best_permutations(pairs).unwrap(),
            vec![vec![0, 1, 2], vec![0, 1, 2]]
        );
    }

    #[test]
    fn test_pairs_shape_checked() {
        let device = <TestBackend as Backend>::Device::default();
        let search = PermutationSearch::new(3).unwrap();
        let pairs = Tensor::<TestBackend, 3>::ones([1, 2, 2], &device);
        assert!(matches!(
            search.min_cost(pairs),
            Err(SeparationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_pairs_match_direct_sum() {
        let device = <TestBackend as Backend>::Device::default();
        // [batch=1, time=2, feat=2, nrS=3]
        let rec_values = [0.3f32, -1.2, 0.8, 2.0, 0.1, -0.4, 1.5, 0.7, -0.9, 0.0, 0.6, 1.1];
        let target_values = [1.0f32, 0.2, -0.5, 0.4, 0.9, 0.3, -1.1, 0.0, 0.5, 0.8, -0.2, 1.4];
        let weight_values = [1.0f32, 0.5, 0.0, 2.0];
        let recs = Tensor::<TestBackend, 4>::from_data(TensorData::new(rec_values.to_vec(), [1, 2, 2, 3]), &device);
        let targets =
            Tensor::<TestBackend, 4>::from_data(TensorData::new(target_values.to_vec(), [1, 2, 2, 3]), &device);
        let weights =
            Tensor::<TestBackend, 3>::from_data(TensorData::new(weight_values.to_vec(), [1, 2, 2]), &device);

        let pairs: Vec<f32> = squared_error_pairs(recs, targets, weights)
            .unwrap()
            .to_data()
            .to_vec()
            .unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let expected: f32 = (0..4)
                    .map(|bin| {
                        let diff = rec_values[bin * 3 + i] - target_values[bin * 3 + j];
                        weight_values[bin] * diff * diff
                    })
                    .sum();
                assert!((pairs[i * 3 + j] - expected).abs() < 1e-5, "({i}, {j})");
            }
        }
    }
}
