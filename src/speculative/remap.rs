//! Batch index remapping after verification.
//!
//! Verification rejects a suffix of each request's proposed tokens. Before
//! drafting again, the surviving prefix of every request has to be packed
//! into one contiguous index set over the pre-rejection token buffer.
//!
//! ## Example
//!
//! ```text
//! cu_target_query_lens: [0, 4, 11, 16]   (query lens 4, 7, 5)
//! num_rejected_tokens:  [1, 3, 2]
//!
//! cu_num_tokens:        [0, 3, 7, 10]
//! token_indices:        [0, 1, 2, 4, 5, 6, 7, 11, 12, 13]
//! ```

use candle_core::Tensor;

use crate::error::{Error, Result};

/// Where each request's accepted tokens sit in the pre-rejection buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcceptedIndexMap {
    /// Prefix sums of accepted counts, `num_requests + 1` entries.
    pub cu_num_tokens: Vec<usize>,
    /// Absolute buffer positions of accepted tokens, grouped per request.
    pub token_indices: Vec<u32>,
}

impl AcceptedIndexMap {
    /// Number of requests.
    pub fn num_requests(&self) -> usize {
        self.cu_num_tokens.len().saturating_sub(1)
    }

    /// Total accepted tokens.
    pub fn num_tokens(&self) -> usize {
        self.token_indices.len()
    }

    /// Accepted buffer positions of request `i`.
    pub fn run(&self, i: usize) -> &[u32] {
        &self.token_indices[self.cu_num_tokens[i]..self.cu_num_tokens[i + 1]]
    }
}

/// Keep the earliest accepted tokens of every request.
///
/// `total_accepted_tokens` must equal `cu_target_query_lens[R] -
/// sum(num_rejected_tokens)`; callers pass it so the output can be sized up
/// front. A request may reject its whole block, which yields an empty run.
///
/// # Errors
///
/// Any violated precondition is returned as [`Error::Precondition`] or
/// [`Error::ShapeMismatch`]; nothing is corrected silently.
pub fn remap(
    cu_target_query_lens: &[usize],
    num_rejected_tokens: &[usize],
    total_accepted_tokens: usize,
) -> Result<AcceptedIndexMap> {
    if cu_target_query_lens.len() != num_rejected_tokens.len() + 1 {
        return Err(Error::shape(
            "cu_target_query_lens",
            num_rejected_tokens.len() + 1,
            cu_target_query_lens.len(),
        ));
    }
    if cu_target_query_lens[0] != 0 {
        return Err(Error::Precondition(format!(
            "cu_target_query_lens must start at 0, got {}",
            cu_target_query_lens[0]
        )));
    }

    let mut cu_num_tokens = Vec::with_capacity(cu_target_query_lens.len());
    let mut token_indices = Vec::with_capacity(total_accepted_tokens);
    cu_num_tokens.push(0);

    for (i, (bounds, &rejected)) in cu_target_query_lens
        .windows(2)
        .zip(num_rejected_tokens)
        .enumerate()
    {
        let (start, end) = (bounds[0], bounds[1]);
        let query_len = end.checked_sub(start).ok_or_else(|| {
            Error::Precondition(format!(
                "cu_target_query_lens decreases at request {i}: {start} -> {end}"
            ))
        })?;
        let accepted = query_len.checked_sub(rejected).ok_or_else(|| {
            Error::Precondition(format!(
                "request {i} rejects {rejected} of {query_len} tokens"
            ))
        })?;

        token_indices.extend((start..start + accepted).map(|idx| idx as u32));
        cu_num_tokens.push(token_indices.len());
    }

    if token_indices.len() != total_accepted_tokens {
        return Err(Error::shape(
            "total_accepted_tokens",
            token_indices.len(),
            total_accepted_tokens,
        ));
    }

    Ok(AcceptedIndexMap {
        cu_num_tokens,
        token_indices,
    })
}

/// Gather the accepted rows of a per-token tensor along dim 0.
pub fn select_accepted(tensor: &Tensor, map: &AcceptedIndexMap) -> Result<Tensor> {
    let index = Tensor::new(map.token_indices.as_slice(), tensor.device())?;
    Ok(tensor.index_select(&index, 0)?)
}

/// Gather the accepted entries of per-token host metadata.
pub fn select_accepted_host<T: Copy>(values: &[T], map: &AcceptedIndexMap) -> Result<Vec<T>> {
    map.token_indices
        .iter()
        .map(|&idx| {
            values.get(idx as usize).copied().ok_or_else(|| {
                Error::Precondition(format!(
                    "token index {idx} outside buffer of {} entries",
                    values.len()
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_remap_example() {
        let map = remap(&[0, 4, 11, 16], &[1, 3, 2], 10).unwrap();

        assert_eq!(map.cu_num_tokens, vec![0, 3, 7, 10]);
        assert_eq!(map.token_indices, vec![0, 1, 2, 4, 5, 6, 7, 11, 12, 13]);
        assert_eq!(map.num_requests(), 3);
        assert_eq!(map.run(1), &[4, 5, 6, 7]);
    }

    #[test]
    fn test_remap_empty_batch() {
        let map = remap(&[0], &[], 0).unwrap();
        assert_eq!(map.cu_num_tokens, vec![0]);
        assert!(map.token_indices.is_empty());
        assert_eq!(map.num_requests(), 0);
    }

    #[test]
    fn test_select_accepted() {
        let device = Device::Cpu;
        let map = remap(&[0, 3, 5], &[1, 1], 3).unwrap();

        let hidden = Tensor::new(&[[0f32], [1.], [2.], [3.], [4.]], &device).unwrap();
        let selected = select_accepted(&hidden, &map).unwrap();
        assert_eq!(selected.to_vec2::<f32>().unwrap(), vec![vec![0.], vec![1.], vec![3.]]);

        let positions = select_accepted_host(&[10usize, 11, 12, 20, 21], &map).unwrap();
        assert_eq!(positions, vec![10, 11, 20]);
        assert!(select_accepted_host(&[1usize], &map).is_err());
    }
}
