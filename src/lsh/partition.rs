//! Cardinality partitioning for the LSH Ensemble.
//!
//! Sets in a partition `[l, u]` are all indexed as if they had size `u`. A set of size `x < u`
//! therefore adds false positives roughly proportional to `(u - x) / u`. The partitioning below
//! minimizes the sum of that cost over the observed size histogram with a dynamic program.
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Inclusive cardinality range of an ensemble partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub lower: usize,
    pub upper: usize,
}

impl Partition {
    pub fn contains(&self, size: usize) -> bool {
        self.lower <= size && size <= self.upper
    }
}

/// Expected false positives of a partition spanning `sizes[l..=u]`, computed in O(1)
/// from prefix sums.
struct FalsePositiveCost<'a> {
    sizes: &'a [usize],
    cum_counts: Vec<f64>,
    cum_weighted: Vec<f64>,
}

impl<'a> FalsePositiveCost<'a> {
    fn new(sizes: &'a [usize], counts: &[usize]) -> Self {
        let mut cum_counts = Vec::with_capacity(sizes.len() + 1);
        let mut cum_weighted = Vec::with_capacity(sizes.len() + 1);
        cum_counts.push(0.);
        cum_weighted.push(0.);
        for (&s, &c) in sizes.iter().zip(counts) {
            let last_c = cum_counts[cum_counts.len() - 1];
            let last_w = cum_weighted[cum_weighted.len() - 1];
            cum_counts.push(last_c + c as f64);
            cum_weighted.push(last_w + (s * c) as f64);
        }
        FalsePositiveCost {
            sizes,
            cum_counts,
            cum_weighted,
        }
    }

    /// sum over i in l..=u of counts[i] * (sizes[u] - sizes[i]) / sizes[u]
    fn nfp(&self, l: usize, u: usize) -> f64 {
        let n = self.cum_counts[u + 1] - self.cum_counts[l];
        let w = self.cum_weighted[u + 1] - self.cum_weighted[l];
        n - w / self.sizes[u] as f64
    }
}

/// Split the size domain into at most `num_part` partitions.
///
/// # Arguments
/// * `sizes` - Distinct set sizes, strictly increasing.
/// * `counts` - Number of sets of every size.
/// * `num_part` - Requested number of partitions.
///
/// If `num_part` is at least the number of distinct sizes, every size becomes its own
/// partition and fewer than `num_part` partitions are returned.
pub fn optimal_partitions(
    sizes: &[usize],
    counts: &[usize],
    num_part: usize,
) -> Result<Vec<Partition>> {
    if sizes.is_empty() {
        return Err(Error::param("cannot partition an empty size domain"));
    }
    if sizes.len() != counts.len() {
        return Err(Error::param("sizes and counts differ in length"));
    }
    if sizes.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::param("sizes must be strictly increasing"));
    }
    let n = sizes.len();
    if num_part < 2 {
        return Ok(vec![Partition {
            lower: sizes[0],
            upper: sizes[n - 1],
        }]);
    }
    if num_part >= n {
        return Ok(sizes
            .iter()
            .map(|&s| Partition { lower: s, upper: s })
            .collect());
    }

    let nfps = FalsePositiveCost::new(sizes, counts);
    // cost[p][u]: best cost of splitting sizes[0..=u] into p + 1 partitions.
    // split[p][u]: upper index of the partition before the last one in that solution.
    let mut cost = vec![vec![f64::INFINITY; n]; num_part];
    let mut split = vec![vec![0usize; n]; num_part];
    for u in 0..n {
        cost[0][u] = nfps.nfp(0, u);
    }
    for p in 1..num_part {
        for u in p..n {
            // strict comparison keeps the smallest split on ties
            for u1 in (p - 1)..u {
                let c = cost[p - 1][u1] + nfps.nfp(u1 + 1, u);
                if c < cost[p][u] {
                    cost[p][u] = c;
                    split[p][u] = u1;
                }
            }
        }
    }

    let mut partitions = Vec::with_capacity(num_part);
    let mut u = n - 1;
    for p in (1..num_part).rev() {
        let u1 = split[p][u];
        partitions.push(Partition {
            lower: sizes[u1 + 1],
            upper: sizes[u],
        });
        u = u1;
    }
    partitions.push(Partition {
        lower: sizes[0],
        upper: sizes[u],
    });
    partitions.reverse();
    Ok(partitions)
}
