use rand::rngs::SmallRng;
use rand::SeedableRng;

pub fn create_rng(seed: u64) -> SmallRng {
    if seed == 0 {
        SmallRng::from_entropy()
    } else {
        SmallRng::seed_from_u64(seed)
    }
}

/// `n` evenly spaced samples over `[start, stop]` (both inclusive).
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Index of the first element in the sorted slice `xs` that is not less than `x`.
pub fn search_sorted_left(xs: &[f64], x: f64) -> usize {
    xs.iter().position(|&v| v >= x).unwrap_or(xs.len())
}
