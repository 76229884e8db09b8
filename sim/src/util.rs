//! Sampling helpers shared by the source models. All randomness flows
//! through explicitly seeded generators; nothing here touches a global RNG.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Draw a Poisson variate with expected value `l`.
///
/// Uses the multiplicative inverse-transform method for small `l` and a
/// rounded normal approximation (mean = variance = `l`) above 30, where the
/// inverse transform underflows.
pub fn poisson_variate(l: f64, rng: &mut StdRng) -> i64 {
    if l == 0.0 {
        return 0;
    }
    if l > 30.0 {
        let z: f64 = rng.sample(StandardNormal);
        let x = z * l.sqrt() + l;
        let i = x as i64;
        if x - i as f64 > 0.5 {
            return i + 1;
        }
        return i;
    }
    let cap = (-l).exp();
    let mut k: i64 = 0;
    let mut p: f64 = 1.0;
    while p > cap {
        k += 1;
        p *= rng.gen::<f64>();
    }
    k - 1
}

/// Smallest `i` in `[0, n)` for which `pred(i)` holds, assuming `pred` is
/// false then true over the range; `n` if it never holds.
pub fn search_i64(n: i64, pred: impl Fn(i64) -> bool) -> i64 {
    let (mut i, mut j) = (0i64, n);
    while i < j {
        let h = i + (j - i) / 2;
        if pred(h) {
            j = h;
        } else {
            i = h + 1;
        }
    }
    i
}

/// Derive `n` child seeds from `seed` with a splitmix64 walk, so that copies
/// of a source get decoupled, reproducible streams.
pub fn spawn_seeds(seed: u64, n: usize) -> Vec<u64> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state.wrapping_add(0x9e3779b97f4a7c15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
            z ^ (z >> 31)
        })
        .collect()
}

/// A fresh generator for the given seed.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_var(l: f64, n: usize, seed: u64) -> (f64, f64) {
        let mut rng = seeded_rng(seed);
        let draws: Vec<f64> = (0..n).map(|_| poisson_variate(l, &mut rng) as f64).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n as f64;
        (mean, var)
    }

    #[test]
    fn poisson_moments_small_lambda() {
        let (mean, var) = mean_var(25.0, 300_000, 1);
        assert!((mean - 25.0).abs() / 25.0 < 0.01, "mean {mean}");
        assert!((var - 25.0).abs() / 25.0 < 0.01, "var {var}");
    }

    #[test]
    fn poisson_moments_large_lambda() {
        let (mean, var) = mean_var(1000.0, 300_000, 2);
        assert!((mean - 1000.0).abs() / 1000.0 < 0.01, "mean {mean}");
        assert!((var - 1000.0).abs() / 1000.0 < 0.01, "var {var}");
    }

    #[test]
    fn poisson_zero_rate() {
        let mut rng = seeded_rng(3);
        for _ in 0..100 {
            assert_eq!(poisson_variate(0.0, &mut rng), 0);
        }
    }

    #[test]
    fn search_finds_boundary() {
        assert_eq!(search_i64(100, |i| i >= 37), 37);
        assert_eq!(search_i64(100, |_| false), 100);
        assert_eq!(search_i64(100, |_| true), 0);
        assert_eq!(search_i64(0, |_| true), 0);
    }

    #[test]
    fn spawned_seeds_are_distinct_and_stable() {
        let a = spawn_seeds(99, 8);
        let b = spawn_seeds(99, 8);
        assert_eq!(a, b);
        for i in 0..a.len() {
            for j in i + 1..a.len() {
                assert_ne!(a[i], a[j]);
            }
        }
        assert_ne!(spawn_seeds(98, 8), a);
    }
}
