//! Numeric helpers shared by the analysis engines.
//!
//! Standard deviations are sample (n - 1) deviations throughout.

use statrs::statistics::Statistics;

pub const EPSILON: f64 = 1e-10;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().mean())
    }
}

pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        None
    } else {
        Some(values.iter().std_dev())
    }
}

pub fn variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        None
    } else {
        Some(values.iter().variance())
    }
}

/// `(current - baseline) / baseline * 100`, or `None` for a zero baseline.
pub fn percent_change(baseline: f64, current: f64) -> Option<f64> {
    if baseline.abs() < EPSILON {
        None
    } else {
        Some((current - baseline) / baseline * 100.0)
    }
}

/// Percentile with linear interpolation between closest ranks.
/// `pct` is in [0, 100].
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

/// Percentile rank of `value` within `population`, in (0, 100].
/// Ties share their average rank.
pub fn percentile_rank(population: &[f64], value: f64) -> f64 {
    if population.is_empty() {
        return 0.0;
    }
    let below = population.iter().filter(|&&v| v < value).count() as f64;
    let equal = population
        .iter()
        .filter(|&&v| (v - value).abs() < EPSILON)
        .count() as f64;
    let average_rank = below + (equal + 1.0) / 2.0;
    average_rank / population.len() as f64 * 100.0
}

/// Trailing means over `window` values; the first entry covers `values[..window]`.
pub fn rolling_means(values: &[f64], window: usize) -> Vec<f64> {
    if window == 0 || values.len() < window {
        return Vec::new();
    }
    let mut sum: f64 = values[..window].iter().sum();
    let mut means = Vec::with_capacity(values.len() - window + 1);
    means.push(sum / window as f64);
    for i in window..values.len() {
        sum += values[i] - values[i - window];
        means.push(sum / window as f64);
    }
    means
}

/// Ordinary least squares fit of `y = intercept + slope * x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LineFit {
    pub fn at(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Fits a line against the index positions of `ys` (x = offset, offset + 1, ...).
pub fn fit_line(ys: &[f64], offset: f64) -> Option<LineFit> {
    if ys.len() < 2 {
        return None;
    }
    let n = ys.len() as f64;
    let xs: Vec<f64> = (0..ys.len()).map(|i| offset + i as f64).collect();
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();
    let sum_xy: f64 = xs.iter().zip(ys).map(|(x, y)| x * y).sum();

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < EPSILON {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;

    let mean_y = sum_y / n;
    let ss_tot: f64 = ys.iter().map(|y| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (y - (intercept + slope * x)).powi(2))
        .sum();
    let r_squared = if ss_tot > EPSILON {
        1.0 - ss_res / ss_tot
    } else {
        1.0
    };

    Some(LineFit {
        slope,
        intercept,
        r_squared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_std_matches_hand_computation() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let expected = (32.0_f64 / 7.0).sqrt();
        assert!((std_dev(&values).unwrap() - expected).abs() < 1e-9);
        assert_eq!(std_dev(&[1.0]), None);
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 100.0), Some(4.0));
        assert!((percentile(&values, 75.0).unwrap() - 3.25).abs() < 1e-9);
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn percentile_rank_averages_ties() {
        let population = [10.0, 20.0, 20.0, 40.0];
        assert!((percentile_rank(&population, 10.0) - 25.0).abs() < 1e-9);
        assert!((percentile_rank(&population, 20.0) - 62.5).abs() < 1e-9);
        assert!((percentile_rank(&population, 40.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rolling_means_are_trailing() {
        let means = rolling_means(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(means, vec![2.0, 3.0, 4.0]);
        assert!(rolling_means(&[1.0], 3).is_empty());
    }

    #[test]
    fn percent_change_guards_zero_baseline() {
        assert_eq!(percent_change(0.0, 10.0), None);
        assert!((percent_change(50.0, 75.0).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn fit_line_recovers_exact_line() {
        let ys: Vec<f64> = (0..10).map(|x| 3.0 - 0.5 * x as f64).collect();
        let fit = fit_line(&ys, 0.0).unwrap();
        assert!((fit.slope + 0.5).abs() < 1e-9);
        assert!((fit.intercept - 3.0).abs() < 1e-9);
        assert!((fit.r_squared - 1.0).abs() < 1e-9);
        assert!(fit_line(&[1.0], 0.0).is_none());
    }
}
