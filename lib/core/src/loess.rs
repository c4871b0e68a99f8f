//! Locally weighted linear regression (LOESS) used by the loess normalizer
//!
//! Fits a curve through (raw score, empirical rank) pairs. The smoother uses a
//! tricube kernel over the nearest `bandwidth * n` points and re-weights with
//! bisquare robustness weights for a few iterations. The resulting knots are
//! forced to be non-decreasing and clamped to [0, 1].

pub const DEFAULT_BANDWIDTH: f64 = 0.3;
pub const DEFAULT_ROBUSTNESS_ITERS: usize = 2;
/// Larger samples are thinned to this many evenly spaced quantiles
pub const MAX_KNOTS: usize = 2000;

const ACCURACY: f64 = 1e-12;

/// Fit monotone knots from an ascending, finite, non-empty sample
pub fn fit_knots(sorted: &[f32], bandwidth: f64, robustness_iters: usize) -> (Vec<f64>, Vec<f64>) {
    let (xs, ys) = thin(rank_pairs(sorted));
    let mut fitted = smooth(&xs, &ys, bandwidth, robustness_iters);

    let mut running = 0.0f64;
    for y in &mut fitted {
        let clamped = y.clamp(0.0, 1.0);
        running = running.max(clamped);
        *y = running;
    }
    (xs, fitted)
}

/// Evaluate the fitted curve, holding end values outside the knot range
pub fn evaluate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    if xs.is_empty() || x.is_nan() {
        return 0.0;
    }
    if xs.len() == 1 {
        return if x >= xs[0] { 1.0 } else { 0.0 };
    }
    let idx = xs.partition_point(|&k| k <= x);
    if idx == 0 {
        return ys[0];
    }
    if idx == xs.len() {
        return ys[xs.len() - 1];
    }
    let (x0, x1) = (xs[idx - 1], xs[idx]);
    let (y0, y1) = (ys[idx - 1], ys[idx]);
    let t = (x - x0) / (x1 - x0);
    (y0 + t * (y1 - y0)).clamp(0.0, 1.0)
}

/// Distinct sample values with the mean empirical rank of their occurrences
fn rank_pairs(sorted: &[f32]) -> (Vec<f64>, Vec<f64>) {
    let n = sorted.len();
    let denom = if n > 1 { (n - 1) as f64 } else { 1.0 };
    let mut xs = Vec::new();
    let mut ys = Vec::new();

    let mut start = 0;
    while start < n {
        let mut end = start;
        while end + 1 < n && sorted[end + 1] == sorted[start] {
            end += 1;
        }
        let mean_pos = (start + end) as f64 / 2.0;
        xs.push(f64::from(sorted[start]));
        ys.push(if n > 1 { mean_pos / denom } else { 1.0 });
        start = end + 1;
    }
    (xs, ys)
}

fn thin((xs, ys): (Vec<f64>, Vec<f64>)) -> (Vec<f64>, Vec<f64>) {
    if xs.len() <= MAX_KNOTS {
        return (xs, ys);
    }
    let last = xs.len() - 1;
    (0..MAX_KNOTS)
        .map(|j| {
            let i = (j as f64 * last as f64 / (MAX_KNOTS - 1) as f64).round() as usize;
            (xs[i], ys[i])
        })
        .unzip()
}

fn tricube(x: f64) -> f64 {
    let ax = x.abs();
    if ax >= 1.0 {
        0.0
    } else {
        let t = 1.0 - ax * ax * ax;
        t * t * t
    }
}

/// LOESS smoothing over strictly ascending `xs`
fn smooth(xs: &[f64], ys: &[f64], bandwidth: f64, robustness_iters: usize) -> Vec<f64> {
    let n = xs.len();
    if n <= 2 {
        return ys.to_vec();
    }

    let window = ((bandwidth * n as f64) as usize).clamp(2, n);
    let mut robustness = vec![1.0f64; n];
    let mut fitted = vec![0.0f64; n];
    let mut residuals = vec![0.0f64; n];

    for iter in 0..=robustness_iters {
        let (mut left, mut right) = (0usize, window - 1);

        for i in 0..n {
            let x = xs[i];
            if i > 0 && right + 1 < n && xs[right + 1] - x < x - xs[left] {
                left += 1;
                right += 1;
            }

            let edge = if x - xs[left] > xs[right] - x { left } else { right };
            let reach = (xs[edge] - x).abs();

            let (mut sum_w, mut sum_x, mut sum_xx, mut sum_y, mut sum_xy) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for k in left..=right {
                let dist = (xs[k] - x).abs();
                let kernel = if reach > 0.0 { tricube(dist / reach) } else { 1.0 };
                let w = kernel * robustness[k];
                let xw = xs[k] * w;
                sum_w += w;
                sum_x += xw;
                sum_xx += xs[k] * xw;
                sum_y += ys[k] * w;
                sum_xy += ys[k] * xw;
            }

            if sum_w <= 0.0 {
                fitted[i] = ys[i];
            } else {
                let mean_x = sum_x / sum_w;
                let mean_y = sum_y / sum_w;
                let mean_xy = sum_xy / sum_w;
                let mean_xx = sum_xx / sum_w;
                let var_x = mean_xx - mean_x * mean_x;
                let beta = if var_x.abs().sqrt() < ACCURACY {
                    0.0
                } else {
                    (mean_xy - mean_x * mean_y) / var_x
                };
                let alpha = mean_y - beta * mean_x;
                fitted[i] = beta * x + alpha;
            }
            residuals[i] = (ys[i] - fitted[i]).abs();
        }

        if iter == robustness_iters {
            break;
        }

        let mut sorted_residuals = residuals.clone();
        sorted_residuals.sort_by(f64::total_cmp);
        let median = sorted_residuals[n / 2];
        if median.abs() < ACCURACY {
            break;
        }
        for (weight, residual) in robustness.iter_mut().zip(residuals.iter()) {
            let arg = residual / (6.0 * median);
            *weight = if arg >= 1.0 {
                0.0
            } else {
                let w = 1.0 - arg * arg;
                w * w
            };
        }
    }

    fitted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_data_is_reproduced() {
        let sample: Vec<f32> = (0..50).map(|i| i as f32).collect();
        let (xs, ys) = fit_knots(&sample, DEFAULT_BANDWIDTH, DEFAULT_ROBUSTNESS_ITERS);
        assert_eq!(xs.len(), 50);
        for (i, y) in ys.iter().enumerate() {
            assert!((y - i as f64 / 49.0).abs() < 1e-6, "knot {} = {}", i, y);
        }
    }

    #[test]
    fn test_duplicates_collapse_to_mean_rank() {
        let (xs, ys) = rank_pairs(&[1.0, 2.0, 2.0, 3.0, 4.0]);
        assert_eq!(xs, vec![1.0, 2.0, 3.0, 4.0]);
        assert!((ys[1] - 0.375).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_interpolates_and_holds_ends() {
        let xs = vec![0.0, 1.0];
        let ys = vec![0.2, 0.8];
        assert!((evaluate(&xs, &ys, 0.5) - 0.5).abs() < 1e-12);
        assert_eq!(evaluate(&xs, &ys, -3.0), 0.2);
        assert_eq!(evaluate(&xs, &ys, 9.0), 0.8);
        assert_eq!(evaluate(&[0.5], &[1.0], 0.4), 0.0);
        assert_eq!(evaluate(&[0.5], &[1.0], 0.5), 1.0);
    }

    #[test]
    fn test_thinning_bounds_knots() {
        let sample: Vec<f32> = (0..5000).map(|i| i as f32).collect();
        let (xs, ys) = fit_knots(&sample, DEFAULT_BANDWIDTH, 0);
        assert_eq!(xs.len(), MAX_KNOTS);
        assert_eq!(xs[0], 0.0);
        assert_eq!(xs[MAX_KNOTS - 1], 4999.0);
        assert!(ys.windows(2).all(|w| w[0] <= w[1]));
    }
}
