pub fn mean(data: &[f64]) -> Option<f64> {
    let sum = data.iter().sum::<f64>();
    let count = data.len();

    match count {
        positive if positive > 0 => Some(sum / count as f64),
        _ => None,
    }
}

/// Population variance (divides by `n`, not `n - 1`).
pub fn variance(data: &[f64]) -> Option<f64> {
    mean(data).map(|data_mean| {
        data.iter()
            .map(|value| {
                let diff = data_mean - *value;

                diff * diff
            })
            .sum::<f64>()
            / data.len() as f64
    })
}

pub fn std_dev(data: &[f64]) -> Option<f64> {
    variance(data).map(f64::sqrt)
}

/// Middle element of the sorted values; for even lengths the upper of the two
/// central elements (`sorted[len / 2]`), never an interpolated value.
pub fn median(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(sorted[sorted.len() / 2])
}

/// Euclidean norm of a 3-vector.
pub fn norm3(x: f64, y: f64, z: f64) -> f64 {
    (x * x + y * y + z * z).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[10., 20., 30., 15., 22.]), Some(19.4));
        assert_eq!(mean(&[15., 7., 55., 12., 4.]), Some(18.6));
    }

    #[test]
    fn test_mean_empty_slice() {
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_std_dev() {
        assert_eq!(
            std_dev(&[100., 120., 90., 102., 94.]),
            Some(10.322790320451151)
        );
        assert_eq!(std_dev(&[15., 7., 55.]), Some(20.997354330698162));
    }

    #[test]
    fn test_std_dev_identical_values() {
        assert_eq!(std_dev(&[5.0, 5.0, 5.0, 5.0]), Some(0.0));
    }

    #[test]
    fn test_variance_empty_slice() {
        assert_eq!(variance(&[]), None);
    }

    #[test]
    fn test_median_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
    }

    #[test]
    fn test_median_even_takes_index_len_half() {
        // sorted [1, 2, 3, 4] -> index 2
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(3.0));
    }

    #[test]
    fn test_median_empty() {
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_norm3() {
        assert_eq!(norm3(3.0, 4.0, 0.0), 5.0);
        assert_eq!(norm3(0.0, 0.0, 0.0), 0.0);
    }
}
