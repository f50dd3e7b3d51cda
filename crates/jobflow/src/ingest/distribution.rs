/// Splits `limit` fetch slots across sources by weight.
///
/// Every source with a positive finite weight gets one slot first when the
/// limit allows (heaviest first when it does not); the rest is shared in
/// proportion to weight with largest-remainder rounding. The shares always
/// sum to `limit` unless no source has a usable weight.
pub fn distribute(limit: usize, weights: &[f64]) -> Vec<usize> {
    let mut shares = vec![0; weights.len()];
    let usable = |w: f64| w.is_finite() && w > 0.0;

    let mut eligible: Vec<usize> = (0..weights.len()).filter(|&i| usable(weights[i])).collect();
    if eligible.is_empty() || limit == 0 {
        return shares;
    }

    // Heaviest first, stable by position.
    eligible.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]).then(a.cmp(&b)));

    if limit < eligible.len() {
        for &i in eligible.iter().take(limit) {
            shares[i] = 1;
        }
        return shares;
    }

    for &i in &eligible {
        shares[i] = 1;
    }
    let remaining = limit - eligible.len();
    if remaining == 0 {
        return shares;
    }

    // Scaled by the heaviest weight so the sum stays finite.
    let heaviest = weights[eligible[0]];
    let scaled = |i: usize| weights[i] / heaviest;
    let total: f64 = eligible.iter().map(|&i| scaled(i)).sum();
    let mut fractions = Vec::with_capacity(eligible.len());
    let mut assigned = 0;
    for &i in &eligible {
        let exact = remaining as f64 * scaled(i) / total;
        let whole = exact.floor() as usize;
        shares[i] += whole;
        assigned += whole;
        fractions.push((i, exact - whole as f64));
    }

    fractions.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then(weights[b.0].total_cmp(&weights[a.0]))
            .then(a.0.cmp(&b.0))
    });
    for &(i, _) in fractions.iter().take(remaining.saturating_sub(assigned)) {
        shares[i] += 1;
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_weights_split_evenly() {
        assert_eq!(distribute(10, &[1.0, 1.0]), vec![5, 5]);
        assert_eq!(distribute(7, &[1.0, 1.0, 1.0]), vec![3, 2, 2]);
    }

    #[test]
    fn test_proportional_after_minimum() {
        // One each, then 8 split 3:1.
        assert_eq!(distribute(10, &[3.0, 1.0]), vec![7, 3]);
        assert_eq!(distribute(30, &[0.5, 0.3, 0.2]), vec![15, 9, 6]);
    }

    #[test]
    fn test_limit_below_source_count_favors_heaviest() {
        assert_eq!(distribute(2, &[0.2, 0.5, 0.3]), vec![0, 1, 1]);
    }

    #[test]
    fn test_unusable_weights_get_nothing() {
        assert_eq!(distribute(5, &[0.0, 1.0, f64::NAN, -2.0]), vec![0, 5, 0, 0]);
        assert_eq!(distribute(5, &[0.0]), vec![0]);
        assert!(distribute(5, &[]).is_empty());
    }

    #[test]
    fn test_huge_weights_stay_proportional() {
        let big = f64::MAX / 2.0;
        assert_eq!(distribute(13, &[big, big, big / 2.0]), vec![5, 5, 3]);
        assert_eq!(distribute(12, &[f64::MAX, f64::MAX / 4.0]), vec![9, 3]);
    }

    #[test]
    fn test_shares_always_sum_to_limit() {
        let weights = [0.7, 0.1, 0.15, 0.05, 2.5];
        for limit in 0..60 {
            assert_eq!(distribute(limit, &weights).iter().sum::<usize>(), limit);
        }
    }
}
