// =============================================================================
// Local Extrema
// =============================================================================
//
// A point `i` is an extremum of order `k` when it compares favourably against
// every neighbour `i ± 1 ..= i ± k`.  Neighbour indices past either edge are
// clipped onto the edge value, so an edge point is compared with itself: it
// can never be a strict extremum, but it can be a non-strict one.
//
// NaN never compares favourably, so warm-up gaps in an indicator column
// suppress extrema next to them.
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtremumKind {
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Neighbours must be strictly below (max) or above (min).
    Strict,
    /// Ties with neighbours still count.
    Inclusive,
}

/// Indices of local extrema of `values`, ascending.
pub fn find_extrema(values: &[f64], order: usize, kind: ExtremumKind, cmp: Comparison) -> Vec<usize> {
    let n = values.len();
    if n == 0 || order == 0 {
        return Vec::new();
    }

    let wins = |a: f64, b: f64| match (kind, cmp) {
        (ExtremumKind::Max, Comparison::Strict) => a > b,
        (ExtremumKind::Max, Comparison::Inclusive) => a >= b,
        (ExtremumKind::Min, Comparison::Strict) => a < b,
        (ExtremumKind::Min, Comparison::Inclusive) => a <= b,
    };

    (0..n)
        .filter(|&i| {
            (1..=order).all(|k| {
                let left = i.saturating_sub(k);
                let right = (i + k).min(n - 1);
                wins(values[i], values[left]) && wins(values[i], values[right])
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_peak_found() {
        let v = [1.0, 2.0, 5.0, 2.0, 1.0];
        assert_eq!(find_extrema(&v, 2, ExtremumKind::Max, Comparison::Strict), vec![2]);
    }

    #[test]
    fn strict_edges_never_qualify() {
        let v = [9.0, 1.0, 2.0, 3.0, 10.0];
        assert!(find_extrema(&v, 1, ExtremumKind::Max, Comparison::Strict).is_empty());
    }

    #[test]
    fn inclusive_edges_and_plateaus_qualify() {
        let v = [9.0, 1.0, 4.0, 4.0, 1.0];
        assert_eq!(
            find_extrema(&v, 1, ExtremumKind::Max, Comparison::Inclusive),
            vec![0, 2, 3]
        );
    }

    #[test]
    fn minima_respect_order() {
        let v = [5.0, 3.0, 4.0, 1.0, 4.0, 5.0, 6.0];
        // With order 2, index 1 is not a minimum because index 3 is lower.
        assert_eq!(find_extrema(&v, 2, ExtremumKind::Min, Comparison::Strict), vec![3]);
    }

    #[test]
    fn nan_neighbours_suppress_extrema() {
        let v = [f64::NAN, 5.0, 1.0, 0.5, 2.0];
        assert!(find_extrema(&v, 1, ExtremumKind::Max, Comparison::Strict).is_empty());
        assert_eq!(find_extrema(&v, 1, ExtremumKind::Min, Comparison::Strict), vec![3]);
    }
}
