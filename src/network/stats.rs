//! Exact over-representation statistics.
//!
//! Fisher's exact test on 2x2 tables via the hypergeometric
//! distribution, computed in log space with a cumulative ln-factorial
//! table so counts in the tens of thousands stay stable.

/// Cumulative ln(n!) lookup built once per test batch.
pub struct LnFactorial {
    table: Vec<f64>,
}

impl LnFactorial {
    pub fn up_to(max: u64) -> Self {
        let mut table = Vec::with_capacity(max as usize + 1);
        table.push(0.0);
        let mut acc = 0.0;
        for n in 1..=max {
            acc += (n as f64).ln();
            table.push(acc);
        }
        LnFactorial { table }
    }

    fn get(&self, n: u64) -> f64 {
        self.table[n as usize]
    }

    fn ln_choose(&self, n: u64, k: u64) -> f64 {
        if k > n {
            return f64::NEG_INFINITY;
        }
        self.get(n) - self.get(k) - self.get(n - k)
    }
}

/// One-sided (greater) Fisher's exact test for the table
///
/// ```text
///                 with term   without term
///   in cluster        a            b
///   background        c            d
/// ```
///
/// Returns P(X >= a) under the hypergeometric null.
pub fn fisher_exact_greater(a: u64, b: u64, c: u64, d: u64) -> f64 {
    let n = a + b + c + d;
    if n == 0 {
        return 1.0;
    }
    let row1 = a + b;
    let col1 = a + c;
    let table = LnFactorial::up_to(n);
    let ln_denominator = table.ln_choose(n, row1);

    let upper = row1.min(col1);
    let mut p = 0.0;
    for k in a..=upper {
        let ln_p =
            table.ln_choose(col1, k) + table.ln_choose(n - col1, row1 - k) - ln_denominator;
        if ln_p.is_finite() {
            p += ln_p.exp();
        }
    }
    p.min(1.0)
}

/// Haldane-corrected odds ratio for the same table.
pub fn odds_ratio(a: u64, b: u64, c: u64, d: u64) -> f64 {
    let (a, b, c, d) = (a as f64 + 0.5, b as f64 + 0.5, c as f64 + 0.5, d as f64 + 0.5);
    (a * d) / (b * c)
}

/// Benjamini-Hochberg step-up FDR. Returns adjusted values in the input
/// order.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let n = p_values.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| {
        p_values[x]
            .partial_cmp(&p_values[y])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut adjusted = vec![0.0; n];
    let mut running_min = 1.0f64;
    for rank in (0..n).rev() {
        let index = order[rank];
        let value = (p_values[index] * n as f64 / (rank + 1) as f64).min(1.0);
        running_min = running_min.min(value);
        adjusted[index] = running_min;
    }
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fisher_matches_hand_computed_table() {
        // Table: a=3 b=1 c=1 d=5. P(X>=3) = P(3) + P(4).
        // Hypergeometric with N=10, K=4 (col1), n=4 (row1):
        // P(3) = C(4,3) * C(6,1) / C(10,4) = 24/210
        // P(4) = C(4,4) * C(6,0) / C(10,4) = 1/210
        let expected = 25.0 / 210.0;
        let p = fisher_exact_greater(3, 1, 1, 5);
        assert!((p - expected).abs() < 1e-12, "got {p}");
    }

    #[test]
    fn fisher_with_no_enrichment_is_near_one() {
        // The cluster has no term members at all.
        let p = fisher_exact_greater(0, 10, 50, 940);
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fisher_detects_strong_enrichment() {
        // 10 of 10 cluster genes carry the term; the term covers 20 of
        // 2000 background genes.
        let p = fisher_exact_greater(10, 0, 10, 1980);
        assert!(p < 1e-15);
    }

    #[test]
    fn fisher_sharpens_with_a_larger_background() {
        let small = fisher_exact_greater(5, 5, 10, 80);
        let large = fisher_exact_greater(5, 5, 10, 8000);
        // A bigger background makes the same overlap more surprising.
        assert!(large < small);
    }

    #[test]
    fn bh_preserves_order_and_clamps() {
        let p = vec![0.001, 0.01, 0.02, 0.8];
        let fdr = benjamini_hochberg(&p);
        assert_eq!(fdr.len(), 4);
        // Adjusted values are monotone along the sorted p-values.
        assert!(fdr[0] <= fdr[1]);
        assert!(fdr[1] <= fdr[2]);
        assert!(fdr[2] <= fdr[3]);
        assert!(fdr.iter().all(|v| (0.0..=1.0).contains(v)));
        // Smallest p: 0.001 * 4 / 1.
        assert!((fdr[0] - 0.004).abs() < 1e-12);
    }

    #[test]
    fn bh_handles_ties_and_empty_input() {
        assert!(benjamini_hochberg(&[]).is_empty());
        let fdr = benjamini_hochberg(&[0.05, 0.05]);
        assert!((fdr[0] - fdr[1]).abs() < 1e-12);
    }

    #[test]
    fn odds_ratio_is_finite_on_zero_cells() {
        let or = odds_ratio(10, 0, 0, 10);
        assert!(or.is_finite());
        assert!(or > 1.0);
    }
}
