use super::config::{Decision, EvaluationPolicy, VariantStat};
use crate::analytics::{AggregateBucket, Aggregates};

// ── Result Structs ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub variants: Vec<VariantStat>,
}

impl Evaluation {
    pub fn winning(&self) -> Option<usize> {
        self.decision.winning()
    }

    pub fn winner(&self) -> Option<usize> {
        self.decision.winner()
    }
}

// ── Evaluation ──────────────────────────────────────────────────────

/// Score merged aggregates and decide whether a variant has won.
///
/// Variants are visited in index order. The running maximum rate rises
/// whenever a variant beats it, but the leader only moves to a variant whose
/// sample also satisfies `size*rate >= m` and `size*(1-rate) >= m`. Each
/// variant's p-value is the Binomial(size, control rate) PMF at its hit
/// count. The leader wins when its p-value is strictly below the threshold.
///
/// Fewer than two variants yields an empty evaluation. Aggregates shorter
/// than the variant list are padded with zero buckets.
pub fn evaluate(
    aggregates: &[AggregateBucket],
    variant_values: &[String],
    policy: &EvaluationPolicy,
) -> Evaluation {
    if variant_values.len() < 2 {
        return Evaluation::default();
    }

    let buckets: Aggregates = (0..variant_values.len())
        .map(|i| aggregates.get(i).copied().unwrap_or_default())
        .collect();

    let control = buckets[0];
    let control_rate = conversion_rate(control.size, control.hits);
    // No control samples means nothing to compare against.
    let baseline =
        (control.size > 0 && (0.0..=1.0).contains(&control_rate)).then_some(control_rate);

    let mut max_rate = 0.0_f64;
    let mut winning: Option<usize> = None;
    let mut variants = Vec::with_capacity(buckets.len());

    for (i, (bucket, value)) in buckets.iter().zip(variant_values).enumerate() {
        let rate = conversion_rate(bucket.size, bucket.hits);

        if rate > max_rate {
            max_rate = rate;
            if meets_sample_rule(bucket.size, rate, policy.min_expected_count) {
                winning = Some(i);
            }
        }

        let p = baseline
            .map(|p0| binomial_pmf(bucket.size, p0, bucket.hits))
            .filter(|p| p.is_finite());

        variants.push(VariantStat {
            value: value.clone(),
            size: bucket.size,
            hits: bucket.hits,
            rate,
            p,
        });
    }

    let decision = match winning {
        Some(i) if variants[i].p.is_some_and(|p| p < policy.significance_threshold) => {
            Decision::Decided(i)
        }
        Some(i) => Decision::Leading(i),
        None => Decision::NotDecided,
    };

    Evaluation { decision, variants }
}

pub fn conversion_rate(size: u64, hits: u64) -> f64 {
    if size == 0 {
        0.0
    } else {
        hits as f64 / size as f64
    }
}

/// Rule of thumb for the normal approximation to a binomial.
fn meets_sample_rule(size: u64, rate: f64, min_expected: f64) -> bool {
    let n = size as f64;
    n * rate >= min_expected && n * (1.0 - rate) >= min_expected
}

// ── Binomial PMF ────────────────────────────────────────────────────

/// P(X = k) for X ~ Binomial(n, p), computed in log space.
pub fn binomial_pmf(n: u64, p: f64, k: u64) -> f64 {
    if k > n || !(0.0..=1.0).contains(&p) {
        return 0.0;
    }
    if p == 0.0 {
        return if k == 0 { 1.0 } else { 0.0 };
    }
    if p == 1.0 {
        return if k == n { 1.0 } else { 0.0 };
    }

    let (n_f, k_f) = (n as f64, k as f64);
    let ln_choose = ln_gamma(n_f + 1.0) - ln_gamma(k_f + 1.0) - ln_gamma(n_f - k_f + 1.0);
    (ln_choose + k_f * p.ln() + (n_f - k_f) * (1.0 - p).ln()).exp()
}

/// Lanczos approximation of ln(Gamma(x)) for x > 0.
#[allow(clippy::excessive_precision)]
fn ln_gamma(x: f64) -> f64 {
    // Lanczos coefficients (g=7)
    let coefficients = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Reflection formula
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut acc = coefficients[0];
    let t = x + 7.5; // g + 0.5

    for (i, &coef) in coefficients.iter().enumerate().skip(1) {
        acc += coef / (x + i as f64);
    }

    0.5 * (2.0 * std::f64::consts::PI).ln() + (t.ln() * (x + 0.5)) - t + acc.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("variant-{}", i)).collect()
    }

    fn buckets(pairs: &[(u64, u64)]) -> Aggregates {
        pairs
            .iter()
            .map(|&(size, hits)| AggregateBucket::new(size, hits))
            .collect()
    }

    // ── Binomial PMF ────────────────────────────────────────────────

    #[test]
    fn pmf_matches_closed_form_for_small_n() {
        // C(10,3) * 0.2^3 * 0.8^7
        let expected = 120.0 * 0.2_f64.powi(3) * 0.8_f64.powi(7);
        let pmf = binomial_pmf(10, 0.2, 3);
        assert!((pmf - expected).abs() < 1e-10, "pmf={}", pmf);
    }

    #[test]
    fn pmf_sums_to_one() {
        let total: f64 = (0..=200).map(|k| binomial_pmf(200, 0.07, k)).sum();
        assert!((total - 1.0).abs() < 1e-9, "total={}", total);
    }

    #[test]
    fn pmf_far_tail_is_tiny_but_not_nan() {
        let pmf = binomial_pmf(1000, 0.05, 90);
        assert!(pmf.is_finite());
        assert!(pmf < 1e-6, "pmf={}", pmf);
    }

    #[test]
    fn pmf_degenerate_probabilities() {
        assert_eq!(binomial_pmf(10, 0.0, 0), 1.0);
        assert_eq!(binomial_pmf(10, 0.0, 1), 0.0);
        assert_eq!(binomial_pmf(10, 1.0, 10), 1.0);
        assert_eq!(binomial_pmf(10, 1.0, 9), 0.0);
        assert_eq!(binomial_pmf(10, 0.5, 11), 0.0);
        assert_eq!(binomial_pmf(10, 1.5, 3), 0.0);
    }

    #[test]
    fn conversion_rate_of_empty_bucket_is_zero() {
        assert_eq!(conversion_rate(0, 0), 0.0);
        assert_eq!(conversion_rate(200, 50), 0.25);
    }

    // ── Evaluate ────────────────────────────────────────────────────

    #[test]
    fn clear_uplift_is_declared_winner() {
        let eval = evaluate(
            &buckets(&[(1000, 50), (1000, 90)]),
            &values(2),
            &EvaluationPolicy::default(),
        );
        assert_eq!(eval.decision, Decision::Decided(1));
        assert_eq!(eval.winning(), Some(1));
        assert_eq!(eval.winner(), Some(1));
        assert!((eval.variants[1].rate - 0.09).abs() < 1e-12);
        assert!(eval.variants[1].p.unwrap() < 0.01);
    }

    #[test]
    fn small_sample_never_leads() {
        let eval = evaluate(
            &buckets(&[(20, 2), (20, 3)]),
            &values(2),
            &EvaluationPolicy::default(),
        );
        assert_eq!(eval.decision, Decision::NotDecided);
        assert!(eval.variants.iter().all(|v| v.p.is_some()));
    }

    #[test]
    fn significance_boundary_is_strict() {
        let aggs = buckets(&[(1000, 50), (1000, 70)]);
        let p = evaluate(&aggs, &values(2), &EvaluationPolicy::default()).variants[1]
            .p
            .unwrap();

        let at_boundary = EvaluationPolicy {
            significance_threshold: p,
            ..Default::default()
        };
        assert_eq!(
            evaluate(&aggs, &values(2), &at_boundary).decision,
            Decision::Leading(1)
        );

        let above = EvaluationPolicy {
            significance_threshold: p * 1.000001,
            ..Default::default()
        };
        assert_eq!(
            evaluate(&aggs, &values(2), &above).decision,
            Decision::Decided(1)
        );
    }

    #[test]
    fn fewer_than_two_variants_is_empty() {
        let eval = evaluate(&buckets(&[(1000, 90)]), &values(1), &EvaluationPolicy::default());
        assert_eq!(eval, Evaluation::default());
        let eval = evaluate(&[], &[], &EvaluationPolicy::default());
        assert!(eval.variants.is_empty());
    }

    #[test]
    fn zero_size_control_blocks_a_winner() {
        let eval = evaluate(
            &buckets(&[(0, 0), (1000, 90)]),
            &values(2),
            &EvaluationPolicy::default(),
        );
        assert_eq!(eval.decision, Decision::Leading(1));
        assert!(eval.variants.iter().all(|v| v.p.is_none()));
    }

    #[test]
    fn missing_buckets_are_zero() {
        let eval = evaluate(&buckets(&[(1000, 50)]), &values(3), &EvaluationPolicy::default());
        assert_eq!(eval.variants.len(), 3);
        assert_eq!(eval.variants[2].size, 0);
        assert_eq!(eval.variants[2].rate, 0.0);
        assert_eq!(eval.variants[2].value, "variant-2");
    }

    #[test]
    fn all_zero_rates_have_no_leader() {
        let eval = evaluate(
            &buckets(&[(500, 0), (500, 0), (500, 0)]),
            &values(3),
            &EvaluationPolicy::default(),
        );
        assert_eq!(eval.decision, Decision::NotDecided);
    }

    #[test]
    fn ties_favour_earlier_variant() {
        let eval = evaluate(
            &buckets(&[(100, 10), (100, 10)]),
            &values(2),
            &EvaluationPolicy::default(),
        );
        // Control compared with itself is nowhere near significant.
        assert_eq!(eval.decision, Decision::Leading(0));
    }

    #[test]
    fn control_can_win_against_weaker_challenger() {
        let eval = evaluate(
            &buckets(&[(1000, 50), (1000, 10)]),
            &values(2),
            &EvaluationPolicy::default(),
        );
        // The control's own PMF at its mean is not below 0.01.
        assert_eq!(eval.decision, Decision::Leading(0));
        assert!(eval.variants[1].p.unwrap() < 0.01);
    }

    #[test]
    fn undersized_high_rate_raises_the_bar_for_later_variants() {
        let eval = evaluate(
            &buckets(&[(1000, 50), (10, 4), (1000, 90)]),
            &values(3),
            &EvaluationPolicy::default(),
        );
        assert_eq!(eval.decision, Decision::Leading(0));
    }

    #[test]
    fn looser_sample_rule_allows_smaller_leaders() {
        let policy = EvaluationPolicy {
            min_expected_count: 2.0,
            ..Default::default()
        };
        let eval = evaluate(&buckets(&[(20, 2), (20, 3)]), &values(2), &policy);
        assert_eq!(eval.decision, Decision::Leading(1));
    }

    #[test]
    fn stats_carry_variant_values_in_order() {
        let vals = vec!["Original".to_string(), "Shorter".to_string()];
        let eval = evaluate(
            &buckets(&[(10, 1), (10, 2)]),
            &vals,
            &EvaluationPolicy::default(),
        );
        let names: Vec<&str> = eval.variants.iter().map(|v| v.value.as_str()).collect();
        assert_eq!(names, ["Original", "Shorter"]);
    }
}
