//! Output comparison.
//!
//! A `Comparator` turns a baseline output and a candidate output into a score where zero
//! means "equivalent within tolerance". The search only looks at whether the score is
//! zero, so implementations are free to pick any non-negative magnitude.

use serde::{Deserialize, Serialize};

use crate::BisectResult;

/// Scoring capability injected into the trial runner.
pub trait Comparator: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `0` iff the outputs are equivalent, otherwise a positive value.
    fn compare(&self, baseline: &str, candidate: &str) -> BisectResult<f64>;
}

/// Selects a built-in comparator from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareKind {
    #[default]
    Numeric,
    Exact,
}

/// Build the comparator named by `kind`.
pub fn comparator_for(kind: CompareKind, tolerance: f64) -> Box<dyn Comparator> {
    match kind {
        CompareKind::Numeric => Box::new(NumericComparator::new(tolerance)),
        CompareKind::Exact => Box::new(ExactComparator),
    }
}

/// Compares every whitespace-separated number of the two outputs.
///
/// The score is the L2 norm of the element-wise differences that exceed `tolerance`,
/// plus one per value present in only one output. NaN equals NaN; NaN against a number
/// counts as one. Non-numeric tokens must match exactly, otherwise they count as one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericComparator {
    tolerance: f64,
}

impl NumericComparator {
    pub fn new(tolerance: f64) -> Self {
        NumericComparator { tolerance: tolerance.abs() }
    }
}

impl Comparator for NumericComparator {
    fn name(&self) -> &str {
        "numeric"
    }

    fn compare(&self, baseline: &str, candidate: &str) -> BisectResult<f64> {
        let lhs: Vec<&str> = baseline.split_whitespace().collect();
        let rhs: Vec<&str> = candidate.split_whitespace().collect();
        let mut squared = 0.0;
        let mut mismatches = lhs.len().abs_diff(rhs.len()) as f64;

        for (a, b) in lhs.iter().zip(rhs.iter()) {
            match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(x), Ok(y)) => {
                    if x.is_nan() || y.is_nan() {
                        if x.is_nan() != y.is_nan() {
                            mismatches += 1.0;
                        }
                    } else if x.is_infinite() || y.is_infinite() {
                        if x != y {
                            mismatches += 1.0;
                        }
                    } else {
                        let d = (x - y).abs();
                        if d > self.tolerance {
                            squared += d * d;
                        }
                    }
                }
                _ => {
                    if a != b {
                        mismatches += 1.0;
                    }
                }
            }
        }

        Ok(squared.sqrt() + mismatches)
    }
}

/// Zero iff the outputs are byte-identical after trimming trailing whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactComparator;

impl Comparator for ExactComparator {
    fn name(&self) -> &str {
        "exact"
    }

    fn compare(&self, baseline: &str, candidate: &str) -> BisectResult<f64> {
        Ok(if baseline.trim_end() == candidate.trim_end() { 0.0 } else { 1.0 })
    }
}

/// Adapts a closure into a comparator, mostly for tests and embedding.
pub struct FnComparator<F> {
    name: String,
    f: F,
}

impl<F> FnComparator<F>
where
    F: Fn(&str, &str) -> f64 + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnComparator { name: name.into(), f }
    }
}

impl<F> Comparator for FnComparator<F>
where
    F: Fn(&str, &str) -> f64 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn compare(&self, baseline: &str, candidate: &str) -> BisectResult<f64> {
        Ok((self.f)(baseline, candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equal_outputs_score_zero() {
        let c = NumericComparator::new(0.0);
        assert_eq!(c.compare("1.0 2.5\n3", "1 2.5 3.0").unwrap(), 0.0);
    }

    #[test]
    fn test_numeric_difference_is_l2() {
        let c = NumericComparator::new(0.0);
        let score = c.compare("0 0", "3 4").unwrap();
        assert!((score - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_numeric_tolerance_masks_small_differences() {
        let c = NumericComparator::new(1e-6);
        assert_eq!(c.compare("1.0", "1.0000001").unwrap(), 0.0);
        assert!(c.compare("1.0", "1.001").unwrap() > 0.0);
    }

    #[test]
    fn test_numeric_length_and_nan_mismatch() {
        let c = NumericComparator::new(0.0);
        assert_eq!(c.compare("1 2", "1").unwrap(), 1.0);
        assert_eq!(c.compare("nan", "NaN").unwrap(), 0.0);
        assert_eq!(c.compare("nan", "1").unwrap(), 1.0);
        assert_eq!(c.compare("inf", "inf").unwrap(), 0.0);
        assert_eq!(c.compare("label 1", "other 1").unwrap(), 1.0);
    }

    #[test]
    fn test_exact_comparator() {
        assert_eq!(ExactComparator.compare("a b\n", "a b").unwrap(), 0.0);
        assert_eq!(ExactComparator.compare("a b", "a c").unwrap(), 1.0);
    }

    #[test]
    fn test_fn_comparator() {
        let c = FnComparator::new("len", |a: &str, b: &str| a.len().abs_diff(b.len()) as f64);
        assert_eq!(c.name(), "len");
        assert_eq!(c.compare("abc", "a").unwrap(), 2.0);
    }

    #[test]
    fn test_comparator_for_kind() {
        assert_eq!(comparator_for(CompareKind::Exact, 0.0).name(), "exact");
        assert_eq!(comparator_for(CompareKind::Numeric, 0.1).name(), "numeric");
    }
}
