//! Signing threshold evaluation (tholder)
//!
//! A threshold arrives on the wire as a [`ThresholdSpec`] and is parsed into a
//! [`Tholder`] that answers two questions: how many keys the threshold
//! implies ([`Tholder::size`]) and whether a set of signer indices satisfies
//! it ([`Tholder::satisfy`]).
//!
//! Supported forms:
//!
//! - hex integer, `"2"`: at least that many distinct signers
//! - single fraction, `"2/3"`: that fraction of the key count, rounded up,
//!   resolved once the key count is known ([`Tholder::bind`])
//! - weighted list, `["1/2","1/2","1/2"]`: one weight per key slot, satisfied
//!   when present weights sum to at least one
//! - multi-clause, `[["1/2","1/2"],["1"]]`: clauses cover consecutive key
//!   slots and every clause must be satisfied independently
//!
//! Weight sums use exact rational arithmetic.

use crate::errors::{KeriError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Wire form of a signing threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    /// Hex integer or single fraction of the key count
    Simple(String),
    /// One weight per key slot
    Weighted(Vec<String>),
    /// Independently satisfied clauses over consecutive key slots
    MultiClause(Vec<Vec<String>>),
}

impl ThresholdSpec {
    /// Integer threshold in its hex wire form
    pub fn count(n: u64) -> Self {
        ThresholdSpec::Simple(format!("{n:x}"))
    }

    /// Weighted single-clause threshold
    pub fn weighted<S: Into<String>>(weights: impl IntoIterator<Item = S>) -> Self {
        ThresholdSpec::Weighted(weights.into_iter().map(Into::into).collect())
    }
}

impl Default for ThresholdSpec {
    fn default() -> Self {
        ThresholdSpec::count(1)
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Exact non-negative rational number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fraction {
    num: u64,
    den: u64,
}

impl Fraction {
    /// Reduced fraction; the denominator must be non-zero
    pub fn new(num: u64, den: u64) -> Result<Self> {
        if den == 0 {
            return Err(KeriError::threshold("zero denominator"));
        }
        let g = gcd(u128::from(num), u128::from(den)).max(1);
        Ok(Self {
            num: (u128::from(num) / g) as u64,
            den: (u128::from(den) / g) as u64,
        })
    }

    /// Numerator
    pub fn num(&self) -> u64 {
        self.num
    }

    /// Denominator
    pub fn den(&self) -> u64 {
        self.den
    }

    /// Whether the value is at most one
    pub fn at_most_one(&self) -> bool {
        self.num <= self.den
    }

    /// Whether the value is zero
    pub fn is_zero(&self) -> bool {
        self.num == 0
    }
}

impl FromStr for Fraction {
    type Err = KeriError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| KeriError::threshold(format!("invalid weight '{s}'")))
        };
        match s.split_once('/') {
            Some((num, den)) => Fraction::new(parse(num)?, parse(den)?),
            None => Fraction::new(parse(s)?, 1),
        }
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Exact running sum of fractions.
///
/// The denominator stays the least common multiple of the weights added so
/// far, so a clause whose full sum fits also fits for every subset.
#[derive(Debug, Clone, Copy)]
struct WeightSum {
    num: u128,
    den: u128,
}

impl WeightSum {
    fn zero() -> Self {
        Self { num: 0, den: 1 }
    }

    /// `None` when the sum no longer fits
    fn add(self, w: Fraction) -> Option<Self> {
        let w_den = u128::from(w.den);
        let den = (self.den / gcd(self.den, w_den)).checked_mul(w_den)?;
        let num = self
            .num
            .checked_mul(den / self.den)?
            .checked_add(u128::from(w.num).checked_mul(den / w_den)?)?;
        Some(Self { num, den })
    }

    /// Sum of every weight in a clause, checking that any subset also fits
    fn bounded(weights: &[Fraction]) -> Result<Self> {
        let total = weights
            .iter()
            .try_fold(Self::zero(), |acc, w| acc.add(*w))
            .filter(|sum| sum.den.checked_mul(weights.len() as u128).is_some())
            .ok_or_else(|| KeriError::threshold("weights too fine"))?;
        Ok(total)
    }

    fn at_least_one(&self) -> bool {
        self.num >= self.den
    }
}

/// Which key list a threshold governs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdRole {
    /// Current signing keys, threshold must be at least one
    Current,
    /// Next key digests, threshold may be zero
    Next,
}

/// Parsed signing threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tholder {
    /// At least `threshold` distinct signers
    Unweighted {
        /// Required signer count
        threshold: u64,
    },
    /// A fraction of the key count, rounded up
    Proportional {
        /// Required share of the key list
        fraction: Fraction,
        /// Signer count once bound to a key list
        required: Option<u64>,
    },
    /// Weighted clauses over consecutive key slots
    Weighted {
        /// Weights per clause
        clauses: Vec<Vec<Fraction>>,
    },
}

impl Tholder {
    /// Parse a wire threshold
    pub fn parse(spec: &ThresholdSpec) -> Result<Self> {
        match spec {
            ThresholdSpec::Simple(text) => {
                if text.contains('/') {
                    let fraction: Fraction = text.parse()?;
                    if fraction.is_zero() || !fraction.at_most_one() {
                        return Err(KeriError::threshold(format!(
                            "fractional threshold {text} must be in (0, 1]"
                        )));
                    }
                    Ok(Tholder::Proportional {
                        fraction,
                        required: None,
                    })
                } else {
                    let threshold = u64::from_str_radix(text, 16).map_err(|_| {
                        KeriError::threshold(format!("invalid hex threshold '{text}'"))
                    })?;
                    Ok(Tholder::Unweighted { threshold })
                }
            }
            ThresholdSpec::Weighted(weights) => {
                Self::weighted(std::slice::from_ref(weights).to_vec())
            }
            ThresholdSpec::MultiClause(clauses) => Self::weighted(clauses.clone()),
        }
    }

    fn weighted(raw: Vec<Vec<String>>) -> Result<Self> {
        if raw.is_empty() || raw.iter().any(Vec::is_empty) {
            return Err(KeriError::threshold("empty weighted clause"));
        }
        let mut clauses = Vec::with_capacity(raw.len());
        for clause in raw {
            let weights = clause
                .iter()
                .map(|w| w.parse::<Fraction>())
                .collect::<Result<Vec<_>>>()?;
            if let Some(w) = weights.iter().find(|w| !w.at_most_one()) {
                return Err(KeriError::threshold(format!("weight {w} exceeds one")));
            }
            if !WeightSum::bounded(&weights)?.at_least_one() {
                return Err(KeriError::threshold(
                    "weighted clause can never be satisfied",
                ));
            }
            clauses.push(weights);
        }
        Ok(Tholder::Weighted { clauses })
    }

    /// Parse, bind to `key_count` and validate in one step
    pub fn for_keys(spec: &ThresholdSpec, key_count: usize, role: ThresholdRole) -> Result<Self> {
        let tholder = Self::parse(spec)?.bind(key_count);
        tholder.validate(key_count, role)?;
        Ok(tholder)
    }

    /// Resolve a proportional threshold against a key list length
    pub fn bind(self, key_count: usize) -> Self {
        match self {
            Tholder::Proportional { fraction, .. } => {
                let keys = key_count as u128;
                let num = u128::from(fraction.num()) * keys;
                let den = u128::from(fraction.den());
                let required = num.div_ceil(den) as u64;
                Tholder::Proportional {
                    fraction,
                    required: Some(required),
                }
            }
            other => other,
        }
    }

    /// Check the threshold against the key list it governs
    pub fn validate(&self, key_count: usize, role: ThresholdRole) -> Result<()> {
        let minimum = match role {
            ThresholdRole::Current => 1,
            ThresholdRole::Next => 0,
        };
        match self {
            Tholder::Unweighted { threshold } => {
                if *threshold < minimum {
                    return Err(KeriError::threshold(format!(
                        "threshold {threshold} below minimum {minimum}"
                    )));
                }
            }
            Tholder::Proportional { required, .. } => match required {
                None => return Err(KeriError::threshold("proportional threshold not bound")),
                Some(r) if *r < minimum => {
                    return Err(KeriError::threshold(format!(
                        "threshold resolves to {r} below minimum {minimum}"
                    )))
                }
                Some(_) => {}
            },
            Tholder::Weighted { .. } => {}
        }
        if self.size() > key_count {
            return Err(KeriError::threshold(format!(
                "threshold implies {} keys but only {key_count} present",
                self.size()
            )));
        }
        Ok(())
    }

    /// Minimum key list size implied by the threshold
    pub fn size(&self) -> usize {
        match self {
            Tholder::Unweighted { threshold } => *threshold as usize,
            Tholder::Proportional { required, .. } => required.map_or(1, |r| r as usize),
            Tholder::Weighted { clauses } => clauses.iter().map(Vec::len).sum(),
        }
    }

    /// Whether the signers at `indices` satisfy the threshold.
    ///
    /// Duplicate indices count once. A proportional threshold that has not
    /// been bound to a key list is never satisfied.
    pub fn satisfy(&self, indices: &[u32]) -> bool {
        let present: BTreeSet<u32> = indices.iter().copied().collect();
        match self {
            Tholder::Unweighted { threshold } => present.len() as u64 >= *threshold,
            Tholder::Proportional { required, .. } => {
                required.is_some_and(|r| present.len() as u64 >= r)
            }
            Tholder::Weighted { clauses } => {
                let mut offset = 0usize;
                clauses.iter().all(|clause| {
                    let start = offset;
                    offset += clause.len();
                    clause
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| present.contains(&((start + i) as u32)))
                        .try_fold(WeightSum::zero(), |acc, (_, w)| acc.add(*w))
                        .is_some_and(|sum| sum.at_least_one())
                })
            }
        }
    }

    /// Whether the threshold uses fractional weights
    pub fn is_weighted(&self) -> bool {
        matches!(self, Tholder::Weighted { .. })
    }

    /// Wire form
    pub fn spec(&self) -> ThresholdSpec {
        match self {
            Tholder::Unweighted { threshold } => ThresholdSpec::count(*threshold),
            Tholder::Proportional { fraction, .. } => ThresholdSpec::Simple(fraction.to_string()),
            Tholder::Weighted { clauses } => {
                let clauses: Vec<Vec<String>> = clauses
                    .iter()
                    .map(|c| c.iter().map(ToString::to_string).collect())
                    .collect();
                match clauses.as_slice() {
                    [single] => ThresholdSpec::Weighted(single.clone()),
                    _ => ThresholdSpec::MultiClause(clauses),
                }
            }
        }
    }
}

/// Default witness threshold for `n` witnesses.
///
/// The smallest receipt count that still guarantees accountable duplicity
/// for the largest tolerable number of faulty witnesses `f` with
/// `n >= 3f + 1`.
pub fn ample(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let f1 = ((n - 1) / 3).max(1);
    let f2 = (n - 1).div_ceil(3).max(1);
    n.min((n + f1 + 1).div_ceil(2)).min((n + f2 + 1).div_ceil(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec(weights: &[&str]) -> ThresholdSpec {
        ThresholdSpec::weighted(weights.iter().copied())
    }

    #[test]
    fn test_hex_threshold() {
        let tholder = Tholder::parse(&ThresholdSpec::Simple("a".into())).unwrap();
        assert_eq!(tholder, Tholder::Unweighted { threshold: 10 });
        assert_eq!(tholder.size(), 10);
    }

    #[test]
    fn test_current_threshold_below_one_rejected() {
        let err = Tholder::for_keys(&ThresholdSpec::count(0), 1, ThresholdRole::Current);
        assert!(err.is_err());
        assert!(Tholder::for_keys(&ThresholdSpec::count(0), 0, ThresholdRole::Next).is_ok());
    }

    #[test]
    fn test_threshold_exceeding_keys_rejected() {
        assert!(Tholder::for_keys(&ThresholdSpec::count(3), 2, ThresholdRole::Current).is_err());
        assert!(Tholder::for_keys(&spec(&["1/2", "1/2", "1/2"]), 2, ThresholdRole::Current).is_err());
    }

    #[test]
    fn test_weighted_two_of_three() {
        let tholder = Tholder::parse(&spec(&["1/2", "1/2", "1/2"])).unwrap();
        for pair in [[0u32, 1], [0, 2], [1, 2]] {
            assert!(tholder.satisfy(&pair));
        }
        for single in 0..3u32 {
            assert!(!tholder.satisfy(&[single]));
        }
        assert!(!tholder.satisfy(&[1, 1]));
    }

    #[test]
    fn test_multi_clause_requires_every_clause() {
        let tholder = Tholder::parse(&ThresholdSpec::MultiClause(vec![
            vec!["1/2".into(), "1/2".into()],
            vec!["1".into()],
        ]))
        .unwrap();
        assert_eq!(tholder.size(), 3);
        assert!(tholder.satisfy(&[0, 1, 2]));
        assert!(!tholder.satisfy(&[0, 1]));
        assert!(!tholder.satisfy(&[0, 2]));
    }

    #[test]
    fn test_exact_rational_thirds() {
        let tholder = Tholder::parse(&spec(&["1/3", "1/3", "1/3"])).unwrap();
        assert!(tholder.satisfy(&[0, 1, 2]));
        assert!(!tholder.satisfy(&[0, 1]));
    }

    #[test]
    fn test_unsatisfiable_clause_rejected() {
        assert!(Tholder::parse(&spec(&["1/4", "1/4"])).is_err());
        assert!(Tholder::parse(&spec(&["3/2"])).is_err());
    }

    #[test]
    fn test_weights_too_fine_rejected() {
        let fine = spec(&[
            "1",
            "1/18446744073709551557",
            "1/18446744073709551533",
            "1/18446744073709551521",
        ]);
        let err = Tholder::parse(&fine).unwrap_err();
        assert!(err.to_string().contains("weights too fine"));
        assert!(Tholder::for_keys(&fine, 4, ThresholdRole::Current).is_err());

        // Large denominators that stay representable still work
        let coarse = Tholder::parse(&spec(&["1/18446744073709551557", "1"])).unwrap();
        assert!(coarse.satisfy(&[1]));
        assert!(!coarse.satisfy(&[0]));
    }

    #[test]
    fn test_unrepresentable_weights_never_satisfy() {
        let tholder = Tholder::Weighted {
            clauses: vec![vec![
                Fraction::new(1, 18446744073709551557).unwrap(),
                Fraction::new(1, 18446744073709551533).unwrap(),
                Fraction::new(1, 18446744073709551521).unwrap(),
            ]],
        };
        assert!(!tholder.satisfy(&[0, 1, 2]));
    }

    #[test]
    fn test_proportional_binds_to_key_count() {
        let tholder =
            Tholder::for_keys(&ThresholdSpec::Simple("2/3".into()), 4, ThresholdRole::Current)
                .unwrap();
        assert_eq!(tholder.size(), 3);
        assert!(tholder.satisfy(&[0, 1, 3]));
        assert!(!tholder.satisfy(&[0, 1]));

        let unbound = Tholder::parse(&ThresholdSpec::Simple("2/3".into())).unwrap();
        assert!(!unbound.satisfy(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_spec_round_trip() {
        for s in [
            ThresholdSpec::count(2),
            spec(&["1/2", "1/2"]),
            ThresholdSpec::MultiClause(vec![vec!["1".into()], vec!["1/2".into(), "1/2".into()]]),
        ] {
            assert_eq!(Tholder::parse(&s).unwrap().spec(), s);
        }
    }

    #[test]
    fn test_wire_forms_deserialize() {
        let simple: ThresholdSpec = serde_json::from_str("\"2\"").unwrap();
        assert_eq!(simple, ThresholdSpec::Simple("2".into()));
        let weighted: ThresholdSpec = serde_json::from_str("[\"1/2\",\"1/2\"]").unwrap();
        assert!(matches!(weighted, ThresholdSpec::Weighted(_)));
        let multi: ThresholdSpec = serde_json::from_str("[[\"1\"],[\"1/2\",\"1/2\"]]").unwrap();
        assert!(matches!(multi, ThresholdSpec::MultiClause(_)));
    }

    #[test]
    fn test_ample() {
        assert_eq!(ample(0), 0);
        assert_eq!(ample(1), 1);
        assert_eq!(ample(2), 2);
        assert_eq!(ample(3), 3);
        assert_eq!(ample(4), 3);
        assert_eq!(ample(7), 5);
    }

    fn arb_tholder() -> impl Strategy<Value = Tholder> {
        prop_oneof![
            (1u64..6).prop_map(|threshold| Tholder::Unweighted { threshold }),
            proptest::collection::vec(1u64..4, 1..6).prop_map(|dens| {
                let weights: Vec<String> = dens.iter().map(|d| format!("1/{d}")).collect();
                let sixths: u64 = dens.iter().map(|d| 6 / d).sum();
                let weights = if sixths < 6 {
                    vec!["1".to_string(); dens.len()]
                } else {
                    weights
                };
                Tholder::parse(&ThresholdSpec::Weighted(weights)).unwrap()
            }),
        ]
    }

    proptest! {
        #[test]
        fn satisfy_is_monotonic(
            tholder in arb_tholder(),
            base in proptest::collection::vec(0u32..8, 0..8),
            extra in proptest::collection::vec(0u32..8, 0..8),
        ) {
            let mut superset = base.clone();
            superset.extend(extra);
            if tholder.satisfy(&base) {
                prop_assert!(tholder.satisfy(&superset));
            }
        }
    }
}
