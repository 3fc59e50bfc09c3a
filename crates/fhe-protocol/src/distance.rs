//! Encrypted squared Euclidean distance between feature vectors.

use std::time::Duration;

use tracing::info;

use crate::ciphertext::Ciphertext;
use crate::keyring::ContextView;
use crate::{Error, Result};

/// Computes encrypted distances under one evaluation view.
#[derive(Debug)]
pub struct EncryptedDistanceEngine<'a> {
    view: &'a ContextView,
}

impl<'a> EncryptedDistanceEngine<'a> {
    /// Create an engine evaluating under `view`.
    pub fn new(view: &'a ContextView) -> Self {
        Self { view }
    }

    /// Encrypted `sum((a_i - b_i)^2)` as a single-slot ciphertext.
    ///
    /// Both vectors must be linked under the engine's view and have the same
    /// number of slots.
    pub fn squared_distance(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        for v in [a, b] {
            if !v.is_linked() {
                return Err(Error::UnlinkedContext);
            }
            if v.generation() != self.view.generation() {
                return Err(Error::generation_mismatch(
                    self.view.generation(),
                    v.generation(),
                ));
            }
        }
        if a.slots() != b.slots() {
            return Err(Error::DimensionMismatch(a.slots(), b.slots()));
        }
        info!(dimension = a.slots(), "computing encrypted squared distance");
        a.sub(b)?.square_sum()
    }
}

/// Check that the squared distance between `probe` and `reference` fits the
/// plaintext modulus of `view` once both are scaled and squared.
///
/// Each coordinate is bounded by its scaled difference plus one rounding
/// step. A distance beyond the bound would wrap and decrypt to an unrelated
/// value.
pub fn check_distance_capacity(
    view: &ContextView,
    probe: &[f64],
    reference: &[f64],
) -> Result<()> {
    let codec = &view.material().codec;
    let scale = codec.scale();
    let bound = probe
        .iter()
        .zip(reference)
        .map(|(a, b)| ((a - b).abs() * scale + 1.0).powi(2))
        .sum::<f64>()
        / (scale * scale);
    let capacity = codec.max_product_magnitude();
    if bound > capacity {
        return Err(Error::InvalidInput(format!(
            "squared distance may reach {bound:.1}, above the plaintext capacity {capacity:.1}"
        )));
    }
    Ok(())
}

/// Decision policy applied by the client to a decrypted squared distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// Euclidean distance under which two vectors belong to the same subject.
    pub threshold: f64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self { threshold: 10.0 }
    }
}

impl MatchPolicy {
    /// Create a policy with the given distance threshold.
    pub fn new(threshold: f64) -> Result<Self> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "distance threshold {threshold} must be positive"
            )));
        }
        Ok(Self { threshold })
    }

    /// Interpret a decrypted squared distance.
    ///
    /// Fixed-point squares are exact integers, so a negative value can only
    /// come from a sum that wrapped around the plaintext modulus.
    pub fn decide(&self, squared_distance: f64) -> Result<MatchDecision> {
        if !squared_distance.is_finite() || squared_distance < 0.0 {
            return Err(Error::InvalidInput(format!(
                "squared distance {squared_distance} wrapped around the plaintext modulus"
            )));
        }
        let distance = squared_distance.sqrt();
        Ok(MatchDecision {
            distance,
            same_subject: distance < self.threshold,
            elapsed: Duration::ZERO,
        })
    }
}

/// Outcome of a biometric comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchDecision {
    /// Euclidean distance between the two vectors.
    pub distance: f64,
    /// Whether the distance lies below the policy threshold.
    pub same_subject: bool,
    /// Time spent decrypting and interpreting the result.
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::{check_distance_capacity, EncryptedDistanceEngine, MatchPolicy};
    use crate::ciphertext::Ciphertext;
    use crate::config::HeParameters;
    use crate::keyring::EvaluationContext;
    use crate::Error;
    use proptest::prelude::*;
    use std::error::Error as StdError;

    #[test]
    fn squared_distance() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let public = ctx.derive_public_view();
        let a = Ciphertext::encrypt(&secret, &[1.0, 2.0, 3.0, 4.0])?;
        let b = Ciphertext::encrypt(&secret, &[1.5, 0.0, 3.0, 6.0])?;

        let engine = EncryptedDistanceEngine::new(&public);
        let d = engine.squared_distance(&a, &b)?;
        assert_eq!(d.slots(), 1);
        assert_eq!(d.decrypt(&secret)?, vec![8.25]);

        let same = engine.squared_distance(&a, &a)?;
        assert_eq!(same.decrypt(&secret)?, vec![0.0]);
        Ok(())
    }

    #[test]
    fn dimension_mismatch() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let public = ctx.derive_public_view();
        let a = Ciphertext::encrypt(&secret, &[1.0, 2.0, 3.0])?;
        let b = Ciphertext::encrypt(&secret, &[1.0, 2.0])?;
        assert!(matches!(
            EncryptedDistanceEngine::new(&public).squared_distance(&a, &b),
            Err(Error::DimensionMismatch(3, 2))
        ));
        Ok(())
    }

    #[test]
    fn foreign_generation() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let other = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let a = Ciphertext::encrypt(&secret, &[1.0])?;
        let b = Ciphertext::encrypt(&secret, &[2.0])?;
        assert!(matches!(
            EncryptedDistanceEngine::new(&other.derive_public_view()).squared_distance(&a, &b),
            Err(Error::ContextMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn decisions() -> Result<(), Box<dyn StdError>> {
        let policy = MatchPolicy::default();
        let decision = policy.decide(0.0)?;
        assert_eq!(decision.distance, 0.0);
        assert!(decision.same_subject);

        let decision = policy.decide(144.0)?;
        assert_eq!(decision.distance, 12.0);
        assert!(!decision.same_subject);

        assert!(!policy.decide(100.0)?.same_subject);
        assert!(MatchPolicy::new(0.0).is_err());
        assert!(MatchPolicy::new(0.5)?.decide(0.2)?.same_subject);
        Ok(())
    }

    #[test]
    fn wrapped_distance_is_not_a_match() {
        let policy = MatchPolicy::default();
        assert!(matches!(policy.decide(-1e-6), Err(Error::InvalidInput(_))));
        assert!(matches!(policy.decide(-4096.0), Err(Error::InvalidInput(_))));
        assert!(matches!(policy.decide(f64::NAN), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn capacity_near_the_limit() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let public = ctx.derive_public_view();
        let capacity = secret.material().codec.max_product_magnitude();
        let dimension = 128;
        let zeros = vec![0.0; dimension];

        let inside = vec![(capacity * 0.9 / dimension as f64).sqrt(); dimension];
        check_distance_capacity(&secret, &inside, &zeros)?;
        let expected = inside.iter().map(|x| x * x).sum::<f64>();
        let d = EncryptedDistanceEngine::new(&public).squared_distance(
            &Ciphertext::encrypt(&secret, &inside)?,
            &Ciphertext::encrypt(&secret, &zeros)?,
        )?;
        let decrypted = d.decrypt(&secret)?[0];
        assert!((decrypted - expected).abs() < 0.5, "{decrypted} vs {expected}");

        let outside = vec![(capacity * 1.1 / dimension as f64).sqrt(); dimension];
        assert!(matches!(
            check_distance_capacity(&secret, &outside, &zeros),
            Err(Error::InvalidInput(_))
        ));
        // Opposite signs add up.
        let half = vec![(capacity * 0.3 / dimension as f64).sqrt(); dimension];
        let negated = half.iter().map(|x| -x).collect::<Vec<_>>();
        assert!(matches!(
            check_distance_capacity(&secret, &half, &negated),
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(4))]

        #[test]
        fn matches_plaintext_distance(
            pairs in proptest::collection::vec((-1.0f64..1.0, -1.0f64..1.0), 1..=128)
        ) {
            let ctx = EvaluationContext::create(&HeParameters::for_tests()).unwrap();
            let secret = ctx.derive_secret_view();
            let public = ctx.derive_public_view();
            let (a, b): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
            let expected = a.iter().zip(&b).map(|(x, y)| (x - y).powi(2)).sum::<f64>();

            let ca = Ciphertext::encrypt(&secret, &a).unwrap();
            let cb = Ciphertext::encrypt(&secret, &b).unwrap();
            let d = EncryptedDistanceEngine::new(&public).squared_distance(&ca, &cb).unwrap();
            let decrypted = d.decrypt(&secret).unwrap()[0];
            // Each coordinate is quantized to 2^-12 before squaring.
            prop_assert!((decrypted - expected).abs() < 0.2, "{} vs {}", decrypted, expected);
        }
    }
}
