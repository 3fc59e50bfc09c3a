//! Configuration and validation for protocol sessions.
//!
//! [`HeParameters`] selects the BFV parameter set and the fixed-point scale
//! used to carry real values; [`SessionConfig`] adds the policy knobs of a
//! session (comparison tolerance, distance threshold, ballot encoding and the
//! candidate roster).

use std::path::Path;

use fhe_math::zq::primes::generate_prime;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Slack, in bits, added to the estimated noise of a product.
const MULTIPLICATION_SLACK_BITS: usize = 8;

/// Slack, in bits, added to the estimated noise of a key switch.
const KEY_SWITCH_SLACK_BITS: usize = 8;

/// Bits kept free between the noise and the plaintext scaling factor.
const DECRYPTION_MARGIN_BITS: usize = 2;

/// Homomorphic encryption parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeParameters {
    /// Polynomial modulus degree; also the number of plaintext slots.
    pub degree: usize,
    /// Bit sizes of the ciphertext modulus chain.
    pub moduli_sizes: Vec<usize>,
    /// Bit size of the (prime) plaintext modulus.
    pub plaintext_bits: usize,
    /// Fixed-point scale: values are multiplied by `2^scale_bits` before
    /// encoding.
    pub scale_bits: u32,
}

impl Default for HeParameters {
    fn default() -> Self {
        Self {
            degree: 8192,
            moduli_sizes: vec![62, 62, 62],
            plaintext_bits: 50,
            scale_bits: 16,
        }
    }
}

impl HeParameters {
    /// Smallest supported ring degree.
    pub const MIN_DEGREE: usize = 1024;
    /// Largest supported ring degree.
    pub const MAX_DEGREE: usize = 32768;
    /// Largest supported modulus size, in bits.
    pub const MAX_MODULUS_BITS: usize = 62;

    /// Validates that the parameter set supports one multiplication, one
    /// addition and an inner sum, which is the depth needed by the tally and
    /// distance computations.
    pub fn validate(&self) -> Result<()> {
        if !self.degree.is_power_of_two()
            || self.degree < Self::MIN_DEGREE
            || self.degree > Self::MAX_DEGREE
        {
            return Err(Error::InvalidParameter(format!(
                "degree {} must be a power of two between {} and {}",
                self.degree,
                Self::MIN_DEGREE,
                Self::MAX_DEGREE
            )));
        }
        if self.moduli_sizes.len() < 2 {
            return Err(Error::InvalidParameter(format!(
                "a modulus chain of {} moduli cannot support a multiplication",
                self.moduli_sizes.len()
            )));
        }
        if let Some(size) = self
            .moduli_sizes
            .iter()
            .find(|&&s| s < 20 || s > Self::MAX_MODULUS_BITS)
        {
            return Err(Error::InvalidParameter(format!(
                "modulus size {size} must be between 20 and {} bits",
                Self::MAX_MODULUS_BITS
            )));
        }
        if self.plaintext_bits < 16 || self.plaintext_bits > 60 {
            return Err(Error::InvalidParameter(format!(
                "plaintext modulus size {} must be between 16 and 60 bits",
                self.plaintext_bits
            )));
        }
        if 2 * self.scale_bits as usize + 1 >= self.plaintext_bits {
            return Err(Error::InvalidParameter(format!(
                "a scale of 2^{} leaves no room for a product in a {}-bit plaintext",
                self.scale_bits, self.plaintext_bits
            )));
        }

        let available = self.moduli_sizes.iter().sum::<usize>();
        let required = self.required_modulus_bits();
        if available < required {
            return Err(Error::InvalidParameter(format!(
                "modulus chain of {available} bits cannot absorb one multiplication and an inner sum (need {required} bits)"
            )));
        }
        Ok(())
    }

    /// Estimated number of ciphertext modulus bits consumed by the plaintext
    /// scaling factor plus the noise of one multiplication, one
    /// relinearization and the rotations of an inner sum.
    pub fn required_modulus_bits(&self) -> usize {
        let log_degree = self.degree.trailing_zeros() as usize;
        let rotations = 2 * log_degree;
        let rotation_bits = usize::BITS as usize - rotations.leading_zeros() as usize;
        let max_modulus = self.moduli_sizes.iter().copied().max().unwrap_or_default();

        let multiplication = self.plaintext_bits + log_degree + MULTIPLICATION_SLACK_BITS;
        let key_switch = max_modulus + log_degree + rotation_bits + KEY_SWITCH_SLACK_BITS;
        self.plaintext_bits + multiplication.max(key_switch) + DECRYPTION_MARGIN_BITS
    }

    /// The plaintext modulus: the largest `plaintext_bits`-bit prime congruent
    /// to 1 modulo `2 * degree`, so that SIMD encoding is available.
    pub fn plaintext_modulus(&self) -> Result<u64> {
        generate_prime(
            self.plaintext_bits,
            2 * self.degree as u64,
            u64::MAX >> (64 - self.plaintext_bits),
        )
        .ok_or_else(|| {
            Error::InvalidParameter(format!(
                "no {}-bit prime supports {} slots",
                self.plaintext_bits, self.degree
            ))
        })
    }

    /// Number of plaintext slots of a ciphertext.
    pub fn slot_capacity(&self) -> usize {
        self.degree
    }

    /// Small parameter set for fast tests.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            degree: 1024,
            moduli_sizes: vec![62, 62, 62],
            plaintext_bits: 36,
            scale_bits: 12,
        }
    }
}

/// How a vote is laid out in the slots of a ballot ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BallotEncoding {
    /// One slot holding the 1-based candidate index.
    #[default]
    ScalarIndex,
    /// One slot per candidate, 1 for the chosen candidate and 0 elsewhere.
    OneHot,
}

impl BallotEncoding {
    /// Number of slots a ballot occupies.
    pub fn slots(&self, candidates: usize) -> usize {
        match self {
            Self::ScalarIndex => 1,
            Self::OneHot => candidates,
        }
    }

    /// Lay out a validated 1-based `choice` among `candidates`.
    pub fn encode(&self, choice: usize, candidates: usize) -> Vec<f64> {
        match self {
            Self::ScalarIndex => vec![choice as f64],
            Self::OneHot => (1..=candidates)
                .map(|c| if c == choice { 1.0 } else { 0.0 })
                .collect(),
        }
    }
}

/// Configuration of a client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// HE parameter set.
    pub parameters: HeParameters,
    /// Squared-difference tolerance under which two ballots are equal.
    pub tolerance: f64,
    /// Euclidean distance under which two feature vectors are the same subject.
    pub distance_threshold: f64,
    /// Ballot slot layout.
    pub encoding: BallotEncoding,
    /// Candidate names; ballots hold 1-based indices into this list.
    pub candidates: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            parameters: HeParameters::default(),
            tolerance: 0.5,
            distance_threshold: 10.0,
            encoding: BallotEncoding::default(),
            candidates: (1..=5).map(|i| format!("Candidate{i}")).collect(),
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a JSON file; missing fields take their
    /// default values.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Parse a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Number of candidates on the roster.
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Validates all session parameters.
    pub fn validate(&self) -> Result<()> {
        self.parameters.validate()?;
        validate_tolerance(self.tolerance)?;
        if !self.distance_threshold.is_finite() || self.distance_threshold <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "distance threshold {} must be positive",
                self.distance_threshold
            )));
        }
        if self.candidates.is_empty() {
            return Err(Error::InvalidParameter(
                "at least one candidate is required".to_string(),
            ));
        }
        let slots = self.encoding.slots(self.candidates.len());
        if slots > self.parameters.slot_capacity() {
            return Err(Error::slot_overflow(slots, self.parameters.slot_capacity()));
        }
        Ok(())
    }
}

/// Validates a ballot comparison tolerance.
///
/// Integer-coded votes are spaced by 1.0 and exactly-equal votes score 0, so
/// the tolerance must lie strictly between the two.
pub fn validate_tolerance(tolerance: f64) -> Result<()> {
    if tolerance > 0.0 && tolerance < 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "tolerance {tolerance} must lie strictly between 0 and 1"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parameters_are_valid() {
        assert!(HeParameters::default().validate().is_ok());
        assert!(HeParameters::for_tests().validate().is_ok());
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_degree() {
        for degree in [0, 512, 1000, 65536] {
            let params = HeParameters {
                degree,
                ..HeParameters::default()
            };
            assert!(matches!(params.validate(), Err(Error::InvalidParameter(_))));
        }
    }

    #[test]
    fn modulus_chain_too_short() {
        let params = HeParameters {
            moduli_sizes: vec![62],
            ..HeParameters::default()
        };
        assert!(matches!(params.validate(), Err(Error::InvalidParameter(_))));

        let params = HeParameters {
            moduli_sizes: vec![30, 30],
            ..HeParameters::default()
        };
        assert!(matches!(params.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn scale_too_large() {
        let params = HeParameters {
            plaintext_bits: 40,
            scale_bits: 20,
            ..HeParameters::default()
        };
        assert!(matches!(params.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn plaintext_modulus_supports_simd() -> Result<()> {
        for params in [HeParameters::default(), HeParameters::for_tests()] {
            let t = params.plaintext_modulus()?;
            assert_eq!(t % (2 * params.degree as u64), 1);
            assert_eq!(64 - t.leading_zeros() as usize, params.plaintext_bits);
        }
        Ok(())
    }

    #[test]
    fn tolerance_bounds() {
        assert!(validate_tolerance(0.5).is_ok());
        assert!(validate_tolerance(0.999).is_ok());
        assert!(validate_tolerance(1.0).is_err());
        assert!(validate_tolerance(0.0).is_err());
        assert!(validate_tolerance(f64::NAN).is_err());
    }

    #[test]
    fn ballot_encodings() {
        assert_eq!(BallotEncoding::ScalarIndex.encode(3, 5), vec![3.0]);
        assert_eq!(
            BallotEncoding::OneHot.encode(2, 4),
            vec![0.0, 1.0, 0.0, 0.0]
        );
        assert_eq!(BallotEncoding::OneHot.slots(4), 4);
        assert_eq!(BallotEncoding::ScalarIndex.slots(4), 1);
    }

    #[test]
    fn config_from_json() -> Result<()> {
        let config = SessionConfig::from_json_str(
            r#"{ "tolerance": 0.25, "encoding": "one_hot", "candidates": ["A", "B"] }"#,
        )?;
        assert_eq!(config.tolerance, 0.25);
        assert_eq!(config.encoding, BallotEncoding::OneHot);
        assert_eq!(config.candidate_count(), 2);
        assert_eq!(config.parameters, HeParameters::default());
        assert_eq!(config.distance_threshold, 10.0);
        config.validate()?;

        assert!(matches!(
            SessionConfig::from_json_str("{ not json"),
            Err(Error::Serialization(_))
        ));
        Ok(())
    }

    #[test]
    fn empty_roster_is_rejected() {
        let config = SessionConfig {
            candidates: vec![],
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
