//! Context and key lifecycle across the trust boundary.
//!
//! An [`EvaluationContext`] is created once per session. Two views are derived
//! from it: a secret view, which can decrypt and never leaves the client, and
//! a public view, which only carries evaluation material (public key,
//! relinearization key and inner-sum rotation keys) and is the only form sent
//! to the compute party.

use std::fmt;
use std::sync::Arc;

use fhe::bfv::{
    BfvParameters, BfvParametersBuilder, EvaluationKey, EvaluationKeyBuilder, Multiplicator,
    PublicKey, RelinearizationKey, SecretKey,
};
use fhe_traits::{Deserialize, DeserializeParametrized, Serialize as FheSerialize};
use prost::Message;
use rand::{rngs::OsRng, CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::config::HeParameters;
use crate::encoding::FixedPoint;
use crate::proto::{ContextView as ContextViewProto, HeParameters as HeParametersProto};
use crate::{Error, Result};

type Seed = <ChaCha8Rng as SeedableRng>::Seed;

/// Tag identifying one context generation.
///
/// Every serialized view and ciphertext carries the generation of the context
/// it was produced under, so that material from different sessions is never
/// combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    fn random<R: RngCore>(rng: &mut R) -> Self {
        Self(rng.next_u64())
    }

    /// The raw tag value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Generation {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Evaluation material shared by every view of a context.
#[derive(Debug)]
pub(crate) struct PublicMaterial {
    pub(crate) generation: Generation,
    pub(crate) parameters: HeParameters,
    pub(crate) bfv: Arc<BfvParameters>,
    pub(crate) public_key: PublicKey,
    pub(crate) relinearization_key: RelinearizationKey,
    pub(crate) evaluation_key: EvaluationKey,
    pub(crate) multiplicator: Multiplicator,
    pub(crate) codec: FixedPoint,
}

impl PublicMaterial {
    fn new(
        generation: Generation,
        parameters: HeParameters,
        bfv: Arc<BfvParameters>,
        public_key: PublicKey,
        relinearization_key: RelinearizationKey,
        evaluation_key: EvaluationKey,
    ) -> Result<Self> {
        let multiplicator = Multiplicator::default(&relinearization_key)?;
        let codec = FixedPoint::new(bfv.plaintext(), parameters.scale_bits);
        Ok(Self {
            generation,
            parameters,
            bfv,
            public_key,
            relinearization_key,
            evaluation_key,
            multiplicator,
            codec,
        })
    }
}

/// Secret key material; the seed regenerates the secret key.
struct SecretMaterial {
    seed: Zeroizing<Seed>,
    key: SecretKey,
}

impl SecretMaterial {
    fn from_seed(seed: Seed, bfv: &Arc<BfvParameters>) -> Self {
        let seed = Zeroizing::new(seed);
        let key = SecretKey::random(bfv, &mut ChaCha8Rng::from_seed(*seed));
        Self { seed, key }
    }

    fn duplicate(&self, bfv: &Arc<BfvParameters>) -> Self {
        Self::from_seed(*self.seed, bfv)
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretMaterial(..)")
    }
}

/// A freshly generated context holding both evaluation and secret material.
#[derive(Debug)]
pub struct EvaluationContext {
    public: Arc<PublicMaterial>,
    secret: SecretMaterial,
}

impl EvaluationContext {
    /// Generate a context for the parameter set `params`.
    pub fn create(params: &HeParameters) -> Result<Self> {
        Self::create_with_rng(params, &mut OsRng)
    }

    /// Generate a context using a caller-provided randomness source.
    pub fn create_with_rng<R: RngCore + CryptoRng>(
        params: &HeParameters,
        rng: &mut R,
    ) -> Result<Self> {
        params.validate()?;
        let plaintext_modulus = params.plaintext_modulus()?;
        let bfv = BfvParametersBuilder::new()
            .set_degree(params.degree)
            .set_plaintext_modulus(plaintext_modulus)
            .set_moduli_sizes(&params.moduli_sizes)
            .build_arc()
            .map_err(|e| Error::InvalidParameter(e.to_string()))?;

        let mut seed = Seed::default();
        rng.fill_bytes(&mut seed);
        let secret = SecretMaterial::from_seed(seed, &bfv);
        seed.zeroize();

        let public_key = PublicKey::new(&secret.key, rng);
        let relinearization_key = RelinearizationKey::new(&secret.key, rng)?;
        let mut builder = EvaluationKeyBuilder::new(&secret.key)?;
        builder.enable_inner_sum()?;
        let evaluation_key = builder.build(rng)?;

        let generation = Generation::random(rng);
        info!(
            %generation,
            degree = params.degree,
            moduli = params.moduli_sizes.len(),
            plaintext_bits = params.plaintext_bits,
            scale_bits = params.scale_bits,
            "created evaluation context"
        );

        let public = PublicMaterial::new(
            generation,
            params.clone(),
            bfv,
            public_key,
            relinearization_key,
            evaluation_key,
        )?;
        Ok(Self {
            public: Arc::new(public),
            secret,
        })
    }

    /// The generation tag of this context.
    pub fn generation(&self) -> Generation {
        self.public.generation
    }

    /// Derive the decryption-capable view. It must stay with the client.
    pub fn derive_secret_view(&self) -> ContextView {
        ContextView {
            public: self.public.clone(),
            secret: Some(self.secret.duplicate(&self.public.bfv)),
        }
    }

    /// Derive the evaluation-only view.
    pub fn derive_public_view(&self) -> ContextView {
        ContextView {
            public: self.public.clone(),
            secret: None,
        }
    }
}

/// Which capabilities a [`ContextView`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Evaluation only; decryption fails with [`Error::NoSecretKey`].
    Public,
    /// Evaluation and decryption.
    Secret,
}

/// A capability view over an [`EvaluationContext`].
///
/// Views are deliberately not `Clone`: a secret view can only be duplicated
/// through serialization, which the caller must request explicitly.
#[derive(Debug)]
pub struct ContextView {
    public: Arc<PublicMaterial>,
    secret: Option<SecretMaterial>,
}

impl ContextView {
    /// The capabilities of this view.
    pub fn kind(&self) -> ViewKind {
        if self.secret.is_some() {
            ViewKind::Secret
        } else {
            ViewKind::Public
        }
    }

    /// Whether the view is evaluation-only.
    pub fn is_public(&self) -> bool {
        self.kind() == ViewKind::Public
    }

    /// The generation tag of the underlying context.
    pub fn generation(&self) -> Generation {
        self.public.generation
    }

    /// The parameter set of the underlying context.
    pub fn parameters(&self) -> &HeParameters {
        &self.public.parameters
    }

    /// Number of slots in a ciphertext.
    pub fn slot_capacity(&self) -> usize {
        self.public.parameters.slot_capacity()
    }

    /// The evaluation-only view over the same context. The secret key is not
    /// carried over and cannot be recovered from the result.
    pub fn to_public(&self) -> ContextView {
        ContextView {
            public: self.public.clone(),
            secret: None,
        }
    }

    /// Whether `other` views the same context generation.
    pub fn same_context(&self, other: &ContextView) -> bool {
        self.generation() == other.generation()
    }

    pub(crate) fn material(&self) -> &Arc<PublicMaterial> {
        &self.public
    }

    pub(crate) fn secret_key(&self) -> Result<&SecretKey> {
        self.secret.as_ref().map(|s| &s.key).ok_or(Error::NoSecretKey)
    }

    /// Serialize the view. The secret seed is written only when
    /// `include_secret` is set and the view actually holds one; a public view
    /// never emits secret material.
    pub fn serialize(&self, include_secret: bool) -> Vec<u8> {
        let material = &self.public;
        let mut proto = ContextViewProto {
            generation: material.generation.value(),
            parameters: Some(HeParametersProto::from(&material.parameters)),
            bfv_parameters: material.bfv.to_bytes(),
            public_key: material.public_key.to_bytes(),
            relinearization_key: material.relinearization_key.to_bytes(),
            evaluation_key: material.evaluation_key.to_bytes(),
            secret_seed: Vec::new(),
        };
        if include_secret {
            if let Some(secret) = &self.secret {
                proto.secret_seed = secret.seed.to_vec();
            }
        }
        let bytes = proto.encode_to_vec();
        proto.secret_seed.zeroize();
        debug!(
            generation = %material.generation,
            secret = include_secret && self.secret.is_some(),
            bytes = bytes.len(),
            "serialized context view"
        );
        bytes
    }

    /// Deserialize a view. The result is a secret view if and only if the
    /// bytes carry a secret seed.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut proto = ContextViewProto::decode(bytes)
            .map_err(|_| Error::malformed("context view"))?;
        let parameters = proto
            .parameters
            .as_ref()
            .map(HeParameters::from)
            .ok_or_else(|| Error::malformed("context view parameters"))?;

        let bfv = Arc::new(BfvParameters::try_deserialize(&proto.bfv_parameters)?);
        if bfv.degree() != parameters.degree {
            return Err(Error::malformed("context view degree"));
        }
        let public_key = PublicKey::from_bytes(&proto.public_key, &bfv)?;
        let relinearization_key = RelinearizationKey::from_bytes(&proto.relinearization_key, &bfv)?;
        let evaluation_key = EvaluationKey::from_bytes(&proto.evaluation_key, &bfv)?;

        let secret = if proto.secret_seed.is_empty() {
            None
        } else {
            let seed = Seed::try_from(proto.secret_seed.as_slice())
                .map_err(|_| Error::malformed("secret seed"))?;
            proto.secret_seed.zeroize();
            Some(SecretMaterial::from_seed(seed, &bfv))
        };

        let public = PublicMaterial::new(
            Generation::from(proto.generation),
            parameters,
            bfv,
            public_key,
            relinearization_key,
            evaluation_key,
        )?;
        Ok(Self {
            public: Arc::new(public),
            secret,
        })
    }
}

impl From<&HeParameters> for HeParametersProto {
    fn from(params: &HeParameters) -> Self {
        HeParametersProto {
            degree: params.degree as u32,
            moduli_sizes: params.moduli_sizes.iter().map(|&s| s as u32).collect(),
            plaintext_bits: params.plaintext_bits as u32,
            scale_bits: params.scale_bits,
        }
    }
}

impl From<&HeParametersProto> for HeParameters {
    fn from(proto: &HeParametersProto) -> Self {
        HeParameters {
            degree: proto.degree as usize,
            moduli_sizes: proto.moduli_sizes.iter().map(|&s| s as usize).collect(),
            plaintext_bits: proto.plaintext_bits as usize,
            scale_bits: proto.scale_bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextView, EvaluationContext, ViewKind};
    use crate::ciphertext::Ciphertext;
    use crate::config::HeParameters;
    use crate::Error;
    use std::error::Error as StdError;

    #[test]
    fn views() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let public = ctx.derive_public_view();
        assert_eq!(secret.kind(), ViewKind::Secret);
        assert_eq!(public.kind(), ViewKind::Public);
        assert!(secret.same_context(&public));
        assert!(secret.to_public().is_public());
        assert!(matches!(public.secret_key(), Err(Error::NoSecretKey)));
        Ok(())
    }

    #[test]
    fn invalid_parameters() {
        let params = HeParameters {
            moduli_sizes: vec![62],
            ..HeParameters::for_tests()
        };
        assert!(matches!(
            EvaluationContext::create(&params),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn public_serialization_never_leaks_secret() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let public = ctx.derive_public_view();
        let bytes = public.serialize(true);
        assert_eq!(bytes, public.serialize(false));
        let restored = ContextView::deserialize(&bytes)?;
        assert!(restored.is_public());
        assert_eq!(restored.generation(), ctx.generation());
        Ok(())
    }

    #[test]
    fn serialization_round_trip() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let restored_secret = ContextView::deserialize(&secret.serialize(true))?;
        let restored_public = ContextView::deserialize(&secret.serialize(false))?;
        assert_eq!(restored_secret.kind(), ViewKind::Secret);
        assert_eq!(restored_public.kind(), ViewKind::Public);
        assert_eq!(restored_secret.parameters(), secret.parameters());

        // A ciphertext produced under the original view decrypts identically
        // under the restored one, after arithmetic under the restored public
        // view.
        let a = Ciphertext::encrypt(&secret, &[1.5, -2.0, 4.0])?;
        let b = Ciphertext::encrypt(&restored_secret, &[0.5, 1.0, 1.0])?;
        let mut a = Ciphertext::lazy_load(&a.serialize())?;
        let mut b = Ciphertext::lazy_load(&b.serialize())?;
        a.link(&restored_public)?;
        b.link(&restored_public)?;
        let d = a.sub(&b)?;
        assert_eq!(d.decrypt(&secret)?, vec![1.0, -3.0, 3.0]);
        assert_eq!(d.decrypt(&restored_secret)?, vec![1.0, -3.0, 3.0]);
        assert_eq!(d.square_sum()?.decrypt(&restored_secret)?, vec![19.0]);
        Ok(())
    }

    #[test]
    fn malformed_bytes() {
        assert!(matches!(
            ContextView::deserialize(&[0xff, 0x01, 0x02]),
            Err(Error::Serialization(_))
        ));
    }
}
