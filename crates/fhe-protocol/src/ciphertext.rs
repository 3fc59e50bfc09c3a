//! Opaque ciphertext handles.
//!
//! A [`Ciphertext`] is either *lazy*, holding serialized bytes that have not
//! been interpreted under any context, or *linked* to a [`ContextView`], in
//! which case arithmetic and decryption are available. Received ciphertexts
//! always start lazy; linking checks the generation tag carried alongside the
//! bytes against the view.

use std::fmt;
use std::sync::Arc;

use fhe::bfv::{Ciphertext as BfvCiphertext, Encoding, Plaintext};
use fhe_traits::{
    DeserializeParametrized, FheDecoder, FheDecrypter, FheEncoder, FheEncrypter,
    Serialize as FheSerialize,
};
use prost::Message;
use rand::thread_rng;
use zeroize::Zeroizing;

use crate::keyring::{ContextView, Generation, PublicMaterial};
use crate::proto::CiphertextEnvelope;
use crate::{Error, Result};

/// Link state of a [`Ciphertext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Deserialization deferred; no operation is available until linked.
    Lazy,
    /// Bound to an evaluation view.
    Linked,
}

enum Inner {
    Lazy(Vec<u8>),
    Linked {
        ct: BfvCiphertext,
        material: Arc<PublicMaterial>,
    },
}

/// An encrypted vector of real values.
pub struct Ciphertext {
    generation: Generation,
    slots: usize,
    scale_exponent: u32,
    inner: Inner,
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ciphertext")
            .field("generation", &self.generation)
            .field("slots", &self.slots)
            .field("scale_exponent", &self.scale_exponent)
            .field("state", &self.state())
            .finish()
    }
}

impl Ciphertext {
    /// Encrypt `plaintext` under a secret view.
    pub fn encrypt(view: &ContextView, plaintext: &[f64]) -> Result<Self> {
        let sk = view.secret_key()?;
        let material = view.material();
        let pt = encode(material, plaintext)?;
        let ct = sk.try_encrypt(&pt, &mut thread_rng())?;
        Ok(Self::linked(material, ct, plaintext.len(), 1))
    }

    /// Encrypt `plaintext` with the public key of any view. Used by the
    /// compute party for constants such as `Enc(1)`.
    pub(crate) fn encrypt_public(view: &ContextView, plaintext: &[f64]) -> Result<Self> {
        let material = view.material();
        let pt = encode(material, plaintext)?;
        let ct = material.public_key.try_encrypt(&pt, &mut thread_rng())?;
        Ok(Self::linked(material, ct, plaintext.len(), 1))
    }

    fn linked(
        material: &Arc<PublicMaterial>,
        ct: BfvCiphertext,
        slots: usize,
        scale_exponent: u32,
    ) -> Self {
        Self {
            generation: material.generation,
            slots,
            scale_exponent,
            inner: Inner::Linked {
                ct,
                material: material.clone(),
            },
        }
    }

    /// Load a serialized ciphertext without interpreting its payload.
    pub fn lazy_load(bytes: &[u8]) -> Result<Self> {
        let envelope =
            CiphertextEnvelope::decode(bytes).map_err(|_| Error::malformed("ciphertext envelope"))?;
        Self::from_envelope(envelope)
    }

    pub(crate) fn from_envelope(envelope: CiphertextEnvelope) -> Result<Self> {
        if envelope.slots == 0 || envelope.payload.is_empty() {
            return Err(Error::malformed("ciphertext envelope"));
        }
        // Fresh ciphertexts carry one scaled factor, products two.
        if !(1..=2).contains(&envelope.scale_exponent) {
            return Err(Error::malformed(format!(
                "scale exponent {}",
                envelope.scale_exponent
            )));
        }
        Ok(Self {
            generation: Generation::from(envelope.generation),
            slots: envelope.slots as usize,
            scale_exponent: envelope.scale_exponent,
            inner: Inner::Lazy(envelope.payload),
        })
    }

    pub(crate) fn to_envelope(&self) -> CiphertextEnvelope {
        let payload = match &self.inner {
            Inner::Lazy(bytes) => bytes.clone(),
            Inner::Linked { ct, .. } => ct.to_bytes(),
        };
        CiphertextEnvelope {
            generation: self.generation.value(),
            slots: self.slots as u32,
            scale_exponent: self.scale_exponent,
            payload,
        }
    }

    /// Serialize the ciphertext together with its generation tag.
    pub fn serialize(&self) -> Vec<u8> {
        self.to_envelope().encode_to_vec()
    }

    /// Bind the ciphertext to `view`. Linking to the view it is already linked
    /// to is a no-op.
    pub fn link(&mut self, view: &ContextView) -> Result<()> {
        if self.generation != view.generation() {
            return Err(Error::generation_mismatch(view.generation(), self.generation));
        }
        let material = view.material();
        if self.slots > material.parameters.slot_capacity() {
            return Err(Error::slot_overflow(
                self.slots,
                material.parameters.slot_capacity(),
            ));
        }
        match &mut self.inner {
            Inner::Linked { material: linked, .. } => {
                if !Arc::ptr_eq(linked, material) {
                    *linked = material.clone();
                }
            }
            Inner::Lazy(bytes) => {
                let ct = BfvCiphertext::from_bytes(bytes, &material.bfv)?;
                self.inner = Inner::Linked {
                    ct,
                    material: material.clone(),
                };
            }
        }
        Ok(())
    }

    /// Decrypt through a secret view.
    pub fn decrypt(&self, view: &ContextView) -> Result<Vec<f64>> {
        let sk = view.secret_key()?;
        let (ct, _) = self.engine()?;
        if self.generation != view.generation() {
            return Err(Error::generation_mismatch(view.generation(), self.generation));
        }
        let material = view.material();
        let pt = sk.try_decrypt(ct)?;
        let slots = Zeroizing::new(Vec::<u64>::try_decode(&pt, Encoding::simd())?);
        material
            .codec
            .decode(&slots[..self.slots], self.scale_exponent)
    }

    /// The link state.
    pub fn state(&self) -> LinkState {
        match self.inner {
            Inner::Lazy(_) => LinkState::Lazy,
            Inner::Linked { .. } => LinkState::Linked,
        }
    }

    /// Whether arithmetic is available.
    pub fn is_linked(&self) -> bool {
        self.state() == LinkState::Linked
    }

    /// Generation of the context the ciphertext was produced under.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Number of meaningful slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Number of scaled factors multiplied into each slot.
    pub fn scale_exponent(&self) -> u32 {
        self.scale_exponent
    }

    fn engine(&self) -> Result<(&BfvCiphertext, &Arc<PublicMaterial>)> {
        match &self.inner {
            Inner::Linked { ct, material } => Ok((ct, material)),
            Inner::Lazy(_) => Err(Error::UnlinkedContext),
        }
    }

    /// Check that both operands are linked under the same context and scale.
    fn compatible<'a>(
        &'a self,
        rhs: &'a Ciphertext,
    ) -> Result<(&'a BfvCiphertext, &'a BfvCiphertext, &'a Arc<PublicMaterial>)> {
        let (lhs_ct, material) = self.engine()?;
        let (rhs_ct, _) = rhs.engine()?;
        if self.generation != rhs.generation {
            return Err(Error::generation_mismatch(self.generation, rhs.generation));
        }
        if self.scale_exponent != rhs.scale_exponent {
            return Err(Error::ContextMismatch(format!(
                "scale exponents {} and {} differ",
                self.scale_exponent, rhs.scale_exponent
            )));
        }
        if self.slots != rhs.slots {
            return Err(Error::DimensionMismatch(self.slots, rhs.slots));
        }
        Ok((lhs_ct, rhs_ct, material))
    }

    /// Homomorphic slot-wise addition.
    pub fn add(&self, rhs: &Ciphertext) -> Result<Ciphertext> {
        let (lhs, rhs_ct, material) = self.compatible(rhs)?;
        Ok(Self::linked(material, lhs + rhs_ct, self.slots, self.scale_exponent))
    }

    /// Homomorphic slot-wise subtraction.
    pub fn sub(&self, rhs: &Ciphertext) -> Result<Ciphertext> {
        let (lhs, rhs_ct, material) = self.compatible(rhs)?;
        Ok(Self::linked(material, lhs - rhs_ct, self.slots, self.scale_exponent))
    }

    /// Homomorphic dot product, collapsing to a single-slot ciphertext.
    pub fn dot(&self, rhs: &Ciphertext) -> Result<Ciphertext> {
        let (lhs, rhs_ct, material) = self.compatible(rhs)?;
        if self.scale_exponent != 1 {
            return Err(Error::ContextMismatch(
                "multiplicative depth exhausted".to_string(),
            ));
        }
        let product = material.multiplicator.multiply(lhs, rhs_ct)?;
        let sum = material.evaluation_key.computes_inner_sum(&product)?;
        Ok(Self::linked(material, sum, 1, 2))
    }

    /// Homomorphic self dot product: `square()` followed by `sum()`.
    pub fn square_sum(&self) -> Result<Ciphertext> {
        self.dot(self)
    }
}

fn encode(material: &PublicMaterial, values: &[f64]) -> Result<Plaintext> {
    let capacity = material.parameters.slot_capacity();
    if values.len() > capacity {
        return Err(Error::slot_overflow(values.len(), capacity));
    }
    if values.is_empty() {
        return Err(Error::InvalidInput("cannot encrypt an empty vector".to_string()));
    }
    let slots = Zeroizing::new(material.codec.encode(values)?);
    Ok(Plaintext::try_encode(
        slots.as_slice(),
        Encoding::simd(),
        &material.bfv,
    )?)
}

#[cfg(test)]
mod tests {
    use super::{Ciphertext, LinkState};
    use crate::config::HeParameters;
    use crate::keyring::EvaluationContext;
    use crate::Error;
    use prost::Message;
    use std::error::Error as StdError;

    #[test]
    fn encrypt_decrypt() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let values = vec![0.0, 1.0, -1.0, 2.5, -7.25];
        let ct = Ciphertext::encrypt(&secret, &values)?;
        assert_eq!(ct.slots(), 5);
        assert_eq!(ct.state(), LinkState::Linked);
        assert_eq!(ct.decrypt(&secret)?, values);
        Ok(())
    }

    #[test]
    fn encrypt_requires_secret_and_capacity() -> Result<(), Box<dyn StdError>> {
        let params = HeParameters::for_tests();
        let ctx = EvaluationContext::create(&params)?;
        let secret = ctx.derive_secret_view();
        let public = ctx.derive_public_view();
        assert!(matches!(
            Ciphertext::encrypt(&public, &[1.0]),
            Err(Error::NoSecretKey)
        ));
        let too_long = vec![1.0; params.degree + 1];
        assert!(matches!(
            Ciphertext::encrypt(&secret, &too_long),
            Err(Error::ContextMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn decrypt_through_public_view_fails() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let public = ctx.derive_public_view();
        let ct = Ciphertext::encrypt(&secret, &[3.0])?;
        assert!(matches!(ct.decrypt(&public), Err(Error::NoSecretKey)));
        let public_ct = Ciphertext::encrypt_public(&public, &[1.0])?;
        assert!(matches!(public_ct.decrypt(&public), Err(Error::NoSecretKey)));
        // Even a lazy ciphertext reports the missing key first.
        let lazy = Ciphertext::lazy_load(&ct.serialize())?;
        assert!(matches!(lazy.decrypt(&public), Err(Error::NoSecretKey)));
        assert_eq!(public_ct.decrypt(&secret)?, vec![1.0]);
        Ok(())
    }

    #[test]
    fn lazy_load_and_link() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let public = ctx.derive_public_view();
        let bytes = Ciphertext::encrypt(&secret, &[4.0, 2.0])?.serialize();

        let mut a = Ciphertext::lazy_load(&bytes)?;
        let b = Ciphertext::lazy_load(&bytes)?;
        assert_eq!(a.state(), LinkState::Lazy);
        assert!(matches!(a.sub(&b), Err(Error::UnlinkedContext)));
        assert!(matches!(a.decrypt(&secret), Err(Error::UnlinkedContext)));

        a.link(&public)?;
        let before = a.sub(&a)?.decrypt(&secret)?;
        a.link(&public)?;
        let after = a.sub(&a)?.decrypt(&secret)?;
        assert_eq!(before, after);
        assert_eq!(after, vec![0.0, 0.0]);
        assert!(matches!(a.sub(&b), Err(Error::UnlinkedContext)));
        Ok(())
    }

    #[test]
    fn link_rejects_other_generation() -> Result<(), Box<dyn StdError>> {
        let params = HeParameters::for_tests();
        let ctx = EvaluationContext::create(&params)?;
        let other = EvaluationContext::create(&params)?;
        let bytes = Ciphertext::encrypt(&ctx.derive_secret_view(), &[1.0])?.serialize();
        let mut ct = Ciphertext::lazy_load(&bytes)?;
        assert!(matches!(
            ct.link(&other.derive_public_view()),
            Err(Error::ContextMismatch(_))
        ));
        assert_eq!(ct.state(), LinkState::Lazy);
        Ok(())
    }

    #[test]
    fn arithmetic() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let a = Ciphertext::encrypt(&secret, &[1.0, 2.0, 3.0])?;
        let b = Ciphertext::encrypt(&secret, &[0.5, -2.0, 1.0])?;
        assert_eq!(a.add(&b)?.decrypt(&secret)?, vec![1.5, 0.0, 4.0]);
        assert_eq!(a.sub(&b)?.decrypt(&secret)?, vec![0.5, 4.0, 2.0]);

        let dot = a.dot(&b)?;
        assert_eq!(dot.slots(), 1);
        assert_eq!(dot.scale_exponent(), 2);
        assert_eq!(dot.decrypt(&secret)?, vec![0.5 - 4.0 + 3.0]);
        assert_eq!(a.square_sum()?.decrypt(&secret)?, vec![14.0]);

        // Products are not multiplied again, nor mixed with fresh ciphertexts.
        assert!(matches!(dot.dot(&dot), Err(Error::ContextMismatch(_))));
        let one = Ciphertext::encrypt(&secret, &[1.0])?;
        assert!(matches!(dot.add(&one), Err(Error::ContextMismatch(_))));
        Ok(())
    }

    #[test]
    fn arithmetic_checks_dimensions() -> Result<(), Box<dyn StdError>> {
        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let secret = ctx.derive_secret_view();
        let a = Ciphertext::encrypt(&secret, &[1.0, 2.0, 3.0])?;
        let b = Ciphertext::encrypt(&secret, &[1.0, 2.0])?;
        assert!(matches!(a.sub(&b), Err(Error::DimensionMismatch(3, 2))));
        Ok(())
    }

    #[test]
    fn arithmetic_rejects_mixed_generations() -> Result<(), Box<dyn StdError>> {
        let params = HeParameters::for_tests();
        let ctx = EvaluationContext::create(&params)?;
        let other = EvaluationContext::create(&params)?;
        let a = Ciphertext::encrypt(&ctx.derive_secret_view(), &[1.0])?;
        let b = Ciphertext::encrypt(&other.derive_secret_view(), &[1.0])?;
        assert!(matches!(a.sub(&b), Err(Error::ContextMismatch(_))));
        Ok(())
    }

    #[test]
    fn malformed_envelope() -> Result<(), Box<dyn StdError>> {
        assert!(matches!(
            Ciphertext::lazy_load(&[]),
            Err(Error::Serialization(_))
        ));

        let ctx = EvaluationContext::create(&HeParameters::for_tests())?;
        let mut envelope = Ciphertext::encrypt(&ctx.derive_secret_view(), &[1.0])?.to_envelope();
        for exponent in [0, 3, u32::MAX / 4] {
            envelope.scale_exponent = exponent;
            assert!(matches!(
                Ciphertext::lazy_load(&envelope.encode_to_vec()),
                Err(Error::Serialization(_))
            ));
        }
        envelope.scale_exponent = 2;
        assert_eq!(Ciphertext::lazy_load(&envelope.encode_to_vec())?.scale_exponent(), 2);
        Ok(())
    }
}
