#![crate_name = "fhe_protocol"]
#![crate_type = "lib"]
#![warn(missing_docs, unused_imports)]

//! Protocol orchestration for privacy-preserving computation over the
//! [`fhe`](https://fhe.rs) BFV scheme.
//!
//! A client holds the secret-bearing view of an [`EvaluationContext`],
//! encrypts its inputs (ballots or biometric feature vectors) and hands the
//! serialized ciphertexts to a [`ComputeParty`] that only ever sees the public,
//! evaluation-only view. The compute party runs the [`EncryptedTallyEngine`]
//! or the [`EncryptedDistanceEngine`] and returns encrypted results that only
//! the client can decrypt.
//!
//! Real values are carried as fixed-point integers in the SIMD slots of BFV
//! ciphertexts; see [`HeParameters`] for the scale and modulus settings.

mod errors;

pub mod artifact;
pub mod ciphertext;
pub mod config;
pub mod distance;
pub mod encoding;
pub mod features;
pub mod keyring;
pub mod proto;
pub mod session;
pub mod tally;
pub mod votes;

pub use ciphertext::{Ciphertext, LinkState};
pub use config::{BallotEncoding, HeParameters, SessionConfig};
pub use distance::{check_distance_capacity, EncryptedDistanceEngine, MatchDecision, MatchPolicy};
pub use errors::{Error, Result};
pub use keyring::{ContextView, EvaluationContext, Generation, ViewKind};
pub use session::{ClientSession, ComputeParty, SessionState, Workload};
pub use tally::{
    CancellationToken, EncryptedTallyEngine, EqualityOracle, GroupId, SecretEqualityOracle,
    TallyResult,
};
