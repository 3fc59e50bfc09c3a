#![allow(missing_docs)]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeParameters {
    #[prost(uint32, tag = "1")]
    pub degree: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub moduli_sizes: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, tag = "3")]
    pub plaintext_bits: u32,
    #[prost(uint32, tag = "4")]
    pub scale_bits: u32,
}
/// A public (evaluation-only) or secret (decryption-capable) context view.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContextView {
    #[prost(uint64, tag = "1")]
    pub generation: u64,
    #[prost(message, optional, tag = "2")]
    pub parameters: ::core::option::Option<HeParameters>,
    #[prost(bytes = "vec", tag = "3")]
    pub bfv_parameters: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub relinearization_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub evaluation_key: ::prost::alloc::vec::Vec<u8>,
    /// Empty for public views.
    #[prost(bytes = "vec", tag = "7")]
    pub secret_seed: ::prost::alloc::vec::Vec<u8>,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CiphertextEnvelope {
    #[prost(uint64, tag = "1")]
    pub generation: u64,
    #[prost(uint32, tag = "2")]
    pub slots: u32,
    #[prost(uint32, tag = "3")]
    pub scale_exponent: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Submission {
    #[prost(uint64, tag = "1")]
    pub generation: u64,
    #[prost(enumeration = "WorkloadKind", tag = "2")]
    pub kind: i32,
    #[prost(message, repeated, tag = "3")]
    pub ciphertexts: ::prost::alloc::vec::Vec<CiphertextEnvelope>,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TallyGroup {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(message, optional, tag = "2")]
    pub count: ::core::option::Option<CiphertextEnvelope>,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComputeResult {
    #[prost(uint64, tag = "1")]
    pub generation: u64,
    #[prost(enumeration = "ResultKind", tag = "2")]
    pub kind: i32,
    #[prost(message, repeated, tag = "3")]
    pub groups: ::prost::alloc::vec::Vec<TallyGroup>,
    #[prost(message, optional, tag = "4")]
    pub value: ::core::option::Option<CiphertextEnvelope>,
}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WorkloadKind {
    Ballots = 0,
    Vectors = 1,
}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResultKind {
    GroupCounts = 0,
    CandidateCounts = 1,
    SquaredDistance = 2,
}
