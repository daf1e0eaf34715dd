//! Core of the crucible execution service: per-session interpreter kernels,
//! the session registry, and static pre-execution verification.
//!
//! The HTTP surface lives in `crucible-server`; the client-side provider in
//! `crucible-client`. This crate is transport-free.

mod error;
pub mod kernel;
mod registry;
pub mod verifier;

pub use error::CoreErr;
pub use error::Result;
pub use kernel::KernelHandle;
pub use kernel::OutputCallback;
pub use kernel::magics::SplitCode;
pub use kernel::magics::separate_magics_and_code;
pub use registry::Session;
pub use registry::SessionRegistry;
pub use verifier::DANGEROUS_NAMES;
pub use verifier::VerificationPolicy;
pub use verifier::Violation;
pub use verifier::verify_code;
