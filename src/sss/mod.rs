//! Shamir Secret Sharing
//!
//! Threshold sharing of byte strings over a 256-bit prime field.
//!
//! - **Field** (`field.rs`): modular arithmetic, Horner evaluation and
//!   Lagrange interpolation over GF(P).
//! - **Sharer** (`sharer.rs`): chunked split, reconstruction, single-share
//!   regeneration and share validation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use shardwarden::sss;
//!
//! let shares = sss::split(b"root key material", 3, 5)?;
//! let secret = sss::reconstruct(&shares[1..4])?;
//! assert_eq!(secret, b"root key material");
//! ```

pub mod field;
pub mod sharer;

#[cfg(test)]
mod proptest;

pub use field::{FieldElement, PRIME};
pub use sharer::{interpolate_share, reconstruct, split, validate_share, Share, CHUNK_SIZE, MAX_SHARES};
