//! Opsprint core: query-shape fingerprints and slow-operation classification.
//!
//! Pure code, no I/O. Sources of raw operation documents live in
//! `opsprint-mongohub`; polling and deduplication in `opsprint-monitor`.

#![forbid(unsafe_code)]

pub mod fingerprint;
pub mod record;

pub use fingerprint::{fingerprint, fingerprint_document, fingerprint_json};
pub use record::{FingerprintedRecord, NO_COLLECTION};

pub mod prelude {
    pub use super::{fingerprint, fingerprint_document, FingerprintedRecord, NO_COLLECTION};
}
