//! # warden-core
//!
//! Client-side license validation with layered tamper resistance.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HardenedClient                            │
//! │   honeypots · obfuscated/distributed verdicts · monitors     │
//! │                           │                                  │
//! │                           ▼                                  │
//! │                    SecureClient                              │
//! │   debugger · clock rollback · named validators               │
//! │                           │                                  │
//! │                           ▼                                  │
//! │  ┌──────────────────────────────────────────────────┐      │
//! │  │              LicenseClient                        │      │
//! │  │   basic → expiration → offline grace → signature  │      │
//! │  └──────────────────────────────────────────────────┘      │
//! │        │                  │                   │              │
//! │        ▼                  ▼                   ▼              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────┐     │
//! │  │ HttpsClient  │  │  Signature   │  │ Credential    │     │
//! │  │ (cert pin)   │  │  Verifier    │  │ Store (AEAD)  │     │
//! │  └──────────────┘  └──────────────┘  └───────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! - **Signed before applied**: no server field is used before its
//!   signature verifies
//! - **Machine-bound cache**: keys derive from the machine fingerprint, so a
//!   copied cache does not open elsewhere
//! - **Silent tamper response**: detections clear credentials and flip the
//!   verdict, without reporting which check fired
//! - **Obscurity is layered, not load-bearing**: honeypots, opaque
//!   predicates and key fragments sit on top of the cryptographic core

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::missing_panics_doc)] // Panic documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type

pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod https;
pub mod license;
pub mod orchestrator;
pub mod scheduler;
pub mod security;
pub mod signature;
pub mod transport;
pub mod validation;

pub use cache::{CacheStatus, CredentialStore, MAX_CACHE_AGE_SECS};
pub use config::{LicenseConfig, SecurityConfig};
pub use error::LicenseError;
pub use fingerprint::{machine_fingerprint, FingerprintParts};
pub use https::{
    certificate_fingerprint_from_file, normalize_fingerprint, server_certificate_fingerprint,
    HttpsClient,
};
pub use license::{AuthorizationRecord, DeviceInfo, UpdateInfo};
pub use orchestrator::{HardenedClient, SecureClient, SecurityStatus};
pub use scheduler::{Interval, PeriodicTask, StopSignal};
pub use signature::{canonical_json, SignatureVerifier};
pub use transport::LicenseTransport;
pub use validation::{hash_password, LicenseClient, LicenseState};

pub use warden_crypto::constant_time_eq;
