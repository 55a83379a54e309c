//! # Utility Modules
//!
//! Supporting utilities for cryptography, ids, logging, and timing.
//!
//! ## Components
//! - **Crypto**: X25519 / Ed25519 key pairs, SHA-256, HKDF, XChaCha20-Poly1305
//! - **Id**: packet ids and random nonces
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Default deadlines and async timeout wrappers
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (OsRng / getrandom)
//! - Memory zeroing for sensitive data (zeroize crate)

pub mod crypto;
pub mod id;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
