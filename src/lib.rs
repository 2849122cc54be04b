//! crguard: request-level threat detection, identifier blocking, tiered
//! rate limiting and cryptographic utilities for API backends.
//!
//! The [`SecurityMonitor`] evaluates each inbound request
//! ([`RequestView`]) and returns a [`Decision`]; the [`http`] module wires
//! it into axum. [`CryptoCore`] is an independent toolkit for encryption,
//! password hashing, tokens, signatures and masking.

pub mod alert;
pub mod block;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod detect;
pub mod error;
pub mod http;
pub mod models;
pub mod monitor;
pub mod rate_limit;
pub mod sweeper;
pub mod window;

pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use config::Config;
pub use crypto::{CryptoCore, EncryptedPayload, MaskCategory, SignedMessage};
pub use detect::{Detection, Detector};
pub use error::{CryptoError, DetectorError, OperationalError, Rejection, RejectionCode};
pub use http::{guard, GuardState};
pub use models::{RequestView, SecurityEvent, SecurityEventType, SecurityStats, Severity};
pub use monitor::{Decision, SecurityMonitor, SweepReport};
pub use rate_limit::RateTier;
pub use sweeper::Sweeper;
