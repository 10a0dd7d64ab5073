//! Coffer Auth - authentication and multi-factor verification core
//!
//! This crate provides the credential and MFA engine for the Coffer file
//! sharing platform, including:
//! - Token codec: issuing and parsing capability-scoped bearer credentials
//! - Device registry: TOTP device enrollment, verification, and removal
//! - Auth flows: login, MFA verification, token refresh, password reset
//! - Rate & replay cache: attempt counters and single-use code markers
//! - Challenge store: transactional password-reset challenge records

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod flows;
pub mod notify;
pub mod registry;
pub mod store;
pub mod throttle;
pub mod token;
pub mod types;

pub use cache::{CacheError, MemoryCache, RedisCache, VerificationCache};
pub use config::AuthConfig;
pub use error::{AuthError, Result};
pub use flows::{AuthFlows, LoginGrant, ResetValidation};
pub use notify::{LogNotifier, Notification, Notifier};
pub use registry::{DevicePatch, DeviceRegistry, EnrollmentAuthorization, EnrollmentTicket};
pub use store::AuthStore;
pub use throttle::{IpThrottle, ThrottleConfig, ThrottleDecision};
pub use token::{Audience, Claims, SessionTokens, TokenCodec, VerifyGrant};
pub use types::{Challenge, ChallengeKind, DeviceKind, DeviceView, MfaDevice, Role, User};
