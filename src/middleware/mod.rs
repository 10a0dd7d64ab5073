//! Middleware pipeline for the Coffer HTTP server
//!
//! Executed in this fixed order per request:
//! 1. Authenticate (exemption table, bearer parse, claims into context)
//! 2. Audience scope (route policy table)
//! 3. MFA enforcement (stale-token and platform-policy guard)
//! 4. Rate limit (token bucket per trusted client IP)

pub mod auth;
pub mod mfa;
pub mod rate_limit;
pub mod scope;
