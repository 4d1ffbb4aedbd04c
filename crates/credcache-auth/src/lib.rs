//! Cached credentials for cloud providers, GitHub Apps and Git repositories.
//!
//! The actual exchanges with the providers are abstracted behind traits
//! ([`Provider`](access_token::Provider),
//! [`InstallationTokenSource`](github::InstallationTokenSource)). This crate decides what is
//! requested, how it is cached, and how concurrent requests for the same credentials are
//! coalesced, using [`credcache::TokenCache`].

pub mod access_token;
pub mod git;
pub mod github;

mod error;

pub use error::AuthError;
