use std::num::ParseIntError;

use credcache::{BoxError, CacheError};
use thiserror::Error;

use crate::access_token::ServiceAccountRef;

/// Errors when obtaining credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A service account was requested, but object-level workload identity is disabled.
    #[error("ObjectLevelWorkloadIdentity feature gate is not enabled")]
    ObjectLevelWorkloadIdentityDisabled,
    #[error("failed to get service account '{service_account}': {source}")]
    ServiceAccount {
        service_account: ServiceAccountRef,
        source: BoxError,
    },
    #[error("failed to get provider audience from service account '{service_account}': {source}")]
    Audience {
        service_account: ServiceAccountRef,
        source: BoxError,
    },
    #[error(
        "failed to get provider identity from service account '{service_account}' annotations: {source}"
    )]
    Identity {
        service_account: ServiceAccountRef,
        source: BoxError,
    },
    /// A required GitHub App setting is missing.
    #[error("{0} must be provided to use github app authentication")]
    MissingAppSetting(&'static str),
    #[error("invalid {setting}, err: {source}")]
    InvalidAppSetting {
        setting: &'static str,
        source: ParseIntError,
    },
    #[error("invalid GitHub API URL: {0}")]
    InvalidApiUrl(#[from] url::ParseError),
    /// Credentials were requested for a provider that was not configured.
    #[error("no options configured for provider '{0}'")]
    ProviderNotConfigured(&'static str),
    /// Producing the credentials failed, or the caller stopped waiting for them.
    ///
    /// Failures of the credential provider are shown as-is.
    #[error(transparent)]
    Cache(#[from] CacheError),
}
