//! Credentials for accessing Git repositories.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use credcache::store::ExpiringStore;
use credcache::{CacheError, Token};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::AuthError;
use crate::access_token::{AuthOptions, Provider, get_access_token};
use crate::github::AppClient;

pub const PROVIDER_AZURE: &str = "azure";
pub const PROVIDER_GITHUB: &str = "github";

/// The username of HTTP basic auth with GitHub App installation tokens.
const GITHUB_APP_USERNAME: &str = "x-access-token";

/// An access token that is sent as a bearer token.
pub trait BearerToken: Token {
    fn secret(&self) -> &str;

    fn expires_on(&self) -> DateTime<Utc>;
}

/// Authentication data for a Git repository.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub bearer_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub expires_on: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("bearer_token", &redacted(&self.bearer_token))
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Per-provider options of [`get_credentials`].
pub struct GitAuthOptions<P: Provider> {
    pub azure: Option<(Arc<P>, AuthOptions<P::Token>)>,
    pub github: Option<AppClient>,
}

impl<P: Provider> Default for GitAuthOptions<P> {
    fn default() -> Self {
        Self {
            azure: None,
            github: None,
        }
    }
}

/// Returns credentials for a Git repository hosted by `provider`.
///
/// `Ok(None)` means that the provider has no special authentication, and generic credentials
/// should be used instead.
pub async fn get_credentials<P>(
    cancel: &CancellationToken,
    provider: &str,
    options: &GitAuthOptions<P>,
) -> Result<Option<Credentials>, AuthError>
where
    P: Provider,
    P::Token: BearerToken,
{
    let credentials = match provider {
        PROVIDER_AZURE => {
            let (provider, options) = options
                .azure
                .as_ref()
                .ok_or(AuthError::ProviderNotConfigured(PROVIDER_AZURE))?;
            let token = get_access_token(cancel, provider, options).await?;
            Credentials {
                bearer_token: Some(token.secret().to_owned()),
                expires_on: Some(token.expires_on()),
                ..Default::default()
            }
        }
        PROVIDER_GITHUB => {
            let client = options
                .github
                .as_ref()
                .ok_or(AuthError::ProviderNotConfigured(PROVIDER_GITHUB))?;
            let token = client.get_token(cancel).await?;
            Credentials {
                username: Some(GITHUB_APP_USERNAME.to_owned()),
                password: Some(token.token),
                expires_on: Some(token.expires_at),
                ..Default::default()
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(credentials))
}

/// Caches `credentials` under `key` until `expires_at`.
///
/// Credentials that are already expired are not cached.
pub fn cache_credentials(
    store: &ExpiringStore<Credentials>,
    key: &str,
    credentials: Credentials,
    expires_at: DateTime<Utc>,
) {
    let Ok(remaining) = (expires_at - Utc::now()).to_std() else {
        tracing::debug!(key, "Not caching expired credentials");
        return;
    };
    store.set_with_expiration(key, credentials, Instant::now() + remaining);
}

/// Returns the live credentials cached under `key`.
pub fn cached_credentials(store: &ExpiringStore<Credentials>, key: &str) -> Option<Credentials> {
    store.get(key)
}

/// Removes the credentials cached under `key`, for instance after they were rejected.
pub fn invalidate_credentials(
    store: &ExpiringStore<Credentials>,
    key: &str,
) -> Result<(), CacheError> {
    store.delete(key)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use credcache::{BoxError, StoreConfig};

    use super::*;
    use crate::access_token::{ServiceAccount, TokenRequest};
    use crate::github::{AppCredentials, AppToken, InstallationTokenSource};

    #[derive(Debug, Clone)]
    struct AzureToken {
        token: String,
        expires_on: DateTime<Utc>,
    }

    impl Token for AzureToken {
        fn duration(&self) -> Duration {
            (self.expires_on - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        }
    }

    impl BearerToken for AzureToken {
        fn secret(&self) -> &str {
            &self.token
        }

        fn expires_on(&self) -> DateTime<Utc> {
            self.expires_on
        }
    }

    struct MockAzure {
        expires_on: DateTime<Utc>,
    }

    #[async_trait]
    impl Provider for MockAzure {
        type Token = AzureToken;

        fn name(&self) -> &str {
            PROVIDER_AZURE
        }

        async fn controller_token(
            &self,
            _cancel: CancellationToken,
            _request: &TokenRequest,
        ) -> Result<AzureToken, BoxError> {
            Ok(AzureToken {
                token: "azure-token".to_owned(),
                expires_on: self.expires_on,
            })
        }

        async fn audience(&self, _service_account: &ServiceAccount) -> Result<String, BoxError> {
            Ok("api://AzureADTokenExchange".to_owned())
        }

        fn identity(&self, _service_account: &ServiceAccount) -> Result<String, BoxError> {
            Ok("client-id".to_owned())
        }

        async fn token_for_service_account(
            &self,
            _cancel: CancellationToken,
            _oidc_token: &str,
            _service_account: &ServiceAccount,
            _request: &TokenRequest,
        ) -> Result<AzureToken, BoxError> {
            Err("not supported".into())
        }
    }

    struct MockSource {
        expires_at: DateTime<Utc>,
    }

    #[async_trait]
    impl InstallationTokenSource for MockSource {
        async fn installation_token(
            &self,
            _cancel: CancellationToken,
            _credentials: &AppCredentials,
        ) -> Result<AppToken, BoxError> {
            Ok(AppToken {
                token: "ghs_token".to_owned(),
                expires_at: self.expires_at,
            })
        }
    }

    fn expires_on() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2099-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn options() -> GitAuthOptions<MockAzure> {
        let azure = MockAzure {
            expires_on: expires_on(),
        };
        let github = AppClient::builder()
            .app_id("127")
            .installation_id("300")
            .private_key("private key")
            .build(Arc::new(MockSource {
                expires_at: expires_on(),
            }))
            .unwrap();
        GitAuthOptions {
            azure: Some((Arc::new(azure), AuthOptions::default())),
            github: Some(github),
        }
    }

    #[tokio::test]
    async fn test_azure_credentials() {
        let cancel = CancellationToken::new();
        let credentials = get_credentials(&cancel, PROVIDER_AZURE, &options())
            .await
            .unwrap();

        assert_eq!(
            credentials,
            Some(Credentials {
                bearer_token: Some("azure-token".to_owned()),
                expires_on: Some(expires_on()),
                ..Default::default()
            })
        );
    }

    #[tokio::test]
    async fn test_github_credentials() {
        let cancel = CancellationToken::new();
        let credentials = get_credentials(&cancel, PROVIDER_GITHUB, &options())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(credentials.bearer_token, None);
        assert_eq!(credentials.username.as_deref(), Some("x-access-token"));
        assert_eq!(credentials.password.as_deref(), Some("ghs_token"));
        assert_eq!(credentials.expires_on, Some(expires_on()));
        assert!(!format!("{credentials:?}").contains("ghs_token"));
    }

    #[tokio::test]
    async fn test_generic_provider() {
        let cancel = CancellationToken::new();
        let credentials = get_credentials(&cancel, "generic", &options())
            .await
            .unwrap();
        assert_eq!(credentials, None);
    }

    #[tokio::test]
    async fn test_unconfigured_provider() {
        let cancel = CancellationToken::new();
        let options = GitAuthOptions::<MockAzure>::default();

        let err = get_credentials(&cancel, PROVIDER_GITHUB, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ProviderNotConfigured("github")));
        assert_eq!(err.to_string(), "no options configured for provider 'github'");
    }

    #[tokio::test(start_paused = true)]
    async fn test_credentials_cache() {
        let store = ExpiringStore::new(&StoreConfig::default()).unwrap();
        let credentials = Credentials {
            bearer_token: Some("token".to_owned()),
            ..Default::default()
        };

        assert_eq!(cached_credentials(&store, "repo"), None);

        cache_credentials(
            &store,
            "repo",
            credentials.clone(),
            Utc::now() + chrono::Duration::minutes(10),
        );
        assert_eq!(cached_credentials(&store, "repo"), Some(credentials.clone()));
        assert!(store.get_expiration("repo").unwrap().is_some());

        invalidate_credentials(&store, "repo").unwrap();
        assert_eq!(cached_credentials(&store, "repo"), None);
        assert_eq!(
            invalidate_credentials(&store, "repo"),
            Err(CacheError::NotFound)
        );

        cache_credentials(
            &store,
            "repo",
            credentials.clone(),
            Utc::now() + chrono::Duration::minutes(10),
        );
        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(cached_credentials(&store, "repo"), None);

        // already expired credentials are never stored
        cache_credentials(
            &store,
            "expired",
            credentials,
            Utc::now() - chrono::Duration::seconds(1),
        );
        assert!(store.is_empty());
    }
}
