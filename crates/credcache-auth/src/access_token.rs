//! Access tokens from cloud providers.
//!
//! Tokens are either issued for the controller's own identity, or for a Kubernetes service
//! account through workload identity federation. In the latter case, the service account is
//! resolved first, an OIDC token is issued for it with the audience the provider expects, and
//! that OIDC token is then exchanged for an access token.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use credcache::events::InvolvedObject;
use credcache::{BoxError, CacheError, CacheKey, GetOptions, Token, TokenCache};
use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::AuthError;

/// The environment variable enabling object-level workload identity.
pub const ENV_ENABLE_OBJECT_LEVEL_WORKLOAD_IDENTITY: &str =
    "ENABLE_OBJECT_LEVEL_WORKLOAD_IDENTITY";

/// A reference to a Kubernetes service account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceAccountRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceAccountRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceAccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A resolved Kubernetes service account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    pub reference: ServiceAccountRef,
    /// Providers read the identity to impersonate from these annotations.
    pub annotations: BTreeMap<String, String>,
}

/// Provider-independent parameters of a token request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequest {
    pub scopes: Vec<String>,
    pub sts_region: Option<String>,
    pub sts_endpoint: Option<Url>,
    pub proxy_url: Option<Url>,
    /// Whether the provider may shell out to CLI tools to obtain controller credentials.
    pub allow_shell_out: bool,
}

/// A cloud provider issuing access tokens.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    type Token: Token + Clone + Send + Sync + 'static;

    /// The name of the provider, which is part of every cache key.
    fn name(&self) -> &str;

    /// Issues a token for the controller's own identity.
    async fn controller_token(
        &self,
        cancel: CancellationToken,
        request: &TokenRequest,
    ) -> Result<Self::Token, BoxError>;

    /// Returns the audience of OIDC tokens exchanged with this provider.
    async fn audience(&self, service_account: &ServiceAccount) -> Result<String, BoxError>;

    /// Returns the provider identity the service account is configured to impersonate.
    fn identity(&self, service_account: &ServiceAccount) -> Result<String, BoxError>;

    /// Exchanges an OIDC token of the service account for an access token.
    async fn token_for_service_account(
        &self,
        cancel: CancellationToken,
        oidc_token: &str,
        service_account: &ServiceAccount,
        request: &TokenRequest,
    ) -> Result<Self::Token, BoxError>;
}

/// Looks up service accounts and issues OIDC tokens for them.
#[async_trait]
pub trait ServiceAccountResolver: Send + Sync {
    async fn service_account(
        &self,
        reference: &ServiceAccountRef,
    ) -> Result<ServiceAccount, BoxError>;

    async fn oidc_token(
        &self,
        cancel: CancellationToken,
        service_account: &ServiceAccount,
        audience: &str,
    ) -> Result<String, BoxError>;
}

/// Options for [`get_access_token`].
pub struct AuthOptions<T> {
    pub request: TokenRequest,
    /// The service account to obtain a token for, instead of the controller's identity.
    pub service_account: Option<(ServiceAccountRef, Arc<dyn ServiceAccountResolver>)>,
    pub cache: Option<TokenCache<T>>,
    /// Attached to the events of the `cache`.
    pub involved_object: Option<InvolvedObject>,
    /// Whether tokens may be issued for service accounts.
    ///
    /// Defaults to the value of the [`ENV_ENABLE_OBJECT_LEVEL_WORKLOAD_IDENTITY`] environment
    /// variable.
    pub object_level_workload_identity: bool,
}

impl<T> Default for AuthOptions<T> {
    fn default() -> Self {
        Self {
            request: TokenRequest::default(),
            service_account: None,
            cache: None,
            involved_object: None,
            object_level_workload_identity: env::var(ENV_ENABLE_OBJECT_LEVEL_WORKLOAD_IDENTITY)
                .is_ok_and(|value| value == "true"),
        }
    }
}

impl<T> fmt::Debug for AuthOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOptions")
            .field("request", &self.request)
            .field(
                "service_account",
                &self.service_account.as_ref().map(|(reference, _)| reference),
            )
            .field("cache", &self.cache.is_some())
            .field("involved_object", &self.involved_object)
            .field(
                "object_level_workload_identity",
                &self.object_level_workload_identity,
            )
            .finish()
    }
}

impl<T> AuthOptions<T> {
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sts_region(mut self, region: impl Into<String>) -> Self {
        self.request.sts_region = Some(region.into());
        self
    }

    pub fn with_sts_endpoint(mut self, endpoint: Url) -> Self {
        self.request.sts_endpoint = Some(endpoint);
        self
    }

    pub fn with_proxy_url(mut self, proxy_url: Url) -> Self {
        self.request.proxy_url = Some(proxy_url);
        self
    }

    pub fn with_allow_shell_out(mut self) -> Self {
        self.request.allow_shell_out = true;
        self
    }

    pub fn with_service_account(
        mut self,
        reference: ServiceAccountRef,
        resolver: Arc<dyn ServiceAccountResolver>,
    ) -> Self {
        self.service_account = Some((reference, resolver));
        self
    }

    pub fn with_cache(mut self, cache: TokenCache<T>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_involved_object(mut self, involved_object: InvolvedObject) -> Self {
        self.involved_object = Some(involved_object);
        self
    }
}

/// The workload identity a token is requested for.
struct WorkloadIdentity<'a> {
    service_account: &'a ServiceAccountRef,
    audience: &'a str,
    identity: &'a str,
}

/// Builds the cache key for an access token.
///
/// Every input that influences the issued token is part of the key.
fn cache_key(
    provider: &str,
    workload: Option<WorkloadIdentity<'_>>,
    request: &TokenRequest,
) -> CacheKey {
    let builder = CacheKey::builder("access_token").field("provider", provider);
    let builder = match workload {
        Some(workload) => builder
            .field("service_account", workload.service_account)
            .field("audience", workload.audience)
            .field("identity", workload.identity),
        None => builder.field("service_account", "<controller>"),
    };
    builder
        .list_field("scopes", &request.scopes)
        .optional_field("sts_region", request.sts_region.as_deref())
        .optional_field("sts_endpoint", request.sts_endpoint.as_ref())
        .optional_field("proxy_url", request.proxy_url.as_ref())
        .field("allow_shell_out", request.allow_shell_out)
        .build()
}

type Produce<T> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, BoxError>> + Send>;

async fn service_account_token<P: Provider>(
    cancel: CancellationToken,
    provider: Arc<P>,
    resolver: Arc<dyn ServiceAccountResolver>,
    service_account: ServiceAccount,
    audience: String,
    request: TokenRequest,
) -> Result<P::Token, BoxError> {
    let oidc_token = resolver
        .oidc_token(cancel.clone(), &service_account, &audience)
        .await?;
    provider
        .token_for_service_account(cancel, &oidc_token, &service_account, &request)
        .await
}

/// Returns an access token from `provider`, going through the cache if one is configured.
pub async fn get_access_token<P: Provider>(
    cancel: &CancellationToken,
    provider: &Arc<P>,
    options: &AuthOptions<P::Token>,
) -> Result<P::Token, AuthError> {
    let request = options.request.clone();

    let (key, produce): (CacheKey, Produce<P::Token>) = match &options.service_account {
        None => {
            let key = cache_key(provider.name(), None, &request);
            let provider = Arc::clone(provider);
            let produce: Produce<P::Token> = Box::new(move |cancel: CancellationToken| {
                async move { provider.controller_token(cancel, &request).await }.boxed()
            });
            (key, produce)
        }
        Some((reference, resolver)) => {
            if !options.object_level_workload_identity {
                return Err(AuthError::ObjectLevelWorkloadIdentityDisabled);
            }

            let service_account = resolver.service_account(reference).await.map_err(|source| {
                AuthError::ServiceAccount {
                    service_account: reference.clone(),
                    source,
                }
            })?;
            let audience = provider.audience(&service_account).await.map_err(|source| {
                AuthError::Audience {
                    service_account: reference.clone(),
                    source,
                }
            })?;
            let identity =
                provider
                    .identity(&service_account)
                    .map_err(|source| AuthError::Identity {
                        service_account: reference.clone(),
                        source,
                    })?;

            let workload = WorkloadIdentity {
                service_account: reference,
                audience: &audience,
                identity: &identity,
            };
            let key = cache_key(provider.name(), Some(workload), &request);

            let provider = Arc::clone(provider);
            let resolver = Arc::clone(resolver);
            let produce: Produce<P::Token> = Box::new(move |cancel: CancellationToken| {
                service_account_token(cancel, provider, resolver, service_account, audience, request)
                    .boxed()
            });
            (key, produce)
        }
    };

    let Some(cache) = &options.cache else {
        return tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(CacheError::Cancelled.into()),
            result = produce(cancel.clone()) => result.map_err(|err| CacheError::producer(err).into()),
        };
    };

    let get_options = GetOptions {
        involved_object: options.involved_object.clone(),
    };
    let (token, from_cache) = cache
        .get_or_set(cancel, &key.hex(), produce, &get_options)
        .await?;
    tracing::debug!(provider = provider.name(), from_cache, "Obtained access token");
    Ok(token)
}
