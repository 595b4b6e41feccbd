//! Bearer token injection for the trusted upstream host.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;
use url::Url;

use super::http::HttpRequest;

/// Source of the upstream bearer token.
pub trait TokenStore: Send + Sync {
    /// The current token, if the user is signed in.
    fn token(&self) -> Option<String>;
}

/// In-memory token store the app updates on sign-in and sign-out.
#[derive(Debug, Default)]
pub struct StaticTokenStore {
    token: RwLock<Option<String>>,
}

impl StaticTokenStore {
    /// Create a store holding `token`.
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Replace the stored token.
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    /// Forget the stored token.
    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl TokenStore for StaticTokenStore {
    fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Decides which upstream requests carry the bearer token.
///
/// A token is attached only when the request URL's host equals the trusted
/// host (ASCII case-insensitive). Without a trusted host nothing is ever
/// authorized.
#[derive(Clone, Default)]
pub struct AuthPolicy {
    store: Option<Arc<dyn TokenStore>>,
    trusted_host: Option<String>,
}

impl AuthPolicy {
    /// Inject tokens from `store` into requests for `trusted_host`.
    pub fn new(store: Arc<dyn TokenStore>, trusted_host: impl Into<String>) -> Self {
        Self {
            store: Some(store),
            trusted_host: Some(trusted_host.into()),
        }
    }

    /// A policy that never injects credentials.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether `url` points at the trusted host.
    pub fn is_trusted(&self, url: &str) -> bool {
        let Some(trusted) = self.trusted_host.as_deref() else {
            return false;
        };
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|host| host.eq_ignore_ascii_case(trusted)))
            .unwrap_or(false)
    }

    /// Attach `Authorization: Bearer <token>` if the policy allows it.
    pub fn authorize(&self, request: HttpRequest) -> HttpRequest {
        if !self.is_trusted(&request.url) {
            return request;
        }
        match self.store.as_ref().and_then(|s| s.token()) {
            Some(token) => {
                debug!("Attaching bearer token for {}", request.url);
                request.with_header("Authorization", format!("Bearer {token}"))
            }
            None => request,
        }
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("has_store", &self.store.is_some())
            .field("trusted_host", &self.trusted_host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(token: Option<&str>) -> AuthPolicy {
        let store = Arc::new(StaticTokenStore::new(token.map(str::to_string)));
        AuthPolicy::new(store, "lichess.org")
    }

    #[test]
    fn test_injects_for_trusted_host() {
        let request = policy(Some("secret")).authorize(HttpRequest::get(
            "https://lichess.org/api/board/game/stream/abc",
        ));
        assert_eq!(request.header("Authorization"), Some("Bearer secret"));
    }

    #[test]
    fn test_host_match_is_case_insensitive() {
        let request = policy(Some("secret")).authorize(HttpRequest::get("https://LiChess.ORG/api"));
        assert_eq!(request.header("Authorization"), Some("Bearer secret"));
    }

    #[test]
    fn test_never_injects_for_other_hosts() {
        let policy = policy(Some("secret"));

        for url in [
            "https://example.com/api",
            "https://lichess.org.evil.com/api",
            "https://evil.com/?lichess.org",
            "https://sub.lichess.org/api",
            "not a url",
        ] {
            let request = policy.authorize(HttpRequest::get(url));
            assert_eq!(request.header("Authorization"), None, "{url}");
        }
    }

    #[test]
    fn test_no_token_no_header() {
        let request = policy(None).authorize(HttpRequest::get("https://lichess.org/api"));
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_none_policy() {
        let request = AuthPolicy::none().authorize(HttpRequest::get("https://lichess.org/api"));
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_store_updates() {
        let store = Arc::new(StaticTokenStore::default());
        let policy = AuthPolicy::new(store.clone(), "lichess.org");
        assert_eq!(store.token(), None);

        store.set("fresh");
        let request = policy.authorize(HttpRequest::get("https://lichess.org/api"));
        assert_eq!(request.header("authorization"), Some("Bearer fresh"));

        store.clear();
        assert_eq!(store.token(), None);
    }
}
