use http::HeaderMap;

/// Opaque "check these credentials" gate used by the proxy and admin API
pub trait CredentialChecker: Send + Sync + 'static {
    /// Whether the request headers carry acceptable credentials
    fn check(&self, headers: &HeaderMap) -> bool;
}
