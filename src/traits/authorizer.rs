//! Client authorization seam owned by the transport layer

/// Decides whether a remote client may mutate the watched directory
///
/// Production: provided by the session transport
/// Testing: `mocks::StaticAuthorizer`
pub trait Authorizer: Send + Sync {
    /// Whether a connected client is allowed to send mutating commands
    fn is_trusted_client(&self, client_id: u64) -> bool;

    /// Whether `client_id` belongs to a currently connected client
    fn is_connected(&self, client_id: u64) -> bool;

    /// Whether an HTTP request carrying `token` from `client_ip` belongs to a trusted client
    fn is_trusted_token(&self, client_id: u64, client_ip: &str, token: &str) -> bool;
}
