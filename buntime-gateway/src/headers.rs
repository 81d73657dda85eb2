//! Header names the runtime injects or honors.

/// Mount path of the app handling the request.
pub const X_BASE: &str = "x-base";
/// Original path, set when a navigation is handed to the shell.
pub const X_FRAGMENT_ROUTE: &str = "x-fragment-route";
/// Tenant captured by a wildcard virtual host.
pub const X_VHOST_TENANT: &str = "x-vhost-tenant";
/// Tells the shell worker to render its 404 page.
pub const X_NOT_FOUND: &str = "x-not-found";
/// Serialized identity injected by the authn plugin.
pub const X_IDENTITY: &str = "x-identity";
/// Marks requests arriving over trusted transport.
pub const X_BUNTIME_INTERNAL: &str = "x-buntime-internal";
/// Correlation id; echoed back on every response.
pub const X_REQUEST_ID: &str = "x-request-id";
