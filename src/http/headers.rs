//! Header names the proxy client speaks.

use http::HeaderName;

/// Identifies the device a connection belongs to, for usage accounting.
pub const DEVICE_ID: HeaderName = HeaderName::from_static("x-lantern-device-id");

/// Client software version; never forwarded upstream.
pub const VERSION: HeaderName = HeaderName::from_static("x-lantern-version");

/// Shared-secret proxy token; stripped once it has been verified.
pub const AUTH_TOKEN: HeaderName = HeaderName::from_static("x-lantern-auth-token");

/// Legacy hop-by-hop header some clients still send to proxies.
pub const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
