//! Upgrade redirects for outdated clients.
//!
//! Checks the `X-Lantern-Version` header against a semantic version range
//! and redirects a sampled fraction of out-of-range (or unversioned)
//! clients to an upgrade page.
//!
//! # Behavior by method
//! - CONNECT: only tunnels to the configured ports (default 80) are
//!   considered, since encrypted tunnels cannot be answered in-band. The
//!   tunnel is acknowledged, the client's first request inside it is read
//!   and discarded, and a `302 Found` is written in its place.
//! - GET: only browser navigations (`Accept: text/html...` and
//!   `User-Agent: Mozilla/...`) are redirected, with an ordinary reply.
//! - Anything else passes through.
//!
//! The version header is removed from every request that continues.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use http::{header, HeaderValue, Method, StatusCode};
use rand::Rng;
use semver::{BuildMetadata, Comparator, Op, Version, VersionReq};
use thiserror::Error;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::filters::{Filter, FilterDecision};
use crate::http::headers;
use crate::http::request::{discard_body, read_request, Request};
use crate::http::response::{Reply, TUNNEL_ESTABLISHED};
use crate::net::connection::{Io, RawConnection};
use crate::net::dial::Dialer;
use crate::observability::metrics;

const ONE_MILLION: u32 = 1_000_000;

/// Configuration errors; all of them are fatal at startup.
#[derive(Debug, Error)]
pub enum VersionCheckError {
    #[error("invalid version range {range:?}: {source}")]
    Range {
        range: String,
        #[source]
        source: semver::Error,
    },
    #[error("invalid rewrite URL {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("rewrite URL {0:?} has no host")]
    MissingHost(String),
    #[error("rewrite URL {0:?} cannot be used as a Location header")]
    Location(String),
    #[error("rewrite host {0:?} is not a valid TLS server name")]
    ServerName(String),
    #[error("TLS client setup failed: {0}")]
    Tls(#[source] tokio_rustls::rustls::Error),
    #[error("redirect percentage {0} is outside 0..=100")]
    Percentage(f64),
}

/// A set of version requirements, any of which may match.
///
/// Accepts `||` between alternatives and either commas or whitespace
/// between the comparators of one alternative, so both `>=3.0.0, <4.0.0`
/// and `>=3.0.0 <4.0.0 || 5.x` parse.
#[derive(Debug, Clone)]
pub struct VersionRange {
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    pub fn parse(range: &str) -> Result<Self, VersionCheckError> {
        let alternatives = range
            .split("||")
            .map(|alternative| {
                VersionReq::parse(&normalize_comparators(alternative)).map_err(|source| {
                    VersionCheckError::Range {
                        range: range.to_string(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { alternatives })
    }

    /// Prerelease versions are ordered like any other version, so
    /// `3.7.1-beta` satisfies `>=3.0.0`.
    pub fn matches(&self, version: &Version) -> bool {
        let version = Version {
            build: BuildMetadata::EMPTY,
            ..version.clone()
        };
        self.alternatives
            .iter()
            .any(|req| req.comparators.iter().all(|cmp| comparator_admits(cmp, &version)))
    }
}

fn comparator_admits(cmp: &Comparator, v: &Version) -> bool {
    let base = Version {
        major: cmp.major,
        minor: cmp.minor.unwrap_or(0),
        patch: cmp.patch.unwrap_or(0),
        pre: cmp.pre.clone(),
        build: BuildMetadata::EMPTY,
    };
    // First version past what a partial comparator names: `3` ends at
    // `4.0.0`, `3.1` at `3.2.0`.
    let past = match (cmp.minor, cmp.patch) {
        (None, _) => Version::new(cmp.major + 1, 0, 0),
        (Some(minor), None) => Version::new(cmp.major, minor + 1, 0),
        (Some(minor), Some(patch)) => Version::new(cmp.major, minor, patch + 1),
    };
    let partial = cmp.patch.is_none();

    match cmp.op {
        Op::Exact | Op::Wildcard if partial => *v >= base && *v < past,
        Op::Exact | Op::Wildcard => *v == base,
        Op::Greater if partial => *v >= past,
        Op::Greater => *v > base,
        Op::GreaterEq => *v >= base,
        Op::Less => *v < base,
        Op::LessEq if partial => *v < past,
        Op::LessEq => *v <= base,
        Op::Tilde => {
            let upper = match cmp.minor {
                Some(minor) => Version::new(cmp.major, minor + 1, 0),
                None => Version::new(cmp.major + 1, 0, 0),
            };
            *v >= base && *v < upper
        }
        Op::Caret => {
            let upper = match (cmp.major, cmp.minor, cmp.patch) {
                (0, Some(0), Some(patch)) => Version::new(0, 0, patch + 1),
                (0, Some(minor), _) => Version::new(0, minor + 1, 0),
                (major, _, _) => Version::new(major + 1, 0, 0),
            };
            *v >= base && *v < upper
        }
        _ => cmp.matches(v),
    }
}

fn normalize_comparators(alternative: &str) -> String {
    if alternative.contains(',') {
        return alternative.trim().to_string();
    }
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op = String::new();
    for token in alternative.split_whitespace() {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            pending_op.push_str(token);
            continue;
        }
        comparators.push(format!("{}{}", std::mem::take(&mut pending_op), token));
    }
    if !pending_op.is_empty() {
        comparators.push(pending_op);
    }
    comparators.join(", ")
}

/// Source of uniform draws for redirect sampling.
pub trait Sampler: Send + Sync {
    /// Uniform integer in `[0, upper)`.
    fn draw(&self, upper: u32) -> u32;
}

/// Draws from the calling thread's RNG, independently seeded per thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngSampler;

impl Sampler for ThreadRngSampler {
    fn draw(&self, upper: u32) -> u32 {
        rand::thread_rng().gen_range(0..upper)
    }
}

pub struct VersionChecker {
    version_range: VersionRange,
    rewrite_url: Url,
    location: HeaderValue,
    rewrite_host: String,
    rewrite_addr: String,
    tunnel_ports: Vec<String>,
    ppm: u32,
    sampler: Arc<dyn Sampler>,
}

impl VersionChecker {
    /// Build a checker. `tunnel_ports` defaults to `["80"]` when empty;
    /// `percentage` is the share of eligible requests to redirect, 0 to 100.
    pub fn new(
        version_range: &str,
        rewrite_url: &str,
        tunnel_ports: Vec<String>,
        percentage: f64,
    ) -> Result<Self, VersionCheckError> {
        let url = Url::parse(rewrite_url).map_err(|source| VersionCheckError::Url {
            url: rewrite_url.to_string(),
            source,
        })?;
        let rewrite_host = url
            .host_str()
            .ok_or_else(|| VersionCheckError::MissingHost(rewrite_url.to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| VersionCheckError::MissingHost(rewrite_url.to_string()))?;
        let location = HeaderValue::from_str(rewrite_url)
            .map_err(|_| VersionCheckError::Location(rewrite_url.to_string()))?;
        let version_range = VersionRange::parse(version_range)?;
        if !(0.0..=100.0).contains(&percentage) {
            return Err(VersionCheckError::Percentage(percentage));
        }
        let tunnel_ports = if tunnel_ports.is_empty() {
            vec!["80".to_string()]
        } else {
            tunnel_ports
        };

        Ok(Self {
            version_range,
            rewrite_addr: format!("{}:{}", rewrite_host, port),
            rewrite_host,
            rewrite_url: url,
            location,
            tunnel_ports,
            ppm: (percentage * (ONE_MILLION as f64 / 100.0)).round() as u32,
            sampler: Arc::new(ThreadRngSampler),
        })
    }

    /// Replace the random source, e.g. with a fixed one in tests.
    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn ppm(&self) -> u32 {
        self.ppm
    }

    pub fn rewrite_url(&self) -> &Url {
        &self.rewrite_url
    }

    /// Wrap `inner` so connections to the rewrite destination speak TLS when
    /// the rewrite URL is `https`. Every other address is dialed untouched.
    pub fn dialer(&self, inner: Arc<dyn Dialer>) -> Result<Arc<dyn Dialer>, VersionCheckError> {
        if self.rewrite_url.scheme() != "https" {
            return Ok(inner);
        }
        let server_name = ServerName::try_from(self.rewrite_host.clone())
            .map_err(|_| VersionCheckError::ServerName(self.rewrite_host.clone()))?;
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = tokio_rustls::rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(VersionCheckError::Tls)?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Arc::new(RewriteTlsDialer {
            inner,
            rewrite_addr: self.rewrite_addr.clone(),
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
        }))
    }

    fn should_redirect(&self, req: &Request) -> bool {
        // Typical browsers always send this as the first value.
        if !req
            .header_str(&header::ACCEPT)
            .is_some_and(|accept| accept.starts_with("text/html"))
        {
            return false;
        }
        if !req
            .header_str(&header::USER_AGENT)
            .is_some_and(|agent| agent.starts_with("Mozilla/"))
        {
            return false;
        }
        self.match_version(req)
    }

    fn should_redirect_on_connect(&self, req: &Request) -> bool {
        let Some((_, port)) = req.split_target() else {
            return false;
        };
        if !self.tunnel_ports.iter().any(|p| p == port) {
            return false;
        }
        self.match_version(req)
    }

    fn match_version(&self, req: &Request) -> bool {
        // Requests for the upgrade page itself must never be redirected.
        if req.hostname().eq_ignore_ascii_case(&self.rewrite_host) {
            return false;
        }
        // Missing or unparsable versions count as outdated.
        let current = req
            .header_str(&headers::VERSION)
            .and_then(|v| Version::parse(v.trim()).ok());
        if current.is_some_and(|v| self.version_range.matches(&v)) {
            return false;
        }
        self.sampler.draw(ONE_MILLION) < self.ppm
    }

    fn redirect(&self) -> Reply {
        Reply::closing(StatusCode::FOUND).header(header::LOCATION, self.location.clone())
    }

    async fn redirect_on_connect(&self, conn: &mut RawConnection, req: &Request) {
        if let Err(e) = conn.write_all(TUNNEL_ESTABLISHED).await {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Failed to acknowledge CONNECT");
            conn.close().await;
            return;
        }

        // The client's first tunneled request has to be consumed before it
        // can be answered.
        match read_request(conn.stream_mut()).await {
            Ok(inner) => {
                let drained = match inner.body_framing() {
                    Ok(framing) => discard_body(conn.stream_mut(), framing).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = drained {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "Failed to drain tunneled request body");
                }
                tracing::debug!(
                    connection_id = %conn.id(),
                    tunnel = %req.target,
                    method = %inner.method,
                    path = %inner.path(),
                    location = %self.rewrite_url,
                    "Redirecting tunneled request"
                );
            }
            Err(e) => {
                tracing::error!(
                    connection_id = %conn.id(),
                    error = %e,
                    "Fail to read tunneled request before redirecting"
                );
            }
        }

        if let Err(e) = conn.write_all(&self.redirect().to_bytes()).await {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Failed to write tunneled redirect");
        }
        conn.close().await;
    }
}

#[async_trait]
impl Filter for VersionChecker {
    fn name(&self) -> &'static str {
        "version_check"
    }

    async fn apply(&self, conn: &mut RawConnection, mut req: Request) -> FilterDecision {
        let redirect = match req.method {
            Method::CONNECT => self.should_redirect_on_connect(&req),
            Method::GET => self.should_redirect(&req),
            _ => false,
        };
        req.headers.remove(headers::VERSION);

        if !redirect {
            return FilterDecision::Continue(req);
        }
        metrics::record_version_redirect(req.method.as_str());

        if req.is_connect() {
            self.redirect_on_connect(conn, &req).await;
            return FilterDecision::Hijack;
        }

        tracing::debug!(
            connection_id = %conn.id(),
            host = %req.host(),
            path = %req.path(),
            location = %self.rewrite_url,
            "Redirecting browser request"
        );
        FilterDecision::Reply(self.redirect())
    }
}

/// Upgrades connections to the rewrite destination to TLS.
struct RewriteTlsDialer {
    inner: Arc<dyn Dialer>,
    rewrite_addr: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

#[async_trait]
impl Dialer for RewriteTlsDialer {
    async fn dial(&self, addr: &str) -> io::Result<Box<dyn Io>> {
        let conn = self.inner.dial(addr).await?;
        if addr != self.rewrite_addr {
            return Ok(conn);
        }
        let tls = self.connector.connect(self.server_name.clone(), conn).await?;
        tracing::trace!(addr = %addr, "Dialed rewrite destination over TLS");
        Ok(Box::new(tls))
    }
}
