//! Stateful HTTP sessions.
//!
//! A [`Session`] wraps a cookie-holding HTTP client whose lifetime can span
//! several requests. The dispatcher owns every session it sees on a
//! response and closes it exactly once, unless a request yielded by the
//! parser takes the handle over.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, ClientBuilder, Proxy};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// Attempt to close a session that was already closed.
#[derive(Debug, Error)]
#[error("session already closed")]
pub struct SessionClosed;

/// Attributes for a session created from a configuration rather than
/// adopted from an earlier response.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Headers attached to every request issued through the session.
    pub headers: HeaderMap,
    /// Proxy URL for all requests on this session.
    pub proxy: Option<String>,
    /// Whether TLS certificates are verified.
    pub verify: bool,
    /// Total timeout override for requests on this session.
    pub timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            proxy: None,
            verify: true,
            timeout: None,
        }
    }
}

/// A cookie-holding connection context shared between requests.
///
/// Obtained by marking a request with [`SessionPolicy::New`] or
/// [`SessionPolicy::Configured`]; later requests yielded from that
/// request's response adopt the same handle unless they opt out.
///
/// [`SessionPolicy::New`]: crate::request::SessionPolicy::New
/// [`SessionPolicy::Configured`]: crate::request::SessionPolicy::Configured
#[derive(Debug)]
pub struct Session {
    client: Client,
    closed: AtomicBool,
}

impl Session {
    /// Builds a fresh session client from the crawl configuration plus
    /// per-session attributes.
    pub(crate) fn open(
        config: &Config,
        attrs: &SessionConfig,
    ) -> Result<Arc<Self>, reqwest::Error> {
        let mut builder = ClientBuilder::new().cookie_store(true);
        builder = config.timeout.apply(builder);
        if let Some(timeout) = attrs.timeout {
            builder = builder.timeout(timeout);
        }
        if !attrs.headers.is_empty() {
            builder = builder.default_headers(attrs.headers.clone());
        }
        if let Some(proxy) = &attrs.proxy {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        if !attrs.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        debug!("opening session");
        Ok(Arc::new(Self {
            client: builder.build()?,
            closed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Marks the session closed. The connection pool and cookie jar are
    /// released once the last clone of the handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SessionClosed`] when the session was closed before.
    pub fn close(&self) -> Result<(), SessionClosed> {
        if self.closed.swap(true, Ordering::SeqCst) {
            Err(SessionClosed)
        } else {
            debug!("session closed");
            Ok(())
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One-off client for requests that need client-level knobs (certificate
/// checks, proxies) without a session.
pub(crate) fn build_bare_client(
    config: &Config,
    verify: bool,
    proxy: Option<&str>,
) -> Result<Client, reqwest::Error> {
    let mut builder = ClientBuilder::new();
    builder = config.timeout.apply(builder);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    if !verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build()
}
