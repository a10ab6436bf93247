//! Error types for the crawl engine.
//!
//! Every failure that can surface from a crawl is a [`SpiderError`]. The
//! engine publishes one outcome per issued request, so an error here stands
//! in for the response that never arrived; the dispatcher decides whether
//! it is retried, absorbed, or reported to [`Spider::on_error`].
//!
//! [`Spider::on_error`]: crate::spider::Spider::on_error

use std::sync::Arc;

use thiserror::Error;

use crate::request::Request;
use crate::response::Response;
use crate::spider::Spider;

/// Boxed error used as the `cause` slot throughout the crate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Turns a caught panic payload into an error cause, so a panicking user
/// handler degrades into a reported error instead of killing a worker.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> BoxError {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic in user handler".to_owned());
    msg.into()
}

/// Synthetic cause attached to a download failure when the HTTP status
/// code is in the configured retry set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed status code: {0}")]
pub struct FailedStatusCode(pub u16);

/// Discriminant of a [`SpiderError`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The pre-download chain dropped the request.
    RequestIgnored,
    /// The post-download chain dropped the response.
    ResponseIgnored,
    /// The HTTP call failed or returned a retry-code status.
    Download,
    /// The parse callback failed.
    Parse,
    /// A pipe handler failed.
    Pipe,
    /// Anything else (for example a session that would not close).
    Generic,
}

/// Error produced while crawling.
///
/// Variants carry the request or replacement request where the dispatcher
/// needs them for retry or re-enqueue decisions.
#[derive(Error)]
pub enum SpiderError<S: Spider> {
    /// The pre-download chain chose to drop the request. Counts as a
    /// completed request; never retried.
    #[error("request was ignored: {url}")]
    RequestIgnored {
        /// URL of the dropped request.
        url: String,
        /// The request as it was before the chain ran.
        req: Box<Request<S>>,
        /// Present when a handler failed rather than declined.
        #[source]
        cause: Option<BoxError>,
    },

    /// The post-download chain chose to drop the response, optionally
    /// substituting a fresh request.
    #[error("response was ignored: {url}")]
    ResponseIgnored {
        /// URL of the dropped response.
        url: String,
        /// Replacement request to enqueue, if the chain supplied one.
        new_req: Option<Box<Request<S>>>,
        #[source]
        cause: Option<BoxError>,
    },

    /// The HTTP call failed, or the status code was in the retry set.
    #[error("cannot download from {url}")]
    Download {
        /// URL that failed to download.
        url: String,
        /// The request, kept so the dispatcher can re-enqueue it.
        req: Box<Request<S>>,
        /// Whether the failure looks transient (connection error, timeout,
        /// or a configured retry-code status).
        need_retry: bool,
        #[source]
        cause: BoxError,
    },

    /// The parse callback returned an error; the response is abandoned.
    #[error("cannot parse response from {url}")]
    Parse {
        url: String,
        /// The response whose parse failed.
        res: Arc<Response<S>>,
        #[source]
        cause: BoxError,
    },

    /// A pipe handler returned an error; the single item is abandoned.
    #[error("cannot collect results from {url}")]
    Pipe {
        url: String,
        #[source]
        cause: BoxError,
    },

    /// Catch-all for failures outside the fetch path.
    #[error("{msg}")]
    Generic {
        msg: String,
        #[source]
        cause: Option<BoxError>,
    },
}

impl<S: Spider> SpiderError<S> {
    pub(crate) fn request_ignored(req: Request<S>, cause: Option<BoxError>) -> Self {
        Self::RequestIgnored {
            url: req.url.clone(),
            req: Box::new(req),
            cause,
        }
    }

    pub(crate) fn response_ignored(
        url: impl Into<String>,
        new_req: Option<Request<S>>,
        cause: Option<BoxError>,
    ) -> Self {
        Self::ResponseIgnored {
            url: url.into(),
            new_req: new_req.map(Box::new),
            cause,
        }
    }

    pub(crate) fn download(req: Request<S>, cause: BoxError, need_retry: bool) -> Self {
        Self::Download {
            url: req.url.clone(),
            req: Box::new(req),
            need_retry,
            cause,
        }
    }

    pub(crate) fn parse(res: Arc<Response<S>>, cause: BoxError) -> Self {
        Self::Parse {
            url: res.url().to_string(),
            res,
            cause,
        }
    }

    pub(crate) fn pipe(url: impl Into<String>, cause: BoxError) -> Self {
        Self::Pipe {
            url: url.into(),
            cause,
        }
    }

    /// Creates a catch-all error with an optional underlying cause.
    pub fn generic(msg: impl Into<String>, cause: Option<BoxError>) -> Self {
        Self::Generic {
            msg: msg.into(),
            cause,
        }
    }

    /// Returns the variant tag of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RequestIgnored { .. } => ErrorKind::RequestIgnored,
            Self::ResponseIgnored { .. } => ErrorKind::ResponseIgnored,
            Self::Download { .. } => ErrorKind::Download,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Pipe { .. } => ErrorKind::Pipe,
            Self::Generic { .. } => ErrorKind::Generic,
        }
    }

    /// Returns the URL the error relates to, when there is one.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::RequestIgnored { url, .. }
            | Self::ResponseIgnored { url, .. }
            | Self::Download { url, .. }
            | Self::Parse { url, .. }
            | Self::Pipe { url, .. } => Some(url),
            Self::Generic { .. } => None,
        }
    }

    /// Returns the underlying cause, when there is one.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::RequestIgnored { cause, .. }
            | Self::ResponseIgnored { cause, .. }
            | Self::Generic { cause, .. } => cause.as_deref(),
            Self::Download { cause, .. } | Self::Parse { cause, .. } | Self::Pipe { cause, .. } => {
                Some(cause.as_ref())
            }
        }
    }

    /// Whether a download failure is marked as transient.
    ///
    /// Always false for non-download errors.
    #[must_use]
    pub fn need_retry(&self) -> bool {
        matches!(self, Self::Download { need_retry: true, .. })
    }

    /// The request attached to this error, when one is carried.
    #[must_use]
    pub fn req(&self) -> Option<&Request<S>> {
        match self {
            Self::RequestIgnored { req, .. } | Self::Download { req, .. } => Some(req),
            Self::Parse { res, .. } => Some(res.req()),
            _ => None,
        }
    }

    /// The response attached to this error, when one is carried.
    #[must_use]
    pub fn res(&self) -> Option<&Response<S>> {
        match self {
            Self::Parse { res, .. } => Some(res),
            _ => None,
        }
    }

    /// The replacement request of a dropped response, when one was set.
    #[must_use]
    pub fn new_req(&self) -> Option<&Request<S>> {
        match self {
            Self::ResponseIgnored { new_req, .. } => new_req.as_deref(),
            _ => None,
        }
    }
}

impl<S: Spider> std::fmt::Debug for SpiderError<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("SpiderError");
        dbg.field("kind", &self.kind());
        if let Some(url) = self.url() {
            dbg.field("url", &url);
        }
        if let Some(cause) = self.cause() {
            dbg.field("cause", &cause);
        }
        if self.need_retry() {
            dbg.field("need_retry", &true);
        }
        dbg.finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::{Entry, Request};
    use crate::response::Response;
    use crate::spider::{ParseResult, Spider};

    struct NullSpider;

    impl Spider for NullSpider {
        type Item = String;

        fn entry(&self) -> Entry<Self> {
            Entry::none()
        }

        fn parse(&self, _res: &Response<Self>) -> ParseResult<Self> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn request_ignored_display_contains_url() {
        let req: Request<NullSpider> = Request::get("https://example.com/a");
        let err = SpiderError::request_ignored(req, None);
        assert_eq!(err.to_string(), "request was ignored: https://example.com/a");
        assert_eq!(err.kind(), ErrorKind::RequestIgnored);
        assert!(err.cause().is_none());
        assert!(err.req().is_some());
    }

    #[test]
    fn download_error_carries_retry_flag_and_request() {
        let req: Request<NullSpider> = Request::get("https://example.com/b");
        let err = SpiderError::download(req, Box::new(FailedStatusCode(503)), true);
        assert!(err.need_retry());
        assert_eq!(err.url(), Some("https://example.com/b"));
        assert_eq!(err.cause().unwrap().to_string(), "failed status code: 503");
    }

    #[test]
    fn response_ignored_keeps_replacement_request() {
        let new_req: Request<NullSpider> = Request::get("https://example.com/next");
        let err = SpiderError::response_ignored("https://example.com/orig", Some(new_req), None);
        assert_eq!(err.kind(), ErrorKind::ResponseIgnored);
        assert_eq!(err.new_req().unwrap().url, "https://example.com/next");
    }

    #[test]
    fn generic_error_uses_message() {
        let err: SpiderError<NullSpider> = SpiderError::generic("cannot close session", None);
        assert_eq!(err.to_string(), "cannot close session");
        assert!(err.url().is_none());
    }

    #[test]
    fn failed_status_code_display() {
        assert_eq!(FailedStatusCode(429).to_string(), "failed status code: 429");
    }
}
