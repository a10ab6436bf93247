//! The response record and HTML extraction helpers.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::ops::Index;
use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::error::BoxError;
use crate::request::{Request, State};
use crate::session::Session;
use crate::spider::Spider;

/// A CSS selector that failed to parse.
#[derive(Debug, Error)]
#[error("invalid CSS selector: {selector}")]
pub struct InvalidSelector {
    /// The selector as written.
    pub selector: String,
}

/// Owned snapshot of one HTML element matched by [`Response::select`].
#[derive(Debug, Clone)]
pub struct Element {
    text: String,
    html: String,
    attrs: HashMap<String, String>,
}

impl Element {
    /// Concatenated text content of the element.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The element serialized back to HTML.
    #[must_use]
    pub fn html(&self) -> &str {
        &self.html
    }

    /// An attribute value, when present.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

impl Index<&str> for Element {
    type Output = str;

    /// Attribute access by name.
    ///
    /// # Panics
    ///
    /// Panics when the attribute is missing; use [`attr`](Self::attr) for
    /// a fallible lookup.
    fn index(&self, name: &str) -> &str {
        match self.attrs.get(name) {
            Some(value) => value,
            None => panic!("element has no attribute {name:?}"),
        }
    }
}

/// Result of a successful fetch.
///
/// Carries the HTTP outcome plus the originating [`Request`], the user
/// state it inherited, and the session handle when one was used. The
/// request-to-response reference is one-way by design.
pub struct Response<S: Spider> {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) url: Url,
    pub(crate) body: Vec<u8>,
    pub(crate) req: Request<S>,
    pub(crate) session: Option<Arc<Session>>,
}

impl<S: Spider> Response<S> {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        url: Url,
        body: Vec<u8>,
        req: Request<S>,
        session: Option<Arc<Session>>,
    ) -> Self {
        Self {
            status,
            headers,
            url,
            body,
            req,
            session,
        }
    }

    /// HTTP status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL after redirects.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Raw response body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, lossily.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Body deserialized from JSON.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error when the body is not valid JSON
    /// for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The request that produced this response.
    #[must_use]
    pub fn req(&self) -> &Request<S> {
        &self.req
    }

    /// User state inherited from the request.
    #[must_use]
    pub fn state(&self) -> &State {
        &self.req.state
    }

    /// The session this response was fetched on, if any.
    #[must_use]
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Parses the body as HTML and returns snapshots of the elements
    /// matching a CSS selector.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSelector`] when the selector does not parse.
    pub fn select(&self, selector: &str) -> Result<Vec<Element>, BoxError> {
        let parsed = Selector::parse(selector).map_err(|_| InvalidSelector {
            selector: selector.to_owned(),
        })?;
        let document = Html::parse_document(&self.text());
        Ok(document
            .select(&parsed)
            .map(|el| Element {
                text: el.text().collect(),
                html: el.html(),
                attrs: el
                    .value()
                    .attrs()
                    .map(|(name, value)| (name.to_owned(), value.to_owned()))
                    .collect(),
            })
            .collect())
    }
}

impl<S: Spider> fmt::Debug for Response<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}
