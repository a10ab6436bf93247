//! The request record and seed polymorphism.
//!
//! A [`Request`] is a plain record describing one fetch: the URL and verb,
//! the HTTP knobs, an optional parse callback, the session policy, and the
//! opaque user state that rides along to the resulting response. Records
//! are built fluently and mutated freely by pre-download handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use url::Url;

use crate::session::{Session, SessionConfig};
use crate::spider::{ParseFn, Spider};

/// Opaque user state carried from a request onto its response.
pub type State = HashMap<String, Value>;

/// How a request relates to a stateful session.
#[derive(Debug, Clone, Default)]
pub enum SessionPolicy {
    /// No session of its own; adopts the parent response's session when
    /// yielded from a parse, otherwise runs stateless.
    #[default]
    Auto,
    /// Never attach a session, even when the parent response has one.
    Disabled,
    /// Create a fresh session for this request.
    New,
    /// Share an existing session handle.
    Bound(Arc<Session>),
    /// Create a fresh session with the given attributes.
    Configured(SessionConfig),
}

/// Body of a request.
#[derive(Debug, Clone, Default)]
pub(crate) enum Payload {
    #[default]
    None,
    Bytes(Vec<u8>),
    Form(Vec<(String, String)>),
    Json(Value),
    Multipart(Vec<FilePart>),
}

/// One file in a multipart upload.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Form field name.
    pub name: String,
    /// File name reported to the server.
    pub filename: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

/// An instruction to fetch one resource.
///
/// The type parameter ties the optional parse callback to the spider that
/// will receive the response.
pub struct Request<S: Spider> {
    /// Target URL. May be relative when yielded from a parse; it is
    /// resolved against the response URL before enqueueing.
    pub url: String,
    /// HTTP verb, GET by default.
    pub method: Method,
    /// Request headers. Configured defaults and a derived `Host` are
    /// merged in at enqueue time without overwriting these.
    pub headers: HeaderMap,
    /// Query string parameters.
    pub query: Vec<(String, String)>,
    /// Cookie pairs sent with this single request.
    pub cookies: Vec<(String, String)>,
    /// Proxy URL for this request alone.
    pub proxy: Option<String>,
    /// Whether TLS certificates are verified.
    pub verify: bool,
    /// Total timeout override for this request.
    pub timeout: Option<Duration>,
    /// Parse callback; the spider's `parse` is used when absent.
    pub callback: Option<ParseFn<S>>,
    /// Session policy.
    pub session: SessionPolicy,
    /// Opaque user state, copied onto the response.
    pub state: State,
    pub(crate) payload: Payload,
    pub(crate) retry_num: u32,
}

impl<S: Spider> Request<S> {
    /// Creates a GET request.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: HeaderMap::new(),
            query: Vec::new(),
            cookies: Vec::new(),
            proxy: None,
            verify: true,
            timeout: None,
            callback: None,
            session: SessionPolicy::Auto,
            state: State::new(),
            payload: Payload::None,
            retry_num: 0,
        }
    }

    /// Alias of [`new`](Self::new).
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url)
    }

    /// Creates a POST request.
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(url).method(Method::POST)
    }

    /// Sets the HTTP verb.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a header. Invalid names or values are ignored.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Adds a query string parameter.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets a form-encoded body.
    #[must_use]
    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.payload = Payload::Form(fields);
        self
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.payload = Payload::Json(body);
        self
    }

    /// Sets a raw body.
    #[must_use]
    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = Payload::Bytes(bytes.into());
        self
    }

    /// Sets a multipart body from file parts.
    #[must_use]
    pub fn files(mut self, parts: Vec<FilePart>) -> Self {
        self.payload = Payload::Multipart(parts);
        self
    }

    /// Adds a cookie pair for this single request.
    #[must_use]
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Routes this request through a proxy.
    #[must_use]
    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.proxy = Some(url.into());
        self
    }

    /// Disables or enables TLS certificate verification.
    #[must_use]
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Overrides the total timeout for this request.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Binds a parse callback for the resulting response.
    #[must_use]
    pub fn callback(mut self, callback: ParseFn<S>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Sets the session policy.
    #[must_use]
    pub fn session(mut self, policy: SessionPolicy) -> Self {
        self.session = policy;
        self
    }

    /// Replaces the user state carried to the response.
    #[must_use]
    pub fn state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    /// Inserts one entry into the user state.
    #[must_use]
    pub fn state_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.state.insert(key.into(), value.into());
        self
    }

    /// Whether this is a unique request or the first of a session, as
    /// opposed to one riding on an adopted session handle.
    #[must_use]
    pub fn initial(&self) -> bool {
        !matches!(self.session, SessionPolicy::Bound(_))
    }

    /// How many times this request has been re-enqueued after a
    /// transient failure.
    #[must_use]
    pub fn retry_num(&self) -> u32 {
        self.retry_num
    }

    /// Merges configured default headers plus a derived `Host`, never
    /// overwriting a value the user already set.
    pub(crate) fn apply_default_headers(&mut self, defaults: &HeaderMap) {
        for (name, value) in defaults {
            if !self.headers.contains_key(name) {
                self.headers.insert(name.clone(), value.clone());
            }
        }
        if !self.headers.contains_key(header::HOST) {
            if let Some(host) = derive_host(&self.url) {
                if let Ok(value) = HeaderValue::from_str(&host) {
                    self.headers.insert(header::HOST, value);
                }
            }
        }
    }
}

fn derive_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_owned();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

impl<S: Spider> Clone for Request<S> {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            cookies: self.cookies.clone(),
            proxy: self.proxy.clone(),
            verify: self.verify,
            timeout: self.timeout,
            callback: self.callback,
            session: self.session.clone(),
            state: self.state.clone(),
            payload: self.payload.clone(),
            retry_num: self.retry_num,
        }
    }
}

impl<S: Spider> fmt::Debug for Request<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("retry_num", &self.retry_num)
            .field("session", &self.session)
            .field("callback", &self.callback.map(|_| "fn"))
            .finish_non_exhaustive()
    }
}

/// Seed requests for a crawl, produced by [`Spider::entry`].
///
/// Accepts a single URL, a single request, or collections of either, so
/// spiders can write the simplest form that fits.
///
/// [`Spider::entry`]: crate::spider::Spider::entry
pub struct Entry<S: Spider>(Vec<Request<S>>);

impl<S: Spider> Entry<S> {
    /// No seeds; the crawl finishes immediately.
    #[must_use]
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn into_requests(self) -> Vec<Request<S>> {
        self.0
    }
}

impl<S: Spider> From<&str> for Entry<S> {
    fn from(url: &str) -> Self {
        Self(vec![Request::new(url)])
    }
}

impl<S: Spider> From<String> for Entry<S> {
    fn from(url: String) -> Self {
        Self(vec![Request::new(url)])
    }
}

impl<S: Spider> From<Request<S>> for Entry<S> {
    fn from(req: Request<S>) -> Self {
        Self(vec![req])
    }
}

impl<S: Spider> From<Vec<Request<S>>> for Entry<S> {
    fn from(reqs: Vec<Request<S>>) -> Self {
        Self(reqs)
    }
}

impl<S: Spider> From<Vec<&str>> for Entry<S> {
    fn from(urls: Vec<&str>) -> Self {
        urls.into_iter().map(Request::new).collect()
    }
}

impl<S: Spider> From<Vec<String>> for Entry<S> {
    fn from(urls: Vec<String>) -> Self {
        urls.into_iter().map(Request::new).collect()
    }
}

impl<S: Spider> FromIterator<Request<S>> for Entry<S> {
    fn from_iter<I: IntoIterator<Item = Request<S>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::response::Response;
    use crate::spider::ParseResult;

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
    fn get_is_the_default_method() {
        let req: Request<NullSpider> = Request::new("https://example.com");
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.retry_num(), 0);
        assert!(req.initial());
    }

    #[test]
    fn builder_accumulates_knobs() {
        let req: Request<NullSpider> = Request::post("https://example.com/login")
            .header("x-token", "abc")
            .query("page", "2")
            .cookie("sid", "1")
            .timeout(Duration::from_secs(5))
            .state_entry("k", "v");
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.headers.get("x-token").unwrap(), "abc");
        assert_eq!(req.query, vec![("page".to_owned(), "2".to_owned())]);
        assert_eq!(req.cookies, vec![("sid".to_owned(), "1".to_owned())]);
        assert_eq!(req.timeout, Some(Duration::from_secs(5)));
        assert_eq!(req.state.get("k").unwrap(), "v");
    }

    #[test]
    fn default_headers_do_not_overwrite_user_values() {
        let mut defaults = HeaderMap::new();
        defaults.insert("user-agent", "default-agent".parse().unwrap());
        defaults.insert("accept", "text/html".parse().unwrap());

        let mut req: Request<NullSpider> =
            Request::new("https://example.com/a").header("user-agent", "mine");
        req.apply_default_headers(&defaults);

        assert_eq!(req.headers.get("user-agent").unwrap(), "mine");
        assert_eq!(req.headers.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn host_header_derived_from_url() {
        let mut req: Request<NullSpider> = Request::new("https://example.com:8080/path");
        req.apply_default_headers(&HeaderMap::new());
        assert_eq!(req.headers.get(header::HOST).unwrap(), "example.com:8080");

        let mut plain: Request<NullSpider> = Request::new("https://example.com/path");
        plain.apply_default_headers(&HeaderMap::new());
        assert_eq!(plain.headers.get(header::HOST).unwrap(), "example.com");
    }

    #[test]
    fn host_not_derived_for_relative_urls() {
        let mut req: Request<NullSpider> = Request::new("/relative/path");
        req.apply_default_headers(&HeaderMap::new());
        assert!(!req.headers.contains_key(header::HOST));
    }

    #[test]
    fn entry_accepts_all_seed_shapes() {
        let from_str: Entry<NullSpider> = "https://example.com".into();
        assert_eq!(from_str.into_requests().len(), 1);

        let from_req: Entry<NullSpider> = Request::new("https://example.com").into();
        assert_eq!(from_req.into_requests().len(), 1);

        let from_urls: Entry<NullSpider> = vec!["https://a.com", "https://b.com"].into();
        let reqs = from_urls.into_requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].url, "https://a.com");

        let from_reqs: Entry<NullSpider> =
            vec![Request::new("https://a.com"), Request::post("https://b.com")].into();
        assert_eq!(from_reqs.into_requests()[1].method, Method::POST);

        assert!(Entry::<NullSpider>::none().into_requests().is_empty());
    }
}
