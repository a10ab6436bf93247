//! The spider trait, the user-facing surface of the framework.
//!
//! A crawler is declared by implementing [`Spider`]: provide the seed
//! requests and a parse function, optionally override collection, the
//! lifecycle hooks, the configuration, or the hook chains. Everything else
//! is driven by [`Crawler`].
//!
//! ```no_run
//! use spinneret::{Crawler, Entry, Parsed, Request, Response, Spider};
//! use spinneret::spider::ParseResult;
//!
//! struct Quotes;
//!
//! impl Spider for Quotes {
//!     type Item = String;
//!
//!     fn entry(&self) -> Entry<Self> {
//!         "https://quotes.toscrape.com".into()
//!     }
//!
//!     fn parse(&self, res: &Response<Self>) -> ParseResult<Self> {
//!         let mut out = Vec::new();
//!         for quote in res.select(".quote .text")? {
//!             out.push(Parsed::Item(quote.text().to_owned()));
//!         }
//!         for page in res.select(".next a")? {
//!             out.push(Parsed::Request(Request::new(&page["href"])));
//!         }
//!         Ok(out)
//!     }
//! }
//!
//! # async fn run() -> Result<(), spinneret::ConfigError> {
//! let _stats = Crawler::new(Quotes)?.run().await;
//! # Ok(())
//! # }
//! ```
//!
//! [`Crawler`]: crate::crawl::Crawler

use std::fmt::Debug;

use tracing::{error, info};

use crate::config::Config;
use crate::error::{BoxError, SpiderError};
use crate::hooks::Hooks;
use crate::request::{Entry, Request};
use crate::response::Response;

/// One value yielded by a parse: either a follow-up request or an
/// extracted item.
pub enum Parsed<S: Spider> {
    /// A request to enqueue. Relative URLs are resolved against the
    /// response that yielded them.
    Request(Request<S>),
    /// An item for the collection pipeline.
    Item(S::Item),
}

impl<S: Spider> From<Request<S>> for Parsed<S> {
    fn from(req: Request<S>) -> Self {
        Self::Request(req)
    }
}

/// What a parse invocation produces. An `Err` is reported as a parse
/// error and the response is abandoned.
pub type ParseResult<S> = Result<Vec<Parsed<S>>, BoxError>;

/// A parse callback bound to a request.
pub type ParseFn<S> = fn(&S, &Response<S>) -> ParseResult<S>;

/// A declarative crawler.
///
/// Shared by the dispatcher and every fetcher, so implementations hold
/// mutable run state behind interior mutability (atomics or mutexes).
pub trait Spider: Sized + Send + Sync + 'static {
    /// The item type extracted by parsing.
    type Item: Send + Debug + 'static;

    /// Seed requests. Accepts a URL, a request, or collections of either
    /// through the [`Entry`] conversions.
    fn entry(&self) -> Entry<Self>;

    /// Turns a response into follow-up requests and extracted items.
    fn parse(&self, res: &Response<Self>) -> ParseResult<Self>;

    /// Receives each item after the pipe chain has run. Logs by default.
    fn collect(&self, item: Self::Item) {
        info!(item = ?item, "collected");
    }

    /// Crawl configuration; defaults throughout.
    fn config(&self) -> Config {
        Config::default()
    }

    /// Hook chains for this spider; empty by default.
    fn hooks(&self) -> Hooks<Self> {
        Hooks::new()
    }

    /// Called once before the first request is issued.
    fn on_start(&self) {}

    /// Called once after the crawl has drained.
    fn on_finish(&self) {}

    /// Receives every reported error. Logs at ERROR by default.
    fn on_error(&self, err: &SpiderError<Self>) {
        match err.cause() {
            Some(cause) => error!(%err, %cause, "crawl error"),
            None => error!(%err, "crawl error"),
        }
    }
}
