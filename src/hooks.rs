//! Hook chains: pre-download, post-download, and the item pipeline.
//!
//! Three ordered chains of user handlers are bound per spider when the
//! crawler is constructed and are immutable afterwards. Handlers compose:
//! each receives the value the previous one produced. A chain can drop the
//! value (silently, with no cause) or fail it (with a cause); the
//! post-download chain can additionally substitute a fresh request for the
//! response.
//!
//! Handlers register through the [`Hooks`] builder, either as closures or
//! as [`Middleware`] objects whose unimplemented methods default to the
//! identity.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::{BoxError, SpiderError, panic_message};
use crate::request::Request;
use crate::response::Response;
use crate::spider::Spider;

/// Outcome of one post-download handler.
pub enum AfterVerdict<S: Spider> {
    /// Keep (possibly transformed) and continue the chain.
    Keep(Response<S>),
    /// Drop the response and enqueue this request in its place.
    Replace(Request<S>),
    /// Drop the response silently.
    Discard,
}

type BeforeFn<S> =
    Arc<dyn Fn(&S, Request<S>) -> Result<Option<Request<S>>, BoxError> + Send + Sync>;
type AfterFn<S> =
    Arc<dyn Fn(&S, Response<S>) -> Result<AfterVerdict<S>, BoxError> + Send + Sync>;

type ItemPipeFn<S> = Arc<
    dyn Fn(&S, <S as Spider>::Item) -> Result<Option<<S as Spider>::Item>, BoxError>
        + Send
        + Sync,
>;
type ResponsePipeFn<S> = Arc<
    dyn Fn(&S, <S as Spider>::Item, &Response<S>) -> Result<Option<<S as Spider>::Item>, BoxError>
        + Send
        + Sync,
>;

/// A pipe handler in one of its two shapes: item-only, or item plus the
/// response it came from.
enum PipeFn<S: Spider> {
    Item(ItemPipeFn<S>),
    WithResponse(ResponsePipeFn<S>),
}

/// An object installed on both download chains at once.
///
/// Both methods default to the identity, so an implementation overrides
/// only the direction it cares about.
pub trait Middleware<S: Spider>: Send + Sync + 'static {
    /// Transform or drop a request before it is fetched.
    ///
    /// # Errors
    ///
    /// An error aborts the chain and ignores the request, carrying the
    /// error as the cause.
    fn before_download(&self, spider: &S, req: Request<S>) -> Result<Option<Request<S>>, BoxError> {
        let _ = spider;
        Ok(Some(req))
    }

    /// Transform, drop, or replace a response after it is fetched.
    ///
    /// # Errors
    ///
    /// An error aborts the chain and ignores the response, carrying the
    /// error as the cause.
    fn after_download(&self, spider: &S, res: Response<S>) -> Result<AfterVerdict<S>, BoxError> {
        let _ = spider;
        Ok(AfterVerdict::Keep(res))
    }
}

/// The three hook chains of a spider, built fluently.
pub struct Hooks<S: Spider> {
    before: Vec<BeforeFn<S>>,
    after: Vec<AfterFn<S>>,
    pipes: Vec<PipeFn<S>>,
}

impl<S: Spider> Default for Hooks<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Spider> Hooks<S> {
    /// Empty chains.
    #[must_use]
    pub fn new() -> Self {
        Self {
            before: Vec::new(),
            after: Vec::new(),
            pipes: Vec::new(),
        }
    }

    /// Appends a pre-download handler.
    ///
    /// Returning `Ok(None)` drops the request silently; an error drops it
    /// with that cause.
    #[must_use]
    pub fn before_download<F>(mut self, handler: F) -> Self
    where
        F: Fn(&S, Request<S>) -> Result<Option<Request<S>>, BoxError> + Send + Sync + 'static,
    {
        self.before.push(Arc::new(handler));
        self
    }

    /// Appends a post-download handler.
    #[must_use]
    pub fn after_download<F>(mut self, handler: F) -> Self
    where
        F: Fn(&S, Response<S>) -> Result<AfterVerdict<S>, BoxError> + Send + Sync + 'static,
    {
        self.after.push(Arc::new(handler));
        self
    }

    /// Appends an item-only pipe handler. Returning `Ok(None)` stops the
    /// chain and drops the item silently.
    #[must_use]
    pub fn pipe<F>(mut self, handler: F) -> Self
    where
        F: Fn(&S, S::Item) -> Result<Option<S::Item>, BoxError> + Send + Sync + 'static,
    {
        self.pipes.push(PipeFn::Item(Arc::new(handler)));
        self
    }

    /// Appends a pipe handler that also receives the response the item
    /// was extracted from.
    #[must_use]
    pub fn pipe_with_response<F>(mut self, handler: F) -> Self
    where
        F: Fn(&S, S::Item, &Response<S>) -> Result<Option<S::Item>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.pipes.push(PipeFn::WithResponse(Arc::new(handler)));
        self
    }

    /// Installs a [`Middleware`] object on both download chains.
    #[must_use]
    pub fn install(mut self, middleware: Arc<dyn Middleware<S>>) -> Self {
        let before = Arc::clone(&middleware);
        self.before
            .push(Arc::new(move |spider, req| before.before_download(spider, req)));
        self.after
            .push(Arc::new(move |spider, res| middleware.after_download(spider, res)));
        self
    }

    /// Appends all handlers of another chain set after this one's, the
    /// way a derived spider extends a base spider's chains.
    #[must_use]
    pub fn extend(mut self, more: Hooks<S>) -> Self {
        self.before.extend(more.before);
        self.after.extend(more.after);
        self.pipes.extend(more.pipes);
        self
    }
}

/// Runs the pre-download chain. Aborting ignores the request as it was
/// before the chain ran.
pub(crate) fn run_before<S: Spider>(
    spider: &S,
    hooks: &Hooks<S>,
    req: Request<S>,
) -> Result<Request<S>, SpiderError<S>> {
    if hooks.before.is_empty() {
        return Ok(req);
    }
    let original = req.clone();
    let mut rv = req;
    for handler in &hooks.before {
        match catch_unwind(AssertUnwindSafe(move || handler(spider, rv))) {
            Ok(Ok(Some(next))) => rv = next,
            Ok(Ok(None)) => return Err(SpiderError::request_ignored(original, None)),
            Ok(Err(cause)) => return Err(SpiderError::request_ignored(original, Some(cause))),
            Err(payload) => {
                return Err(SpiderError::request_ignored(
                    original,
                    Some(panic_message(payload)),
                ));
            }
        }
    }
    Ok(rv)
}

/// Runs the post-download chain.
pub(crate) fn run_after<S: Spider>(
    spider: &S,
    hooks: &Hooks<S>,
    res: Response<S>,
) -> Result<Response<S>, SpiderError<S>> {
    let url = res.url().to_string();
    let mut rv = res;
    for handler in &hooks.after {
        match catch_unwind(AssertUnwindSafe(move || handler(spider, rv))) {
            Ok(Ok(AfterVerdict::Keep(next))) => rv = next,
            Ok(Ok(AfterVerdict::Replace(new_req))) => {
                return Err(SpiderError::response_ignored(url, Some(new_req), None));
            }
            Ok(Ok(AfterVerdict::Discard)) => {
                return Err(SpiderError::response_ignored(url, None, None));
            }
            Ok(Err(cause)) => {
                return Err(SpiderError::response_ignored(url, None, Some(cause)));
            }
            Err(payload) => {
                return Err(SpiderError::response_ignored(
                    url,
                    None,
                    Some(panic_message(payload)),
                ));
            }
        }
    }
    Ok(rv)
}

/// Runs the pipe chain over one item. `Ok(None)` means some handler
/// dropped the item; `Ok(Some)` is the final value for collection.
pub(crate) fn run_pipes<S: Spider>(
    spider: &S,
    hooks: &Hooks<S>,
    item: S::Item,
    res: &Response<S>,
) -> Result<Option<S::Item>, BoxError> {
    let mut rv = item;
    for pipe in &hooks.pipes {
        let result = catch_unwind(AssertUnwindSafe(move || match pipe {
            PipeFn::Item(handler) => handler(spider, rv),
            PipeFn::WithResponse(handler) => handler(spider, rv, res),
        }));
        match result {
            Ok(Ok(Some(value))) => rv = value,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(cause)) => return Err(cause),
            Err(payload) => return Err(panic_message(payload)),
        }
    }
    Ok(Some(rv))
}
