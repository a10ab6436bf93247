//! The fetcher pool.
//!
//! Each fetcher drains the request queue in a loop: rate-limit, run the
//! pre-download chain, perform the HTTP call, classify the status, run
//! the post-download chain, and publish exactly one outcome per dequeued
//! request onto the response channel. That one-outcome discipline is what
//! lets the dispatcher detect completion by counter equality.

use std::sync::Arc;

use reqwest::header::{COOKIE, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::error::{FailedStatusCode, SpiderError};
use crate::hooks::{self, Hooks};
use crate::request::{Payload, Request, SessionPolicy};
use crate::response::Response;
use crate::session::{self, Session, SessionConfig};
use crate::spider::Spider;

use super::limiter::RateLimiter;
use super::queue::DelayQueue;

/// What a fetcher publishes for every dequeued request.
pub(crate) type FetchOutcome<S> = Result<Response<S>, SpiderError<S>>;

/// Everything a fetcher shares with the rest of the engine.
pub(crate) struct FetcherCtx<S: Spider> {
    pub(crate) spider: Arc<S>,
    pub(crate) hooks: Arc<Hooks<S>>,
    pub(crate) config: Arc<Config>,
    pub(crate) client: Client,
    pub(crate) queue: Arc<DelayQueue<Request<S>>>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) outcomes: mpsc::UnboundedSender<FetchOutcome<S>>,
}

/// One fetcher's loop. Runs until the queue or the dispatcher goes away.
pub(crate) async fn run_fetcher<S: Spider>(ctx: Arc<FetcherCtx<S>>) {
    loop {
        let Some(req) = ctx.queue.get().await else {
            break;
        };

        ctx.limiter.acquire().await;

        let req = match hooks::run_before(ctx.spider.as_ref(), &ctx.hooks, req) {
            Ok(req) => req,
            Err(err) => {
                if ctx.outcomes.send(Err(err)).is_err() {
                    break;
                }
                continue;
            }
        };

        let res = match send(&ctx, req).await {
            Ok(res) => res,
            Err(err) => {
                if ctx.outcomes.send(Err(err)).is_err() {
                    break;
                }
                continue;
            }
        };

        let outcome = match hooks::run_after(ctx.spider.as_ref(), &ctx.hooks, res) {
            Ok(res) => Ok(res),
            Err(err) => Err(err),
        };
        if ctx.outcomes.send(outcome).is_err() {
            break;
        }
    }
}

/// Performs the HTTP call for one request.
///
/// Failures come back as download errors; connection errors, timeouts,
/// and configured retry-code statuses are marked retryable.
async fn send<S: Spider>(
    ctx: &FetcherCtx<S>,
    req: Request<S>,
) -> Result<Response<S>, SpiderError<S>> {
    let session = match open_session(ctx, &req) {
        Ok(session) => session,
        Err(cause) => return Err(SpiderError::download(req, Box::new(cause), false)),
    };

    let one_off;
    let client = if let Some(session) = &session {
        session.client()
    } else if req.verify && req.proxy.is_none() {
        &ctx.client
    } else {
        match session::build_bare_client(&ctx.config, req.verify, req.proxy.as_deref()) {
            Ok(client) => {
                one_off = client;
                &one_off
            }
            Err(cause) => return Err(SpiderError::download(req, Box::new(cause), false)),
        }
    };

    let url = match Url::parse(&req.url) {
        Ok(url) => url,
        Err(cause) => return Err(SpiderError::download(req, Box::new(cause), false)),
    };

    let builder = build_request(client.request(req.method.clone(), url), &req);

    let started = Instant::now();
    let http_res = match builder.send().await {
        Ok(res) => res,
        Err(cause) => {
            let need_retry = cause.is_timeout() || cause.is_connect();
            return Err(SpiderError::download(req, Box::new(cause), need_retry));
        }
    };

    let status = http_res.status();
    info!(
        "\"{} {}\" {} {:.2}s",
        req.method,
        req.url,
        status.as_u16(),
        started.elapsed().as_secs_f64()
    );

    if ctx.config.retry_codes.contains(&status.as_u16()) {
        debug!(status = status.as_u16(), url = %req.url, "status in retry set");
        return Err(SpiderError::download(
            req,
            Box::new(FailedStatusCode(status.as_u16())),
            true,
        ));
    }

    let final_url = http_res.url().clone();
    let headers = http_res.headers().clone();
    let body = match http_res.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(cause) => {
            let need_retry = cause.is_timeout();
            return Err(SpiderError::download(req, Box::new(cause), need_retry));
        }
    };

    Ok(Response::new(status, headers, final_url, body, req, session))
}

/// Resolves the request's session policy to a live handle, when one is
/// called for.
fn open_session<S: Spider>(
    ctx: &FetcherCtx<S>,
    req: &Request<S>,
) -> Result<Option<Arc<Session>>, reqwest::Error> {
    match &req.session {
        SessionPolicy::Bound(session) => Ok(Some(Arc::clone(session))),
        SessionPolicy::New => Session::open(&ctx.config, &SessionConfig::default()).map(Some),
        SessionPolicy::Configured(attrs) => Session::open(&ctx.config, attrs).map(Some),
        SessionPolicy::Auto | SessionPolicy::Disabled => Ok(None),
    }
}

/// Applies headers, query, body, cookies, and the timeout override.
fn build_request<S: Spider>(mut builder: RequestBuilder, req: &Request<S>) -> RequestBuilder {
    builder = builder.headers(req.headers.clone());
    if !req.query.is_empty() {
        builder = builder.query(&req.query);
    }
    match &req.payload {
        Payload::None => {}
        Payload::Bytes(bytes) => builder = builder.body(bytes.clone()),
        Payload::Form(fields) => builder = builder.form(fields),
        Payload::Json(value) => builder = builder.json(value),
        Payload::Multipart(parts) => {
            let mut form = Form::new();
            for part in parts {
                form = form.part(
                    part.name.clone(),
                    Part::bytes(part.bytes.clone()).file_name(part.filename.clone()),
                );
            }
            builder = builder.multipart(form);
        }
    }
    if !req.cookies.is_empty() {
        let pairs: Vec<String> = req
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        if let Ok(value) = HeaderValue::from_str(&pairs.join("; ")) {
            builder = builder.header(COOKIE, value);
        }
    }
    if let Some(timeout) = req.timeout {
        builder = builder.timeout(timeout);
    }
    builder
}
