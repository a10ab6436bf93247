//! The crawl engine: lifecycle, dispatcher, and the event surface.
//!
//! A [`Crawler`] owns one spider and drives it to completion. The moving
//! parts are a fixed pool of fetcher tasks draining the request queue, a
//! response channel they publish into, and the single-threaded dispatcher
//! loop living here. The dispatcher is the only place that enqueues
//! requests and the only place that touches the issued/completed
//! counters, which makes completion detection a plain equality check:
//! every issued request produces exactly one outcome on the channel.
//!
//! Two consuming surfaces exist. [`Crawler::run`] drives the whole crawl,
//! routing items through the pipe chain into [`Spider::collect`] and
//! errors into [`Spider::on_error`]. [`Crawler::events`] instead exposes
//! the crawl as a stream of [`CrawlEvent`]s for callers that want the raw
//! item/error sequence.
//!
//! [`Spider::collect`]: crate::spider::Spider::collect
//! [`Spider::on_error`]: crate::spider::Spider::on_error

mod fetcher;
mod limiter;
mod queue;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use reqwest::Client;
use reqwest::header::{self, HeaderValue};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};
use url::Url;

use crate::config::{Config, ConfigError};
use crate::error::SpiderError;
use crate::hooks::{self, Hooks};
use crate::request::{Request, SessionPolicy};
use crate::response::Response;
use crate::spider::{Parsed, Spider};

use self::fetcher::FetcherCtx;
use self::limiter::RateLimiter;
use self::queue::DelayQueue;

/// Counters and failure log from one finished crawl.
#[derive(Debug, Clone, Default)]
pub struct CrawlStats {
    /// Requests that entered the queue, retries and replacements included.
    pub requests: u64,
    /// Outcomes observed on the response channel.
    pub responses: u64,
    /// How many re-enqueues the retry policy performed.
    pub retries: u64,
    /// URLs whose download failed terminally.
    pub failed_urls: Vec<String>,
}

/// One element of the crawl's event stream.
pub enum CrawlEvent<S: Spider> {
    /// An item yielded by a parse, with the response it came from.
    Item {
        item: S::Item,
        res: Arc<Response<S>>,
    },
    /// A reported error. Absorbed errors (retries, silent ignores) do not
    /// appear here.
    Error(SpiderError<S>),
}

/// Stream surface returned by [`Crawler::events`].
pub struct Events<S: Spider> {
    rx: mpsc::UnboundedReceiver<CrawlEvent<S>>,
    driver: Option<JoinHandle<CrawlStats>>,
}

impl<S: Spider> Events<S> {
    /// Waits for the engine to finish and returns its stats. Call after
    /// the stream has been drained.
    pub async fn stats(mut self) -> CrawlStats {
        match self.driver.take() {
            Some(driver) => driver.await.unwrap_or_default(),
            None => CrawlStats::default(),
        }
    }
}

impl<S: Spider> Stream for Events<S> {
    type Item = CrawlEvent<S>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<S: Spider> Drop for Events<S> {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }
}

/// Where the dispatcher delivers items and reportable errors.
enum Sink<S: Spider> {
    /// Run the pipe chain and hand the result to the spider.
    Collect,
    /// Forward raw events to a consumer.
    Forward(mpsc::UnboundedSender<CrawlEvent<S>>),
}

/// Mutable state of one dispatcher run. Only the dispatcher task touches
/// it, so plain fields are enough.
struct DriveState {
    issued: u64,
    completed: u64,
    retries: u64,
    failed_urls: Vec<String>,
}

/// Drives a [`Spider`] to completion.
pub struct Crawler<S: Spider> {
    spider: Arc<S>,
    config: Arc<Config>,
    hooks: Arc<Hooks<S>>,
    client: Client,
}

impl<S: Spider> Crawler<S> {
    /// Validates the spider's configuration and binds its hook chains.
    ///
    /// # Errors
    ///
    /// Returns the first violated configuration constraint.
    pub fn new(spider: S) -> Result<Self, ConfigError> {
        let config = spider.config();
        config.validate()?;
        let hooks = Arc::new(spider.hooks());
        let client = http_client(&config);
        Ok(Self {
            spider: Arc::new(spider),
            config: Arc::new(config),
            hooks,
            client,
        })
    }

    /// Runs the crawl to completion: `on_start`, seeds, the fetch and
    /// dispatch loop, the failed-URL summary, `on_finish`.
    ///
    /// Items go through the pipe chain and end up in [`Spider::collect`];
    /// reportable errors go to [`Spider::on_error`].
    ///
    /// [`Spider::collect`]: crate::spider::Spider::collect
    /// [`Spider::on_error`]: crate::spider::Spider::on_error
    pub async fn run(self) -> CrawlStats {
        self.lifecycle(Sink::Collect).await
    }

    /// Exposes the crawl as a stream of items and errors instead of
    /// consuming them. The pipe chain and `collect` do not run; the
    /// consumer sees raw parse output.
    #[must_use]
    pub fn events(self) -> Events<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(self.lifecycle(Sink::Forward(tx)));
        Events {
            rx,
            driver: Some(driver),
        }
    }

    async fn lifecycle(self, sink: Sink<S>) -> CrawlStats {
        let started = Instant::now();
        info!("spider is running");
        self.spider.on_start();

        let stats = self.drive(&sink).await;

        log_failed_urls(&stats.failed_urls);
        self.spider.on_finish();
        info!(
            "spider exited; running time: {:.1}s",
            started.elapsed().as_secs_f64()
        );
        stats
    }

    /// The dispatcher loop.
    async fn drive(&self, sink: &Sink<S>) -> CrawlStats {
        let queue = Arc::new(DelayQueue::new(self.config.queue_capacity));
        let limiter = Arc::new(if self.config.download_delay.is_zero() {
            RateLimiter::disabled()
        } else {
            RateLimiter::new(self.config.download_delay, self.config.random_delay)
        });
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(FetcherCtx {
            spider: Arc::clone(&self.spider),
            hooks: Arc::clone(&self.hooks),
            config: Arc::clone(&self.config),
            client: self.client.clone(),
            queue: Arc::clone(&queue),
            limiter,
            outcomes: out_tx,
        });
        let workers: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|_| tokio::spawn(fetcher::run_fetcher(Arc::clone(&ctx))))
            .collect();

        let mut state = DriveState {
            issued: 0,
            completed: 0,
            retries: 0,
            failed_urls: Vec::new(),
        };

        for req in self.spider.entry().into_requests() {
            self.enqueue(&queue, &mut state, req).await;
        }

        while state.completed < state.issued {
            let Some(outcome) = out_rx.recv().await else {
                error!("fetcher pool died before the crawl completed");
                break;
            };
            state.completed += 1;

            match outcome {
                Ok(res) => self.dispatch(res, &queue, &mut state, sink).await,
                Err(err) => {
                    if let Some(report) = self.classify(err, &queue, &mut state).await {
                        self.report(report, sink);
                    }
                }
            }
        }

        // Workers are daemon-like: no graceful drain, they die with the
        // crawl.
        for worker in &workers {
            worker.abort();
        }

        CrawlStats {
            requests: state.issued,
            responses: state.completed,
            retries: state.retries,
            failed_urls: state.failed_urls,
        }
    }

    /// Handles one successful response: choose the parser, route what it
    /// yields, settle the session.
    async fn dispatch(
        &self,
        res: Response<S>,
        queue: &Arc<DelayQueue<Request<S>>>,
        state: &mut DriveState,
        sink: &Sink<S>,
    ) {
        let res = Arc::new(res);
        let session = res.session().cloned();
        let mut close_session = session.is_some();

        let parsed = catch_unwind(AssertUnwindSafe(|| match res.req().callback {
            Some(callback) => callback(self.spider.as_ref(), res.as_ref()),
            None => self.spider.parse(res.as_ref()),
        }))
        .unwrap_or_else(|payload| Err(crate::error::panic_message(payload)));

        match parsed {
            Ok(yields) => {
                for yielded in yields {
                    match yielded {
                        Parsed::Request(mut child) => {
                            prepare_child(res.url(), &mut child);
                            if let Some(session) = &session {
                                if matches!(child.session, SessionPolicy::Auto) {
                                    child.session = SessionPolicy::Bound(Arc::clone(session));
                                    close_session = false;
                                }
                            }
                            self.enqueue(queue, state, child).await;
                        }
                        Parsed::Item(item) => match sink {
                            Sink::Collect => {
                                match hooks::run_pipes(
                                    self.spider.as_ref(),
                                    &self.hooks,
                                    item,
                                    res.as_ref(),
                                ) {
                                    Ok(Some(value)) => self.spider.collect(value),
                                    Ok(None) => {}
                                    Err(cause) => {
                                        self.report(
                                            SpiderError::pipe(res.url().as_str(), cause),
                                            sink,
                                        );
                                    }
                                }
                            }
                            Sink::Forward(tx) => {
                                let _ = tx.send(CrawlEvent::Item {
                                    item,
                                    res: Arc::clone(&res),
                                });
                            }
                        },
                    }
                }
            }
            Err(cause) => {
                self.report(SpiderError::parse(Arc::clone(&res), cause), sink);
            }
        }

        if close_session {
            if let Some(session) = session {
                if let Err(cause) = session.close() {
                    self.report(
                        SpiderError::generic("cannot close session", Some(Box::new(cause))),
                        sink,
                    );
                }
            }
        }
    }

    /// Applies the retry and ignore policy to one error. Returns the
    /// error when it should be reported, `None` when it was absorbed.
    async fn classify(
        &self,
        err: SpiderError<S>,
        queue: &Arc<DelayQueue<Request<S>>>,
        state: &mut DriveState,
    ) -> Option<SpiderError<S>> {
        match err {
            SpiderError::RequestIgnored { url, req, cause } => {
                if cause.is_some() {
                    Some(SpiderError::RequestIgnored { url, req, cause })
                } else {
                    debug!(%url, "request ignored");
                    None
                }
            }
            SpiderError::ResponseIgnored { url, new_req, cause } => {
                if let Some(new_req) = new_req {
                    self.enqueue(queue, state, *new_req).await;
                }
                if cause.is_some() {
                    Some(SpiderError::ResponseIgnored {
                        url,
                        new_req: None,
                        cause,
                    })
                } else {
                    debug!(%url, "response ignored");
                    None
                }
            }
            SpiderError::Download {
                url,
                mut req,
                need_retry,
                cause,
            } => {
                if need_retry && req.retry_num < self.config.retry_times {
                    req.retry_num += 1;
                    state.retries += 1;
                    debug!(
                        %url,
                        attempt = req.retry_num,
                        budget = self.config.retry_times,
                        "retrying"
                    );
                    self.enqueue_later(queue, state, *req, self.config.retry_delay)
                        .await;
                    None
                } else {
                    state.failed_urls.push(url.clone());
                    Some(SpiderError::Download {
                        url,
                        req,
                        need_retry,
                        cause,
                    })
                }
            }
            other => Some(other),
        }
    }

    /// Delivers a reportable error. In collect mode the spider's error
    /// handler runs, shielded from its own panics.
    fn report(&self, err: SpiderError<S>, sink: &Sink<S>) {
        match sink {
            Sink::Collect => {
                let spider = self.spider.as_ref();
                if catch_unwind(AssertUnwindSafe(|| spider.on_error(&err))).is_err() {
                    error!("error in error handler");
                }
            }
            Sink::Forward(tx) => {
                let _ = tx.send(CrawlEvent::Error(err));
            }
        }
    }

    async fn enqueue(
        &self,
        queue: &Arc<DelayQueue<Request<S>>>,
        state: &mut DriveState,
        mut req: Request<S>,
    ) {
        req.apply_default_headers(&self.config.default_headers);
        state.issued += 1;
        queue.put(req).await;
    }

    async fn enqueue_later(
        &self,
        queue: &Arc<DelayQueue<Request<S>>>,
        state: &mut DriveState,
        mut req: Request<S>,
        delay: Duration,
    ) {
        req.apply_default_headers(&self.config.default_headers);
        state.issued += 1;
        queue.put_later(req, delay).await;
    }
}

/// Resolves a child request's URL against the response it came from and
/// stamps the `Referer`, leaving a user-set one alone.
fn prepare_child<S: Spider>(base: &Url, child: &mut Request<S>) {
    if let Ok(joined) = base.join(&child.url) {
        child.url = joined.to_string();
    }
    if !child.headers.contains_key(header::REFERER) {
        if let Ok(value) = HeaderValue::from_str(base.as_str()) {
            child.headers.insert(header::REFERER, value);
        }
    }
}

fn log_failed_urls(urls: &[String]) {
    if urls.is_empty() {
        return;
    }
    let plural = if urls.len() > 1 { "s" } else { "" };
    info!(
        "cannot download from {} url{}:\n{}",
        urls.len(),
        plural,
        urls.join("\n")
    );
}

/// The shared client used by session-less requests.
#[allow(clippy::expect_used)]
fn http_client(config: &Config) -> Client {
    config
        .timeout
        .apply(Client::builder())
        .build()
        .expect("failed to build HTTP client with static configuration")
}
