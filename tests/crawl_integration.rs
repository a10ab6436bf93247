//! End-to-end crawls against a mock HTTP server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use futures_util::StreamExt;
use spinneret::spider::ParseResult;
use spinneret::{Config, CrawlEvent, Crawler, Entry, Parsed, Request, Response, Spider};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn quick_config() -> Config {
    Config {
        workers: 4,
        ..Config::default()
    }
}

/// Fetches one page and collects its body.
struct EchoSpider {
    server: String,
    items: Arc<Mutex<Vec<String>>>,
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl Spider for EchoSpider {
    type Item = String;

    fn entry(&self) -> Entry<Self> {
        format!("{}/a", self.server).into()
    }

    fn parse(&self, res: &Response<Self>) -> ParseResult<Self> {
        Ok(vec![Parsed::Item(res.text().into_owned())])
    }

    fn collect(&self, item: String) {
        self.items.lock().unwrap().push(item);
    }

    fn config(&self) -> Config {
        quick_config()
    }

    fn on_start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn on_finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn single_fetch_collects_the_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let items = Arc::new(Mutex::new(Vec::new()));
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let spider = EchoSpider {
        server: server.uri(),
        items: Arc::clone(&items),
        started: Arc::clone(&started),
        finished: Arc::clone(&finished),
    };

    let stats = Crawler::new(spider).unwrap().run().await;

    assert_eq!(*items.lock().unwrap(), vec!["ok".to_owned()]);
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.responses, 1);
    assert!(stats.failed_urls.is_empty());
    assert!(started.load(Ordering::SeqCst));
    assert!(finished.load(Ordering::SeqCst));
}

/// Same crawl, but a pipe transforms the item before collection.
struct UppercaseSpider {
    server: String,
    items: Arc<Mutex<Vec<String>>>,
}

impl Spider for UppercaseSpider {
    type Item = String;

    fn entry(&self) -> Entry<Self> {
        format!("{}/a", self.server).into()
    }

    fn parse(&self, res: &Response<Self>) -> ParseResult<Self> {
        Ok(vec![Parsed::Item(res.text().into_owned())])
    }

    fn collect(&self, item: String) {
        self.items.lock().unwrap().push(item);
    }

    fn config(&self) -> Config {
        quick_config()
    }

    fn hooks(&self) -> spinneret::Hooks<Self> {
        spinneret::Hooks::new().pipe(|_, item: String| Ok(Some(item.to_uppercase())))
    }
}

#[tokio::test]
async fn pipe_transforms_the_collected_item() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let items = Arc::new(Mutex::new(Vec::new()));
    let spider = UppercaseSpider {
        server: server.uri(),
        items: Arc::clone(&items),
    };

    Crawler::new(spider).unwrap().run().await;

    assert_eq!(*items.lock().unwrap(), vec!["OK".to_owned()]);
}

/// A listing page yielding two relative child requests.
struct ListSpider {
    server: String,
    items: Arc<Mutex<Vec<String>>>,
}

impl ListSpider {
    fn parse_item(&self, res: &Response<Self>) -> ParseResult<Self> {
        Ok(vec![Parsed::Item(res.text().into_owned())])
    }
}

impl Spider for ListSpider {
    type Item = String;

    fn entry(&self) -> Entry<Self> {
        format!("{}/list", self.server).into()
    }

    fn parse(&self, _res: &Response<Self>) -> ParseResult<Self> {
        Ok(vec![
            Parsed::Request(Request::new("/item/1").callback(Self::parse_item)),
            Parsed::Request(Request::new("/item/2").callback(Self::parse_item)),
        ])
    }

    fn collect(&self, item: String) {
        self.items.lock().unwrap().push(item);
    }

    fn config(&self) -> Config {
        quick_config()
    }
}

#[tokio::test]
async fn children_resolve_relative_urls_and_carry_a_referer() {
    let server = MockServer::start().await;
    let list_url = format!("{}/list", server.uri());

    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string("listing"))
        .expect(1)
        .mount(&server)
        .await;
    // The child mocks require the Referer stamped by the dispatcher; an
    // unresolved or referer-less request would miss them.
    Mock::given(method("GET"))
        .and(path("/item/1"))
        .and(header("referer", list_url.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string("one"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/item/2"))
        .and(header("referer", list_url.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string("two"))
        .expect(1)
        .mount(&server)
        .await;

    let items = Arc::new(Mutex::new(Vec::new()));
    let spider = ListSpider {
        server: server.uri(),
        items: Arc::clone(&items),
    };

    let stats = Crawler::new(spider).unwrap().run().await;

    assert_eq!(stats.requests, 3);
    assert_eq!(stats.responses, 3);
    let mut collected = items.lock().unwrap().clone();
    collected.sort();
    assert_eq!(collected, vec!["one".to_owned(), "two".to_owned()]);
}

/// Checks that a seed's state rides along onto the response.
struct StateSpider {
    server: String,
    seen: Arc<Mutex<Option<String>>>,
}

impl Spider for StateSpider {
    type Item = String;

    fn entry(&self) -> Entry<Self> {
        Request::new(format!("{}/a", self.server))
            .state_entry("k", "v")
            .into()
    }

    fn parse(&self, res: &Response<Self>) -> ParseResult<Self> {
        let value = res
            .state()
            .get("k")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        *self.seen.lock().unwrap() = value;
        Ok(Vec::new())
    }

    fn config(&self) -> Config {
        quick_config()
    }
}

#[tokio::test]
async fn seed_state_propagates_to_the_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let seen = Arc::new(Mutex::new(None));
    let spider = StateSpider {
        server: server.uri(),
        seen: Arc::clone(&seen),
    };

    Crawler::new(spider).unwrap().run().await;

    assert_eq!(seen.lock().unwrap().as_deref(), Some("v"));
}

/// One spider, four ways of writing the same entry.
struct PolymorphicEntry {
    server: String,
    mode: u8,
    items: Arc<Mutex<Vec<String>>>,
}

impl Spider for PolymorphicEntry {
    type Item = String;

    fn entry(&self) -> Entry<Self> {
        let url = format!("{}/a", self.server);
        match self.mode {
            0 => url.into(),
            1 => Request::new(url).into(),
            2 => vec![url].into(),
            _ => vec![Request::new(url)].into(),
        }
    }

    fn parse(&self, res: &Response<Self>) -> ParseResult<Self> {
        Ok(vec![Parsed::Item(res.text().into_owned())])
    }

    fn collect(&self, item: String) {
        self.items.lock().unwrap().push(item);
    }

    fn config(&self) -> Config {
        quick_config()
    }
}

#[tokio::test]
async fn every_entry_shape_yields_the_same_crawl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(4)
        .mount(&server)
        .await;

    for mode in 0..4 {
        let items = Arc::new(Mutex::new(Vec::new()));
        let spider = PolymorphicEntry {
            server: server.uri(),
            mode,
            items: Arc::clone(&items),
        };
        let stats = Crawler::new(spider).unwrap().run().await;
        assert_eq!(stats.requests, 1, "mode {mode}");
        assert_eq!(*items.lock().unwrap(), vec!["ok".to_owned()], "mode {mode}");
    }
}

/// A status outside the retry set is an ordinary response, delivered to
/// the parser instead of the error path.
struct StatusSpider {
    server: String,
    status_seen: Arc<AtomicU32>,
}

impl Spider for StatusSpider {
    type Item = String;

    fn entry(&self) -> Entry<Self> {
        format!("{}/missing", self.server).into()
    }

    fn parse(&self, res: &Response<Self>) -> ParseResult<Self> {
        self.status_seen
            .store(u32::from(res.status().as_u16()), Ordering::SeqCst);
        Ok(Vec::new())
    }

    fn config(&self) -> Config {
        quick_config()
    }
}

#[tokio::test]
async fn status_outside_the_retry_set_reaches_the_parser() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let status_seen = Arc::new(AtomicU32::new(0));
    let spider = StatusSpider {
        server: server.uri(),
        status_seen: Arc::clone(&status_seen),
    };

    let stats = Crawler::new(spider).unwrap().run().await;

    assert_eq!(status_seen.load(Ordering::SeqCst), 404);
    assert!(stats.failed_urls.is_empty());
}

/// The stream surface yields raw items without running pipes or collect.
struct StreamSpider {
    server: String,
    collected: Arc<AtomicU32>,
}

impl Spider for StreamSpider {
    type Item = String;

    fn entry(&self) -> Entry<Self> {
        format!("{}/a", self.server).into()
    }

    fn parse(&self, res: &Response<Self>) -> ParseResult<Self> {
        Ok(vec![
            Parsed::Item(format!("first:{}", res.text())),
            Parsed::Item(format!("second:{}", res.text())),
        ])
    }

    fn collect(&self, _item: String) {
        self.collected.fetch_add(1, Ordering::SeqCst);
    }

    fn config(&self) -> Config {
        quick_config()
    }
}

#[tokio::test]
async fn events_stream_yields_items_and_stats() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let collected = Arc::new(AtomicU32::new(0));
    let spider = StreamSpider {
        server: server.uri(),
        collected: Arc::clone(&collected),
    };

    let mut events = Crawler::new(spider).unwrap().events();
    let mut items = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            CrawlEvent::Item { item, res } => {
                assert_eq!(res.status().as_u16(), 200);
                items.push(item);
            }
            CrawlEvent::Error(err) => panic!("unexpected error event: {err}"),
        }
    }
    let stats = events.stats().await;

    items.sort();
    assert_eq!(items, vec!["first:ok".to_owned(), "second:ok".to_owned()]);
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.responses, 1);
    assert_eq!(collected.load(Ordering::SeqCst), 0, "collect must not run");
}
