//! Stock middleware.

use rand::seq::SliceRandom;
use reqwest::header::{HeaderValue, USER_AGENT};

use crate::error::BoxError;
use crate::hooks::Middleware;
use crate::request::Request;
use crate::spider::Spider;

const USER_AGENTS_DESKTOP: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/90.0.4430.93 Safari/537.36 Edg/90.0.818.51",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0.3 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.16; rv:78.0) Gecko/20100101 Firefox/78.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/90.0.4430.212 Safari/537.36",
    "Opera/9.80 (Macintosh; Intel Mac OS X 10.6.8; U; fr) Presto/2.9.168 Version/11.52",
];

const USER_AGENTS_MOBILE: &[&str] = &[
    "Mozilla/5.0 (iPhone; CPU iPhone OS 13_2_3 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.0.3 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 10.0.0; Pixel 2 XL Build/OPD1.170816.004) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/90.0.4430.93 Mobile Safari/537.36",
    "Mozilla/5.0 (iPad; CPU OS 11_0 like Mac OS X) AppleWebKit/604.1.34 (KHTML, like Gecko) Version/11.0 Mobile/15A5341f Safari/604.1",
];

/// Which user-agent pool to draw from.
#[derive(Debug, Clone, Copy, Default)]
pub enum AgentPool {
    /// Desktop browsers only.
    #[default]
    Desktop,
    /// Mobile browsers only.
    Mobile,
    /// Either pool.
    Any,
}

/// Pre-download middleware that fills in a random browser `User-Agent`,
/// leaving any user-set value alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomUserAgent {
    pool: AgentPool,
}

impl RandomUserAgent {
    /// A middleware drawing from the given pool.
    #[must_use]
    pub fn new(pool: AgentPool) -> Self {
        Self { pool }
    }

    fn pick(&self) -> &'static str {
        let mut rng = rand::thread_rng();
        let pool: &[&str] = match self.pool {
            AgentPool::Desktop => USER_AGENTS_DESKTOP,
            AgentPool::Mobile => USER_AGENTS_MOBILE,
            AgentPool::Any => {
                if rand::random() {
                    USER_AGENTS_DESKTOP
                } else {
                    USER_AGENTS_MOBILE
                }
            }
        };
        pool.choose(&mut rng).copied().unwrap_or(USER_AGENTS_DESKTOP[0])
    }
}

impl<S: Spider> Middleware<S> for RandomUserAgent {
    fn before_download(
        &self,
        _spider: &S,
        mut req: Request<S>,
    ) -> Result<Option<Request<S>>, BoxError> {
        if !req.headers.contains_key(USER_AGENT) {
            req.headers
                .insert(USER_AGENT, HeaderValue::from_static(self.pick()));
        }
        Ok(Some(req))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hooks::Hooks;
    use crate::request::Entry;
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
    fn fills_user_agent_when_absent() {
        let mw = RandomUserAgent::default();
        let req = Middleware::<NullSpider>::before_download(
            &mw,
            &NullSpider,
            Request::new("https://example.com"),
        )
        .unwrap()
        .unwrap();
        let agent = req.headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(USER_AGENTS_DESKTOP.contains(&agent));
    }

    #[test]
    fn keeps_a_user_set_agent() {
        let mw = RandomUserAgent::new(AgentPool::Any);
        let req = Middleware::<NullSpider>::before_download(
            &mw,
            &NullSpider,
            Request::new("https://example.com").header("user-agent", "mine"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(req.headers.get(USER_AGENT).unwrap(), "mine");
    }

    #[test]
    fn installs_on_a_hook_chain() {
        let hooks: Hooks<NullSpider> =
            Hooks::new().install(std::sync::Arc::new(RandomUserAgent::default()));
        let _ = hooks;
    }
}
