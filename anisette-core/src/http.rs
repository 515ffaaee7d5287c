use std::time::Duration;

use reqwest::RequestBuilder;

/// A thin wrapper on the HTTP client applying a fixed timeout and a crate
/// User-Agent. The protocol's only sanctioned retry is the server-directed
/// `TryAgainSoon`, so no retry middleware is layered on here.
pub(crate) struct Request {
    client: reqwest::Client,
    timeout: Duration,
}

impl Request {
    pub(crate) fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub(crate) fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url).timeout(self.timeout).header(
            "User-Agent",
            format!("anisette-core/{}", env!("CARGO_PKG_VERSION")),
        )
    }

    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url).timeout(self.timeout).header(
            "User-Agent",
            format!("anisette-core/{}", env!("CARGO_PKG_VERSION")),
        )
    }
}
