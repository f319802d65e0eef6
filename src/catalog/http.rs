//! HTTP transport for the remote catalogs and the retry policy wrapped around it.

use std::time::Duration;

use super::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A request, independent of the HTTP client library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// POST request with a JSON body.
    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            query: Vec::new(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: Some(body.to_string()),
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Value of query parameter `key`, if set.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

/// Failure below the HTTP layer, e.g. connection refused or timeout.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends a single request without any retry.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

/// `Transport` implementation based on `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("autoreport-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("could not create HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(Response { status, body })
    }
}

/// Fixed-delay retry with a cap on the number of attempts.
#[derive(Debug, Clone, PartialEq, Eq, derive_builder::Builder)]
pub struct RetryPolicy {
    /// Total number of requests before giving up.
    #[builder(default = "5")]
    pub max_attempts: usize,
    /// Pause between two attempts.
    #[builder(default = "Duration::from_millis(500)")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

/// Outcome of a request that did not fail hard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Found(Response),
    /// The server answered 400 or 404.
    NotFound,
}

/// Send `request`, retrying transport errors and unexpected statuses.
///
/// 2xx responses are returned, 400 and 404 yield `Fetched::NotFound` after a single
/// request.  Everything else is retried after `policy.delay` until `policy.max_attempts`
/// requests have been sent.
pub async fn try_request(
    transport: &dyn Transport,
    policy: &RetryPolicy,
    request: &Request,
) -> Result<Fetched, Error> {
    let attempts = policy.max_attempts.max(1);
    let mut reason = String::new();
    for attempt in 1..=attempts {
        tracing::trace!("{:?} {} (attempt {})", request.method, &request.url, attempt);
        match transport.send(request).await {
            Ok(response) if (200..300).contains(&response.status) => {
                return Ok(Fetched::Found(response));
            }
            Ok(response) if matches!(response.status, 400 | 404) => {
                tracing::debug!(
                    "{} answered {}, treating as no results",
                    &request.url,
                    response.status
                );
                return Ok(Fetched::NotFound);
            }
            Ok(response) => reason = format!("HTTP status {}", response.status),
            Err(e) => reason = format!("transport error: {}", e),
        }
        tracing::debug!(
            "request to {} failed ({}), attempt {}/{}",
            &request.url,
            &reason,
            attempt,
            attempts
        );
        if attempt < attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }
    Err(Error::ResponseFailure {
        url: request.url.clone(),
        attempts,
        reason,
    })
}

/// Like `try_request()` but decode a found body as JSON.
pub async fn try_request_json(
    transport: &dyn Transport,
    policy: &RetryPolicy,
    request: &Request,
) -> Result<Option<serde_json::Value>, Error> {
    match try_request(transport, policy, request).await? {
        Fetched::NotFound => Ok(None),
        Fetched::Found(response) => serde_json::from_str(&response.body)
            .map(Some)
            .map_err(|e| Error::Decode {
                url: request.url.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory transport for tests.

    use std::sync::Mutex;

    use super::{Request, Response, Transport, TransportError};

    type Handler = dyn Fn(&Request, usize) -> Result<Response, TransportError> + Send + Sync;

    /// Answers requests by calling a handler with the request and its 0-based call number.
    pub struct ScriptedTransport {
        handler: Box<Handler>,
        requests: Mutex<Vec<Request>>,
    }

    impl ScriptedTransport {
        pub fn new(
            handler: impl Fn(&Request, usize) -> Result<Response, TransportError>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            Self {
                handler: Box::new(handler),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Always answer with `status` and `body`.
        pub fn always(status: u16, body: &str) -> Self {
            let body = body.to_string();
            Self::new(move |_, _| {
                Ok(Response {
                    status,
                    body: body.clone(),
                })
            })
        }

        /// Answer the i-th request with the i-th response, repeating the last one.
        pub fn sequence(responses: Vec<(u16, String)>) -> Self {
            Self::new(move |_, i| {
                let (status, body) = responses[i.min(responses.len() - 1)].clone();
                Ok(Response { status, body })
            })
        }

        pub fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }

        pub fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &Request) -> Result<Response, TransportError> {
            let i = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(request.clone());
                requests.len() - 1
            };
            (self.handler)(request, i)
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{
        testing::ScriptedTransport, try_request, Fetched, Request, RetryPolicy,
        RetryPolicyBuilder, TransportError,
    };
    use crate::catalog::Error;

    fn policy() -> RetryPolicy {
        RetryPolicyBuilder::default()
            .delay(Duration::ZERO)
            .build()
            .unwrap()
    }

    #[test]
    fn retry_policy_defaults() {
        let policy = RetryPolicyBuilder::default().build().unwrap();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(500));
    }

    #[rstest::rstest]
    #[case(400)]
    #[case(404)]
    #[tokio::test]
    async fn not_found_is_not_retried(#[case] status: u16) {
        let transport = ScriptedTransport::always(status, "");
        let res = try_request(&transport, &policy(), &Request::get("http://x/a")).await;

        assert_eq!(res.unwrap(), Fetched::NotFound);
        assert_eq!(transport.count(), 1);
    }

    #[rstest::rstest]
    #[case(500)]
    #[case(503)]
    #[case(429)]
    #[tokio::test]
    async fn failure_after_cap(#[case] status: u16) {
        let transport = ScriptedTransport::always(status, "");
        let res = try_request(&transport, &policy(), &Request::get("http://x/a")).await;

        match res {
            Err(Error::ResponseFailure { url, attempts, .. }) => {
                assert_eq!(url, "http://x/a");
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(transport.count(), 5);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let transport = ScriptedTransport::new(|_, _| Err(TransportError("refused".into())));
        let policy = RetryPolicyBuilder::default()
            .max_attempts(3)
            .delay(Duration::ZERO)
            .build()
            .unwrap();
        let err = try_request(&transport, &policy, &Request::get("http://x/a"))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "request to http://x/a failed after 3 attempts: transport error: refused"
        );
        assert_eq!(transport.count(), 3);
    }

    #[tokio::test]
    async fn success_after_transient_failure() {
        let transport =
            ScriptedTransport::sequence(vec![(502, String::new()), (200, "ok".to_string())]);
        let res = try_request(&transport, &policy(), &Request::get("http://x/a"))
            .await
            .unwrap();

        match res {
            Fetched::Found(response) => assert_eq!(response.body, "ok"),
            Fetched::NotFound => panic!("expected a response"),
        }
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test]
    async fn decode_failure() {
        let transport = ScriptedTransport::always(200, "not json");
        let err = super::try_request_json(&transport, &policy(), &Request::get("http://x/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn request_query() {
        let request = Request::get("http://x").query("size", 1000).query("reveal", "all");
        assert_eq!(request.query_value("size"), Some("1000"));
        assert_eq!(request.query_value("start"), None);
    }
}
