use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::debug;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("invalid authorization token")]
    InvalidToken,
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} failed with HTTP {status}{body_snippet}")]
    Status {
        url: String,
        status: StatusCode,
        body_snippet: String,
    },
    #[error("transfer from {url} interrupted: {details}")]
    Interrupted { url: String, details: String },
}

/// Response body consumed one network chunk at a time.
#[async_trait]
pub trait BodyStream: Send {
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body, `None` once the body is complete.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// HTTPS access used by the release check and the download.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Fetch a small document. Non-success statuses are errors.
    async fn get_text(&self, url: &str) -> Result<String, TransportError>;

    /// Open a streamed body. Non-success statuses are errors.
    async fn get_stream(&self, url: &str) -> Result<Box<dyn BodyStream>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub token: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 10,
            token: None,
        }
    }
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    document_timeout: Duration,
}

impl ReqwestTransport {
    /// # Errors
    /// Returns an error if the token is not a valid header value or the client
    /// cannot be built.
    pub fn new(options: &TransportOptions) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = options.token.as_deref().filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("token {token}"))
                .map_err(|_| TransportError::InvalidToken)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        // Idle limit per read: a slow download that keeps making progress
        // must not hit a total deadline.
        let client = reqwest::Client::builder()
            .read_timeout(options.timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(options.max_redirects))
            .user_agent(format!("ota/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(TransportError::ClientBuild)?;

        Ok(Self {
            client,
            document_timeout: options.timeout,
        })
    }

    async fn send(
        &self,
        url: &str,
        deadline: Option<Duration>,
    ) -> Result<reqwest::Response, TransportError> {
        debug!("GET {url}");
        let mut request = self.client.get(url);
        if let Some(deadline) = deadline {
            request = request.timeout(deadline);
        }
        let response = request
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_snippet = response
                .text()
                .await
                .map(|body| response_snippet(&body, 160))
                .unwrap_or_default();
            return Err(TransportError::Status {
                url: url.to_string(),
                status,
                body_snippet,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        let response = self.send(url, Some(self.document_timeout)).await?;
        response
            .text()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })
    }

    async fn get_stream(&self, url: &str) -> Result<Box<dyn BodyStream>, TransportError> {
        let response = self.send(url, None).await?;
        let content_length = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(Box::new(ReqwestBody {
            url: url.to_string(),
            content_length,
            chunks,
        }))
    }
}

struct ReqwestBody {
    url: String,
    content_length: Option<u64>,
    chunks: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
}

#[async_trait]
impl BodyStream for ReqwestBody {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.chunks.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(source)) => Err(TransportError::Request {
                url: self.url.clone(),
                source,
            }),
            None => Ok(None),
        }
    }
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{HttpTransport, ReqwestTransport, TransportOptions, response_snippet};

    /// Serve one response whose body arrives a byte at a time, `gap` apart.
    async fn trickle_server(body: &'static [u8], gap: Duration) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let _ = socket.set_nodelay(true);
            let mut request = [0_u8; 2048];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for byte in body {
                tokio::time::sleep(gap).await;
                if socket.write_all(std::slice::from_ref(byte)).await.is_err() {
                    return;
                }
            }
        });
        format!("http://{addr}/fw")
    }

    fn transport_with_timeout(timeout: Duration) -> ReqwestTransport {
        ReqwestTransport::new(&TransportOptions {
            timeout,
            ..TransportOptions::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn slow_download_outlasting_timeout_completes_while_bytes_flow() {
        let url = trickle_server(b"firmware!!", Duration::from_millis(200)).await;
        let transport = transport_with_timeout(Duration::from_secs(1));

        let mut body = transport.get_stream(&url).await.unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            received.extend_from_slice(&chunk);
        }

        assert_eq!(received, b"firmware!!");
    }

    #[tokio::test]
    async fn metadata_fetch_keeps_a_total_deadline() {
        let url = trickle_server(b"{\"tag_name\":\"v1\"}", Duration::from_millis(200)).await;
        let transport = transport_with_timeout(Duration::from_secs(1));

        assert!(transport.get_text(&url).await.is_err());
    }

    #[test]
    fn response_snippet_truncates_and_prefixes() {
        assert_eq!(response_snippet("", 10), "");
        assert_eq!(response_snippet("not found", 3), ": not");
    }

    #[test]
    fn transport_rejects_token_with_newline() {
        let options = TransportOptions {
            token: Some("abc\ndef".to_string()),
            ..TransportOptions::default()
        };
        assert!(ReqwestTransport::new(&options).is_err());
    }

    #[test]
    fn transport_builds_with_defaults() {
        assert!(ReqwestTransport::new(&TransportOptions::default()).is_ok());
    }
}
