//! Mock HTTP recipient for delivery tests
#![allow(dead_code)] // Test utility module - not all methods used in every test
//!
//! Accepts one request per connection, records it, and answers with a
//! scripted status code. Responses can be delayed to exercise timeouts.
//!
//! ```rust,no_run
//! use support::mock_http::MockRecipient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let recipient = MockRecipient::builder()
//!     .with_statuses([500, 500, 200])
//!     .build()
//!     .await?;
//!
//! let url = recipient.url("/hook");
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{BTreeMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{Mutex, RwLock},
    task::JoinHandle,
};

/// A request as the recipient saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    /// Header names are lower-cased
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct MockConfig {
    /// Served in order; once exhausted `default_status` is used
    statuses: VecDeque<u16>,
    default_status: u16,
    response_delay: Option<Duration>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            statuses: VecDeque::new(),
            default_status: 200,
            response_delay: None,
        }
    }
}

pub struct MockRecipient {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<ReceivedRequest>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockRecipient {
    #[must_use]
    pub fn builder() -> MockRecipientBuilder {
        MockRecipientBuilder {
            config: MockConfig::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.read().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Largest number of requests that were being handled at once
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }

    async fn handle_client(
        stream: TcpStream,
        config: Arc<Mutex<MockConfig>>,
        requests: Arc<RwLock<Vec<ReceivedRequest>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut headers = BTreeMap::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }

            let header = line.trim_end();
            if header.is_empty() {
                break;
            }

            if let Some((name, value)) = header.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let length = headers
            .get("content-length")
            .and_then(|length| length.parse::<usize>().ok())
            .unwrap_or_default();
        let mut body = vec![0; length];
        reader.read_exact(&mut body).await?;

        requests.write().await.push(ReceivedRequest {
            method,
            path,
            headers,
            body,
        });

        let (status, delay) = {
            let mut config = config.lock().await;
            let status = config.statuses.pop_front().unwrap_or(config.default_status);
            (status, config.response_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response =
            format!("HTTP/1.1 {status} Mock\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        writer.shutdown().await?;

        Ok(())
    }
}

impl Drop for MockRecipient {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct MockRecipientBuilder {
    config: MockConfig,
}

impl MockRecipientBuilder {
    /// Status returned once the scripted statuses run out
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.config.default_status = status;
        self
    }

    /// Statuses returned to the first requests, in order
    #[must_use]
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.config.statuses = statuses.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    /// Bind on an ephemeral local port and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn build(self) -> std::io::Result<MockRecipient> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(Mutex::new(self.config));
        let requests = Arc::new(RwLock::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn({
            let requests = Arc::clone(&requests);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let config = Arc::clone(&config);
                    let requests = Arc::clone(&requests);
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);

                    tokio::spawn(async move {
                        let now = active.fetch_add(1, Ordering::AcqRel) + 1;
                        peak.fetch_max(now, Ordering::AcqRel);

                        if let Err(e) = MockRecipient::handle_client(stream, config, requests).await {
                            tracing::debug!("Mock recipient connection error: {e}");
                        }

                        active.fetch_sub(1, Ordering::AcqRel);
                    });
                }
            }
        });

        Ok(MockRecipient {
            addr,
            requests,
            active,
            peak,
            handle,
        })
    }
}
