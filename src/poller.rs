//! HTTP health polling.
//!
//! The poller probes a URL on a fixed interval and reports a verdict per probe.
//! It holds no service state: results go out on a channel and the owning
//! service decides what they mean.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::counters::ActivityCounters;

/// Why a probe did not reach a healthy or unhealthy answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Unreachable {
    /// Nothing listening (connection refused, DNS failure).
    Refused,
    /// The request did not complete within the probe timeout.
    TimedOut,
    /// A status outside 2xx and 5xx.
    Status(u16),
    Other(String),
}

/// Classification of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PollVerdict {
    Healthy { status: u16 },
    Unhealthy { status: u16 },
    Unreachable { cause: Unreachable },
}

impl fmt::Display for PollVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollVerdict::Healthy { status } => write!(f, "healthy ({})", status),
            PollVerdict::Unhealthy { status } => write!(f, "unhealthy ({})", status),
            PollVerdict::Unreachable { cause } => match cause {
                Unreachable::Refused => write!(f, "not reachable yet"),
                Unreachable::TimedOut => write!(f, "timed out"),
                Unreachable::Status(status) => write!(f, "unexpected status {}", status),
                Unreachable::Other(err) => write!(f, "unreachable: {}", err),
            },
        }
    }
}

/// A verdict with the time it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub at: Instant,
    pub verdict: PollVerdict,
}

impl PollResult {
    pub fn new(verdict: PollVerdict) -> Self {
        Self {
            at: Instant::now(),
            verdict,
        }
    }

    /// Whether the result is recent enough to trust.
    pub fn is_fresh(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.at) <= stale_after
    }
}

/// Builds the HTTP client used for probes. Local services never go via a proxy.
pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("devrack/{}", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .no_proxy()
        .build()
}

/// Maps an HTTP status to a verdict.
pub fn classify_status(status: u16) -> PollVerdict {
    match status {
        200..=299 => PollVerdict::Healthy { status },
        500..=599 => PollVerdict::Unhealthy { status },
        other => PollVerdict::Unreachable {
            cause: Unreachable::Status(other),
        },
    }
}

fn classify_error(err: &reqwest::Error) -> PollVerdict {
    let cause = if err.is_timeout() {
        Unreachable::TimedOut
    } else if err.is_connect() {
        Unreachable::Refused
    } else {
        Unreachable::Other(err.to_string())
    };
    PollVerdict::Unreachable { cause }
}

/// Issues one GET and classifies the outcome.
pub async fn probe(client: &reqwest::Client, url: &str) -> PollVerdict {
    match client.get(url).send().await {
        Ok(response) => classify_status(response.status().as_u16()),
        Err(err) => classify_error(&err),
    }
}

/// Starts the repeating probe loop for `url`.
///
/// The first probe runs immediately. Cancellation is observed around every
/// probe, send and sleep, so the task ends within one in-flight request.
pub fn spawn_poll_loop(
    client: reqwest::Client,
    url: String,
    interval: Duration,
    results: mpsc::Sender<PollResult>,
    cancel: CancellationToken,
    counters: &Arc<ActivityCounters>,
) -> JoinHandle<()> {
    let guard = counters.track_poll();
    tokio::spawn(async move {
        let _guard = guard;
        loop {
            let verdict = tokio::select! {
                _ = cancel.cancelled() => break,
                verdict = probe(&client, &url) => verdict,
            };
            debug!(%url, %verdict, "probe");
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = results.send(PollResult::new(verdict)) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!(%url, "poll loop finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // Minimal HTTP server answering every request with `status`.
    async fn serve_status(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}/", addr)
    }

    async fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/", addr)
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(200), PollVerdict::Healthy { status: 200 });
        assert_eq!(classify_status(204), PollVerdict::Healthy { status: 204 });
        assert_eq!(classify_status(503), PollVerdict::Unhealthy { status: 503 });
        assert_eq!(
            classify_status(404),
            PollVerdict::Unreachable {
                cause: Unreachable::Status(404)
            }
        );
        assert_eq!(
            classify_status(302),
            PollVerdict::Unreachable {
                cause: Unreachable::Status(302)
            }
        );
    }

    #[test]
    fn freshness_window() {
        let result = PollResult::new(PollVerdict::Healthy { status: 200 });
        let window = Duration::from_secs(10);
        assert!(result.is_fresh(result.at, window));
        assert!(result.is_fresh(result.at + window, window));
        assert!(!result.is_fresh(result.at + window + Duration::from_millis(1), window));
    }

    #[tokio::test]
    async fn probe_reports_http_status() {
        let client = build_client(Duration::from_secs(2)).unwrap();
        let ok = serve_status("200 OK").await;
        let failing = serve_status("503 Service Unavailable").await;
        assert_eq!(probe(&client, &ok).await, PollVerdict::Healthy { status: 200 });
        assert_eq!(
            probe(&client, &failing).await,
            PollVerdict::Unhealthy { status: 503 }
        );
    }

    #[tokio::test]
    async fn probe_reports_refused_connections() {
        let client = build_client(Duration::from_secs(2)).unwrap();
        let url = closed_port_url().await;
        assert_eq!(
            probe(&client, &url).await,
            PollVerdict::Unreachable {
                cause: Unreachable::Refused
            }
        );
    }

    #[tokio::test]
    async fn probe_times_out_on_silent_servers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let client = build_client(Duration::from_millis(200)).unwrap();
        assert_eq!(
            probe(&client, &format!("http://{}/", addr)).await,
            PollVerdict::Unreachable {
                cause: Unreachable::TimedOut
            }
        );
    }

    #[tokio::test]
    async fn poll_loop_reports_and_stops_on_cancel() {
        let client = build_client(Duration::from_secs(1)).unwrap();
        let url = serve_status("200 OK").await;
        let counters = ActivityCounters::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let task = spawn_poll_loop(
            client,
            url,
            Duration::from_millis(20),
            tx,
            cancel.clone(),
            &counters,
        );
        assert_eq!(counters.active_polls(), 1);
        for _ in 0..3 {
            let result = rx.recv().await.unwrap();
            assert!(matches!(result.verdict, PollVerdict::Healthy { status: 200 }));
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("poll loop must stop promptly")
            .unwrap();
        assert_eq!(counters.active_polls(), 0);
        assert_eq!(counters.peak_polls(), 1);
    }
}
