// src/proxy.rs

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Method, StatusCode},
    response::Response,
};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use rand::Rng;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::trace;
use url::Url;

use crate::error::{AppError, Result};
use crate::keypool::KeyPool;
use crate::models::Upstream;

/// Failure message reported when the client goes away mid-attempt. Matches
/// the default uncounted classification, so a disconnect never counts against
/// the key.
pub const CLIENT_DISCONNECT_MARKER: &str = "client disconnected";

/// Delivers exactly one outcome report for one attempt.
///
/// Dropping the reporter without an explicit outcome means the client went
/// away while the attempt was in flight (the same drop aborts the upstream
/// call); the attempt is then reported with the disconnect marker.
pub struct AttemptReporter {
    pool: KeyPool,
    key_id: i64,
    group_id: i64,
    blacklist_threshold: u32,
    sent: bool,
}

impl AttemptReporter {
    pub fn new(pool: KeyPool, key_id: i64, group_id: i64, blacklist_threshold: u32) -> Self {
        Self {
            pool,
            key_id,
            group_id,
            blacklist_threshold,
            sent: false,
        }
    }

    pub fn success(mut self) {
        self.send(true, "");
    }

    pub fn failure(mut self, message: &str) {
        self.send(false, message);
    }

    fn send(&mut self, ok: bool, message: &str) {
        if !self.sent {
            self.sent = true;
            self.pool.report(
                self.key_id,
                self.group_id,
                ok,
                message,
                false,
                self.blacklist_threshold,
            );
        }
    }
}

impl Drop for AttemptReporter {
    fn drop(&mut self) {
        self.send(false, CLIENT_DISCONNECT_MARKER);
    }
}

/// Response body passthrough that books the attempt outcome from how the
/// stream ends: clean end-of-stream reports success, an upstream error
/// reports failure, and dropping the stream early falls through to the
/// reporter's disconnect handling.
struct ReportedBody {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    reporter: Option<AttemptReporter>,
}

impl Stream for ReportedBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                let message = format!("upstream body stream error: {e}");
                if let Some(reporter) = this.reporter.take() {
                    reporter.failure(&message);
                }
                Poll::Ready(Some(Err(std::io::Error::other(message))))
            }
            Poll::Ready(None) => {
                if let Some(reporter) = this.reporter.take() {
                    reporter.success();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Hop-by-hop headers that must not be forwarded in either direction
/// (RFC 7230 §6.1). `host` is recomputed by the client for the new target.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Copies forwardable request headers onto the outbound request.
pub fn build_forward_headers(original: &HeaderMap) -> HeaderMap {
    filter_hop_by_hop(original)
}

/// Copies forwardable response headers back to the client.
pub fn build_response_headers(original: &HeaderMap) -> HeaderMap {
    filter_hop_by_hop(original)
}

fn filter_hop_by_hop(source: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            trace!(header = %name, "skipping hop-by-hop header");
        } else {
            filtered.insert(name.clone(), value.clone());
        }
    }
    filtered
}

/// Weighted-random pick over the group's upstream list.
pub fn pick_upstream(upstreams: &[Upstream]) -> Result<&Upstream> {
    match upstreams {
        [] => Err(AppError::Config {
            message: "group has no upstreams".to_string(),
        }),
        [only] => Ok(only),
        _ => {
            let total: u64 = upstreams.iter().map(|u| u64::from(u.weight.max(1))).sum();
            let pick = rand::thread_rng().gen_range(0..total);
            let mut cumulative = 0;
            for upstream in upstreams {
                cumulative += u64::from(upstream.weight.max(1));
                if pick < cumulative {
                    return Ok(upstream);
                }
            }
            Ok(&upstreams[upstreams.len() - 1])
        }
    }
}

/// Composes the outbound URL: upstream base path plus the request remainder,
/// preserving the client query string.
pub fn build_target_url(upstream_base: &str, rest: &str, query: Option<&str>) -> Result<Url> {
    let base = upstream_base.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    let mut url = Url::parse(&format!("{base}/{rest}"))?;
    url.set_query(query.filter(|q| !q.is_empty()));
    Ok(url)
}

/// Sends the outbound request and waits for response headers, bounded by the
/// response-header timeout. The body is not consumed here.
pub async fn forward(
    client: &reqwest::Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: axum::body::Bytes,
    response_header_timeout: Duration,
) -> Result<reqwest::Response> {
    let request = client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send();

    match tokio::time::timeout(response_header_timeout, request).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::HttpClient {
            message: format!(
                "upstream response headers not received within {}s",
                response_header_timeout.as_secs()
            ),
        }),
    }
}

/// Mirrors the upstream response to the client: status and filtered headers,
/// body streamed chunk by chunk without buffering. The attempt's success is
/// reported only once the upstream body closes normally; an abnormal close or
/// a client disconnect mid-stream is never booked as success.
pub fn stream_response(upstream_response: reqwest::Response, reporter: AttemptReporter) -> Result<Response> {
    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = build_response_headers(upstream_response.headers());

    let body_stream = ReportedBody {
        inner: upstream_response.bytes_stream().boxed(),
        reporter: Some(reporter),
    };

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(body_stream))
        .map_err(|e| AppError::internal(format!("failed to build client response: {e}")))?;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn hop_by_hop_headers_are_stripped_both_ways() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("host", HeaderValue::from_static("proxy.local"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let forwarded = build_forward_headers(&headers);
        assert!(forwarded.get("connection").is_none());
        assert!(forwarded.get("transfer-encoding").is_none());
        assert!(forwarded.get("host").is_none());
        assert_eq!(forwarded.get("content-type").unwrap(), "application/json");
        assert_eq!(forwarded.get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn target_url_joins_base_path_and_query() {
        let url = build_target_url(
            "https://api.openai.com",
            "v1/chat/completions",
            Some("stream=true"),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.openai.com/v1/chat/completions?stream=true"
        );

        // Base with its own path prefix.
        let url = build_target_url("https://gw.example.com/openai/", "/v1/models", None).unwrap();
        assert_eq!(url.as_str(), "https://gw.example.com/openai/v1/models");

        // Empty query is dropped.
        let url = build_target_url("https://a.example.com", "v1/x", Some("")).unwrap();
        assert!(url.query().is_none());
    }

    #[test]
    fn single_upstream_short_circuits() {
        let upstreams = vec![Upstream {
            url: "https://only.example.com".into(),
            weight: 3,
        }];
        assert_eq!(pick_upstream(&upstreams).unwrap().url, "https://only.example.com");
        assert!(pick_upstream(&[]).is_err());
    }

    #[test]
    fn weighted_pick_tracks_configured_ratio() {
        let upstreams = vec![
            Upstream {
                url: "https://u1.example.com".into(),
                weight: 9,
            },
            Upstream {
                url: "https://u2.example.com".into(),
                weight: 1,
            },
        ];

        let trials = 10_000;
        let mut u1_hits = 0usize;
        for _ in 0..trials {
            if pick_upstream(&upstreams).unwrap().url.contains("u1") {
                u1_hits += 1;
            }
        }
        let ratio = u1_hits as f64 / trials as f64;
        assert!(
            (0.87..=0.93).contains(&ratio),
            "u1 ratio {ratio} outside expected band"
        );
    }

    #[test]
    fn zero_weight_is_treated_as_one() {
        let upstreams = vec![
            Upstream {
                url: "https://u1.example.com".into(),
                weight: 0,
            },
            Upstream {
                url: "https://u2.example.com".into(),
                weight: 0,
            },
        ];
        // Must not panic and must return something.
        for _ in 0..100 {
            assert!(pick_upstream(&upstreams).is_ok());
        }
    }
}
