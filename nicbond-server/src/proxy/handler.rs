use crate::cache::SIZE_UNPROBED;
use crate::config::ACCEL_THRESHOLD;
use crate::net::ledger::Lane;
use crate::proxy::http1::{
    sanitize_headers, write_accel_preamble, write_response_head, H1Conn, ParsedRequest,
};
use crate::sched::planner;
use crate::Core;
use anyhow::{anyhow, Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT_RANGES, CONNECTION, CONTENT_LENGTH, CONTENT_RANGE,
    TRANSFER_ENCODING,
};
use hyper::{Method, Request, Response, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Whether the serve loop should read another request on this connection.
enum LoopAction {
    Next,
    Close,
}

/// Serve HTTP/1.1 requests on a hijacked (MITM'd) TLS connection until the
/// peer goes away or a response requires closing.
pub async fn serve_tls<S: AsyncRead + AsyncWrite + Unpin>(
    core: Arc<Core>,
    stream: S,
    connect_host: &str,
) {
    let mut conn = H1Conn::new(stream);
    loop {
        let req = match conn.read_request().await {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(e) => {
                debug!("request read on {connect_host} ended: {e:#}");
                return;
            }
        };
        match handle_request(&core, &mut conn, &req, connect_host).await {
            Ok(LoopAction::Next) => {}
            Ok(LoopAction::Close) => return,
            Err(e) => {
                warn!("request for {connect_host} failed: {e:#}");
                return;
            }
        }
    }
}

async fn handle_request<S: AsyncRead + AsyncWrite + Unpin>(
    core: &Arc<Core>,
    conn: &mut H1Conn<S>,
    req: &ParsedRequest,
    connect_host: &str,
) -> Result<LoopAction> {
    let host = req.header("host").unwrap_or(connect_host);
    let url = format!("https://{}{}", host, req.target);

    let is_get = req.method.eq_ignore_ascii_case("GET");

    // Known URLs skip the probe entirely.
    let (found, size, code) = core.urls.check(&url);
    if is_get && size >= ACCEL_THRESHOLD {
        return accelerate_known(core, conn, req, &url, size, code).await;
    }

    let probe_ip = core
        .choices
        .load()
        .pick_probe()
        .ok_or_else(|| anyhow!("no egress interface available"))?;
    let resp = send_probe(core, probe_ip, req, &url).await?;

    if size == SIZE_UNPROBED {
        match resp_deal(resp.status(), resp.headers()) {
            Ok(verdict) => {
                core.urls.save(&url, verdict.code, verdict.size);
                if verdict.accelerate && is_get {
                    // The probe body is dropped; ranged fetches re-pull it.
                    drop(resp);
                    info!("accelerating {url} ({} bytes)", verdict.size);
                    return accelerate(core, conn, req, &url, verdict.size as u64).await;
                }
            }
            Err(e) => debug!("probe classification for {url}: {e:#}"),
        }
    } else if size == 0 && code == 200 && !found {
        core.urls.save(&url, 200, 0);
    }

    stream_response(core, conn, probe_ip, resp).await
}

/// Acceleration entry for a cache hit. A URL recorded as a 206 is never
/// range-split; the recorded answer stands until the cache entry changes.
async fn accelerate_known<S: AsyncRead + AsyncWrite + Unpin>(
    core: &Arc<Core>,
    conn: &mut H1Conn<S>,
    req: &ParsedRequest,
    url: &str,
    size: i64,
    code: i64,
) -> Result<LoopAction> {
    if code == i64::from(StatusCode::PARTIAL_CONTENT.as_u16()) {
        info!("{url} recorded as 206, leaving untouched");
        return Ok(LoopAction::Close);
    }
    if code != i64::from(StatusCode::OK.as_u16()) {
        info!("{url} recorded as {code}, not accelerating");
        return Ok(LoopAction::Close);
    }
    info!("accelerating {url} from cache ({size} bytes)");
    accelerate(core, conn, req, url, size as u64).await
}

/// Take over the connection: write the chunked preamble and run the planned
/// multi-range download into the raw stream.
async fn accelerate<S: AsyncRead + AsyncWrite + Unpin>(
    core: &Arc<Core>,
    conn: &mut H1Conn<S>,
    req: &ParsedRequest,
    url: &str,
    total: u64,
) -> Result<LoopAction> {
    let snapshot = core.choices.load();
    let tasks = match planner::plan(total, &snapshot, &core.best_chunks) {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!("planning {url} failed: {e}");
            return Ok(LoopAction::Close);
        }
    };

    write_accel_preamble(conn.stream_mut(), total)
        .await
        .context("failed to write accelerated response head")?;

    let headers = sanitize_headers(&req.headers);
    match core
        .engine
        .run(conn.stream_mut(), url, &headers, tasks, total, &core.shutdown)
        .await
    {
        Ok(()) => info!("accelerated download of {url} complete"),
        Err(e) => warn!("accelerated download of {url} aborted: {e}"),
    }
    Ok(LoopAction::Close)
}

async fn send_probe(
    core: &Arc<Core>,
    probe_ip: IpAddr,
    req: &ParsedRequest,
    url: &str,
) -> Result<Response<Incoming>> {
    let bundle = core
        .pool
        .bundle(probe_ip)
        .ok_or_else(|| anyhow!("no clients bound to {probe_ip}"))?;

    let method: Method = req
        .method
        .parse()
        .map_err(|_| anyhow!("unsupported method {}", req.method))?;
    let body = if method == Method::HEAD {
        Bytes::new()
    } else {
        req.body.clone()
    };

    let mut upstream = Request::builder()
        .method(method)
        .uri(url)
        .body(Full::new(body))
        .context("failed to build upstream request")?;
    *upstream.headers_mut() = sanitize_headers(&req.headers);

    bundle.probe_request(upstream).await
}

/// Copy an upstream response to the client as-is, counting body bytes into
/// the probe lane of the interface that fetched it.
async fn stream_response<S: AsyncRead + AsyncWrite + Unpin>(
    core: &Arc<Core>,
    conn: &mut H1Conn<S>,
    probe_ip: IpAddr,
    resp: Response<Incoming>,
) -> Result<LoopAction> {
    let (parts, mut body) = resp.into_parts();

    let mut headers = parts.headers.clone();
    headers.remove(CONTENT_RANGE);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    // Without a length the client cannot frame the body, so the connection
    // itself must delimit it.
    let keep_alive = headers.contains_key(CONTENT_LENGTH);
    if !keep_alive {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let status = parts.status;
    write_response_head(
        conn.stream_mut(),
        status.as_u16(),
        status.canonical_reason().unwrap_or("OK"),
        &headers,
    )
    .await
    .context("failed to write response head")?;

    while let Some(frame) = body.frame().await {
        let frame = frame.context("upstream body read failed")?;
        if let Some(data) = frame.data_ref() {
            core.ledger.add(probe_ip, Lane::Probe, data.len() as u64);
            conn.stream_mut()
                .write_all(data)
                .await
                .context("client write failed")?;
        }
    }
    conn.stream_mut()
        .flush()
        .await
        .context("client flush failed")?;

    Ok(if keep_alive {
        LoopAction::Next
    } else {
        LoopAction::Close
    })
}

/// Probe classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeVerdict {
    pub accelerate: bool,
    pub size: i64,
    pub code: i64,
}

/// Decide from the probe response whether the object is worth range-
/// splitting. 206 answers are recorded but never accelerated; a client that
/// asked for a range gets its range.
pub fn resp_deal(status: StatusCode, headers: &HeaderMap) -> Result<ProbeVerdict> {
    match status {
        StatusCode::PARTIAL_CONTENT => {
            let cr = header_str(headers, CONTENT_RANGE);
            let (total, _, ok) = parse_content_range_total(cr);
            if ok {
                Ok(ProbeVerdict {
                    accelerate: false,
                    size: total,
                    code: 206,
                })
            } else {
                Err(anyhow!("206 response but invalid Content-Range: {cr}"))
            }
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            let cr = header_str(headers, CONTENT_RANGE);
            Err(anyhow!("range not satisfiable: {cr}"))
        }
        StatusCode::OK => {
            let content_length = header_str(headers, CONTENT_LENGTH)
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|n| *n >= 0);
            let accept_ranges = header_str(headers, ACCEPT_RANGES);
            match content_length {
                Some(size) => Ok(ProbeVerdict {
                    accelerate: size >= ACCEL_THRESHOLD && accept_ranges == "bytes",
                    size,
                    code: 200,
                }),
                None => Ok(ProbeVerdict {
                    accelerate: false,
                    size: -1,
                    code: 200,
                }),
            }
        }
        other => Err(anyhow!("unhandled probe status code: {other}")),
    }
}

fn header_str(headers: &HeaderMap, name: hyper::header::HeaderName) -> &str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

/// Parse a `Content-Range` value into `(total, range_len, ok)`.
///
/// Handles both `bytes 0-0/207322416` (206) and `bytes */207322416` (416).
/// `total` is `-1` for `*` or an unparsable figure; `ok` is true only when
/// the `a-b` part parses with `a <= b`.
pub fn parse_content_range_total(cr: &str) -> (i64, i64, bool) {
    let cr = cr.trim();
    if cr.is_empty() || cr.len() < 6 || !cr.to_ascii_lowercase().starts_with("byte") {
        return (-1, -1, false);
    }
    let range_str = cr[6..].trim();

    let Some(slash) = range_str.rfind('/') else {
        return (-1, -1, false);
    };
    let range_part = range_str[..slash].trim();
    let total_part = range_str[slash + 1..].trim();

    let mut total: i64 = -1;
    if total_part != "*" {
        if let Ok(t) = total_part.parse::<i64>() {
            if t >= 0 {
                total = t;
            }
        }
    }

    let Some(dash) = range_part.find('-') else {
        return (-1, total, false);
    };
    let start = range_part[..dash].trim().parse::<i64>();
    let end = range_part[dash + 1..].trim().parse::<i64>();
    match (start, end) {
        (Ok(start), Ok(end)) if start <= end => (total, end - start + 1, true),
        _ => (-1, total, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                hyper::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn content_range_of_206_probe() {
        let (total, len, ok) = parse_content_range_total("bytes 0-0/207322416");
        assert!(ok);
        assert_eq!(total, 207_322_416);
        assert_eq!(len, 1);
    }

    #[test]
    fn content_range_of_416() {
        let (total, len, ok) = parse_content_range_total("bytes */207322416");
        assert!(!ok);
        assert_eq!(total, -1);
        assert_eq!(len, 207_322_416);
    }

    #[test]
    fn content_range_mid_file() {
        let (total, len, ok) = parse_content_range_total("bytes 36700160-41943039/207322416");
        assert!(ok);
        assert_eq!(total, 207_322_416);
        assert_eq!(len, 5_242_880);
    }

    #[test]
    fn content_range_garbage() {
        assert_eq!(parse_content_range_total(""), (-1, -1, false));
        assert_eq!(parse_content_range_total("items 0-1/5"), (-1, -1, false));
        assert_eq!(parse_content_range_total("bytes 5-1/10"), (-1, 10, false));
        assert_eq!(parse_content_range_total("bytes 0-1"), (-1, -1, false));
    }

    #[test]
    fn large_ranged_object_accelerates() {
        let verdict = resp_deal(
            StatusCode::OK,
            &headers(&[("content-length", "200000000"), ("accept-ranges", "bytes")]),
        )
        .unwrap();
        assert_eq!(
            verdict,
            ProbeVerdict {
                accelerate: true,
                size: 200_000_000,
                code: 200
            }
        );
    }

    #[test]
    fn small_object_streams() {
        let verdict = resp_deal(
            StatusCode::OK,
            &headers(&[("content-length", "1000000"), ("accept-ranges", "bytes")]),
        )
        .unwrap();
        assert_eq!(
            verdict,
            ProbeVerdict {
                accelerate: false,
                size: 1_000_000,
                code: 200
            }
        );
    }

    #[test]
    fn large_object_without_ranges_streams() {
        let verdict = resp_deal(
            StatusCode::OK,
            &headers(&[("content-length", "200000000")]),
        )
        .unwrap();
        assert!(!verdict.accelerate);
    }

    #[test]
    fn partial_content_never_accelerates() {
        let verdict = resp_deal(
            StatusCode::PARTIAL_CONTENT,
            &headers(&[("content-range", "bytes 0-0/207322416")]),
        )
        .unwrap();
        assert_eq!(
            verdict,
            ProbeVerdict {
                accelerate: false,
                size: 207_322_416,
                code: 206
            }
        );
    }

    #[test]
    fn missing_length_is_unknown_size() {
        let verdict = resp_deal(StatusCode::OK, &HeaderMap::new()).unwrap();
        assert_eq!(
            verdict,
            ProbeVerdict {
                accelerate: false,
                size: -1,
                code: 200
            }
        );
    }

    #[test]
    fn odd_statuses_error() {
        assert!(resp_deal(StatusCode::RANGE_NOT_SATISFIABLE, &HeaderMap::new()).is_err());
        assert!(resp_deal(StatusCode::IM_A_TEAPOT, &HeaderMap::new()).is_err());
    }
}
