use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use nicbond_server::net::capacity::{ChunkEntry, LaneChoices};
use nicbond_server::net::clients::ClientPool;
use nicbond_server::net::ledger::{ByteLedger, Lane};
use nicbond_server::sched::fetch::FetchEngine;
use nicbond_server::sched::planner;
use nicbond_server::sched::FetchError;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

const LOCAL: &str = "127.0.0.1";

#[derive(Clone, Copy)]
enum FailMode {
    None,
    /// Answer the nth request (1-based) with a 503, once.
    NthRequest(usize),
    /// Answer every request for the range starting here with a 503.
    AlwaysAtOffset(u64),
}

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn object(len: usize) -> Bytes {
    let mut data = Vec::with_capacity(len);
    for i in 0..len {
        data.push(((i * 31 + 7) % 251) as u8);
    }
    Bytes::from(data)
}

/// A loopback origin that understands single-range requests.
async fn start_origin(data: Bytes, fail: FailMode) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind((LOCAL, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));

    let counter = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let data = data.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let data = data.clone();
                    let counter = counter.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(respond(&req, &data, &counter, fail))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, requests)
}

fn respond(
    req: &Request<hyper::body::Incoming>,
    data: &Bytes,
    counter: &AtomicUsize,
    fail: FailMode,
) -> Response<Full<Bytes>> {
    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;

    let range = req
        .headers()
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    let failed = match fail {
        FailMode::None => false,
        FailMode::NthRequest(target) => n == target,
        FailMode::AlwaysAtOffset(offset) => range.is_some_and(|(start, _)| start == offset),
    };
    if failed {
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Full::new(Bytes::new()))
            .unwrap();
    }

    match range {
        Some((start, end)) if end < data.len() as u64 => {
            let body = data.slice(start as usize..=end as usize);
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    CONTENT_RANGE,
                    format!("bytes {start}-{end}/{}", data.len()),
                )
                .header(CONTENT_LENGTH, body.len())
                .body(Full::new(body))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_LENGTH, data.len())
            .body(Full::new(data.clone()))
            .unwrap(),
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn loopback_choices() -> LaneChoices {
    let ip: IpAddr = LOCAL.parse().unwrap();
    let chunks = vec![
        ChunkEntry {
            ip,
            slot: 0,
            weight: 1.0,
        },
        ChunkEntry {
            ip,
            slot: 1,
            weight: 1.0,
        },
    ];
    LaneChoices {
        probe: Vec::new(),
        total_probe: 0.0,
        total_chunks: chunks.iter().map(|e| e.weight).sum(),
        chunks,
    }
}

/// Split a chunked-transfer body into its frames. Returns the frames and
/// whether the terminating zero frame was seen.
fn parse_chunked(mut buf: &[u8]) -> (Vec<Vec<u8>>, bool) {
    let mut frames = Vec::new();
    loop {
        let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
            return (frames, false);
        };
        let len_str = std::str::from_utf8(&buf[..line_end]).unwrap();
        let len = usize::from_str_radix(len_str, 16).unwrap();
        buf = &buf[line_end + 2..];
        if len == 0 {
            return (frames, buf.starts_with(b"\r\n"));
        }
        assert!(buf.len() >= len + 2, "truncated frame body");
        frames.push(buf[..len].to_vec());
        assert_eq!(&buf[len..len + 2], b"\r\n");
        buf = &buf[len + 2..];
    }
}

struct Run {
    result: Result<(), FetchError>,
    output: Vec<u8>,
    tasks: usize,
    total: u64,
    ledger: Arc<ByteLedger>,
}

async fn run_download(size: usize, fail: FailMode) -> (Run, Arc<AtomicUsize>) {
    install_provider();

    let data = object(size);
    let (addr, requests) = start_origin(data.clone(), fail).await;
    let url = format!("http://{LOCAL}:{}/big.bin", addr.port());

    let ip: IpAddr = LOCAL.parse().unwrap();
    let pool = Arc::new(ClientPool::new([ip]));
    let ledger = Arc::new(ByteLedger::new([ip]));
    let engine = FetchEngine::new(pool, ledger.clone(), false);

    let best_chunks: HashMap<IpAddr, u64> = [(ip, 100_000u64)].into();
    let choices = loopback_choices();
    let total = data.len() as u64;
    let tasks = planner::plan(total, &choices, &best_chunks).unwrap();
    let task_sizes: Vec<u64> = tasks.iter().map(|t| t.end - t.start + 1).collect();
    let task_count = tasks.len();

    let (mut writer, mut reader) = tokio::io::duplex(256 * 1024);
    let collector = tokio::spawn(async move {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    });

    let shutdown = CancellationToken::new();
    let headers = HeaderMap::from_iter([(
        hyper::header::USER_AGENT,
        HeaderValue::from_static("nicbond-test"),
    )]);
    let result = engine
        .run(&mut writer, &url, &headers, tasks, total, &shutdown)
        .await;
    drop(writer);
    let output = collector.await.unwrap();

    // Frames must appear in plan order whenever the run succeeded.
    if result.is_ok() {
        let (frames, terminated) = parse_chunked(&output);
        assert!(terminated, "missing terminating frame");
        let frame_sizes: Vec<u64> = frames.iter().map(|f| f.len() as u64).collect();
        assert_eq!(frame_sizes, task_sizes, "frames out of plan order");
        let body: Vec<u8> = frames.concat();
        assert_eq!(body.len(), size);
        assert_eq!(&body[..], &data[..], "reassembled bytes differ from origin");
    }

    (
        Run {
            result,
            output,
            tasks: task_count,
            total,
            ledger,
        },
        requests,
    )
}

#[tokio::test]
async fn accelerated_download_is_byte_exact() {
    let (run, requests) = run_download(1_200_000, FailMode::None).await;
    run.result.unwrap();
    assert_eq!(requests.load(Ordering::SeqCst), run.tasks);

    // Every body byte was accounted to a chunk lane.
    let ip: IpAddr = LOCAL.parse().unwrap();
    let counted = run.ledger.get(ip, Lane::Common(0)) + run.ledger.get(ip, Lane::Common(1));
    assert_eq!(counted, run.total);
}

#[tokio::test]
async fn one_transient_failure_is_retried() {
    let (run, requests) = run_download(1_200_000, FailMode::NthRequest(5)).await;
    run.result.unwrap();
    // Exactly one retry happened.
    assert_eq!(requests.load(Ordering::SeqCst), run.tasks + 1);
}

#[tokio::test]
async fn client_disconnect_aborts_quietly() {
    install_provider();

    let data = object(1_200_000);
    let (addr, _requests) = start_origin(data.clone(), FailMode::None).await;
    let url = format!("http://{LOCAL}:{}/big.bin", addr.port());

    let ip: IpAddr = LOCAL.parse().unwrap();
    let pool = Arc::new(ClientPool::new([ip]));
    let ledger = Arc::new(ByteLedger::new([ip]));
    let engine = FetchEngine::new(pool, ledger, false);

    let best_chunks: HashMap<IpAddr, u64> = [(ip, 100_000u64)].into();
    let total = data.len() as u64;
    let tasks = planner::plan(total, &loopback_choices(), &best_chunks).unwrap();

    let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);
    // The client walks away after 150 KB.
    let walker = tokio::spawn(async move {
        let mut taken = 0usize;
        let mut buf = [0u8; 8192];
        while taken < 150_000 {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => taken += n,
            }
        }
        drop(reader);
    });

    let shutdown = CancellationToken::new();
    let err = engine
        .run(&mut writer, &url, &HeaderMap::new(), tasks, total, &shutdown)
        .await
        .unwrap_err();
    assert!(
        matches!(err, FetchError::ClientDisconnected),
        "expected disconnect, got {err:?}"
    );
    walker.await.unwrap();
}

#[tokio::test]
async fn persistent_failure_cancels_the_job() {
    let (run, requests) = run_download(1_200_000, FailMode::AlwaysAtOffset(500_000)).await;
    let err = run.result.unwrap_err();
    assert!(
        matches!(err, FetchError::Fatal(_)),
        "expected fatal error, got {err:?}"
    );
    // The stream must not be reported complete.
    let (_, terminated) = parse_chunked(&run.output);
    assert!(!terminated, "failed download must not terminate cleanly");
    // The failing range was attempted at most three times.
    let attempts_at_offset = requests.load(Ordering::SeqCst);
    assert!(attempts_at_offset <= run.tasks + 2);
}
