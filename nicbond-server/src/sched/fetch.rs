use super::{ChunkTask, FetchError};
use crate::config::{MAX_ATTEMPTS, WORKERS};
use crate::net::clients::ClientPool;
use crate::net::ledger::{ByteLedger, Lane};
use crate::proxy::http1::{write_final_frame, write_frame_end, write_frame_header};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, RANGE};
use hyper::{Method, Request, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RETRY_BASE: Duration = Duration::from_millis(200);

/// Runs planned downloads: a sequential head lane that gets bytes flowing to
/// the client immediately, a worker pool draining the remaining ranges out
/// of order, and an ordered emitter reassembling them into chunked frames.
pub struct FetchEngine {
    pool: Arc<ClientPool>,
    ledger: Arc<ByteLedger>,
    continue_on_client_close: bool,
}

struct ChunkResult {
    task: ChunkTask,
    outcome: Result<Bytes, FetchError>,
}

impl FetchEngine {
    pub fn new(
        pool: Arc<ClientPool>,
        ledger: Arc<ByteLedger>,
        continue_on_client_close: bool,
    ) -> Self {
        Self {
            pool,
            ledger,
            continue_on_client_close,
        }
    }

    /// Fetch every planned range and write the body as chunked frames in
    /// strict index order. The accelerated response head must already be on
    /// the wire.
    pub async fn run<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        url: &str,
        headers: &HeaderMap,
        tasks: Vec<ChunkTask>,
        total_size: u64,
        shutdown: &CancellationToken,
    ) -> Result<(), FetchError> {
        let job = shutdown.child_token();
        let direct = CancellationToken::new();

        let (head, tail) = split_head_lane(tasks, total_size / WORKERS as u64);
        debug!(
            "download split: {} head tasks, {} pool tasks, {} bytes",
            head.len(),
            tail.len(),
            total_size
        );

        let tail_count = tail.len();
        let first_tail_index = tail.first().map(|t| t.index);
        let cap = (tail_count * MAX_ATTEMPTS as usize + WORKERS).max(1);
        let (task_tx, task_rx) = mpsc::channel::<ChunkTask>(cap);
        let (res_tx, res_rx) = mpsc::channel::<ChunkResult>(cap);

        let task_rx = Arc::new(Mutex::new(task_rx));
        for _ in 0..WORKERS - 1 {
            tokio::spawn(worker(
                self.pool.clone(),
                self.ledger.clone(),
                url.to_string(),
                headers.clone(),
                task_rx.clone(),
                res_tx.clone(),
                job.clone(),
            ));
        }
        drop(res_tx);

        for task in tail {
            // Capacity covers every task plus retries, so this never blocks.
            let _ = task_tx.send(task).await;
        }

        let tracker = TailTracker {
            pending: HashMap::new(),
            remaining: tail_count,
            task_tx,
            job: job.clone(),
            fatal: None,
        };
        let collector = tokio::spawn(collect_phase(tracker, res_rx, direct.clone(), job.clone()));

        let head_result = self.run_head_lane(writer, url, headers, head, &job).await;
        direct.cancel();

        let (mut tracker, mut res_rx) = collector
            .await
            .map_err(|_| FetchError::Fatal("result collector panicked".to_string()))?;

        // A pool failure recorded while the head lane was running outranks
        // whatever the head lane saw after the job was cancelled under it.
        if let Some(fatal) = tracker.fatal.take() {
            return Err(fatal);
        }
        if let Err(e) = head_result {
            if !matches!(e, FetchError::ClientDisconnected) || !self.continue_on_client_close {
                job.cancel();
            }
            return Err(e);
        }

        // Emit phase: the head lane is done, tail bytes may flow.
        let mut next = first_tail_index.unwrap_or(0);
        loop {
            while let Some(bytes) = tracker.pending.remove(&next) {
                if let Err(e) = write_frame(writer, &bytes).await {
                    return Err(self.client_gone(&job, &e));
                }
                next += 1;
                tracker.remaining -= 1;
            }
            if tracker.remaining == 0 {
                break;
            }
            if let Some(fatal) = tracker.fatal.take() {
                return Err(fatal);
            }
            tokio::select! {
                _ = job.cancelled() => {
                    return Err(tracker.fatal.take().unwrap_or(FetchError::Cancelled));
                }
                res = res_rx.recv() => match res {
                    Some(res) => tracker.on_result(res),
                    None => {
                        return Err(FetchError::Fatal(
                            "worker pool exited with ranges outstanding".to_string(),
                        ));
                    }
                }
            }
        }

        write_final_frame(writer)
            .await
            .map_err(|e| self.client_gone(&job, &e))?;
        Ok(())
    }

    /// Head lane: fetch the prefix strictly in order, piping each response
    /// body straight into the client as one chunked frame.
    async fn run_head_lane<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        url: &str,
        headers: &HeaderMap,
        head: Vec<ChunkTask>,
        job: &CancellationToken,
    ) -> Result<(), FetchError> {
        for mut task in head {
            loop {
                task.attempt += 1;
                match self.stream_head_task(writer, url, headers, &task, job).await {
                    Ok(()) => break,
                    Err(HeadFailure::BeforeWrite(e))
                        if e.is_retryable() && task.attempt < MAX_ATTEMPTS =>
                    {
                        let delay = backoff(task.attempt);
                        warn!(
                            "head chunk {} attempt {} failed ({e}), retrying in {delay:?}",
                            task.index, task.attempt
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(HeadFailure::BeforeWrite(e)) => {
                        return Err(escalate(e, &task));
                    }
                    Err(HeadFailure::ClientWrite(e)) => {
                        return Err(self.client_gone(job, &e));
                    }
                    Err(HeadFailure::MidStream(msg)) => {
                        return Err(FetchError::Fatal(format!(
                            "chunk {} failed mid-frame: {msg}",
                            task.index
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn stream_head_task<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        url: &str,
        headers: &HeaderMap,
        task: &ChunkTask,
        job: &CancellationToken,
    ) -> Result<(), HeadFailure> {
        let bundle = self
            .pool
            .bundle(task.nic_ip)
            .ok_or_else(|| {
                HeadFailure::BeforeWrite(FetchError::Fatal(format!(
                    "no clients bound to {}",
                    task.nic_ip
                )))
            })?;
        let req = ranged_request(url, headers, task).map_err(HeadFailure::BeforeWrite)?;

        let resp = tokio::select! {
            _ = job.cancelled() => return Err(HeadFailure::BeforeWrite(FetchError::Cancelled)),
            r = bundle.common_request(task.slot, req) => {
                r.map_err(|e| HeadFailure::BeforeWrite(FetchError::Retryable(format!("{e:#}"))))?
            }
        };
        check_range_status(resp.status()).map_err(HeadFailure::BeforeWrite)?;

        write_frame_header(writer, task.size())
            .await
            .map_err(HeadFailure::ClientWrite)?;

        let mut received: u64 = 0;
        let mut body = resp.into_body();
        loop {
            let frame = tokio::select! {
                _ = job.cancelled() => {
                    return Err(HeadFailure::MidStream("download cancelled".to_string()));
                }
                frame = body.frame() => frame,
            };
            match frame {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        received += data.len() as u64;
                        if received > task.size() {
                            return Err(HeadFailure::MidStream(format!(
                                "origin overran range by {} bytes",
                                received - task.size()
                            )));
                        }
                        self.ledger
                            .add(task.nic_ip, Lane::Common(task.slot), data.len() as u64);
                        writer
                            .write_all(data)
                            .await
                            .map_err(HeadFailure::ClientWrite)?;
                    }
                }
                Some(Err(e)) => {
                    return Err(HeadFailure::MidStream(format!("range body read failed: {e}")));
                }
                None => break,
            }
        }
        if received != task.size() {
            return Err(HeadFailure::MidStream(format!(
                "short range body: got {received} of {}",
                task.size()
            )));
        }

        write_frame_end(writer).await.map_err(HeadFailure::ClientWrite)?;
        writer.flush().await.map_err(HeadFailure::ClientWrite)?;
        Ok(())
    }

    fn client_gone(&self, job: &CancellationToken, e: &std::io::Error) -> FetchError {
        debug!("client write failed: {e}");
        if !self.continue_on_client_close {
            job.cancel();
        }
        FetchError::ClientDisconnected
    }
}

struct TailTracker {
    pending: HashMap<usize, Bytes>,
    remaining: usize,
    task_tx: mpsc::Sender<ChunkTask>,
    job: CancellationToken,
    fatal: Option<FetchError>,
}

impl TailTracker {
    fn on_result(&mut self, res: ChunkResult) {
        match res.outcome {
            Ok(bytes) => {
                self.pending.insert(res.task.index, bytes);
            }
            Err(e) if e.is_retryable() && res.task.attempt < MAX_ATTEMPTS => {
                let delay = backoff(res.task.attempt);
                warn!(
                    "chunk {} attempt {} failed ({e}), retrying in {delay:?}",
                    res.task.index, res.task.attempt
                );
                let task_tx = self.task_tx.clone();
                let task = res.task;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = task_tx.send(task).await;
                });
            }
            Err(e) => {
                if self.fatal.is_none() {
                    self.fatal = Some(escalate(e, &res.task));
                }
                self.job.cancel();
            }
        }
    }
}

/// Bookkeeping that runs while the head lane still owns the client stream:
/// buffer successes, schedule retries, record the first fatal failure.
async fn collect_phase(
    mut tracker: TailTracker,
    mut res_rx: mpsc::Receiver<ChunkResult>,
    direct: CancellationToken,
    job: CancellationToken,
) -> (TailTracker, mpsc::Receiver<ChunkResult>) {
    loop {
        tokio::select! {
            _ = direct.cancelled() => return (tracker, res_rx),
            _ = job.cancelled() => return (tracker, res_rx),
            res = res_rx.recv() => match res {
                Some(res) => tracker.on_result(res),
                None => return (tracker, res_rx),
            }
        }
    }
}

async fn worker(
    pool: Arc<ClientPool>,
    ledger: Arc<ByteLedger>,
    url: String,
    headers: HeaderMap,
    task_rx: Arc<Mutex<mpsc::Receiver<ChunkTask>>>,
    res_tx: mpsc::Sender<ChunkResult>,
    job: CancellationToken,
) {
    loop {
        let mut task = {
            let mut rx = task_rx.lock().await;
            tokio::select! {
                _ = job.cancelled() => return,
                t = rx.recv() => match t {
                    Some(t) => t,
                    None => return,
                }
            }
        };
        task.attempt += 1;
        let outcome = fetch_range(&pool, &ledger, &url, &headers, &task, &job).await;
        if res_tx.send(ChunkResult { task, outcome }).await.is_err() {
            return;
        }
    }
}

/// Pull one full range into memory, accounting bytes as they arrive.
async fn fetch_range(
    pool: &ClientPool,
    ledger: &ByteLedger,
    url: &str,
    headers: &HeaderMap,
    task: &ChunkTask,
    job: &CancellationToken,
) -> Result<Bytes, FetchError> {
    let bundle = pool
        .bundle(task.nic_ip)
        .ok_or_else(|| FetchError::Fatal(format!("no clients bound to {}", task.nic_ip)))?;
    let req = ranged_request(url, headers, task)?;

    let resp = tokio::select! {
        _ = job.cancelled() => return Err(FetchError::Cancelled),
        r = bundle.common_request(task.slot, req) => {
            r.map_err(|e| FetchError::Retryable(format!("{e:#}")))?
        }
    };
    check_range_status(resp.status())?;

    let mut buf: Vec<u8> = Vec::with_capacity(task.size() as usize);
    let mut body = resp.into_body();
    loop {
        let frame = tokio::select! {
            _ = job.cancelled() => return Err(FetchError::Cancelled),
            frame = body.frame() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    ledger.add(task.nic_ip, Lane::Common(task.slot), data.len() as u64);
                    if buf.len() + data.len() > task.size() as usize {
                        return Err(FetchError::Retryable(
                            "origin sent more bytes than the range asked for".to_string(),
                        ));
                    }
                    buf.extend_from_slice(data);
                }
            }
            Some(Err(e)) => {
                return Err(FetchError::Retryable(format!("range body read failed: {e}")));
            }
            None => break,
        }
    }
    if buf.len() as u64 != task.size() {
        return Err(FetchError::Retryable(format!(
            "short range body: got {} of {}",
            buf.len(),
            task.size()
        )));
    }
    Ok(Bytes::from(buf))
}

fn ranged_request(
    url: &str,
    headers: &HeaderMap,
    task: &ChunkTask,
) -> Result<Request<Full<Bytes>>, FetchError> {
    let mut req = Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(Full::new(Bytes::new()))
        .map_err(|e| FetchError::Fatal(format!("failed to build ranged request: {e}")))?;
    *req.headers_mut() = headers.clone();
    req.headers_mut().remove(RANGE);
    req.headers_mut().remove(CONTENT_LENGTH);
    let range = HeaderValue::from_str(&format!("bytes={}-{}", task.start, task.end))
        .map_err(|e| FetchError::Fatal(format!("bad range value: {e}")))?;
    req.headers_mut().insert(RANGE, range);
    Ok(req)
}

fn check_range_status(status: StatusCode) -> Result<(), FetchError> {
    if status == StatusCode::PARTIAL_CONTENT {
        return Ok(());
    }
    if status.is_server_error() {
        return Err(FetchError::Retryable(format!(
            "origin answered {status} to ranged request"
        )));
    }
    Err(FetchError::Fatal(format!(
        "origin answered {status} to ranged request"
    )))
}

fn escalate(e: FetchError, task: &ChunkTask) -> FetchError {
    match e {
        FetchError::Cancelled | FetchError::ClientDisconnected => e,
        other => FetchError::Fatal(format!("chunk {} failed: {other}", task.index)),
    }
}

fn backoff(attempt: u32) -> Duration {
    RETRY_BASE * 2u32.pow(attempt.saturating_sub(1))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &Bytes) -> std::io::Result<()> {
    write_frame_header(writer, bytes.len() as u64).await?;
    writer.write_all(bytes).await?;
    write_frame_end(writer).await?;
    writer.flush().await
}

enum HeadFailure {
    /// Failed before any byte of the frame reached the client; retryable.
    BeforeWrite(FetchError),
    /// The client side of the connection failed.
    ClientWrite(std::io::Error),
    /// Failed after the frame header was written; the stream is poisoned.
    MidStream(String),
}

/// The ordered prefix whose cumulative size first exceeds `threshold` is
/// fetched by the head lane; everything after it goes to the pool.
fn split_head_lane(mut tasks: Vec<ChunkTask>, threshold: u64) -> (Vec<ChunkTask>, Vec<ChunkTask>) {
    let mut cumulative = 0u64;
    let mut split = tasks.len();
    for (i, task) in tasks.iter().enumerate() {
        cumulative += task.size();
        if cumulative > threshold {
            split = i + 1;
            break;
        }
    }
    let tail = tasks.split_off(split);
    (tasks, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(index: usize, start: u64, end: u64) -> ChunkTask {
        ChunkTask {
            index,
            start,
            end,
            attempt: 0,
            nic_ip: "10.0.0.1".parse().unwrap(),
            slot: 0,
        }
    }

    #[test]
    fn head_lane_takes_crossing_prefix() {
        let tasks = vec![
            task(0, 0, 999_999),
            task(1, 1_000_000, 1_999_999),
            task(2, 2_000_000, 2_999_999),
        ];
        let (head, tail) = split_head_lane(tasks, 500_000);
        assert_eq!(head.len(), 1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 1);
    }

    #[test]
    fn head_lane_may_consume_everything() {
        let tasks = vec![
            task(0, 0, 99_999),
            task(1, 100_000, 199_999),
            task(2, 200_000, 299_999),
        ];
        let (head, tail) = split_head_lane(tasks, 500_000);
        assert_eq!(head.len(), 3);
        assert!(tail.is_empty());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff(1), Duration::from_millis(200));
        assert_eq!(backoff(2), Duration::from_millis(400));
        assert_eq!(backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn range_status_classification() {
        assert!(check_range_status(StatusCode::PARTIAL_CONTENT).is_ok());
        assert!(matches!(
            check_range_status(StatusCode::BAD_GATEWAY),
            Err(FetchError::Retryable(_))
        ));
        assert!(matches!(
            check_range_status(StatusCode::OK),
            Err(FetchError::Fatal(_))
        ));
    }

    #[test]
    fn non_retryable_failures_escalate_with_chunk_context() {
        let t = task(3, 0, 9);
        let e = escalate(FetchError::Retryable("reset".to_string()), &t);
        assert!(matches!(&e, FetchError::Fatal(msg) if msg.contains("chunk 3")));
        assert!(matches!(
            escalate(FetchError::Cancelled, &t),
            FetchError::Cancelled
        ));
    }
}
