use crate::config::{SpeedTestConfig, DEFAULT_CHUNK};
use crate::net::capacity::NicProfile;
use crate::net::clients::ClientPool;
use crate::net::inventory::NicInfo;
use anyhow::{Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MB: f64 = 1024.0 * 1024.0;
const RUNNING_PHASE_BYTES: u64 = 10 * 1024 * 1024;

/// Raw bulk-test figures, in MB/s.
#[derive(Debug, Clone, Copy)]
pub struct TestOutput {
    pub fastest: f64,
    pub low_avg: f64,
    pub standard: f64,
    pub best_chunk: u64,
}

/// Ping and warm-test every interface, producing its startup profile.
pub async fn run_all(
    nics: &[NicInfo],
    pool: &ClientPool,
    cfg: &SpeedTestConfig,
) -> HashMap<IpAddr, NicProfile> {
    let mut profiles = HashMap::new();
    for nic in nics {
        let ip = nic.ip_addr();
        let ping_ms = tcp_ping(ip, cfg).await;
        info!("interface {ip} ping to {}: {ping_ms} ms", cfg.ping_host);

        let output = match pool.bundle(ip) {
            Some(bundle) => match throughput(bundle, cfg).await {
                Ok(out) => out,
                Err(e) => {
                    warn!("throughput test on {ip} failed: {e:#}");
                    fallback_output()
                }
            },
            None => fallback_output(),
        };
        info!(
            "interface {ip}: standard {:.2} MB/s, fastest {:.2} MB/s, best chunk {} MB",
            output.standard,
            output.fastest,
            output.best_chunk / (1024 * 1024)
        );

        profiles.insert(
            ip,
            NicProfile {
                name: nic.name.clone(),
                ping_ms,
                low_avg: output.low_avg,
                standard: output.standard,
                fastest: output.fastest,
                best_chunk: output.best_chunk,
            },
        );
    }
    profiles
}

/// Average of five bound TCP connects to the canonical target, in
/// milliseconds. `-1` when the target is unreachable from this interface.
pub async fn tcp_ping(ip: IpAddr, cfg: &SpeedTestConfig) -> i64 {
    let mut sum_ms: i64 = 0;
    for _ in 0..cfg.ping_attempts {
        let started = Instant::now();
        match bound_connect(ip, &cfg.ping_host, cfg.ping_port, cfg).await {
            Ok(stream) => {
                sum_ms += started.elapsed().as_millis() as i64;
                drop(stream);
            }
            Err(e) => {
                warn!("tcp ping from {ip} failed: {e:#}");
                return -1;
            }
        }
    }
    sum_ms / i64::from(cfg.ping_attempts)
}

async fn bound_connect(
    ip: IpAddr,
    host: &str,
    port: u16,
    cfg: &SpeedTestConfig,
) -> Result<tokio::net::TcpStream> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}"))?;
    let remote = addrs
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("no IPv4 address for {host}"))?;

    let socket = TcpSocket::new_v4().context("failed to create socket")?;
    socket
        .bind(SocketAddr::new(ip, 0))
        .with_context(|| format!("failed to bind to {ip}"))?;
    tokio::time::timeout(cfg.ping_timeout, socket.connect(remote))
        .await
        .map_err(|_| anyhow::anyhow!("connect to {remote} timed out"))?
        .with_context(|| format!("connect to {remote} failed"))
}

/// Warm bulk download: three parallel streams of the test object, sampled
/// every 250 ms until the smoothed estimates catch up with the instantaneous
/// rate. The accumulated byte count doubles as the interface's best single
/// chunk size.
pub async fn throughput(
    bundle: &crate::net::clients::ClientBundle,
    cfg: &SpeedTestConfig,
) -> Result<TestOutput> {
    let total = Arc::new(AtomicU64::new(0));
    let cancel = CancellationToken::new();

    let mut fetchers = Vec::new();
    for _ in 0..cfg.parallel_streams {
        let req = Request::get(&cfg.test_url)
            .body(Full::new(Bytes::new()))
            .context("failed to build speed-test request")?;
        let resp = bundle.probe_request(req).await?;
        let mut body = resp.into_body();
        let total = total.clone();
        let cancel = cancel.clone();
        fetchers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = body.frame() => match frame {
                        Some(Ok(frame)) => {
                            if let Some(data) = frame.data_ref() {
                                total.fetch_add(data.len() as u64, Ordering::Relaxed);
                            }
                        }
                        _ => return,
                    }
                }
            }
        }));
    }

    let started = Instant::now();
    let mut running_since: Option<Instant> = None;
    let mut samples: Vec<u64> = Vec::new();
    let mut fastest_avg: f64 = 0.0;
    let interval_secs = cfg.sample_interval.as_secs_f64();

    let output = loop {
        tokio::time::sleep(cfg.sample_interval).await;
        let current = total.load(Ordering::Relaxed);
        samples.push(current);

        if let Some(run_start) = running_since {
            let speed_now = if samples.len() > 10 {
                let n = samples.len();
                (samples[n - 1] - samples[n - 4]) as f64 / (3.0 * interval_secs)
            } else {
                0.0
            };

            let speed_avg = current as f64 / started.elapsed().as_secs_f64();
            let speed_run_avg = current as f64 / run_start.elapsed().as_secs_f64();
            if speed_avg > fastest_avg {
                fastest_avg = speed_avg;
            }
            let standard = (speed_avg + speed_run_avg) / 2.0;

            let stabilized = speed_now != 0.0
                && ((standard + speed_now / 20.0 > speed_now && standard <= speed_now)
                    || (speed_now + speed_avg / 10.0 > speed_avg && speed_now <= speed_avg));
            if stabilized {
                break TestOutput {
                    fastest: fastest_avg / MB,
                    low_avg: speed_avg / MB,
                    standard: standard / MB,
                    best_chunk: current,
                };
            }
        } else if current >= RUNNING_PHASE_BYTES {
            running_since = Some(Instant::now());
        }

        if started.elapsed() >= cfg.max_duration {
            warn!("speed test did not stabilize within {:?}", cfg.max_duration);
            let speed_avg = current as f64 / started.elapsed().as_secs_f64();
            break TestOutput {
                fastest: fastest_avg.max(speed_avg) / MB,
                low_avg: speed_avg / MB,
                standard: speed_avg / MB,
                best_chunk: current.max(DEFAULT_CHUNK),
            };
        }
    };

    cancel.cancel();
    let _ = futures_util::future::join_all(fetchers).await;
    Ok(output)
}

fn fallback_output() -> TestOutput {
    TestOutput {
        fastest: 10.0,
        low_avg: 1.0,
        standard: 5.0,
        best_chunk: DEFAULT_CHUNK,
    }
}

/// The interface whose smoothed standard speed is highest; its bundle is the
/// first choice for probe traffic before real traffic shapes the weights.
pub fn best_probe_ip(profiles: &HashMap<IpAddr, NicProfile>) -> Option<IpAddr> {
    profiles
        .iter()
        .max_by(|a, b| a.1.standard.total_cmp(&b.1.standard))
        .map(|(&ip, _)| ip)
}
