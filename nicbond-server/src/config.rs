use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Minimum object size before range-splitting is attempted.
pub const ACCEL_THRESHOLD: i64 = 100 * 1024 * 1024;

/// Worker count for an accelerated download (head lane + pool).
pub const WORKERS: usize = 5;

/// Ranged-fetch clients per interface.
pub const COMMON_CLIENTS: usize = 2;

/// Capacity-model tick.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Slice size used when an interface has no measured best chunk.
pub const DEFAULT_CHUNK: u64 = 5 * 1024 * 1024;

/// Maximum fetch attempts per chunk.
pub const MAX_ATTEMPTS: u32 = 3;

/// Runtime configuration, resolved once at startup from environment
/// overrides over built-in defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub dashboard_addr: SocketAddr,
    pub cert_dir: PathBuf,
    pub policy_path: PathBuf,
    pub cache_dir: PathBuf,
    pub speedtest: SpeedTestConfig,
    /// Keep in-flight ranged fetches running after the client goes away.
    pub continue_on_client_close: bool,
}

#[derive(Debug, Clone)]
pub struct SpeedTestConfig {
    pub ping_host: String,
    pub ping_port: u16,
    pub ping_timeout: Duration,
    pub ping_attempts: u32,
    pub test_url: String,
    pub parallel_streams: usize,
    pub sample_interval: Duration,
    pub max_duration: Duration,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            ping_host: "wirelesscdn-download.xuexi.cn".to_string(),
            ping_port: 443,
            ping_timeout: Duration::from_secs(5),
            ping_attempts: 5,
            test_url:
                "https://wirelesscdn-download.xuexi.cn/publish/xuexi_android/latest/xuexi_android_10002068.apk"
                    .to_string(),
            parallel_streams: 3,
            sample_interval: Duration::from_millis(250),
            max_duration: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let listen_addr = env_parse("NICBOND_LISTEN", "127.0.0.1:10808");
        let dashboard_addr = env_parse("NICBOND_DASHBOARD", "127.0.0.1:8088");

        let root = std::env::var("NICBOND_ROOT").map_or_else(|_| PathBuf::from("."), PathBuf::from);

        let mut speedtest = SpeedTestConfig::default();
        if let Ok(url) = std::env::var("NICBOND_SPEEDTEST_URL") {
            speedtest.test_url = url;
        }
        if let Ok(host) = std::env::var("NICBOND_PING_HOST") {
            speedtest.ping_host = host;
        }

        Self {
            listen_addr,
            dashboard_addr,
            cert_dir: root.join("certs"),
            policy_path: root.join("HostPolicy.json"),
            cache_dir: root.join("Cache"),
            speedtest,
            continue_on_client_close: std::env::var("NICBOND_KEEP_FETCHING_ON_CLOSE")
                .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        }
    }
}

fn env_parse(var: &str, default: &str) -> SocketAddr {
    let raw = std::env::var(var).unwrap_or_else(|_| default.to_string());
    raw.parse().unwrap_or_else(|_| {
        default
            .parse()
            .expect("built-in default address must parse")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let cfg = Config::from_env();
        assert_eq!(cfg.listen_addr.port(), 10808);
        assert_eq!(cfg.dashboard_addr.port(), 8088);
        assert!(cfg.policy_path.ends_with("HostPolicy.json"));
    }
}
