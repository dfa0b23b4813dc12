use crate::config::COMMON_CLIENTS;
use anyhow::{bail, Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::warn;

pub type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const PROBE_IDLE: Duration = Duration::from_secs(120);
const COMMON_IDLE: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Clients for one interface: a short-deadline probe client plus
/// `COMMON_CLIENTS` long-lived ranged-fetch clients. Every connector binds
/// its outbound sockets to the interface address, so the kernel routes each
/// bundle's traffic out of its own NIC.
pub struct ClientBundle {
    pub ip: IpAddr,
    probe: HttpsClient,
    common: Vec<HttpsClient>,
}

impl ClientBundle {
    fn new(ip: IpAddr) -> Self {
        let probe = build_client(ip, PROBE_IDLE);
        let common = (0..COMMON_CLIENTS).map(|_| build_client(ip, COMMON_IDLE)).collect();
        Self { ip, probe, common }
    }

    /// Issue a request on the probe client. Response headers must arrive
    /// within the probe deadline.
    pub async fn probe_request(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        match tokio::time::timeout(PROBE_TIMEOUT, self.probe.request(req)).await {
            Ok(resp) => resp.context("probe request failed"),
            Err(_) => bail!("probe request timed out after {PROBE_TIMEOUT:?}"),
        }
    }

    /// Issue a request on a common client. No deadline; ranged fetches of
    /// large objects can legitimately run for minutes.
    pub async fn common_request(
        &self,
        slot: u8,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>> {
        let client = &self.common[usize::from(slot) % COMMON_CLIENTS];
        client.request(req).await.context("ranged request failed")
    }
}

/// All per-interface client bundles, keyed by egress IP.
pub struct ClientPool {
    bundles: HashMap<IpAddr, ClientBundle>,
}

impl ClientPool {
    pub fn new(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let bundles = ips.into_iter().map(|ip| (ip, ClientBundle::new(ip))).collect();
        Self { bundles }
    }

    pub fn bundle(&self, ip: IpAddr) -> Option<&ClientBundle> {
        self.bundles.get(&ip)
    }

    pub fn ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.bundles.keys().copied()
    }
}

fn build_client(ip: IpAddr, idle: Duration) -> HttpsClient {
    let mut http = HttpConnector::new();
    http.set_local_address(Some(ip));
    http.set_connect_timeout(Some(DIAL_TIMEOUT));
    http.set_keepalive(Some(TCP_KEEPALIVE));
    http.enforce_http(false);

    let https = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
        Ok(builder) => builder,
        Err(e) => {
            warn!("failed to load native TLS roots ({e}), falling back to webpki roots");
            hyper_rustls::HttpsConnectorBuilder::new().with_webpki_roots()
        }
    }
    .https_or_http()
    .enable_http1()
    .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(idle)
        .pool_max_idle_per_host(10)
        .build(https)
}
