pub mod cache;
pub mod config;
pub mod dashboard;
pub mod net;
pub mod policy;
pub mod proxy;
pub mod sched;
pub mod telemetry;
pub mod tls;

use cache::UrlStore;
use config::Config;
use net::capacity::ChoiceCell;
use net::clients::ClientPool;
use net::ledger::ByteLedger;
use policy::PolicyStore;
use sched::fetch::FetchEngine;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tls::forge::ForgeCache;
use tokio_util::sync::CancellationToken;

/// Everything the request path needs, owned in one place and passed by
/// reference. No module-level singletons.
pub struct Core {
    pub config: Config,
    pub policy: PolicyStore,
    pub urls: UrlStore,
    pub forge: ForgeCache,
    pub pool: Arc<ClientPool>,
    pub ledger: Arc<ByteLedger>,
    pub choices: Arc<ChoiceCell>,
    pub best_chunks: HashMap<IpAddr, u64>,
    pub engine: FetchEngine,
    pub shutdown: CancellationToken,
}
