use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

/// Size sentinel: URL has never been probed.
pub const SIZE_UNPROBED: i64 = -2;

/// URL suffixes that never need a probe; classified as small immediately.
const SMALL_EXTENSIONS: &[&str] = &[
    ".js", ".css", ".jsx", ".gif", ".ico", ".svg", ".ms4", ".ts", ".m3u8", "mpd",
];

/// Persistent URL metadata: two JSON side-tables mapping the full URL to its
/// last observed byte size and HTTP status code.
///
/// Size semantics: `>0` known length, `0` known small (200 with no usable
/// length), `-2` never probed.
pub struct UrlStore {
    sizes: RwLock<HashMap<String, i64>>,
    codes: RwLock<HashMap<String, i64>>,
    size_path: PathBuf,
    code_path: PathBuf,
}

impl UrlStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            sizes: RwLock::new(HashMap::new()),
            codes: RwLock::new(HashMap::new()),
            size_path: cache_dir.join("URIFileSize.json"),
            code_path: cache_dir.join("URICode.json"),
        }
    }

    /// Look up a URL. Returns `(found, size, code)`.
    ///
    /// A miss on a known-small extension short-circuits to `(false, 0, 200)`
    /// without any network involvement; any other miss reports
    /// `(false, -2, -2)`.
    pub fn check(&self, url: &str) -> (bool, i64, i64) {
        let sizes = self.sizes.read().expect("url size lock poisoned");
        if let Some(size) = sizes.get(url) {
            let code = self
                .codes
                .read()
                .expect("url code lock poisoned")
                .get(url)
                .copied()
                .unwrap_or(0);
            return (true, *size, code);
        }
        drop(sizes);

        let lower = url.to_ascii_lowercase();
        if SMALL_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            return (false, 0, 200);
        }
        (false, SIZE_UNPROBED, SIZE_UNPROBED)
    }

    pub fn save(&self, url: &str, code: i64, size: i64) {
        self.sizes
            .write()
            .expect("url size lock poisoned")
            .insert(url.to_string(), size);
        self.codes
            .write()
            .expect("url code lock poisoned")
            .insert(url.to_string(), code);
    }

    /// Load both side-tables. A missing or unreadable file leaves the store
    /// empty; the proxy still works, it just re-probes.
    pub fn load(&self) {
        if let Err(e) = load_table(&self.size_path, &self.sizes) {
            warn!("url size cache not loaded: {e:#}");
        }
        if let Err(e) = load_table(&self.code_path, &self.codes) {
            warn!("url code cache not loaded: {e:#}");
        }
    }

    /// Write both side-tables to disk, creating the cache directory.
    pub fn persist(&self) -> Result<()> {
        if let Some(dir) = self.size_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        }
        persist_table(&self.size_path, &self.sizes)?;
        persist_table(&self.code_path, &self.codes)?;
        info!("url metadata persisted");
        Ok(())
    }
}

fn load_table(path: &Path, table: &RwLock<HashMap<String, i64>>) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: HashMap<String, i64> = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let count = parsed.len();
    *table.write().expect("url cache lock poisoned") = parsed;
    info!("loaded {count} records from {}", path.display());
    Ok(())
}

fn persist_table(path: &Path, table: &RwLock<HashMap<String, i64>>) -> Result<()> {
    let snapshot = table.read().expect("url cache lock poisoned").clone();
    let data = serde_json::to_vec_pretty(&snapshot).context("failed to serialize url cache")?;
    std::fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
}
