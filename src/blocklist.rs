use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use url::Url;

/// Canonicalizes a free-form hostname or URL into a blocklist key.
///
/// Inputs containing `://` are parsed as URLs and contribute their host;
/// anything else is taken verbatim. The result is lowercased and a single
/// leading `www.` is stripped. Unparseable or empty input yields `None`.
pub fn normalize_host(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let host = if input.contains("://") {
        Url::parse(input).ok()?.host_str()?.to_ascii_lowercase()
    } else {
        input.to_ascii_lowercase()
    };

    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_owned())
    }
}

/// Set of normalized hostnames the proxy refuses to forward to.
///
/// Grows monotonically: hosts are added from the blocklist file at startup
/// and from the admin console at runtime, and are never removed.
pub struct BlockList {
    hosts: RwLock<HashSet<String>>,
}

impl BlockList {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashSet::new()),
        }
    }

    /// Inserts an already-normalized host, reporting whether it was new.
    pub fn insert(&self, host: String) -> bool {
        self.hosts.write().insert(host)
    }

    /// Normalizes and inserts, returning the normalized host on success.
    pub fn block(&self, input: &str) -> Option<String> {
        let host = normalize_host(input)?;
        self.insert(host.clone());
        Some(host)
    }

    pub fn is_blocked(&self, input: &str) -> bool {
        match normalize_host(input) {
            Some(host) => self.hosts.read().contains(&host),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    /// Loads one hostname or URL per line; blank and unparseable lines are
    /// skipped. Returns the number of newly inserted hosts.
    pub fn load_file(&self, path: &Path) -> Result<usize> {
        let file = File::open(path)
            .with_context(|| format!("failed to open blocklist file {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut inserted = 0;
        for line in reader.lines() {
            let line = line
                .with_context(|| format!("failed to read blocklist file {}", path.display()))?;
            if let Some(host) = normalize_host(&line) {
                if self.insert(host) {
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }
}

impl Default for BlockList {
    fn default() -> Self {
        Self::new()
    }
}
