//! Blocklist and redirect policy with snapshot-swap reloads.
//!
//! Both tables are immutable snapshots held behind their own `RwLock`. A
//! reload builds a complete new snapshot outside the lock and swaps it in,
//! so readers observe either the old or the new table, never a mix.
//!
//! # Matching Rules
//!
//! | Blocklist entry | Blocks | Does Not Block |
//! |-----------------|--------|----------------|
//! | `example.com` | `example.com`, `www.example.com`, `a.b.example.com` | `notexample.com`, `example.org` |
//!
//! | Redirect key | Rewrites | Does Not Rewrite |
//! |--------------|----------|------------------|
//! | `google.de` | `google.de`, `GOOGLE.DE` | `www.google.de`, `google.de.evil` |

use crate::{ProxyError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

/// Produces fresh policy snapshots from wherever the policy is persisted.
///
/// Called once per table at startup and again for every reload command.
/// Implementations run on a blocking thread and may perform file I/O.
pub trait PolicySource: Send + Sync {
    /// Load the list of blocked domains.
    fn load_blocklist(&self) -> Result<Vec<String>>;

    /// Load the `source host -> destination host` redirect pairs.
    fn load_redirects(&self) -> Result<Vec<(String, String)>>;
}

/// Immutable set of blocked domains.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    /// Normalized entries (lowercase, no trailing dot).
    domains: HashSet<String>,
}

impl Blocklist {
    /// Build a blocklist, normalizing and deduplicating entries.
    ///
    /// Blank entries are ignored.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| normalize_domain(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    /// Returns the entry that blocks `host`, if any.
    ///
    /// An entry matches when `host` equals it or ends with `"." + entry`,
    /// compared case-insensitively. Walking the host's label suffixes keeps
    /// the check proportional to the number of labels rather than entries.
    pub fn matching_entry(&self, host: &str) -> Option<&str> {
        let host = normalize_domain(host);
        if host.is_empty() {
            return None;
        }

        let mut candidate = host.as_str();
        loop {
            if let Some(entry) = self.domains.get(candidate) {
                return Some(entry.as_str());
            }
            match candidate.find('.') {
                Some(dot) => candidate = &candidate[dot + 1..],
                None => return None,
            }
        }
    }

    /// Returns `true` if `host` is blocked.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.matching_entry(host).is_some()
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Returns `true` if nothing is blocked.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Immutable `source host -> destination host` mapping.
#[derive(Debug, Clone, Default)]
pub struct RedirectTable {
    /// Keys normalized; destinations kept as configured (trimmed).
    entries: HashMap<String, String>,
}

impl RedirectTable {
    /// Build a redirect table. Keys are matched case-insensitively.
    ///
    /// Pairs with a blank key or destination are ignored. When a key appears
    /// more than once the last pair wins.
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let entries = pairs
            .into_iter()
            .map(|(k, v)| (normalize_domain(k.as_ref()), v.as_ref().trim().to_string()))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        Self { entries }
    }

    /// Returns the configured destination for an exact (case-insensitive) key match.
    pub fn get(&self, host: &str) -> Option<&str> {
        self.entries
            .get(&normalize_domain(host))
            .map(String::as_str)
    }

    /// Number of redirect entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no redirects.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared blocklist and redirect policy consulted by every connection.
///
/// Each table has its own snapshot lock and its own reload lock:
/// - readers clone the current `Arc` under a brief read lock
/// - a reload holds only its table's reload lock while the source runs,
///   then takes the write lock just long enough to swap the `Arc`
///
/// A blocklist reload therefore never blocks a redirect lookup, and
/// vice versa.
pub struct PolicyStore {
    source: Arc<dyn PolicySource>,

    blocklist: RwLock<Arc<Blocklist>>,
    redirects: RwLock<Arc<RedirectTable>>,

    /// Serializes blocklist reloads.
    blocklist_reload: Mutex<()>,
    /// Serializes redirect reloads.
    redirects_reload: Mutex<()>,
}

impl PolicyStore {
    /// Create a store with explicit initial snapshots.
    pub fn new(source: Arc<dyn PolicySource>, blocklist: Blocklist, redirects: RedirectTable) -> Self {
        Self {
            source,
            blocklist: RwLock::new(Arc::new(blocklist)),
            redirects: RwLock::new(Arc::new(redirects)),
            blocklist_reload: Mutex::new(()),
            redirects_reload: Mutex::new(()),
        }
    }

    /// Create a store and populate both tables from `source`.
    ///
    /// A table whose load fails starts empty; the failure is logged.
    pub fn load(source: Arc<dyn PolicySource>) -> Self {
        let store = Self::new(source, Blocklist::default(), RedirectTable::default());
        // Failures are already logged by the reload methods.
        let _ = store.reload_blocklist();
        let _ = store.reload_redirects();
        store
    }

    /// Current blocklist snapshot.
    pub fn blocklist(&self) -> Arc<Blocklist> {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        Arc::clone(&self.blocklist.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Current redirect snapshot.
    pub fn redirects(&self) -> Arc<RedirectTable> {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        Arc::clone(&self.redirects.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Map `host` through the redirect table.
    ///
    /// Returns the configured destination on an exact case-insensitive key
    /// match, otherwise `host` unchanged.
    pub fn lookup_redirect(&self, host: &str) -> String {
        match self.redirects().get(host) {
            Some(destination) => {
                info!(from = %host, to = %destination, "Redirect applied");
                destination.to_string()
            }
            None => host.to_string(),
        }
    }

    /// Returns `true` if `host` equals a blocklist entry or is a subdomain of one.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.blocklist().is_blocked(host)
    }

    /// Replace the blocklist with a fresh snapshot from the source.
    ///
    /// Returns the number of entries now active.
    ///
    /// # Errors
    /// * `ProxyError::PolicyLoad` - The source failed; the previous snapshot stays active.
    pub fn reload_blocklist(&self) -> Result<usize> {
        let _reload = self
            .blocklist_reload
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let fresh = match self.source.load_blocklist() {
            Ok(domains) => Blocklist::new(domains),
            Err(e) => {
                warn!(error = %e, "Blocklist reload failed; keeping previous blocklist");
                return Err(into_load_error(e));
            }
        };

        let count = fresh.len();
        *self.blocklist.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(fresh);
        info!(entries = count, "Blocklist reloaded");
        Ok(count)
    }

    /// Replace the redirect table with a fresh snapshot from the source.
    ///
    /// Returns the number of entries now active.
    ///
    /// # Errors
    /// * `ProxyError::PolicyLoad` - The source failed; the previous snapshot stays active.
    pub fn reload_redirects(&self) -> Result<usize> {
        let _reload = self
            .redirects_reload
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let fresh = match self.source.load_redirects() {
            Ok(pairs) => RedirectTable::new(pairs),
            Err(e) => {
                warn!(error = %e, "Redirect reload failed; keeping previous redirects");
                return Err(into_load_error(e));
            }
        };

        let count = fresh.len();
        *self.redirects.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(fresh);
        info!(entries = count, "Redirects reloaded");
        Ok(count)
    }
}

fn into_load_error(e: ProxyError) -> ProxyError {
    match e {
        ProxyError::PolicyLoad(_) => e,
        other => ProxyError::PolicyLoad(other.to_string()),
    }
}

/// Normalize a domain for matching.
///
/// - Converts to lowercase
/// - Removes trailing dot if present
/// - Trims whitespace
fn normalize_domain(domain: &str) -> String {
    let trimmed = domain.trim().to_lowercase();
    trimmed.strip_suffix('.').unwrap_or(&trimmed).to_string()
}
