//! External key loader
//!
//! Scans configured files and directories for armored key blocks and
//! publishes them as an immutable, generation-stamped snapshot. A reload
//! builds a brand-new snapshot and swaps it in at once, so readers see
//! either the old or the new set of external keys and never a mix.
//!
//! Reloads run on a spawned task: a caller that stops waiting does not
//! cancel the scan. A reload requested for the same paths while one is in
//! progress joins it instead of scanning again; a reload for different
//! paths supersedes it, and the most recently requested reload's result
//! is the one that stays published.

use crate::crypto::armor;
use crate::crypto::envelope::{parse_block, KeyCipher};
use crate::keystore::record::{KeyIdentity, KeyOrigin, KeyRecord};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// File extensions scanned inside configured directories
pub const KEY_FILE_EXTENSIONS: &[&str] = &["asc", "gpg", "pgp", "key", "pub", "sec"];

/// Files starting with this prefix are scanned whatever their extension
pub const KEY_FILE_PREFIX: &str = "pgp-";

/// An immutable set of externally loaded keys
#[derive(Debug, Default)]
pub struct ExternalSnapshot {
    generation: u64,
    records: Vec<KeyRecord>,
    index: HashMap<KeyIdentity, usize>,
}

impl ExternalSnapshot {
    fn new(generation: u64, loaded: Vec<KeyRecord>) -> Self {
        let mut records = Vec::with_capacity(loaded.len());
        let mut index = HashMap::with_capacity(loaded.len());

        for record in loaded {
            let identity = record.identity();
            if index.contains_key(&identity) {
                debug!("Duplicate external key {} ignored", identity);
                continue;
            }
            index.insert(identity, records.len());
            records.push(record);
        }

        Self {
            generation,
            records,
            index,
        }
    }

    /// Monotonic id of the reload that produced this snapshot; 0 before
    /// the first reload
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Records in scan order
    pub fn records(&self) -> &[KeyRecord] {
        &self.records
    }

    pub fn get(&self, identity: &KeyIdentity) -> Option<&KeyRecord> {
        self.index.get(identity).map(|&i| &self.records[i])
    }

    pub fn contains(&self, identity: &KeyIdentity) -> bool {
        self.index.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

type ReloadFuture = Shared<BoxFuture<'static, u64>>;

struct InFlight {
    paths: Vec<PathBuf>,
    ticket: u64,
    done: ReloadFuture,
}

struct LoaderShared {
    cipher: Arc<dyn KeyCipher>,
    snapshot: watch::Sender<Arc<ExternalSnapshot>>,
    next_ticket: AtomicU64,
    /// Ticket of the reload whose snapshot is published
    applied_ticket: Mutex<u64>,
    in_flight: Mutex<Option<InFlight>>,
}

impl LoaderShared {
    fn current(&self) -> Arc<ExternalSnapshot> {
        self.snapshot.borrow().clone()
    }

    async fn apply(&self, ticket: u64, records: Vec<KeyRecord>) -> u64 {
        let mut applied = self.applied_ticket.lock().await;
        if ticket < *applied {
            debug!(
                "Reload #{} finished after newer reload #{}, discarding",
                ticket, *applied
            );
            return self.current().generation();
        }

        let generation = self.current().generation() + 1;
        let snapshot = Arc::new(ExternalSnapshot::new(generation, records));
        info!(
            "Loaded {} external keys (generation {})",
            snapshot.len(),
            generation
        );
        self.snapshot.send_replace(snapshot);
        *applied = ticket;
        generation
    }

    async fn finish(&self, ticket: u64) {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.as_ref().map(|f| f.ticket) == Some(ticket) {
            *in_flight = None;
        }
    }
}

/// Loads keys from configured paths into a volatile overlay
pub struct ExternalKeyLoader {
    shared: Arc<LoaderShared>,
}

impl ExternalKeyLoader {
    pub fn new(cipher: Arc<dyn KeyCipher>) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(ExternalSnapshot::default()));
        Self {
            shared: Arc::new(LoaderShared {
                cipher,
                snapshot,
                next_ticket: AtomicU64::new(0),
                applied_ticket: Mutex::new(0),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// The last fully settled snapshot
    pub fn current_snapshot(&self) -> Arc<ExternalSnapshot> {
        self.shared.current()
    }

    /// Receive every newly published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<ExternalSnapshot>> {
        self.shared.snapshot.subscribe()
    }

    /// Whether a reload is currently running
    pub async fn is_reloading(&self) -> bool {
        self.shared.in_flight.lock().await.is_some()
    }

    /// Wait for any reload in progress, then return the current snapshot
    pub async fn settled(&self) -> Arc<ExternalSnapshot> {
        let pending = self
            .shared
            .in_flight
            .lock()
            .await
            .as_ref()
            .map(|f| f.done.clone());

        if let Some(done) = pending {
            done.await;
        }
        self.current_snapshot()
    }

    /// Rescan `paths` and publish the result. Returns the generation
    /// published once the reload has settled.
    pub async fn reload(&self, paths: Vec<PathBuf>) -> u64 {
        let done = {
            let mut in_flight = self.shared.in_flight.lock().await;
            match in_flight.as_ref() {
                Some(current) if current.paths == paths => {
                    debug!("Joining reload #{} already in progress", current.ticket);
                    current.done.clone()
                }
                _ => {
                    let ticket = self.shared.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
                    let done = self.spawn_reload(ticket, paths.clone());
                    *in_flight = Some(InFlight {
                        paths,
                        ticket,
                        done: done.clone(),
                    });
                    done
                }
            }
        };

        done.await
    }

    fn spawn_reload(&self, ticket: u64, paths: Vec<PathBuf>) -> ReloadFuture {
        let shared = self.shared.clone();
        info!("Reloading external keys from {} paths (#{})", paths.len(), ticket);

        let task = tokio::spawn(async move {
            let cipher = shared.cipher.clone();
            let records = tokio::task::spawn_blocking(move || scan_paths(cipher.as_ref(), &paths))
                .await
                .unwrap_or_else(|e| {
                    error!("External key scan #{} failed: {}", ticket, e);
                    Vec::new()
                });
            let generation = shared.apply(ticket, records).await;
            shared.finish(ticket).await;
            generation
        });

        let fallback = self.shared.clone();
        async move {
            match task.await {
                Ok(generation) => generation,
                Err(e) => {
                    error!("External key reload #{} aborted: {}", ticket, e);
                    fallback.finish(ticket).await;
                    fallback.current().generation()
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Whether a file inside a scanned directory may hold keys
pub fn is_key_file(path: &Path) -> bool {
    let by_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            KEY_FILE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false);

    let by_prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(KEY_FILE_PREFIX))
        .unwrap_or(false);

    by_extension || by_prefix
}

/// Scan every configured path. Unreadable paths and files are logged and
/// skipped.
pub fn scan_paths(cipher: &dyn KeyCipher, paths: &[PathBuf]) -> Vec<KeyRecord> {
    let mut records = Vec::new();

    for path in paths {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping external key path {:?}: {}", path, e);
                continue;
            }
        };

        if !metadata.is_dir() {
            records.extend(load_key_file(cipher, path));
            continue;
        }

        for entry in WalkDir::new(path).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {:?}: {}", path, e);
                    continue;
                }
            };
            if entry.file_type().is_file() && is_key_file(entry.path()) {
                records.extend(load_key_file(cipher, entry.path()));
            }
        }
    }

    records
}

/// Parse every key block in one file. A malformed block is logged and
/// does not affect its siblings.
pub fn load_key_file(cipher: &dyn KeyCipher, path: &Path) -> Vec<KeyRecord> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("Could not read key file {:?}: {}", path, e);
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for (i, block) in armor::find_key_blocks(&text).into_iter().enumerate() {
        match parse_block(cipher, &block) {
            Ok(parsed) => records.push(KeyRecord {
                key_id: parsed.key_id,
                user_id: parsed.user_id,
                kind: parsed.kind,
                material: block.text.to_string(),
                origin: KeyOrigin::External(path.to_path_buf()),
            }),
            Err(e) => warn!("Skipping key block {} in {:?}: {}", i + 1, path, e),
        }
    }

    debug!("Found {} keys in {:?}", records.len(), path);
    records
}
