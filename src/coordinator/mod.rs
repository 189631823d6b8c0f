//! Request façade tying resolution, cache, predictor and governor together.
//!
//! A fetch resolves the sheet and range against the memoized probe of the
//! current file version, serves the section from the cache when possible, and
//! otherwise reads it under a worker slot with the chunk size the governor
//! currently allows. After a read, at most one predicted section is prefetched
//! on a background thread, behind its own single-slot gate so that a running
//! prefetch never holds a foreground slot.
use crate::cache::CacheStats;
use crate::cache::CachedSection;
use crate::cache::Fingerprint;
use crate::cache::SectionCache;
use crate::cache::SectionKey;
use crate::config::Config;
use crate::coordinator::cancel::CancelToken;
use crate::coordinator::slots::SlotPermit;
use crate::coordinator::slots::WorkerSlots;
use crate::error::Error;
use crate::governor::GovernorPolicy;
use crate::governor::GovernorState;
use crate::governor::PolicyListener;
use crate::governor::ResourceGovernor;
use crate::governor::ResourceProbe;
use crate::governor::Sampler;
use crate::governor::SystemProbe;
use crate::prefetch::PrefetchPredictor;
use crate::prefetch::TRACKED_FILES;
use crate::selection::range;
use crate::selection::sheet;
use crate::selection::ParseError;
use crate::selection::RangeSpec;
use crate::selection::SheetDescriptor;
use crate::spreadsheet::DataSource;
use crate::spreadsheet::FetchError;
use crate::spreadsheet::Grid;
use crate::spreadsheet::LazyDataSource;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub mod cancel;
mod slots;

/// What to read.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub file_path: PathBuf,
    /// Sheet name, matched exactly. `None` selects the first sheet.
    pub sheet_name: Option<String>,
    /// Range expression. `None` selects the whole sheet.
    pub range_expr: Option<String>,
    /// Maximum number of rows returned.
    pub row_limit: Option<usize>,
    /// Priority requests are still served while the governor is `Critical`.
    pub priority: bool,
    pub cancel: CancelToken,
}

impl FetchRequest {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        FetchRequest {
            file_path: file_path.into(),
            sheet_name: None,
            range_expr: None,
            row_limit: None,
            priority: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn sheet(mut self, name: impl Into<String>) -> Self {
        self.sheet_name = Some(name.into());
        self
    }

    pub fn range(mut self, expr: impl Into<String>) -> Self {
        self.range_expr = Some(expr.into());
        self
    }

    pub fn limit(mut self, rows: usize) -> Self {
        self.row_limit = Some(rows);
        self
    }

    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A materialized slice and how it was obtained.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FetchResult {
    pub rows: Grid,
    pub sheet_used: String,
    /// The rectangle the returned rows cover.
    pub range_used: RangeSpec,
    /// The range was clipped to the sheet or rows were cut by the row limit.
    pub truncated: bool,
    pub served_from_cache: bool,
}

/// Memoized probes per canonical path, each valid for one fingerprint and
/// bounded to the [`TRACKED_FILES`] most recently used paths.
#[derive(Default)]
struct Catalogs {
    clock: u64,
    entries: HashMap<PathBuf, MemoizedCatalog>,
}

struct MemoizedCatalog {
    fingerprint: Fingerprint,
    sheets: Arc<Vec<SheetDescriptor>>,
    last_used: u64,
}

enum Lookup {
    Current(Arc<Vec<SheetDescriptor>>),
    /// The path is known under another file version.
    Stale,
    Unknown,
}

impl Catalogs {
    fn get(&mut self, fingerprint: &Fingerprint) -> Lookup {
        self.clock += 1;
        let clock = self.clock;
        match self.entries.get_mut(&fingerprint.path) {
            Some(entry) if entry.fingerprint == *fingerprint => {
                entry.last_used = clock;
                Lookup::Current(Arc::clone(&entry.sheets))
            }
            Some(_) => Lookup::Stale,
            None => Lookup::Unknown,
        }
    }

    /// Stores the probe of `fingerprint`, returning the path dropped to stay in bounds.
    fn insert(&mut self, fingerprint: Fingerprint, sheets: Arc<Vec<SheetDescriptor>>) -> Option<PathBuf> {
        self.clock += 1;
        let mut evicted = None;
        if !self.entries.contains_key(&fingerprint.path) && self.entries.len() >= TRACKED_FILES {
            evicted = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(path, _)| path.clone());
            if let Some(path) = &evicted {
                self.entries.remove(path);
            }
        }
        let entry = MemoizedCatalog {
            fingerprint,
            sheets,
            last_used: self.clock,
        };
        self.entries.insert(entry.fingerprint.path.clone(), entry);
        evicted
    }
}

struct Inner {
    source: Box<dyn DataSource>,
    cache: Arc<SectionCache>,
    predictor: PrefetchPredictor,
    governor: Arc<ResourceGovernor>,
    slots: WorkerSlots,
    /// Background reads queue here, never on `slots`.
    prefetch_slots: WorkerSlots,
    catalogs: Mutex<Catalogs>,
    in_flight: Mutex<HashSet<SectionKey>>,
    prefetches: Mutex<Vec<JoinHandle<()>>>,
    /// Cancelled on close so running prefetches stop between chunks.
    shutdown: CancelToken,
}

pub struct Coordinator {
    inner: Arc<Inner>,
    sampler: Mutex<Option<Sampler>>,
    closed: AtomicBool,
}

impl Coordinator {
    /// Reads local files and samples this process with `sysinfo`.
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_source(config, Box::new(LazyDataSource), Box::new(SystemProbe::new()))
    }

    pub fn with_source(
        config: Config,
        source: Box<dyn DataSource>,
        probe: Box<dyn ResourceProbe>,
    ) -> Result<Self, Error> {
        let config = config.validate()?;
        let cache = Arc::new(SectionCache::new(config.cache_byte_budget));
        let listener: PolicyListener = {
            let cache = Arc::clone(&cache);
            Box::new(move |policy: &GovernorPolicy| cache.set_budget(policy.cache_byte_budget))
        };
        let governor = Arc::new(ResourceGovernor::new(config, probe, vec![listener]));
        let slots = {
            let governor = Arc::clone(&governor);
            WorkerSlots::new(move || governor.current_policy().max_concurrent_fetches)
        };
        let sampler = governor
            .start_sampler()
            .map_err(|error| Error::io("sheet-slice-governor", error))?;
        info!(sampler = sampler.is_some(), "Coordinator started");

        Ok(Coordinator {
            inner: Arc::new(Inner {
                source,
                cache,
                predictor: PrefetchPredictor::new(),
                governor,
                slots,
                prefetch_slots: WorkerSlots::new(|| 1),
                catalogs: Mutex::new(Catalogs::default()),
                in_flight: Mutex::new(HashSet::new()),
                prefetches: Mutex::new(Vec::new()),
                shutdown: CancelToken::new(),
            }),
            sampler: Mutex::new(sampler),
            closed: AtomicBool::new(false),
        })
    }

    /// Resolves and returns the requested slice.
    ///
    /// An I/O failure is retried once after the file's cached state is dropped.
    pub fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, Error> {
        self.ensure_open()?;
        self.retrying(&request.file_path, || self.inner.fetch(request))
    }

    /// The probed sheets of `path`, memoized per file version.
    pub fn sheets(&self, path: &Path) -> Result<Vec<SheetDescriptor>, Error> {
        self.ensure_open()?;
        self.retrying(path, || {
            let fingerprint = Fingerprint::of(path).map_err(|error| Error::io(path, error))?;
            Ok(self.inner.catalog(&fingerprint)?.as_ref().clone())
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn governor_state(&self) -> GovernorState {
        self.inner.governor.state()
    }

    pub fn current_policy(&self) -> GovernorPolicy {
        self.inner.governor.current_policy()
    }

    /// Stops the sampler and waits for running prefetches. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        if let Some(mut sampler) = self.sampler.lock().take() {
            sampler.stop();
        }
        let prefetches: Vec<_> = self.inner.prefetches.lock().drain(..).collect();
        for handle in prefetches {
            if handle.join().is_err() {
                warn!("Prefetch thread panicked");
            }
        }
        info!("Coordinator closed");
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Closed)?;
        }
        Ok(())
    }

    fn retrying<T, F>(&self, path: &Path, operation: F) -> Result<T, Error>
    where
        F: Fn() -> Result<T, Error>,
    {
        match operation() {
            Err(Error::Io { path: failed, source }) => {
                warn!(path = %failed.display(), error = %source, "Read failed, retrying once");
                self.inner.forget(&fs::canonicalize(path).unwrap_or_else(|_| path.to_owned()));
                operation()
            }
            result => result,
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn fetch(self: &Arc<Self>, request: &FetchRequest) -> Result<FetchResult, Error> {
        request.cancel.check().map_err(Error::Cancelled)?;
        let path = &request.file_path;
        let fingerprint = Fingerprint::of(path).map_err(|error| Error::io(path, error))?;
        let catalog = self.catalog(&fingerprint)?;
        let sheet = sheet::resolve(request.sheet_name.as_deref(), &catalog)?;
        let resolved = range::parse(request.range_expr.as_deref().unwrap_or_default(), sheet)?;
        if request.row_limit == Some(0) {
            Err(ParseError::invalid_range(
                request.range_expr.as_deref().unwrap_or_default(),
                "row limit must be positive",
            ))?;
        }

        let key = SectionKey::new(fingerprint, sheet.index, resolved.range);
        let (section, served_from_cache) = match self.cache.lookup(&key) {
            Some(section) => (section, true),
            None => (self.load(&key, request)?, false),
        };
        self.predictor.observe(&key);
        if !served_from_cache {
            self.prefetch(&key, sheet);
        }

        let limit = request.row_limit.unwrap_or(usize::MAX);
        let range_used = resolved.range.with_row_count(limit).unwrap_or(resolved.range);
        let rows = section.grid.iter().take(limit).cloned().collect();
        Ok(FetchResult {
            rows,
            sheet_used: sheet.name.clone(),
            range_used,
            truncated: resolved.clipped || range_used.row_count() < resolved.range.row_count(),
            served_from_cache,
        })
    }

    /// The probe of one file version. A new fingerprint for a known path drops
    /// everything cached for the old version first.
    fn catalog(&self, fingerprint: &Fingerprint) -> Result<Arc<Vec<SheetDescriptor>>, Error> {
        let stale = match self.catalogs.lock().get(fingerprint) {
            Lookup::Current(catalog) => return Ok(catalog),
            Lookup::Stale => true,
            Lookup::Unknown => false,
        };
        if stale {
            info!(path = %fingerprint.path.display(), "File changed, dropping cached state");
            self.forget(&fingerprint.path);
        }

        let catalog = self
            .source
            .probe(&fingerprint.path)
            .map_err(|error| Error::io(&fingerprint.path, error))?;
        let catalog = Arc::new(catalog);
        let evicted = self.catalogs.lock().insert(fingerprint.clone(), Arc::clone(&catalog));
        if let Some(path) = evicted {
            debug!(path = %path.display(), "Dropping memoized probe of least recently used file");
            self.predictor.forget(&path);
        }
        Ok(catalog)
    }

    fn forget(&self, path: &Path) {
        self.catalogs.lock().entries.remove(path);
        self.cache.invalidate_path(path);
        self.predictor.forget(path);
    }

    /// Reads a missing section under a worker slot and caches it.
    fn load(&self, key: &SectionKey, request: &FetchRequest) -> Result<Arc<CachedSection>, Error> {
        let state = self.governor.state();
        if state == GovernorState::Critical && !request.priority {
            warn!(path = %key.fingerprint.path.display(), range = %key.range, "Rejecting fetch under critical resource pressure");
            Err(Error::ResourceExhausted { state })?;
        }
        let _permit = self.slots.acquire(&request.cancel).map_err(Error::Cancelled)?;
        let grid = self.read(key, &request.cancel)?;
        Ok(self.cache.insert(CachedSection::new(key.clone(), grid)))
    }

    fn read(&self, key: &SectionKey, cancel: &CancelToken) -> Result<Grid, Error> {
        let policy = self.governor.current_policy();
        let path = &key.fingerprint.path;
        self.source
            .fetch_section(path, key.sheet_index, key.range, policy.max_chunk_rows, cancel)
            .map_err(|error| match error {
                FetchError::Source(source) => Error::io(path, source),
                FetchError::Cancelled(reason) => Error::Cancelled(reason),
            })
    }

    /// Starts a background read of the top prediction for the file of `key`,
    /// if the prefetch gate is free now and the section is neither cached nor
    /// being read.
    fn prefetch(self: &Arc<Self>, key: &SectionKey, sheet: &SheetDescriptor) {
        let policy = self.governor.current_policy();
        let Some(hint) = self.predictor.predict(&key.fingerprint.path, &policy).into_iter().next() else {
            return;
        };
        let predicted = hint.key.range;
        let Some(range) = RangeSpec::new(
            predicted.start_row(),
            predicted.end_row().min(sheet.row_count),
            predicted.start_col(),
            predicted.end_col().min(sheet.col_count),
        ) else {
            return;
        };
        let target = hint.key.with_range(range);
        if self.cache.contains(&target) || !self.in_flight.lock().insert(target.clone()) {
            return;
        }
        let Some(permit) = self.prefetch_slots.try_acquire() else {
            self.in_flight.lock().remove(&target);
            return;
        };

        debug!(range = %target.range, confidence = hint.confidence, "Dispatch prefetch");
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("sheet-slice-prefetch".to_owned())
            .spawn({
                let target = target.clone();
                move || inner.run_prefetch(target, permit)
            });
        match spawned {
            Ok(handle) => {
                let mut prefetches = self.prefetches.lock();
                prefetches.retain(|handle| !handle.is_finished());
                prefetches.push(handle);
            }
            Err(error) => {
                warn!(%error, "Cannot start prefetch thread");
                self.in_flight.lock().remove(&target);
            }
        }
    }

    fn run_prefetch(&self, key: SectionKey, _permit: SlotPermit) {
        match self.read(&key, &self.shutdown) {
            // A file rewritten meanwhile would leave an unreachable entry behind.
            Ok(grid) if Fingerprint::of(&key.fingerprint.path).ok().as_ref() == Some(&key.fingerprint) => {
                self.cache.insert(CachedSection::new(key.clone(), grid));
                debug!(range = %key.range, "Prefetch complete");
            }
            Ok(_) => debug!(range = %key.range, "File changed during prefetch, result dropped"),
            Err(error) => debug!(range = %key.range, %error, "Prefetch failed"),
        }
        self.in_flight.lock().remove(&key);
    }
}
