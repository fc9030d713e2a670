//! Content-addressed cache of evaluated expressions
//!
//! [`CacheStore`] maps CRS strings to artifact paths below a root directory:
//!
//! - `<root>/index.json` - snapshot of the CRS → path map
//! - `<root>/<shard>/<shard>/<hash>.<ext>` - artifacts, named by CRS hash
//!
//! ## Consistency
//!
//! - At most one entry per CRS; registering again replaces the old file.
//! - Entries whose file has vanished are pruned on the next lookup.
//! - Artifacts are stamped with their CRS, so [`CacheStore::rebuild`] can
//!   recover the index from the files alone.
//! - No locks: [`CacheStore::sync`] merges with whatever another process
//!   wrote meanwhile (this session's entries win, its drops stick).

mod cache_dir;
mod filter;
mod index;
mod paths;
mod stamp;

pub use cache_dir::default_cache_dir;
pub use filter::{parse_age, parse_size, CrsEntry, ListFilter};
pub use index::INDEX_FILE;
pub use paths::{crs_digest, temp_path, Layout, FULL_HASH_LENGTH};
pub use stamp::{version_tag, Stamp, StampPolicy, Stamper, ToolStamper};

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::eval::executor::{CommandExecutor, CommandLine, Invocation};
use crate::expr::{shell_quote, Format, Node, Registry, Template};
use crate::logging::{operations, services, status};
use crate::period::{includes, start_with, Complement, Period};

/// Default command merging two time-ordered NetCDF files
pub const DEFAULT_CONCAT_COMMAND: &str = "cdo -O mergetime ${ins} ${out}";

/// Slots allowed in the concat command
const CONCAT_SLOTS: &[&str] = &["ins", "in_1", "in_2", "out"];

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to stamp {}: {reason}", .path.display())]
    StampingFailed { path: PathBuf, reason: String },

    #[error("File for {crs} is missing: {}", .path.display())]
    FileMissing { crs: String, path: PathBuf },

    #[error("File for {crs} is write-protected: {}", .path.display())]
    WriteProtected { crs: String, path: PathBuf },

    #[error("Cache index {} is unreadable: {reason}", .path.display())]
    IndexCorrupt { path: PathBuf, reason: String },

    #[error("Not cached: {crs}")]
    NotCached { crs: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Command failed with exit code {exit_code}: {command}\n{stderr}")]
    Execution {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Runtime settings of a cache store
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub root: PathBuf,
    pub layout: Layout,
    pub stamping: StampPolicy,
    pub concat_command: String,
    pub version: String,
}

impl CacheOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            layout: Layout::default(),
            stamping: StampPolicy::default(),
            concat_command: DEFAULT_CONCAT_COMMAND.to_string(),
            version: version_tag(),
        }
    }
}

/// A cached result whose period contains the requested one
#[derive(Debug, Clone)]
pub struct SupersetMatch {
    pub crs: String,
    pub path: PathBuf,
    pub node: Node,
    pub period: Period,
    /// Slices of the cached period outside the requested one
    pub complement: Complement,
}

/// A cached result covering the start of the requested period
#[derive(Debug, Clone)]
pub struct PrefixMatch {
    pub crs: String,
    pub path: PathBuf,
    pub node: Node,
    pub period: Period,
    /// Remainder still to compute
    pub suffix: Period,
}

/// Outcome of [`CacheStore::sync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub entries: usize,
    pub rebuilt: bool,
}

pub struct CacheStore {
    options: CacheOptions,
    concat: Template,
    entries: BTreeMap<String, PathBuf>,
    /// CRSs dropped this session, kept out of later merges
    dropped: BTreeSet<String>,
    executor: Arc<dyn CommandExecutor>,
    stamper: Box<dyn Stamper>,
}

impl CacheStore {
    /// Open (creating if needed) the cache at `options.root`, stamping
    /// through the standard metadata tools.
    pub fn open(
        options: CacheOptions,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self, CacheError> {
        let stamper = Box::new(ToolStamper::new(
            Arc::clone(&executor),
            options.version.clone(),
        ));
        Self::open_with_stamper(options, executor, stamper)
    }

    pub fn open_with_stamper(
        mut options: CacheOptions,
        executor: Arc<dyn CommandExecutor>,
        stamper: Box<dyn Stamper>,
    ) -> Result<Self, CacheError> {
        options.layout.validate().map_err(CacheError::InvalidConfig)?;

        let concat = Template::parse(&options.concat_command)
            .map_err(|e| CacheError::InvalidConfig(e.to_string()))?;
        if let Some(slot) = concat.slots().find(|slot| !CONCAT_SLOTS.contains(slot)) {
            return Err(CacheError::InvalidConfig(format!(
                "concat_command may only use ${{ins}}, ${{in_1}}, ${{in_2}} and ${{out}}, found ${{{}}}",
                slot
            )));
        }

        fs::create_dir_all(&options.root).map_err(|e| CacheError::io(&options.root, e))?;
        options.root =
            fs::canonicalize(&options.root).map_err(|e| CacheError::io(&options.root, e))?;

        let index_path = options.root.join(INDEX_FILE);
        let entries = match index::load(&index_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    service = services::CACHE,
                    operation = operations::LOAD,
                    status = status::ERROR,
                    error = %e,
                    "starting from an empty index"
                );
                BTreeMap::new()
            }
        };

        info!(
            service = services::CACHE,
            operation = operations::LOAD,
            entry_count = entries.len(),
            root = %options.root.display(),
            "cache opened"
        );

        Ok(Self {
            options,
            concat,
            entries,
            dropped: BTreeSet::new(),
            executor,
            stamper,
        })
    }

    pub fn root(&self) -> &Path {
        &self.options.root
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Indexed `(crs, path)` pairs in CRS order, without existence checks
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.entries
            .iter()
            .map(|(crs, path)| (crs.as_str(), path.as_path()))
    }

    fn index_path(&self) -> PathBuf {
        self.options.root.join(INDEX_FILE)
    }

    /// Artifact path for `crs`, with its shard directories created.
    ///
    /// Falls back to the full hash when the truncated one is already taken
    /// by another CRS.
    pub fn path_for(&self, crs: &str, format: Format) -> Result<PathBuf, CacheError> {
        let digest = crs_digest(crs);
        let layout = self.options.layout;
        let mut path = self.options.root.join(layout.relative_path(
            &digest,
            layout.hash_length,
            format.extension(),
        ));

        if self
            .entries
            .iter()
            .any(|(other, indexed)| indexed == &path && other != crs)
        {
            debug!(crs, path = %path.display(), "hash collision, using full hash");
            path = self.options.root.join(layout.relative_path(
                &digest,
                FULL_HASH_LENGTH,
                format.extension(),
            ));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        Ok(path)
    }

    /// Stamp `tmp_path`, move it to `final_path` and index it under `crs`.
    ///
    /// On failure `tmp_path` is removed.
    pub fn register(
        &mut self,
        tmp_path: &Path,
        crs: &str,
        final_path: &Path,
    ) -> Result<(), CacheError> {
        let result = self.register_file(tmp_path, crs, final_path);
        if result.is_err() && tmp_path != final_path {
            discard_temp(tmp_path);
        }
        result
    }

    fn register_file(
        &mut self,
        tmp_path: &Path,
        crs: &str,
        final_path: &Path,
    ) -> Result<(), CacheError> {
        if !tmp_path.exists() {
            return Err(CacheError::FileMissing {
                crs: crs.to_string(),
                path: tmp_path.to_path_buf(),
            });
        }
        if tmp_path != final_path && final_path.exists() && is_protected(final_path) {
            return Err(CacheError::WriteProtected {
                crs: crs.to_string(),
                path: final_path.to_path_buf(),
            });
        }

        let format = Format::from_path(final_path).unwrap_or_default();
        match self.options.stamping {
            StampPolicy::Disabled => {}
            policy => {
                if let Err(e) = self.stamper.stamp(tmp_path, format, crs) {
                    if policy == StampPolicy::Mandatory {
                        return Err(e);
                    }
                    warn!(
                        service = services::CACHE,
                        operation = operations::STAMP,
                        status = status::ERROR,
                        crs,
                        error = %e,
                        "keeping artifact unstamped"
                    );
                }
            }
        }

        if tmp_path != final_path {
            move_file(tmp_path, final_path)?;
        }

        if let Some(previous) = self
            .entries
            .insert(crs.to_string(), final_path.to_path_buf())
        {
            if previous != final_path && previous.exists() {
                if let Err(e) = fs::remove_file(&previous) {
                    warn!(crs, path = %previous.display(), error = %e, "failed to remove replaced artifact");
                }
            }
        }
        self.dropped.remove(crs);

        info!(
            service = services::CACHE,
            operation = operations::REGISTER,
            status = status::SUCCESS,
            crs,
            path = %final_path.display(),
            "registered"
        );
        Ok(())
    }

    /// Indexed path for `crs`, pruning the entry if its file is gone
    pub fn lookup_exact(&mut self, crs: &str) -> Option<PathBuf> {
        let path = self.entries.get(crs)?.clone();
        if path.exists() {
            debug!(
                service = services::CACHE,
                operation = operations::LOOKUP,
                status = status::HIT,
                crs,
                "exact hit"
            );
            return Some(path);
        }
        self.prune(crs, &path);
        None
    }

    /// First cached node, in CRS order, equal to `node` except for a period
    /// that strictly contains the requested one.
    pub fn lookup_superset(&mut self, node: &Node, registry: &Registry) -> Option<SupersetMatch> {
        if !node.is_period_reusable() {
            return None;
        }
        let requested = node.period()?;

        for (crs, path, candidate) in self.candidates(node, registry) {
            let Some(cached) = candidate.period() else {
                continue;
            };
            let Some(complement) = includes(&cached, &requested) else {
                continue;
            };
            if !path.exists() {
                self.prune(&crs, &path);
                continue;
            }
            debug!(
                service = services::CACHE,
                operation = operations::LOOKUP,
                status = status::SUPERSET,
                crs = %crs,
                "superset hit"
            );
            return Some(SupersetMatch {
                crs,
                path,
                node: candidate,
                period: cached,
                complement,
            });
        }
        None
    }

    /// Longest cached node equal to `node` except for a period that is a
    /// strict prefix of the requested one.
    pub fn lookup_prefix(&mut self, node: &Node, registry: &Registry) -> Option<PrefixMatch> {
        if !node.is_period_reusable() {
            return None;
        }
        let requested = node.period()?;

        let mut best: Option<PrefixMatch> = None;
        for (crs, path, candidate) in self.candidates(node, registry) {
            let Some(cached) = candidate.period() else {
                continue;
            };
            let Some(Some(suffix)) = start_with(&requested, &cached) else {
                continue;
            };
            if !path.exists() {
                self.prune(&crs, &path);
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |current| cached.end() > current.period.end())
            {
                best = Some(PrefixMatch {
                    crs,
                    path,
                    node: candidate,
                    period: cached,
                    suffix,
                });
            }
        }

        if let Some(found) = &best {
            debug!(
                service = services::CACHE,
                operation = operations::LOOKUP,
                status = status::PREFIX,
                crs = %found.crs,
                "prefix hit"
            );
        }
        best
    }

    /// Entries sharing `node`'s operator prefix and equal to it modulo
    /// periods, excluding `node` itself
    fn candidates(&self, node: &Node, registry: &Registry) -> Vec<(String, PathBuf, Node)> {
        let prefix = node.operator_prefix();
        let own = node.crs();
        let masked = node.masked_crs();

        self.entries
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(crs, _)| crs.starts_with(&prefix))
            .filter(|(crs, _)| **crs != own)
            .filter_map(|(crs, path)| match registry.parse(crs) {
                Ok(candidate) => Some((crs.clone(), path.clone(), candidate)),
                Err(e) => {
                    debug!(crs = %crs, error = %e, "skipping unparsable cache entry");
                    None
                }
            })
            .filter(|(_, _, candidate)| {
                candidate.masked_crs() == masked && candidate.is_period_reusable()
            })
            .collect()
    }

    /// Concatenate two cached artifacts into one registered as `target_crs`,
    /// then drop both inputs.
    pub fn complement(
        &mut self,
        begin_crs: &str,
        end_crs: &str,
        target_crs: &str,
    ) -> Result<PathBuf, CacheError> {
        let begin = self
            .lookup_exact(begin_crs)
            .ok_or_else(|| CacheError::NotCached {
                crs: begin_crs.to_string(),
            })?;
        let end = self
            .lookup_exact(end_crs)
            .ok_or_else(|| CacheError::NotCached {
                crs: end_crs.to_string(),
            })?;

        let format = Format::from_path(&begin).unwrap_or_default();
        let final_path = self.path_for(target_crs, format)?;
        let tmp = temp_path(&final_path);

        let quoted = |path: &Path| shell_quote(&path.display().to_string());
        let command = self
            .concat
            .render(|slot| match slot {
                "ins" => Some(format!("{} {}", quoted(&begin), quoted(&end))),
                "in_1" => Some(quoted(&begin)),
                "in_2" => Some(quoted(&end)),
                "out" => Some(quoted(&tmp)),
                _ => None,
            })
            .map_err(|slot| {
                CacheError::InvalidConfig(format!("unknown slot ${{{}}} in concat_command", slot))
            })?;

        let invocation = Invocation {
            label: "concat".to_string(),
            command: CommandLine::Shell(command.clone()),
            inputs: vec![begin.clone(), end.clone()],
            outputs: vec![tmp.clone()],
        };
        let outcome = self
            .executor
            .execute(&invocation)
            .map_err(|e| {
                discard_temp(&tmp);
                CacheError::Execution {
                    command: command.clone(),
                    exit_code: -1,
                    stderr: e.to_string(),
                }
            })?;
        if !outcome.success {
            discard_temp(&tmp);
            return Err(CacheError::Execution {
                command,
                exit_code: outcome.exit_code,
                stderr: outcome.stderr_text(),
            });
        }

        self.register(&tmp, target_crs, &final_path)?;

        for crs in [begin_crs, end_crs] {
            if let Err(e) = self.drop(crs, false) {
                warn!(crs, error = %e, "kept complement input");
            }
        }

        info!(
            service = services::CACHE,
            operation = operations::COMPLEMENT,
            status = status::SUCCESS,
            crs = target_crs,
            "merged cached periods"
        );
        Ok(final_path)
    }

    /// Remove the artifact and its entry. `Ok(false)` if `crs` was not cached.
    pub fn drop(&mut self, crs: &str, force: bool) -> Result<bool, CacheError> {
        let Some(path) = self.entries.get(crs).cloned() else {
            return Ok(false);
        };

        if path.exists() {
            if is_protected(&path) {
                if !force {
                    return Err(CacheError::WriteProtected {
                        crs: crs.to_string(),
                        path,
                    });
                }
                set_protected(&path, false)?;
            }
            fs::remove_file(&path).map_err(|e| CacheError::io(&path, e))?;
        }

        self.entries.remove(crs);
        self.dropped.insert(crs.to_string());
        info!(
            service = services::CACHE,
            operation = operations::DROP,
            crs,
            path = %path.display(),
            "dropped"
        );
        Ok(true)
    }

    /// Write-protect the artifact of `crs`, or lift protection with `stop`.
    pub fn protect(&mut self, crs: &str, stop: bool) -> Result<(), CacheError> {
        let path = self
            .entries
            .get(crs)
            .cloned()
            .ok_or_else(|| CacheError::NotCached {
                crs: crs.to_string(),
            })?;
        if !path.exists() {
            self.prune(crs, &path);
            return Err(CacheError::FileMissing {
                crs: crs.to_string(),
                path,
            });
        }
        set_protected(&path, !stop)?;
        info!(
            service = services::CACHE,
            operation = operations::PROTECT,
            crs,
            protected = !stop,
            "protection changed"
        );
        Ok(())
    }

    /// Merge with the on-disk snapshot and persist.
    ///
    /// Entries from this session win over the snapshot and entries dropped
    /// this session stay dropped. With `rebuild_if_inconsistent`, a mismatch
    /// between indexed paths and artifact files on disk triggers a rebuild
    /// from stamps.
    pub fn sync(&mut self, rebuild_if_inconsistent: bool) -> Result<SyncReport, CacheError> {
        let index_path = self.index_path();
        let mut merged = match index::load(&index_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    service = services::CACHE,
                    operation = operations::SYNC,
                    status = status::ERROR,
                    error = %e,
                    "ignoring unreadable snapshot"
                );
                BTreeMap::new()
            }
        };
        merged.retain(|crs, _| !self.dropped.contains(crs));
        merged.extend(
            self.entries
                .iter()
                .map(|(crs, path)| (crs.clone(), path.clone())),
        );
        merged.retain(|crs, path| {
            let exists = path.exists();
            if !exists {
                warn!(crs = %crs, path = %path.display(), "pruning entry with missing file");
            }
            exists
        });
        self.entries = merged;

        let mut rebuilt = false;
        if rebuild_if_inconsistent && !self.is_consistent() {
            info!(
                service = services::CACHE,
                operation = operations::SYNC,
                "index does not match files on disk, rebuilding from stamps"
            );
            self.entries = self.scan_stamps();
            rebuilt = true;
        }

        index::persist(&index_path, &self.entries)?;
        self.dropped.clear();

        info!(
            service = services::CACHE,
            operation = operations::SYNC,
            status = status::SUCCESS,
            entry_count = self.entries.len(),
            rebuilt,
            "index synced"
        );
        Ok(SyncReport {
            entries: self.entries.len(),
            rebuilt,
        })
    }

    /// Sync and release the store
    pub fn close(mut self) -> Result<(), CacheError> {
        self.sync(false).map(|_| ())
    }

    /// Replace the index with what the artifacts' stamps say and persist it.
    pub fn rebuild(&mut self) -> Result<usize, CacheError> {
        let rebuilt = self.scan_stamps();
        self.entries = rebuilt;
        index::persist(&self.index_path(), &self.entries)?;
        self.dropped.clear();

        info!(
            service = services::CACHE,
            operation = operations::REBUILD,
            entry_count = self.entries.len(),
            "index rebuilt from stamps"
        );
        Ok(self.entries.len())
    }

    /// Stamp of the artifact at `path`
    pub fn read_stamp(&self, path: &Path) -> Result<Option<Stamp>, CacheError> {
        let format = Format::from_path(path).unwrap_or_default();
        self.stamper.read(path, format)
    }

    /// Entries matching `filter`; entries with missing files are pruned.
    pub fn list(&mut self, filter: &ListFilter) -> Result<Vec<CrsEntry>, CacheError> {
        let now = SystemTime::now();
        let mut matched = Vec::new();
        let mut stale = Vec::new();

        for (crs, path) in &self.entries {
            let metadata = match fs::metadata(path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    stale.push((crs.clone(), path.clone()));
                    continue;
                }
                Err(e) => return Err(CacheError::io(path, e)),
            };
            let entry = CrsEntry {
                crs: crs.clone(),
                path: path.clone(),
                size_bytes: metadata.len(),
                modified: metadata.modified().unwrap_or(now),
                accessed: metadata.accessed().unwrap_or(now),
                protected: metadata.permissions().readonly(),
            };
            if filter.matches(&entry, now) {
                matched.push(entry);
            }
        }

        for (crs, path) in stale {
            self.prune(&crs, &path);
        }
        Ok(matched)
    }

    /// Total bytes of the matching entries
    pub fn usage(&mut self, filter: &ListFilter) -> Result<u64, CacheError> {
        Ok(self.list(filter)?.iter().map(|entry| entry.size_bytes).sum())
    }

    pub fn count(&mut self, filter: &ListFilter) -> Result<usize, CacheError> {
        Ok(self.list(filter)?.len())
    }

    /// Drop every matching entry; protected ones are skipped unless `force`.
    pub fn remove(&mut self, filter: &ListFilter, force: bool) -> Result<Vec<String>, CacheError> {
        let mut removed = Vec::new();
        for entry in self.list(filter)? {
            match self.drop(&entry.crs, force) {
                Ok(true) => removed.push(entry.crs),
                Ok(false) => {}
                Err(CacheError::WriteProtected { crs, .. }) => {
                    warn!(crs = %crs, "skipping protected entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Move the artifact of `old_crs` to the path of `new_crs`, restamping it.
    pub fn rename(&mut self, old_crs: &str, new_crs: &str) -> Result<PathBuf, CacheError> {
        let old_path = self
            .lookup_exact(old_crs)
            .ok_or_else(|| CacheError::NotCached {
                crs: old_crs.to_string(),
            })?;
        if is_protected(&old_path) {
            return Err(CacheError::WriteProtected {
                crs: old_crs.to_string(),
                path: old_path,
            });
        }

        let format = Format::from_path(&old_path).unwrap_or_default();
        let new_path = self.path_for(new_crs, format)?;
        self.register(&old_path, new_crs, &new_path)?;
        if old_crs != new_crs {
            self.entries.remove(old_crs);
            self.dropped.insert(old_crs.to_string());
        }

        info!(
            service = services::CACHE,
            operation = operations::RENAME,
            from = old_crs,
            to = new_crs,
            "renamed"
        );
        Ok(new_path)
    }

    /// Remove every artifact and entry. Protected files survive unless `force`.
    pub fn reset(&mut self, force: bool) -> Result<usize, CacheError> {
        let crss: Vec<String> = self.entries.keys().cloned().collect();
        let mut removed = 0;
        for crs in crss {
            match self.drop(&crs, force) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(CacheError::WriteProtected { crs, .. }) => {
                    warn!(crs = %crs, "keeping protected entry");
                }
                Err(e) => return Err(e),
            }
        }

        let kept: BTreeSet<&PathBuf> = self.entries.values().collect();
        for file in self.artifact_files() {
            if kept.contains(&file) {
                continue;
            }
            if is_protected(&file) {
                if !force {
                    continue;
                }
                set_protected(&file, false)?;
            }
            fs::remove_file(&file).map_err(|e| CacheError::io(&file, e))?;
            removed += 1;
        }

        index::persist(&self.index_path(), &self.entries)?;
        self.dropped.clear();

        info!(
            service = services::CACHE,
            operation = operations::RESET,
            removed,
            "cache reset"
        );
        Ok(removed)
    }

    fn prune(&mut self, crs: &str, path: &Path) {
        warn!(
            service = services::CACHE,
            status = status::PRUNED,
            error = %CacheError::FileMissing { crs: crs.to_string(), path: path.to_path_buf() },
            "pruning stale entry"
        );
        self.entries.remove(crs);
        self.dropped.insert(crs.to_string());
    }

    /// Artifact files below the root in path order
    fn artifact_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.options.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| Format::from_path(path).is_some() && !paths::is_temp_path(path))
            .collect()
    }

    fn is_consistent(&self) -> bool {
        let files: BTreeSet<PathBuf> = self.artifact_files().into_iter().collect();
        let indexed: BTreeSet<PathBuf> = self.entries.values().cloned().collect();
        files == indexed
    }

    fn scan_stamps(&self) -> BTreeMap<String, PathBuf> {
        let mut entries = BTreeMap::new();
        for file in self.artifact_files() {
            match self.read_stamp(&file) {
                Ok(Some(stamp)) => {
                    entries.insert(stamp.crs, file);
                }
                Ok(None) => warn!(path = %file.display(), "skipping unstamped artifact"),
                Err(e) => warn!(path = %file.display(), error = %e, "skipping unreadable artifact"),
            }
        }
        entries
    }
}

fn move_file(from: &Path, to: &Path) -> Result<(), CacheError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Different filesystem
    fs::copy(from, to).map_err(|e| CacheError::io(to, e))?;
    fs::remove_file(from).map_err(|e| CacheError::io(from, e))
}

fn discard_temp(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed temporary file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temporary file"),
    }
}

fn is_protected(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.permissions().readonly())
        .unwrap_or(false)
}

fn set_protected(path: &Path, protected: bool) -> Result<(), CacheError> {
    let mut permissions = fs::metadata(path)
        .map_err(|e| CacheError::io(path, e))?
        .permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = permissions.mode();
        permissions.set_mode(if protected { mode & !0o222 } else { mode | 0o200 });
    }
    #[cfg(not(unix))]
    permissions.set_readonly(protected);

    fs::set_permissions(path, permissions).map_err(|e| CacheError::io(path, e))
}
