//! Result cache: persisted benchmark results keyed by problem identity and
//! configuration key.
//!
//! The file is JSON Lines. The first line is a header
//! (`{"format":"ktuner-cache","version":1}`), every other line is one entry:
//!
//! ```text
//! {"problem":{...},"key":"128,2","result":{...}}
//! ```
//!
//! Entries are only ever appended, and each append is flushed and synced
//! before `record` returns, so a crash can at worst tear the line being
//! written. Torn lines are skipped on load. `compact` rewrites the file
//! through a temporary file and a rename.

use crate::benchmark::BenchmarkResult;
use crate::errors::{Result, TunerError};
use crate::space::Configuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

pub const CACHE_FORMAT: &str = "ktuner-cache";
pub const CACHE_VERSION: u32 = 1;

/// Everything that must match for two runs to share cached results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProblemIdentity {
    pub kernel_name: String,
    pub problem_size: String,
    pub device_name: String,
    pub param_names: Vec<String>,
}

impl std::fmt::Display for ProblemIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] on {} ({})",
            self.kernel_name,
            self.problem_size,
            self.device_name,
            self.param_names.join(", ")
        )
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    format: String,
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct Entry {
    problem: ProblemIdentity,
    key: String,
    result: BenchmarkResult,
}

/// Where a tuning run reads and records results.
pub trait ResultStore {
    fn lookup(&mut self, problem: &ProblemIdentity, config: &Configuration)
        -> Option<BenchmarkResult>;

    fn record(&mut self, problem: &ProblemIdentity, result: &BenchmarkResult) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

pub struct ResultCache {
    path: Option<PathBuf>,
    file: Option<File>,
    entries: HashMap<ProblemIdentity, HashMap<String, BenchmarkResult>>,
    hits: u64,
    misses: u64,
    skipped_lines: usize,
}

fn cache_error(path: &Path, reason: impl Into<String>) -> TunerError {
    TunerError::Cache {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn header_line() -> Result<String> {
    let header = Header {
        format: CACHE_FORMAT.to_string(),
        version: CACHE_VERSION,
    };
    Ok(serde_json::to_string(&header)? + "\n")
}

impl ResultCache {
    /// Cache without a backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: None,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            skipped_lines: 0,
        }
    }

    /// Open or create a cache file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut cache = Self::in_memory();
        cache.path = Some(path.to_path_buf());

        let existing = match fs::read(path) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        match existing.as_deref().filter(|c| !c.trim().is_empty()) {
            None => {
                file.write_all(header_line()?.as_bytes())?;
                file.sync_data()?;
                debug!("created cache file {}", path.display());
            }
            Some(content) => {
                cache.load(path, content)?;
                if !content.ends_with('\n') {
                    // torn final line: terminate it so the next append starts clean
                    file.write_all(b"\n")?;
                    file.sync_data()?;
                }
                info!(
                    "loaded {} cached results from {}",
                    cache.len(),
                    path.display()
                );
            }
        }
        cache.file = Some(file);
        Ok(cache)
    }

    fn load(&mut self, path: &Path, content: &str) -> Result<()> {
        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty());

        let Some((_, first)) = lines.next() else {
            return Ok(());
        };
        let header: Header = serde_json::from_str(first)
            .map_err(|e| cache_error(path, format!("missing or corrupt header: {}", e)))?;
        if header.format != CACHE_FORMAT {
            return Err(cache_error(
                path,
                format!("unknown format `{}`", header.format),
            ));
        }
        if header.version > CACHE_VERSION {
            return Err(cache_error(
                path,
                format!(
                    "version {} is newer than supported version {}",
                    header.version, CACHE_VERSION
                ),
            ));
        }

        for (lineno, line) in lines {
            match serde_json::from_str::<Entry>(line) {
                Ok(entry) => {
                    // the stored key is informational; lookups use the current encoding
                    let key = entry.result.config.key();
                    self.entries
                        .entry(entry.problem)
                        .or_default()
                        .insert(key, entry.result);
                }
                Err(e) => {
                    self.skipped_lines += 1;
                    warn!(
                        "{}:{}: skipping unreadable cache line: {}",
                        path.display(),
                        lineno + 1,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of distinct cached results.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Lines dropped while loading because they could not be parsed.
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn problems(&self) -> Vec<&ProblemIdentity> {
        let mut problems: Vec<_> = self.entries.keys().collect();
        problems.sort();
        problems
    }

    /// Results for one problem, sorted by configuration key.
    pub fn results(&self, problem: &ProblemIdentity) -> Vec<(&str, &BenchmarkResult)> {
        let mut out: Vec<_> = self
            .entries
            .get(problem)
            .map(|m| m.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }

    pub fn get(&self, problem: &ProblemIdentity, key: &str) -> Option<&BenchmarkResult> {
        self.entries.get(problem).and_then(|m| m.get(key))
    }

    pub fn lookup(
        &mut self,
        problem: &ProblemIdentity,
        config: &Configuration,
    ) -> Option<BenchmarkResult> {
        let found = self.get(problem, &config.key()).cloned();
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Store a result and make it durable before returning.
    pub fn record(&mut self, problem: &ProblemIdentity, result: &BenchmarkResult) -> Result<()> {
        let key = result.config.key();
        if let Some(file) = self.file.as_mut() {
            let entry = Entry {
                problem: problem.clone(),
                key: key.clone(),
                result: result.clone(),
            };
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            file.flush()?;
            file.sync_data()?;
        }
        self.entries
            .entry(problem.clone())
            .or_default()
            .insert(key, result.clone());
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.sync_data()?;
        }
        Ok(())
    }

    /// Rewrite the file with one line per cached result. Returns the number of
    /// entries written.
    pub fn compact(&mut self) -> Result<usize> {
        let Some(path) = self.path.clone() else {
            return Ok(self.len());
        };
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut written = 0;
        {
            let mut out = File::create(&tmp)?;
            let mut buf = header_line()?;
            for problem in self.problems() {
                for (key, result) in self.results(problem) {
                    let entry = Entry {
                        problem: problem.clone(),
                        key: key.to_string(),
                        result: result.clone(),
                    };
                    buf.push_str(&serde_json::to_string(&entry)?);
                    buf.push('\n');
                    written += 1;
                }
            }
            out.write_all(buf.as_bytes())?;
            out.sync_all()?;
        }
        self.file = None;
        fs::rename(&tmp, &path)?;
        self.file = Some(OpenOptions::new().append(true).open(&path)?);
        self.skipped_lines = 0;
        info!("compacted {} to {} entries", path.display(), written);
        Ok(written)
    }
}

impl ResultStore for ResultCache {
    fn lookup(
        &mut self,
        problem: &ProblemIdentity,
        config: &Configuration,
    ) -> Option<BenchmarkResult> {
        ResultCache::lookup(self, problem, config)
    }

    fn record(&mut self, problem: &ProblemIdentity, result: &BenchmarkResult) -> Result<()> {
        ResultCache::record(self, problem, result)
    }

    fn flush(&mut self) -> Result<()> {
        ResultCache::flush(self)
    }
}

/// Shared between tuning sessions running on different devices.
impl ResultStore for &Mutex<ResultCache> {
    fn lookup(
        &mut self,
        problem: &ProblemIdentity,
        config: &Configuration,
    ) -> Option<BenchmarkResult> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(problem, config)
    }

    fn record(&mut self, problem: &ProblemIdentity, result: &BenchmarkResult) -> Result<()> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(problem, result)
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

impl<S: ResultStore + ?Sized> ResultStore for &mut S {
    fn lookup(
        &mut self,
        problem: &ProblemIdentity,
        config: &Configuration,
    ) -> Option<BenchmarkResult> {
        (**self).lookup(problem, config)
    }

    fn record(&mut self, problem: &ProblemIdentity, result: &BenchmarkResult) -> Result<()> {
        (**self).record(problem, result)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}
