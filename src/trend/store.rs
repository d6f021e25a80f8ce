//! Durable, append-only trend series.
//!
//! One file per metric family, `<log_dir>/<family>_clustercheck_tracking.csv`,
//! with rows `timestamp,lnn,label,value,unit`. The first time a family is
//! opened in a run, an existing file is copied to `.bak`.

use crate::models::{Lnn, TrendSample};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Backing file of one metric family.
#[derive(Debug)]
pub struct TrendStore {
    family: String,
    path: PathBuf,
    /// Newest timestamp written per series, to keep series monotonic.
    newest: HashMap<(Lnn, String), i64>,
}

impl TrendStore {
    /// File name of a family inside the log directory.
    pub fn file_name(family: &str) -> String {
        format!("{}_clustercheck_tracking.csv", family)
    }

    /// Open (creating if needed) the store of `family`, backing up any
    /// existing file first.
    pub fn open(log_dir: &Path, family: &str) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

        let path = log_dir.join(Self::file_name(family));
        if path.exists() {
            let mut backup = path.clone().into_os_string();
            backup.push(".bak");
            fs::copy(&path, &backup)
                .with_context(|| format!("Failed to back up trend store: {}", path.display()))?;
            debug!("Backed up {} before appending", path.display());
        } else {
            File::create(&path)
                .with_context(|| format!("Failed to create trend store: {}", path.display()))?;
        }

        let mut store = Self {
            family: family.to_string(),
            path,
            newest: HashMap::new(),
        };
        for sample in store.load()? {
            let key = (sample.lnn, sample.label);
            let entry = store.newest.entry(key).or_insert(sample.timestamp);
            *entry = (*entry).max(sample.timestamp);
        }
        Ok(store)
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every well-formed row, in file order. Malformed rows are skipped.
    pub fn load(&self) -> Result<Vec<TrendSample>> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read trend store: {}", self.path.display()))?;

        let mut samples = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_row(line) {
                Some(sample) => samples.push(sample),
                None => debug!("{}:{}: skipping malformed row", self.path.display(), number + 1),
            }
        }
        Ok(samples)
    }

    /// The `(timestamp, value)` series of one node and label, oldest first.
    pub fn series(&self, lnn: Lnn, label: &str) -> Result<Vec<(f64, f64)>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|s| s.lnn == lnn && s.label == label)
            .map(|s| (s.timestamp as f64, s.value))
            .collect())
    }

    /// Append samples. A sample older than the newest one already stored
    /// for its series is dropped with a warning.
    pub fn append(&mut self, samples: &[TrendSample]) -> Result<usize> {
        let mut rows = String::new();
        let mut written = 0;
        for sample in samples {
            let key = (sample.lnn, sample.label.clone());
            if let Some(&newest) = self.newest.get(&key) {
                if sample.timestamp < newest {
                    warn!(
                        "Dropping out-of-order {} sample for node {} ({} < {})",
                        sample.label, sample.lnn, sample.timestamp, newest
                    );
                    continue;
                }
            }
            self.newest.insert(key, sample.timestamp);
            rows.push_str(&format_row(sample));
            written += 1;
        }

        if written > 0 {
            let mut file = OpenOptions::new()
                .append(true)
                .open(&self.path)
                .with_context(|| format!("Failed to open trend store: {}", self.path.display()))?;
            file.write_all(rows.as_bytes())
                .with_context(|| format!("Failed to append to trend store: {}", self.path.display()))?;
        }
        Ok(written)
    }
}

fn clean_field(field: &str) -> String {
    field.replace([',', '\n', '\r'], " ")
}

fn format_row(sample: &TrendSample) -> String {
    format!(
        "{},{},{},{},{}\n",
        sample.timestamp,
        sample.lnn,
        clean_field(&sample.label),
        sample.value,
        clean_field(&sample.unit)
    )
}

fn parse_row(line: &str) -> Option<TrendSample> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 5 {
        return None;
    }
    let value = fields[3].parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(TrendSample {
        timestamp: fields[0].parse().ok()?,
        lnn: fields[1].parse().ok()?,
        label: fields[2].to_string(),
        value,
        unit: fields[4].to_string(),
    })
}

/// Stores opened so far in this run, keyed by family.
///
/// Stores are opened lazily and kept for the life of the process, so the
/// backup happens once per run rather than once per cycle.
#[derive(Debug)]
pub struct TrendStores {
    log_dir: PathBuf,
    stores: BTreeMap<String, TrendStore>,
}

impl TrendStores {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            stores: BTreeMap::new(),
        }
    }

    /// The store of `family`, opening it on first use.
    pub fn get(&mut self, family: &str) -> Result<&mut TrendStore> {
        if !self.stores.contains_key(family) {
            let store = TrendStore::open(&self.log_dir, family)?;
            self.stores.insert(family.to_string(), store);
        }
        self.stores
            .get_mut(family)
            .with_context(|| format!("trend store '{}' vanished", family))
    }

    /// Paths of every store opened so far.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.stores.values().map(|s| s.path().to_path_buf()).collect()
    }
}
