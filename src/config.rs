//! Import configuration, loadable from TOML.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::input::IdType;
use crate::staging::StageConfig;
use crate::types::{ImportError, Result};

/// Which importer drives the stages.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ImporterKind {
    /// Steps run with as many workers as configured.
    #[default]
    Parallel,
    /// Every step runs on a single worker.
    Sequential,
}

/// Uniqueness constraint enforced while importing nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Label the constraint applies to.
    pub label: String,
    /// Property key that must be unique among nodes with `label`.
    pub property: String,
}

/// Tunables of one import run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    /// Entities per batch read from the input.
    pub batch_size: usize,
    /// Capacity of the queues between steps.
    pub max_queue_size: usize,
    /// Worker threads per step.
    pub max_processors: usize,
    /// Degree at which a node becomes dense.
    pub dense_node_threshold: u32,
    /// Memory budget in bytes for caches.
    pub max_memory: u64,
    /// Verify that relationship endpoints are live node records.
    pub strict_node_check: bool,
    /// Bad entities tolerated before the import fails; `None` is unbounded.
    pub bad_tolerance: Option<u64>,
    /// Bad entities kept in memory for the report.
    pub max_retained_bad_entries: usize,
    /// Stage health check interval in milliseconds.
    pub check_interval_ms: u64,
    /// Store pages read per batch when scanning records.
    pub records_per_page_batch_pages: usize,
    /// Queue capacity of the linking stages.
    pub linking_queue_size: usize,
    /// Importer implementation.
    pub importer: ImporterKind,
    /// How input ids are interpreted.
    pub id_type: IdType,
    /// Ids fetched per allocator refill; 0 uses records per page.
    pub id_batch_size: usize,
    /// Uniqueness constraints checked on node import.
    pub unique: Vec<UniqueConstraint>,
    /// Labels whose nodes are dense whatever their degree.
    pub dense_labels: Vec<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            max_queue_size: 16,
            max_processors: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            dense_node_threshold: 50,
            max_memory: 2 << 30,
            strict_node_check: false,
            bad_tolerance: None,
            max_retained_bad_entries: 1_000,
            check_interval_ms: 50,
            records_per_page_batch_pages: 500,
            linking_queue_size: 10,
            importer: ImporterKind::Parallel,
            id_type: IdType::String,
            id_batch_size: 0,
            unique: Vec::new(),
            dense_labels: Vec::new(),
        }
    }
}

impl ImportConfig {
    /// Parses and validates a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| ImportError::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_toml_str(&contents)
            .map_err(|err| ImportError::Config(format!("{}: {err}", path.display())))
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ImportConfig =
            toml::from_str(contents).map_err(|err| ImportError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("max_queue_size", self.max_queue_size),
            ("max_processors", self.max_processors),
            ("records_per_page_batch_pages", self.records_per_page_batch_pages),
            ("linking_queue_size", self.linking_queue_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ImportError::Config(format!("{name} must be positive")));
            }
        }
        if self.check_interval_ms == 0 {
            return Err(ImportError::Config("check_interval_ms must be positive".into()));
        }
        if self.max_memory == 0 {
            return Err(ImportError::Config("max_memory must be positive".into()));
        }
        Ok(())
    }

    /// Sets the entities per input batch.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the queue capacity between steps.
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Sets the worker threads per step.
    pub fn max_processors(mut self, processors: usize) -> Self {
        self.max_processors = processors;
        self
    }

    /// Sets the dense node threshold.
    pub fn dense_node_threshold(mut self, threshold: u32) -> Self {
        self.dense_node_threshold = threshold;
        self
    }

    /// Sets the cache memory budget.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Enables endpoint liveness checks.
    pub fn strict_node_check(mut self, enabled: bool) -> Self {
        self.strict_node_check = enabled;
        self
    }

    /// Sets the bad entity tolerance.
    pub fn bad_tolerance(mut self, tolerance: Option<u64>) -> Self {
        self.bad_tolerance = tolerance;
        self
    }

    /// Sets the importer implementation.
    pub fn importer(mut self, kind: ImporterKind) -> Self {
        self.importer = kind;
        self
    }

    /// Sets how input ids are interpreted.
    pub fn id_type(mut self, id_type: IdType) -> Self {
        self.id_type = id_type;
        self
    }

    /// Sets the id allocator batch size.
    pub fn id_batch_size(mut self, size: usize) -> Self {
        self.id_batch_size = size;
        self
    }

    /// Adds a uniqueness constraint.
    pub fn unique(mut self, label: impl Into<String>, property: impl Into<String>) -> Self {
        self.unique.push(UniqueConstraint {
            label: label.into(),
            property: property.into(),
        });
        self
    }

    /// Makes every node carrying `label` dense.
    pub fn dense_label(mut self, label: impl Into<String>) -> Self {
        self.dense_labels.push(label.into());
        self
    }

    /// Worker threads a step actually gets under the chosen importer.
    pub fn processors(&self) -> usize {
        match self.importer {
            ImporterKind::Parallel => self.max_processors.max(1),
            ImporterKind::Sequential => 1,
        }
    }

    /// Stage sizing derived from this configuration.
    pub fn stage_config(&self) -> StageConfig {
        StageConfig {
            batch_size: self.batch_size.max(1),
            queue_size: self.max_queue_size.max(1),
            max_processors: self.processors(),
            check_interval: Duration::from_millis(self.check_interval_ms.max(1)),
        }
    }

    /// Stage sizing of the linking stages.
    pub fn linking_stage_config(&self) -> StageConfig {
        StageConfig {
            queue_size: self.linking_queue_size.max(1),
            ..self.stage_config()
        }
    }

    /// Id batch size for a store with `records_per_page` records per page.
    pub fn id_batch_size_for(&self, records_per_page: usize) -> usize {
        if self.id_batch_size == 0 {
            records_per_page.max(1)
        } else {
            self.id_batch_size
        }
    }
}
