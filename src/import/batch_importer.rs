//! Importer implementations selected by configuration.

use tracing::info;

use super::collector::Collector;
use super::logic::{ImportLogic, ImportReport, RelationshipLinkingMonitor};
use crate::config::{ImportConfig, ImporterKind};
use crate::input::Input;
use crate::staging::ExecutionMonitor;
use crate::storage::BatchingStores;
use crate::types::Result;

/// Imports an input into empty stores.
pub trait BatchImporter: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Runs every import step. The stores are closed afterwards whether or not the import succeeded.
    fn do_import(
        &self,
        input: &dyn Input,
        stores: &BatchingStores,
        collector: &dyn Collector,
        monitor: &dyn ExecutionMonitor,
    ) -> Result<ImportReport>;
}

fn run(
    name: &'static str,
    config: ImportConfig,
    linking_monitor: Option<&dyn RelationshipLinkingMonitor>,
    input: &dyn Input,
    stores: &BatchingStores,
    collector: &dyn Collector,
    monitor: &dyn ExecutionMonitor,
) -> Result<ImportReport> {
    info!(
        importer = name,
        processors = config.processors(),
        dir = ?stores.dir(),
        "import.start"
    );
    let mut logic = ImportLogic::new(stores, input, config, collector, monitor);
    if let Some(linking) = linking_monitor {
        logic = logic.with_linking_monitor(linking);
    }
    let outcome = logic.run();
    let report = logic.close()?;
    outcome.map(|()| report)
}

/// Runs every step with the configured number of workers.
#[derive(Clone, Debug, Default)]
pub struct ParallelBatchImporter {
    config: ImportConfig,
}

impl ParallelBatchImporter {
    /// Importer using `config`.
    pub fn new(config: ImportConfig) -> Self {
        Self {
            config: config.importer(ImporterKind::Parallel),
        }
    }

    /// Runs the import while reporting linking rounds to `linking`.
    pub fn do_import_with_linking_monitor(
        &self,
        input: &dyn Input,
        stores: &BatchingStores,
        collector: &dyn Collector,
        monitor: &dyn ExecutionMonitor,
        linking: &dyn RelationshipLinkingMonitor,
    ) -> Result<ImportReport> {
        run(self.name(), self.config.clone(), Some(linking), input, stores, collector, monitor)
    }
}

impl BatchImporter for ParallelBatchImporter {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn do_import(
        &self,
        input: &dyn Input,
        stores: &BatchingStores,
        collector: &dyn Collector,
        monitor: &dyn ExecutionMonitor,
    ) -> Result<ImportReport> {
        run(self.name(), self.config.clone(), None, input, stores, collector, monitor)
    }
}

/// Runs every step on a single worker, for debugging and small inputs.
#[derive(Clone, Debug, Default)]
pub struct SequentialBatchImporter {
    config: ImportConfig,
}

impl SequentialBatchImporter {
    /// Importer using `config` with one worker per step.
    pub fn new(config: ImportConfig) -> Self {
        Self {
            config: config.importer(ImporterKind::Sequential),
        }
    }
}

impl BatchImporter for SequentialBatchImporter {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn do_import(
        &self,
        input: &dyn Input,
        stores: &BatchingStores,
        collector: &dyn Collector,
        monitor: &dyn ExecutionMonitor,
    ) -> Result<ImportReport> {
        run(self.name(), self.config.clone(), None, input, stores, collector, monitor)
    }
}

/// Importer selected by `config.importer`.
pub fn batch_importer(config: ImportConfig) -> Box<dyn BatchImporter> {
    match config.importer {
        ImporterKind::Parallel => Box::new(ParallelBatchImporter::new(config)),
        ImporterKind::Sequential => Box::new(SequentialBatchImporter::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_follows_configuration() {
        let parallel = batch_importer(ImportConfig::default());
        assert_eq!(parallel.name(), "parallel");
        let sequential = batch_importer(ImportConfig::default().importer(ImporterKind::Sequential));
        assert_eq!(sequential.name(), "sequential");
    }
}
