use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{GroupId, ImportError, InputId, Rejection, Result};

/// Category of a collected bad entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BadEntryKind {
    /// Relationship that could not be imported.
    Relationship,
    /// Node whose input id was already taken.
    DuplicateNode,
    /// Entity rejected by the schema monitor or malformed.
    Violation,
}

/// One recoverable per-entity failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BadEntry {
    /// Category.
    pub kind: BadEntryKind,
    /// Human readable entity description.
    pub entity: String,
    /// Why it was not imported.
    pub reason: String,
}

fn describe_id(id: Option<&InputId>) -> String {
    id.map(ToString::to_string).unwrap_or_else(|| "<none>".to_owned())
}

/// Sink for entities that were skipped instead of imported.
///
/// Collecting never aborts the import unless the collector's own tolerance is
/// exceeded, in which case it returns [`ImportError::TooManyBadEntries`].
pub trait Collector: Send + Sync {
    /// Records one bad entity.
    fn collect(&self, entry: BadEntry) -> Result<()>;

    /// Number of bad entities collected so far.
    fn bad_entries(&self) -> u64;

    /// Relationship with an unresolved endpoint or missing type.
    fn collect_bad_relationship(
        &self,
        start: Option<&InputId>,
        relationship_type: Option<&str>,
        end: Option<&InputId>,
        reason: &Rejection,
    ) -> Result<()> {
        self.collect(BadEntry {
            kind: BadEntryKind::Relationship,
            entity: format!(
                "({})-[:{}]->({})",
                describe_id(start),
                relationship_type.unwrap_or("<none>"),
                describe_id(end)
            ),
            reason: reason.to_string(),
        })
    }

    /// Node whose input id was already used in its group.
    fn collect_duplicate_node(&self, id: &InputId, group: GroupId, node: u64) -> Result<()> {
        self.collect(BadEntry {
            kind: BadEntryKind::DuplicateNode,
            entity: format!("node {id} (group {}, record {node})", group.0),
            reason: Rejection::DuplicateNode.to_string(),
        })
    }

    /// Entity rejected by a schema check or for being malformed.
    fn collect_entity_violating_constraint(
        &self,
        id: Option<&InputId>,
        node: Option<u64>,
        reason: &Rejection,
    ) -> Result<()> {
        let record = node.map(|n| format!(", record {n}")).unwrap_or_default();
        self.collect(BadEntry {
            kind: BadEntryKind::Violation,
            entity: format!("node {}{record}", describe_id(id)),
            reason: reason.to_string(),
        })
    }
}

/// Collector with a tolerance, a bounded in-memory list and an optional line report.
pub struct BadCollector {
    tolerance: Option<u64>,
    max_retained: usize,
    count: AtomicU64,
    entries: Mutex<Vec<BadEntry>>,
    report: Option<Mutex<Box<dyn Write + Send>>>,
}

impl BadCollector {
    /// Collector failing once more than `tolerance` entries were collected.
    pub fn new(tolerance: Option<u64>, max_retained: usize) -> Self {
        Self {
            tolerance,
            max_retained,
            count: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
            report: None,
        }
    }

    /// Also writes every entry as a JSON line to `report`.
    pub fn with_report(mut self, report: Box<dyn Write + Send>) -> Self {
        self.report = Some(Mutex::new(report));
        self
    }

    /// Retained entries.
    pub fn entries(&self) -> Vec<BadEntry> {
        self.entries.lock().clone()
    }

    /// Flushes the report writer.
    pub fn flush(&self) -> Result<()> {
        if let Some(report) = &self.report {
            report.lock().flush()?;
        }
        Ok(())
    }
}

impl Default for BadCollector {
    fn default() -> Self {
        Self::new(None, 1_000)
    }
}

impl Collector for BadCollector {
    fn collect(&self, entry: BadEntry) -> Result<()> {
        let total = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(kind = ?entry.kind, entity = %entry.entity, reason = %entry.reason, "collector.bad_entry");
        if let Some(report) = &self.report {
            let mut report = report.lock();
            serde_json::to_writer(&mut *report, &entry)?;
            report.write_all(b"\n")?;
        }
        {
            let mut entries = self.entries.lock();
            if entries.len() < self.max_retained {
                entries.push(entry);
            }
        }
        if let Some(tolerance) = self.tolerance {
            if total > tolerance {
                warn!(tolerance, total, "collector.tolerance_exceeded");
                return Err(ImportError::TooManyBadEntries { tolerance });
            }
        }
        Ok(())
    }

    fn bad_entries(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn tolerance_is_enforced_after_collecting() {
        let collector = BadCollector::new(Some(1), 10);
        let start = InputId::from("a");
        collector
            .collect_bad_relationship(Some(&start), Some("R"), None, &Rejection::MissingEndNode)
            .unwrap();
        let err = collector
            .collect_duplicate_node(&start, GroupId(0), 4)
            .unwrap_err();
        assert!(matches!(err, ImportError::TooManyBadEntries { tolerance: 1 }));
        assert_eq!(collector.bad_entries(), 2);
    }

    #[test]
    fn retained_entries_are_capped_and_reported() -> Result<()> {
        let buf = SharedBuf::default();
        let collector = BadCollector::new(None, 2).with_report(Box::new(buf.clone()));
        for i in 0..5 {
            collector.collect_entity_violating_constraint(
                Some(&InputId::Int(i)),
                Some(i as u64),
                &Rejection::ConstraintViolation("dup email".into()),
            )?;
        }
        collector.flush()?;
        assert_eq!(collector.entries().len(), 2);
        assert_eq!(collector.entries()[0].entity, "node 0, record 0");
        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert_eq!(text.lines().count(), 5);
        assert!(text.contains("\"kind\":\"violation\""));
        Ok(())
    }
}
