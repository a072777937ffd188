//! Relationship chain linking.
//!
//! A linking round streams the relationship store twice. The forward pass runs
//! in ascending id order and sets `next` pointers: every relationship becomes
//! the new head of its chain and points at the previous head. The backward pass
//! runs in descending id order over the same relationships and sets the `prev`
//! pointers; the head of each chain stores the chain length instead.
//!
//! Sparse nodes have one chain over all types and are linked in the first round
//! only. Dense nodes have one chain per type and direction; a round links the
//! dense chains of the types admitted into it. Between the two passes the group
//! heads of dense nodes are written to the scratch group store and, in the first
//! round, sparse nodes get their first relationship.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use crate::cache::{NodeRelationshipCache, NodeType, EMPTY};
use crate::staging::{Batch, ExecutionMonitor, Processor, Producer, Stage, StageConfig, StageSummary, Step};
use crate::storage::{
    BatchingStores, IdGenerator, IdRangeSource, NodeRecord, RecordFormat, RelationshipGroupRecord,
    RelationshipRecord,
};
use crate::types::{Direction, ImportError, Result, TypeId, NULL_REF};

use super::scan::{RecordScanProducer, UpdateRecordsSink};

/// Types linked by one round and whether sparse nodes are linked as well.
#[derive(Clone, Copy)]
pub struct LinkingRound<'a> {
    /// Relationship types whose dense chains are linked.
    pub types: &'a FxHashSet<u32>,
    /// Also link sparse nodes, for every type.
    pub link_sparse: bool,
}

impl LinkingRound<'_> {
    fn wants_relationship(&self, rel: &RelationshipRecord) -> bool {
        self.link_sparse || self.types.contains(&rel.type_id)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    Forward,
    Backward,
}

struct LinkUpdate {
    index: usize,
    node: u64,
    pointer: u64,
    first_in_chain: bool,
}

fn endpoints(rel: &RelationshipRecord) -> SmallVec<[(u64, Direction); 2]> {
    if rel.is_loop() {
        smallvec![(rel.first_node, Direction::Loop)]
    } else {
        smallvec![
            (rel.first_node, Direction::Outgoing),
            (rel.second_node, Direction::Incoming)
        ]
    }
}

/// Chain linking over one node partition of a batch.
#[derive(Clone, Copy)]
struct ChainLinker<'a> {
    cache: &'a NodeRelationshipCache,
    round: LinkingRound<'a>,
    pass: Pass,
}

impl ChainLinker<'_> {
    fn link(&self, items: &[RelationshipRecord], fork: u64, forks: u64) -> Result<Vec<LinkUpdate>> {
        let mut updates = Vec::new();
        for (index, rel) in items.iter().enumerate() {
            let type_id = TypeId(rel.type_id);
            let in_round = self.round.types.contains(&rel.type_id);
            for (node, direction) in endpoints(rel) {
                if node % forks != fork {
                    continue;
                }
                let dense = self.cache.is_dense(node)?;
                if (dense && !in_round) || (!dense && !self.round.link_sparse) {
                    continue;
                }
                let previous = self.cache.get_and_put_relationship(
                    node,
                    type_id,
                    direction,
                    rel.id,
                    self.pass == Pass::Forward,
                )?;
                let (pointer, first_in_chain) = match self.pass {
                    Pass::Forward if previous == EMPTY => (NULL_REF, false),
                    Pass::Backward if previous == EMPTY => {
                        (self.cache.get_count(node, type_id, direction)?, true)
                    }
                    _ => (previous, false),
                };
                updates.push(LinkUpdate {
                    index,
                    node,
                    pointer,
                    first_in_chain,
                });
            }
        }
        Ok(updates)
    }
}

/// Fork threads living as long as a linking stage. Fork `f` links the nodes
/// with `node % forks == f`, so every chain is extended by one thread in batch order.
struct Forks {
    jobs: Vec<Sender<Arc<Vec<RelationshipRecord>>>>,
    replies: Receiver<Result<Vec<LinkUpdate>>>,
}

impl Forks {
    fn start<'scope, 'a: 'scope>(
        scope: &'scope thread::Scope<'scope, '_>,
        chains: ChainLinker<'a>,
        forks: usize,
    ) -> Result<Self> {
        let (reply_tx, replies) = bounded(forks);
        let mut jobs = Vec::with_capacity(forks);
        for fork in 0..forks {
            let (job_tx, job_rx) = bounded::<Arc<Vec<RelationshipRecord>>>(1);
            let reply_tx = reply_tx.clone();
            thread::Builder::new()
                .name(format!("link-fork-{fork}"))
                .spawn_scoped(scope, move || {
                    for items in job_rx.iter() {
                        let updates = catch_unwind(AssertUnwindSafe(|| {
                            chains.link(&items, fork as u64, forks as u64)
                        }))
                        .unwrap_or_else(|_| Err(ImportError::corruption("linking fork panicked")));
                        // The batch goes back to the stage only once every fork let go of it.
                        drop(items);
                        if reply_tx.send(updates).is_err() {
                            break;
                        }
                    }
                })
                .map_err(ImportError::Io)?;
            jobs.push(job_tx);
        }
        Ok(Self { jobs, replies })
    }

    fn link(&self, batch: &mut Batch<RelationshipRecord>) -> Result<Vec<LinkUpdate>> {
        let stopped = || ImportError::corruption("linking fork stopped");
        let items = Arc::new(std::mem::take(&mut batch.items));
        for job in &self.jobs {
            job.send(Arc::clone(&items)).map_err(|_| stopped())?;
        }
        let mut updates = Vec::new();
        let mut failure = None;
        for _ in 0..self.jobs.len() {
            match self.replies.recv().map_err(|_| stopped())? {
                Ok(part) => updates.extend(part),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        batch.items = Arc::try_unwrap(items)
            .map_err(|_| ImportError::corruption("linking fork kept a batch"))?;
        match failure {
            Some(err) => Err(err),
            None => Ok(updates),
        }
    }
}

/// Links one batch at a time, inline or spread over [`Forks`].
struct RelationshipLinker<'a> {
    chains: ChainLinker<'a>,
    forks: Option<Forks>,
}

impl Processor<RelationshipRecord> for RelationshipLinker<'_> {
    fn process(&self, _worker: usize, batch: &mut Batch<RelationshipRecord>) -> Result<()> {
        let updates = match &self.forks {
            None => self.chains.link(&batch.items, 0, 1)?,
            Some(forks) => forks.link(batch)?,
        };
        for update in updates {
            let rel = &mut batch.items[update.index];
            match self.chains.pass {
                Pass::Forward => rel.set_next_for(update.node, update.pointer),
                Pass::Backward => rel.set_prev_for(update.node, update.pointer, update.first_in_chain),
            }
        }
        Ok(())
    }
}

struct LinkPass<'a> {
    stores: &'a BatchingStores,
    cache: &'a NodeRelationshipCache,
    round: LinkingRound<'a>,
    config: StageConfig,
    pages_per_batch: usize,
}

impl LinkPass<'_> {
    fn run(self, name: &str, pass: Pass, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        let expect_forward = pass == Pass::Forward;
        if self.cache.is_forward_scan() != expect_forward {
            return Err(ImportError::invalid(format!(
                "{name} needs the relationship cache in {} scan mode",
                if expect_forward { "forward" } else { "backward" }
            )));
        }
        let relationships = self.stores.relationships();
        let scan = if expect_forward {
            RecordScanProducer::ascending(relationships, self.pages_per_batch)
        } else {
            RecordScanProducer::descending(relationships, self.pages_per_batch)
        };
        let round = self.round;
        let chains = ChainLinker {
            cache: self.cache,
            round,
            pass,
        };
        let forks = self.config.max_processors.max(1);
        thread::scope(|scope| {
            let linker = RelationshipLinker {
                chains,
                forks: if forks > 1 {
                    Some(Forks::start(scope, chains, forks)?)
                } else {
                    None
                },
            };
            Stage::new(name, self.config)
                .add(Step::producer(
                    "read",
                    scan.with_filter(move |rel: &RelationshipRecord| round.wants_relationship(rel)),
                ))
                .add(Step::processor("link", linker))
                .add(
                    Step::sink("write", UpdateRecordsSink::new(relationships))
                        .with_workers(self.config.max_processors),
                )
                .execute(monitor)
        })
    }
}

/// Sets `next` pointers, scanning relationships in ascending id order.
pub struct RelationshipLinkForwardStage<'a>(LinkPass<'a>);

impl<'a> RelationshipLinkForwardStage<'a> {
    /// Forward pass of `round`; `cache` must be in forward scan mode.
    pub fn new(
        stores: &'a BatchingStores,
        cache: &'a NodeRelationshipCache,
        round: LinkingRound<'a>,
        config: StageConfig,
        pages_per_batch: usize,
    ) -> Self {
        Self(LinkPass {
            stores,
            cache,
            round,
            config,
            pages_per_batch,
        })
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        self.0.run("link forward", Pass::Forward, monitor)
    }
}

/// Sets `prev` pointers and chain lengths, scanning relationships in descending id order.
pub struct RelationshipLinkBackwardStage<'a>(LinkPass<'a>);

impl<'a> RelationshipLinkBackwardStage<'a> {
    /// Backward pass of `round`; `cache` must be in backward scan mode.
    pub fn new(
        stores: &'a BatchingStores,
        cache: &'a NodeRelationshipCache,
        round: LinkingRound<'a>,
        config: StageConfig,
        pages_per_batch: usize,
    ) -> Self {
        Self(LinkPass {
            stores,
            cache,
            round,
            config,
            pages_per_batch,
        })
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        self.0.run("link backward", Pass::Backward, monitor)
    }
}

/// Emits one scratch group record per chain-holding cache group of each changed dense node.
struct GroupProducer<'a> {
    cache: &'a NodeRelationshipCache,
    heads: &'a mut FxHashMap<u64, u64>,
    ids: &'a IdGenerator,
    next_node: u64,
    node_count: u64,
    nodes_per_batch: u64,
}

impl Producer<RelationshipGroupRecord> for GroupProducer<'_> {
    fn next_batch(
        &mut self,
        mut buffer: Vec<RelationshipGroupRecord>,
    ) -> Result<Option<Vec<RelationshipGroupRecord>>> {
        while buffer.is_empty() && self.next_node < self.node_count {
            let from = self.next_node;
            let to = (from + self.nodes_per_batch).min(self.node_count);
            self.next_node = to;
            let cache = self.cache;
            cache.visit_changed_nodes(NodeType::DENSE, from, to, |node, _| {
                cache.visit_groups(node, |group| {
                    let mut record = RelationshipGroupRecord::new(NULL_REF);
                    record.in_use = true;
                    record.type_id = group.type_id;
                    record.owner = node;
                    record.first = group.heads;
                    buffer.push(record);
                    Ok(())
                })
            })?;
            if buffer.is_empty() {
                continue;
            }
            let range = self.ids.next_id_batch(buffer.len())?;
            let ids = range
                .reused
                .iter()
                .copied()
                .chain(range.start..range.start + range.length);
            for (record, id) in buffer.iter_mut().zip(ids) {
                record.id = id;
                record.next = self.heads.insert(record.owner, id).unwrap_or(NULL_REF);
            }
        }
        Ok((!buffer.is_empty()).then_some(buffer))
    }
}

/// Writes the group heads of dense nodes linked by the forward pass to the scratch group store.
///
/// Each node's scratch groups form a chain through `next` that starts at its
/// most recently written group and is strictly decreasing in id. `heads` keeps
/// the latest group per node across rounds.
pub struct RelationshipGroupStage<'a> {
    stores: &'a BatchingStores,
    cache: &'a NodeRelationshipCache,
    heads: &'a mut FxHashMap<u64, u64>,
    config: StageConfig,
}

impl<'a> RelationshipGroupStage<'a> {
    /// Stage appending to `heads`.
    pub fn new(
        stores: &'a BatchingStores,
        cache: &'a NodeRelationshipCache,
        heads: &'a mut FxHashMap<u64, u64>,
        config: StageConfig,
    ) -> Self {
        Self {
            stores,
            cache,
            heads,
            config,
        }
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        let temp_groups = self.stores.temp_groups();
        let producer = GroupProducer {
            cache: self.cache,
            heads: self.heads,
            ids: temp_groups.id_generator(),
            next_node: 0,
            node_count: self.cache.node_count(),
            nodes_per_batch: self.config.batch_size.max(1) as u64,
        };
        let summary = Stage::new("relationship groups", self.config)
            .add(Step::producer("gather groups", producer))
            .add(Step::sink("write", UpdateRecordsSink::new(temp_groups)).with_workers(self.config.max_processors))
            .execute(monitor)?;
        debug!(groups = summary.steps[0].items, "import.link.groups");
        Ok(summary)
    }
}

/// Keeps sparse nodes with relationships and points them at the head of their chain.
struct SparseFirstRelationship<'a> {
    cache: &'a NodeRelationshipCache,
}

impl Processor<NodeRecord> for SparseFirstRelationship<'_> {
    fn process(&self, _worker: usize, batch: &mut Batch<NodeRecord>) -> Result<()> {
        let mut kept = Vec::with_capacity(batch.items.len());
        for mut node in batch.items.drain(..) {
            if self.cache.is_dense(node.id)? {
                continue;
            }
            let first = self.cache.first_relationship(node.id)?;
            if first == EMPTY {
                continue;
            }
            node.next_rel = first;
            kept.push(node);
        }
        batch.items = kept;
        Ok(())
    }
}

/// Sets the first relationship of every sparse node after the first forward pass.
pub struct SparseNodeFirstRelationshipStage<'a> {
    stores: &'a BatchingStores,
    cache: &'a NodeRelationshipCache,
    config: StageConfig,
    pages_per_batch: usize,
}

impl<'a> SparseNodeFirstRelationshipStage<'a> {
    /// Stage reading chain heads from `cache`.
    pub fn new(
        stores: &'a BatchingStores,
        cache: &'a NodeRelationshipCache,
        config: StageConfig,
        pages_per_batch: usize,
    ) -> Self {
        Self {
            stores,
            cache,
            config,
            pages_per_batch,
        }
    }

    /// Runs the stage.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        let nodes = self.stores.nodes();
        Stage::new("sparse node first relationship", self.config)
            .add(Step::producer(
                "read nodes",
                RecordScanProducer::ascending(nodes, self.pages_per_batch),
            ))
            .add(
                Step::processor("first relationship", SparseFirstRelationship { cache: self.cache })
                    .with_workers(self.config.max_processors),
            )
            .add(Step::sink("write", UpdateRecordsSink::new(nodes)).with_workers(self.config.max_processors))
            .execute(monitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relationships() -> Vec<RelationshipRecord> {
        let edges = [(0, 1, 0), (0, 2, 1), (1, 2, 0), (0, 3, 0), (3, 3, 1), (2, 0, 1), (4, 0, 0), (1, 4, 1)];
        edges
            .iter()
            .enumerate()
            .map(|(id, &(first_node, second_node, type_id))| RelationshipRecord {
                in_use: true,
                first_node,
                second_node,
                type_id,
                ..RelationshipRecord::new(id as u64)
            })
            .collect()
    }

    fn link_forward(forks: usize) -> Result<Vec<RelationshipRecord>> {
        let relationships = relationships();
        let mut cache = NodeRelationshipCache::new(3);
        cache.set_node_count(5)?;
        for rel in &relationships {
            cache.increment_count(rel.first_node)?;
            if !rel.is_loop() {
                cache.increment_count(rel.second_node)?;
            }
        }
        cache.counting_completed();
        cache.set_group_capacity(16)?;
        let types: FxHashSet<u32> = [0, 1].into_iter().collect();
        let chains = ChainLinker {
            cache: &cache,
            round: LinkingRound {
                types: &types,
                link_sparse: true,
            },
            pass: Pass::Forward,
        };
        thread::scope(|scope| {
            let linker = RelationshipLinker {
                chains,
                forks: if forks > 1 {
                    Some(Forks::start(scope, chains, forks)?)
                } else {
                    None
                },
            };
            let mut linked = Vec::new();
            for (ticket, items) in relationships.chunks(3).enumerate() {
                let mut batch = Batch {
                    ticket: ticket as u64,
                    items: items.to_vec(),
                };
                linker.process(0, &mut batch)?;
                linked.extend(batch.items);
            }
            Ok(linked)
        })
    }

    #[test]
    fn forks_link_like_a_single_thread() -> Result<()> {
        let inline = link_forward(1)?;
        assert_eq!(inline[4].next_for(3), 3);
        assert_eq!(inline[3].next_for(3), NULL_REF);
        for forks in [2, 3, 5] {
            assert_eq!(link_forward(forks)?, inline);
        }
        Ok(())
    }
}
