//! Merge-and-validate pipeline run between levels.

use super::gates::GateRunner;
use super::record::{MergeRecord, MergeStatus};
use super::vcs::Vcs;
use crate::errors::MergeError;
use crate::state::{EventKind, LevelStatus, StateStore, TaskStatus};
use crate::sync::StateSyncService;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct MergeCoordinator {
    store: StateStore,
    vcs: Arc<dyn Vcs>,
    gates: GateRunner,
    sync: Option<StateSyncService>,
}

impl MergeCoordinator {
    pub fn new(store: StateStore, vcs: Arc<dyn Vcs>, gates: GateRunner) -> Self {
        Self {
            store,
            vcs,
            gates,
            sync: None,
        }
    }

    /// Publish every level transition to the task registry.
    pub fn with_sync(mut self, sync: StateSyncService) -> Self {
        self.sync = Some(sync);
        self
    }

    async fn publish_levels(&self, levels: &[u32]) {
        let Some(sync) = &self.sync else {
            return;
        };
        for &level in levels {
            if let Err(e) = sync.publish_level(level).await {
                tracing::warn!(level, error = %e, "Failed to publish level status");
            }
        }
    }

    /// Merge a completed level.
    ///
    /// Confirms completion under the lock, merges every worker branch that
    /// produced work into a fresh integration branch and runs the gates
    /// there. Only if everything passes are the worker branches brought
    /// forward, the result tagged and the base advanced. The next level
    /// becomes dispatchable in the same transaction that marks this one
    /// merged.
    pub async fn merge_level(&self, level: u32) -> Result<MergeRecord, MergeError> {
        let candidates = self.store.transaction(|snap| {
            let status = snap.level_status(level);
            if status == LevelStatus::Merged {
                return Ok(None);
            }
            if status == LevelStatus::Pending {
                return Err(MergeError::LevelIncomplete {
                    level,
                    reason: "level has not started".to_string(),
                });
            }
            if !snap.level_complete(level) {
                let open: Vec<String> = snap
                    .tasks_at(level)
                    .filter(|(_, t)| t.status != TaskStatus::Completed)
                    .map(|(id, t)| format!("{} ({})", id, t.status))
                    .collect();
                return Err(MergeError::LevelIncomplete {
                    level,
                    reason: format!("unfinished tasks: {}", open.join(", ")),
                });
            }
            let record = snap.levels.entry(level).or_default();
            record.status = LevelStatus::Merging;
            record.error = None;

            let mut branches = BTreeSet::new();
            for (_, task) in snap.tasks_at(level) {
                if let Some(worker) = &task.worker_id {
                    let branch = snap
                        .workers
                        .get(worker)
                        .and_then(|w| w.branch.clone())
                        .unwrap_or_else(|| self.vcs.worker_branch(worker));
                    branches.insert(branch);
                }
            }
            Ok(Some(branches.into_iter().collect::<Vec<_>>()))
        })?;

        let Some(candidates) = candidates else {
            return self.existing_record(level);
        };

        self.publish_levels(&[level]).await;
        tracing::info!(level, candidates = candidates.len(), "Merging level");
        match self.run_pipeline(level, &candidates).await {
            Ok(record) => {
                let mut changed = vec![level];
                changed.extend(self.store.read(|snap| snap.next_level(level))?);
                self.publish_levels(&changed).await;
                Ok(record)
            }
            Err(e) => {
                self.mark_failed(level, &e)?;
                self.publish_levels(&[level]).await;
                Err(e)
            }
        }
    }

    /// Re-run the pipeline for a level left `failed` (or stuck `merging`).
    pub async fn retry_level(&self, level: u32) -> Result<MergeRecord, MergeError> {
        let status = self.store.read(|snap| snap.level_status(level))?;
        if !matches!(status, LevelStatus::Failed | LevelStatus::Merging) {
            return Err(MergeError::LevelIncomplete {
                level,
                reason: format!("level is {}, not failed", status),
            });
        }
        self.store.transaction(|snap| {
            snap.levels.entry(level).or_default().status = LevelStatus::Running;
            Ok::<_, MergeError>(())
        })?;
        self.publish_levels(&[level]).await;
        tracing::info!(level, "Retrying level merge");
        self.merge_level(level).await
    }

    fn existing_record(&self, level: u32) -> Result<MergeRecord, MergeError> {
        let record = self
            .store
            .read(|snap| snap.levels.get(&level).and_then(|l| l.merge.clone()))?;
        record.ok_or_else(|| MergeError::Vcs(format!("level {} is merged but has no record", level)))
    }

    async fn run_pipeline(
        &self,
        level: u32,
        candidates: &[String],
    ) -> Result<MergeRecord, MergeError> {
        let branches = self.vcs.collect_branches(level, candidates).await?;
        let integration = self.vcs.create_integration(level).await?;
        let mut record = MergeRecord::new(level, &integration.branch);
        record.base_commit = Some(integration.base_commit.clone());

        let result = self.vcs.merge(&branches, &integration).await?;
        record.branches = result.merges.clone();
        if let Some(conflict) = result.conflict() {
            let paths = match &conflict.outcome {
                super::record::BranchOutcome::Conflict { paths } => paths.clone(),
                _ => Vec::new(),
            };
            let branch = conflict.branch.clone();
            record.finish(MergeStatus::Conflict);
            self.save_record(&record)?;
            tracing::error!(level, branch = %branch, ?paths, "Merge conflict; ownership invariant violated");
            return Err(MergeError::Conflict {
                level,
                branch,
                paths,
            });
        }
        self.save_record(&record)?;

        let env = vec![
            ("HIVE_FEATURE".to_string(), self.store.feature().to_string()),
            ("HIVE_LEVEL".to_string(), level.to_string()),
        ];
        record.gates = self.gates.run(&integration.path, &env).await;
        if let Some(failed) = record.failed_gate() {
            let gate = failed.name.clone();
            let detail = failed.detail.clone().unwrap_or_default();
            record.finish(MergeStatus::GateFailed);
            self.save_record(&record)?;
            return Err(MergeError::GateFailure {
                level,
                gate,
                detail,
            });
        }

        // Slot branches move before the tag and the base.
        let worker_branches: Vec<String> = self.store.read(|snap| {
            snap.workers
                .values()
                .filter(|w| !w.abandoned)
                .filter_map(|w| w.branch.clone())
                .collect()
        })?;
        for branch in &worker_branches {
            match self.vcs.bring_forward(level, branch, &result.head).await {
                Ok(()) => {}
                Err(MergeError::Conflict { paths, .. }) => {
                    tracing::warn!(
                        level,
                        branch = %branch,
                        ?paths,
                        "Slot branch holds work the level does not; resetting it to the merge"
                    );
                    self.vcs.reset_branch(branch, &result.head).await?;
                    record.reset_branches.push(branch.clone());
                }
                Err(e) => return Err(e),
            }
        }

        let tag = format!("hive/{}/level-{}", self.store.feature(), level);
        self.vcs.tag(&result.head, &tag).await?;
        self.vcs.advance_base(&result.head).await?;

        record.merge_commit = Some(result.head.clone());
        record.tag = Some(tag.clone());
        record.finish(MergeStatus::Merged);
        let finalized = record.clone();
        self.store.transaction(|snap| {
            let next = snap.next_level(level);
            let entry = snap.levels.entry(level).or_default();
            entry.status = LevelStatus::Merged;
            entry.merge_commit = Some(result.head.clone());
            entry.merge = Some(finalized);
            entry.finished_at = Some(Utc::now());
            snap.record_event(
                EventKind::LevelMerged,
                None,
                None,
                format!("level {} merged at {} ({})", level, result.head, tag),
            );
            if let Some(next) = next {
                let next_record = snap.levels.entry(next).or_default();
                next_record.status = LevelStatus::Running;
                next_record.started_at = Some(Utc::now());
                snap.current_level = Some(next);
                snap.record_event(EventKind::LevelStarted, None, None, format!("level {}", next));
            }
            Ok::<_, MergeError>(())
        })?;

        if let Err(e) = self.vcs.cleanup_integration(level).await {
            tracing::warn!(level, error = %e, "Failed to remove integration worktree");
        }
        tracing::info!(level, commit = %result.head, tag = %tag, "Level merged");
        Ok(record)
    }

    fn save_record(&self, record: &MergeRecord) -> Result<(), MergeError> {
        let level = record.level;
        let record = record.clone();
        self.store.transaction(|snap| {
            snap.levels.entry(level).or_default().merge = Some(record);
            Ok::<_, MergeError>(())
        })
    }

    fn mark_failed(&self, level: u32, error: &MergeError) -> Result<(), MergeError> {
        let message = error.to_string();
        self.store.transaction(|snap| {
            let entry = snap.levels.entry(level).or_default();
            entry.status = LevelStatus::Failed;
            entry.error = Some(message.clone());
            entry.finished_at = Some(Utc::now());
            snap.record_event(EventKind::LevelFailed, None, None, message);
            Ok::<_, MergeError>(())
        })
    }
}
