//! Periodic cleanup of attachments whose workload pod is gone
//!
//! The reconciler detaches a workload when it sees the pod become inactive,
//! but a pod deleted while the controller was down, or removed before its
//! final reconcile, is never seen again. The sweeper compares every record
//! with the set of live pod UIDs and drops attachments of pods that no
//! longer exist.
//!
//! A fresh attachment may refer to a pod the pod list has not caught up
//! with yet, so only attachments older than the threshold are pruned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use kube::ResourceExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use mountpoint_common::crd::{MountpointS3PodAttachment, MountpointS3PodAttachmentSpec};
use mountpoint_common::metrics::{STALE_ATTACHMENTS_PRUNED, SWEEP_DURATION};
use mountpoint_common::Error;

use crate::client::{AttachmentKubeClient, WriteOutcome};
use crate::reconciler::persist_pruned;

/// Default time between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Default age an attachment must reach before it can be pruned
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(10);

/// What one sweep did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Records inspected
    pub records: usize,
    /// Attachments removed
    pub pruned: usize,
    /// Records left for the next sweep after a conflicting write
    pub conflicts: usize,
    /// Records that failed to update
    pub failed: usize,
}

/// Background task pruning attachments of pods that no longer exist
pub struct StaleAttachmentSweeper {
    kube: Arc<dyn AttachmentKubeClient>,
    mountpoint_namespace: String,
    interval: Duration,
    threshold: Duration,
}

impl StaleAttachmentSweeper {
    /// Create a sweeper with default interval and threshold
    pub fn new(kube: Arc<dyn AttachmentKubeClient>, mountpoint_namespace: impl Into<String>) -> Self {
        Self {
            kube,
            mountpoint_namespace: mountpoint_namespace.into(),
            interval: DEFAULT_SWEEP_INTERVAL,
            threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    /// Set the time between sweeps
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the minimum attachment age for pruning
    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sweep every interval until `cancel` fires.
    ///
    /// Sweeps run one after another on this task; a sweep that overruns
    /// the interval skips the ticks it missed.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "starting stale attachment sweeper"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.sweep_once(Utc::now()) => match result {
                    Ok(summary) if summary.pruned > 0 || summary.failed > 0 => {
                        info!(?summary, "stale attachment sweep finished");
                    }
                    Ok(summary) => debug!(?summary, "stale attachment sweep finished"),
                    Err(e) => warn!(error = %e, "stale attachment sweep failed"),
                },
            }
            SWEEP_DURATION.record(started.elapsed().as_secs_f64(), &[]);
        }
        info!("stale attachment sweeper stopped");
    }

    /// Run a single sweep as of `now`
    #[instrument(skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepSummary, Error> {
        let live = self.kube.list_pod_uids().await?;
        let records = self.kube.list_attachments().await?;

        let mut summary = SweepSummary {
            records: records.len(),
            ..Default::default()
        };
        for record in records {
            let name = record.name_any();
            match self.sweep_record(record, &live, now).await {
                Ok(WriteOutcome::Applied(pruned)) => summary.pruned += pruned,
                Ok(WriteOutcome::Conflict) => {
                    debug!(record = %name, "record changed during sweep, retrying next tick");
                    summary.conflicts += 1;
                }
                Err(e) => {
                    warn!(record = %name, error = %e, "failed to prune stale attachments");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn sweep_record(
        &self,
        mut record: MountpointS3PodAttachment,
        live: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome<usize>, Error> {
        let pruned = prune_stale(&mut record.spec, live, now, self.threshold);
        if pruned == 0 && record.spec.empty_entries().is_empty() {
            return Ok(WriteOutcome::Applied(0));
        }

        let name = record.name_any();
        let outcome =
            persist_pruned(self.kube.as_ref(), &self.mountpoint_namespace, record, pruned).await?;
        match outcome {
            WriteOutcome::Applied(()) => {
                if pruned > 0 {
                    info!(record = %name, pruned, "pruned attachments of deleted pods");
                    STALE_ATTACHMENTS_PRUNED.add(pruned as u64, &[]);
                }
                Ok(WriteOutcome::Applied(pruned))
            }
            WriteOutcome::Conflict => Ok(WriteOutcome::Conflict),
        }
    }
}

/// Drop attachments whose pod is not live and that are older than
/// `threshold`. Returns how many were dropped; emptied entries are kept.
pub fn prune_stale(
    spec: &mut MountpointS3PodAttachmentSpec,
    live: &HashSet<String>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> usize {
    let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
    spec.retain_attachments(|a| {
        live.contains(&a.workload_pod_uid) || now.signed_duration_since(a.attachment_time) <= threshold
    })
}
