//! Versioned parameter updates and the deferred history commit.
//!
//! A change requested at time T does not affect the very next displayed
//! frame: it affects whichever in-flight frame first picks up the new serial,
//! which may already be several frames deep in the producer pipeline. History
//! entries are therefore created with the frame number unresolved and
//! committed only when the display actually shows a frame stamped with the
//! new serial. Recording the request-time frame instead would corrupt the
//! experimental record.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{ConfigError, StimConfig};
use crate::context::PipelineContext;

/// One changed field, in control-protocol naming.
#[derive(Debug, Clone, Serialize)]
pub struct ParamDiff {
    pub name: String,
    pub old: String,
    pub new: String,
}

/// Committed history record: the full parameter set plus the diff, tagged
/// with the displayed frame at which the change took visual effect.
#[derive(Debug, Clone, Serialize)]
pub struct ParamHistoryEntry {
    pub frame_number: u64,
    pub serial: u64,
    pub config: StimConfig,
    pub diff: Vec<ParamDiff>,
}

struct PendingChange {
    serial: u64,
    config: StimConfig,
    diff: Vec<ParamDiff>,
}

/// Accepts parameter changes against the shared config and owns the
/// append-only history log.
pub struct ParameterSynchronizer {
    ctx: Arc<PipelineContext>,
    pending: VecDeque<PendingChange>,
    history: Vec<ParamHistoryEntry>,
}

impl ParameterSynchronizer {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            pending: VecDeque::new(),
            history: Vec::new(),
        }
    }

    /// Validate and install a new parameter set, bumping the serial.
    ///
    /// While the pipeline is running, critical fields (grid resolution, cache
    /// depth, cores, color-table size, sub-frame mode) are rejected: those
    /// require a stop/reinit. A `cores` raise above 2 is additionally refused
    /// whenever history commits are still pending, preserving the documented
    /// ordering guarantees. On rejection the live config is untouched.
    pub fn accept_change(
        &mut self,
        new_config: StimConfig,
        while_running: bool,
    ) -> Result<u64, ConfigError> {
        new_config.validate()?;

        let (current, current_serial) = self.ctx.shared.snapshot();
        if while_running {
            if new_config.cores != current.cores
                && new_config.cores > 2
                && !self.pending.is_empty()
            {
                return Err(ConfigError::CoresChangeWithPendingHistory);
            }
            if let Some(field) = current.critical_diff(&new_config) {
                return Err(ConfigError::CriticalFieldWhileRunning(field));
            }
        }

        let diff: Vec<ParamDiff> = new_config
            .diff(&current)
            .into_iter()
            .map(|(name, old, new)| ParamDiff { name, old, new })
            .collect();
        if diff.is_empty() {
            return Ok(current_serial);
        }

        let serial = self.ctx.shared.install(new_config.clone());
        self.ctx
            .track
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .mark_change();
        log::info!(
            "installed parameter change serial {serial}: {} field(s)",
            diff.len()
        );
        self.pending.push_back(PendingChange {
            serial,
            config: new_config,
            diff,
        });
        Ok(serial)
    }

    /// Commit every pending entry whose serial has reached the display.
    ///
    /// Called once per tick after consumption with the serial stamped on the
    /// frame just displayed and that frame's number. Returns how many entries
    /// were committed.
    pub fn check_pending_history(&mut self, displayed_serial: u64, frame_number: u64) -> usize {
        let mut committed = 0;
        while self
            .pending
            .front()
            .is_some_and(|front| front.serial <= displayed_serial)
        {
            let Some(change) = self.pending.pop_front() else {
                break;
            };
            log::debug!(
                "parameter serial {} took effect at frame {frame_number}",
                change.serial
            );
            self.history.push(ParamHistoryEntry {
                frame_number,
                serial: change.serial,
                config: change.config,
                diff: change.diff,
            });
            committed += 1;
        }
        committed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn history(&self) -> &[ParamHistoryEntry] {
        &self.history
    }

    /// Serialize the committed history for the experimental record.
    pub fn history_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.history).context("failed to serialize history")
    }
}
