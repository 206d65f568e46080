// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! The write-ahead log.
//!
//! [`WriteAheadLog`] couples a durable [`LogStorage`] with an in-memory
//! projection holding one [`WalEntry`] per intent id. Every change is appended
//! to storage before the projection is updated, so the projection never shows
//! a state that would be lost in a crash.
//!
//! # Compaction
//!
//! Terminal entries are reclaimed by writing a checkpoint record, never by
//! rewriting the log. The checkpoint covers the longest prefix of the log in
//! which every record belongs to a settled intent older than the retention
//! horizon. On replay, records at or below the checkpoint are skipped, as are
//! later records of intents whose intent record was skipped.
//!
//! Reclaimed ids are retired, not forgotten: each checkpoint carries the full
//! set of ids reclaimed so far, and [`WriteAheadLog::append`] refuses them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use tessera_core::{IntentId, OperationIntent};

use crate::entry::WalEntry;
use crate::error::{Result, WalError};
use crate::record::{TransitionRecord, TransitionRequest, WalRecord};
use crate::storage::LogStorage;

/// Per-intent state: the gate serializes writers, the entry serves readers.
struct IntentSlot {
    gate: tokio::sync::Mutex<()>,
    entry: RwLock<WalEntry>,
}

impl IntentSlot {
    fn new(entry: WalEntry) -> Arc<Self> {
        Arc::new(Self { gate: tokio::sync::Mutex::new(()), entry: RwLock::new(entry) })
    }
}

/// Statistics from replaying the log at open.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records read from storage.
    pub records: usize,
    /// Intents in the projection after replay.
    pub intents: usize,
    /// Records skipped (covered by a checkpoint, orphaned or invalid).
    pub skipped: usize,
    /// Highest checkpointed sequence, if any.
    pub checkpoint: Option<u64>,
    /// Whether the storage reported damaged frames.
    pub corruption_detected: bool,
}

/// Statistics from a compaction pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    /// Sequence covered by the checkpoint written, if one was written.
    pub checkpoint: Option<u64>,
    /// Intents dropped from the projection.
    pub intents_reclaimed: usize,
    /// Storage segments deleted.
    pub segments_removed: usize,
}

/// Durable, replayable log of operation intents and their state changes.
pub struct WriteAheadLog {
    storage: Arc<dyn LogStorage>,
    slots: DashMap<IntentId, Arc<IntentSlot>>,
    /// Ids whose intent record is being written.
    reserved: DashMap<IntentId, ()>,
    /// Ids reclaimed by compaction; never logged again.
    retired: DashSet<IntentId>,
    /// Appends hold this shared; compaction holds it exclusively while it
    /// picks the checkpoint.
    fence: tokio::sync::RwLock<()>,
    last_sequence: AtomicU64,
    checkpoint: AtomicU64,
    corruption_detected: AtomicBool,
    replay: ReplayStats,
}

impl WriteAheadLog {
    /// Opens the log and rebuilds the projection from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be scanned.
    pub async fn open(storage: Arc<dyn LogStorage>) -> Result<Self> {
        let started = Instant::now();
        let scan = storage.scan().await?;

        let retired = DashSet::new();
        let mut checkpoint = None;
        for sequenced in &scan.records {
            if let WalRecord::Checkpoint { sequence, reclaimed, .. } = &sequenced.record {
                checkpoint = checkpoint.max(Some(*sequence));
                for id in reclaimed {
                    retired.insert(id.clone());
                }
            }
        }
        let covered = checkpoint.unwrap_or(0);

        let slots: DashMap<IntentId, Arc<IntentSlot>> = DashMap::new();
        let mut stats = ReplayStats {
            records: scan.records.len(),
            checkpoint,
            corruption_detected: scan.corruption_detected,
            ..Default::default()
        };
        let mut last_sequence = 0;

        for sequenced in scan.records {
            last_sequence = last_sequence.max(sequenced.sequence);
            if sequenced.sequence <= covered {
                if let WalRecord::Intent { intent, .. } = sequenced.record {
                    retired.insert(intent.id);
                }
                stats.skipped += 1;
                continue;
            }

            match sequenced.record {
                WalRecord::Intent { intent, timestamp } => {
                    if slots.contains_key(&intent.id) {
                        tracing::warn!(
                            intent_id = %intent.id,
                            "Duplicate intent record in WAL, skipping"
                        );
                        stats.skipped += 1;
                        continue;
                    }
                    let entry = WalEntry::new(sequenced.sequence, intent, timestamp);
                    slots.insert(entry.id().clone(), IntentSlot::new(entry));
                }
                WalRecord::Transition(transition) => {
                    let Some(slot) = slots.get(&transition.intent_id) else {
                        tracing::debug!(
                            intent_id = %transition.intent_id,
                            sequence = sequenced.sequence,
                            "Transition for a reclaimed intent, skipping"
                        );
                        stats.skipped += 1;
                        continue;
                    };
                    let applied = slot.entry.write().apply(sequenced.sequence, &transition);
                    if let Err(e) = applied {
                        tracing::warn!(
                            sequence = sequenced.sequence,
                            error = %e,
                            "Invalid WAL transition, skipping"
                        );
                        stats.skipped += 1;
                    }
                }
                WalRecord::Checkpoint { .. } => {}
            }
        }

        stats.intents = slots.len();
        if stats.corruption_detected {
            tracing::warn!("WAL replay found damaged frames; the log was read up to the damage");
        }
        tracing::info!(
            records = stats.records,
            intents = stats.intents,
            skipped = stats.skipped,
            retired = retired.len(),
            checkpoint = covered,
            "Replayed WAL"
        );
        histogram!("tessera_wal_replay_seconds").record(started.elapsed().as_secs_f64());
        gauge!("tessera_wal_intents").set(stats.intents as f64);

        Ok(Self {
            storage,
            slots,
            reserved: DashMap::new(),
            retired,
            fence: tokio::sync::RwLock::new(()),
            last_sequence: AtomicU64::new(last_sequence),
            checkpoint: AtomicU64::new(covered),
            corruption_detected: AtomicBool::new(stats.corruption_detected),
            replay: stats,
        })
    }

    /// Durably logs a new intent in the `Pending` state.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::DuplicateIntent`] if the id is already logged,
    /// being logged concurrently or was reclaimed by compaction, or a storage
    /// error if the write fails. On failure nothing is recorded.
    pub async fn append(&self, intent: OperationIntent) -> Result<WalEntry> {
        let id = intent.id.clone();
        if self.is_retired(&id) {
            return Err(WalError::DuplicateIntent(id));
        }
        if self.slots.contains_key(&id) || self.reserved.insert(id.clone(), ()).is_some() {
            return Err(WalError::DuplicateIntent(id));
        }
        if self.slots.contains_key(&id) || self.is_retired(&id) {
            self.reserved.remove(&id);
            return Err(WalError::DuplicateIntent(id));
        }

        let _fence = self.fence.read().await;
        let timestamp = Utc::now();
        let record = WalRecord::Intent { intent: intent.clone(), timestamp };
        let outcome = self.write(&record, "intent").await.map(|sequence| {
            let entry = WalEntry::new(sequence, intent, timestamp);
            self.slots.insert(id.clone(), IntentSlot::new(entry.clone()));
            gauge!("tessera_wal_intents").set(self.slots.len() as f64);
            entry
        });
        self.reserved.remove(&id);
        outcome
    }

    /// Durably records a state change for an intent.
    ///
    /// Transitions for the same intent are serialized; transitions for
    /// different intents proceed independently.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::NotFound`] for unknown ids,
    /// [`WalError::InvalidTransition`] if the change violates the state
    /// lattice, or a storage error if the write fails. On failure the entry
    /// keeps its previous state.
    pub async fn transition(&self, id: &IntentId, request: TransitionRequest) -> Result<WalEntry> {
        let slot = self.slot(id)?;
        let _gate = slot.gate.lock().await;

        let record = TransitionRecord::new(id.clone(), request);
        slot.entry.read().check(&record)?;

        let kind = record.to.as_str();
        let sequence = self.write(&WalRecord::Transition(record.clone()), kind).await?;

        let mut entry = slot.entry.write();
        entry.apply(sequence, &record)?;
        Ok(entry.clone())
    }

    async fn write(&self, record: &WalRecord, kind: &'static str) -> Result<u64> {
        let started = Instant::now();
        match self.storage.append(record).await {
            Ok(sequence) => {
                self.last_sequence.fetch_max(sequence, Ordering::SeqCst);
                counter!("tessera_wal_records_written", "kind" => kind).increment(1);
                histogram!("tessera_wal_append_seconds").record(started.elapsed().as_secs_f64());
                Ok(sequence)
            }
            Err(e) => {
                counter!("tessera_wal_write_errors").increment(1);
                tracing::error!(kind, error = %e, "WAL append failed");
                Err(e)
            }
        }
    }

    fn slot(&self, id: &IntentId) -> Result<Arc<IntentSlot>> {
        self.slots
            .get(id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| WalError::NotFound(id.clone()))
    }

    /// Returns the latest durable view of an intent.
    #[must_use]
    pub fn get(&self, id: &IntentId) -> Option<WalEntry> {
        self.slots.get(id).map(|slot| slot.entry.read().clone())
    }

    /// Returns true if the id is logged.
    #[must_use]
    pub fn contains(&self, id: &IntentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Returns true if the id was reclaimed by compaction.
    ///
    /// A retired id has no entry and can never be logged again.
    #[must_use]
    pub fn is_retired(&self, id: &IntentId) -> bool {
        self.retired.contains(id)
    }

    /// Every entry, oldest first.
    #[must_use]
    pub fn scan(&self) -> Vec<WalEntry> {
        self.scan_from(0)
    }

    /// Entries whose intent record has a sequence above `after`, oldest first.
    ///
    /// Pass the `first_sequence` of the last entry seen to resume a scan.
    #[must_use]
    pub fn scan_from(&self, after: u64) -> Vec<WalEntry> {
        let mut entries: Vec<WalEntry> = self
            .slots
            .iter()
            .map(|slot| slot.entry.read().clone())
            .filter(|entry| entry.first_sequence > after)
            .collect();
        entries.sort_by_key(|entry| entry.first_sequence);
        entries
    }

    /// Entries still `Pending` or `Dispatched`, oldest first.
    #[must_use]
    pub fn non_terminal(&self) -> Vec<WalEntry> {
        let mut entries: Vec<WalEntry> = self
            .slots
            .iter()
            .map(|slot| slot.entry.read().clone())
            .filter(|entry| !entry.is_terminal())
            .collect();
        entries.sort_by_key(|entry| entry.first_sequence);
        entries
    }

    /// Entries that are not settled (still pending, dispatched, or failed
    /// with an abandonment owed), oldest first.
    #[must_use]
    pub fn unsettled(&self) -> Vec<WalEntry> {
        let mut entries: Vec<WalEntry> = self
            .slots
            .iter()
            .map(|slot| slot.entry.read().clone())
            .filter(|entry| !entry.is_settled())
            .collect();
        entries.sort_by_key(|entry| entry.first_sequence);
        entries
    }

    /// Number of intents in the projection.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no intents are logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Highest sequence written or replayed.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Highest sequence covered by a checkpoint (0 if none).
    #[must_use]
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::SeqCst)
    }

    /// Whether replay found damaged frames.
    #[must_use]
    pub fn corruption_detected(&self) -> bool {
        self.corruption_detected.load(Ordering::Relaxed)
    }

    /// Statistics from the replay performed at open.
    #[must_use]
    pub fn replay_stats(&self) -> &ReplayStats {
        &self.replay
    }

    /// Flushes the storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be synced.
    pub async fn sync(&self) -> Result<()> {
        self.storage.sync().await
    }

    /// Reclaims settled entries older than `retention`.
    ///
    /// Writes a checkpoint, seals the active segment and deletes segments the
    /// checkpoint fully covers. Does nothing if the checkpoint would not
    /// advance.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be written or segments
    /// cannot be rotated or removed. A failure after the checkpoint is
    /// written leaves extra segments behind but never loses live entries.
    pub async fn compact(&self, retention: Duration) -> Result<CompactionStats> {
        let mut stats = CompactionStats::default();
        let Some(horizon) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(stats);
        };

        let (covered, reclaimed, segments_removed) = {
            let _fence = self.fence.write().await;

            let mut oldest_live: Option<u64> = None;
            for slot in &self.slots {
                let entry = slot.entry.read();
                if !entry.settled_at().is_some_and(|at| at <= horizon) {
                    let first = entry.first_sequence;
                    oldest_live = Some(oldest_live.map_or(first, |oldest| oldest.min(first)));
                }
            }

            let covered = match oldest_live {
                Some(first) => first.saturating_sub(1),
                None => self.last_sequence(),
            };
            if covered <= self.checkpoint() {
                return Ok(stats);
            }

            let reclaimed: HashSet<IntentId> = self
                .slots
                .iter()
                .filter(|slot| slot.entry.read().first_sequence <= covered)
                .map(|slot| slot.key().clone())
                .collect();

            let mut retired: Vec<IntentId> = self
                .retired
                .iter()
                .map(|id| id.key().clone())
                .chain(reclaimed.iter().cloned())
                .collect();
            retired.sort();
            retired.dedup();

            // Seal first so the checkpoint lands in a fresh segment and the
            // covered segments become removable.
            self.storage.rotate().await?;
            let record = WalRecord::Checkpoint {
                sequence: covered,
                reclaimed: retired,
                timestamp: Utc::now(),
            };
            self.write(&record, "checkpoint").await?;
            self.checkpoint.fetch_max(covered, Ordering::SeqCst);
            for id in &reclaimed {
                self.retired.insert(id.clone());
            }

            (covered, reclaimed, self.storage.reclaim(covered).await)
        };

        for id in &reclaimed {
            self.slots.remove(id);
        }
        stats.checkpoint = Some(covered);
        stats.intents_reclaimed = reclaimed.len();
        stats.segments_removed = segments_removed?;

        counter!("tessera_wal_intents_reclaimed").increment(stats.intents_reclaimed as u64);
        gauge!("tessera_wal_intents").set(self.slots.len() as f64);
        tracing::info!(
            checkpoint = covered,
            intents_reclaimed = stats.intents_reclaimed,
            segments_removed = stats.segments_removed,
            "Compacted WAL"
        );
        Ok(stats)
    }
}
