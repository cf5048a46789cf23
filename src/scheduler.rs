//! Recalculation Scheduler (C5)
//!
//! A single background task that periodically walks every known
//! (datafile, feature) experiment group, invokes the Sampler when
//! eligibility thresholds are met, and persists new weights (spec §4.5).
//! Structured after the teacher's periodic-sync pattern
//! (`examples/nuniesmith-audit/src/github/background_sync.rs`): an
//! `Arc`-wrapped manager spawned once, driven by a `tokio::time::interval`
//! ticker, with a dedicated shutdown signal rather than a hidden thread pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

use crate::counter_store::CounterStore;
use crate::datafile::DatafileRepository;
use crate::sampler::{self, VariantInput, DEFAULT_TRIALS};
use crate::types::{CycleSummary, GroupError, GroupKey, GroupSkip, GroupUpdate, SkipReason, VariantKey};

/// Distributed lock TTL is the expected cycle duration times four (spec §5).
/// A cycle is expected to complete well within a minute for realistic
/// datafile counts, so a 4-minute TTL gives ample headroom.
const RECALC_LOCK_TTL_SECS: u64 = 240;

pub struct Scheduler {
    store: Arc<dyn CounterStore>,
    datafiles: Arc<tokio::sync::RwLock<DatafileRepository>>,
    min_exposures: u64,
    busy: AtomicBool,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CounterStore>,
        datafiles: Arc<tokio::sync::RwLock<DatafileRepository>>,
        min_exposures: u64,
    ) -> Self {
        Self {
            store,
            datafiles,
            min_exposures,
            busy: AtomicBool::new(false),
        }
    }

    /// Spawn the periodic ticker. Ticks that arrive while a cycle is still
    /// running are coalesced — skipped, not queued (spec §4.5 point 4).
    pub fn spawn(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.busy.load(Ordering::SeqCst) {
                            warn!("recalculation cycle still running, skipping this tick");
                            continue;
                        }
                        let summary = self.run_cycle().await;
                        info!(
                            considered = summary.groups_considered,
                            updated = summary.groups_updated.len(),
                            skipped = summary.groups_skipped.len(),
                            errored = summary.groups_errored.len(),
                            "recalculation cycle complete"
                        );
                    }
                    _ = shutdown.changed() => {
                        info!("scheduler received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    /// Run exactly one cycle, synchronously. Used both by the background
    /// ticker and the manual `/recalculate` endpoint (spec §4.5, §4.7).
    pub async fn run_cycle(&self) -> CycleSummary {
        if self.busy.swap(true, Ordering::SeqCst) {
            // Another cycle (ticker or manual trigger) is already running.
            return CycleSummary {
                started_at: Some(chrono::Utc::now()),
                finished_at: Some(chrono::Utc::now()),
                groups_considered: 0,
                groups_updated: Vec::new(),
                groups_skipped: Vec::new(),
                groups_errored: vec![GroupError {
                    group: GroupKey {
                        datafile: String::new(),
                        feature: String::new(),
                    },
                    error: "cycle already in progress".to_string(),
                }],
            };
        }

        let result = self.run_cycle_locked().await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn run_cycle_locked(&self) -> CycleSummary {
        let started_at = chrono::Utc::now();
        let mut summary = CycleSummary {
            started_at: Some(started_at),
            ..Default::default()
        };

        if !self.store.try_acquire_recalc_lock(RECALC_LOCK_TTL_SECS).await.unwrap_or(false) {
            info!("another process holds lock:recalc, skipping this cycle");
            summary.finished_at = Some(chrono::Utc::now());
            return summary;
        }

        let groups = self.enumerate_groups().await;
        summary.groups_considered = groups.len();

        let mut rng = StdRng::from_entropy();
        for group in groups {
            match self.process_group(&group, &mut rng).await {
                Ok(Some(update)) => summary.groups_updated.push(update),
                Ok(None) => {}
                Err((reason_or_err, is_skip)) => {
                    if is_skip {
                        summary.groups_skipped.push(GroupSkip {
                            group,
                            reason: reason_or_err,
                        });
                    } else {
                        summary.groups_errored.push(GroupError {
                            group,
                            error: reason_or_err,
                        });
                    }
                }
            }
        }

        if let Err(e) = self.store.release_recalc_lock().await {
            warn!("failed to release recalc lock: {e}");
        }

        summary.finished_at = Some(chrono::Utc::now());
        summary
    }

    /// Group every `stats:*` key into `(datafile, feature) -> [variant]`,
    /// restricted to groups that still appear in a currently-loaded
    /// datafile (spec §4.6: retired experiments' keys persist but are
    /// ignored once absent from every datafile).
    async fn enumerate_groups(&self) -> std::collections::BTreeSet<GroupKey> {
        let mut groups: std::collections::BTreeSet<GroupKey> = std::collections::BTreeSet::new();

        let keys = match self.store.list_keys().await {
            Ok(k) => k,
            Err(e) => {
                warn!("failed to list counter keys: {e}");
                return groups;
            }
        };

        let datafiles = self.datafiles.read().await;
        for raw_key in keys {
            let Some(parsed) = VariantKey::parse_store_key(&raw_key) else {
                continue;
            };
            let Some(df) = datafiles.get(&parsed.datafile) else {
                continue;
            };
            let Some(variants) = df.variants(&parsed.feature) else {
                continue;
            };
            if !variants.iter().any(|v| v.value == parsed.variant) {
                continue;
            }

            groups.insert(GroupKey {
                datafile: parsed.datafile,
                feature: parsed.feature,
            });
        }

        groups
    }

    /// Returns `Ok(Some(update))` if weights were rewritten, `Ok(None)` if
    /// the group had nothing to do, or `Err((message, is_skip))` where
    /// `is_skip` distinguishes an eligibility skip from a hard error.
    async fn process_group(
        &self,
        group: &GroupKey,
        rng: &mut StdRng,
    ) -> Result<Option<GroupUpdate>, (String, bool)> {
        let datafiles = self.datafiles.read().await;
        let df = datafiles
            .get(&group.datafile)
            .ok_or((SkipReason::NotInAnyDatafile.to_string(), true))?;
        let declared = df
            .variants(&group.feature)
            .ok_or((SkipReason::NotInAnyDatafile.to_string(), true))?;
        drop(datafiles);

        let mut inputs = Vec::with_capacity(declared.len());
        for v in &declared {
            let key = VariantKey::new(group.datafile.clone(), group.feature.clone(), v.value.clone());
            let snap = self
                .store
                .get_counters(&key)
                .await
                .map_err(|e| (e.to_string(), false))?;
            inputs.push((key, v.clone(), snap));
        }

        let ineligible = inputs
            .iter()
            .any(|(_, _, snap)| snap.exposures < self.min_exposures);
        if ineligible {
            return Err((SkipReason::InsufficientExposures.to_string(), true));
        }

        let sampler_inputs: Vec<VariantInput> = inputs
            .iter()
            .map(|(_, v, snap)| VariantInput {
                value: v.value.clone(),
                exposures: snap.exposures,
                conversions: snap.conversions,
                original_weight: v.weight,
            })
            .collect();

        let weights = sampler::derive_weights(&sampler_inputs, DEFAULT_TRIALS, rng)
            .ok_or((SkipReason::ZeroOriginalWeight.to_string(), true))?;

        let ts = chrono::Utc::now();
        let mut out_weights = BTreeMap::new();
        for ((key, v, _), w) in inputs.iter().zip(weights.iter()) {
            self.store
                .set_weight(key, *w, ts)
                .await
                .map_err(|e| (e.to_string(), false))?;
            out_weights.insert(v.value.clone(), *w);
        }

        Ok(Some(GroupUpdate {
            group: group.clone(),
            weights: out_weights,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_store::InMemoryCounterStore;
    use std::io::Write;

    fn write_datafile(dir: &std::path::Path, rel: &str, contents: &str) {
        let full = dir.join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(full).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    async fn scheduler_with(
        dir: &std::path::Path,
        min_exposures: u64,
    ) -> (Scheduler, Arc<InMemoryCounterStore>) {
        let repo = DatafileRepository::load(dir).unwrap();
        let store = Arc::new(InMemoryCounterStore::new());
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(tokio::sync::RwLock::new(repo)),
            min_exposures,
        );
        (scheduler, store)
    }

    #[tokio::test]
    async fn skips_group_below_eligibility_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(
            tmp.path(),
            "d.json",
            r#"{"features":{"f":{"variations":[{"value":"A","weight":50},{"value":"B","weight":50}]}}}"#,
        );
        let (scheduler, store) = scheduler_with(tmp.path(), 100).await;
        store.seed(&VariantKey::new("d.json", "f", "A"), 100, 10);
        store.seed(&VariantKey::new("d.json", "f", "B"), 99, 30);

        let summary = scheduler.run_cycle().await;
        assert_eq!(summary.groups_updated.len(), 0);
        assert_eq!(summary.groups_skipped.len(), 1);
        assert_eq!(summary.groups_skipped[0].reason, "insufficient exposures");

        let a = store.get_counters(&VariantKey::new("d.json", "f", "A")).await.unwrap();
        assert_eq!(a.weight, None);
    }

    #[tokio::test]
    async fn eligible_group_gets_new_weights_summing_to_original() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(
            tmp.path(),
            "d.json",
            r#"{"features":{"f":{"variations":[{"value":"A","weight":50},{"value":"B","weight":50}]}}}"#,
        );
        let (scheduler, store) = scheduler_with(tmp.path(), 100).await;
        store.seed(&VariantKey::new("d.json", "f", "A"), 1000, 50);
        store.seed(&VariantKey::new("d.json", "f", "B"), 1000, 200);

        let summary = scheduler.run_cycle().await;
        assert_eq!(summary.groups_updated.len(), 1);
        let update = &summary.groups_updated[0];
        let sum: f64 = update.weights.values().sum();
        assert!((sum - 100.0).abs() < 1e-4);

        let a = store.get_counters(&VariantKey::new("d.json", "f", "A")).await.unwrap();
        assert!(a.last_updated.is_some());
        assert_eq!(a.exposures, 1000);
        assert_eq!(a.conversions, 50);
    }

    #[tokio::test]
    async fn orphaned_counters_outside_any_datafile_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(
            tmp.path(),
            "d.json",
            r#"{"features":{"f":{"variations":[{"value":"A","weight":100}]}}}"#,
        );
        let (scheduler, store) = scheduler_with(tmp.path(), 100).await;
        store.seed(&VariantKey::new("retired.json", "old_feature", "X"), 500, 500);

        let summary = scheduler.run_cycle().await;
        assert_eq!(summary.groups_considered, 0);
    }
}
