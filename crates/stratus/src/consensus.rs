//! Consensus Engine — blends same-hour readings across providers into
//! one weighted value per metric.
//!
//! Pure and deterministic given its inputs: no internal concurrency,
//! no mutable state beyond the per-call computation. Values are carried
//! at full `f64` precision; rounding is a presentation concern.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::provider::{Metric, ProviderId, SourceSnapshot, TimeWindow, TrustTier, WeightTable};

/// Tunables for the blend, set per deployment.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// The designated baseline/independent provider; slots where it is
    /// missing are marked synthesized.
    pub baseline: ProviderId,
    /// Effective-weight discount for STALE snapshots.
    pub stale_discount: f64,
    /// Effective-weight discount for DEFAULT snapshots.
    pub default_discount: f64,
    /// Global outlier veto threshold, in the metric's own unit.
    pub veto_threshold: f64,
    /// Per-provider veto threshold overrides.
    pub veto_overrides: HashMap<ProviderId, f64>,
}

impl ConsensusConfig {
    pub fn new(baseline: impl Into<ProviderId>) -> Self {
        Self {
            baseline: baseline.into(),
            stale_discount: 0.5,
            default_discount: 0.2,
            veto_threshold: 5.5,
            veto_overrides: HashMap::new(),
        }
    }

    fn discount(&self, tier: TrustTier) -> f64 {
        match tier {
            TrustTier::Fresh | TrustTier::Acceptable => 1.0,
            TrustTier::Stale => self.stale_discount,
            TrustTier::Default => self.default_discount,
        }
    }

    fn veto_threshold_for(&self, provider: &str) -> f64 {
        self.veto_overrides
            .get(provider)
            .copied()
            .unwrap_or(self.veto_threshold)
    }
}

/// One provider's part in a consensus point, kept for auditability and
/// later error attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub provider: ProviderId,
    pub tier: TrustTier,
    pub effective_weight: f64,
    pub veto_applied: bool,
}

/// One hour's combined value for one metric. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusPoint {
    pub ts: i64,
    pub metric: Metric,
    pub value: f64,
    pub is_synthesized: bool,
    pub contributors: Vec<Contribution>,
}

/// An hour-slot/metric pair no provider had data for. Reported to the
/// caller, never guessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotGap {
    pub ts: i64,
    pub metric: Metric,
}

/// The full result of one consensus computation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub points: Vec<ConsensusPoint>,
    pub gaps: Vec<SlotGap>,
}

impl ConsensusOutcome {
    /// The consensus value for an hour-slot and metric, if present.
    pub fn value_at(&self, ts: i64, metric: Metric) -> Option<f64> {
        self.points
            .iter()
            .find(|p| p.ts == ts && p.metric == metric)
            .map(|p| p.value)
    }

    /// The point for an hour-slot and metric, if present.
    pub fn point_at(&self, ts: i64, metric: Metric) -> Option<&ConsensusPoint> {
        self.points.iter().find(|p| p.ts == ts && p.metric == metric)
    }
}

/// Compute the consensus series over the window.
///
/// Only metrics with at least one reading anywhere in the window are
/// considered; for those, any hour-slot with zero contributors is
/// reported as a gap.
pub fn compute(
    snapshots: &HashMap<ProviderId, SourceSnapshot>,
    weights: &WeightTable,
    config: &ConsensusConfig,
    window: TimeWindow,
) -> ConsensusOutcome {
    let mut outcome = ConsensusOutcome::default();

    let active_metrics: Vec<Metric> = Metric::ALL
        .iter()
        .copied()
        .filter(|m| {
            snapshots
                .values()
                .any(|s| s.readings.iter().any(|r| r.metric == *m))
        })
        .collect();

    for ts in window.hours() {
        for &metric in &active_metrics {
            match blend_slot(snapshots, weights, config, ts, metric) {
                Some(point) => outcome.points.push(point),
                None => outcome.gaps.push(SlotGap { ts, metric }),
            }
        }
    }

    if !outcome.gaps.is_empty() {
        log::warn!(
            "[Consensus] {} slot gaps reported over {} points",
            outcome.gaps.len(),
            outcome.points.len()
        );
    }

    outcome
}

fn blend_slot(
    snapshots: &HashMap<ProviderId, SourceSnapshot>,
    weights: &WeightTable,
    config: &ConsensusConfig,
    ts: i64,
    metric: Metric,
) -> Option<ConsensusPoint> {
    // Collect contributors in a stable order for determinism.
    let mut ids: Vec<&ProviderId> = snapshots.keys().collect();
    ids.sort();

    let mut values: Vec<f64> = Vec::new();
    let mut contributors: Vec<Contribution> = Vec::new();
    for id in ids {
        let snapshot = &snapshots[id];
        if let Some(value) = snapshot.value_at(ts, metric) {
            let effective_weight = weights.get(id) * config.discount(snapshot.trust_tier);
            values.push(value);
            contributors.push(Contribution {
                provider: id.clone(),
                tier: snapshot.trust_tier,
                effective_weight,
                veto_applied: false,
            });
        }
    }

    if contributors.is_empty() {
        return None;
    }

    // Outlier veto: if the single heaviest contributor strays too far
    // from the unweighted median, halve its pull for this slot only.
    if contributors.len() > 1 {
        let median = unweighted_median(&values);
        let heaviest = heaviest_index(&contributors);
        let deviation = (values[heaviest] - median).abs();
        let threshold = config.veto_threshold_for(&contributors[heaviest].provider);
        if deviation > threshold {
            contributors[heaviest].effective_weight /= 2.0;
            contributors[heaviest].veto_applied = true;
            log::warn!(
                "[Consensus] veto: {} = {:.1} deviates {:.1} from median {:.1} at slot {}",
                contributors[heaviest].provider,
                values[heaviest],
                deviation,
                median,
                ts
            );
        }
    }

    let value = weighted_mean(&values, &contributors);
    let is_synthesized = !contributors.iter().any(|c| c.provider == config.baseline);

    Some(ConsensusPoint {
        ts,
        metric,
        value,
        is_synthesized,
        contributors,
    })
}

/// Unweighted median of the raw values.
fn unweighted_median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Index of the contributor with the highest effective weight; ties go
/// to the lexicographically first provider for determinism.
fn heaviest_index(contributors: &[Contribution]) -> usize {
    let mut best = 0;
    for i in 1..contributors.len() {
        if contributors[i].effective_weight > contributors[best].effective_weight {
            best = i;
        }
    }
    best
}

/// Effective-weighted mean. Identical inputs short-circuit to the
/// common value so agreement never drifts through the arithmetic.
fn weighted_mean(values: &[f64], contributors: &[Contribution]) -> f64 {
    if values.iter().all(|v| *v == values[0]) {
        return values[0];
    }
    let mut num = 0.0;
    let mut den = 0.0;
    for (value, c) in values.iter().zip(contributors) {
        num += value * c.effective_weight;
        den += c.effective_weight;
    }
    num / den
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Reading;

    fn snapshot(provider: &str, tier: TrustTier, readings: Vec<(i64, Metric, f64)>) -> SourceSnapshot {
        SourceSnapshot {
            provider: provider.into(),
            readings: readings
                .into_iter()
                .map(|(ts, m, v)| Reading::new(provider, ts, m, v))
                .collect(),
            fetched_at: 0,
            trust_tier: tier,
            is_synthesized: false,
        }
    }

    fn snapshots(entries: Vec<SourceSnapshot>) -> HashMap<ProviderId, SourceSnapshot> {
        entries.into_iter().map(|s| (s.provider.clone(), s)).collect()
    }

    fn weights(entries: &[(&str, f64)]) -> WeightTable {
        let mut w = WeightTable::new();
        for (p, v) in entries {
            w.set(*p, *v);
        }
        w
    }

    const HOUR: i64 = 3600;

    #[test]
    fn equal_values_equal_weights_exact() {
        let snaps = snapshots(vec![
            snapshot("a", TrustTier::Fresh, vec![(0, Metric::Temperature, 7.3)]),
            snapshot("b", TrustTier::Fresh, vec![(0, Metric::Temperature, 7.3)]),
            snapshot("c", TrustTier::Fresh, vec![(0, Metric::Temperature, 7.3)]),
        ]);
        let outcome = compute(
            &snaps,
            &weights(&[("a", 2.0), ("b", 2.0), ("c", 2.0)]),
            &ConsensusConfig::new("a"),
            TimeWindow::new(0, HOUR),
        );
        // Exact, no drift from the weighting math
        assert_eq!(outcome.value_at(0, Metric::Temperature), Some(7.3));
    }

    #[test]
    fn weighted_average_matches_hand_computation() {
        // highs [70, 73, 71] with weights [5, 3, 1], no tier discount
        let snaps = snapshots(vec![
            snapshot("a", TrustTier::Fresh, vec![(0, Metric::Temperature, 70.0)]),
            snapshot("b", TrustTier::Fresh, vec![(0, Metric::Temperature, 73.0)]),
            snapshot("c", TrustTier::Fresh, vec![(0, Metric::Temperature, 71.0)]),
        ]);
        let mut config = ConsensusConfig::new("a");
        config.veto_threshold = 50.0; // out of the way
        let outcome = compute(
            &snaps,
            &weights(&[("a", 5.0), ("b", 3.0), ("c", 1.0)]),
            &config,
            TimeWindow::new(0, HOUR),
        );
        let value = outcome.value_at(0, Metric::Temperature).unwrap();
        assert!((value - 638.0 / 9.0).abs() < 1e-9);
        // Display policy: two decimals
        assert_eq!(format!("{:.2}", value), "70.89");
    }

    #[test]
    fn veto_halves_heaviest_outlier() {
        // A=100 (weight 6), B=40, C=42 (weight 1 each), threshold 10
        let snaps = snapshots(vec![
            snapshot("a", TrustTier::Fresh, vec![(0, Metric::Temperature, 100.0)]),
            snapshot("b", TrustTier::Fresh, vec![(0, Metric::Temperature, 40.0)]),
            snapshot("c", TrustTier::Fresh, vec![(0, Metric::Temperature, 42.0)]),
        ]);
        let w = weights(&[("a", 6.0), ("b", 1.0), ("c", 1.0)]);
        let mut config = ConsensusConfig::new("a");
        config.veto_threshold = 10.0;

        let outcome = compute(&snaps, &w, &config, TimeWindow::new(0, HOUR));
        let point = outcome.point_at(0, Metric::Temperature).unwrap();

        let a = point.contributors.iter().find(|c| c.provider == "a").unwrap();
        assert!(a.veto_applied);
        assert_eq!(a.effective_weight, 3.0);

        // (100*3 + 40 + 42) / 5 = 76.4, vs no-veto (100*6 + 40 + 42) / 8 = 85.25
        assert!((point.value - 76.4).abs() < 1e-9);
        assert!(point.value < 85.25);
    }

    #[test]
    fn veto_needs_multiple_contributors() {
        let snaps = snapshots(vec![snapshot(
            "a",
            TrustTier::Fresh,
            vec![(0, Metric::Temperature, 100.0)],
        )]);
        let mut config = ConsensusConfig::new("a");
        config.veto_threshold = 1.0;
        let outcome = compute(&snaps, &weights(&[("a", 6.0)]), &config, TimeWindow::new(0, HOUR));
        let point = outcome.point_at(0, Metric::Temperature).unwrap();
        assert!(!point.contributors[0].veto_applied);
        assert_eq!(point.value, 100.0);
    }

    #[test]
    fn per_provider_veto_override() {
        let snaps = snapshots(vec![
            snapshot("a", TrustTier::Fresh, vec![(0, Metric::Temperature, 60.0)]),
            snapshot("b", TrustTier::Fresh, vec![(0, Metric::Temperature, 40.0)]),
            snapshot("c", TrustTier::Fresh, vec![(0, Metric::Temperature, 42.0)]),
        ]);
        let w = weights(&[("a", 6.0), ("b", 1.0), ("c", 1.0)]);
        let mut config = ConsensusConfig::new("a");
        config.veto_threshold = 10.0;
        // A tolerates wide deviation; no veto despite |60 - 42| > 10
        config.veto_overrides.insert("a".into(), 30.0);

        let outcome = compute(&snaps, &w, &config, TimeWindow::new(0, HOUR));
        let point = outcome.point_at(0, Metric::Temperature).unwrap();
        assert!(point.contributors.iter().all(|c| !c.veto_applied));
    }

    #[test]
    fn stale_and_default_are_discounted() {
        let snaps = snapshots(vec![
            snapshot("a", TrustTier::Stale, vec![(0, Metric::Temperature, 10.0)]),
            snapshot("b", TrustTier::Fresh, vec![(0, Metric::Temperature, 20.0)]),
        ]);
        let config = ConsensusConfig::new("a");
        let outcome = compute(
            &snaps,
            &weights(&[("a", 2.0), ("b", 2.0)]),
            &config,
            TimeWindow::new(0, HOUR),
        );
        // a: 2.0 * 0.5 = 1.0, b: 2.0 → (10 + 40) / 3
        let value = outcome.value_at(0, Metric::Temperature).unwrap();
        assert!((value - 50.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_baseline_marks_synthesized() {
        let snaps = snapshots(vec![
            snapshot("nws", TrustTier::Fresh, vec![(0, Metric::Temperature, 10.0)]),
            snapshot(
                "met_no",
                TrustTier::Fresh,
                vec![(0, Metric::Temperature, 14.0), (HOUR, Metric::Temperature, 15.0)],
            ),
            snapshot(
                "open_meteo",
                TrustTier::Fresh,
                vec![(HOUR, Metric::Temperature, 13.0)],
            ),
        ]);
        let config = ConsensusConfig::new("open_meteo");
        let w = weights(&[("nws", 3.0), ("met_no", 1.0), ("open_meteo", 1.0)]);
        let outcome = compute(&snaps, &w, &config, TimeWindow::new(0, 2 * HOUR));

        // Hour 0: baseline absent → synthesized from the other two
        let p0 = outcome.point_at(0, Metric::Temperature).unwrap();
        assert!(p0.is_synthesized);
        assert!((p0.value - (10.0 * 3.0 + 14.0) / 4.0).abs() < 1e-9);

        // Hour 1: baseline present → not synthesized
        let p1 = outcome.point_at(HOUR, Metric::Temperature).unwrap();
        assert!(!p1.is_synthesized);
    }

    #[test]
    fn empty_slot_reported_as_gap() {
        let snaps = snapshots(vec![snapshot(
            "a",
            TrustTier::Fresh,
            vec![(0, Metric::Temperature, 10.0)],
        )]);
        let config = ConsensusConfig::new("a");
        let outcome = compute(&snaps, &weights(&[("a", 1.0)]), &config, TimeWindow::new(0, 2 * HOUR));
        assert_eq!(outcome.points.len(), 1);
        assert_eq!(
            outcome.gaps,
            vec![SlotGap {
                ts: HOUR,
                metric: Metric::Temperature
            }]
        );
    }

    #[test]
    fn inactive_metrics_do_not_gap() {
        // Nobody reports PM2.5 at all: no gap spam for it.
        let snaps = snapshots(vec![snapshot(
            "a",
            TrustTier::Fresh,
            vec![(0, Metric::Temperature, 10.0)],
        )]);
        let config = ConsensusConfig::new("a");
        let outcome = compute(&snaps, &weights(&[("a", 1.0)]), &config, TimeWindow::new(0, HOUR));
        assert!(outcome.gaps.is_empty());
        assert_eq!(outcome.points.len(), 1);
    }

    #[test]
    fn contributors_record_tier_and_weight() {
        let snaps = snapshots(vec![
            snapshot("a", TrustTier::Default, vec![(0, Metric::WindSpeed, 4.0)]),
            snapshot("b", TrustTier::Fresh, vec![(0, Metric::WindSpeed, 6.0)]),
        ]);
        let config = ConsensusConfig::new("b");
        let outcome = compute(
            &snaps,
            &weights(&[("a", 5.0), ("b", 1.0)]),
            &config,
            TimeWindow::new(0, HOUR),
        );
        let point = outcome.point_at(0, Metric::WindSpeed).unwrap();
        let a = point.contributors.iter().find(|c| c.provider == "a").unwrap();
        assert_eq!(a.tier, TrustTier::Default);
        assert!((a.effective_weight - 1.0).abs() < 1e-9); // 5.0 * 0.2
    }
}
