//! Shared metric state backed by a Prometheus registry.
//!
//! Every metric key owns its own atomic gauge cell. The cells are created once
//! at construction and never added or removed afterwards, so the ingestion
//! loop writes with a single atomic store while any number of scrapes read
//! concurrently. A snapshot may mix values from consecutive telegrams across
//! keys, but a single key is never observed half-written.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::warn;

use crate::ingest::ReadingOutcome;
use crate::mapping::{LabelKind, MetricKey, MetricName, Phase, Tariff};

/// Float gauge stored as the bit pattern of an `f64` in an `AtomicU64`.
pub type FloatGauge = Gauge<f64, AtomicU64>;

/// Shareable handle to the metric state.
pub type SharedState = Arc<MetricState>;

/// Prefix for the exporter's own statistics.
pub const SELF_METRICS_PREFIX: &str = "p1_exporter";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PhaseLabels {
    phase: Phase,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TariffLabels {
    tariff: Tariff,
}

impl EncodeLabelValue for Phase {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

impl EncodeLabelValue for Tariff {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

/// Ingestion statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Telegrams consumed from the source.
    pub telegrams: u64,
    /// Readings seen across all telegrams.
    pub readings: u64,
    /// Readings whose code is not tracked.
    pub readings_unmapped: u64,
    /// Tracked readings that lacked the configured value slot.
    pub readings_malformed: u64,
}

/// Point-in-time copy of every metric value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    values: BTreeMap<MetricKey, f64>,
}

impl MetricSnapshot {
    pub fn get(&self, key: &MetricKey) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, &f64)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Current value of every metric key plus the registry that exposes them.
pub struct MetricState {
    registry: Registry,
    cells: HashMap<MetricKey, FloatGauge>,
    telegrams: Counter,
    readings: Counter,
    readings_unmapped: Counter,
    readings_malformed: Counter,
}

impl MetricState {
    /// Register all metric families and create a zeroed cell for every key.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let mut cells = HashMap::new();

        for name in MetricName::ALL {
            match name.label_kind() {
                Some(LabelKind::Phase) => {
                    let family = Family::<PhaseLabels, FloatGauge>::default();
                    for phase in Phase::ALL {
                        let cell = family.get_or_create(&PhaseLabels { phase }).clone();
                        cells.insert(MetricKey::phase(name, phase), cell);
                    }
                    registry.register(name.as_str(), name.help(), family);
                }
                Some(LabelKind::Tariff) => {
                    let family = Family::<TariffLabels, FloatGauge>::default();
                    for tariff in Tariff::ALL {
                        let cell = family.get_or_create(&TariffLabels { tariff }).clone();
                        cells.insert(MetricKey::tariff(name, tariff), cell);
                    }
                    registry.register(name.as_str(), name.help(), family);
                }
                None => {
                    let gauge = FloatGauge::default();
                    cells.insert(MetricKey::plain(name), gauge.clone());
                    registry.register(name.as_str(), name.help(), gauge);
                }
            }
        }

        let telegrams = Counter::default();
        let readings = Counter::default();
        let readings_unmapped = Counter::default();
        let readings_malformed = Counter::default();

        let stats = registry.sub_registry_with_prefix(SELF_METRICS_PREFIX);
        stats.register(
            "telegrams",
            "Telegrams consumed from the reading source",
            telegrams.clone(),
        );
        stats.register(
            "readings",
            "Readings processed across all telegrams",
            readings.clone(),
        );
        stats.register(
            "readings_unmapped",
            "Readings ignored because their code is not exported",
            readings_unmapped.clone(),
        );
        stats.register(
            "readings_malformed",
            "Readings ignored because the expected value slot was missing",
            readings_malformed.clone(),
        );

        Self {
            registry,
            cells,
            telegrams,
            readings,
            readings_unmapped,
            readings_malformed,
        }
    }

    /// Overwrite the value for `key`. Last writer wins.
    pub fn set(&self, key: MetricKey, value: f64) {
        match self.cells.get(&key) {
            Some(cell) => {
                cell.set(value);
            }
            None => warn!(key = %key, "No cell registered for metric key"),
        }
    }

    /// Current value for `key`.
    pub fn get(&self, key: &MetricKey) -> Option<f64> {
        self.cells.get(key).map(|cell| cell.get())
    }

    /// Copy every key's current value.
    ///
    /// Each value is read atomically; values of different keys may come from
    /// different telegrams.
    pub fn snapshot_all(&self) -> MetricSnapshot {
        let values = self
            .cells
            .iter()
            .map(|(key, cell)| (*key, cell.get()))
            .collect();
        MetricSnapshot { values }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    /// Count one consumed telegram.
    pub fn record_telegram(&self) {
        self.telegrams.inc();
    }

    /// Count one processed reading.
    pub fn record_reading(&self, outcome: ReadingOutcome) {
        self.readings.inc();
        match outcome {
            ReadingOutcome::Applied => {}
            ReadingOutcome::Unmapped => {
                self.readings_unmapped.inc();
            }
            ReadingOutcome::Malformed => {
                self.readings_malformed.inc();
            }
        }
    }

    /// Get ingestion statistics.
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            telegrams: self.telegrams.get(),
            readings: self.readings.get(),
            readings_unmapped: self.readings_unmapped.get(),
            readings_malformed: self.readings_malformed.get(),
        }
    }
}

impl Default for MetricState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricState")
            .field("keys", &self.cells.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn power_l1() -> MetricKey {
        MetricKey::phase(MetricName::InstantaneousPowerConsumed, Phase::L1)
    }

    #[test]
    fn test_new_state_is_zeroed() {
        let state = MetricState::new();
        let snapshot = state.snapshot_all();

        assert_eq!(snapshot.len(), MetricKey::all().len());
        assert!(snapshot.iter().all(|(_, v)| *v == 0.0));
        assert_eq!(state.stats(), IngestStats::default());
    }

    #[test]
    fn test_set_and_get() {
        let state = MetricState::new();
        state.set(power_l1(), 0.244);

        assert_eq!(state.get(&power_l1()), Some(0.244));
        assert_eq!(state.snapshot_all().get(&power_l1()), Some(0.244));

        let other = MetricKey::phase(MetricName::InstantaneousPowerConsumed, Phase::L2);
        assert_eq!(state.get(&other), Some(0.0));
    }

    #[test]
    fn test_set_overwrites() {
        let state = MetricState::new();
        let key = MetricKey::plain(MetricName::TariffIndicator);

        state.set(key, 1.0);
        state.set(key, 2.0);
        state.set(key, 2.0);

        assert_eq!(state.get(&key), Some(2.0));
    }

    #[test]
    fn test_render_contains_vocabulary() {
        let state = MetricState::new();
        state.set(power_l1(), 0.244);
        state.set(MetricKey::tariff(MetricName::ElectricityConsumed, Tariff::T2), 1234.5);

        let output = state.render().unwrap();

        assert!(output.contains("# TYPE instantaneous_power_consumed gauge"));
        assert!(output.contains("instantaneous_power_consumed{phase=\"l1\"} 0.244"));
        assert!(output.contains("electricity_consumed{tariff=\"2\"} 1234.5"));
        assert!(output.contains("tariff_indicator "));
        assert!(output.contains("gas_consumed "));
        assert!(output.contains("p1_exporter_telegrams"));
    }

    #[test]
    fn test_render_lists_every_key_once() {
        let state = MetricState::new();
        let output = state.render().unwrap();

        for key in MetricKey::all() {
            let prefix = match key.label {
                Some(label) => format!("{}{{{}=\"{}\"}} ", key.name, label.name(), label.value()),
                None => format!("{} ", key.name),
            };
            let count = output.lines().filter(|l| l.starts_with(&prefix)).count();
            assert_eq!(count, 1, "expected one line for {key}");
        }
    }

    #[test]
    fn test_record_reading_stats() {
        let state = MetricState::new();
        state.record_telegram();
        state.record_reading(ReadingOutcome::Applied);
        state.record_reading(ReadingOutcome::Unmapped);
        state.record_reading(ReadingOutcome::Malformed);

        let stats = state.stats();
        assert_eq!(stats.telegrams, 1);
        assert_eq!(stats.readings, 3);
        assert_eq!(stats.readings_unmapped, 1);
        assert_eq!(stats.readings_malformed, 1);
    }

    #[test]
    fn test_concurrent_snapshots_never_see_foreign_values() {
        const WRITES: u64 = 20_000;
        let state = MetricState::new();
        let key = power_l1();
        let gas = MetricKey::plain(MetricName::GasConsumed);

        // Spread each write across many bytes so a torn write would be visible.
        const BASE: u64 = 0x4000_0000_0000_0000;
        let value_at = |i: u64| f64::from_bits(BASE | (i * 0x0101_0101));
        let written = |value: f64| {
            let bits = value.to_bits();
            let i = (bits & !BASE) / 0x0101_0101;
            bits == 0 || ((1..=WRITES).contains(&i) && value_at(i).to_bits() == bits)
        };

        thread::scope(|scope| {
            scope.spawn(|| {
                for i in 1..=WRITES {
                    state.set(key, value_at(i));
                    state.set(gas, i as f64);
                }
            });

            for _ in 0..4 {
                scope.spawn(|| {
                    let mut last_gas = 0.0;
                    for _ in 0..2_000 {
                        let snapshot = state.snapshot_all();

                        let value = snapshot.get(&key).unwrap();
                        assert!(written(value), "observed value never written: {value:e}");

                        let gas_value = snapshot.get(&gas).unwrap();
                        assert_eq!(gas_value.fract(), 0.0);
                        assert!(gas_value >= last_gas, "per-key order went backwards");
                        last_gas = gas_value;
                    }
                });
            }
        });

        assert_eq!(state.get(&key), Some(value_at(WRITES)));
        assert_eq!(state.get(&gas), Some(WRITES as f64));
    }
}
