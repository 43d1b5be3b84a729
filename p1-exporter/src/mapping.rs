//! Mapping from P1 readings to exported metric keys.
//!
//! The table is data, not control flow: each entry names an OBIS code, the
//! metric key it feeds and the value slot to read. Codes absent from the table
//! are ignored so newer meters never break ingestion.

use std::collections::HashMap;
use std::fmt;

use p1_common::telegram::{ObisCode, Reading};

/// The fixed set of exported metric names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricName {
    InstantaneousPowerConsumed,
    InstantaneousPowerGenerated,
    InstantaneousCurrent,
    InstantaneousVoltage,
    TariffIndicator,
    ElectricityConsumed,
    ElectricityGenerated,
    GasConsumed,
}

impl MetricName {
    /// All metric names, in exposition order.
    pub const ALL: [MetricName; 8] = [
        MetricName::InstantaneousPowerConsumed,
        MetricName::InstantaneousPowerGenerated,
        MetricName::InstantaneousCurrent,
        MetricName::InstantaneousVoltage,
        MetricName::TariffIndicator,
        MetricName::ElectricityConsumed,
        MetricName::ElectricityGenerated,
        MetricName::GasConsumed,
    ];

    /// Name as exposed to Prometheus.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::InstantaneousPowerConsumed => "instantaneous_power_consumed",
            MetricName::InstantaneousPowerGenerated => "instantaneous_power_generated",
            MetricName::InstantaneousCurrent => "instantaneous_current",
            MetricName::InstantaneousVoltage => "instantaneous_voltage",
            MetricName::TariffIndicator => "tariff_indicator",
            MetricName::ElectricityConsumed => "electricity_consumed",
            MetricName::ElectricityGenerated => "electricity_generated",
            MetricName::GasConsumed => "gas_consumed",
        }
    }

    /// HELP text for the exposition format.
    pub fn help(&self) -> &'static str {
        match self {
            MetricName::InstantaneousPowerConsumed => "Instantaneous power consumed per phase in W",
            MetricName::InstantaneousPowerGenerated => {
                "Instantaneous power generated per phase in W"
            }
            MetricName::InstantaneousCurrent => "Instantaneous current per phase in A",
            MetricName::InstantaneousVoltage => "Instantaneous voltage per phase in V",
            MetricName::TariffIndicator => "Tariff indicator electricity",
            MetricName::ElectricityConsumed => "Electricity consumed per tariff in Wh",
            MetricName::ElectricityGenerated => "Electricity generated per tariff in Wh",
            MetricName::GasConsumed => "Gas consumed in m3",
        }
    }

    /// Which label dimension this metric carries, if any.
    pub fn label_kind(&self) -> Option<LabelKind> {
        match self {
            MetricName::InstantaneousPowerConsumed
            | MetricName::InstantaneousPowerGenerated
            | MetricName::InstantaneousCurrent
            | MetricName::InstantaneousVoltage => Some(LabelKind::Phase),
            MetricName::ElectricityConsumed | MetricName::ElectricityGenerated => {
                Some(LabelKind::Tariff)
            }
            MetricName::TariffIndicator | MetricName::GasConsumed => None,
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Label dimension of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Phase,
    Tariff,
}

/// Electrical phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::L1 => "l1",
            Phase::L2 => "l2",
            Phase::L3 => "l3",
        }
    }
}

/// Electricity tariff (low/high rate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tariff {
    T1,
    T2,
}

impl Tariff {
    pub const ALL: [Tariff; 2] = [Tariff::T1, Tariff::T2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tariff::T1 => "1",
            Tariff::T2 => "2",
        }
    }
}

/// Label attached to a metric key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyLabel {
    Phase(Phase),
    Tariff(Tariff),
}

impl KeyLabel {
    /// Label name (`phase` or `tariff`).
    pub fn name(&self) -> &'static str {
        match self {
            KeyLabel::Phase(_) => "phase",
            KeyLabel::Tariff(_) => "tariff",
        }
    }

    /// Label value (`l1`..`l3`, `1`, `2`).
    pub fn value(&self) -> &'static str {
        match self {
            KeyLabel::Phase(phase) => phase.as_str(),
            KeyLabel::Tariff(tariff) => tariff.as_str(),
        }
    }
}

/// A `(name, label)` pair under which one value is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    pub name: MetricName,
    pub label: Option<KeyLabel>,
}

impl MetricKey {
    /// Key for an unlabeled metric.
    pub const fn plain(name: MetricName) -> Self {
        Self { name, label: None }
    }

    /// Key for a per-phase metric.
    pub const fn phase(name: MetricName, phase: Phase) -> Self {
        Self {
            name,
            label: Some(KeyLabel::Phase(phase)),
        }
    }

    /// Key for a per-tariff metric.
    pub const fn tariff(name: MetricName, tariff: Tariff) -> Self {
        Self {
            name,
            label: Some(KeyLabel::Tariff(tariff)),
        }
    }

    /// The complete key space, known at startup.
    pub fn all() -> Vec<MetricKey> {
        let mut keys = Vec::new();
        for name in MetricName::ALL {
            match name.label_kind() {
                Some(LabelKind::Phase) => {
                    keys.extend(Phase::ALL.iter().map(|p| MetricKey::phase(name, *p)))
                }
                Some(LabelKind::Tariff) => {
                    keys.extend(Tariff::ALL.iter().map(|t| MetricKey::tariff(name, *t)))
                }
                None => keys.push(MetricKey::plain(name)),
            }
        }
        keys
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            Some(label) => write!(f, "{}{{{}=\"{}\"}}", self.name, label.name(), label.value()),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One row of the mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Source OBIS code.
    pub code: ObisCode,
    /// Target metric key.
    pub key: MetricKey,
    /// Index into the reading's value list.
    pub slot: usize,
}

/// Static lookup from OBIS code to metric key.
#[derive(Debug, Clone)]
pub struct MappingTable {
    entries: HashMap<ObisCode, Mapping>,
}

impl MappingTable {
    /// The standard DSMR table.
    ///
    /// Gas readings read slot 1: the meter reports the capture timestamp in
    /// slot 0 and the volume in slot 1.
    pub fn standard() -> Self {
        use MetricName::*;
        use ObisCode::*;
        use Phase::{L1, L2, L3};
        use Tariff::{T1, T2};

        let rows = [
            (InstantaneousPowerDeliveredL1, MetricKey::phase(InstantaneousPowerConsumed, L1), 0),
            (InstantaneousPowerDeliveredL2, MetricKey::phase(InstantaneousPowerConsumed, L2), 0),
            (InstantaneousPowerDeliveredL3, MetricKey::phase(InstantaneousPowerConsumed, L3), 0),
            (InstantaneousPowerGeneratedL1, MetricKey::phase(InstantaneousPowerGenerated, L1), 0),
            (InstantaneousPowerGeneratedL2, MetricKey::phase(InstantaneousPowerGenerated, L2), 0),
            (InstantaneousPowerGeneratedL3, MetricKey::phase(InstantaneousPowerGenerated, L3), 0),
            (InstantaneousCurrentL1, MetricKey::phase(InstantaneousCurrent, L1), 0),
            (InstantaneousCurrentL2, MetricKey::phase(InstantaneousCurrent, L2), 0),
            (InstantaneousCurrentL3, MetricKey::phase(InstantaneousCurrent, L3), 0),
            (InstantaneousVoltageL1, MetricKey::phase(InstantaneousVoltage, L1), 0),
            (InstantaneousVoltageL2, MetricKey::phase(InstantaneousVoltage, L2), 0),
            (InstantaneousVoltageL3, MetricKey::phase(InstantaneousVoltage, L3), 0),
            (ElectricityTariffIndicator, MetricKey::plain(TariffIndicator), 0),
            (ElectricityDeliveredTariff1, MetricKey::tariff(ElectricityConsumed, T1), 0),
            (ElectricityDeliveredTariff2, MetricKey::tariff(ElectricityConsumed, T2), 0),
            (ElectricityGeneratedTariff1, MetricKey::tariff(ElectricityGenerated, T1), 0),
            (ElectricityGeneratedTariff2, MetricKey::tariff(ElectricityGenerated, T2), 0),
            (GasDelivered, MetricKey::plain(GasConsumed), 1),
        ];

        let entries = rows
            .into_iter()
            .map(|(code, key, slot)| (code.clone(), Mapping { code, key, slot }))
            .collect();

        Self { entries }
    }

    /// Mapping for a code, if the code is tracked.
    pub fn lookup(&self, code: &ObisCode) -> Option<&Mapping> {
        self.entries.get(code)
    }

    /// Resolve a reading to its metric key and numeric value.
    ///
    /// Returns `None` for untracked codes and for readings that lack the
    /// configured value slot.
    pub fn resolve(&self, reading: &Reading) -> Option<(MetricKey, f64)> {
        let mapping = self.lookup(&reading.code)?;
        let raw = reading.value(mapping.slot)?;
        Some((mapping.key, parse_value(raw)))
    }

    /// All table rows.
    pub fn entries(&self) -> impl Iterator<Item = &Mapping> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Convert raw reading text to a float.
///
/// Text that does not parse yields `0.0` rather than an error; scrapers see
/// zero for a garbled value, matching the exporter's historical behavior.
pub fn parse_value(raw: &str) -> f64 {
    raw.parse::<f64>().unwrap_or(0.0)
}
