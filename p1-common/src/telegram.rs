use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;

use crate::error::Result;

/// One complete batch of readings emitted by the meter.
///
/// Telegrams reach the exporter already framed and checksum-validated; a
/// telegram is consumed once and then discarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telegram {
    /// Readings in the order the meter emitted them.
    #[serde(default)]
    pub readings: Vec<Reading>,
}

impl Telegram {
    /// Create a telegram from a list of readings.
    pub fn new(readings: Vec<Reading>) -> Self {
        Self { readings }
    }

    /// Decode a telegram from one JSON document.
    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Encode this telegram as a single-line JSON document.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A single `(code, values)` pair within a telegram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// OBIS code identifying the physical quantity.
    pub code: ObisCode,

    /// Value slots in wire order. Most codes carry one slot; gas readings
    /// carry a capture timestamp followed by the volume.
    #[serde(default)]
    pub values: Vec<ReadingValue>,
}

impl Reading {
    /// Create a reading with the given value slots.
    pub fn new(code: ObisCode, values: Vec<ReadingValue>) -> Self {
        Self { code, values }
    }

    /// Create a reading with a single value slot.
    pub fn single(code: ObisCode, value: impl Into<String>, unit: Option<&str>) -> Self {
        let mut slot = ReadingValue::new(value);
        slot.unit = unit.map(str::to_string);
        Self::new(code, vec![slot])
    }

    /// Raw text of the value in `slot`, if present.
    pub fn value(&self, slot: usize) -> Option<&str> {
        self.values.get(slot).map(|v| v.value.as_str())
    }
}

/// Raw text of one value slot plus its unit, as the meter printed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingValue {
    /// Raw text, e.g. `"00.244"` or `"230101120000W"`.
    pub value: String,

    /// Unit suffix, e.g. `"kW"` or `"m3"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl ReadingValue {
    /// Create a unitless value slot.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            unit: None,
        }
    }

    /// Attach a unit to this value slot.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// OBIS reference of a DSMR reading.
///
/// Codes the meter emits that this model does not name are kept verbatim in
/// [`ObisCode::Other`] so newer meter firmware never fails decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ObisCode {
    TelegramTimestamp,
    PowerDelivered,
    PowerGenerated,
    ElectricityDeliveredTariff1,
    ElectricityDeliveredTariff2,
    ElectricityGeneratedTariff1,
    ElectricityGeneratedTariff2,
    ElectricityTariffIndicator,
    InstantaneousVoltageL1,
    InstantaneousVoltageL2,
    InstantaneousVoltageL3,
    InstantaneousCurrentL1,
    InstantaneousCurrentL2,
    InstantaneousCurrentL3,
    InstantaneousPowerDeliveredL1,
    InstantaneousPowerDeliveredL2,
    InstantaneousPowerDeliveredL3,
    InstantaneousPowerGeneratedL1,
    InstantaneousPowerGeneratedL2,
    InstantaneousPowerGeneratedL3,
    GasDelivered,
    /// Any reference not listed above.
    Other(String),
}

impl ObisCode {
    /// Every named code, in OBIS order.
    pub fn known() -> [ObisCode; 21] {
        [
            ObisCode::TelegramTimestamp,
            ObisCode::PowerDelivered,
            ObisCode::PowerGenerated,
            ObisCode::ElectricityDeliveredTariff1,
            ObisCode::ElectricityDeliveredTariff2,
            ObisCode::ElectricityGeneratedTariff1,
            ObisCode::ElectricityGeneratedTariff2,
            ObisCode::ElectricityTariffIndicator,
            ObisCode::InstantaneousVoltageL1,
            ObisCode::InstantaneousVoltageL2,
            ObisCode::InstantaneousVoltageL3,
            ObisCode::InstantaneousCurrentL1,
            ObisCode::InstantaneousCurrentL2,
            ObisCode::InstantaneousCurrentL3,
            ObisCode::InstantaneousPowerDeliveredL1,
            ObisCode::InstantaneousPowerDeliveredL2,
            ObisCode::InstantaneousPowerDeliveredL3,
            ObisCode::InstantaneousPowerGeneratedL1,
            ObisCode::InstantaneousPowerGeneratedL2,
            ObisCode::InstantaneousPowerGeneratedL3,
            ObisCode::GasDelivered,
        ]
    }

    /// The OBIS reference string, e.g. `1-0:21.7.0`.
    pub fn reference(&self) -> &str {
        match self {
            ObisCode::TelegramTimestamp => "0-0:1.0.0",
            ObisCode::PowerDelivered => "1-0:1.7.0",
            ObisCode::PowerGenerated => "1-0:2.7.0",
            ObisCode::ElectricityDeliveredTariff1 => "1-0:1.8.1",
            ObisCode::ElectricityDeliveredTariff2 => "1-0:1.8.2",
            ObisCode::ElectricityGeneratedTariff1 => "1-0:2.8.1",
            ObisCode::ElectricityGeneratedTariff2 => "1-0:2.8.2",
            ObisCode::ElectricityTariffIndicator => "0-0:96.14.0",
            ObisCode::InstantaneousVoltageL1 => "1-0:32.7.0",
            ObisCode::InstantaneousVoltageL2 => "1-0:52.7.0",
            ObisCode::InstantaneousVoltageL3 => "1-0:72.7.0",
            ObisCode::InstantaneousCurrentL1 => "1-0:31.7.0",
            ObisCode::InstantaneousCurrentL2 => "1-0:51.7.0",
            ObisCode::InstantaneousCurrentL3 => "1-0:71.7.0",
            ObisCode::InstantaneousPowerDeliveredL1 => "1-0:21.7.0",
            ObisCode::InstantaneousPowerDeliveredL2 => "1-0:41.7.0",
            ObisCode::InstantaneousPowerDeliveredL3 => "1-0:61.7.0",
            ObisCode::InstantaneousPowerGeneratedL1 => "1-0:22.7.0",
            ObisCode::InstantaneousPowerGeneratedL2 => "1-0:42.7.0",
            ObisCode::InstantaneousPowerGeneratedL3 => "1-0:62.7.0",
            ObisCode::GasDelivered => "0-1:24.2.1",
            ObisCode::Other(reference) => reference,
        }
    }

    /// Look up a code by its OBIS reference.
    pub fn from_reference(reference: &str) -> Self {
        Self::known()
            .into_iter()
            .find(|code| code.reference() == reference)
            .unwrap_or_else(|| ObisCode::Other(reference.to_string()))
    }
}

impl FromStr for ObisCode {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from_reference(s))
    }
}

impl From<String> for ObisCode {
    fn from(reference: String) -> Self {
        match Self::from_reference(&reference) {
            ObisCode::Other(_) => ObisCode::Other(reference),
            known => known,
        }
    }
}

impl From<ObisCode> for String {
    fn from(code: ObisCode) -> Self {
        match code {
            ObisCode::Other(reference) => reference,
            known => known.reference().to_string(),
        }
    }
}

impl std::fmt::Display for ObisCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_lookup() {
        assert_eq!(
            ObisCode::from_reference("1-0:21.7.0"),
            ObisCode::InstantaneousPowerDeliveredL1
        );
        assert_eq!(
            ObisCode::from_reference("0-1:24.2.1"),
            ObisCode::GasDelivered
        );
        assert_eq!(
            ObisCode::from_reference("0-0:96.1.1"),
            ObisCode::Other("0-0:96.1.1".to_string())
        );
    }

    #[test]
    fn test_known_references_are_unique() {
        let known = ObisCode::known();
        for code in &known {
            assert_eq!(&ObisCode::from_reference(code.reference()), code);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ObisCode::ElectricityTariffIndicator.to_string(), "0-0:96.14.0");
        assert_eq!(ObisCode::Other("9-9:9.9.9".into()).to_string(), "9-9:9.9.9");
    }

    #[test]
    fn test_decode_telegram_json() {
        let line = r#"{"readings":[
            {"code":"1-0:21.7.0","values":[{"value":"00.244","unit":"kW"}]},
            {"code":"0-1:24.2.1","values":[
                {"value":"230101120000W"},{"value":"001.234","unit":"m3"}
            ]},
            {"code":"0-0:96.13.0"}
        ]}"#;

        let telegram = Telegram::from_json(line).unwrap();

        assert_eq!(telegram.readings.len(), 3);
        assert_eq!(
            telegram.readings[0].code,
            ObisCode::InstantaneousPowerDeliveredL1
        );
        assert_eq!(telegram.readings[0].value(0), Some("00.244"));
        assert_eq!(telegram.readings[0].values[0].unit.as_deref(), Some("kW"));
        assert_eq!(telegram.readings[1].value(1), Some("001.234"));
        assert_eq!(
            telegram.readings[2].code,
            ObisCode::Other("0-0:96.13.0".to_string())
        );
        assert!(telegram.readings[2].values.is_empty());
    }

    #[test]
    fn test_telegram_json_keeps_unknown_codes() {
        let telegram = Telegram::new(vec![Reading::single(
            ObisCode::Other("0-0:96.1.4".to_string()),
            "50217",
            None,
        )]);

        let json = telegram.to_json().unwrap();
        assert!(json.contains("\"0-0:96.1.4\""));
        assert!(!json.contains("unit"));
        assert_eq!(Telegram::from_json(&json).unwrap(), telegram);
    }

    #[test]
    fn test_missing_slot() {
        let reading = Reading::single(ObisCode::GasDelivered, "001.234", Some("m3"));
        assert_eq!(reading.value(0), Some("001.234"));
        assert_eq!(reading.value(1), None);
    }

    #[test]
    fn test_invalid_json() {
        assert!(Telegram::from_json("not json").is_err());
    }
}
