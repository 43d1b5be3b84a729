//! Telegram sources feeding the ingestion loop.
//!
//! Decoding the meter's wire protocol happens upstream; a source only hands
//! over telegrams that are already framed and validated.

use std::f64::consts::PI;
use std::future::Future;
use std::time::Duration;

use p1_common::telegram::{ObisCode, Reading, ReadingValue, Telegram};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{info, warn};

/// Errors raised by a telegram source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open telegram stream '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Telegram stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A lazy, non-restartable sequence of decoded telegrams.
pub trait TelegramSource {
    /// Wait for the next telegram.
    ///
    /// `Ok(None)` means the source is exhausted. An error means the transport
    /// is gone; reconnecting is the source's business, not the caller's.
    fn next_telegram(
        &mut self,
    ) -> impl Future<Output = Result<Option<Telegram>, SourceError>> + Send;
}

/// Telegrams handed over by an in-process decoder. Ends when every sender is
/// dropped.
impl TelegramSource for mpsc::Receiver<Telegram> {
    async fn next_telegram(&mut self) -> Result<Option<Telegram>, SourceError> {
        Ok(self.recv().await)
    }
}

/// Newline-delimited JSON telegrams from an async reader.
///
/// Blank lines are skipped. Lines that are not UTF-8 or not a telegram are
/// logged and skipped so one corrupt line never stops ingestion.
pub struct LineSource<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    skipped: u64,
}

impl<R: AsyncRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
            skipped: 0,
        }
    }

    /// Number of lines skipped because they did not decode.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Reader type for [`LineSource::open`].
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

impl LineSource<BoxedReader> {
    /// Open a telegram stream by path. `-` reads standard input.
    pub async fn open(path: &str) -> Result<Self, SourceError> {
        let reader: BoxedReader = if path == "-" {
            info!("Reading telegrams from stdin");
            Box::new(tokio::io::stdin())
        } else {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|source| SourceError::Open {
                    path: path.to_string(),
                    source,
                })?;
            info!(path, "Reading telegrams from stream");
            Box::new(file)
        };

        Ok(Self::new(reader))
    }
}

impl<R: AsyncRead + Unpin + Send> TelegramSource for LineSource<R> {
    async fn next_telegram(&mut self) -> Result<Option<Telegram>, SourceError> {
        loop {
            // Partial input stays buffered if this future is dropped mid-line.
            let read = self.reader.read_until(b'\n', &mut self.line).await?;
            if read == 0 && self.line.is_empty() {
                return Ok(None);
            }

            let decoded = decode_line(&self.line);
            self.line.clear();

            match decoded {
                Ok(Some(telegram)) => return Ok(Some(telegram)),
                Ok(None) => continue,
                Err(reason) => {
                    self.skipped += 1;
                    warn!(
                        error = %reason,
                        skipped = self.skipped,
                        "Skipping undecodable telegram line"
                    );
                }
            }
        }
    }
}

/// Decode one raw line. `Ok(None)` for blank lines.
fn decode_line(raw: &[u8]) -> Result<Option<Telegram>, String> {
    let line = std::str::from_utf8(raw).map_err(|e| e.to_string())?.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Telegram::from_json(line).map(Some).map_err(|e| e.to_string())
}

/// Synthetic three-phase meter for demos and local testing.
///
/// Produces one telegram per interval with slowly varying load, a small solar
/// feed-in on L1, monotonically increasing energy and gas counters, and a
/// tariff switch every 30 telegrams.
pub struct DemoSource {
    rng: SmallRng,
    interval: Option<Interval>,
    period: Duration,
    tick: u64,
    delivered_kwh: [f64; 2],
    generated_kwh: [f64; 2],
    gas_m3: f64,
}

impl DemoSource {
    /// Create a demo meter emitting one telegram per `period`.
    pub fn new(period: Duration) -> Self {
        Self::with_seed(period, 0x5031_4d45_5445_5221)
    }

    /// Create a demo meter with a fixed RNG seed.
    ///
    /// The tick timer starts on the first [`TelegramSource::next_telegram`]
    /// call, so construction and [`DemoSource::generate`] need no runtime.
    pub fn with_seed(period: Duration, seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            interval: None,
            period,
            tick: 0,
            delivered_kwh: [4_512.384, 3_871.019],
            generated_kwh: [812.227, 1_903.556],
            gas_m3: 2_785.123,
        }
    }

    /// Generate the next telegram without waiting.
    pub fn generate(&mut self) -> Telegram {
        self.tick += 1;
        let t = self.tick as f64;
        let tariff = if (self.tick / 30) % 2 == 0 { 1 } else { 2 };

        let mut readings = vec![
            Reading::single(ObisCode::TelegramTimestamp, self.timestamp(), None),
            Reading::single(
                ObisCode::Other("0-0:96.1.1".to_string()),
                "4530303435303033383833343836",
                None,
            ),
            Reading::single(
                ObisCode::ElectricityTariffIndicator,
                format!("{:04}", tariff),
                None,
            ),
        ];

        let mut delivered_total = 0.0;
        let mut generated_total = 0.0;
        let phases = [
            (
                ObisCode::InstantaneousVoltageL1,
                ObisCode::InstantaneousCurrentL1,
                ObisCode::InstantaneousPowerDeliveredL1,
                ObisCode::InstantaneousPowerGeneratedL1,
            ),
            (
                ObisCode::InstantaneousVoltageL2,
                ObisCode::InstantaneousCurrentL2,
                ObisCode::InstantaneousPowerDeliveredL2,
                ObisCode::InstantaneousPowerGeneratedL2,
            ),
            (
                ObisCode::InstantaneousVoltageL3,
                ObisCode::InstantaneousCurrentL3,
                ObisCode::InstantaneousPowerDeliveredL3,
                ObisCode::InstantaneousPowerGeneratedL3,
            ),
        ];

        for (i, (voltage_code, current_code, delivered_code, generated_code)) in
            phases.into_iter().enumerate()
        {
            let offset = i as f64 * 2.0 * PI / 3.0;
            let voltage = 230.0 + self.rng.random_range(-2.5..2.5);
            let noise = self.rng.random_range(0.0..0.08);
            let load = 0.35 + 0.25 * (t / 40.0 + offset).sin() + noise;
            let solar = if i == 0 {
                (0.9 * (t / 120.0).sin()).max(0.0)
            } else {
                0.0
            };
            let delivered = (load - solar).max(0.0);
            let generated = (solar - load).max(0.0);
            let current = ((delivered + generated) * 1000.0 / voltage).round();

            delivered_total += delivered;
            generated_total += generated;

            readings.extend([
                Reading::single(voltage_code, format!("{:05.1}", voltage), Some("V")),
                Reading::single(current_code, format!("{:03}", current as u64), Some("A")),
                Reading::single(delivered_code, format!("{:06.3}", delivered), Some("kW")),
                Reading::single(generated_code, format!("{:06.3}", generated), Some("kW")),
            ]);
        }

        let hours = self.period.as_secs_f64() / 3600.0;
        self.delivered_kwh[tariff - 1] += delivered_total * hours;
        self.generated_kwh[tariff - 1] += generated_total * hours;
        self.gas_m3 += self.rng.random_range(0.0..0.002);

        readings.extend([
            Reading::single(
                ObisCode::PowerDelivered,
                format!("{:06.3}", delivered_total),
                Some("kW"),
            ),
            Reading::single(
                ObisCode::PowerGenerated,
                format!("{:06.3}", generated_total),
                Some("kW"),
            ),
            Reading::single(
                ObisCode::ElectricityDeliveredTariff1,
                format!("{:010.3}", self.delivered_kwh[0]),
                Some("kWh"),
            ),
            Reading::single(
                ObisCode::ElectricityDeliveredTariff2,
                format!("{:010.3}", self.delivered_kwh[1]),
                Some("kWh"),
            ),
            Reading::single(
                ObisCode::ElectricityGeneratedTariff1,
                format!("{:010.3}", self.generated_kwh[0]),
                Some("kWh"),
            ),
            Reading::single(
                ObisCode::ElectricityGeneratedTariff2,
                format!("{:010.3}", self.generated_kwh[1]),
                Some("kWh"),
            ),
            Reading::new(
                ObisCode::GasDelivered,
                vec![
                    ReadingValue::new(self.timestamp()),
                    ReadingValue::new(format!("{:09.3}", self.gas_m3)).with_unit("m3"),
                ],
            ),
        ]);

        Telegram::new(readings)
    }

    /// Meter-style `YYMMDDhhmmssW` timestamp derived from the tick count.
    fn timestamp(&self) -> String {
        let secs = (self.tick as f64 * self.period.as_secs_f64()) as u64;
        let (h, m, s) = ((secs / 3600) % 24, (secs / 60) % 60, secs % 60);
        format!("240101{:02}{:02}{:02}W", h, m, s)
    }
}

impl TelegramSource for DemoSource {
    async fn next_telegram(&mut self) -> Result<Option<Telegram>, SourceError> {
        let period = self.period;
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        interval.tick().await;
        Ok(Some(self.generate()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MappingTable, MetricKey, MetricName, parse_value};
    use std::collections::HashSet;
    use std::io::Write;

    #[tokio::test]
    async fn test_channel_source() {
        let (tx, mut rx) = mpsc::channel(2);
        tx.send(Telegram::default()).await.unwrap();
        drop(tx);

        assert_eq!(rx.next_telegram().await.unwrap(), Some(Telegram::default()));
        assert_eq!(rx.next_telegram().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_source_skips_blank_and_corrupt_lines() {
        let input = concat!(
            "{\"readings\":[{\"code\":\"0-0:96.14.0\",\"values\":[{\"value\":\"0001\"}]}]}\n",
            "\n",
            "!corrupt\n",
            "   \n",
            "{\"readings\":[]}\n",
        );
        let mut source = LineSource::new(input.as_bytes());

        let first = source.next_telegram().await.unwrap().unwrap();
        assert_eq!(first.readings[0].code, ObisCode::ElectricityTariffIndicator);

        let second = source.next_telegram().await.unwrap().unwrap();
        assert!(second.readings.is_empty());
        assert_eq!(source.skipped(), 1);

        assert!(source.next_telegram().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_source_skips_invalid_utf8() {
        let mut input = Vec::new();
        input.extend_from_slice(b"{\"readings\":[]}\n");
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(
            b"{\"readings\":[{\"code\":\"0-0:96.14.0\",\"values\":[{\"value\":\"0002\"}]}]}",
        );
        let mut source = LineSource::new(input.as_slice());

        assert!(source.next_telegram().await.unwrap().unwrap().readings.is_empty());

        let last = source.next_telegram().await.unwrap().unwrap();
        assert_eq!(last.readings[0].value(0), Some("0002"));
        assert_eq!(source.skipped(), 1);

        assert!(source.next_telegram().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_source_open_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let telegram = Telegram::new(vec![Reading::single(
            ObisCode::InstantaneousPowerDeliveredL2,
            "01.193",
            Some("kW"),
        )]);
        writeln!(file, "{}", telegram.to_json().unwrap()).unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let mut source = LineSource::open(&path).await.unwrap();

        assert_eq!(source.next_telegram().await.unwrap(), Some(telegram));
        assert_eq!(source.next_telegram().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_source_open_missing_path() {
        match LineSource::open("/nonexistent/p1.jsonl").await {
            Err(SourceError::Open { path, .. }) => assert_eq!(path, "/nonexistent/p1.jsonl"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opening a missing path should fail"),
        }
    }

    #[test]
    fn test_demo_telegram_covers_every_key() {
        let table = MappingTable::standard();
        let mut demo = DemoSource::with_seed(Duration::from_secs(1), 7);
        let telegram = demo.generate();

        let keys: HashSet<MetricKey> = telegram
            .readings
            .iter()
            .filter_map(|r| table.resolve(r))
            .map(|(key, _)| key)
            .collect();

        assert_eq!(keys.len(), MetricKey::all().len());
        assert!(
            telegram
                .readings
                .iter()
                .any(|r| table.lookup(&r.code).is_none())
        );
    }

    #[test]
    fn test_demo_counters_increase() {
        let table = MappingTable::standard();
        let mut demo = DemoSource::with_seed(Duration::from_secs(10), 42);
        let gas = MetricKey::plain(MetricName::GasConsumed);

        let mut last_gas = 0.0;
        for _ in 0..100 {
            let telegram = demo.generate();
            let value = telegram
                .readings
                .iter()
                .filter_map(|r| table.resolve(r))
                .find(|(key, _)| *key == gas)
                .map(|(_, v)| v)
                .unwrap();
            assert!(value >= last_gas);
            last_gas = value;
        }
    }

    #[test]
    fn test_demo_values_parse() {
        let mut demo = DemoSource::with_seed(Duration::from_secs(1), 1);
        for _ in 0..60 {
            for reading in demo.generate().readings {
                if matches!(
                    reading.code,
                    ObisCode::TelegramTimestamp | ObisCode::Other(_)
                ) {
                    continue;
                }
                let raw = &reading.values.last().unwrap().value;
                assert!(raw.parse::<f64>().is_ok(), "{}: {raw}", reading.code);
                assert!(parse_value(raw) >= 0.0);
            }
        }
    }

    #[tokio::test]
    async fn test_demo_source_emits_on_interval() {
        let mut demo = DemoSource::new(Duration::from_millis(50));

        assert!(demo.next_telegram().await.unwrap().is_some());
        let before = tokio::time::Instant::now();
        assert!(demo.next_telegram().await.unwrap().is_some());
        assert!(before.elapsed() >= Duration::from_millis(40));
    }
}
