//! Ingestion loop: drains a telegram source into the metric state.

use std::sync::Arc;

use p1_common::telegram::{Reading, Telegram};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::mapping::{MappingTable, parse_value};
use crate::source::TelegramSource;
use crate::state::SharedState;

/// What happened to a single reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingOutcome {
    /// The mapped key was overwritten.
    Applied,
    /// The code is not exported.
    Unmapped,
    /// The code is exported but the reading lacks the configured slot.
    Malformed,
}

/// Why the ingestion loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Shutdown was requested.
    Cancelled,
    /// The source reported end of stream.
    SourceExhausted,
    /// The source reported a transport error.
    SourceFailed(String),
}

/// Applies readings to the shared metric state.
#[derive(Clone)]
pub struct Ingestor {
    state: SharedState,
    table: Arc<MappingTable>,
}

impl Ingestor {
    /// Create an ingestor writing into `state`.
    pub fn new(state: SharedState, table: MappingTable) -> Self {
        Self {
            state,
            table: Arc::new(table),
        }
    }

    /// The state this ingestor writes to.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Apply one reading. Never fails: untracked codes and malformed
    /// readings are counted and skipped.
    pub fn ingest_reading(&self, reading: &Reading) -> ReadingOutcome {
        let outcome = match self.table.lookup(&reading.code) {
            None => {
                trace!(code = %reading.code, "Ignoring unmapped reading");
                ReadingOutcome::Unmapped
            }
            Some(mapping) => match reading.value(mapping.slot) {
                Some(raw) => {
                    let value = parse_value(raw);
                    trace!(
                        code = %reading.code,
                        key = %mapping.key,
                        raw,
                        value,
                        "Applying reading"
                    );
                    self.state.set(mapping.key, value);
                    ReadingOutcome::Applied
                }
                None => {
                    debug!(
                        code = %reading.code,
                        slot = mapping.slot,
                        values = reading.values.len(),
                        "Reading is missing its value slot"
                    );
                    ReadingOutcome::Malformed
                }
            },
        };

        self.state.record_reading(outcome);
        outcome
    }

    /// Apply every reading of a telegram. Returns how many were applied.
    pub fn ingest_telegram(&self, telegram: &Telegram) -> usize {
        self.state.record_telegram();

        telegram
            .readings
            .iter()
            .map(|reading| self.ingest_reading(reading))
            .filter(|outcome| *outcome == ReadingOutcome::Applied)
            .count()
    }

    /// Consume `source` until it ends or `shutdown` turns true.
    ///
    /// Each telegram is applied without yielding, so cancellation only ever
    /// lands between telegrams.
    pub async fn run<S: TelegramSource>(
        &self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> IngestOutcome {
        if *shutdown.borrow() {
            return IngestOutcome::Cancelled;
        }

        info!("Ingestion started, waiting for telegrams...");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping ingestion");
                        return IngestOutcome::Cancelled;
                    }
                }

                next = source.next_telegram() => {
                    match next {
                        Ok(Some(telegram)) => {
                            let applied = self.ingest_telegram(&telegram);
                            debug!(
                                readings = telegram.readings.len(),
                                applied,
                                "Telegram ingested"
                            );
                        }
                        Ok(None) => {
                            warn!("Reading source exhausted, metrics keep their last values");
                            return IngestOutcome::SourceExhausted;
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                "Reading source failed, metrics keep their last values"
                            );
                            return IngestOutcome::SourceFailed(e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Start the loop as a background task.
    pub fn spawn<S>(self, source: S) -> IngestHandle
    where
        S: TelegramSource + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(source, shutdown_rx).await });

        IngestHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running ingestion task.
pub struct IngestHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<IngestOutcome>,
}

impl IngestHandle {
    /// Ask the loop to stop after the telegram in progress.
    pub fn cancel(&self) {
        // Fails only when the loop already ended.
        let _ = self.shutdown.send(true);
    }

    /// Whether the loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait for it to end.
    pub async fn stop(self) -> IngestOutcome {
        self.cancel();
        self.join().await
    }

    /// Wait for the loop to end on its own.
    pub async fn wait(self) -> IngestOutcome {
        self.join().await
    }

    async fn join(self) -> IngestOutcome {
        let IngestHandle {
            shutdown: _shutdown,
            task,
        } = self;

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => IngestOutcome::SourceFailed(format!("Ingestion task failed: {}", e)),
        }
    }
}
