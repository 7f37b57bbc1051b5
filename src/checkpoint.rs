//! Single writer for [`PipelineState`] while a stage runs. Workers report
//! completions over a channel; the writer applies them and persists the
//! checkpoint every `K` completions, so a crash loses at most `K - 1`
//! completed units.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StateError;
use crate::model::{AudioVariant, VariantKey};
use crate::state::{CheckpointStore, ChunkRecord, PipelineState};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum CheckpointEvent {
    ChunkDone {
        key: VariantKey,
        record: ChunkRecord,
    },
    /// A rendered variant supersedes its chunk progress; a failed one keeps
    /// it so the next attempt reuses the chunks that did synthesize.
    VariantDone {
        key: VariantKey,
        variant: AudioVariant,
    },
    Retries {
        counter: String,
        count: u32,
    },
}

impl CheckpointEvent {
    /// Whether the event represents completed work that counts toward a flush.
    fn is_completion(&self) -> bool {
        !matches!(self, CheckpointEvent::Retries { .. })
    }
}

pub fn apply(state: &mut PipelineState, event: CheckpointEvent) {
    match event {
        CheckpointEvent::ChunkDone { key, record } => {
            let records = state.chunk_progress.entry(key.to_string()).or_default();
            records.retain(|r| r.index != record.index);
            records.push(record);
            records.sort_by_key(|r| r.index);
        }
        CheckpointEvent::VariantDone { key, variant } => {
            if variant.synthesis_error.is_none() {
                state.chunk_progress.remove(&key.to_string());
            }
            state
                .completed_variants
                .entry(key.item_id)
                .or_default()
                .insert(key.voice, variant);
        }
        CheckpointEvent::Retries { counter, count } => {
            *state.retry_counters.entry(counter).or_insert(0) += count;
        }
    }
}

/// Counts completions and says when a flush is due.
#[derive(Debug, Clone)]
pub struct FlushCadence {
    every: usize,
    pending: usize,
}

impl FlushCadence {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            pending: 0,
        }
    }

    pub fn record(&mut self) -> bool {
        self.pending += 1;
        if self.pending >= self.every {
            self.pending = 0;
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }
}

pub struct CheckpointWriter {
    tx: mpsc::Sender<CheckpointEvent>,
    handle: JoinHandle<PipelineState>,
}

impl CheckpointWriter {
    /// Take ownership of `state` until [`CheckpointWriter::finish`]. With no
    /// store (dry runs) events are applied in memory only.
    pub fn spawn(state: PipelineState, store: Option<CheckpointStore>, every: usize) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(run(state, store, FlushCadence::new(every), rx));
        Self { tx, handle }
    }

    pub fn sender(&self) -> mpsc::Sender<CheckpointEvent> {
        self.tx.clone()
    }

    /// Close the channel, drain outstanding events, flush, and hand the state back.
    pub async fn finish(self) -> Result<PipelineState, StateError> {
        drop(self.tx);
        self.handle.await.map_err(|_| StateError::WriterGone)
    }
}

async fn run(
    mut state: PipelineState,
    store: Option<CheckpointStore>,
    mut cadence: FlushCadence,
    mut rx: mpsc::Receiver<CheckpointEvent>,
) -> PipelineState {
    while let Some(event) = rx.recv().await {
        let completion = event.is_completion();
        apply(&mut state, event);
        if completion && cadence.record() {
            flush(&state, store.as_ref());
        }
    }
    flush(&state, store.as_ref());
    state
}

fn flush(state: &PipelineState, store: Option<&CheckpointStore>) {
    let Some(store) = store else {
        return;
    };
    match store.save(state) {
        Ok(()) => debug!("Checkpoint flushed to {}", store.path().display()),
        Err(e) => warn!("Checkpoint flush failed: {}", e),
    }
}
