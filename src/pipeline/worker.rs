//! Scoring shards.
//!
//! Each shard task exclusively owns a [`Scorer`] and the baselines of every
//! stream hashed to it, so per-stream ingestion is serialized by the
//! channel while different shards score in parallel.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::detect::scoring::EngineStats;
use crate::detect::{DetectError, ScoreResult, Scorer};
use crate::metrics::MetricSample;

pub(crate) enum Command {
    Ingest {
        sample: MetricSample,
        reply: oneshot::Sender<Result<ScoreResult, DetectError>>,
    },
    Stats {
        reply: oneshot::Sender<ShardStats>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub shard: usize,
    pub streams: usize,
    #[serde(flatten)]
    pub engine: EngineStats,
}

pub(crate) async fn run_shard(
    shard: usize,
    mut scorer: Box<dyn Scorer>,
    mut rx: mpsc::Receiver<Command>,
    idle_sweep: Duration,
    cancel: CancellationToken,
) {
    debug!(shard, "Scoring shard started");
    let mut sweep = tokio::time::interval_at(Instant::now() + idle_sweep, idle_sweep);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(Command::Ingest { sample, reply }) => {
                    let result = scorer.ingest(&sample);
                    // The caller may have gone away; the baseline is updated regardless.
                    let _ = reply.send(result);
                }
                Some(Command::Stats { reply }) => {
                    let _ = reply.send(ShardStats {
                        shard,
                        streams: scorer.stream_count(),
                        engine: scorer.stats(),
                    });
                }
                None => break,
            },
            _ = sweep.tick() => {
                let evicted = scorer.evict_idle(Instant::now());
                if evicted > 0 {
                    info!(shard, evicted, remaining = scorer.stream_count(), "Evicted idle baselines");
                }
            }
        }
    }
    debug!(shard, "Scoring shard stopped");
}
