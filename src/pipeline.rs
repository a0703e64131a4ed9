use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use tracing::{info, warn};

use crate::aggregate::Aggregator;
use crate::geo::GeoDb;
use crate::record::Value;
use crate::schema::Schema;
use crate::source;
use crate::transform::{tokenize, Transformer};
use crate::tunnel::TunnelHandle;

/// Worker wakeup period: effectively "as soon as possible".
const TICK_PERIOD: Duration = Duration::from_millis(1);

/// Upper bound on the shutdown drain, so a dead collector cannot stall
/// the process forever.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Counters reported at the end of one ingest cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    /// Lines read by the producer.
    pub lines: u64,
    /// Records represented downstream (plain records, or bucket `count` sums).
    pub handled: u64,
    /// Buckets emitted (aggregation mode only).
    pub buckets: u64,
}

/// Runs one full ingest cycle for a file source: spawns the producer on a
/// blocking thread, drives the worker loop on this task, drains, and joins.
///
/// The worker owns the transformer, the aggregator, and (borrowed) the geo
/// resolver; the producer only reads input and pushes lines. The bounded
/// channel between them is the only cross-thread handoff.
pub async fn run_cycle(
    path: &Path,
    schema: &Schema,
    geo: &mut GeoDb,
    tunnel: &TunnelHandle,
) -> Result<CycleStats> {
    let (tx, rx) = bounded::<String>(source::QUEUE_CAPACITY);
    let done = Arc::new(AtomicBool::new(false));

    let producer = {
        let path = path.to_path_buf();
        let done = Arc::clone(&done);
        tokio::task::spawn_blocking(move || source::produce_file(&path, tx, &done))
    };

    let label = path.display().to_string();
    info!(path = %label, "cycle started");

    let mut worker = Worker {
        schema,
        geo,
        tunnel,
        transformer: Transformer::new(),
        aggregator: schema
            .aggregation
            .as_ref()
            .map(|agg| Aggregator::new(schema, agg, &label)),
        label,
        forwarded: 0,
    };

    worker.run(&rx, &done).await;

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, worker.drain())
        .await
        .is_ok();
    if !drained {
        warn!("drain timed out, abandoning unsent buffers");
    }

    let lines = producer
        .await
        .context("joining producer thread")?
        .context("producer failed")?;

    let stats = CycleStats {
        lines,
        handled: worker.handled(),
        buckets: worker.buckets(),
    };

    let percent = if stats.handled == 0 {
        0.0
    } else {
        stats.buckets as f64 * 100.0 / stats.handled as f64
    };
    info!(
        input = stats.lines,
        handle = stats.handled,
        aggregation = stats.buckets,
        percent,
        "cycle complete",
    );

    if !drained {
        anyhow::bail!("tunnel did not drain within {DRAIN_TIMEOUT:?}");
    }

    Ok(stats)
}

struct Worker<'a> {
    schema: &'a Schema,
    geo: &'a mut GeoDb,
    tunnel: &'a TunnelHandle,
    transformer: Transformer,
    aggregator: Option<Aggregator>,
    label: String,
    /// Plain-mode records forwarded.
    forwarded: u64,
}

impl Worker<'_> {
    /// The event loop: a repeating near-zero timer; each fire drains lines
    /// while the tunnel has headroom, until the producer is done and the
    /// queue is empty.
    async fn run(&mut self, rx: &Receiver<String>, done: &AtomicBool) {
        let mut tick = tokio::time::interval(TICK_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            if done.load(Ordering::Relaxed) && rx.is_empty() {
                return;
            }

            while self.tunnel.can_send() {
                match rx.try_recv() {
                    Ok(line) => self.handle_line(&line).await,
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let Some(tokens) = tokenize(line, self.schema.field_number, self.schema.time_index)
        else {
            warn!(path = %self.label, line, "bad log");
            return;
        };

        let Some(mut record) = self.transformer.transform(&tokens, self.schema, self.geo)
        else {
            warn!(path = %self.label, line, "json error");
            return;
        };

        match &mut self.aggregator {
            Some(aggregator) => {
                aggregator.insert(record);
            }
            None => {
                if !record.contains("path") {
                    record.set("path", Value::Str(self.label.clone()));
                }
                self.forwarded += 1;
                self.tunnel.send(record.to_ndjson()).await;
                return;
            }
        }

        self.flush_outbox().await;
    }

    /// Hands evicted buckets to the tunnel.
    async fn flush_outbox(&mut self) {
        let Some(aggregator) = &mut self.aggregator else {
            return;
        };
        for record in aggregator.take_outbox() {
            self.tunnel.send(record.to_ndjson()).await;
        }
    }

    /// Shutdown path: clear the aggregator (at most once per cycle), then
    /// wait until the tunnel confirms everything is on the wire.
    async fn drain(&mut self) {
        if let Some(aggregator) = &mut self.aggregator {
            aggregator.clear();
        }
        self.flush_outbox().await;

        while !self.tunnel.send_complete() {
            tokio::time::sleep(TICK_PERIOD).await;
        }
    }

    fn handled(&self) -> u64 {
        match &self.aggregator {
            Some(aggregator) => aggregator.records_out(),
            None => self.forwarded,
        }
    }

    fn buckets(&self) -> u64 {
        match &self.aggregator {
            Some(aggregator) => aggregator.buckets_out(),
            None => 0,
        }
    }
}
