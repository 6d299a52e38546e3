//! Registry of running pipelines.
//!
//! Every configured (symbol, timeframe) pipeline is moved into its own Tokio task that owns it
//! exclusively. Ticks and snapshot requests reach a pipeline through its command channel, so a
//! snapshot always observes the state between two ticks. Events from every pipeline are
//! published on a single broadcast channel.

use crate::{
    config::EngineConfig,
    error::EngineError,
    event::{EngineEvent, HistorySnapshot},
    pipeline::Pipeline,
    store::{CandleStore, FileCandleStore, MemoryCandleStore},
    tick::Tick,
    timeframe::Timeframe,
};
use fnv::FnvHashMap;
use smol_str::SmolStr;
use std::path::Path;
use tokio::{
    sync::{broadcast, mpsc, mpsc::error::TrySendError, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

#[derive(Debug)]
enum Command {
    Tick(Tick),
    Snapshot(oneshot::Sender<HistorySnapshot>),
}

#[derive(Debug, Clone)]
struct PipelineHandle {
    timeframe: Timeframe,
    tx: mpsc::Sender<Command>,
}

#[derive(Debug)]
pub struct EngineRegistry {
    pipelines: FnvHashMap<SmolStr, Vec<PipelineHandle>>,
    event_tx: broadcast::Sender<EngineEvent>,
    workers: Vec<JoinHandle<()>>,
}

impl EngineRegistry {
    /// Restore and start one worker per configured pipeline, persisting to
    /// `<data_dir>/<symbol>_<timeframe>.csv` or in memory when no data directory is configured.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn init(config: &EngineConfig) -> Result<Self, EngineError> {
        let data_dir = config.data_dir.clone();
        Self::init_with_stores(config, move |symbol, timeframe| {
            default_store(data_dir.as_deref(), symbol, timeframe)
        })
    }

    /// As [`EngineRegistry::init`], with the [`CandleStore`] of each pipeline built by `stores`.
    pub fn init_with_stores<F>(config: &EngineConfig, stores: F) -> Result<Self, EngineError>
    where
        F: Fn(&str, Timeframe) -> Box<dyn CandleStore>,
    {
        let (event_tx, _) = broadcast::channel(config.event_buffer_size.max(1));
        let mut pipelines = FnvHashMap::<SmolStr, Vec<PipelineHandle>>::default();
        let mut workers = Vec::with_capacity(config.symbols.len() * config.timeframes.len());

        for symbol in &config.symbols {
            for timeframe in &config.timeframes {
                let mut pipeline = Pipeline::new(
                    symbol.clone(),
                    *timeframe,
                    &config.analysis,
                    stores(symbol, *timeframe),
                );
                pipeline.restore()?;

                let (tx, rx) = mpsc::channel(config.command_buffer_size.max(1));
                workers.push(tokio::spawn(run_pipeline(pipeline, rx, event_tx.clone())));

                pipelines
                    .entry(symbol.clone())
                    .or_default()
                    .push(PipelineHandle {
                        timeframe: *timeframe,
                        tx,
                    });
            }
        }

        info!(
            symbols = ?config.symbols,
            timeframes = ?config.timeframes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            pipelines = workers.len(),
            "engine registry started"
        );

        Ok(Self {
            pipelines,
            event_tx,
            workers,
        })
    }

    /// Subscribe to the events of every pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Route a tick to every timeframe pipeline of its symbol, returning the number of pipelines
    /// it was delivered to. Ticks for unconfigured symbols are dropped.
    ///
    /// Never waits on a worker: a pipeline whose command queue is full drops the tick, so one
    /// stalled pipeline cannot hold back the others.
    pub fn dispatch(&self, tick: Tick) -> usize {
        let Some(handles) = self.pipelines.get(&tick.symbol) else {
            debug!(symbol = %tick.symbol, "dropping tick for unconfigured symbol");
            return 0;
        };

        let mut delivered = 0;
        for handle in handles {
            match handle.tx.try_send(Command::Tick(tick.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => warn!(
                    symbol = %tick.symbol,
                    timeframe = %handle.timeframe,
                    "pipeline command queue full, tick dropped"
                ),
                Err(TrySendError::Closed(_)) => warn!(
                    symbol = %tick.symbol,
                    timeframe = %handle.timeframe,
                    "pipeline worker has shut down, tick dropped"
                ),
            }
        }
        delivered
    }

    /// Consistent snapshot of one pipeline, served in order with its ticks.
    pub async fn snapshot(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<HistorySnapshot, EngineError> {
        let symbol = SmolStr::new(symbol.trim().to_ascii_lowercase());

        let handle = self
            .pipelines
            .get(&symbol)
            .and_then(|handles| handles.iter().find(|handle| handle.timeframe == timeframe))
            .ok_or_else(|| EngineError::UnknownPipeline {
                symbol: symbol.clone(),
                timeframe,
            })?;

        let closed = || EngineError::PipelineClosed {
            symbol: symbol.clone(),
            timeframe,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .tx
            .send(Command::Snapshot(reply_tx))
            .await
            .map_err(|_| closed())?;

        reply_rx.await.map_err(|_| closed())
    }

    /// Every registered (symbol, timeframe) pair.
    pub fn keys(&self) -> Vec<(SmolStr, Timeframe)> {
        self.pipelines
            .iter()
            .flat_map(|(symbol, handles)| {
                handles
                    .iter()
                    .map(move |handle| (symbol.clone(), handle.timeframe))
            })
            .collect()
    }

    /// Stop accepting commands and wait for every worker to drain its queue.
    pub async fn shutdown(self) {
        let Self {
            pipelines, workers, ..
        } = self;
        drop(pipelines);

        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "pipeline worker terminated abnormally");
            }
        }
        info!("engine registry stopped");
    }
}

fn default_store(
    data_dir: Option<&Path>,
    symbol: &str,
    timeframe: Timeframe,
) -> Box<dyn CandleStore> {
    match data_dir {
        Some(dir) => Box::new(FileCandleStore::for_pipeline(dir, symbol, timeframe)),
        None => Box::new(MemoryCandleStore::new()),
    }
}

async fn run_pipeline(
    mut pipeline: Pipeline,
    mut rx: mpsc::Receiver<Command>,
    event_tx: broadcast::Sender<EngineEvent>,
) {
    let (symbol, timeframe) = (pipeline.symbol().clone(), pipeline.timeframe());
    debug!(%symbol, %timeframe, "pipeline worker started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Tick(tick) => {
                for event in pipeline.on_tick(&tick) {
                    // No subscribers is not an error
                    let _ = event_tx.send(event);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(pipeline.snapshot());
            }
        }
    }

    debug!(%symbol, %timeframe, "pipeline worker stopped");
}
