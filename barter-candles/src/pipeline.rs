//! Per (symbol, timeframe) processing pipeline.
//!
//! A [`Pipeline`] exclusively owns the candle aggregator, finalized history, structure engine,
//! divergence detector and candle store of one market/timeframe pair. It is a plain sequential
//! state machine: feed it ticks via [`Pipeline::on_tick`] and forward the returned events.

use crate::{
    candle::{Candle, CandleAggregator, HistoryBuffer, TickOutcome},
    config::AnalysisConfig,
    divergence::DivergenceDetector,
    error::EngineError,
    event::{EngineEvent, EngineEventKind, HistorySnapshot},
    indicator::{IndicatorSet, IndicatorValues, ema_series, rsi_series},
    store::{CandleRecord, CandleStore},
    structure::StructureEngine,
    tick::Tick,
    timeframe::Timeframe,
};
use smol_str::SmolStr;
use tracing::{debug, error, info, warn};

pub struct Pipeline {
    symbol: SmolStr,
    timeframe: Timeframe,
    config: AnalysisConfig,
    aggregator: CandleAggregator,
    history: HistoryBuffer,
    structure: StructureEngine,
    divergence: DivergenceDetector,
    store: Box<dyn CandleStore>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("symbol", &self.symbol)
            .field("timeframe", &self.timeframe)
            .field("history", &self.history.len())
            .field("live", &self.aggregator.live())
            .field("trend", &self.structure.trend())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        symbol: SmolStr,
        timeframe: Timeframe,
        config: &AnalysisConfig,
        store: Box<dyn CandleStore>,
    ) -> Self {
        Self {
            aggregator: CandleAggregator::new(symbol.clone(), timeframe, indicator_set(config)),
            history: HistoryBuffer::new(config.history_capacity),
            structure: structure_engine(config),
            divergence: DivergenceDetector::new(config.divergence_lookback, config.marker_memory),
            symbol,
            timeframe,
            config: config.clone(),
            store,
        }
    }

    /// Rebuild state from the persisted candle log.
    ///
    /// Loads every record, keeps the most recent `history_capacity`, recomputes indicators over
    /// the kept window and replays structure and divergence detection candle by candle. Returns
    /// the number of candles restored. Any state accumulated before the call is discarded.
    pub fn restore(&mut self) -> Result<usize, EngineError> {
        let mut records = self
            .store
            .load()?
            .into_iter()
            .filter(|record| {
                let aligned = self.timeframe.align(record.start_time) == record.start_time;
                if !aligned {
                    warn!(
                        symbol = %self.symbol,
                        timeframe = %self.timeframe,
                        start_time = record.start_time,
                        "skipping persisted candle not aligned to timeframe"
                    );
                }
                aligned
            })
            .collect::<Vec<_>>();

        let capacity = self.config.history_capacity.max(1);
        if records.len() > capacity {
            records.drain(..records.len() - capacity);
        }

        let closes = records.iter().map(|record| record.close).collect::<Vec<_>>();
        let rsi = rsi_series(&closes, self.config.rsi_period);
        let ema_fast = ema_series(&closes, self.config.ema_fast);
        let ema_slow = ema_series(&closes, self.config.ema_slow);

        let mut indicators = indicator_set(&self.config);
        for close in &closes {
            indicators.push(*close);
        }

        self.history = HistoryBuffer::new(capacity);
        self.structure = structure_engine(&self.config);
        self.divergence =
            DivergenceDetector::new(self.config.divergence_lookback, self.config.marker_memory);

        for (index, record) in records.iter().enumerate() {
            let values = IndicatorValues {
                rsi: rsi[index],
                ema_fast: ema_fast[index],
                ema_slow: ema_slow[index],
            };

            // Intra-candle path is unknown, so mitigation uses the whole range before the close
            let candle = self.candle_from_record(record, values);
            self.structure.mitigate_range(record.low, record.high);
            self.history.push(candle);
            self.structure.on_close(&self.history);
            self.divergence.on_close(&self.history);
        }

        let last_finalized = records.last().map(|record| record.start_time);
        self.aggregator.resume(indicators, last_finalized);

        info!(
            symbol = %self.symbol,
            timeframe = %self.timeframe,
            candles = records.len(),
            levels = self.structure.active_levels().len(),
            trend = %self.structure.trend(),
            "restored pipeline from candle log"
        );

        Ok(records.len())
    }

    /// Process one trade tick and return the resulting events in emission order.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        if tick.symbol != self.symbol {
            warn!(
                pipeline = %self.symbol,
                tick = %tick.symbol,
                "ignoring tick routed to the wrong pipeline"
            );
            return events;
        }

        match self
            .aggregator
            .update(tick.price, tick.quantity, tick.second())
        {
            TickOutcome::Stale => {
                debug!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    time_ms = tick.time_ms,
                    "dropping stale tick"
                );
                return events;
            }
            TickOutcome::Rolled(closed) => self.finalize(closed, &mut events),
            TickOutcome::Opened | TickOutcome::Updated => {}
        }

        let retired = self.structure.mitigate(tick.price);
        if !retired.is_empty() {
            events.push(self.event(EngineEventKind::StructureRemove { ids: retired }));
        }

        if let Some(live) = self.aggregator.live() {
            events.push(self.event(EngineEventKind::TickUpdate(live.clone())));
        }

        events
    }

    /// Closing sequence for a candle the aggregator just finalized.
    fn finalize(&mut self, closed: Candle, events: &mut Vec<EngineEvent>) {
        debug!(timeframe = %self.timeframe, "{} {closed}", self.symbol);

        self.history.push(closed.clone());

        if let Err(error) = self.store.append(&closed) {
            error!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                start_time = closed.start_time,
                %error,
                "failed to persist finalized candle"
            );
        }

        let update = self.structure.on_close(&self.history);
        let markers = self.divergence.on_close(&self.history);

        events.push(self.event(EngineEventKind::Closed(closed)));
        events.extend(
            update
                .added
                .into_iter()
                .map(|level| self.event(EngineEventKind::StructureAdd(level))),
        );
        if !update.evicted.is_empty() {
            events.push(self.event(EngineEventKind::StructureRemove {
                ids: update.evicted,
            }));
        }
        events.extend(update.breaks.into_iter().map(|structure_break| {
            self.event(EngineEventKind::StructureBreak(structure_break))
        }));
        events.extend(
            markers
                .into_iter()
                .map(|marker| self.event(EngineEventKind::DivergenceNew(marker))),
        );
    }

    /// Point-in-time copy of the pipeline state.
    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            candles: self.history.to_vec(),
            live: self.aggregator.live().cloned(),
            levels: self.structure.active_levels(),
            breaks: self.structure.recent_breaks(),
            divergences: self.divergence.markers(),
        }
    }

    pub fn symbol(&self) -> &SmolStr {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn live(&self) -> Option<&Candle> {
        self.aggregator.live()
    }

    pub fn structure(&self) -> &StructureEngine {
        &self.structure
    }

    pub fn divergence(&self) -> &DivergenceDetector {
        &self.divergence
    }

    fn event(&self, kind: EngineEventKind) -> EngineEvent {
        EngineEvent::new(self.symbol.clone(), self.timeframe, kind)
    }

    fn candle_from_record(&self, record: &CandleRecord, values: IndicatorValues) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            start_time: record.start_time,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
            rsi: values.rsi,
            ema_fast: values.ema_fast,
            ema_slow: values.ema_slow,
        }
    }
}

fn indicator_set(config: &AnalysisConfig) -> IndicatorSet {
    IndicatorSet::new(config.rsi_period, config.ema_fast, config.ema_slow)
}

fn structure_engine(config: &AnalysisConfig) -> StructureEngine {
    StructureEngine::new(config.order_block_lookback, config.break_memory)
        .with_max_active_levels(config.max_active_levels)
}
