//! Market structure tracking.
//!
//! Consumes the finalized candle sequence of one pipeline and maintains:
//! - the prevailing [`Trend`] plus the last confirmed swing high/low used as break references
//! - break classification (BOS when the break continues the trend, CHoCH when it reverses it)
//! - order blocks located behind each break
//! - the active set of unmitigated [`StructureLevel`]s, retired as soon as price crosses them
//!
//! Per close the evaluation order is fixed: pivot confirmation, break classification, order
//! block search.

use crate::{
    candle::{Candle, HistoryBuffer},
    pivot::{Pivot, PivotKind, confirmed_pivots},
};
use derive_more::Display;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Unique (per pipeline) identifier of a [`StructureLevel`].
pub type LevelId = u64;

/// Default bound of the active level set.
pub const DEFAULT_MAX_ACTIVE_LEVELS: usize = 500;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Display, Deserialize, Serialize)]
pub enum Trend {
    Bull,
    Bear,
    #[default]
    Unknown,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum LevelKind {
    SwingHigh,
    SwingLow,
    BullOrderBlock,
    BearOrderBlock,
}

/// Structure level in the active set. Swing levels have `top == bottom`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StructureLevel {
    pub id: LevelId,
    pub kind: LevelKind,
    pub top: f64,
    pub bottom: f64,
    /// Start time of the candle the level was derived from.
    pub created_at: i64,
}

impl StructureLevel {
    /// Whether a traded price range `[low, high]` crosses beyond this level.
    fn is_mitigated_by(&self, low: f64, high: f64) -> bool {
        match self.kind {
            LevelKind::SwingHigh => high > self.top,
            LevelKind::SwingLow => low < self.bottom,
            LevelKind::BullOrderBlock => low < self.bottom,
            LevelKind::BearOrderBlock => high > self.top,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum BreakKind {
    /// Break of structure, continuing the trend.
    Bos,
    /// Change of character, reversing the trend.
    Choch,
}

/// A close beyond the reference swing level.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StructureBreak {
    /// Start time of the breaking candle.
    pub time: i64,
    pub kind: BreakKind,
    pub direction: Trend,
    /// Price of the broken reference swing.
    pub level: f64,
    pub close: f64,
}

/// Reference swing used for break detection.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct SwingRef {
    pub price: f64,
    pub time: i64,
    /// Set once a close has broken this swing, so it cannot break again until a new pivot
    /// replaces it.
    pub broken: bool,
}

/// Output of [`StructureEngine::on_close`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructureUpdate {
    pub added: Vec<StructureLevel>,
    pub breaks: Vec<StructureBreak>,
    /// Oldest levels evicted to keep the active set within its bound.
    pub evicted: Vec<LevelId>,
}

#[derive(Debug, Clone)]
pub struct StructureEngine {
    trend: Trend,
    last_high: Option<SwingRef>,
    last_low: Option<SwingRef>,
    active: IndexMap<LevelId, StructureLevel>,
    recent_breaks: VecDeque<StructureBreak>,
    next_id: LevelId,
    order_block_lookback: usize,
    break_memory: usize,
    max_active_levels: usize,
}

impl StructureEngine {
    pub fn new(order_block_lookback: usize, break_memory: usize) -> Self {
        Self {
            trend: Trend::Unknown,
            last_high: None,
            last_low: None,
            active: IndexMap::new(),
            recent_breaks: VecDeque::with_capacity(break_memory),
            next_id: 1,
            order_block_lookback,
            break_memory: break_memory.max(1),
            max_active_levels: DEFAULT_MAX_ACTIVE_LEVELS,
        }
    }

    /// Bound the active level set, so per tick mitigation scans stay short in long trends.
    pub fn with_max_active_levels(mut self, max: usize) -> Self {
        self.max_active_levels = max.max(1);
        self
    }

    /// Process the newest finalized candle (the last entry of `history`).
    pub fn on_close(&mut self, history: &HistoryBuffer) -> StructureUpdate {
        let mut update = StructureUpdate::default();
        let Some(closed) = history.last() else {
            return update;
        };

        for pivot in confirmed_pivots(history) {
            self.register_pivot(pivot, &mut update);
        }

        if let Some(high) = self.last_high.as_mut()
            && !high.broken
            && closed.close > high.price
        {
            high.broken = true;
            let level = high.price;
            self.register_break(Trend::Bull, level, closed, history, &mut update);
        }

        if let Some(low) = self.last_low.as_mut()
            && !low.broken
            && closed.close < low.price
        {
            low.broken = true;
            let level = low.price;
            self.register_break(Trend::Bear, level, closed, history, &mut update);
        }

        update.evicted = self.evict_oldest();
        update
    }

    /// Retire every active level crossed by a single trade price.
    pub fn mitigate(&mut self, price: f64) -> Vec<LevelId> {
        self.mitigate_range(price, price)
    }

    /// Retire every active level crossed by the traded range `[low, high]`.
    pub fn mitigate_range(&mut self, low: f64, high: f64) -> Vec<LevelId> {
        let retired = self
            .active
            .values()
            .filter(|level| level.is_mitigated_by(low, high))
            .map(|level| level.id)
            .collect::<Vec<_>>();

        for id in &retired {
            self.active.shift_remove(id);
        }

        if !retired.is_empty() {
            debug!(?retired, low, high, "structure levels mitigated");
        }

        retired
    }

    fn evict_oldest(&mut self) -> Vec<LevelId> {
        let excess = self.active.len().saturating_sub(self.max_active_levels);
        let evicted = self
            .active
            .drain(..excess)
            .map(|(id, _)| id)
            .collect::<Vec<_>>();

        if !evicted.is_empty() {
            debug!(?evicted, "active level bound reached, evicted oldest levels");
        }
        evicted
    }

    fn register_pivot(&mut self, pivot: Pivot, update: &mut StructureUpdate) {
        let swing = SwingRef {
            price: pivot.price,
            time: pivot.time,
            broken: false,
        };

        let kind = match pivot.kind {
            PivotKind::High => {
                self.last_high = Some(swing);
                LevelKind::SwingHigh
            }
            PivotKind::Low => {
                self.last_low = Some(swing);
                LevelKind::SwingLow
            }
        };

        let level = self.insert_level(kind, pivot.price, pivot.price, pivot.time);
        update.added.push(level);
    }

    fn register_break(
        &mut self,
        direction: Trend,
        level: f64,
        closed: &Candle,
        history: &HistoryBuffer,
        update: &mut StructureUpdate,
    ) {
        let kind = if self.trend == direction {
            BreakKind::Bos
        } else {
            BreakKind::Choch
        };
        self.trend = direction;

        let structure_break = StructureBreak {
            time: closed.start_time,
            kind,
            direction,
            level,
            close: closed.close,
        };
        debug!(?structure_break, "structure break");

        if self.recent_breaks.len() >= self.break_memory {
            self.recent_breaks.pop_front();
        }
        self.recent_breaks.push_back(structure_break.clone());
        update.breaks.push(structure_break);

        if let Some(order_block) = self.find_order_block(direction, history) {
            update.added.push(order_block);
        }
    }

    /// Scan backwards from the candle before the breaking candle for the nearest opposite
    /// direction candle.
    fn find_order_block(
        &mut self,
        direction: Trend,
        history: &HistoryBuffer,
    ) -> Option<StructureLevel> {
        let (kind, is_opposite): (LevelKind, fn(&Candle) -> bool) = match direction {
            Trend::Bull => (LevelKind::BullOrderBlock, Candle::is_bearish),
            Trend::Bear => (LevelKind::BearOrderBlock, Candle::is_bullish),
            Trend::Unknown => return None,
        };

        let source = history
            .iter()
            .rev()
            .skip(1)
            .take(self.order_block_lookback)
            .find(|candle| is_opposite(candle))?;

        let duplicate = self
            .active
            .values()
            .any(|level| level.kind == kind && level.created_at == source.start_time);
        if duplicate {
            return None;
        }

        let (top, bottom, created_at) = (source.high, source.low, source.start_time);
        Some(self.insert_level(kind, top, bottom, created_at))
    }

    fn insert_level(
        &mut self,
        kind: LevelKind,
        top: f64,
        bottom: f64,
        created_at: i64,
    ) -> StructureLevel {
        let level = StructureLevel {
            id: self.next_id,
            kind,
            top,
            bottom,
            created_at,
        };
        self.next_id += 1;
        self.active.insert(level.id, level.clone());
        level
    }

    pub fn trend(&self) -> Trend {
        self.trend
    }

    pub fn last_high(&self) -> Option<SwingRef> {
        self.last_high
    }

    pub fn last_low(&self) -> Option<SwingRef> {
        self.last_low
    }

    /// Active levels in creation order.
    pub fn active_levels(&self) -> Vec<StructureLevel> {
        self.active.values().cloned().collect()
    }

    pub fn recent_breaks(&self) -> Vec<StructureBreak> {
        self.recent_breaks.iter().cloned().collect()
    }
}
