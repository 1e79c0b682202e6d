// SPDX-License-Identifier: MIT
//! Cron timer trigger. Entries are classified once at registration into a
//! tick granularity (second / minute / hour) by inspecting the expression's
//! leading fields, so the agent arms only the tickers it needs and each tick
//! evaluates only the entries that can possibly fire at that resolution.
//!
//! Fire detection is windowed: a tick at `now` fires an entry when the
//! schedule has a time in `(anchor, now]`, where the anchor is the entry's
//! recorded last fire (or one granularity unit before `now` on the first
//! evaluation). Tracking the real last fire keeps a schedule from drifting
//! when ticks arrive late and from double-firing when they arrive early; a
//! gap spanning several scheduled times collapses into one dispatch at the
//! most recent of them.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;
use tracing::warn;

use crate::model::{TriggerEvent, TriggerKind};

use super::Dispatcher;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("invalid cron expression '{expr}': {source}")]
    BadExpression {
        expr: String,
        #[source]
        source: cron::error::Error,
    },
}

/// Tick resolution an external clock drives a cron entry at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Second,
    Minute,
    Hour,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Second, Granularity::Minute, Granularity::Hour];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
        }
    }

    /// One tick unit, the width of the first-evaluation fire window.
    pub fn unit(&self) -> chrono::Duration {
        match self {
            Granularity::Second => chrono::Duration::seconds(1),
            Granularity::Minute => chrono::Duration::minutes(1),
            Granularity::Hour => chrono::Duration::hours(1),
        }
    }

    /// Period of the internal ticker driving this granularity.
    pub fn tick_period(&self) -> std::time::Duration {
        match self {
            Granularity::Second => std::time::Duration::from_secs(1),
            Granularity::Minute => std::time::Duration::from_secs(60),
            Granularity::Hour => std::time::Duration::from_secs(3600),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies an expression by its seconds and minutes fields: an operator in
/// the seconds field means per-second firing; otherwise anything but a fixed
/// "0" minutes field means per-minute; otherwise per-hour.
pub fn infer_granularity(expr: &str) -> Granularity {
    let mut fields = expr.split_whitespace();
    let (Some(sec), Some(min)) = (fields.next(), fields.next()) else {
        return Granularity::Minute;
    };
    if sec.contains(['*', '/', ',', '-']) {
        return Granularity::Second;
    }
    if min != "0" {
        return Granularity::Minute;
    }
    Granularity::Hour
}

/// Parses an expression and infers its granularity in one step; registration
/// and `noded check` share this so both reject the same inputs.
pub fn compile(expr: &str) -> Result<(Schedule, Granularity), TimerError> {
    let schedule = Schedule::from_str(expr).map_err(|source| TimerError::BadExpression {
        expr: expr.to_string(),
        source,
    })?;
    Ok((schedule, infer_granularity(expr)))
}

struct TimerEntry {
    name: String,
    schedule: Schedule,
    granularity: Granularity,
    last_fire: Mutex<Option<DateTime<Utc>>>,
}

impl TimerEntry {
    /// The scheduled time this entry fired at within `(anchor, now]`, if any,
    /// recording it as the new anchor. The anchor is clamped to an hour so a
    /// long process suspension cannot trigger an unbounded schedule scan.
    fn due_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut last = self.last_fire.lock().unwrap_or_else(PoisonError::into_inner);
        let horizon = now - chrono::Duration::hours(1);
        let anchor = match *last {
            Some(t) => t.max(horizon),
            None => (now - self.granularity.unit()).max(horizon),
        };
        let fired = self
            .schedule
            .after(&anchor)
            .take_while(|t| *t <= now)
            .last();
        if let Some(t) = fired {
            *last = Some(t);
        }
        fired
    }
}

pub struct TimerTrigger {
    entries: RwLock<Vec<Arc<TimerEntry>>>,
    dispatcher: Arc<Dispatcher>,
}

impl TimerTrigger {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            dispatcher,
        }
    }

    /// Registers a cron entry, returning the granularity its ticks must be
    /// driven at. A bad expression fails registration and therefore startup.
    pub fn add_entry(&self, name: &str, expr: &str) -> Result<Granularity, TimerError> {
        let (schedule, granularity) = compile(expr)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(Arc::new(TimerEntry {
            name: name.to_string(),
            schedule,
            granularity,
            last_fire: Mutex::new(None),
        }));
        Ok(granularity)
    }

    /// Distinct granularities with at least one entry, for arming tickers.
    pub fn granularities(&self) -> Vec<Granularity> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Granularity::ALL
            .into_iter()
            .filter(|g| entries.iter().any(|e| e.granularity == *g))
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.len()
    }

    /// Evaluates every entry of the given granularity against `now` and
    /// dispatches the ones that fired. Handler failures are logged per entry
    /// and never stop evaluation of the rest; a slow handler delays this
    /// tick's remaining entries but never cancels them.
    pub async fn tick(&self, granularity: Granularity, now: DateTime<Utc>) {
        let due: Vec<Arc<TimerEntry>> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|e| e.granularity == granularity)
                .cloned()
                .collect()
        };

        for entry in due {
            let Some(fire_time) = entry.due_at(now) else {
                continue;
            };
            let mut event = TriggerEvent::new(TriggerKind::Timer, entry.name.clone());
            event
                .metadata
                .insert("granularity".into(), granularity.as_str().into());
            event
                .metadata
                .insert("fire_time".into(), fire_time.to_rfc3339());

            if let Err(e) = self.dispatcher.dispatch(event).await {
                warn!(trigger = %entry.name, "timer dispatch failed: {e:#}");
            }
        }
    }
}
