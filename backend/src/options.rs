// =============================================================================
// Options Chains — expiry selection for the options-chain command
// =============================================================================
//
// Adapters return every expiry they know about inside the requested window,
// per side.  Viewers get exactly one expiry: the earliest one quoted on both
// the call and the put side.  An empty side is an error, not an empty answer.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub symbol: String,
    pub strike: f64,
    pub expiration: NaiveDate,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub last: f64,
    #[serde(default)]
    pub volume: u64,
    #[serde(default)]
    pub open_interest: u64,
    #[serde(default)]
    pub delta: Option<f64>,
}

/// Raw chain as delivered by an adapter: contracts per expiry, per side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpiryChains {
    pub calls: BTreeMap<NaiveDate, Vec<OptionContract>>,
    pub puts: BTreeMap<NaiveDate, Vec<OptionContract>>,
}

/// Parameters of an options-chain request.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionsQuery {
    pub symbol: String,
    pub strike_count: u32,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// The single-expiry chain answered to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionsChain {
    pub symbol: String,
    pub expiration: NaiveDate,
    pub calls: Vec<OptionContract>,
    pub puts: Vec<OptionContract>,
}

/// Default expiry window: two days out, through the following Friday.
pub fn default_expiry_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = today + Duration::days(2);
    let weekday = i64::from(start.weekday().num_days_from_monday());
    let until_friday = (4 - weekday).rem_euclid(7);
    (start, start + Duration::days(until_friday))
}

/// Pick the earliest expiry present on both sides, strikes ascending.
pub fn select_single_expiry(symbol: &str, raw: ExpiryChains) -> Result<OptionsChain, PipelineError> {
    let ExpiryChains { mut calls, mut puts } = raw;
    if calls.values().all(Vec::is_empty) {
        return Err(PipelineError::EmptyOptionsChain {
            symbol: symbol.to_string(),
            side: "calls",
        });
    }
    if puts.values().all(Vec::is_empty) {
        return Err(PipelineError::EmptyOptionsChain {
            symbol: symbol.to_string(),
            side: "puts",
        });
    }

    let expiration = calls
        .iter()
        .filter(|(_, c)| !c.is_empty())
        .map(|(day, _)| *day)
        .find(|day| puts.get(day).is_some_and(|p| !p.is_empty()))
        .ok_or_else(|| PipelineError::EmptyOptionsChain {
            symbol: symbol.to_string(),
            side: "matching expiry",
        })?;

    let mut calls = calls.remove(&expiration).unwrap_or_default();
    let mut puts = puts.remove(&expiration).unwrap_or_default();
    calls.sort_by(|a, b| a.strike.total_cmp(&b.strike));
    puts.sort_by(|a, b| a.strike.total_cmp(&b.strike));

    Ok(OptionsChain {
        symbol: symbol.to_string(),
        expiration,
        calls,
        puts,
    })
}
