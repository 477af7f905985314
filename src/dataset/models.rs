use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest and highest valid contract price, in cents.
pub const MIN_PRICE: i64 = 1;
pub const MAX_PRICE: i64 = 99;
/// A yes contract and a no contract together always cost this many cents.
pub const PAYOUT_CENTS: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordViolation {
    #[error("{field} = {value} is outside 1..=99")]
    PriceOutOfRange { field: &'static str, value: i64 },

    #[error("yes_price {yes} + no_price {no} != 100")]
    PriceSum { yes: i64, no: i64 },

    #[error("{side} bid {bid} is above ask {ask}")]
    CrossedQuote { side: Side, bid: i64, ask: i64 },

    #[error("result {result} recorded on a market with status {status}")]
    ResultBeforeFinalized { status: MarketStatus, result: Side },

    #[error("trade count must be positive, got {0}")]
    NonPositiveCount(i64),

    #[error("{field} is null")]
    MissingValue { field: &'static str },

    #[error("unrecognized {field} value {value:?}")]
    UnknownValue { field: &'static str, value: String },

    #[error("{field} timestamp {value} is out of range")]
    BadTimestamp { field: &'static str, value: i64 },
}

/// Outcome side of a binary contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Yes => "yes",
            Side::No => "no",
        })
    }
}

impl FromStr for Side {
    type Err = RecordViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(Side::Yes),
            "no" => Ok(Side::No),
            _ => Err(RecordViolation::UnknownValue {
                field: "side",
                value: s.to_string(),
            }),
        }
    }
}

/// Parse a market result column: empty means unresolved.
pub fn parse_result(s: &str) -> Result<Option<Side>, RecordViolation> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed.parse().map(Some).map_err(|_| RecordViolation::UnknownValue {
        field: "result",
        value: s.to_string(),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Finalized,
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Finalized => "finalized",
        })
    }
}

impl FromStr for MarketStatus {
    type Err = RecordViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "active" | "initialized" => Ok(MarketStatus::Open),
            "closed" => Ok(MarketStatus::Closed),
            "finalized" | "settled" | "determined" => Ok(MarketStatus::Finalized),
            _ => Err(RecordViolation::UnknownValue {
                field: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// One contract, as stored in the `markets` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub ticker: String,
    pub event_ticker: String,
    pub title: String,
    pub status: MarketStatus,
    pub yes_bid: Option<i64>,
    pub yes_ask: Option<i64>,
    pub no_bid: Option<i64>,
    pub no_ask: Option<i64>,
    pub last_price: Option<i64>,
    pub volume: i64,
    pub volume_24h: i64,
    pub open_interest: i64,
    pub result: Option<Side>,
    pub created_time: Option<DateTime<Utc>>,
    pub open_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl Market {
    /// Check the quote and lifecycle invariants, reporting the first breach.
    pub fn check(&self) -> Result<(), RecordViolation> {
        for (field, value) in [
            ("yes_bid", self.yes_bid),
            ("yes_ask", self.yes_ask),
            ("no_bid", self.no_bid),
            ("no_ask", self.no_ask),
            ("last_price", self.last_price),
        ] {
            if let Some(value) = value {
                check_price(field, value)?;
            }
        }

        for (side, bid, ask) in [
            (Side::Yes, self.yes_bid, self.yes_ask),
            (Side::No, self.no_bid, self.no_ask),
        ] {
            if let (Some(bid), Some(ask)) = (bid, ask) {
                if bid > ask {
                    return Err(RecordViolation::CrossedQuote { side, bid, ask });
                }
            }
        }

        if let Some(result) = self.result {
            if self.status != MarketStatus::Finalized {
                return Err(RecordViolation::ResultBeforeFinalized {
                    status: self.status,
                    result,
                });
            }
        }

        Ok(())
    }
}

/// One execution, as stored in the `trades` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub ticker: String,
    pub count: i64,
    pub yes_price: i64,
    pub no_price: i64,
    pub taker_side: Side,
    pub created_time: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl Trade {
    pub fn check(&self) -> Result<(), RecordViolation> {
        if self.count <= 0 {
            return Err(RecordViolation::NonPositiveCount(self.count));
        }
        check_price("yes_price", self.yes_price)?;
        check_price("no_price", self.no_price)?;
        if self.yes_price + self.no_price != PAYOUT_CENTS {
            return Err(RecordViolation::PriceSum {
                yes: self.yes_price,
                no: self.no_price,
            });
        }
        Ok(())
    }

    /// Price paid by the taker, in cents.
    pub fn taker_price(&self) -> i64 {
        match self.taker_side {
            Side::Yes => self.yes_price,
            Side::No => self.no_price,
        }
    }
}

fn check_price(field: &'static str, value: i64) -> Result<(), RecordViolation> {
    if (MIN_PRICE..=MAX_PRICE).contains(&value) {
        Ok(())
    } else {
        Err(RecordViolation::PriceOutOfRange { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trade(yes: i64, no: i64) -> Trade {
        Trade {
            trade_id: "t-1".to_string(),
            ticker: "KXBTC-24DEC31-B100000".to_string(),
            count: 10,
            yes_price: yes,
            no_price: no,
            taker_side: Side::Yes,
            created_time: Utc.with_ymd_and_hms(2024, 12, 1, 9, 30, 0).unwrap(),
            fetched_at: None,
        }
    }

    fn market(status: MarketStatus, result: Option<Side>) -> Market {
        Market {
            ticker: "KXBTC-24DEC31-B100000".to_string(),
            event_ticker: "KXBTC-24DEC31".to_string(),
            title: "Bitcoin above 100k?".to_string(),
            status,
            yes_bid: Some(40),
            yes_ask: Some(42),
            no_bid: Some(58),
            no_ask: Some(60),
            last_price: Some(41),
            volume: 1_200,
            volume_24h: 300,
            open_interest: 800,
            result,
            created_time: None,
            open_time: None,
            close_time: None,
            fetched_at: None,
        }
    }

    #[test]
    fn trade_prices_sum_to_payout() {
        assert!(trade(37, 63).check().is_ok());
        assert_eq!(
            trade(37, 62).check(),
            Err(RecordViolation::PriceSum { yes: 37, no: 62 })
        );
        assert_eq!(
            trade(100, 0).check(),
            Err(RecordViolation::PriceOutOfRange {
                field: "yes_price",
                value: 100
            })
        );
    }

    #[test]
    fn trade_count_must_be_positive() {
        let mut t = trade(50, 50);
        t.count = 0;
        assert_eq!(t.check(), Err(RecordViolation::NonPositiveCount(0)));
    }

    #[test]
    fn taker_price_follows_side() {
        let mut t = trade(30, 70);
        assert_eq!(t.taker_price(), 30);
        t.taker_side = Side::No;
        assert_eq!(t.taker_price(), 70);
    }

    #[test]
    fn market_quotes_must_not_cross() {
        assert!(market(MarketStatus::Open, None).check().is_ok());

        let mut m = market(MarketStatus::Open, None);
        m.yes_bid = Some(45);
        assert_eq!(
            m.check(),
            Err(RecordViolation::CrossedQuote {
                side: Side::Yes,
                bid: 45,
                ask: 42
            })
        );

        let mut one_sided = market(MarketStatus::Open, None);
        one_sided.no_ask = None;
        one_sided.no_bid = Some(99);
        assert!(one_sided.check().is_ok());
    }

    #[test]
    fn result_requires_finalized_status() {
        assert!(market(MarketStatus::Finalized, Some(Side::No)).check().is_ok());
        assert_eq!(
            market(MarketStatus::Closed, Some(Side::Yes)).check(),
            Err(RecordViolation::ResultBeforeFinalized {
                status: MarketStatus::Closed,
                result: Side::Yes
            })
        );
    }

    #[test]
    fn parses_status_and_result_columns() {
        assert_eq!("active".parse::<MarketStatus>(), Ok(MarketStatus::Open));
        assert_eq!("Finalized".parse::<MarketStatus>(), Ok(MarketStatus::Finalized));
        assert!("paused".parse::<MarketStatus>().is_err());

        assert_eq!(parse_result(""), Ok(None));
        assert_eq!(parse_result("yes"), Ok(Some(Side::Yes)));
        assert!(matches!(
            parse_result("void"),
            Err(RecordViolation::UnknownValue { field: "result", .. })
        ));
    }
}
