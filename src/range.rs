//! Sorted-set range addressing: by rank, by score interval, or by lexicographic interval.
//!
//! A [`ZRangeQuery`] is validated on the client before anything is sent and
//! compiled to a SQL filter by the store. Listing and removal share the same
//! bound semantics.

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

/// Addressing mode selector for the string-form constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeBy {
    Rank,
    Score,
    Lex,
}

impl RangeBy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rank" => Ok(RangeBy::Rank),
            "score" => Ok(RangeBy::Score),
            "lex" => Ok(RangeBy::Lex),
            other => Err(KvError::InvalidArgument(format!(
                "unknown range mode '{}'",
                other
            ))),
        }
    }
}

/// One end of a score interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScoreBound {
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    /// Parse `1.5`, `(1.5`, `-inf`, `+inf` / `inf`.
    pub fn parse(s: &str) -> Result<Self> {
        let (exclusive, body) = match s.strip_prefix('(') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let value = match body.to_ascii_lowercase().as_str() {
            "-inf" => f64::NEG_INFINITY,
            "+inf" | "inf" => f64::INFINITY,
            other => other.parse::<f64>().map_err(|_| {
                KvError::InvalidArgument(format!("min or max is not a float: '{}'", s))
            })?,
        };
        if value.is_nan() {
            return Err(KvError::InvalidArgument("score bound is NaN".to_string()));
        }
        Ok(if exclusive {
            ScoreBound::Exclusive(value)
        } else {
            ScoreBound::Inclusive(value)
        })
    }

    pub fn value(&self) -> f64 {
        match self {
            ScoreBound::Inclusive(v) | ScoreBound::Exclusive(v) => *v,
        }
    }
}

/// One end of a lexicographic interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LexBound {
    Inclusive(String),
    Exclusive(String),
    /// `-`: smaller than every member.
    Min,
    /// `+`: greater than every member.
    Max,
}

impl LexBound {
    /// Parse `[member`, `(member`, `-` or `+`.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "-" => Ok(LexBound::Min),
            "+" => Ok(LexBound::Max),
            _ => {
                if let Some(rest) = s.strip_prefix('[') {
                    Ok(LexBound::Inclusive(rest.to_string()))
                } else if let Some(rest) = s.strip_prefix('(') {
                    Ok(LexBound::Exclusive(rest.to_string()))
                } else {
                    Err(KvError::InvalidArgument(format!(
                        "min or max not valid string range item: '{}'",
                        s
                    )))
                }
            }
        }
    }
}

/// The interval a range operation selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ZBounds {
    /// Positional indices; negative values count from the end (-1 is the last member).
    Rank { start: i64, stop: i64 },
    Score { min: ScoreBound, max: ScoreBound },
    Lex { min: LexBound, max: LexBound },
}

impl ZBounds {
    /// Build bounds from their string form for the given mode.
    pub fn parse(by: RangeBy, start: &str, stop: &str) -> Result<Self> {
        match by {
            RangeBy::Rank => {
                let parse = |s: &str| {
                    s.parse::<i64>().map_err(|_| {
                        KvError::InvalidArgument(format!("rank is not an integer: '{}'", s))
                    })
                };
                Ok(ZBounds::Rank {
                    start: parse(start)?,
                    stop: parse(stop)?,
                })
            }
            RangeBy::Score => Ok(ZBounds::Score {
                min: ScoreBound::parse(start)?,
                max: ScoreBound::parse(stop)?,
            }),
            RangeBy::Lex => Ok(ZBounds::Lex {
                min: LexBound::parse(start)?,
                max: LexBound::parse(stop)?,
            }),
        }
    }

    pub fn mode(&self) -> RangeBy {
        match self {
            ZBounds::Rank { .. } => RangeBy::Rank,
            ZBounds::Score { .. } => RangeBy::Score,
            ZBounds::Lex { .. } => RangeBy::Lex,
        }
    }

    /// SQL predicate over the `zsets` table for score and lex bounds.
    ///
    /// Rank bounds select by position and have no predicate; the store
    /// resolves them against the cardinality with [`normalize_rank`].
    pub(crate) fn sql_filter(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        match self {
            ZBounds::Rank { .. } => {}
            ZBounds::Score { min, max } => {
                clauses.push(match min {
                    ScoreBound::Inclusive(_) => "score >= ?",
                    ScoreBound::Exclusive(_) => "score > ?",
                });
                params.push(SqlValue::Real(min.value()));
                clauses.push(match max {
                    ScoreBound::Inclusive(_) => "score <= ?",
                    ScoreBound::Exclusive(_) => "score < ?",
                });
                params.push(SqlValue::Real(max.value()));
            }
            ZBounds::Lex { min, max } => {
                match min {
                    LexBound::Inclusive(m) => {
                        clauses.push("member >= ?");
                        params.push(SqlValue::Text(m.clone()));
                    }
                    LexBound::Exclusive(m) => {
                        clauses.push("member > ?");
                        params.push(SqlValue::Text(m.clone()));
                    }
                    LexBound::Min => {}
                    // Nothing is greater than "+" so nothing can follow it.
                    LexBound::Max => clauses.push("0"),
                }
                match max {
                    LexBound::Inclusive(m) => {
                        clauses.push("member <= ?");
                        params.push(SqlValue::Text(m.clone()));
                    }
                    LexBound::Exclusive(m) => {
                        clauses.push("member < ?");
                        params.push(SqlValue::Text(m.clone()));
                    }
                    LexBound::Max => {}
                    LexBound::Min => clauses.push("0"),
                }
            }
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" AND {}", clauses.join(" AND "))
        };
        (sql, params)
    }
}

/// Pagination window applied after bound filtering: `result[offset..offset + count]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub offset: i64,
    /// A negative count means "everything after `offset`".
    pub count: i64,
}

/// A complete ZRANGE request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZRangeQuery {
    pub bounds: ZBounds,
    /// Descending order. Bounds keep their meaning; only the order flips.
    pub reverse: bool,
    pub limit: Option<Limit>,
}

impl ZRangeQuery {
    pub fn new(bounds: ZBounds) -> Self {
        Self {
            bounds,
            reverse: false,
            limit: None,
        }
    }

    pub fn by_rank(start: i64, stop: i64) -> Self {
        Self::new(ZBounds::Rank { start, stop })
    }

    /// Closed score interval `[min, max]`.
    pub fn by_score(min: f64, max: f64) -> Self {
        Self::new(ZBounds::Score {
            min: ScoreBound::Inclusive(min),
            max: ScoreBound::Inclusive(max),
        })
    }

    /// Lex interval from its string form, e.g. `by_lex("[beta", "(delta")`.
    pub fn by_lex(min: &str, max: &str) -> Result<Self> {
        Ok(Self::new(ZBounds::parse(RangeBy::Lex, min, max)?))
    }

    pub fn rev(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limit(mut self, offset: i64, count: i64) -> Self {
        self.limit = Some(Limit { offset, count });
        self
    }

    /// Reject contradictory descriptors before they reach the store.
    ///
    /// LIMIT is only accepted for score and lex ranges.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = &self.limit {
            if self.bounds.mode() == RangeBy::Rank {
                return Err(KvError::InvalidArgument(
                    "LIMIT is only supported in combination with either BYSCORE or BYLEX"
                        .to_string(),
                ));
            }
            if limit.offset < 0 {
                return Err(KvError::InvalidArgument(format!(
                    "LIMIT offset must not be negative: {}",
                    limit.offset
                )));
            }
        }
        if let ZBounds::Score { min, max } = &self.bounds {
            if min.value().is_nan() || max.value().is_nan() {
                return Err(KvError::InvalidArgument("score bound is NaN".to_string()));
            }
        }
        Ok(())
    }
}

/// Resolve rank indices against a cardinality into `(offset, len)`.
///
/// Returns `None` when the window is empty.
pub(crate) fn normalize_rank(start: i64, stop: i64, total: i64) -> Option<(i64, i64)> {
    if total <= 0 {
        return None;
    }
    let start = if start < 0 {
        (total + start).max(0)
    } else {
        start.min(total)
    };
    let stop = if stop < 0 {
        total + stop
    } else {
        stop.min(total - 1)
    };
    if stop < 0 || start > stop || start >= total {
        return None;
    }
    Some((start, stop - start + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_bound_parse() {
        assert_eq!(ScoreBound::parse("1.5").unwrap(), ScoreBound::Inclusive(1.5));
        assert_eq!(ScoreBound::parse("(2").unwrap(), ScoreBound::Exclusive(2.0));
        assert_eq!(
            ScoreBound::parse("-inf").unwrap(),
            ScoreBound::Inclusive(f64::NEG_INFINITY)
        );
        assert_eq!(
            ScoreBound::parse("(+inf").unwrap(),
            ScoreBound::Exclusive(f64::INFINITY)
        );
        assert!(matches!(
            ScoreBound::parse("abc"),
            Err(KvError::InvalidArgument(_))
        ));
        assert!(ScoreBound::parse("nan").is_err());
    }

    #[test]
    fn test_lex_bound_parse() {
        assert_eq!(LexBound::parse("-").unwrap(), LexBound::Min);
        assert_eq!(LexBound::parse("+").unwrap(), LexBound::Max);
        assert_eq!(
            LexBound::parse("[beta").unwrap(),
            LexBound::Inclusive("beta".to_string())
        );
        assert_eq!(
            LexBound::parse("(beta").unwrap(),
            LexBound::Exclusive("beta".to_string())
        );
        assert!(matches!(
            LexBound::parse("beta"),
            Err(KvError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_range_by_parse() {
        assert_eq!(RangeBy::parse("SCORE").unwrap(), RangeBy::Score);
        assert!(RangeBy::parse("bogus").is_err());
        let bounds = ZBounds::parse(RangeBy::Rank, "0", "-1").unwrap();
        assert_eq!(bounds, ZBounds::Rank { start: 0, stop: -1 });
        assert!(ZBounds::parse(RangeBy::Rank, "x", "1").is_err());
    }

    #[test]
    fn test_limit_rejected_in_rank_mode() {
        let query = ZRangeQuery::by_rank(0, -1).limit(0, 2);
        assert!(matches!(query.validate(), Err(KvError::InvalidArgument(_))));

        assert!(ZRangeQuery::by_score(1.0, 5.0).limit(1, 2).validate().is_ok());
        assert!(ZRangeQuery::by_lex("-", "+").unwrap().limit(0, 1).validate().is_ok());
    }

    #[test]
    fn test_negative_offset_rejected() {
        let query = ZRangeQuery::by_score(0.0, 1.0).limit(-1, 2);
        assert!(query.validate().is_err());
    }

    #[test]
    fn test_normalize_rank() {
        assert_eq!(normalize_rank(0, -1, 5), Some((0, 5)));
        assert_eq!(normalize_rank(1, 2, 5), Some((1, 2)));
        assert_eq!(normalize_rank(-2, -1, 5), Some((3, 2)));
        assert_eq!(normalize_rank(-100, 100, 5), Some((0, 5)));
        assert_eq!(normalize_rank(3, 1, 5), None);
        assert_eq!(normalize_rank(5, 10, 5), None);
        assert_eq!(normalize_rank(0, -6, 5), None);
        assert_eq!(normalize_rank(0, -1, 0), None);
    }

    #[test]
    fn test_sql_filter() {
        let (sql, params) = ZBounds::Score {
            min: ScoreBound::Exclusive(1.0),
            max: ScoreBound::Inclusive(5.0),
        }
        .sql_filter();
        assert_eq!(sql, " AND score > ? AND score <= ?");
        assert_eq!(params.len(), 2);

        let (sql, params) = ZBounds::Lex {
            min: LexBound::Min,
            max: LexBound::Exclusive("m".to_string()),
        }
        .sql_filter();
        assert_eq!(sql, " AND member < ?");
        assert_eq!(params.len(), 1);

        let (sql, _) = ZBounds::Rank { start: 0, stop: 1 }.sql_filter();
        assert!(sql.is_empty());
    }
}
