//! Key and originator filters shared by dumps, subscriptions and leaf-node
//! flood filtering.
use std::collections::BTreeSet;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use super::record::Record;
use crate::error::Result;
use crate::validation_error;

/// How the key predicate and the originator predicate combine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    #[default]
    Or,
    And,
}

impl std::str::FromStr for FilterOperator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "or" => Ok(FilterOperator::Or),
            "and" => Ok(FilterOperator::And),
            _ => Err(format!("Invalid filter operator: {}", s)),
        }
    }
}

/// Filter as supplied by callers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvFilter {
    /// Key prefixes; each entry is a regular expression anchored at the key start
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub originator_ids: BTreeSet<String>,
    #[serde(default)]
    pub oper: FilterOperator,
    /// Do not forward ttl-only refreshes
    #[serde(default)]
    pub ignore_ttl: bool,
    /// Forward metadata only, never the payload
    #[serde(default)]
    pub suppress_value: bool,
}

impl KvFilter {
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn originators<I, S>(mut self, originators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.originator_ids = originators.into_iter().map(Into::into).collect();
        self
    }

    pub fn oper(mut self, oper: FilterOperator) -> Self {
        self.oper = oper;
        self
    }

    pub fn compile(&self) -> Result<CompiledFilter> {
        if let Some(bad) = self.keys.iter().find(|k| k.is_empty()) {
            return Err(validation_error!("Empty key prefix in filter {:?}", bad));
        }
        if self.originator_ids.iter().any(|o| o.is_empty()) {
            return Err(validation_error!("Empty originator id in filter"));
        }
        let keys = RegexSet::new(self.keys.iter().map(|p| format!("^(?:{})", p)))?;
        Ok(CompiledFilter {
            keys,
            originator_ids: self.originator_ids.clone(),
            oper: self.oper,
            ignore_ttl: self.ignore_ttl,
            suppress_value: self.suppress_value,
        })
    }
}

/// A validated filter ready for matching
#[derive(Clone, Debug)]
pub struct CompiledFilter {
    keys: RegexSet,
    originator_ids: BTreeSet<String>,
    oper: FilterOperator,
    ignore_ttl: bool,
    suppress_value: bool,
}

impl Default for CompiledFilter {
    fn default() -> Self {
        Self {
            keys: RegexSet::empty(),
            originator_ids: BTreeSet::new(),
            oper: FilterOperator::Or,
            ignore_ttl: false,
            suppress_value: false,
        }
    }
}

impl CompiledFilter {
    pub fn ignore_ttl(&self) -> bool {
        self.ignore_ttl
    }

    pub fn suppress_value(&self) -> bool {
        self.suppress_value
    }

    pub fn is_match_all(&self) -> bool {
        self.keys.is_empty() && self.originator_ids.is_empty()
    }

    pub fn matches(&self, key: &str, record: &Record) -> bool {
        self.matches_parts(key, &record.originator_id)
    }

    pub fn matches_parts(&self, key: &str, originator_id: &str) -> bool {
        let has_keys = !self.keys.is_empty();
        let has_originators = !self.originator_ids.is_empty();
        if !has_keys && !has_originators {
            return true;
        }
        let key_match = has_keys && self.keys.is_match(key);
        let originator_match = has_originators && self.originator_ids.contains(originator_id);
        match self.oper {
            FilterOperator::Or => key_match || originator_match,
            FilterOperator::And => {
                (!has_keys || key_match) && (!has_originators || originator_match)
            }
        }
    }

    /// The copy of `record` this filter lets through
    pub fn shape(&self, record: &Record) -> Record {
        if self.suppress_value {
            record.without_value()
        } else {
            record.clone()
        }
    }
}
