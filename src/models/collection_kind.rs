use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::value::Record;

/// The four kinds of record carried in a trip ticket payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Trip,
    Claim,
    Comment,
    Result,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 4] = [
        CollectionKind::Trip,
        CollectionKind::Claim,
        CollectionKind::Comment,
        CollectionKind::Result,
    ];

    /// The sub-collections nested under a trip ticket.
    pub const NESTED: [CollectionKind; 3] = [
        CollectionKind::Claim,
        CollectionKind::Comment,
        CollectionKind::Result,
    ];

    /// Key holding this collection inside a trip ticket. `None` for the trip itself.
    pub fn record_key(self) -> Option<&'static str> {
        match self {
            CollectionKind::Trip => None,
            CollectionKind::Claim => Some("trip_claims"),
            CollectionKind::Comment => Some("trip_ticket_comments"),
            CollectionKind::Result => Some("trip_result"),
        }
    }

    /// File name stem for flat-file exports.
    pub fn file_stem(self) -> &'static str {
        match self {
            CollectionKind::Trip => "trip_tickets",
            CollectionKind::Claim => "trip_claims",
            CollectionKind::Comment => "trip_ticket_comments",
            CollectionKind::Result => "trip_results",
        }
    }

    /// Name of the mapping and normalization sub-ruleset for this kind.
    pub fn ruleset_name(self) -> &'static str {
        match self {
            CollectionKind::Trip => "trip_ticket",
            CollectionKind::Claim => "trip_claim",
            CollectionKind::Comment => "trip_comment",
            CollectionKind::Result => "trip_result",
        }
    }

    /// Claims and comments are lists; the result is a single map.
    pub fn is_list(self) -> bool {
        matches!(self, CollectionKind::Claim | CollectionKind::Comment)
    }

    pub fn empty_value(self) -> Value {
        if self.is_list() {
            Value::Array(Vec::new())
        } else {
            Value::Object(Record::new())
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ruleset_name())
    }
}

impl FromStr for CollectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        CollectionKind::ALL
            .into_iter()
            .find(|kind| kind.ruleset_name() == name || kind.file_stem() == name)
            .ok_or_else(|| {
                format!(
                    "Invalid collection '{}'. Valid options: trip_ticket, trip_claim, trip_comment, trip_result",
                    s
                )
            })
    }
}
