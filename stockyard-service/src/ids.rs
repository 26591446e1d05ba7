//! Correlation identifiers
//!
//! Every request/response pair is correlated by a [`CorrId`]. HTTP-backed
//! vendors use v4 UUIDs; the broker vendor uses a monotonically increasing
//! 32-bit integer because its wire protocol keys responses by that integer.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Error;

/// Opaque identifier correlating a Request and its Response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrId {
    /// Random identifier for HTTP-backed vendors
    Uuid(Uuid),
    /// Monotonic wire request id for the broker vendor
    Seq(u32),
}

impl CorrId {
    /// The wire request id, when this corr id came from a counter source
    pub fn as_seq(&self) -> Option<u32> {
        match self {
            CorrId::Seq(n) => Some(*n),
            CorrId::Uuid(_) => None,
        }
    }
}

impl fmt::Display for CorrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrId::Uuid(u) => write!(f, "{u}"),
            CorrId::Seq(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for CorrId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<u32>() {
            return Ok(CorrId::Seq(n));
        }
        Uuid::parse_str(s)
            .map(CorrId::Uuid)
            .map_err(|_| Error::Codec(format!("corr_id `{s}`")))
    }
}

impl Serialize for CorrId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CorrId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Per-vendor correlation id generator
#[derive(Debug, Clone)]
pub enum CorrIdSource {
    /// Fresh v4 UUID per call
    Uuid,
    /// Shared monotonic counter; the broker client uses the same counter for
    /// its wire request ids, so corr ids and `reqId` fields coincide
    Counter(Arc<AtomicU32>),
}

impl CorrIdSource {
    pub fn counter() -> Self {
        CorrIdSource::Counter(Arc::new(AtomicU32::new(0)))
    }

    pub fn next(&self) -> CorrId {
        match self {
            CorrIdSource::Uuid => CorrId::Uuid(Uuid::new_v4()),
            CorrIdSource::Counter(n) => CorrId::Seq(n.fetch_add(1, Ordering::SeqCst) + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let id = CorrId::Seq(42);
        assert_eq!(id.to_string().parse::<CorrId>().unwrap(), id);

        let id = CorrId::Uuid(Uuid::new_v4());
        assert_eq!(id.to_string().parse::<CorrId>().unwrap(), id);

        assert!("not-an-id".parse::<CorrId>().is_err());
    }

    #[test]
    fn counter_source_is_monotonic() {
        let source = CorrIdSource::counter();
        assert_eq!(source.next(), CorrId::Seq(1));
        assert_eq!(source.next(), CorrId::Seq(2));
        let clone = source.clone();
        assert_eq!(clone.next(), CorrId::Seq(3));
    }

    #[test]
    fn uuid_source_is_unique() {
        let source = CorrIdSource::Uuid;
        assert_ne!(source.next(), source.next());
    }

    #[test]
    fn serde_as_string() {
        let id = CorrId::Seq(7);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"7\"");
        let back: CorrId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(back, id);
    }
}
