//! Shared domain types for the data-mart replicator.
//!
//! Plain data only: no IO, no SQL, no business rules beyond what is needed to
//! construct/validate a value (e.g. `Relation::new` enforcing `entity_id <
//! related_id`). Every other crate in the workspace depends on this one.

use serde::{Deserialize, Serialize};

pub type EntityId = i64;

/// Composite primary key of a source record: `(data_source, record_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub data_source: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(data_source: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            record_id: record_id.into(),
        }
    }
}

/// One source record currently assigned to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub entity_id: EntityId,
    pub match_key: Option<String>,
    pub errule_code: Option<String>,
    pub principle: Option<String>,
}

/// Symmetric match classification between two entities. Mirrors the engine's
/// `MATCH_LEVEL_CODE` vocabulary plus the `IS_AMBIGUOUS`/`IS_DISCLOSED` flags
/// (spec.md §4.G "Tie-breaking & edge cases").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    PossibleMatch,
    PossiblySame,
    PossiblyRelated,
    AmbiguousMatch,
    DisclosedRelation,
}

impl MatchType {
    /// Derive the match type the way the engine-refresh handler does:
    /// ambiguous/disclosed flags win over the raw match-level code.
    pub fn derive(match_level_code: Option<&str>, is_ambiguous: bool, is_disclosed: bool) -> Self {
        if is_ambiguous {
            return MatchType::AmbiguousMatch;
        }
        if is_disclosed {
            return MatchType::DisclosedRelation;
        }
        match match_level_code {
            Some("POSSIBLE_MATCH") => MatchType::PossibleMatch,
            Some("POSSIBLY_SAME") => MatchType::PossiblySame,
            Some("POSSIBLY_RELATED") => MatchType::PossiblyRelated,
            _ => MatchType::PossibleMatch,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            MatchType::PossibleMatch => "POSSIBLE_MATCH",
            MatchType::PossiblySame => "POSSIBLY_SAME",
            MatchType::PossiblyRelated => "POSSIBLY_RELATED",
            MatchType::AmbiguousMatch => "AMBIGUOUS_MATCH",
            MatchType::DisclosedRelation => "DISCLOSED_RELATION",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "POSSIBLE_MATCH" => MatchType::PossibleMatch,
            "POSSIBLY_SAME" => MatchType::PossiblySame,
            "POSSIBLY_RELATED" => MatchType::PossiblyRelated,
            "AMBIGUOUS_MATCH" => MatchType::AmbiguousMatch,
            "DISCLOSED_RELATION" => MatchType::DisclosedRelation,
            _ => return None,
        })
    }
}

/// Symmetric relationship row. Always constructed with `entity_id <
/// related_id` (spec.md §3 invariant 3); `Relation::new` enforces this by
/// swapping the pair rather than trusting the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub entity_id: EntityId,
    pub related_id: EntityId,
    pub match_type: MatchType,
    pub match_key: Option<String>,
    pub errule_code: Option<String>,
    pub principle: Option<String>,
    pub is_ambiguous: bool,
    pub is_disclosed: bool,
}

impl Relation {
    /// Normalize `(a, b)` so the lower id is always `entity_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        a: EntityId,
        b: EntityId,
        match_type: MatchType,
        match_key: Option<String>,
        errule_code: Option<String>,
        principle: Option<String>,
        is_ambiguous: bool,
        is_disclosed: bool,
    ) -> Self {
        let (entity_id, related_id) = if a < b { (a, b) } else { (b, a) };
        Self {
            entity_id,
            related_id,
            match_type,
            match_key,
            errule_code,
            principle,
            is_ambiguous,
            is_disclosed,
        }
    }

    /// The other endpoint, given one side of the pair.
    pub fn other(&self, from: EntityId) -> Option<EntityId> {
        if self.entity_id == from {
            Some(self.related_id)
        } else if self.related_id == from {
            Some(self.entity_id)
        } else {
            None
        }
    }
}

/// A full snapshot of one entity as returned by the resolution engine, the
/// input the refresh handler diffs against the data mart (spec.md §4.G).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityResolution {
    pub entity_id: EntityId,
    pub entity_name: Option<String>,
    pub records: Vec<Record>,
    pub relations: Vec<Relation>,
}

impl EntityResolution {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Row mirroring the `entity` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub entity_id: EntityId,
    pub entity_name: Option<String>,
    pub record_count: i64,
    pub relation_count: i64,
    pub entity_hash: String,
    pub prev_entity_hash: Option<String>,
}

/// Compact bucket name for the aggregate report tables (spec.md §4.H).
///
/// A closed taxonomy; `ReportKey::parse` / `Display` are inverse of each
/// other (round-trip law, spec.md §8).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKey {
    DataSource(String),
    CrossMatch(String, String),
    Match {
        match_type: MatchType,
        principle: String,
        match_key: String,
    },
    Relation {
        ds1: String,
        ds2: String,
        match_type: MatchType,
        principle: String,
        match_key: String,
    },
}

impl ReportKey {
    /// Cross-match keys are stored with the data-source pair in sorted order
    /// so `CM:a:b` and `CM:b:a` are always the same key (spec.md §4.H).
    pub fn cross_match(ds1: &str, ds2: &str) -> Self {
        if ds1 <= ds2 {
            ReportKey::CrossMatch(ds1.to_string(), ds2.to_string())
        } else {
            ReportKey::CrossMatch(ds2.to_string(), ds1.to_string())
        }
    }

    pub fn relation(ds1: &str, ds2: &str, match_type: MatchType, principle: &str, match_key: &str) -> Self {
        let (ds1, ds2) = if ds1 <= ds2 {
            (ds1.to_string(), ds2.to_string())
        } else {
            (ds2.to_string(), ds1.to_string())
        };
        ReportKey::Relation {
            ds1,
            ds2,
            match_type,
            principle: principle.to_string(),
            match_key: match_key.to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(2, ':');
        let tag = parts.next()?;
        let rest = parts.next().unwrap_or("");
        match tag {
            "DS" => Some(ReportKey::DataSource(rest.to_string())),
            "CM" => {
                let mut p = rest.splitn(2, ':');
                let a = p.next()?.to_string();
                let b = p.next()?.to_string();
                Some(ReportKey::cross_match(&a, &b))
            }
            "MATCH" => {
                let mut p = rest.splitn(3, ':');
                let mt = MatchType::from_code(p.next()?)?;
                let principle = p.next()?.to_string();
                let match_key = p.next()?.to_string();
                Some(ReportKey::Match {
                    match_type: mt,
                    principle,
                    match_key,
                })
            }
            "REL" => {
                let mut p = rest.splitn(5, ':');
                let ds1 = p.next()?.to_string();
                let ds2 = p.next()?.to_string();
                let mt = MatchType::from_code(p.next()?)?;
                let principle = p.next()?.to_string();
                let match_key = p.next()?.to_string();
                Some(ReportKey::relation(&ds1, &ds2, mt, &principle, &match_key))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ReportKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportKey::DataSource(ds) => write!(f, "DS:{ds}"),
            ReportKey::CrossMatch(a, b) => write!(f, "CM:{a}:{b}"),
            ReportKey::Match {
                match_type,
                principle,
                match_key,
            } => write!(f, "MATCH:{}:{}:{}", match_type.as_code(), principle, match_key),
            ReportKey::Relation {
                ds1,
                ds2,
                match_type,
                principle,
                match_key,
            } => write!(
                f,
                "REL:{}:{}:{}:{}:{}",
                ds1,
                ds2,
                match_type.as_code(),
                principle,
                match_key
            ),
        }
    }
}

/// Signed delta queued by the refresh handler, folded later by the report
/// updater (spec.md §3 `pending_report`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReportDelta {
    pub report_key: String,
    pub entity_id: EntityId,
    pub related_id: Option<EntityId>,
    pub entity_delta: i64,
    pub record_delta: i64,
    pub relation_delta: i64,
}

/// Aggregate per-report-key contribution of one entity (or entity pair).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDetailRow {
    pub report_key: String,
    pub entity_id: EntityId,
    pub related_id: Option<EntityId>,
    pub record_count: i64,
    pub match_key: Option<String>,
    pub principle: Option<String>,
}

/// Top-level aggregate row for one report key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReportRow {
    pub entity_count: i64,
    pub record_count: i64,
    pub relation_count: i64,
    pub statistic_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_new_normalizes_order() {
        let r = Relation::new(200, 100, MatchType::PossibleMatch, None, None, None, false, false);
        assert_eq!(r.entity_id, 100);
        assert_eq!(r.related_id, 200);
    }

    #[test]
    fn relation_other_endpoint() {
        let r = Relation::new(100, 200, MatchType::PossibleMatch, None, None, None, false, false);
        assert_eq!(r.other(100), Some(200));
        assert_eq!(r.other(200), Some(100));
        assert_eq!(r.other(300), None);
    }

    #[test]
    fn report_key_round_trips() {
        let keys = vec![
            ReportKey::DataSource("CUSTOMERS".into()),
            ReportKey::cross_match("WATCHLIST", "CUSTOMERS"),
            ReportKey::Match {
                match_type: MatchType::PossibleMatch,
                principle: "MFF".into(),
                match_key: "NAME+DOB".into(),
            },
            ReportKey::relation("CUSTOMERS", "WATCHLIST", MatchType::AmbiguousMatch, "MFF", "NAME+DOB"),
        ];
        for k in keys {
            let s = k.to_string();
            let parsed = ReportKey::parse(&s).expect("parse");
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn cross_match_is_symmetric() {
        assert_eq!(
            ReportKey::cross_match("A", "B").to_string(),
            ReportKey::cross_match("B", "A").to_string()
        );
    }

    #[test]
    fn match_type_derive_prefers_flags() {
        assert_eq!(
            MatchType::derive(Some("POSSIBLE_MATCH"), true, false),
            MatchType::AmbiguousMatch
        );
        assert_eq!(
            MatchType::derive(Some("POSSIBLE_MATCH"), false, true),
            MatchType::DisclosedRelation
        );
        assert_eq!(
            MatchType::derive(Some("POSSIBLY_SAME"), false, false),
            MatchType::PossiblySame
        );
    }
}
