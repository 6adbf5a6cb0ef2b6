//! Result-type tags and the fixed catalog of known analysis kinds.
//!
//! A [`ResultType`] is the routing tag carried by every event, formed as
//! `<data_type>:<plugin_type>` in lowercase (for example `mx:integrate`).
//! Known tags resolve to a [`ResultKind`] by table lookup. Unknown tags are
//! still valid routing keys; they simply have no kind.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel result type matching every result type of a session.
pub const WILDCARD: &str = "*";

/// Normalized result-type tag.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ResultType(String);

impl ResultType {
    /// Normalize and wrap a tag (trimmed, lowercased).
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_lowercase())
    }

    /// Build a tag from its data-type and plugin-type halves.
    pub fn from_parts(data_type: &str, plugin_type: &str) -> Self {
        Self::new(format!("{}:{}", data_type.trim(), plugin_type.trim()))
    }

    /// The wildcard tag.
    pub fn wildcard() -> Self {
        Self(WILDCARD.to_owned())
    }

    /// Whether this is the wildcard sentinel.
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    /// Borrow the normalized tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the tag is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Catalog entry for this tag, if it is a known kind.
    pub fn kind(&self) -> Option<ResultKind> {
        ResultKind::lookup(&self.0)
    }

    /// Low-cardinality label for metrics.
    pub fn metric_label(&self) -> &'static str {
        self.kind().map_or("unregistered", ResultKind::label)
    }
}

impl From<String> for ResultType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ResultType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<ResultType> for String {
    fn from(rt: ResultType) -> Self {
        rt.0
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The client view a kind of result feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewClass {
    /// Single-image indexing and strategy.
    Snap,
    /// Full-sweep integration.
    Sweep,
    /// Dataset merging.
    Merge,
    /// Molecular replacement and anomalous phasing.
    Phasing,
    /// Everything else shown in side panels.
    Auxiliary,
}

/// Known result kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// `mx:index+strategy`
    IndexStrategy,
    /// `mx:integrate`
    Integrate,
    /// `mx:reintegrate`
    Reintegrate,
    /// `mx:merge`
    Merge,
    /// `mx:mr`
    MolecularReplacement,
    /// `mx:sad`
    Sad,
    /// `mx:mad`
    Mad,
    /// `mx:analysis`
    Analysis,
    /// `mx:pdbquery`
    PdbQuery,
    /// `mx:beamcenter`
    BeamCenter,
}

const CATALOG: &[(&str, ResultKind)] = &[
    ("mx:index+strategy", ResultKind::IndexStrategy),
    ("mx:integrate", ResultKind::Integrate),
    ("mx:reintegrate", ResultKind::Reintegrate),
    ("mx:merge", ResultKind::Merge),
    ("mx:mr", ResultKind::MolecularReplacement),
    ("mx:sad", ResultKind::Sad),
    ("mx:mad", ResultKind::Mad),
    ("mx:analysis", ResultKind::Analysis),
    ("mx:pdbquery", ResultKind::PdbQuery),
    ("mx:beamcenter", ResultKind::BeamCenter),
];

impl ResultKind {
    /// Resolve a normalized tag.
    pub fn lookup(tag: &str) -> Option<Self> {
        CATALOG.iter().find(|(t, _)| *t == tag).map(|(_, k)| *k)
    }

    /// Canonical tag for this kind.
    pub fn tag(self) -> &'static str {
        CATALOG
            .iter()
            .find(|(_, k)| *k == self)
            .map_or("", |(t, _)| t)
    }

    /// All known kinds, in catalog order.
    pub fn all() -> impl Iterator<Item = Self> {
        CATALOG.iter().map(|(_, k)| *k)
    }

    /// Short label for metrics and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::IndexStrategy => "index_strategy",
            Self::Integrate => "integrate",
            Self::Reintegrate => "reintegrate",
            Self::Merge => "merge",
            Self::MolecularReplacement => "mr",
            Self::Sad => "sad",
            Self::Mad => "mad",
            Self::Analysis => "analysis",
            Self::PdbQuery => "pdbquery",
            Self::BeamCenter => "beamcenter",
        }
    }

    /// The view this kind feeds.
    pub fn view(self) -> ViewClass {
        match self {
            Self::IndexStrategy => ViewClass::Snap,
            Self::Integrate | Self::Reintegrate => ViewClass::Sweep,
            Self::Merge => ViewClass::Merge,
            Self::MolecularReplacement | Self::Sad | Self::Mad => ViewClass::Phasing,
            Self::Analysis | Self::PdbQuery | Self::BeamCenter => ViewClass::Auxiliary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(ResultType::new("  MX:Integrate ").as_str(), "mx:integrate");
    }

    #[test]
    fn from_parts_joins_with_colon() {
        assert_eq!(ResultType::from_parts("MX", "INDEX+STRATEGY").as_str(), "mx:index+strategy");
    }

    #[test]
    fn wildcard_detection() {
        assert!(ResultType::wildcard().is_wildcard());
        assert!(ResultType::new("*").is_wildcard());
        assert!(!ResultType::new("mx:integrate").is_wildcard());
    }

    #[test]
    fn known_tag_resolves() {
        assert_eq!(ResultType::new("mx:integrate").kind(), Some(ResultKind::Integrate));
        assert_eq!(ResultKind::Integrate.view(), ViewClass::Sweep);
        assert_eq!(ResultKind::IndexStrategy.view(), ViewClass::Snap);
    }

    #[test]
    fn unknown_tag_is_unregistered() {
        let rt = ResultType::new("saxs:guinier");
        assert_eq!(rt.kind(), None);
        assert_eq!(rt.metric_label(), "unregistered");
    }

    #[test]
    fn catalog_tags_round_trip() {
        for kind in ResultKind::all() {
            assert_eq!(ResultKind::lookup(kind.tag()), Some(kind));
        }
    }

    #[test]
    fn deserialize_normalizes() {
        let rt: ResultType = serde_json::from_str("\"MX:MERGE\"").unwrap();
        assert_eq!(rt.as_str(), "mx:merge");
    }
}
