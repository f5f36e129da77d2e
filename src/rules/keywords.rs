//! Keyword rule kinds, default vocabularies and the immutable rule snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::text::is_one_edit_or_less;

/// Shortest token considered for one-edit fuzzy matching.
pub const MIN_FUZZY_LEN: usize = 4;

/// Closed set of keyword categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleKind {
    Transport,
    Request,
    Offer,
    Exclude,
    Location,
    Route,
}

impl RuleKind {
    pub const ALL: [RuleKind; 6] = [
        RuleKind::Transport,
        RuleKind::Request,
        RuleKind::Offer,
        RuleKind::Exclude,
        RuleKind::Location,
        RuleKind::Route,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Request => "request",
            Self::Offer => "offer",
            Self::Exclude => "exclude",
            Self::Location => "location",
            Self::Route => "route",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transport" => Ok(Self::Transport),
            "request" => Ok(Self::Request),
            "offer" => Ok(Self::Offer),
            "exclude" => Ok(Self::Exclude),
            "location" => Ok(Self::Location),
            "route" => Ok(Self::Route),
            other => Err(ConfigError::UnknownKeywordKind(other.to_string())),
        }
    }
}

/// Built-in vocabularies, seeded into storage on first start.
pub const DEFAULT_RULES: &[(RuleKind, &[&str])] = &[
    (
        RuleKind::Transport,
        &[
            "taxi", "taksi", "yandex", "mytaxi", "zakaz", "buyurtma", "haydovchi", "driver",
            "moshin", "mashin", "mashina", "avto", "ulov",
        ],
    ),
    (
        RuleKind::Request,
        &[
            "kerak", "kere", "bormi", "bormikan", "qayerga", "buyurtma", "zakaz", "yuradigan",
            "yuradiglar", "ketadigan", "olibketadigan", "keremi",
        ],
    ),
    (
        RuleKind::Offer,
        &[
            "boraman", "ketaman", "yuraman", "olibketaman", "ketyapman", "ketyapmiz",
            "yuryapman", "yuryapmiz", "olibketamiz", "chiqaman", "chiqamiz", "zakazga", "joybor",
            "bagaj", "pochta", "shafer", "shafermiz", "haydovchimiz", "beraman", "xizmat",
            "taklif", "bosh",
        ],
    ),
    (
        RuleKind::Exclude,
        &[
            "vakansiya", "reklama", "dostavka", "kredit", "obuna", "kanal", "kurs", "sotiladi",
            "sotaman", "ishga", "job", "marketing",
        ],
    ),
    (
        RuleKind::Location,
        &[
            "toshkent", "tashkent", "samarqand", "samarkand", "andijon", "namangan", "fargona",
            "fergana", "nukus", "buxoro", "jizzax", "xorazm", "urganch", "termiz", "qarshi",
            "navoiy", "guliston",
        ],
    ),
    (RuleKind::Route, &["dan", "ga", "from", "to"]),
];

/// Compiled vocabulary for one rule kind: an exact set plus a
/// length-bucketed copy for one-edit fuzzy lookups.
#[derive(Debug, Clone, Default)]
pub struct KeywordIndex {
    exact: BTreeSet<String>,
    by_len: HashMap<usize, Vec<String>>,
}

impl KeywordIndex {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let exact: BTreeSet<String> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| !v.is_empty())
            .collect();
        let mut by_len: HashMap<usize, Vec<String>> = HashMap::new();
        for value in &exact {
            by_len.entry(value.len()).or_default().push(value.clone());
        }
        Self { exact, by_len }
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.exact.contains(token)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.exact.iter().map(String::as_str)
    }

    /// Vocabulary entry matching `token` exactly, or within one edit when
    /// the token is long enough.
    pub fn fuzzy_match(&self, token: &str) -> Option<&str> {
        if let Some(hit) = self.exact.get(token) {
            return Some(hit.as_str());
        }
        if token.len() < MIN_FUZZY_LEN {
            return None;
        }
        let len = token.len();
        [len - 1, len, len + 1]
            .iter()
            .filter_map(|l| self.by_len.get(l))
            .flatten()
            .find(|candidate| is_one_edit_or_less(token, candidate))
            .map(String::as_str)
    }

    /// Number of distinct vocabulary entries hit exactly by `tokens`.
    pub fn exact_hits<'a>(&self, tokens: impl IntoIterator<Item = &'a str>) -> usize {
        tokens
            .into_iter()
            .filter(|t| self.contains(t))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Number of distinct vocabulary entries hit by `tokens`, allowing one edit.
    pub fn fuzzy_hits<'a>(&self, tokens: impl IntoIterator<Item = &'a str>) -> usize {
        tokens
            .into_iter()
            .filter_map(|t| self.fuzzy_match(t))
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Immutable, versioned set of keyword rules.
///
/// Readers hold an `Arc<RuleSnapshot>` for the duration of one message, so a
/// concurrent reload never changes the rules mid-classification.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    version: u64,
    indexes: [KeywordIndex; RuleKind::ALL.len()],
}

impl RuleSnapshot {
    /// Build a snapshot from `(kind, value)` pairs.
    pub fn from_rules<I, S>(version: u64, rules: I) -> Self
    where
        I: IntoIterator<Item = (RuleKind, S)>,
        S: Into<String>,
    {
        let mut grouped: BTreeMap<RuleKind, Vec<String>> = BTreeMap::new();
        for (kind, value) in rules {
            grouped.entry(kind).or_default().push(value.into());
        }
        let indexes = std::array::from_fn(|slot| {
            let kind = RuleKind::ALL[slot];
            KeywordIndex::new(grouped.remove(&kind).unwrap_or_default())
        });
        Self { version, indexes }
    }

    /// Snapshot of the built-in vocabularies at version 0.
    pub fn defaults() -> Self {
        Self::from_rules(0, default_rule_pairs())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn index(&self, kind: RuleKind) -> &KeywordIndex {
        &self.indexes[kind.slot()]
    }

    /// Total number of rules across all kinds.
    pub fn len(&self) -> usize {
        self.indexes.iter().map(KeywordIndex::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted values per kind.
    pub fn list(&self) -> BTreeMap<RuleKind, Vec<String>> {
        RuleKind::ALL
            .iter()
            .map(|kind| {
                let values = self.index(*kind).values().map(str::to_string).collect();
                (*kind, values)
            })
            .collect()
    }
}

/// Flattened `(kind, value)` pairs of [`DEFAULT_RULES`].
pub fn default_rule_pairs() -> impl Iterator<Item = (RuleKind, &'static str)> {
    DEFAULT_RULES
        .iter()
        .flat_map(|(kind, values)| values.iter().map(move |v| (*kind, *v)))
}
