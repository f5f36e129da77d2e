//! Region detection — maps place names in canonical text to a region hashtag.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::text::{is_one_edit_or_less, tokenize};

const PHRASE_SCORE: u32 = 3;
const EXACT_SCORE: u32 = 2;
const FUZZY_SCORE: u32 = 1;
const MIN_SCORE: u32 = 2;

/// A region and the aliases that point to it.
struct Region {
    name: &'static str,
    hashtag: &'static str,
    aliases: &'static [&'static str],
}

static REGIONS: &[Region] = &[
    Region {
        name: "Toshkent shahri",
        hashtag: "#ToshkentShahri",
        aliases: &[
            "toshkent", "tashkent", "toshkint", "tashkint", "toshkent shahar", "toshkent shahri",
            "tashkent city", "chilonzor", "sergeli", "yunusobod", "olmazor", "bektemir",
            "yakkasaroy", "uchtepa", "poytaxt",
        ],
    },
    Region {
        name: "Toshkent viloyati",
        hashtag: "#ToshkentViloyati",
        aliases: &[
            "toshkent viloyati", "tashkent region", "chirchiq", "angren", "olmaliq", "bekobod",
            "yangiyol", "gazalkent", "parkent", "zangiota", "qibray", "chinoz",
        ],
    },
    Region {
        name: "Andijon viloyati",
        hashtag: "#AndijonViloyati",
        aliases: &[
            "andijon", "andijan", "asaka", "xonobod", "shahrixon", "marhamat", "baliqchi",
            "paxtaobod",
        ],
    },
    Region {
        name: "Namangan viloyati",
        hashtag: "#NamanganViloyati",
        aliases: &[
            "namangan", "chortoq", "chust", "pop", "uychi", "torakorgon", "turakurgan",
            "uchqorgon", "mingbuloq", "kosonsoy",
        ],
    },
    Region {
        name: "Fargona viloyati",
        hashtag: "#FargonaViloyati",
        aliases: &[
            "fargona", "fergana", "vodiy", "qoqon", "kokand", "margilon", "quva", "quvasoy",
            "rishton", "oltiariq", "beshariq", "bogdod",
        ],
    },
    Region {
        name: "Sirdaryo viloyati",
        hashtag: "#SirdaryoViloyati",
        aliases: &[
            "sirdaryo", "guliston", "yangiyer", "shirin", "boyovut", "xovos", "mirzaobod",
            "sayxunobod",
        ],
    },
    Region {
        name: "Jizzax viloyati",
        hashtag: "#JizzaxViloyati",
        aliases: &[
            "jizzax", "zarbdor", "gallaorol", "forish", "paxtakor", "zomin", "dustlik", "baxmal",
        ],
    },
    Region {
        name: "Samarqand viloyati",
        hashtag: "#SamarqandViloyati",
        aliases: &[
            "samarqand", "samarkand", "samarqan", "samarqannd", "urgut", "jartepa", "marhabo",
            "texnagazoil", "kattakorgon", "bulungur", "ishtixon", "pastdargom", "payariq",
            "jomboy", "narpay",
        ],
    },
    Region {
        name: "Buxoro viloyati",
        hashtag: "#BuxoroViloyati",
        aliases: &[
            "buxoro", "bukhara", "gijduvon", "romitan", "vobkent", "qorakol", "karakul", "olot",
            "peshku", "shofirkon",
        ],
    },
    Region {
        name: "Navoiy viloyati",
        hashtag: "#NavoiyViloyati",
        aliases: &[
            "navoiy", "navoi", "zarafshon", "uchquduq", "konimex", "karmana", "nurota", "tomdi",
            "xatirchi",
        ],
    },
    Region {
        name: "Qashqadaryo viloyati",
        hashtag: "#QashqadaryoViloyati",
        aliases: &[
            "qashqadaryo", "qashkadaryo", "qarshi", "shahrisabz", "kitob", "guzor", "dehqonobod",
            "kasbi", "muborak", "yakkabog", "chiroqchi", "koson",
        ],
    },
    Region {
        name: "Surxondaryo viloyati",
        hashtag: "#SurxondaryoViloyati",
        aliases: &[
            "surxondaryo", "surkhandarya", "termiz", "denov", "boysun", "sherobod", "jarqorgon",
            "qiziriq", "angor", "sariosiyo", "kumqorgon",
        ],
    },
    Region {
        name: "Xorazm viloyati",
        hashtag: "#XorazmViloyati",
        aliases: &[
            "xorazm", "khorezm", "urganch", "xiva", "khiva", "pitnak", "hazorasp", "shovot",
            "gurlan", "yangiarik", "bogot",
        ],
    },
    Region {
        name: "Qoraqalpogiston Respublikasi",
        hashtag: "#Qoraqalpogiston",
        aliases: &[
            "qoraqalpogiston", "qoraqalpaqstan", "karakalpakstan", "nukus", "beruniy",
            "kungirot", "kungrad", "taxiatosh", "chimboy", "moynaq", "turtkul", "ellikqala",
            "kegeyli", "shumanay",
        ],
    },
];

/// Suffixes stripped before alias lookup. Wider than the general stemmer:
/// `toshkentlik` (a person from Toshkent) also names the city.
const GEO_SUFFIXES: &[&str] = &["lardan", "dan", "ga", "ni", "da", "lik"];

/// A detected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionMatch {
    pub name: &'static str,
    pub hashtag: &'static str,
    pub score: u32,
}

struct AliasIndex {
    /// Single-word alias → region slot. First region listing an alias wins.
    single: HashMap<&'static str, usize>,
    /// Single-word aliases grouped by length, in declaration order.
    by_len: HashMap<usize, Vec<&'static str>>,
    /// Multi-word aliases with their region slot.
    phrases: Vec<(&'static str, usize)>,
}

static INDEX: LazyLock<AliasIndex> = LazyLock::new(|| {
    let mut index = AliasIndex {
        single: HashMap::new(),
        by_len: HashMap::new(),
        phrases: Vec::new(),
    };
    for (slot, region) in REGIONS.iter().enumerate() {
        for alias in region.aliases {
            if alias.contains(' ') {
                index.phrases.push((alias, slot));
            } else if !index.single.contains_key(alias) {
                index.single.insert(alias, slot);
                index.by_len.entry(alias.len()).or_default().push(alias);
            }
        }
    }
    index
});

fn geo_stem(token: &str) -> &str {
    for suffix in GEO_SUFFIXES {
        if let Some(stem) = token.strip_suffix(suffix) {
            if stem.len() > 2 {
                return stem;
            }
        }
    }
    token
}

fn fuzzy_region(index: &AliasIndex, token: &str) -> Option<usize> {
    if token.len() < 4 {
        return None;
    }
    let len = token.len();
    [len - 1, len, len + 1]
        .iter()
        .filter_map(|l| index.by_len.get(l))
        .flatten()
        .find(|alias| is_one_edit_or_less(token, alias))
        .and_then(|alias| index.single.get(alias).copied())
}

/// Detect the most likely region mentioned in canonical text.
///
/// Phrase aliases score 3, exact (stemmed) token aliases 2 and one-edit
/// fuzzy aliases 1. The best region needs at least 2 points; ties go to
/// the region mentioned first.
pub fn detect_region(canonical: &str) -> Option<RegionMatch> {
    if canonical.is_empty() {
        return None;
    }
    let index = &*INDEX;

    // slot → (score, first position seen)
    let mut scores: HashMap<usize, (u32, usize)> = HashMap::new();
    let mut bump = |slot: usize, points: u32, position: usize| {
        let entry = scores.entry(slot).or_insert((0, position));
        entry.0 += points;
        entry.1 = entry.1.min(position);
    };

    for (phrase, slot) in &index.phrases {
        if let Some(position) = canonical.find(phrase) {
            bump(*slot, PHRASE_SCORE, position);
        }
    }

    let mut offset = 0usize;
    for token in tokenize(canonical) {
        let position = canonical[offset..]
            .find(token)
            .map_or(offset, |p| offset + p);
        offset = position + token.len();

        let stem = geo_stem(token);
        if let Some(slot) = index.single.get(stem) {
            bump(*slot, EXACT_SCORE, position);
        } else if let Some(slot) = fuzzy_region(index, stem) {
            bump(slot, FUZZY_SCORE, position);
        }
    }

    scores
        .into_iter()
        .filter(|(_, (score, _))| *score >= MIN_SCORE)
        .max_by(|(_, (sa, pa)), (_, (sb, pb))| sa.cmp(sb).then(pb.cmp(pa)))
        .map(|(slot, (score, _))| RegionMatch {
            name: REGIONS[slot].name,
            hashtag: REGIONS[slot].hashtag,
            score,
        })
}

/// Whether [`detect_region`] would find a region, stopping at the first
/// region that reaches the minimum score.
pub fn mentions_region(canonical: &str) -> bool {
    if canonical.is_empty() {
        return false;
    }
    let index = &*INDEX;
    if index.phrases.iter().any(|(phrase, _)| canonical.contains(phrase)) {
        return true;
    }

    let mut scores: HashMap<usize, u32> = HashMap::new();
    for token in tokenize(canonical) {
        let stem = geo_stem(token);
        let hit = match index.single.get(stem) {
            Some(slot) => Some((*slot, EXACT_SCORE)),
            None => fuzzy_region(index, stem).map(|slot| (slot, FUZZY_SCORE)),
        };
        if let Some((slot, points)) = hit {
            let score = scores.entry(slot).or_insert(0);
            *score += points;
            if *score >= MIN_SCORE {
                return true;
            }
        }
    }
    false
}

/// Hashtag for `canonical`, or `fallback` when no region is detected.
pub fn region_tag<'a>(canonical: &str, fallback: &'a str) -> &'a str {
    match detect_region(canonical) {
        Some(region) => region.hashtag,
        None => fallback,
    }
}
