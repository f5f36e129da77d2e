//! Text normalization — the canonical form every later stage matches against.
//!
//! `normalize()` is pure and total: characters it cannot place are dropped,
//! never rejected. Output only ever contains `[a-z0-9 ]`, single spaces, no
//! leading/trailing whitespace and no letter repeated more than twice, which
//! is what makes the function idempotent.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Suffixes stripped by [`stem_token`], longest first.
const STEM_SUFFIXES: &[&str] = &["lardan", "dan", "ga", "ni", "da"];

/// Normalize raw chat text into its canonical form.
///
/// Steps, in order: apostrophe removal, NFKC + lowercase, Cyrillic→Latin
/// folding, diacritic stripping, emoji/symbol removal, punctuation collapse,
/// repeated-letter collapse, whitespace collapse and trim.
pub fn normalize(raw: &str) -> String {
    let without_apostrophes: String = raw.chars().filter(|c| !is_apostrophe(*c)).collect();

    let lowered: String = without_apostrophes
        .nfkc()
        .flat_map(char::to_lowercase)
        .collect();

    let mut latin = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        match fold_cyrillic(c) {
            Some(replacement) => latin.push_str(replacement),
            None => latin.push(c),
        }
    }

    let stripped: String = latin.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    let stripped = stripped.replace("->", " ").replace("=>", " ");

    let mut out = String::with_capacity(stripped.len());
    let mut pending_space = false;
    let mut prev: Option<char> = None;
    let mut run = 0usize;

    for c in stripped.chars() {
        let keep = !is_pictographic(c) && (c.is_ascii_lowercase() || c.is_ascii_digit());
        if !keep {
            pending_space = !out.is_empty();
            prev = None;
            run = 0;
            continue;
        }

        if pending_space {
            out.push(' ');
            pending_space = false;
        }

        if prev == Some(c) {
            run += 1;
            if run > 2 && c.is_ascii_lowercase() {
                continue;
            }
        } else {
            prev = Some(c);
            run = 1;
        }
        out.push(c);
    }

    out
}

/// Split canonical text into tokens.
pub fn tokenize(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

/// Strip a common Uzbek case suffix (`toshkentdan` → `toshkent`).
///
/// The stem must keep at least three characters.
pub fn stem_token(token: &str) -> &str {
    for suffix in STEM_SUFFIXES {
        if let Some(stem) = token.strip_suffix(suffix) {
            if stem.len() > 2 {
                return stem;
            }
        }
    }
    token
}

/// True when `a` and `b` differ by at most one insertion, deletion or
/// substitution. Inputs are canonical (ASCII) text.
pub fn is_one_edit_or_less(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len().abs_diff(b.len()) > 1 {
        return false;
    }

    if a.len() == b.len() {
        return a.iter().zip(b).filter(|(x, y)| x != y).count() <= 1;
    }

    let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
    let (mut i, mut j, mut edits) = (0, 0, 0);
    while i < short.len() && j < long.len() {
        if short[i] == long[j] {
            i += 1;
            j += 1;
            continue;
        }
        edits += 1;
        if edits > 1 {
            return false;
        }
        j += 1;
    }
    if j < long.len() {
        edits += 1;
    }
    edits <= 1
}

/// Truncate text for log previews, collapsing whitespace.
pub fn preview(text: &str, limit: usize) -> String {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= limit {
        return compact;
    }
    let head: String = compact.chars().take(limit.saturating_sub(3)).collect();
    format!("{head}...")
}

fn is_apostrophe(c: char) -> bool {
    matches!(
        c,
        '\u{0060}' | '\u{00b4}' | '\u{0027}' | '\u{2018}' | '\u{2019}' | '\u{02bb}' | '\u{02bc}'
            | '\u{02b9}'
    )
}

fn is_pictographic(c: char) -> bool {
    matches!(c as u32,
        0x1F300..=0x1FAFF   // pictographs, emoticons, transport, symbols
        | 0x2600..=0x27BF   // misc symbols, dingbats
        | 0xFE00..=0xFE0F   // variation selectors
        | 0x200D            // zero-width joiner
        | 0x20E3            // combining keycap
    )
}

/// Uzbek/Russian Cyrillic → Uzbek Latin, lowercase input only.
fn fold_cyrillic(c: char) -> Option<&'static str> {
    let latin = match c {
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' => "e",
        'ё' => "yo",
        'ж' => "j",
        'з' => "z",
        'и' => "i",
        'й' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "x",
        'ц' => "s",
        'ч' => "ch",
        'ш' | 'щ' => "sh",
        'ъ' | 'ь' => "",
        'ы' => "i",
        'э' => "e",
        'ю' => "yu",
        'я' => "ya",
        'қ' => "q",
        'ғ' => "g",
        'ҳ' => "h",
        'ў' => "o",
        _ => return None,
    };
    Some(latin)
}
