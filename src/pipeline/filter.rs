//! Fast filter — cheap pre-screen before a message is queued.
//!
//! Drops only what the decision engine would certainly reject. Checks run
//! cheapest first and stop at the first hit, so most chatter is dropped
//! after a few set lookups and a message the engine would accept is never
//! dropped here.

use crate::config::RuntimeConfig;
use crate::geo::mentions_region;
use crate::pipeline::rules::has_strong_pattern;
use crate::rules::{RuleKind, RuleSnapshot};
use crate::text::{stem_token, tokenize};

/// Fast filter verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Pass,
    Drop(&'static str),
}

impl Screen {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Screen canonical text.
pub fn screen(canonical: &str, rules: &RuleSnapshot, config: &RuntimeConfig) -> Screen {
    if canonical.is_empty() {
        return Screen::Drop("empty_text");
    }

    let tokens = tokenize(canonical);
    let exclude = rules.index(RuleKind::Exclude);
    if tokens.iter().any(|t| exclude.contains(t)) {
        return Screen::Drop("exclude_keyword");
    }
    if has_strong_pattern(canonical) {
        return Screen::Pass;
    }
    if canonical.chars().count() < config.min_text_length {
        return Screen::Drop("too_short");
    }
    if !has_keyword_hint(canonical, &tokens, rules) {
        return Screen::Drop("no_order_signal");
    }
    Screen::Pass
}

/// Short-circuiting form of the engine's keyword signal: exact route words,
/// then one-edit transport/request/location hits, then region aliases.
fn has_keyword_hint(canonical: &str, tokens: &[&str], rules: &RuleSnapshot) -> bool {
    let route = rules.index(RuleKind::Route);
    if tokens.iter().any(|t| route.contains(t)) {
        return true;
    }

    let transport = rules.index(RuleKind::Transport);
    let request = rules.index(RuleKind::Request);
    if tokens
        .iter()
        .any(|t| transport.fuzzy_match(t).is_some() || request.fuzzy_match(t).is_some())
    {
        return true;
    }

    let location = rules.index(RuleKind::Location);
    if tokens
        .iter()
        .any(|t| location.fuzzy_match(stem_token(t)).is_some())
    {
        return true;
    }
    mentions_region(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::rules::{Signals, decide};
    use crate::pipeline::types::{NormalizedMessage, RawMessage};
    use crate::text::normalize;

    const CORPUS: &[&str] = &[
        "Toshkentdan Samarqandga 2 kishi bor",
        "taxi kerak",
        "Men ham yuramiz, kim bor?",
        "Ertalab soat 7 da Namanganga mashina qidiryapmiz",
        "Pochta olib boriladi Toshkent Samarqand arzon narxda",
        "Assalomu alaykum hammaga, bugun havo juda yaxshi ekan",
        "Vakansiya: haydovchi kerak, oylik yaxshi",
        "Buxoroga kim bor?",
        "from tashkent to samarkand, 3 odam",
        "taksi?",
        "",
        "\u{1F695}\u{1F695}",
        "Andijon Farg'ona yo'nalishida qatnovchi mashina bormi",
        "Cobalt bor, Qarshiga yuraman",
        "Salom",
        "Chirchiqqa moshin kere srochna",
    ];

    fn screen_text(text: &str, config: &RuntimeConfig) -> Screen {
        screen(&normalize(text), &RuleSnapshot::defaults(), config)
    }

    #[test]
    fn drops_empty_and_excluded() {
        let config = RuntimeConfig::default();
        assert_eq!(screen_text("  ", &config), Screen::Drop("empty_text"));
        assert_eq!(
            screen_text("Reklama! Kanalga obuna bo'ling", &config),
            Screen::Drop("exclude_keyword")
        );
    }

    #[test]
    fn short_strong_request_passes() {
        let config = RuntimeConfig::default();
        assert!(screen_text("taxi kerak", &config).passed());
        assert!(screen_text("Toshkentdan Buxoroga", &config).passed());
        assert_eq!(screen_text("Salom", &config), Screen::Drop("too_short"));
    }

    #[test]
    fn long_chatter_without_signal_is_dropped() {
        let config = RuntimeConfig::default();
        assert_eq!(
            screen_text("Assalomu alaykum hammaga, bugun havo juda yaxshi ekan", &config),
            Screen::Drop("no_order_signal")
        );
    }

    #[test]
    fn never_drops_what_the_engine_accepts() {
        let rules = RuleSnapshot::defaults();
        let configs = [
            RuntimeConfig::default(),
            RuntimeConfig {
                offer_override: false,
                require_contact: true,
                min_text_length: 4,
                ..RuntimeConfig::default()
            },
            RuntimeConfig {
                min_text_length: 300,
                ..RuntimeConfig::default()
            },
        ];

        for config in &configs {
            for text in CORPUS {
                let msg = NormalizedMessage::new(RawMessage::new(-100, 1, text));
                let decision = decide(&msg, &rules, config);
                if decision.is_accepted() {
                    let screened = screen(&msg.canonical, &rules, config);
                    assert!(
                        screened.passed(),
                        "filter dropped accepted message {text:?}: {screened:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn keyword_hint_matches_engine_signal() {
        let rules = RuleSnapshot::defaults();
        for text in CORPUS {
            let canonical = normalize(text);
            let tokens = tokenize(&canonical);
            let signals = Signals::extract(&canonical, text, &rules);
            assert_eq!(
                has_keyword_hint(&canonical, &tokens, &rules),
                signals.has_keyword_signal(),
                "{text:?}"
            );
        }
    }
}
