//! Decision engine — classifies a normalized message as a taxi request or a
//! rejection with a reason code.
//!
//! Precedence is fixed and evaluated top to bottom; the first matching
//! branch decides:
//! 0. empty text → `RejectedOther`
//! 1. exclude keyword → `RejectedSpam`
//! 2. driver "I am going" phrasing (when `offer_override` is on) → `RejectedOffer`
//! 3. offer signal without a strong request → `RejectedOffer`
//! 4. strong request pattern → `Accepted`, regardless of length
//! 5. missing contact (when `require_contact` is on) → `RejectedNoPattern`
//! 6. shorter than `min_text_length` → `RejectedTooShort`
//! 7. any transport/request/location/route keyword → `Accepted`
//! 8. otherwise → `RejectedNoPattern`

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::geo::mentions_region;
use crate::pipeline::types::{Decision, NormalizedMessage, Verdict};
use crate::rules::{RuleKind, RuleSnapshot};
use crate::text::{stem_token, tokenize};

/// Compiled order patterns, shared by the fast filter and the engine.
struct OrderPatterns {
    /// `toshkentdan ... samarqandga`
    suffix_route: Regex,
    /// `toshkent dan ... samarqand ga`
    spaced_route: Regex,
    /// `from tashkent to samarkand`
    english_route: Regex,
    /// `2 kishi bor`
    passengers_waiting: Regex,
    /// `3 odam`, `2 joy`
    people: Regex,
    /// `kim bor`, `taxi kerak`, `yuradigan bormi`, ...
    demand: Regex,
    /// First-person driver phrasing: `yuramiz`, `ketyapman`, `joy bor`, ...
    driver_going: Regex,
    /// Car model names, which in these groups almost always advertise a ride.
    vehicle_model: Regex,
    /// Runs of digits with phone-style separators.
    phone_run: Regex,
    /// `@handle` in raw text.
    handle: Regex,
}

static PATTERNS: LazyLock<OrderPatterns> = LazyLock::new(|| {
    let re = |pattern: &str| Regex::new(pattern).expect("order pattern must compile");
    OrderPatterns {
        suffix_route: re(r"\b([a-z0-9]{3,})dan\b.*?\b([a-z0-9]{2,})ga\b"),
        spaced_route: re(r"\b([a-z0-9]{3,}) dan\b.*?\b([a-z0-9]{2,}) ga\b"),
        english_route: re(r"\bfrom ([a-z0-9]{3,}) to ([a-z0-9]{2,})\b"),
        passengers_waiting: re(r"\b(\d{1,2}) ?(?:kishi|odam|passajir|pasajir)(?: [a-z]+)? bor\b"),
        people: re(r"\b(\d{1,2}) ?(?:kishi|odam|passajir|pasajir|joy)\b"),
        demand: re(concat!(
            r"\bkim bor\b",
            r"|\b(?:taxi|taksi|moshin|mashina) kerak\b",
            r"|\b(?:yuradigan|yuradiglar) bormi(?:kan)?\b",
            r"|\bolib ?ketadig(?:an|lar) bormi(?:kan)?\b",
        )),
        driver_going: re(concat!(
            r"\b(?:yuramiz|yuraman|yuryapman|yuryapmiz|ketyapman|ketyapmiz|ketaman|ketamiz",
            r"|boraman|boramiz|chiqaman|chiqamiz|olib ?ketaman|olib ?ketamiz",
            r"|zakazga(?: ham)? yuraman|joy bor|bosh joy|komfort)\b",
        )),
        vehicle_model: re(
            r"\b(?:kobalt|cobalt|nexia|neksiya|jentra|gentra|malibu|lacetti|damas|spark|captiva|onix|tracker|matiz|epica)\b",
        ),
        phone_run: re(r"\+?\d[\d\s\-()]*\d"),
        handle: re(r"(?:^|[^\w])@[A-Za-z][A-Za-z0-9_]{4,}"),
    }
});

/// Which strong pattern made a message a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrongPattern {
    Route,
    Passengers,
    Demand,
}

/// Every signal the classifier looks at, extracted once per message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub char_len: usize,
    pub excluded: bool,
    pub driver_going: bool,
    pub offer: bool,
    pub strong: Option<StrongPattern>,
    pub has_contact: bool,
    pub transport_hits: usize,
    pub request_hits: usize,
    pub location_hit: bool,
    pub route_hit: bool,
}

impl Signals {
    /// Extract signals from canonical text (and the raw text, for contacts).
    pub fn extract(canonical: &str, raw: &str, rules: &RuleSnapshot) -> Self {
        if canonical.is_empty() {
            return Self::default();
        }
        let p = &*PATTERNS;
        let tokens = tokenize(canonical);
        let stemmed: Vec<&str> = tokens.iter().map(|t| stem_token(t)).collect();

        let strong = if has_route(canonical) {
            Some(StrongPattern::Route)
        } else if p.passengers_waiting.is_match(canonical) {
            Some(StrongPattern::Passengers)
        } else if p.demand.is_match(canonical) {
            Some(StrongPattern::Demand)
        } else {
            None
        };

        let offer_index = rules.index(RuleKind::Offer);
        let location_index = rules.index(RuleKind::Location);

        Self {
            char_len: canonical.chars().count(),
            excluded: rules.index(RuleKind::Exclude).exact_hits(tokens.iter().copied()) > 0,
            driver_going: p.driver_going.is_match(canonical),
            offer: offer_index.exact_hits(tokens.iter().copied()) > 0
                || p.vehicle_model.is_match(canonical),
            strong,
            has_contact: has_contact(raw) || has_contact(canonical),
            transport_hits: rules.index(RuleKind::Transport).fuzzy_hits(tokens.iter().copied()),
            request_hits: rules.index(RuleKind::Request).fuzzy_hits(tokens.iter().copied()),
            location_hit: location_index.fuzzy_hits(stemmed.iter().copied()) > 0
                || mentions_region(canonical),
            route_hit: rules.index(RuleKind::Route).exact_hits(tokens.iter().copied()) > 0,
        }
    }

    /// Any transport, request, location or route keyword present.
    pub fn has_keyword_signal(&self) -> bool {
        self.transport_hits > 0 || self.request_hits > 0 || self.location_hit || self.route_hit
    }
}

/// Route, waiting-passengers or demand phrasing.
pub fn has_strong_pattern(canonical: &str) -> bool {
    let p = &*PATTERNS;
    has_route(canonical) || p.passengers_waiting.is_match(canonical) || p.demand.is_match(canonical)
}

fn has_route(canonical: &str) -> bool {
    let p = &*PATTERNS;
    p.suffix_route.is_match(canonical)
        || p.spaced_route.is_match(canonical)
        || p.english_route.is_match(canonical)
}

/// Phone number (7 to 12 digits, separators allowed) or `@handle`.
pub fn has_contact(text: &str) -> bool {
    let p = &*PATTERNS;
    if p.handle.is_match(text) {
        return true;
    }
    p.phone_run.find_iter(text).any(|m| {
        let digits = m.as_str().chars().filter(char::is_ascii_digit).count();
        (7..=12).contains(&digits)
    })
}

/// Stemmed origin and destination of a route, when the text has one.
pub fn route_endpoints(canonical: &str) -> Option<(String, String)> {
    let p = &*PATTERNS;
    [&p.suffix_route, &p.spaced_route, &p.english_route]
        .into_iter()
        .find_map(|re| re.captures(canonical))
        .and_then(|caps| {
            let from = caps.get(1)?.as_str();
            let to = caps.get(2)?.as_str();
            Some((stem_token(from).to_string(), stem_token(to).to_string()))
        })
}

/// Passenger or seat count mentioned in the text.
pub fn passenger_count(canonical: &str) -> Option<u32> {
    PATTERNS
        .people
        .captures(canonical)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Classify a message. Pure: the same inputs always give the same decision.
pub fn decide(msg: &NormalizedMessage, rules: &RuleSnapshot, config: &RuntimeConfig) -> Decision {
    let signals = Signals::extract(&msg.canonical, &msg.raw.text, rules);
    let decision = decide_from_signals(&signals, config);
    debug!(
        chat_id = msg.raw.chat_id,
        message_id = msg.raw.message_id,
        verdict = decision.verdict.label(),
        reason = decision.reason,
        "Message classified"
    );
    decision
}

/// Apply the fixed precedence to already-extracted signals.
pub fn decide_from_signals(signals: &Signals, config: &RuntimeConfig) -> Decision {
    if signals.char_len == 0 {
        return Decision::new(Verdict::RejectedOther, "empty_text");
    }
    if signals.excluded {
        return Decision::new(Verdict::RejectedSpam, "excluded_category");
    }
    if config.offer_override && signals.driver_going {
        return Decision::new(Verdict::RejectedOffer, "driver_going");
    }
    if signals.offer && signals.strong.is_none() {
        return Decision::new(Verdict::RejectedOffer, "taxi_offer");
    }
    if signals.strong.is_some() {
        return Decision::new(Verdict::Accepted, "strong_request");
    }
    if config.require_contact && !signals.has_contact {
        return Decision::new(Verdict::RejectedNoPattern, "no_contact");
    }
    if signals.char_len < config.min_text_length {
        return Decision::new(Verdict::RejectedTooShort, "too_short");
    }
    if signals.has_keyword_signal() {
        return Decision::new(Verdict::Accepted, "keyword_match");
    }
    Decision::new(Verdict::RejectedNoPattern, "no_order_pattern")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::RawMessage;

    fn classify(text: &str) -> Decision {
        classify_with(text, &RuntimeConfig::default())
    }

    fn classify_with(text: &str, config: &RuntimeConfig) -> Decision {
        let msg = NormalizedMessage::new(RawMessage::new(-100, 1, text));
        decide(&msg, &RuleSnapshot::defaults(), config)
    }

    #[test]
    fn empty_text_is_rejected_other() {
        let d = classify(" \u{1F695} ");
        assert_eq!(d.verdict, Verdict::RejectedOther);
        assert_eq!(d.reason, "empty_text");
    }

    #[test]
    fn exclude_wins_over_everything() {
        let d = classify("Toshkentdan Samarqandga taxi kerak, vakansiya bor");
        assert_eq!(d.verdict, Verdict::RejectedSpam);
        assert_eq!(d.reason, "excluded_category");
    }

    #[test]
    fn driver_going_beats_strong_request() {
        let d = classify("Men ham yuramiz, kim bor?");
        assert_eq!(d.verdict, Verdict::RejectedOffer);
        assert_eq!(d.reason, "driver_going");

        let d = classify("Toshkentdan Samarqandga ketyapman, 3 joy bor");
        assert_eq!(d.reason, "driver_going");
    }

    #[test]
    fn driver_going_can_be_disabled() {
        let config = RuntimeConfig {
            offer_override: false,
            ..RuntimeConfig::default()
        };
        let d = classify_with("Men ham yuramiz, kim bor?", &config);
        assert_eq!(d.verdict, Verdict::Accepted);
        assert_eq!(d.reason, "strong_request");
    }

    #[test]
    fn offer_without_request_is_rejected() {
        let d = classify("Pochta olib boriladi Toshkent Samarqand arzon narxda");
        assert_eq!(d.verdict, Verdict::RejectedOffer);
        assert_eq!(d.reason, "taxi_offer");

        let d = classify("Cobalt oq rangli, Andijon yo'nalishi, qo'ng'iroq qiling");
        assert_eq!(d.reason, "taxi_offer");
    }

    #[test]
    fn strong_request_accepted_even_when_short() {
        let d = classify("Toshkentdan Buxoroga");
        assert_eq!(d.verdict, Verdict::Accepted);
        assert_eq!(d.reason, "strong_request");

        let d = classify("taxi kerak");
        assert_eq!(d.reason, "strong_request");

        let d = classify("2 kishi bor");
        assert_eq!(d.reason, "strong_request");
    }

    #[test]
    fn short_text_without_strong_pattern() {
        let d = classify("taksi?");
        assert_eq!(d.verdict, Verdict::RejectedTooShort);
        assert_eq!(d.reason, "too_short");
    }

    #[test]
    fn require_contact_gates_keyword_accepts() {
        let config = RuntimeConfig {
            require_contact: true,
            ..RuntimeConfig::default()
        };
        let text = "Ertalab soat 7 da Namanganga mashina qidiryapmiz";
        let d = classify_with(text, &config);
        assert_eq!(d.reason, "no_contact");

        let with_phone = format!("{text} +998 90 123-45-67");
        let d = classify_with(&with_phone, &config);
        assert_eq!(d.verdict, Verdict::Accepted);
        assert_eq!(d.reason, "keyword_match");

        let with_handle = format!("{text} @ali_driver");
        assert_eq!(classify_with(&with_handle, &config).verdict, Verdict::Accepted);
    }

    #[test]
    fn keyword_match_for_long_text() {
        let d = classify("Ertalab soat 7 da Namanganga mashina qidiryapmiz");
        assert_eq!(d.verdict, Verdict::Accepted);
        assert_eq!(d.reason, "keyword_match");
    }

    #[test]
    fn chatter_without_order_pattern() {
        let d = classify("Assalomu alaykum hammaga, bugun havo juda yaxshi ekan");
        assert_eq!(d.verdict, Verdict::RejectedNoPattern);
        assert_eq!(d.reason, "no_order_pattern");
    }

    #[test]
    fn decision_is_deterministic() {
        let text = "Samarqanddan Toshkentga 2 kishi bor";
        assert_eq!(classify(text), classify(text));
    }

    #[test]
    fn contact_detection() {
        assert!(has_contact("tel: +998 (90) 123-45-67"));
        assert!(has_contact("901234567"));
        assert!(has_contact("yozing @haydovchi_uz"));
        assert!(!has_contact("soat 7 da 2 kishi"));
        assert!(!has_contact("email@host.com"));
    }

    #[test]
    fn route_endpoints_are_stemmed() {
        assert_eq!(
            route_endpoints("toshkentdan samarqandga 2 kishi"),
            Some(("toshkent".into(), "samarqand".into()))
        );
        assert_eq!(
            route_endpoints("from tashkent to samarkand"),
            Some(("tashkent".into(), "samarkand".into()))
        );
        assert_eq!(route_endpoints("taxi kerak"), None);
    }

    #[test]
    fn passenger_count_extraction() {
        assert_eq!(passenger_count("toshkentdan 3 kishi bor"), Some(3));
        assert_eq!(passenger_count("2odam"), Some(2));
        assert_eq!(passenger_count("taxi kerak"), None);
    }
}
