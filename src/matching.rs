use crate::content_parser::GreetingCandidate;
use crate::error::GuardError;
use crate::identity_parser::Identity;
use crate::normalization::matching_form;
use serde::{Deserialize, Serialize};
use strsim::damerau_levenshtein;

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.6;
const EXACT_CONFIDENCE: f64 = 1.0;
const PARTIAL_WEIGHT: f64 = 0.8;
const FUZZY_WEIGHT: f64 = 0.6;
const FUZZY_MIN_SIMILARITY: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Partial,
    Fuzzy,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchVerdict {
    pub identity: Option<Identity>,
    pub match_kind: MatchKind,
    pub confidence: f64,
}

impl MatchVerdict {
    pub fn none() -> Self {
        Self {
            identity: None,
            match_kind: MatchKind::None,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub greeting_name: String,
    pub is_valid: bool,
    pub suggested_identity: Option<Identity>,
    pub confidence: f64,
    pub match_kind: MatchKind,
    /// Byte offset of the greeting name in the body it was parsed from.
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchingOptions {
    pub fuzzy_enabled: bool,
    pub min_confidence: f64,
    pub exclude_generic: bool,
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self {
            fuzzy_enabled: true,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            exclude_generic: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchingEngine {
    options: MatchingOptions,
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self {
            options: MatchingOptions::default(),
        }
    }
}

impl MatchingEngine {
    pub fn new(options: MatchingOptions) -> Result<Self, GuardError> {
        if !(0.0..=1.0).contains(&options.min_confidence) {
            return Err(GuardError::Configuration(format!(
                "minimum confidence must be within 0..=1, got {}",
                options.min_confidence
            )));
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> MatchingOptions {
        self.options
    }

    /// Best verdict for one greeting name across `identities`. Ties keep the
    /// identity encountered first.
    pub fn best_match(&self, greeting_name: &str, identities: &[Identity]) -> MatchVerdict {
        let name_forms = name_forms(greeting_name);
        if name_forms.is_empty() {
            return MatchVerdict::none();
        }

        let mut best = MatchVerdict::none();
        for identity in identities {
            let Some((kind, confidence)) = self.score_identity(&name_forms, identity) else {
                continue;
            };
            if confidence > best.confidence {
                best = MatchVerdict {
                    identity: Some(identity.clone()),
                    match_kind: kind,
                    confidence,
                };
            }
        }
        best
    }

    pub fn validate_all(
        &self,
        greetings: &[GreetingCandidate],
        identities: &[Identity],
    ) -> Vec<ValidationResult> {
        let candidates: Vec<Identity> = identities
            .iter()
            .filter(|i| !(self.options.exclude_generic && i.is_generic))
            .cloned()
            .collect();

        greetings
            .iter()
            .map(|greeting| {
                let verdict = self.best_match(&greeting.extracted_name, &candidates);
                let is_valid = verdict.match_kind != MatchKind::None
                    && verdict.confidence >= self.options.min_confidence;
                log::debug!(
                    "Greeting '{}' -> {:?} ({:.2}, valid: {is_valid})",
                    greeting.extracted_name,
                    verdict.match_kind,
                    verdict.confidence
                );
                ValidationResult {
                    greeting_name: greeting.extracted_name.clone(),
                    is_valid,
                    suggested_identity: verdict.identity,
                    confidence: verdict.confidence,
                    match_kind: verdict.match_kind,
                    position: greeting.position,
                }
            })
            .collect()
    }

    fn score_identity(&self, name_forms: &[String], identity: &Identity) -> Option<(MatchKind, f64)> {
        let mut best: Option<(MatchKind, f64)> = None;
        for token in &identity.name_tokens {
            let token_form = matching_form(token);
            if token_form.is_empty() {
                continue;
            }
            for name in name_forms {
                if let Some((kind, confidence)) = self.score_pair(name, &token_form) {
                    if best.map(|(_, c)| confidence > c).unwrap_or(true) {
                        best = Some((kind, confidence));
                    }
                }
            }
        }
        best.filter(|(_, c)| *c > 0.0)
    }

    /// Strategies in escalating order; the first one reaching the highest
    /// confidence wins.
    fn score_pair(&self, name: &str, token: &str) -> Option<(MatchKind, f64)> {
        if name == token {
            return Some((MatchKind::Exact, EXACT_CONFIDENCE));
        }

        let name_len = name.chars().count();
        let token_len = token.chars().count();
        let (shorter, longer) = (name_len.min(token_len), name_len.max(token_len));

        let mut best: Option<(MatchKind, f64)> = None;
        if name.contains(token) || token.contains(name) {
            let confidence = (shorter as f64 / longer as f64) * PARTIAL_WEIGHT;
            best = Some((MatchKind::Partial, confidence.clamp(0.0, 1.0)));
        }

        if self.options.fuzzy_enabled {
            let distance = damerau_levenshtein(name, token);
            let similarity = 1.0 - distance as f64 / longer as f64;
            if similarity > FUZZY_MIN_SIMILARITY {
                let confidence = (similarity * FUZZY_WEIGHT).clamp(0.0, 1.0);
                if best.map(|(_, c)| confidence > c).unwrap_or(true) {
                    best = Some((MatchKind::Fuzzy, confidence));
                }
            }
        }
        best
    }
}

/// Compact form of the whole name followed by each of its words, so
/// "John Smith" can match tokens "john" or "smith" exactly.
fn name_forms(greeting_name: &str) -> Vec<String> {
    let mut forms = Vec::new();
    let whole = matching_form(greeting_name);
    if !whole.is_empty() {
        forms.push(whole);
    }
    let words: Vec<&str> = greeting_name.split_whitespace().collect();
    if words.len() > 1 {
        for word in words {
            let form = matching_form(word);
            if !form.is_empty() && !forms.contains(&form) {
                forms.push(form);
            }
        }
    }
    forms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_parser::IdentityParser;

    fn identity(address: &str, name: Option<&str>) -> Identity {
        IdentityParser::new().parse(address, name).unwrap()
    }

    fn greeting(name: &str) -> GreetingCandidate {
        GreetingCandidate {
            full_text: format!("Hi {name}"),
            extracted_name: name.to_string(),
            position: 3,
            confidence: 0.8,
        }
    }

    fn engine(min_confidence: f64) -> MatchingEngine {
        MatchingEngine::new(MatchingOptions {
            min_confidence,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_exact_match() {
        let verdict = MatchingEngine::default()
            .best_match("John", &[identity("john.doe@x.com", None)]);
        assert_eq!(verdict.match_kind, MatchKind::Exact);
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn test_empty_identities() {
        let verdict = MatchingEngine::default().best_match("John", &[]);
        assert_eq!(verdict.match_kind, MatchKind::None);
        assert_eq!(verdict.confidence, 0.0);
        assert!(verdict.identity.is_none());
    }

    #[test]
    fn test_diacritic_folding() {
        let verdict = MatchingEngine::default()
            .best_match("Jürgen", &[identity("juergen.schulz@x.de", None)]);
        assert_eq!(verdict.match_kind, MatchKind::Exact);
    }

    #[test]
    fn test_partial_match() {
        let verdict = MatchingEngine::default()
            .best_match("Chris", &[identity("christopher.lee@x.com", None)]);
        assert_eq!(verdict.match_kind, MatchKind::Partial);
        let expected = 5.0 / 11.0 * 0.8;
        assert!((verdict.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_fuzzy_match_thresholds() {
        let identities = vec![identity("john.doe@x.com", None)];

        let verdict = MatchingEngine::default().best_match("Jhon", &identities);
        assert_eq!(verdict.match_kind, MatchKind::Fuzzy);
        assert!(verdict.confidence > 0.0 && verdict.confidence <= 0.6);

        let results = engine(0.3).validate_all(&[greeting("Jhon")], &identities);
        assert!(results[0].is_valid);

        let results = engine(0.9).validate_all(&[greeting("Jhon")], &identities);
        assert!(!results[0].is_valid);
        assert_eq!(results[0].match_kind, MatchKind::Fuzzy);
        assert!(results[0].suggested_identity.is_some());
    }

    #[test]
    fn test_fuzzy_disabled() {
        let engine = MatchingEngine::new(MatchingOptions {
            fuzzy_enabled: false,
            ..Default::default()
        })
        .unwrap();
        let verdict = engine.best_match("Jhon", &[identity("john.doe@x.com", None)]);
        assert_eq!(verdict.match_kind, MatchKind::None);
    }

    #[test]
    fn test_ties_keep_first_identity() {
        let identities = vec![
            identity("john.doe@x.com", None),
            identity("john.smith@x.com", None),
        ];
        let verdict = MatchingEngine::default().best_match("John", &identities);
        assert_eq!(
            verdict.identity.map(|i| i.address).as_deref(),
            Some("john.doe@x.com")
        );
    }

    #[test]
    fn test_best_identity_wins() {
        let identities = vec![
            identity("christopher.lee@x.com", None),
            identity("chris.park@x.com", None),
        ];
        let verdict = MatchingEngine::default().best_match("Chris", &identities);
        assert_eq!(verdict.match_kind, MatchKind::Exact);
        assert_eq!(
            verdict.identity.map(|i| i.address).as_deref(),
            Some("chris.park@x.com")
        );
    }

    #[test]
    fn test_multi_word_name() {
        let verdict = MatchingEngine::default()
            .best_match("John Smith", &[identity("jsmith@x.com", Some("John Smith"))]);
        assert_eq!(verdict.match_kind, MatchKind::Exact);
    }

    #[test]
    fn test_generic_identities_excluded() {
        let identities = vec![identity("support@x.com", None)];
        assert!(identities[0].is_generic);

        let results = MatchingEngine::default().validate_all(&[greeting("Support")], &identities);
        assert_eq!(results.len(), 1);
        assert!(results[0].suggested_identity.is_none());
        assert!(!results[0].is_valid);

        let engine = MatchingEngine::new(MatchingOptions {
            exclude_generic: false,
            ..Default::default()
        })
        .unwrap();
        let results = engine.validate_all(&[greeting("Support")], &identities);
        assert!(results[0].is_valid);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        assert!(MatchingEngine::new(MatchingOptions {
            min_confidence: 1.5,
            ..Default::default()
        })
        .is_err());
        assert!(MatchingEngine::new(MatchingOptions {
            min_confidence: f64::NAN,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_confidences_within_bounds() {
        let identities = vec![
            identity("john.doe@x.com", Some("John Doe")),
            identity("anna-lena.meyer@x.de", None),
            identity("a.b@x.com", None),
        ];
        let engine = MatchingEngine::default();
        for name in ["John", "Jon", "Jo", "Anna", "Lena", "Xavier", "J", "Anna-Lena Meyer"] {
            let verdict = engine.best_match(name, &identities);
            assert!((0.0..=1.0).contains(&verdict.confidence), "{name}");
            if verdict.match_kind != MatchKind::Exact {
                assert!(verdict.confidence < 1.0);
            }
        }
    }
}
