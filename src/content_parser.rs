//! Greeting extraction from free-form message text.
//!
//! Each language profile compiles three ordered patterns (informal greeting,
//! formal salutation, time-of-day greeting). A pattern only locates the
//! greeting phrase; the trailing name span is scanned by hand so honorific
//! abbreviations ("Mr.") and initials ("J.") do not end it early.

use crate::error::GuardError;
use crate::language::{Language, LanguageDetector, LanguageProfile, LanguageSelector};
use crate::normalization::matching_form;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const BASE_CONFIDENCE: f64 = 0.8;
const FORMAL_BONUS: f64 = 0.1;
const MULTI_TOKEN_BONUS: f64 = 0.1;
const SHORT_NAME_PENALTY: f64 = 0.3;
const MAX_SPAN_CHARS: usize = 80;
const MAX_WORDS_PER_NAME: usize = 3;
const MAX_NAMES_PER_GREETING: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreetingCandidate {
    /// Greeting phrase plus the scanned name span, e.g. "Hi John".
    pub full_text: String,
    pub extracted_name: String,
    /// Byte offset of the extracted name in the parsed text.
    pub position: usize,
    pub confidence: f64,
}

impl GreetingCandidate {
    pub fn normalized_name(&self) -> String {
        matching_form(&self.extracted_name)
    }

    /// Byte offset just past the extracted name.
    pub fn name_end(&self) -> usize {
        self.position + self.extracted_name.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentParseResult {
    pub greetings: Vec<GreetingCandidate>,
    pub has_content: bool,
    pub language: Option<Language>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingForm {
    Informal,
    Formal,
    TimeOfDay,
    Custom,
}

struct GreetingPattern {
    form: GreetingForm,
    regex: Regex,
}

pub struct ContentParser {
    selector: LanguageSelector,
    patterns: HashMap<Language, Vec<GreetingPattern>>,
    custom_patterns: Vec<Regex>,
}

impl ContentParser {
    pub fn new(selector: LanguageSelector, custom_patterns: &[String]) -> Result<Self, GuardError> {
        let mut patterns = HashMap::new();
        for language in Language::ALL {
            patterns.insert(language, Self::compile_profile(language.profile())?);
        }

        let custom_patterns = custom_patterns
            .iter()
            .map(|p| compile_custom_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            selector,
            patterns,
            custom_patterns,
        })
    }

    pub fn selector(&self) -> LanguageSelector {
        self.selector
    }

    fn compile_profile(profile: &LanguageProfile) -> Result<Vec<GreetingPattern>, GuardError> {
        let forms = [
            (GreetingForm::Informal, profile.informal_greetings),
            (GreetingForm::Formal, profile.formal_salutations),
            (GreetingForm::TimeOfDay, profile.time_greetings),
        ];

        let mut compiled = Vec::new();
        for (form, stems) in forms {
            if stems.is_empty() {
                continue;
            }
            let mut sorted: Vec<&str> = stems.to_vec();
            sorted.sort_by_key(|s| std::cmp::Reverse(s.len()));
            let alternation = sorted
                .iter()
                .map(|s| regex::escape(s).replace(' ', r"\s+"))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?im)\b(?P<greeting>{alternation})\b[ \t]*,?[ \t]+");
            let regex = Regex::new(&pattern).map_err(|e| {
                GuardError::Configuration(format!(
                    "built-in {} greeting pattern failed to compile: {e}",
                    profile.language
                ))
            })?;
            compiled.push(GreetingPattern { form, regex });
        }
        Ok(compiled)
    }

    /// Parse with the configured language selector.
    pub fn parse(&self, text: &str) -> ContentParseResult {
        if text.trim().is_empty() {
            return ContentParseResult::default();
        }
        let language = LanguageDetector::resolve(self.selector, text);
        self.parse_with_language(text, language)
    }

    /// Parse with an explicit language, skipping detection.
    pub fn parse_with_language(&self, text: &str, language: Language) -> ContentParseResult {
        if text.trim().is_empty() {
            return ContentParseResult::default();
        }

        let profile = language.profile();
        let mut candidates = Vec::new();

        if let Some(patterns) = self.patterns.get(&language) {
            for pattern in patterns {
                for caps in pattern.regex.captures_iter(text) {
                    let (Some(whole), Some(greeting)) = (caps.get(0), caps.name("greeting")) else {
                        continue;
                    };
                    let span_end = scan_name_span(text, whole.end(), profile);
                    candidates.extend(build_candidates(
                        text,
                        greeting.start(),
                        whole.end(),
                        span_end,
                        pattern.form,
                        profile,
                    ));
                }
            }
        }

        for regex in &self.custom_patterns {
            for caps in regex.captures_iter(text) {
                let (Some(whole), Some(name)) = (caps.get(0), caps.name("name")) else {
                    continue;
                };
                candidates.extend(build_candidates(
                    text,
                    whole.start(),
                    name.start(),
                    name.end(),
                    GreetingForm::Custom,
                    profile,
                ));
            }
        }

        let greetings = dedupe_by_name(candidates);
        log::debug!(
            "Content parser ({language}) found {} greeting name(s)",
            greetings.len()
        );

        ContentParseResult {
            greetings,
            has_content: true,
            language: Some(language),
        }
    }
}

/// Compile a user-supplied greeting pattern. It must contain a `name` group.
pub fn compile_custom_pattern(pattern: &str) -> Result<Regex, GuardError> {
    let regex = Regex::new(pattern).map_err(|e| {
        GuardError::Configuration(format!("malformed greeting pattern '{pattern}': {e}"))
    })?;
    if !regex.capture_names().flatten().any(|n| n == "name") {
        return Err(GuardError::Configuration(format!(
            "greeting pattern '{pattern}' has no (?P<name>...) group"
        )));
    }
    Ok(regex)
}

/// Sort by position and keep the first candidate per normalised name.
pub fn dedupe_by_name(mut candidates: Vec<GreetingCandidate>) -> Vec<GreetingCandidate> {
    candidates.sort_by_key(|c| c.position);
    let mut seen = HashSet::new();
    candidates.retain(|c| {
        let key = c.normalized_name();
        !key.is_empty() && seen.insert(key)
    });
    candidates
}

fn is_hard_terminator(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '!' | '?' | ':' | ';' | '(' | ')' | '"' | '<' | '>' | '[' | ']' | '/' | '|'
            | '\u{2014}' | '\u{2013}'
    ) || c.is_ascii_digit()
}

/// Find where the name span starting at `start` ends. A period ends the span
/// unless it closes an honorific abbreviation or a single-letter initial.
fn scan_name_span(text: &str, start: usize, profile: &LanguageProfile) -> usize {
    let rest = &text[start..];
    let mut word_start = 0;
    let mut chars_seen = 0;

    for (i, c) in rest.char_indices() {
        chars_seen += 1;
        if chars_seen > MAX_SPAN_CHARS {
            return start + i;
        }
        if c.is_whitespace() || c == ',' {
            word_start = i + c.len_utf8();
            continue;
        }
        if c == '.' {
            let word = &rest[word_start..i];
            let is_initial = word.chars().count() == 1;
            if !(is_initial || profile.is_honorific(word)) {
                return start + i;
            }
            continue;
        }
        if is_hard_terminator(c) {
            return start + i;
        }
    }
    text.len()
}

enum Piece<'a> {
    Word(&'a str, usize),
    Separator,
}

fn split_pieces(span: &str, offset: usize) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut word_start: Option<usize> = None;

    for (i, c) in span.char_indices() {
        if c.is_whitespace() || c == ',' {
            if let Some(s) = word_start.take() {
                pieces.push(Piece::Word(&span[s..i], offset + s));
            }
            if c == ',' {
                pieces.push(Piece::Separator);
            }
        } else if word_start.is_none() {
            word_start = Some(i);
        }
    }
    if let Some(s) = word_start {
        pieces.push(Piece::Word(&span[s..], offset + s));
    }
    pieces
}

/// Trim punctuation around a word; `None` if what remains cannot be part of a name.
fn clean_word(word: &str, offset: usize) -> Option<(&str, usize)> {
    let is_name_char = |c: char| c.is_alphabetic() || c == '-' || c == '\'' || c == '’';
    let trimmed_start = word.trim_start_matches(|c: char| !c.is_alphabetic());
    let lead = word.len() - trimmed_start.len();
    let cleaned = trimmed_start.trim_end_matches(|c: char| !c.is_alphabetic());
    if cleaned.is_empty() || !cleaned.chars().all(is_name_char) {
        return None;
    }
    Some((cleaned, offset + lead))
}

struct NameSpan<'a> {
    words: Vec<(&'a str, usize)>,
}

/// Split a name span into names: commas and conjunctions separate names,
/// whitespace separates the words of one name.
fn extract_names<'a>(text: &'a str, start: usize, end: usize, profile: &LanguageProfile) -> Vec<NameSpan<'a>> {
    let span = &text[start..end];
    let mut names = Vec::new();
    let mut current: Vec<(&str, usize)> = Vec::new();

    let flush = |current: &mut Vec<(&'a str, usize)>, names: &mut Vec<NameSpan<'a>>| {
        if !current.is_empty() {
            let mut words = std::mem::take(current);
            words.truncate(MAX_WORDS_PER_NAME);
            names.push(NameSpan { words });
        }
    };

    for piece in split_pieces(span, start) {
        match piece {
            Piece::Separator => flush(&mut current, &mut names),
            Piece::Word(word, offset) => {
                if profile.is_conjunction(word) {
                    flush(&mut current, &mut names);
                    continue;
                }
                // Honorifics are stripped, not treated as names.
                if profile.is_honorific(word) {
                    continue;
                }
                let Some((cleaned, clean_offset)) = clean_word(word, offset) else {
                    break;
                };
                if profile.is_follow_on_word(cleaned) {
                    break;
                }
                if profile.is_common_word(cleaned) {
                    continue;
                }
                current.push((cleaned, clean_offset));
            }
        }
        if names.len() >= MAX_NAMES_PER_GREETING {
            break;
        }
    }
    flush(&mut current, &mut names);
    names.truncate(MAX_NAMES_PER_GREETING);
    names
}

fn build_candidates(
    text: &str,
    greeting_start: usize,
    span_start: usize,
    span_end: usize,
    form: GreetingForm,
    profile: &LanguageProfile,
) -> Vec<GreetingCandidate> {
    if span_end <= span_start {
        return Vec::new();
    }
    let names = extract_names(text, span_start, span_end, profile);
    let Some(text_end) = names
        .iter()
        .filter_map(|n| n.words.last().map(|(w, offset)| offset + w.len()))
        .max()
    else {
        return Vec::new();
    };
    let full_text = text[greeting_start..text_end].to_string();

    names
        .into_iter()
        .filter_map(|name| {
            let (_, position) = *name.words.first()?;
            let extracted_name = name
                .words
                .iter()
                .map(|(w, _)| *w)
                .collect::<Vec<_>>()
                .join(" ");
            Some(GreetingCandidate {
                confidence: score_confidence(&extracted_name, name.words.len(), form),
                full_text: full_text.clone(),
                extracted_name,
                position,
            })
        })
        .collect()
}

fn score_confidence(name: &str, word_count: usize, form: GreetingForm) -> f64 {
    let mut confidence = BASE_CONFIDENCE;
    if form == GreetingForm::Formal {
        confidence += FORMAL_BONUS;
    }
    if word_count > 1 {
        confidence += MULTI_TOKEN_BONUS;
    }
    if matching_form(name).chars().count() <= 2 {
        confidence -= SHORT_NAME_PENALTY;
    }
    confidence.clamp(0.0, 1.0)
}
