use crate::error::GuardError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "de")]
    German,
    #[serde(rename = "fr")]
    French,
    #[serde(rename = "es")]
    Spanish,
    #[serde(rename = "pt")]
    Portuguese,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::English,
        Language::German,
        Language::French,
        Language::Spanish,
        Language::Portuguese,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::German => "de",
            Language::French => "fr",
            Language::Spanish => "es",
            Language::Portuguese => "pt",
        }
    }

    pub fn profile(&self) -> &'static LanguageProfile {
        match self {
            Language::English => &ENGLISH,
            Language::German => &GERMAN,
            Language::French => &FRENCH,
            Language::Spanish => &SPANISH,
            Language::Portuguese => &PORTUGUESE,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "en" | "english" => Ok(Language::English),
            "de" | "german" | "deutsch" => Ok(Language::German),
            "fr" | "french" | "français" => Ok(Language::French),
            "es" | "spanish" | "español" => Ok(Language::Spanish),
            "pt" | "portuguese" | "português" => Ok(Language::Portuguese),
            other => Err(GuardError::Configuration(format!(
                "unsupported language: {other}"
            ))),
        }
    }
}

/// Either a fixed language or detection per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LanguageSelector {
    #[default]
    Auto,
    Fixed(Language),
}

impl FromStr for LanguageSelector {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(LanguageSelector::Auto)
        } else {
            s.parse().map(LanguageSelector::Fixed)
        }
    }
}

impl fmt::Display for LanguageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LanguageSelector::Auto => f.write_str("auto"),
            LanguageSelector::Fixed(lang) => write!(f, "{lang}"),
        }
    }
}

/// Word lists driving greeting extraction for one language.
/// Every entry is lowercase; multi-word stems are separated by single spaces.
#[derive(Debug)]
pub struct LanguageProfile {
    pub language: Language,
    pub informal_greetings: &'static [&'static str],
    pub formal_salutations: &'static [&'static str],
    pub time_greetings: &'static [&'static str],
    pub honorifics: &'static [&'static str],
    pub conjunctions: &'static [&'static str],
    /// Words that look like names after a greeting but address a group or nobody.
    pub common_words: &'static [&'static str],
    /// Words that end a name span ("Hi John, how are you").
    pub follow_on_words: &'static [&'static str],
    /// High-frequency words used only for detection.
    pub function_words: &'static [&'static str],
}

impl LanguageProfile {
    pub fn is_honorific(&self, word: &str) -> bool {
        let w = word.trim_end_matches('.').to_lowercase();
        self.honorifics.contains(&w.as_str())
    }

    pub fn is_common_word(&self, word: &str) -> bool {
        self.common_words.contains(&word.to_lowercase().as_str())
    }

    pub fn is_follow_on_word(&self, word: &str) -> bool {
        self.follow_on_words.contains(&word.to_lowercase().as_str())
    }

    pub fn is_conjunction(&self, word: &str) -> bool {
        self.conjunctions.contains(&word.to_lowercase().as_str())
    }

    fn greeting_stems(&self) -> impl Iterator<Item = &&'static str> {
        self.informal_greetings
            .iter()
            .chain(self.formal_salutations.iter())
            .chain(self.time_greetings.iter())
    }
}

pub static ENGLISH: LanguageProfile = LanguageProfile {
    language: Language::English,
    informal_greetings: &["hi", "hello", "hey", "hiya", "howdy", "greetings"],
    formal_salutations: &["dear", "dearest"],
    time_greetings: &["good morning", "good afternoon", "good evening", "good day", "morning"],
    honorifics: &["mr", "mrs", "ms", "miss", "mx", "dr", "prof", "professor", "sir", "madam", "dame", "rev", "mister"],
    conjunctions: &["and", "or", "&"],
    common_words: &[
        "all", "everyone", "everybody", "team", "folks", "guys", "there", "friends", "colleagues",
        "sir", "madam", "you", "both", "again", "people", "whom", "customer", "valued", "world",
        "back", "hiring", "manager", "committee", "y'all", "sirs", "team's",
    ],
    follow_on_words: &[
        "how", "i", "i'm", "im", "we", "hope", "thanks", "thank", "just", "it", "this", "please",
        "sorry", "welcome", "great", "good", "nice", "as", "following", "regarding", "re", "so",
        "quick", "here", "attached", "what", "can", "could", "would", "let", "to", "the", "a",
        "an", "for", "from", "in", "on", "at", "about", "back",
    ],
    function_words: &[
        "the", "and", "is", "are", "you", "to", "of", "for", "with", "this", "that", "have",
        "will", "please", "thanks", "your", "would", "could",
    ],
};

pub static GERMAN: LanguageProfile = LanguageProfile {
    language: Language::German,
    informal_greetings: &["hallo", "hi", "hey", "servus", "moin", "grüß dich", "grüezi"],
    formal_salutations: &["sehr geehrte", "sehr geehrter", "geehrte", "geehrter", "liebe", "lieber", "liebes"],
    time_greetings: &["guten morgen", "guten tag", "guten abend"],
    honorifics: &["herr", "frau", "dr", "prof", "professor", "fräulein"],
    conjunctions: &["und", "oder", "&"],
    common_words: &[
        "alle", "zusammen", "team", "kollegen", "kolleginnen", "leute", "damen", "herren",
        "freunde", "ihr", "du", "sie", "allerseits",
    ],
    follow_on_words: &["wie", "ich", "wir", "vielen", "danke", "hoffe", "anbei", "bitte", "es", "gerne"],
    function_words: &[
        "der", "die", "das", "und", "ist", "nicht", "ich", "sie", "mit", "für", "wir", "zu",
        "den", "ein", "eine", "ihnen", "bitte", "grüße",
    ],
};

pub static FRENCH: LanguageProfile = LanguageProfile {
    language: Language::French,
    informal_greetings: &["salut", "bonjour", "coucou"],
    formal_salutations: &["cher", "chère", "chers", "chères"],
    time_greetings: &["bonsoir"],
    honorifics: &["m", "mme", "mlle", "madame", "monsieur", "mademoiselle", "dr", "docteur", "professeur", "maître"],
    conjunctions: &["et", "ou", "&"],
    common_words: &["tous", "toutes", "tout", "le", "monde", "équipe", "collègues", "amis", "vous", "toi"],
    follow_on_words: &["comment", "je", "nous", "merci", "j'espère", "voici", "ça", "ci-joint"],
    function_words: &[
        "le", "la", "les", "et", "est", "vous", "je", "nous", "pour", "avec", "une", "des", "que",
        "pas", "merci", "cordialement",
    ],
};

pub static SPANISH: LanguageProfile = LanguageProfile {
    language: Language::Spanish,
    informal_greetings: &["hola", "buenas", "qué tal"],
    formal_salutations: &["estimado", "estimada", "estimados", "estimadas", "querido", "querida", "queridos", "queridas"],
    time_greetings: &["buenos días", "buenas tardes", "buenas noches"],
    honorifics: &["sr", "sra", "srta", "señor", "señora", "señorita", "don", "doña", "dr", "dra"],
    conjunctions: &["y", "e", "o", "u", "&"],
    common_words: &["todos", "todas", "equipo", "amigos", "colegas", "usted", "ustedes"],
    follow_on_words: &["cómo", "como", "yo", "espero", "gracias", "te", "le", "les", "adjunto"],
    function_words: &[
        "el", "la", "los", "las", "y", "es", "que", "de", "por", "para", "con", "una", "usted",
        "gracias", "saludos",
    ],
};

pub static PORTUGUESE: LanguageProfile = LanguageProfile {
    language: Language::Portuguese,
    informal_greetings: &["olá", "ola", "oi"],
    formal_salutations: &["prezado", "prezada", "prezados", "prezadas", "caro", "cara", "caros", "caras"],
    time_greetings: &["bom dia", "boa tarde", "boa noite"],
    honorifics: &["sr", "sra", "senhor", "senhora", "dr", "dra", "dona"],
    conjunctions: &["e", "ou", "&"],
    common_words: &["todos", "todas", "equipe", "equipa", "amigos", "colegas", "você", "vocês"],
    follow_on_words: &["como", "eu", "espero", "obrigado", "obrigada", "tudo", "segue"],
    function_words: &[
        "o", "os", "as", "e", "é", "não", "que", "de", "para", "com", "uma", "você", "obrigado",
        "atenciosamente",
    ],
};

pub struct LanguageDetector;

impl LanguageDetector {
    /// Pick the profile whose function words and greeting stems occur most
    /// often. No signal at all, or a tie with English, yields English.
    pub fn detect(text: &str) -> Language {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !(c.is_alphabetic() || c == '\''))
            .filter(|w| !w.is_empty())
            .collect();
        let word_set: HashSet<&str> = words.iter().copied().collect();

        let mut best = Language::English;
        let mut best_score = Self::score(&ENGLISH, &lowered, &words, &word_set);

        for language in Language::ALL.iter().skip(1) {
            let score = Self::score(language.profile(), &lowered, &words, &word_set);
            if score > best_score {
                best = *language;
                best_score = score;
            }
        }

        log::debug!("Detected greeting language {best} (score {best_score})");
        best
    }

    fn score(
        profile: &LanguageProfile,
        lowered: &str,
        words: &[&str],
        word_set: &HashSet<&str>,
    ) -> usize {
        let function_hits = words
            .iter()
            .filter(|w| profile.function_words.contains(w))
            .count();

        let stem_hits = profile
            .greeting_stems()
            .filter(|stem| {
                if stem.contains(' ') {
                    lowered.contains(**stem)
                } else {
                    word_set.contains(**stem)
                }
            })
            .count();

        function_hits + stem_hits * 2
    }

    pub fn resolve(selector: LanguageSelector, text: &str) -> Language {
        match selector {
            LanguageSelector::Fixed(language) => language,
            LanguageSelector::Auto => Self::detect(text),
        }
    }
}
