use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    /// Lowercase letters with diacritics mapped to their ASCII spelling.
    /// German umlauts expand to two letters the way names are transliterated.
    static ref FOLD_MAP: HashMap<char, &'static str> = {
        let mut m = HashMap::new();
        // German
        m.insert('ä', "ae");
        m.insert('ö', "oe");
        m.insert('ü', "ue");
        m.insert('ß', "ss");
        // Nordic and ligatures
        m.insert('æ', "ae");
        m.insert('ø', "oe");
        m.insert('å', "aa");
        m.insert('œ', "oe");
        // Romance languages
        for c in ['à', 'á', 'â', 'ã', 'ā', 'ă', 'ą'] {
            m.insert(c, "a");
        }
        for c in ['ç', 'ć', 'č'] {
            m.insert(c, "c");
        }
        for c in ['è', 'é', 'ê', 'ë', 'ē', 'ę', 'ě'] {
            m.insert(c, "e");
        }
        for c in ['ì', 'í', 'î', 'ï', 'ī'] {
            m.insert(c, "i");
        }
        for c in ['ñ', 'ń', 'ň'] {
            m.insert(c, "n");
        }
        for c in ['ò', 'ó', 'ô', 'õ', 'ō', 'ő'] {
            m.insert(c, "o");
        }
        for c in ['ù', 'ú', 'û', 'ū', 'ů', 'ű'] {
            m.insert(c, "u");
        }
        for c in ['ý', 'ÿ'] {
            m.insert(c, "y");
        }
        m.insert('ł', "l");
        m.insert('ś', "s");
        m.insert('š', "s");
        m.insert('ž', "z");
        m.insert('ź', "z");
        m.insert('ż', "z");
        m.insert('ř', "r");
        m.insert('đ', "d");
        m
    };
}

const INVISIBLE_CHARS: [char; 5] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'];

/// Remove zero-width characters that editors and copy/paste leave behind.
pub fn strip_invisible(text: &str) -> String {
    text.chars().filter(|c| !INVISIBLE_CHARS.contains(c)).collect()
}

/// Lowercase and transliterate diacritics (`Jürgen` -> `juergen`).
pub fn fold_diacritics(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        match FOLD_MAP.get(&c) {
            Some(replacement) => out.push_str(replacement),
            None => out.push(c),
        }
    }
    out
}

/// Compact form used for name comparison: folded, alphanumerics only.
pub fn matching_form(text: &str) -> String {
    fold_diacritics(text)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Normalise a name token: lowercase, keep letters, digits, hyphens and
/// apostrophes, collapse internal whitespace and trim stray punctuation.
pub fn normalize_token(token: &str) -> String {
    let lowered: String = token
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c == '’' { '\'' } else { c })
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '\'' || c.is_whitespace())
        .collect();

    lowered
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c| c == '-' || c == '\'')
        .to_string()
}

/// Uppercase the first letter of each space- or hyphen-separated part.
pub fn capitalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_start = true;
    for c in name.chars() {
        if at_start && c.is_alphabetic() {
            out.extend(c.to_uppercase());
            at_start = false;
        } else {
            out.push(c);
            if c == ' ' || c == '-' {
                at_start = true;
            }
        }
    }
    out
}
