//! Sanitize remote object names into filesystem-legal path segments.
//!
//! Implements the `charset` x `mode` matrix of spec.md §4.1.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Charset {
    Unicode,
    Ascii,
    Identifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Similar,
    Typeable,
    CamelCase,
    SnakeCase,
}

fn word_splitter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s\p{P}]+").unwrap())
}

/// Transliterate common umlauts/ligatures before stripping non-target
/// characters, e.g. `ß`→`ss`, `ä`→`ae`.
fn transliterate(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            'ä' => out.push_str("ae"),
            'Ä' => out.push_str("Ae"),
            'ö' => out.push_str("oe"),
            'Ö' => out.push_str("Oe"),
            'ü' => out.push_str("ue"),
            'Ü' => out.push_str("Ue"),
            'ß' => out.push_str("ss"),
            other => out.push(other),
        }
    }
    out
}

fn strip_to_ascii(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii()).collect()
}

fn strip_to_identifier(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

fn to_snake_case(name: &str) -> String {
    word_splitter()
        .split(name)
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

fn to_camel_case(name: &str) -> String {
    word_splitter()
        .split(name)
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<String>()
}

/// Encode `name` for the given `charset`/`mode` combination.
pub fn encode(name: &str, charset: Charset, mode: Mode) -> String {
    match mode {
        Mode::SnakeCase => {
            let base = match charset {
                Charset::Unicode => name.to_owned(),
                Charset::Ascii => strip_to_ascii(&transliterate(name)),
                Charset::Identifier => strip_to_identifier(&transliterate(name)),
            };
            to_snake_case(&base)
        }
        Mode::CamelCase => {
            let base = match charset {
                Charset::Unicode => name.to_owned(),
                Charset::Ascii => strip_to_ascii(&transliterate(name)),
                Charset::Identifier => strip_to_identifier(&transliterate(name)),
            };
            to_camel_case(&base)
        }
        Mode::Typeable => {
            let replaced = match charset {
                Charset::Ascii | Charset::Unicode => name.replace('/', "-").replace(':', "-"),
                Charset::Identifier => name.replace('/', "_").replace(':', "_"),
            };
            match charset {
                Charset::Unicode => replaced,
                Charset::Ascii => strip_to_ascii(&transliterate(&replaced)),
                Charset::Identifier => strip_to_identifier(&transliterate(&replaced)),
            }
        }
        // Unicode can render the readable U+2215/U+2236 substitutes; the
        // narrower charsets can't represent those code points, so Similar
        // falls back to the same plain-ASCII dash/underscore substitution
        // as Typeable for them (spec.md §8: `(Similar, Ascii)` on `A/B:C`
        // yields `A-B-C`, not an empty string from stripping U+2215).
        Mode::Similar => match charset {
            Charset::Unicode => name.replace('/', "\u{2215}").replace(':', "\u{2236}"),
            Charset::Ascii => strip_to_ascii(&transliterate(
                &name.replace('/', "-").replace(':', "-"),
            )),
            Charset::Identifier => strip_to_identifier(&transliterate(
                &name.replace('/', "_").replace(':', "_"),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similar_ascii_maps_slash_and_colon_to_dash() {
        assert_eq!(encode("A/B:C", Charset::Ascii, Mode::Similar), "A-B-C");
    }

    #[test]
    fn similar_unicode_uses_readable_substitutes() {
        assert_eq!(
            encode("A/B:C", Charset::Unicode, Mode::Similar),
            "A\u{2215}B\u{2236}C"
        );
    }

    #[test]
    fn ascii_transliterates_umlauts() {
        assert_eq!(encode("Straße", Charset::Ascii, Mode::Similar), "Strasse");
    }

    #[test]
    fn snake_case_splits_on_punctuation() {
        assert_eq!(
            encode("Algorithms & Data Structures", Charset::Ascii, Mode::SnakeCase),
            "algorithms_data_structures"
        );
    }

    #[test]
    fn camel_case_joins_capitalised_words() {
        assert_eq!(
            encode("algorithms and structures", Charset::Ascii, Mode::CamelCase),
            "AlgorithmsAndStructures"
        );
    }

    #[test]
    fn typeable_ascii_uses_dash() {
        assert_eq!(encode("a/b:c", Charset::Ascii, Mode::Typeable), "a-b-c");
    }

    #[test]
    fn typeable_identifier_uses_underscore() {
        assert_eq!(encode("a/b:c", Charset::Identifier, Mode::Typeable), "a_b_c");
    }
}
