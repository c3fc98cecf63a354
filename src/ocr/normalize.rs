use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Engine languages whose scripts do not separate words with spaces.
const UNSPACED_LANGUAGES: &[&str] = &[
    "jpn",
    "jpn_vert",
    "chi_sim",
    "chi_tra",
    "chi_sim_vert",
    "chi_tra_vert",
    "tha",
    "lao",
    "mya",
    "khm",
    "bod",
];

const TERMINAL_PUNCTUATION: &[char] = &[
    '.', '!', '?', ':', '。', '！', '？', '」', '』', '"', '”', '»', '…',
];

/// Known engine misreads, applied in order.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("ﬁ", "fi"),
    ("ﬂ", "fl"),
    ("ﬀ", "ff"),
    ("ﬃ", "ffi"),
    ("ﬄ", "ffl"),
    ("’", "'"),
    ("‘", "'"),
    ("„", "\""),
    ("—", "-"),
    (" ,", ","),
    (" .", "."),
    (" ;", ";"),
    ("( ", "("),
    (" )", ")"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizeMode {
    /// Pick by engine language.
    #[default]
    Auto,
    /// Drop every whitespace character.
    Compact,
    /// Join soft-wrapped lines and repair common misreads.
    Paragraph,
}

impl NormalizeMode {
    pub fn resolve(self, language: &str) -> NormalizeMode {
        match self {
            NormalizeMode::Auto => {
                let primary = language
                    .split(['+', ',', ' '])
                    .find(|part| !part.trim().is_empty())
                    .unwrap_or("")
                    .trim()
                    .to_lowercase();
                if UNSPACED_LANGUAGES.contains(&primary.as_str()) {
                    NormalizeMode::Compact
                } else {
                    NormalizeMode::Paragraph
                }
            }
            other => other,
        }
    }
}

impl FromStr for NormalizeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "auto" => Ok(NormalizeMode::Auto),
            "compact" => Ok(NormalizeMode::Compact),
            "paragraph" => Ok(NormalizeMode::Paragraph),
            other => Err(format!(
                "unknown normalize mode '{}' (expected auto, compact, paragraph)",
                other
            )),
        }
    }
}

pub fn normalize(raw: &str, mode: NormalizeMode, language: &str) -> String {
    match mode.resolve(language) {
        NormalizeMode::Compact => compact(raw),
        _ => paragraph(raw),
    }
}

fn compact(raw: &str) -> String {
    raw.chars()
        .filter(|ch| !ch.is_whitespace() && !ch.is_control())
        .collect()
}

fn paragraph(raw: &str) -> String {
    let mut out = String::new();
    let mut break_pending = false;
    for line in raw.lines() {
        let line = collapse_whitespace(&fix_misreads(line));
        let line = line.trim();
        if line.is_empty() {
            break_pending = !out.is_empty();
            continue;
        }
        if out.is_empty() {
            out.push_str(line);
        } else if break_pending || ends_sentence(&out) {
            out.push('\n');
            out.push_str(line);
        } else if let Some(stem) = hyphenated_stem(&out) {
            let keep = stem.len();
            out.truncate(keep);
            out.push_str(line);
        } else {
            out = join_inline(&out, line);
        }
        break_pending = false;
    }
    out
}

fn ends_sentence(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .is_some_and(|ch| TERMINAL_PUNCTUATION.contains(&ch))
}

/// Returns the text without its trailing hyphen when the last word was split
/// across lines ("transla-" + "tion").
fn hyphenated_stem(text: &str) -> Option<&str> {
    let stem = text.strip_suffix('-')?;
    stem.chars()
        .last()
        .filter(|ch| ch.is_alphabetic())
        .map(|_| stem)
}

fn join_inline(left: &str, right: &str) -> String {
    if needs_space(left, right) {
        format!("{} {}", left.trim_end(), right.trim_start())
    } else {
        format!("{}{}", left.trim_end(), right.trim_start())
    }
}

fn needs_space(left: &str, right: &str) -> bool {
    let last = left.chars().rev().find(|ch| !ch.is_whitespace());
    let first = right.chars().find(|ch| !ch.is_whitespace());
    match (last, first) {
        (Some(a), Some(b)) => !(is_cjk(a) || is_cjk(b)),
        _ => false,
    }
}

fn collapse_whitespace(value: &str) -> String {
    let mut out = String::new();
    let mut last_space = false;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else if !ch.is_control() {
            out.push(ch);
            last_space = false;
        }
    }
    out
}

fn fix_misreads(line: &str) -> String {
    let mut fixed = line.to_string();
    for (from, to) in SUBSTITUTIONS {
        if fixed.contains(from) {
            fixed = fixed.replace(from, to);
        }
    }

    let chars = fixed.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(fixed.len());
    for (idx, ch) in chars.iter().enumerate() {
        let prev = idx.checked_sub(1).and_then(|i| chars.get(i)).copied();
        let next = chars.get(idx + 1).copied();
        let letter = |c: Option<char>| c.is_some_and(|c| c.is_alphabetic());
        let upper = |c: Option<char>| c.is_some_and(|c| c.is_uppercase());
        let digit = |c: Option<char>| c.is_some_and(|c| c.is_ascii_digit());
        let boundary = |c: Option<char>| c.is_none_or(|c| c.is_whitespace());
        let replaced = match ch {
            '|' if (boundary(prev) && letter(next)) || (boundary(prev) && boundary(next)) => 'I',
            // Zero inside a word takes the case of its neighbours.
            '0' if letter(prev) && letter(next) => {
                if upper(prev) || upper(next) {
                    'O'
                } else {
                    'o'
                }
            }
            'O' if digit(prev) && digit(next) => '0',
            other => *other,
        };
        out.push(replaced);
    }
    out
}

pub(crate) fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3000..=0x303F
            | 0x3040..=0x30FF
            | 0x31F0..=0x31FF
            | 0x3400..=0x4DBF
            | 0x4E00..=0x9FFF
            | 0xAC00..=0xD7AF
            | 0xFF00..=0xFFEF
    )
}
