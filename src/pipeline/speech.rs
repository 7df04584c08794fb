//! Clean language-model output into text a speech synthesizer reads well.

use std::sync::LazyLock;

use regex::Regex;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));
static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));
static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").expect("valid regex"));
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*").expect("valid regex"));
static ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*(.*?)\*").expect("valid regex"));
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`(.*?)`").expect("valid regex"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:https?://|www\.)\S+").expect("valid regex"));
static DIMENSIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)x(\d+)").expect("valid regex"));
static CLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+):(\d+)").expect("valid regex"));
static SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static DOTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.+").expect("valid regex"));
static COMMAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",+").expect("valid regex"));
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([.,!?])").expect("valid regex"));
static DOUBLE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([.,!?])\s*[.,!?]").expect("valid regex"));

/// Symbols spoken as words, longest first so `--` wins over `-`.
const SPOKEN: &[(&str, &str)] = &[
    ("---", ", "),
    ("--", ", "),
    ("...", ", "),
    ("&", " and "),
    ("@", " at "),
    ("%", " percent"),
    ("$", " dollars"),
    ("€", " euros"),
    ("£", " pounds"),
    ("+", " plus "),
    ("=", " equals "),
    ("<", " less than "),
    (">", " greater than "),
    ("/", " slash "),
    ("\\", " backslash "),
    ("|", " pipe "),
    ("~", " tilde "),
    ("^", " caret "),
    ("[", ""),
    ("]", ""),
    ("{", ""),
    ("}", ""),
    ("(", ", "),
    (")", ", "),
    ("\n", ". "),
    ("\t", " "),
];

/// Remove `<think>...</think>` reasoning blocks.
pub fn strip_think_tags(text: &str) -> String {
    let stripped = THINK_BLOCK.replace_all(text, "");
    BLANK_LINES.replace_all(&stripped, "\n").trim().to_string()
}

/// Turn model output into plain speakable sentences.
///
/// ```
/// use rover_pipeline::pipeline::speech::sanitize_for_speech;
///
/// assert_eq!(
///     sanitize_for_speech("<think>hmm</think>**Hello** & welcome!", true),
///     "Hello and welcome!"
/// );
/// ```
pub fn sanitize_for_speech(text: &str, strip_think: bool) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    let mut text = if strip_think {
        strip_think_tags(text)
    } else {
        text.to_string()
    };

    text = CODE_BLOCK.replace_all(&text, "").into_owned();
    text = HEADER
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            let label = match caps[1].len() {
                1 => "Title",
                2 => "Heading",
                _ => "Section",
            };
            format!("{label}: {}.", caps[2].trim())
        })
        .into_owned();
    text = BOLD.replace_all(&text, "$1").into_owned();
    text = ITALIC.replace_all(&text, "$1").into_owned();
    text = INLINE_CODE.replace_all(&text, "$1").into_owned();
    text = URL.replace_all(&text, " web link ").into_owned();

    for (symbol, spoken) in SPOKEN {
        text = text.replace(symbol, spoken);
    }

    text = DIMENSIONS.replace_all(&text, "$1 by $2").into_owned();
    text = CLOCK.replace_all(&text, "$1 colon $2").into_owned();

    text = SPACE.replace_all(&text, " ").into_owned();
    text = DOTS.replace_all(&text, ".").into_owned();
    text = COMMAS.replace_all(&text, ",").into_owned();
    text = SPACE_BEFORE_PUNCT.replace_all(&text, "$1").into_owned();
    text = DOUBLE_PUNCT.replace_all(&text, "$1").into_owned();

    let text: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || " .,!?;:'-".contains(c) {
                c
            } else {
                ' '
            }
        })
        .collect();

    SPACE
        .replace_all(text.trim(), " ")
        .trim_start_matches(|c: char| matches!(c, ',' | '.' | ' '))
        .trim_end_matches(|c: char| matches!(c, ',' | ' '))
        .to_string()
}
