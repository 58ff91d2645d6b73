//! Text normalization and substitutions.
//!
//! Every message is normalized once before matching:
//!
//! ```text
//! "What's UP, Bot?" -> lowercase -> substitutions -> strip -> collapse -> "what is up bot"
//! ```
//!
//! Substitutions replace whole words only, longest pattern first, in a single
//! left-to-right pass: text produced by a replacement is never looked at again,
//! so `i am -> you are` and `you are -> i am` can live side by side.

use regex::Regex;

/// An ordered set of whole-word replacements.
#[derive(Debug, Clone, Default)]
pub(crate) struct Substitutions {
    /// (pattern words, replacement), most words first, then longest first.
    entries: Vec<(Vec<String>, String)>,
}

impl Substitutions {
    pub fn new(pairs: &[(String, String)]) -> Self {
        let mut entries: Vec<(Vec<String>, String)> = pairs
            .iter()
            .map(|(pattern, replacement)| {
                let words = pattern.to_lowercase().split_whitespace().map(str::to_string).collect();
                (words, replacement.clone())
            })
            .filter(|(words, _): &(Vec<String>, String)| !words.is_empty())
            .collect();
        let chars = |words: &[String]| words.iter().map(String::len).sum::<usize>();
        entries.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| chars(b).cmp(&chars(a))));
        Self { entries }
    }

    /// Apply to `text`. Words are split on whitespace; a pattern matches when
    /// its words equal the input words with surrounding punctuation removed.
    pub fn apply(&self, text: &str) -> String {
        if self.entries.is_empty() {
            return text.to_string();
        }
        let words: Vec<&str> = text.split_whitespace().collect();
        let keys: Vec<String> = words.iter().map(|w| word_key(w)).collect();
        let mut out: Vec<String> = Vec::with_capacity(words.len());
        let mut i = 0;
        'scan: while i < words.len() {
            for (pattern, replacement) in &self.entries {
                let n = pattern.len();
                if i + n <= words.len() && keys[i..i + n].iter().zip(pattern).all(|(k, p)| k == p) {
                    let lead = leading_punct(words[i]);
                    let trail = trailing_punct(words[i + n - 1]);
                    out.push(format!("{lead}{replacement}{trail}"));
                    i += n;
                    continue 'scan;
                }
            }
            out.push(words[i].to_string());
            i += 1;
        }
        out.join(" ")
    }
}

/// The comparable core of a word: lowercase, without surrounding punctuation
/// (apostrophes inside a word are kept so `what's` can be substituted).
fn word_key(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'').trim_matches('\'').to_lowercase()
}

fn leading_punct(word: &str) -> &str {
    let core = word.trim_start_matches(|c: char| !c.is_alphanumeric() && c != '\'');
    &word[..word.len() - core.len()]
}

fn trailing_punct(word: &str) -> &str {
    let core = word.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '\'');
    &word[core.len()..]
}

/// Message normalization for one brain.
#[derive(Debug, Clone)]
pub(crate) struct Normalizer {
    pub utf8: bool,
    pub punctuation: Regex,
    pub subs: Substitutions,
}

impl Normalizer {
    /// Normalize a user message, or (`bot_reply`) the bot's previous reply for
    /// `%Previous` matching.
    pub fn format_message(&self, message: &str, bot_reply: bool) -> String {
        let lowered = message.to_lowercase();
        let substituted = self.subs.apply(&lowered);

        let stripped = if self.utf8 {
            let s = regex!(r"[\\<>]").replace_all(&substituted, "");
            let s = self.punctuation.replace_all(&s, "").into_owned();
            if bot_reply { regex!(r"[.?,!;:@#$%^&*()]").replace_all(&s, "").into_owned() } else { s }
        } else {
            let s = regex!(r"\s").replace_all(&substituted, " ");
            regex!(r"[^a-z0-9 ]").replace_all(&s, "").into_owned()
        };
        collapse(&stripped)
    }

    /// Normalize a value that will be spliced into a trigger (`<get>` and
    /// friends); same rules as a user message but without substitutions.
    pub fn format_value(&self, value: &str) -> String {
        let lowered = value.to_lowercase();
        let stripped = if self.utf8 {
            let s = regex!(r"[\\<>]").replace_all(&lowered, "");
            self.punctuation.replace_all(&s, "").into_owned()
        } else {
            let s = regex!(r"\s").replace_all(&lowered, " ");
            regex!(r"[^a-z0-9 ]").replace_all(&s, "").into_owned()
        };
        collapse(&stripped)
    }
}

pub(crate) fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// String transforms behind `{formal}`, `{sentence}`, `{uppercase}` and `{lowercase}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Case {
    Formal,
    Sentence,
    Upper,
    Lower,
}

impl Case {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "formal" => Some(Case::Formal),
            "sentence" => Some(Case::Sentence),
            "uppercase" => Some(Case::Upper),
            "lowercase" => Some(Case::Lower),
            _ => None,
        }
    }

    pub fn apply(self, text: &str) -> String {
        match self {
            Case::Upper => text.to_uppercase(),
            Case::Lower => text.to_lowercase(),
            Case::Sentence => capitalize(text),
            Case::Formal => text.split_whitespace().map(capitalize).collect::<Vec<_>>().join(" "),
        }
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    fn normalizer(utf8: bool, subs: &[(&str, &str)]) -> Normalizer {
        Normalizer { utf8, punctuation: Regex::new(r"[.,!?;:]").unwrap(), subs: Substitutions::new(&pairs(subs)) }
    }

    #[test]
    fn default_mode_strips_everything_but_words() {
        let n = normalizer(false, &[]);
        assert_eq!(n.format_message("Hello   Bot!", false), "hello bot");
        assert_eq!(n.format_message("  I'm <b>here</b>\t", false), "im bhereb");
        assert_eq!(n.format_message("Ça va?", false), "a va");
    }

    #[test]
    fn utf8_mode_keeps_letters() {
        let n = normalizer(true, &[]);
        assert_eq!(n.format_message("Ça va?", false), "ça va");
        assert_eq!(n.format_message("Привет, бот!", false), "привет бот");
        assert_eq!(n.format_message("my email is a@b.com", true), "my email is abcom");
    }

    #[test]
    fn substitutions_run_before_stripping() {
        let n = normalizer(false, &[("what's", "what is"), ("i'm", "i am")]);
        assert_eq!(n.format_message("What's up?", false), "what is up");
        assert_eq!(n.format_message("I'm fine", false), "i am fine");
    }

    #[test]
    fn substitutions_are_single_pass_and_longest_first() {
        let subs = Substitutions::new(&pairs(&[
            ("i am", "you are"),
            ("you are", "i am"),
            ("i", "you"),
            ("you", "me"),
            ("my", "your"),
            ("your", "my"),
        ]));
        assert_eq!(subs.apply("i am here and you are there"), "you are here and i am there");
        assert_eq!(subs.apply("i like your hat"), "you like my hat");
        assert_eq!(subs.apply("tell me, you!"), "tell me, me!");
    }

    #[test]
    fn substitutions_match_whole_words_only() {
        let subs = Substitutions::new(&pairs(&[("he", "she")]));
        assert_eq!(subs.apply("the hero said he would"), "the hero said she would");
    }

    #[test]
    fn case_transforms() {
        assert_eq!(Case::Formal.apply("aiden JAMES"), "Aiden James");
        assert_eq!(Case::Sentence.apply("hello THERE"), "Hello there");
        assert_eq!(Case::Upper.apply("hi"), "HI");
        assert_eq!(Case::Lower.apply("HI"), "hi");
        assert_eq!(Case::from_tag("person"), None);
    }
}
