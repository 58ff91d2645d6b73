//! Trigger scanning (pattern pre-classification).
//!
//! This module inspects the *text* of a trigger pattern and produces the
//! coarse signals the sorter needs, without compiling anything:
//!
//! - **Flags** (`PatternFlags`): which constructs the pattern uses
//!   (alternations, optionals, wildcards, array references, tags).
//! - **Bucket** (`Bucket`): the specificity class derived from the flags.
//! - **Counters**: literal word count, wildcard count, strongest wildcard
//!   class, and character length.
//!
//! `TriggerInfo::sort_key` folds those into a totally ordered key.
//!
//! ## Design notes
//!
//! - The scan is textual. A `_` inside `@array_name` or `<bot user_name>` is not
//!   a wildcard, so array references and tags are blanked out before counting.
//! - A "word" is a plain literal token. Alternation groups, optionals, array
//!   references, tags and bare wildcards are not words; a token like `rus*`
//!   that glues a wildcard onto letters is.
//!
//! ## Invariants
//!
//! - The key depends only on the pattern text plus the declaration index used
//!   as the last tie-break, so sorting the same triggers twice gives the same
//!   order.

use std::cmp::Reverse;

bitflags::bitflags! {
    /// Constructs present in a trigger pattern.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PatternFlags: u8 {
        const ALTERNATION = 1 << 0;
        const OPTIONAL    = 1 << 1;
        const WILDCARD    = 1 << 2;
        const ARRAY       = 1 << 3;
        const TAG         = 1 << 4;
    }
}

/// Specificity buckets, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Atomic,
    Alternation,
    Optional,
    /// Exactly `[*]`: matches any input but may also match nothing.
    LoneOptional,
    Wildcard,
    /// Exactly `_`, `#` or `*`.
    CatchAll,
}

/// Wildcard classes, most restrictive first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WildcardClass {
    Letters,
    Digits,
    Any,
}

/// What the sorter knows about one trigger pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    /// Pattern with `{weight=N}` removed and trimmed.
    pub text: String,
    pub weight: u32,
    pub flags: PatternFlags,
    pub bucket: Bucket,
    pub words: usize,
    pub wildcards: usize,
    pub class: Option<WildcardClass>,
    pub length: usize,
}

/// Total order over triggers; smaller sorts first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    weight: Reverse<u32>,
    bucket: Bucket,
    words: Reverse<usize>,
    class: Option<WildcardClass>,
    wildcards: usize,
    length: Reverse<usize>,
    text: String,
    order: usize,
}

impl TriggerInfo {
    /// Scan a pattern as written in source (weight tag included).
    pub fn scan(pattern: &str) -> Self {
        let (text, weight) = strip_weight(pattern);

        // Blank out array names and tags so their characters don't count.
        let bare = regex!(r"<[^<>]*>").replace_all(&text, " ");
        let bare = regex!(r"@\w+").replace_all(&bare, " ");

        let mut flags = PatternFlags::empty();
        if text.contains('(') {
            flags |= PatternFlags::ALTERNATION;
        }
        if text.contains('[') {
            flags |= PatternFlags::OPTIONAL;
        }
        if text.contains('@') {
            flags |= PatternFlags::ARRAY;
        }
        if text.contains('<') {
            flags |= PatternFlags::TAG;
        }

        let wildcards = bare.chars().filter(|c| matches!(c, '*' | '#' | '_')).count();
        if wildcards > 0 {
            flags |= PatternFlags::WILDCARD;
        }
        let class = if bare.contains('_') {
            Some(WildcardClass::Letters)
        } else if bare.contains('#') {
            Some(WildcardClass::Digits)
        } else if bare.contains('*') {
            Some(WildcardClass::Any)
        } else {
            None
        };

        let bucket = match text.as_str() {
            "[*]" => Bucket::LoneOptional,
            "*" | "#" | "_" => Bucket::CatchAll,
            _ if flags.contains(PatternFlags::WILDCARD) => Bucket::Wildcard,
            _ if flags.contains(PatternFlags::OPTIONAL) => Bucket::Optional,
            _ if flags.intersects(PatternFlags::ALTERNATION | PatternFlags::ARRAY) => Bucket::Alternation,
            _ => Bucket::Atomic,
        };

        let words = split_atoms(&text).into_iter().filter(|atom| is_word(atom)).count();
        let length = text.chars().count();

        TriggerInfo { text, weight, flags, bucket, words, wildcards, class, length }
    }

    /// Unweighted lone wildcards. In a topic that inherits others these run
    /// after the inherited topics' triggers.
    pub fn is_generic(&self) -> bool {
        self.weight == 0 && self.bucket == Bucket::CatchAll
    }

    /// True when the pattern is plain words and can be compared verbatim.
    pub fn is_atomic(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn sort_key(&self, order: usize) -> SortKey {
        SortKey {
            weight: Reverse(self.weight),
            bucket: self.bucket,
            words: Reverse(self.words),
            class: self.class,
            wildcards: self.wildcards,
            length: Reverse(self.length),
            text: self.text.clone(),
            order,
        }
    }
}

/// Remove a `{weight=N}` tag, returning the trimmed pattern and N (0 if absent).
pub(crate) fn strip_weight(pattern: &str) -> (String, u32) {
    let re = regex!(r"\s*\{weight=(\d+)\}\s*");
    let weight = re.captures(pattern).and_then(|c| c[1].parse().ok()).unwrap_or(0);
    let text = re.replace_all(pattern, " ");
    (text.split_whitespace().collect::<Vec<_>>().join(" "), weight)
}

/// Split on top-level whitespace, keeping `( )`, `[ ]` and `< >` groups whole.
pub(crate) fn split_atoms(text: &str) -> Vec<&str> {
    let mut atoms = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    for (i, ch) in text.char_indices() {
        match ch {
            '(' | '[' | '<' => depth += 1,
            ')' | ']' | '>' => depth = depth.saturating_sub(1),
            _ => {}
        }
        if ch.is_whitespace() && depth == 0 {
            if let Some(s) = start.take() {
                atoms.push(&text[s..i]);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        atoms.push(&text[s..]);
    }
    atoms
}

fn is_word(atom: &str) -> bool {
    !atom.starts_with(['(', '[', '@', '<']) && atom.chars().any(char::is_alphanumeric)
}
