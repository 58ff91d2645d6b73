//! Pattern compilation (trigger DSL to executable matcher).
//!
//! ```text
//! "my name is *"            -> ^my\s+name\s+is\s+(.+?)$
//! "i am # years old"        -> ^i\s+am\s+([0-9]+?)\s+years\s+old$
//! "what (are|is) you"       -> ^what\s+(are|is)\s+you$
//! "[please] ask me"         -> ^(?:(?:\s+|\b)(?:please)(?:\s+|\b)|\s+|\b|^|$)ask\s+me$
//! "i like (@colors)"        -> ^i\s+like\s+((?:red|dark\s+blue))$
//! "*"                       -> ^(.*?)$
//! "hello bot"               -> exact string comparison
//! "<bot name> is *"         -> pieces, finished at match time
//! ```
//!
//! ## Design notes
//!
//! - Only top-level wildcards and `( )` groups capture, so capture indices line
//!   up with `<star1>`, `<star2>`, ... in source order.
//! - Optionals absorb their surrounding whitespace, which is why no separator
//!   is emitted next to them.
//! - Arrays are flattened once per brain (`flatten_arrays`); a reference cycle
//!   is a compile error rather than a runtime surprise.
//! - Trigger tags (`<bot>`, `<get>`, `<input>`, `<reply>`) depend on runtime
//!   state. Patterns containing them are kept as `Piece`s and turned into a
//!   regex per match attempt.

use super::trigger::{TriggerInfo, split_atoms};
use crate::error::CompileError;
use regex::Regex;
use std::collections::BTreeMap;

/// Runtime values a trigger may reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TriggerTag {
    Bot(String),
    Get(String),
    Input(usize),
    Reply(usize),
}

/// Supplies (already normalized) values for trigger tags.
pub(crate) trait TagSource {
    fn resolve(&self, tag: &TriggerTag) -> String;
}

#[derive(Debug, Clone)]
pub(crate) enum Piece {
    Regex(String),
    Tag(TriggerTag),
}

#[derive(Debug, Clone)]
pub(crate) enum CompiledPattern {
    Exact(String),
    Static(Regex),
    Dynamic(Vec<Piece>),
}

impl CompiledPattern {
    /// Match a normalized input, returning the captured stars.
    pub fn captures(&self, input: &str, tags: &dyn TagSource) -> Option<Vec<String>> {
        match self {
            CompiledPattern::Exact(text) => (text == input).then(Vec::new),
            CompiledPattern::Static(re) => collect(re, input),
            CompiledPattern::Dynamic(pieces) => {
                let mut source = String::new();
                for piece in pieces {
                    match piece {
                        Piece::Regex(re) => source.push_str(re),
                        Piece::Tag(tag) => source.push_str(&regex::escape(&tags.resolve(tag))),
                    }
                }
                let re = Regex::new(&source).ok()?;
                collect(&re, input)
            }
        }
    }
}

fn collect(re: &Regex, input: &str) -> Option<Vec<String>> {
    let caps = re.captures(input)?;
    Some((1..caps.len()).map(|i| caps.get(i).map_or("", |m| m.as_str()).to_string()).collect())
}

/// Resolve every array to its flat member list, following `@name` members.
///
/// Returns the flat table plus the names of referenced arrays that don't exist.
pub(crate) fn flatten_arrays(
    arrays: &BTreeMap<String, Vec<String>>,
) -> Result<(BTreeMap<String, Vec<String>>, Vec<String>), CompileError> {
    let mut flat = BTreeMap::new();
    let mut missing = Vec::new();
    for name in arrays.keys() {
        let mut out = Vec::new();
        expand_array(name, arrays, &mut Vec::new(), &mut out, &mut missing)?;
        flat.insert(name.clone(), out);
    }
    missing.sort();
    missing.dedup();
    Ok((flat, missing))
}

fn expand_array(
    name: &str,
    arrays: &BTreeMap<String, Vec<String>>,
    stack: &mut Vec<String>,
    out: &mut Vec<String>,
    missing: &mut Vec<String>,
) -> Result<(), CompileError> {
    if stack.iter().any(|s| s == name) {
        let path = stack.iter().map(String::as_str).chain([name]).collect::<Vec<_>>().join(" -> ");
        return Err(CompileError::ArrayCycle { name: stack[0].clone(), path });
    }
    let Some(members) = arrays.get(name) else {
        missing.push(name.to_string());
        return Ok(());
    };
    stack.push(name.to_string());
    for member in members {
        match member.strip_prefix('@').filter(|r| !r.is_empty()) {
            Some(nested) => expand_array(nested, arrays, stack, out, missing)?,
            None if !out.contains(member) => out.push(member.clone()),
            None => {}
        }
    }
    stack.pop();
    Ok(())
}

/// Compiles trigger text against one brain's arrays.
pub(crate) struct PatternCompiler<'a> {
    arrays: &'a BTreeMap<String, Vec<String>>,
    utf8: bool,
}

/// Pieces under construction; adjacent regex text is merged.
#[derive(Default)]
struct Builder {
    pieces: Vec<Piece>,
    /// Array names referenced but not defined.
    missing: Vec<String>,
}

impl Builder {
    fn push(&mut self, re: &str) {
        if let Some(Piece::Regex(last)) = self.pieces.last_mut() {
            last.push_str(re);
        } else {
            self.pieces.push(Piece::Regex(re.to_string()));
        }
    }

    fn tag(&mut self, tag: TriggerTag) {
        self.pieces.push(Piece::Tag(tag));
    }
}

impl<'a> PatternCompiler<'a> {
    /// `arrays` must already be flat (see [`flatten_arrays`]).
    pub fn new(arrays: &'a BTreeMap<String, Vec<String>>, utf8: bool) -> Self {
        Self { arrays, utf8 }
    }

    /// Compile `pattern` (weight tag allowed). Also returns undefined array names.
    pub fn compile(&self, pattern: &str) -> Result<(CompiledPattern, Vec<String>), regex::Error> {
        let info = TriggerInfo::scan(pattern);
        if info.is_atomic() {
            return Ok((CompiledPattern::Exact(info.text), Vec::new()));
        }

        let mut b = Builder::default();
        b.push("^");
        if info.text == "*" {
            b.push("(.*?)");
        } else {
            self.sequence(&info.text, true, &mut b);
        }
        b.push("$");

        let Builder { pieces, missing } = b;
        let compiled = match pieces.as_slice() {
            [Piece::Regex(source)] => CompiledPattern::Static(Regex::new(source)?),
            _ => {
                // Validate the static skeleton once with empty tag values.
                let probe: String = pieces
                    .iter()
                    .map(|p| match p {
                        Piece::Regex(re) => re.as_str(),
                        Piece::Tag(_) => "",
                    })
                    .collect();
                Regex::new(&probe)?;
                CompiledPattern::Dynamic(pieces)
            }
        };
        Ok((compiled, missing))
    }

    /// Render whitespace separated atoms.
    fn sequence(&self, text: &str, capture: bool, b: &mut Builder) {
        let mut prev_optional = true;
        for atom in split_atoms(text) {
            let optional = atom.starts_with('[') && atom.ends_with(']');
            if !prev_optional && !optional {
                b.push(r"\s+");
            }
            if optional {
                self.optional(&atom[1..atom.len() - 1], b);
            } else if atom.starts_with('(') && atom.ends_with(')') {
                self.group(&atom[1..atom.len() - 1], b);
            } else {
                self.word(atom, capture, b);
            }
            prev_optional = optional;
        }
    }

    fn alternatives(&self, inner: &str, b: &mut Builder) {
        for (i, alt) in split_alternatives(inner).into_iter().enumerate() {
            if i > 0 {
                b.push("|");
            }
            self.sequence(alt.trim(), false, b);
        }
    }

    fn optional(&self, inner: &str, b: &mut Builder) {
        b.push(r"(?:(?:\s+|\b)(?:");
        self.alternatives(inner, b);
        b.push(r")(?:\s+|\b)|\s+|\b|^|$)");
    }

    fn group(&self, inner: &str, b: &mut Builder) {
        b.push("(");
        self.alternatives(inner, b);
        b.push(")");
    }

    fn word(&self, word: &str, capture: bool, b: &mut Builder) {
        let standalone = word.chars().count() == 1;
        let mut literal = String::new();
        let mut rest = word;
        while let Some(ch) = rest.chars().next() {
            match ch {
                '<' if rest.contains('>') => {
                    let end = rest.find('>').unwrap_or(rest.len());
                    let tag = &rest[1..end];
                    match parse_trigger_tag(tag) {
                        Some(tag) => {
                            flush(&mut literal, b);
                            b.tag(tag);
                        }
                        None => literal.push_str(&rest[..=end]),
                    }
                    rest = &rest[end + 1..];
                    continue;
                }
                '@' => {
                    let name: String = rest[1..].chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
                    if !name.is_empty() {
                        flush(&mut literal, b);
                        self.array(&name, b);
                        rest = &rest[1 + name.len()..];
                        continue;
                    }
                    literal.push(ch);
                }
                '*' | '#' | '_' => {
                    flush(&mut literal, b);
                    let body = match (ch, standalone) {
                        ('*', true) => ".+?",
                        ('*', false) => r"\w*?",
                        ('#', _) if self.utf8 => r"\d+?",
                        ('#', _) => "[0-9]+?",
                        (_, _) if self.utf8 => r"\p{L}+?",
                        _ => "[a-z]+?",
                    };
                    if capture {
                        b.push(&format!("({body})"));
                    } else {
                        b.push(&format!("(?:{body})"));
                    }
                }
                _ => literal.push(ch),
            }
            rest = &rest[ch.len_utf8()..];
        }
        flush(&mut literal, b);
    }

    fn array(&self, name: &str, b: &mut Builder) {
        let Some(members) = self.arrays.get(name).filter(|m| !m.is_empty()) else {
            b.missing.push(name.to_string());
            b.push(r"(?:\b\B)");
            return;
        };
        b.push("(?:");
        for (i, member) in members.iter().enumerate() {
            if i > 0 {
                b.push("|");
            }
            let member = member.to_lowercase();
            let mut inner = Builder::default();
            self.sequence(member.trim(), false, &mut inner);
            for piece in inner.pieces {
                match piece {
                    Piece::Regex(re) => b.push(&re),
                    Piece::Tag(tag) => b.tag(tag),
                }
            }
        }
        b.push(")");
    }
}

fn flush(literal: &mut String, b: &mut Builder) {
    if !literal.is_empty() {
        b.push(&regex::escape(literal));
        literal.clear();
    }
}

/// Split on top-level `|`.
fn split_alternatives(inner: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in inner.char_indices() {
        match ch {
            '(' | '[' | '<' => depth += 1,
            ')' | ']' | '>' => depth = depth.saturating_sub(1),
            '|' if depth == 0 => {
                parts.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&inner[start..]);
    parts
}

fn parse_trigger_tag(tag: &str) -> Option<TriggerTag> {
    let tag = tag.trim();
    let (name, arg) = tag.split_once(' ').map_or((tag, ""), |(n, a)| (n, a.trim()));
    let index = |base: &str| -> Option<usize> {
        let digits = name.strip_prefix(base)?;
        let digits = if digits.is_empty() { arg } else { digits };
        if digits.is_empty() { Some(1) } else { digits.parse().ok() }
    };
    match name {
        "bot" if !arg.is_empty() => Some(TriggerTag::Bot(arg.to_string())),
        "get" if !arg.is_empty() => Some(TriggerTag::Get(arg.to_string())),
        _ if name.starts_with("input") => index("input").map(TriggerTag::Input),
        _ if name.starts_with("reply") => index("reply").map(TriggerTag::Reply),
        _ => None,
    }
}
