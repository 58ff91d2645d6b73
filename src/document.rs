//! The parsed, uncompiled form of a bot.
//!
//! A [`Document`] is what the parser produces and what [`crate::Brain::compile`]
//! consumes. It keeps the source text of every pattern and reply exactly as
//! written (after whitespace cleanup and continuation joining) so that it can
//! be deparsed and written back out.
//!
//! ## Invariants
//!
//! - Triggers inside a topic keep declaration order. Sorting happens at compile
//!   time and never reorders the document.
//! - `subs` and `person` hold unique patterns; re-defining a pattern keeps its
//!   first position and replaces its value.

use std::collections::BTreeMap;

/// Topic name used for the `> begin` block.
pub const BEGIN_TOPIC: &str = "__begin__";

/// Topic every user starts in.
pub const DEFAULT_TOPIC: &str = "random";

/// Where a definition came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub globals: BTreeMap<String, String>,
    pub vars: BTreeMap<String, String>,
    pub subs: Vec<(String, String)>,
    pub person: Vec<(String, String)>,
    pub arrays: BTreeMap<String, Vec<String>>,
    pub topics: BTreeMap<String, Topic>,
    pub objects: Vec<ObjectMacro>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub includes: Vec<String>,
    pub inherits: Vec<String>,
    pub triggers: Vec<Trigger>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trigger {
    /// Pattern text, including any `{weight=N}` tag.
    pub pattern: String,
    pub replies: Vec<String>,
    pub conditions: Vec<String>,
    pub redirect: Option<String>,
    pub previous: Option<String>,
    /// Name of the owning topic.
    pub topic: String,
    pub location: SourceLocation,
}

/// An `> object NAME LANG` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMacro {
    pub name: String,
    pub language: String,
    pub source: Vec<String>,
    pub location: SourceLocation,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    /// Add includes/inherits without duplicating names.
    pub(crate) fn relate(&mut self, includes: &[String], inherits: &[String]) {
        for name in includes {
            if !self.includes.contains(name) {
                self.includes.push(name.clone());
            }
        }
        for name in inherits {
            if !self.inherits.contains(name) {
                self.inherits.push(name.clone());
            }
        }
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    pub(crate) fn topic_mut(&mut self, name: &str) -> &mut Topic {
        self.topics.entry(name.to_string()).or_insert_with(|| Topic::new(name))
    }

    /// Iterate every trigger of every topic, in topic-name then declaration order.
    pub fn triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.topics.values().flat_map(|t| t.triggers.iter())
    }
}

/// Insert, replace (`Some`) or delete (`None`) an ordered key/value pair.
pub(crate) fn upsert(list: &mut Vec<(String, String)>, key: &str, value: Option<String>) {
    let pos = list.iter().position(|(k, _)| k == key);
    match (pos, value) {
        (Some(i), Some(v)) => list[i].1 = v,
        (Some(i), None) => {
            list.remove(i);
        }
        (None, Some(v)) => list.push((key.to_string(), v)),
        (None, None) => {}
    }
}
