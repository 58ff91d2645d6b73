//! The compiled, immutable brain.
//!
//! A [`Brain`] bundles a [`Document`] with everything derived from it: the
//! trigger arena and per-topic match orders, flattened arrays, the message
//! normalizer and the person substitutions. It is never mutated after
//! `compile`; reloading builds a new one.

use super::compiled_triggers::{CompiledTriggers, TriggerId};
use super::format::{Normalizer, Substitutions};
use super::regexp::{PatternCompiler, flatten_arrays};
use crate::Options;
use crate::document::Document;
use crate::error::{CompileError, Diagnostic};
use log::warn;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone)]
pub struct Brain {
    pub(crate) document: Document,
    pub(crate) triggers: CompiledTriggers,
    pub(crate) normalizer: Normalizer,
    pub(crate) person: Substitutions,
    pub(crate) arrays: BTreeMap<String, Vec<String>>,
    pub(crate) depth: usize,
    warnings: Vec<Diagnostic>,
}

impl Brain {
    /// Sort and compile every topic of `document`.
    pub fn compile(document: Document, options: &Options) -> Result<Self, CompileError> {
        let mut warnings = Vec::new();

        let mut declared = HashSet::new();
        for object in &document.objects {
            if !declared.insert((object.name.as_str(), object.language.as_str())) {
                return Err(CompileError::DuplicateObject {
                    name: object.name.clone(),
                    language: object.language.clone(),
                });
            }
        }

        let (arrays, missing) = flatten_arrays(&document.arrays)?;
        for name in missing {
            warnings.push(Diagnostic::new("<brain>", 0, format!("array refers to undefined array @{name}")));
        }

        let compiler = PatternCompiler::new(&arrays, options.utf8);
        let triggers = CompiledTriggers::new(&document, &compiler, &mut warnings)?;

        let depth = match document.globals.get("depth").map(|d| d.trim().parse::<usize>()) {
            Some(Ok(depth)) => depth,
            Some(Err(_)) => {
                warnings.push(Diagnostic::new("<brain>", 0, "global depth is not a number; using the default"));
                options.depth
            }
            None => options.depth,
        };

        let normalizer = Normalizer {
            utf8: options.utf8,
            punctuation: options.unicode_punctuation.clone(),
            subs: Substitutions::new(&document.subs),
        };
        let person = Substitutions::new(&document.person);

        for diagnostic in &warnings {
            warn!("{diagnostic}");
        }

        Ok(Brain { document, triggers, normalizer, person, arrays, depth, warnings })
    }

    /// A brain without triggers: every message gets the no-match marker.
    pub fn empty(options: &Options) -> Self {
        Brain {
            document: Document::new(),
            triggers: CompiledTriggers::default(),
            normalizer: Normalizer {
                utf8: options.utf8,
                punctuation: options.unicode_punctuation.clone(),
                subs: Substitutions::default(),
            },
            person: Substitutions::default(),
            arrays: BTreeMap::new(),
            depth: options.depth,
            warnings: Vec::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Parser and compiler warnings collected while building this brain.
    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub(crate) fn add_warnings(&mut self, mut earlier: Vec<Diagnostic>) {
        earlier.append(&mut self.warnings);
        self.warnings = earlier;
    }

    /// Recursion budget for redirects and tag evaluation.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn has_topic(&self, name: &str) -> bool {
        self.triggers.topics.contains_key(name)
    }

    /// Trigger patterns of `topic` in the order they are tried.
    pub fn sorted_triggers(&self, topic: &str) -> Option<Vec<&str>> {
        let compiled = self.triggers.topic(topic)?;
        Some(compiled.ordered.iter().map(|id| self.pattern(*id)).collect())
    }

    /// `%Previous` triggers of `topic` in the order they are tried.
    pub fn sorted_previous(&self, topic: &str) -> Option<Vec<&str>> {
        let compiled = self.triggers.topic(topic)?;
        Some(compiled.previous.iter().map(|id| self.pattern(*id)).collect())
    }

    pub(crate) fn pattern(&self, id: TriggerId) -> &str {
        &self.triggers.get(id).source.pattern
    }
}
