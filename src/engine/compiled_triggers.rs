//! Trigger compilation and indexing.
//!
//! This module holds the *static* side of the engine: everything derived
//! from a [`Document`] once, so that a reply only walks precomputed lists.
//!
//! The work is split in two phases:
//!
//! 1. **Compile** every trigger of every topic into a [`CompiledTrigger`]
//!    (pattern matcher, optional `%Previous` matcher, scan info).
//! 2. **Index** each topic: resolve its topic graph (`topics.rs`) and store
//!    the resulting match order as a list of ids, once for ordinary triggers
//!    and once for `%Previous` triggers.
//!
//! ## Invariants
//!
//! - `TriggerId` is an index into `CompiledTriggers::triggers`; ids are
//!   assigned in topic-name then declaration order and never change for the
//!   life of a brain.
//! - A trigger id appears at most once in a topic's `ordered` (or `previous`)
//!   list, even when several relations reach its topic.

use super::regexp::{CompiledPattern, PatternCompiler};
use super::topics::TopicGraph;
use super::trigger::{SortKey, TriggerInfo};
use crate::document::{Document, Trigger};
use crate::error::{CompileError, Diagnostic};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Trigger identifier (index into the triggers vector).
pub(crate) type TriggerId = usize;

#[derive(Debug, Clone)]
pub(crate) struct CompiledTrigger {
    pub info: TriggerInfo,
    pub pattern: CompiledPattern,
    pub previous: Option<CompiledPattern>,
    /// The document trigger (replies, conditions, redirect, location).
    pub source: Trigger,
}

/// Match order of one topic, as resolved through its includes/inherits.
#[derive(Debug, Clone, Default)]
pub(crate) struct CompiledTopic {
    pub ordered: Vec<TriggerId>,
    pub previous: Vec<TriggerId>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CompiledTriggers {
    pub triggers: Vec<CompiledTrigger>,
    pub topics: HashMap<String, CompiledTopic>,
}

impl CompiledTriggers {
    /// Compile every topic of `doc`. Non-fatal findings are appended to `warnings`.
    pub fn new(
        doc: &Document,
        compiler: &PatternCompiler<'_>,
        warnings: &mut Vec<Diagnostic>,
    ) -> Result<Self, CompileError> {
        let mut triggers = Vec::new();
        let mut by_topic: BTreeMap<&str, Vec<TriggerId>> = BTreeMap::new();

        for (name, topic) in &doc.topics {
            let ids = by_topic.entry(name.as_str()).or_default();
            for trigger in &topic.triggers {
                let compiled = compile_trigger(trigger, compiler, warnings)?;
                ids.push(triggers.len());
                triggers.push(compiled);
            }
        }

        let graph = TopicGraph::new(doc);
        for (from, to) in graph.dangling() {
            warnings.push(Diagnostic::new("<brain>", 0, format!("topic '{from}' refers to missing topic '{to}'")));
        }

        let keys: Vec<SortKey> = triggers.iter().enumerate().map(|(id, t)| t.info.sort_key(id)).collect();
        let rank = |pool: &[&str], previous: bool| -> (Vec<TriggerId>, Vec<TriggerId>) {
            let mut ids: Vec<TriggerId> = pool
                .iter()
                .filter_map(|name| by_topic.get(*name))
                .flatten()
                .copied()
                .filter(|id| triggers[*id].previous.is_some() == previous)
                .collect();
            ids.sort_by(|a, b| keys[*a].cmp(&keys[*b]));
            ids.into_iter().partition(|id| !triggers[*id].info.is_generic())
        };

        let mut topics = HashMap::new();
        for name in doc.topics.keys() {
            let ordered = graph.resolve(name, &mut |pool: &[&str]| rank(pool, false));
            let previous = graph.resolve(name, &mut |pool: &[&str]| rank(pool, true));
            topics.insert(name.clone(), CompiledTopic { ordered: dedup(ordered), previous: dedup(previous) });
        }

        Ok(CompiledTriggers { triggers, topics })
    }

    pub fn get(&self, id: TriggerId) -> &CompiledTrigger {
        &self.triggers[id]
    }

    pub fn topic(&self, name: &str) -> Option<&CompiledTopic> {
        self.topics.get(name)
    }
}

fn compile_trigger(
    trigger: &Trigger,
    compiler: &PatternCompiler<'_>,
    warnings: &mut Vec<Diagnostic>,
) -> Result<CompiledTrigger, CompileError> {
    let pattern_error = |source| CompileError::Pattern {
        topic: trigger.topic.clone(),
        trigger: trigger.pattern.clone(),
        source,
    };
    let mut report = |missing: Vec<String>| {
        for name in missing {
            warnings.push(Diagnostic::new(
                &trigger.location.file,
                trigger.location.line,
                format!("trigger '{}' refers to undefined array @{name}", trigger.pattern),
            ));
        }
    };

    let (pattern, missing) = compiler.compile(&trigger.pattern).map_err(pattern_error)?;
    report(missing);

    let previous = match &trigger.previous {
        Some(text) => {
            let (previous, missing) = compiler.compile(text).map_err(pattern_error)?;
            report(missing);
            Some(previous)
        }
        None => None,
    };

    Ok(CompiledTrigger { info: TriggerInfo::scan(&trigger.pattern), pattern, previous, source: trigger.clone() })
}

fn dedup(ids: Vec<TriggerId>) -> Vec<TriggerId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Parser, SourceUnit};

    fn compiled(source: &str) -> (Document, CompiledTriggers) {
        let doc = Parser::default().parse(&[SourceUnit::new("test.rive", source)]).unwrap();
        let arrays = BTreeMap::new();
        let compiler = PatternCompiler::new(&arrays, false);
        let triggers = CompiledTriggers::new(&doc, &compiler, &mut Vec::new()).unwrap();
        (doc, triggers)
    }

    fn order(triggers: &CompiledTriggers, topic: &str) -> Vec<String> {
        triggers.topic(topic).unwrap().ordered.iter().map(|id| triggers.get(*id).source.pattern.clone()).collect()
    }

    #[test]
    fn topic_order_puts_inherited_before_catch_all() {
        let (_, triggers) = compiled(
            "
            + *
            - catch all

            + hello
            - hi

            > topic sports inherits random
              + *
              - sports catch all

              + who won
              - nobody
            < topic
            ",
        );
        assert_eq!(order(&triggers, "random"), vec!["hello", "*"]);
        assert_eq!(order(&triggers, "sports"), vec!["who won", "hello", "*", "*"]);
        let sports = &triggers.topic("sports").unwrap().ordered;
        assert_eq!(triggers.get(sports[2]).source.topic, "random");
        assert_eq!(triggers.get(sports[3]).source.topic, "sports");
    }

    #[test]
    fn lone_optional_is_tried_before_wildcards() {
        let (_, triggers) = compiled(
            "
            + *
            - catch all

            + hello *
            - hello something

            + [*]
            - anything

            + hey [there]
            - hey
            ",
        );
        assert_eq!(order(&triggers, "random"), vec!["hey [there]", "[*]", "hello *", "*"]);
    }

    #[test]
    fn previous_triggers_live_apart() {
        let (_, triggers) = compiled(
            "
            + knock knock
            - Who's there?

            + *
            % who is there
            - <star> who?
            ",
        );
        let random = triggers.topic("random").unwrap();
        assert_eq!(random.ordered.len(), 1);
        assert_eq!(random.previous.len(), 1);
        assert!(triggers.get(random.previous[0]).previous.is_some());
    }

    #[test]
    fn undefined_arrays_are_reported() {
        let doc = Parser::default().parse(&[SourceUnit::new("t.rive", "+ i like @fruit\n- yum")]).unwrap();
        let arrays = BTreeMap::new();
        let mut warnings = Vec::new();
        CompiledTriggers::new(&doc, &PatternCompiler::new(&arrays, false), &mut warnings).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].line, 1);
        assert!(warnings[0].message.contains("@fruit"));
    }
}
