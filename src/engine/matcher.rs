//! Input matching.
//!
//! ```text
//! previous reply known? ── yes ──> topic.previous (resolved order)
//!                                    bot side matches last reply?
//!                                    user side matches input?  ── first hit wins
//!          │
//!          └────────────────────> topic.ordered (resolved order) ── first hit wins
//! ```
//!
//! Both lists are precomputed per topic, so a match is a linear walk that
//! stops at the first trigger accepting the input. The order is total, so the
//! same `(topic, input)` always yields the same trigger.

use super::brain::Brain;
use super::compiled_triggers::TriggerId;
use super::regexp::TagSource;
use log::debug;

/// A successful match: the trigger and what its wildcards captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Match {
    pub id: TriggerId,
    pub stars: Vec<String>,
    /// Captures of the `%Previous` pattern, if that is how we matched.
    pub botstars: Vec<String>,
}

impl Brain {
    /// Find the trigger of `topic` that answers `input`.
    ///
    /// `input` and `previous` must already be normalized.
    pub(crate) fn match_input(
        &self,
        topic: &str,
        input: &str,
        previous: Option<&str>,
        tags: &dyn TagSource,
    ) -> Option<Match> {
        let compiled = self.triggers.topic(topic)?;

        if let Some(last) = previous {
            for &id in &compiled.previous {
                let trigger = self.triggers.get(id);
                let Some(bot_side) = &trigger.previous else { continue };
                let Some(botstars) = bot_side.captures(last, tags) else { continue };
                debug!("bot side of '{}' matched last reply '{last}'", trigger.info.text);
                if let Some(stars) = trigger.pattern.captures(input, tags) {
                    debug!("matched '{}' via %Previous in topic {topic}", trigger.info.text);
                    return Some(Match { id, stars, botstars });
                }
            }
        }

        for &id in &compiled.ordered {
            let trigger = self.triggers.get(id);
            if let Some(stars) = trigger.pattern.captures(input, tags) {
                debug!("matched '{}' in topic {topic}", trigger.info.text);
                return Some(Match { id, stars, botstars: Vec::new() });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::regexp::TriggerTag;
    use super::*;
    use crate::Options;
    use crate::parser::{Parser, SourceUnit};

    struct NoTags;
    impl TagSource for NoTags {
        fn resolve(&self, _: &TriggerTag) -> String {
            "undefined".to_string()
        }
    }

    fn brain(source: &str) -> Brain {
        let doc = Parser::default().parse(&[SourceUnit::new("m.rive", source)]).unwrap();
        Brain::compile(doc, &Options::default()).unwrap()
    }

    fn matched<'b>(brain: &'b Brain, input: &str, previous: Option<&str>) -> Option<(&'b str, Vec<String>)> {
        brain.match_input("random", input, previous, &NoTags).map(|m| (brain.pattern(m.id), m.stars))
    }

    #[test]
    fn atomic_beats_wildcard_regardless_of_order() {
        let b = brain("+ *\n- any\n+ hello bot\n- hi");
        assert_eq!(matched(&b, "hello bot", None), Some(("hello bot", vec![])));
        assert_eq!(matched(&b, "bye", None), Some(("*", vec!["bye".to_string()])));
    }

    #[test]
    fn weighted_triggers_outrank_atomic() {
        let b = brain("+ hello bot\n- plain\n+ * {weight=100}\n- heavy");
        assert_eq!(matched(&b, "hello bot", None).map(|m| m.0), Some("* {weight=100}"));
    }

    #[test]
    fn previous_wins_over_ordinary_triggers() {
        let b = brain("+ knock knock\n- Who's there?\n+ *\n% who is there\n- <star> who?\n+ *\n- fallback");
        let (pattern, stars) = matched(&b, "banana", Some("who is there")).unwrap();
        assert_eq!(pattern, "*");
        assert_eq!(stars, vec!["banana"]);
        let m = b.match_input("random", "banana", Some("who is there"), &NoTags).unwrap();
        assert!(b.triggers.get(m.id).previous.is_some());

        let m = b.match_input("random", "banana", Some("something else"), &NoTags).unwrap();
        assert!(b.triggers.get(m.id).previous.is_none());
    }

    #[test]
    fn matching_is_idempotent() {
        let b = brain("+ hi *\n- a\n+ * there\n- b\n+ hi there\n- c");
        let first = b.match_input("random", "hi over there", None, &NoTags);
        assert_eq!(first, b.match_input("random", "hi over there", None, &NoTags));
        assert_eq!(matched(&b, "hi there", None).map(|m| m.0), Some("hi there"));
    }

    #[test]
    fn unknown_topics_match_nothing() {
        let b = brain("+ hi\n- hello");
        assert!(b.match_input("nowhere", "hi", None, &NoTags).is_none());
    }
}
