//! Deparsing: [`Document`] back to a serde tree and to source text.
//!
//! ```text
//! Document ── deparse() ──> Deparsed ── to_source() ──> "! version = 2.0 ..."
//!    ^                         │
//!    └──── Document::from ─────┘        (serde_json for tooling)
//! ```
//!
//! Comments, blank lines and the original file split are not kept. Source
//! locations are lost on the way back, so a document rebuilt from a tree
//! reports every trigger at line 0 of `<deparsed>`.

use crate::document::{BEGIN_TOPIC, DEFAULT_TOPIC, Document, ObjectMacro, SourceLocation, Topic, Trigger};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Column after which long `-` and `*` lines get `^` continuations.
const WRAP_AT: usize = 78;

const DEPARSED_FILE: &str = "<deparsed>";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deparsed {
    pub begin: DeparsedBegin,
    pub topics: BTreeMap<String, DeparsedTopic>,
    #[serde(default)]
    pub objects: Vec<DeparsedObject>,
}

/// Definitions plus the triggers of the `> begin` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeparsedBegin {
    pub global: BTreeMap<String, String>,
    pub var: BTreeMap<String, String>,
    pub sub: BTreeMap<String, String>,
    pub person: BTreeMap<String, String>,
    pub array: BTreeMap<String, Vec<String>>,
    pub triggers: Vec<DeparsedTrigger>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeparsedTopic {
    pub includes: Vec<String>,
    pub inherits: Vec<String>,
    pub triggers: Vec<DeparsedTrigger>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeparsedTrigger {
    pub trigger: String,
    pub reply: Vec<String>,
    pub condition: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeparsedObject {
    pub name: String,
    pub language: String,
    pub code: Vec<String>,
}

impl Document {
    pub fn deparse(&self) -> Deparsed {
        let triggers = |topic: &Topic| topic.triggers.iter().map(DeparsedTrigger::from).collect::<Vec<_>>();
        let begin = DeparsedBegin {
            global: self.globals.clone(),
            var: self.vars.clone(),
            sub: self.subs.iter().cloned().collect(),
            person: self.person.iter().cloned().collect(),
            array: self.arrays.clone(),
            triggers: self.topic(BEGIN_TOPIC).map(triggers).unwrap_or_default(),
        };
        let topics = self
            .topics
            .values()
            .filter(|topic| topic.name != BEGIN_TOPIC)
            .map(|topic| {
                let deparsed = DeparsedTopic {
                    includes: topic.includes.clone(),
                    inherits: topic.inherits.clone(),
                    triggers: triggers(topic),
                };
                (topic.name.clone(), deparsed)
            })
            .collect();
        let objects = self
            .objects
            .iter()
            .map(|o| DeparsedObject { name: o.name.clone(), language: o.language.clone(), code: o.source.clone() })
            .collect();
        Deparsed { begin, topics, objects }
    }
}

impl From<&Trigger> for DeparsedTrigger {
    fn from(trigger: &Trigger) -> Self {
        Self {
            trigger: trigger.pattern.clone(),
            reply: trigger.replies.clone(),
            condition: trigger.conditions.clone(),
            redirect: trigger.redirect.clone(),
            previous: trigger.previous.clone(),
        }
    }
}

impl DeparsedTrigger {
    fn into_trigger(self, topic: &str) -> Trigger {
        Trigger {
            pattern: self.trigger,
            replies: self.reply,
            conditions: self.condition,
            redirect: self.redirect,
            previous: self.previous,
            topic: topic.to_string(),
            location: SourceLocation { file: DEPARSED_FILE.to_string(), line: 0 },
        }
    }
}

impl From<Deparsed> for Document {
    fn from(tree: Deparsed) -> Self {
        let mut doc = Document {
            globals: tree.begin.global,
            vars: tree.begin.var,
            subs: tree.begin.sub.into_iter().collect(),
            person: tree.begin.person.into_iter().collect(),
            arrays: tree.begin.array,
            ..Document::default()
        };
        if !tree.begin.triggers.is_empty() {
            let begin = doc.topic_mut(BEGIN_TOPIC);
            begin.triggers = tree.begin.triggers.into_iter().map(|t| t.into_trigger(BEGIN_TOPIC)).collect();
        }
        for (name, deparsed) in tree.topics {
            let topic = doc.topic_mut(&name);
            topic.relate(&deparsed.includes, &deparsed.inherits);
            topic.triggers = deparsed.triggers.into_iter().map(|t| t.into_trigger(&name)).collect();
        }
        doc.objects = tree
            .objects
            .into_iter()
            .map(|o| ObjectMacro {
                name: o.name,
                language: o.language,
                source: o.code,
                location: SourceLocation { file: DEPARSED_FILE.to_string(), line: 0 },
            })
            .collect();
        doc
    }
}

impl Deparsed {
    /// Render the tree as source text that parses back to the same document.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        out.push_str("// Written by rivescript::deparse\n");
        out.push_str("! version = 2.0\n");
        out.push_str("! local concat = space\n");

        let mut defined = false;
        for (kind, table) in [
            ("global", &self.begin.global),
            ("var", &self.begin.var),
            ("sub", &self.begin.sub),
            ("person", &self.begin.person),
        ] {
            for (name, value) in table {
                if !defined {
                    out.push('\n');
                    defined = true;
                }
                let _ = writeln!(out, "! {kind} {name} = {value}");
            }
        }
        for (name, members) in &self.begin.array {
            if !defined {
                out.push('\n');
                defined = true;
            }
            let line = if members.len() > 1 && members.iter().any(|m| m.contains(' ')) {
                members.join("|")
            } else {
                members.iter().map(|m| m.replace(' ', "\\s")).collect::<Vec<_>>().join(" ")
            };
            let _ = writeln!(out, "! array {name} = {line}");
        }

        if !self.begin.triggers.is_empty() {
            out.push_str("\n> begin\n\n");
            write_triggers(&mut out, &self.begin.triggers);
            out.push_str("< begin\n");
        }

        let random = self.topics.get(DEFAULT_TOPIC).into_iter().map(|t| (DEFAULT_TOPIC, t));
        let others = self.topics.iter().filter(|(name, _)| *name != DEFAULT_TOPIC).map(|(n, t)| (n.as_str(), t));
        for (name, topic) in random.chain(others) {
            let labelled = name != DEFAULT_TOPIC || !topic.includes.is_empty() || !topic.inherits.is_empty();
            out.push('\n');
            if labelled {
                let _ = write!(out, "> topic {name}");
                if !topic.includes.is_empty() {
                    let _ = write!(out, " includes {}", topic.includes.join(" "));
                }
                if !topic.inherits.is_empty() {
                    let _ = write!(out, " inherits {}", topic.inherits.join(" "));
                }
                out.push_str("\n\n");
            }
            write_triggers(&mut out, &topic.triggers);
            if labelled {
                out.push_str("< topic\n");
            }
        }

        for object in &self.objects {
            let _ = writeln!(out, "\n> object {} {}", object.name, object.language);
            for line in &object.code {
                let _ = writeln!(out, "{line}");
            }
            out.push_str("< object\n");
        }
        out
    }
}

fn write_triggers(out: &mut String, triggers: &[DeparsedTrigger]) {
    for trigger in triggers {
        let _ = writeln!(out, "+ {}", trigger.trigger);
        if let Some(previous) = &trigger.previous {
            let _ = writeln!(out, "% {previous}");
        }
        if let Some(redirect) = &trigger.redirect {
            let _ = writeln!(out, "@ {redirect}");
        }
        for condition in &trigger.condition {
            push_wrapped(out, "* ", &escape(condition));
        }
        for reply in &trigger.reply {
            push_wrapped(out, "- ", &escape(reply));
        }
        out.push('\n');
    }
}

/// Line breaks from `! local concat = newline` survive as `\n` escapes.
fn escape(text: &str) -> String {
    text.replace('\n', "\\n")
}

/// Write `prefix + text`, moving words past [`WRAP_AT`] onto `^` lines.
///
/// The output always declares `concat = space`, so a break at a single space
/// joins back to the same text. Text with runs of spaces is never broken.
fn push_wrapped(out: &mut String, prefix: &str, text: &str) {
    if prefix.len() + text.len() <= WRAP_AT || text.contains("  ") {
        let _ = writeln!(out, "{prefix}{text}");
        return;
    }
    let mut line = prefix.to_string();
    let mut empty = true;
    for word in text.split(' ') {
        if !empty && line.len() + 1 + word.len() > WRAP_AT {
            let _ = writeln!(out, "{line}");
            line = "^ ".to_string();
            empty = true;
        }
        if !empty {
            line.push(' ');
        }
        line.push_str(word);
        empty = false;
    }
    let _ = writeln!(out, "{line}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Parser, SourceUnit};

    const BOT: &str = "
        ! version = 2.0
        ! global depth = 20
        ! var name = Aiden
        ! sub what's = what is
        ! person i am = you are
        ! array colors = red blue
        ! array phrases = good day|good night
        ! array shades = dark\\sblue

        > begin
        + request
        - {ok}
        < begin

        + hello bot
        - Hello human!
        - Hi there!{weight=5}

        + what is my name
        * <get name> != undefined => Your name is <get name>, I remember it very well and I won't forget it.
        - You never told me your name, and I'm not going to guess it either, no matter how often you ask.

        + knock knock
        - Who's there?

        + *
        % who is there
        - <sentence> who?

        + hey
        @ hello bot

        > topic sports includes chat inherits random
        + i like *
        - Me too!
        < topic

        > object reverse perl
            my ($rs, @args) = @_;
            return reverse join ' ', @args;
        < object
    ";

    fn parse(source: &str) -> Document {
        Parser::default().parse(&[SourceUnit::new("bot.rive", source)]).unwrap()
    }

    fn shape(doc: &Document) -> Vec<(String, Vec<DeparsedTrigger>, Vec<String>, Vec<String>)> {
        doc.topics
            .values()
            .map(|t| {
                let triggers = t.triggers.iter().map(DeparsedTrigger::from).collect();
                (t.name.clone(), triggers, t.includes.clone(), t.inherits.clone())
            })
            .collect()
    }

    #[test]
    fn source_round_trips() {
        let doc = parse(BOT);
        let source = doc.deparse().to_source();
        let again = parse(&source);
        assert_eq!(shape(&again), shape(&doc));
        assert_eq!(again.vars, doc.vars);
        assert_eq!(again.globals, doc.globals);
        assert_eq!(again.arrays, doc.arrays);
        assert_eq!(again.arrays["shades"], vec!["dark blue"]);
        assert_eq!(again.subs, doc.subs);
        assert_eq!(again.objects[0].source, doc.objects[0].source);
        assert!(source.lines().all(|line| line.len() <= WRAP_AT || !line.contains(' ')));
        assert!(source.contains("\n^ "));
    }

    #[test]
    fn tree_converts_back_to_the_same_document_shape() {
        let doc = parse(BOT);
        let tree = doc.deparse();
        assert_eq!(tree.begin.triggers[0].reply, vec!["{ok}"]);
        assert_eq!(tree.topics["sports"].inherits, vec!["random"]);
        assert!(!tree.topics.contains_key(BEGIN_TOPIC));

        let json = serde_json::to_string(&tree).unwrap();
        let back: Deparsed = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
        assert_eq!(shape(&Document::from(back)), shape(&doc));
    }

    #[test]
    fn random_topic_stays_unlabelled() {
        let source = parse("+ hi\n- hello").deparse().to_source();
        assert!(!source.contains("> topic"));
        assert!(source.contains("+ hi\n- hello\n"));
    }
}
