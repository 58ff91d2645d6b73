//! Reply resolution.
//!
//! A [`Responder`] answers one message for one user. It borrows everything
//! it needs (brain, session store, macro registry, runtime variables) for the
//! duration of that call and owns nothing.
//!
//! ```text
//! message ── normalize ──┬─ begin block? get_reply("request", Begin) ── {ok}? ──┐
//!                        │                                                      │
//!                        └──────────── get_reply(input, Normal, step 0) <───────┘
//!                                        topic = user's topic (or random)
//!                                        match_input (matcher.rs)
//!                                        @redirect  ──> get_reply(target, step + 1)
//!                                        *condition ──> first passing reply
//!                                        -reply     ──> weighted random choice
//!                                        render (render.rs)
//! ```
//!
//! ## Invariants
//!
//! - `step` grows by one per redirect (hard or inline); past the brain's
//!   depth the answer is the deep-recursion marker, never a stack overflow.
//! - Only session store failures escape as errors. Everything else that can
//!   go wrong while answering becomes a marker string in the reply.

use super::brain::Brain;
use super::compiled_triggers::TriggerId;
use super::metrics::{ReplyMetrics, StepMetrics};
use super::regexp::{TagSource, TriggerTag};
use crate::ErrorStrings;
use crate::document::{BEGIN_TOPIC, DEFAULT_TOPIC, Document};
use crate::error::SessionResult;
use crate::object::MacroRegistry;
use crate::session::{History, LAST_MATCH_VAR, SessionStore, TOPIC_VAR, UNDEFINED};
use log::{debug, warn};
use once_cell::unsync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Instant;

/// Which variable table a `<bot>`/`<env>` tag addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Bot,
    Env,
}

/// Runtime bot variables and globals.
///
/// Values written at runtime shadow the document's `! var`/`! global`
/// definitions and survive a reload. `None` records a deletion.
#[derive(Debug, Default)]
pub(crate) struct RuntimeVars {
    bot: RwLock<HashMap<String, Option<String>>>,
    env: RwLock<HashMap<String, Option<String>>>,
}

impl RuntimeVars {
    fn table(&self, scope: Scope) -> &RwLock<HashMap<String, Option<String>>> {
        match scope {
            Scope::Bot => &self.bot,
            Scope::Env => &self.env,
        }
    }

    pub fn get(&self, scope: Scope, doc: &Document, name: &str) -> Option<String> {
        if let Some(value) = self.table(scope).read().get(name) {
            return value.clone();
        }
        let defined = match scope {
            Scope::Bot => &doc.vars,
            Scope::Env => &doc.globals,
        };
        defined.get(name).cloned()
    }

    /// `None` (or the literal `<undef>`) deletes the variable.
    pub fn set(&self, scope: Scope, name: &str, value: Option<&str>) {
        let value = value.filter(|v| *v != "<undef>").map(str::to_string);
        self.table(scope).write().insert(name.to_string(), value);
    }
}

/// Wildcard captures available to `<star>` and `<botstar>`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Captures<'c> {
    pub stars: &'c [String],
    pub botstars: &'c [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Begin,
    Normal,
}

/// Outcome of [`Responder::respond`].
#[derive(Debug, Clone)]
pub(crate) struct Answer {
    pub reply: String,
    pub trigger: Option<TriggerId>,
    pub topic: String,
    pub metrics: ReplyMetrics,
}

pub(crate) struct Responder<'a> {
    pub brain: &'a Brain,
    pub sessions: &'a dyn SessionStore,
    pub macros: &'a MacroRegistry,
    pub vars: &'a RuntimeVars,
    pub errors: &'a ErrorStrings,
    pub rng: &'a Mutex<StdRng>,
    pub user: &'a str,
    /// The raw message, as handed to `reply`.
    pub message: &'a str,
    history: OnceCell<History>,
    matched: Cell<Option<TriggerId>>,
    topic: RefCell<Option<String>>,
    steps: RefCell<Vec<StepMetrics>>,
}

impl<'a> Responder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        brain: &'a Brain,
        sessions: &'a dyn SessionStore,
        macros: &'a MacroRegistry,
        vars: &'a RuntimeVars,
        errors: &'a ErrorStrings,
        rng: &'a Mutex<StdRng>,
        user: &'a str,
        message: &'a str,
    ) -> Self {
        Self {
            brain,
            sessions,
            macros,
            vars,
            errors,
            rng,
            user,
            message,
            history: OnceCell::new(),
            matched: Cell::new(None),
            topic: RefCell::new(None),
            steps: RefCell::new(Vec::new()),
        }
    }

    /// Answer the message and record it in the user's history.
    pub fn respond(&self) -> SessionResult<Answer> {
        let started = Instant::now();
        debug!("get reply to [{}] {}", self.user, self.message);

        let t = Instant::now();
        let input = self.brain.normalizer.format_message(self.message, false);
        let normalize = t.elapsed();

        let mut begin = None;
        let reply = if self.brain.has_topic(BEGIN_TOPIC) {
            let t = Instant::now();
            let request = self.get_reply("request", Context::Begin, 0)?;
            begin = Some(t.elapsed());
            if request.contains("{ok}") {
                let normal = self.get_reply(&input, Context::Normal, 0)?;
                request.replace("{ok}", &normal)
            } else {
                request
            }
        } else {
            self.get_reply(&input, Context::Normal, 0)?
        };
        let reply = reply.trim().to_string();

        self.sessions.push_history(self.user, &input, &reply)?;

        let topic = match self.topic.borrow_mut().take() {
            Some(topic) => topic,
            None => self.current_topic()?,
        };
        let metrics = ReplyMetrics { total: started.elapsed(), normalize, begin, steps: self.steps.take() };
        Ok(Answer { reply, trigger: self.matched.get(), topic, metrics })
    }

    fn get_reply(&self, input: &str, context: Context, step: usize) -> SessionResult<String> {
        if step > self.brain.depth {
            warn!("deep recursion while answering [{}] {}", self.user, self.message);
            return Ok(self.errors.deep_recursion.clone());
        }

        let started = Instant::now();
        let topic = match context {
            Context::Begin => BEGIN_TOPIC.to_string(),
            Context::Normal => self.current_topic()?,
        };
        if context == Context::Normal && step == 0 {
            self.topic.borrow_mut().get_or_insert_with(|| topic.clone());
        }

        let previous = if context == Context::Normal && step == 0 {
            let last = self.history()?.reply(1).to_string();
            Some(self.brain.normalizer.format_message(&last, true))
        } else {
            None
        };

        let found = self.brain.match_input(&topic, input, previous.as_deref(), self);
        self.steps.borrow_mut().push(StepMetrics {
            step,
            topic: topic.clone(),
            input: input.to_string(),
            matched: found.as_ref().map(|m| self.brain.pattern(m.id).to_string()),
            duration: started.elapsed(),
        });

        let Some(found) = found else {
            debug!("no match for '{input}' in topic {topic}");
            if context == Context::Normal {
                self.sessions.remove(self.user, LAST_MATCH_VAR)?;
            }
            return Ok(self.errors.no_match.clone());
        };

        let trigger = &self.brain.triggers.get(found.id).source;
        if context == Context::Normal {
            if step == 0 {
                self.matched.set(Some(found.id));
            }
            self.sessions.set(self.user, LAST_MATCH_VAR, &trigger.pattern)?;
        }
        let caps = Captures { stars: &found.stars, botstars: &found.botstars };

        if let Some(redirect) = &trigger.redirect {
            let target = self.render(redirect, caps, step)?;
            let target = self.brain.normalizer.format_message(&target, false);
            debug!("redirecting '{}' to '{target}'", trigger.pattern);
            return self.get_reply(&target, Context::Normal, step + 1);
        }

        let mut chosen = None;
        for condition in &trigger.conditions {
            if let Some(reply) = self.check_condition(condition, caps, step)? {
                chosen = Some(reply);
                break;
            }
        }
        let reply = match chosen.or_else(|| self.choose_reply(&trigger.replies)) {
            Some(reply) => reply,
            None => return Ok(self.errors.no_reply.clone()),
        };
        self.render(&reply, caps, step)
    }

    /// The user's topic, reset to `random` when it doesn't exist.
    fn current_topic(&self) -> SessionResult<String> {
        let topic = self.sessions.get(self.user, TOPIC_VAR)?.unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        if topic != DEFAULT_TOPIC && !self.brain.has_topic(&topic) {
            warn!("user {} was in an empty topic named '{topic}'", self.user);
            self.sessions.set(self.user, TOPIC_VAR, DEFAULT_TOPIC)?;
            return Ok(DEFAULT_TOPIC.to_string());
        }
        Ok(topic)
    }

    pub(crate) fn history(&self) -> SessionResult<&History> {
        self.history.get_or_try_init(|| self.sessions.history(self.user))
    }

    /// Evaluate `LHS OP RHS => REPLY`; `Some(reply)` when it holds.
    fn check_condition(&self, condition: &str, caps: Captures<'_>, step: usize) -> SessionResult<Option<String>> {
        let mut halves = regex!(r"\s*=>\s*").splitn(condition, 2);
        let (Some(test), Some(reply)) = (halves.next(), halves.next()) else {
            warn!("malformed condition '{condition}'");
            return Ok(None);
        };
        let Some(parts) = regex!(r"^(.+?)\s+(==|eq|!=|ne|<>|<|<=|>|>=)\s+(.*?)$").captures(test) else {
            warn!("malformed condition '{condition}'");
            return Ok(None);
        };

        let left = self.render(&parts[1], caps, step)?;
        let right = self.render(&parts[3], caps, step)?;
        let left = if left.is_empty() { UNDEFINED.to_string() } else { left };
        let right = if right.is_empty() { UNDEFINED.to_string() } else { right };
        debug!("check if {left} {} {right}", &parts[2]);

        let passed = match &parts[2] {
            "==" | "eq" => left == right,
            "!=" | "ne" | "<>" => left != right,
            op => match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
                (Ok(l), Ok(r)) => match op {
                    "<" => l < r,
                    "<=" => l <= r,
                    ">" => l > r,
                    _ => l >= r,
                },
                _ => {
                    warn!("can't compare non-numeric values '{left}' {op} '{right}'");
                    false
                }
            },
        };
        Ok(passed.then(|| reply.to_string()))
    }

    /// Weighted random pick among a trigger's replies.
    fn choose_reply(&self, replies: &[String]) -> Option<String> {
        if replies.is_empty() {
            return None;
        }
        let weights: Vec<u32> = replies
            .iter()
            .map(|reply| {
                let weight = regex!(r"\{weight=(\d+)\}")
                    .captures(reply)
                    .map_or(1, |c| c[1].parse::<u32>().unwrap_or(1));
                if weight == 0 {
                    warn!("can't have a reply weight <= 0: {reply}");
                    1
                } else {
                    weight
                }
            })
            .collect();
        let dist = WeightedIndex::new(&weights).ok()?;
        let index = dist.sample(&mut *self.rng.lock());
        replies.get(index).cloned()
    }

    pub(crate) fn pick<'t>(&self, choices: &[&'t str]) -> Option<&'t str> {
        choices.choose(&mut *self.rng.lock()).copied()
    }

    /// Answer an inline `{@target}` redirect.
    pub(crate) fn redirect(&self, target: &str, step: usize) -> SessionResult<String> {
        let target = self.brain.normalizer.format_message(target, false);
        debug!("inline redirect to '{target}'");
        self.get_reply(&target, Context::Normal, step + 1)
    }
}

impl TagSource for Responder<'_> {
    fn resolve(&self, tag: &TriggerTag) -> String {
        let value = match tag {
            TriggerTag::Bot(name) => self.vars.get(Scope::Bot, &self.brain.document, name),
            TriggerTag::Get(name) => self.sessions.get(self.user, name).unwrap_or_else(|e| {
                warn!("can't read {name} for {}: {e}", self.user);
                None
            }),
            TriggerTag::Input(n) => self.history().ok().map(|h| h.input(*n).to_string()),
            TriggerTag::Reply(n) => self.history().ok().map(|h| h.reply(*n).to_string()),
        };
        self.brain.normalizer.format_value(value.as_deref().unwrap_or(UNDEFINED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Options;
    use crate::parser::{Parser, SourceUnit};
    use crate::session::MemorySessionStore;

    struct Fixture {
        brain: Brain,
        sessions: MemorySessionStore,
        macros: MacroRegistry,
        vars: RuntimeVars,
        errors: ErrorStrings,
        rng: Mutex<StdRng>,
    }

    impl Fixture {
        fn new(source: &str) -> Self {
            let doc = Parser::default().parse(&[SourceUnit::new("r.rive", source)]).unwrap();
            Fixture {
                brain: Brain::compile(doc, &Options::default()).unwrap(),
                sessions: MemorySessionStore::new(),
                macros: MacroRegistry::new(),
                vars: RuntimeVars::default(),
                errors: ErrorStrings::default(),
                rng: Mutex::new(StdRng::seed_from_u64(7)),
            }
        }

        fn answer(&self, message: &str) -> Answer {
            Responder::new(&self.brain, &self.sessions, &self.macros, &self.vars, &self.errors, &self.rng, "u1", message)
                .respond()
                .unwrap()
        }
    }

    #[test]
    fn conditions_pick_the_first_passing_reply() {
        let f = Fixture::new(
            "+ what is my name\n* <get name> != undefined => Your name is <get name>.\n- You didn't tell me your name.",
        );
        assert_eq!(f.answer("what is my name").reply, "You didn't tell me your name.");
        f.sessions.set("u1", "name", "Aiden").unwrap();
        assert_eq!(f.answer("what is my name").reply, "Your name is Aiden.");
    }

    #[test]
    fn numeric_conditions_need_numbers() {
        let f = Fixture::new(
            "+ am i old\n* <get age> >= 18 => Yes.\n* <get age> < 18 => No.\n- I don't know.",
        );
        assert_eq!(f.answer("am i old").reply, "I don't know.");
        f.sessions.set("u1", "age", "20").unwrap();
        assert_eq!(f.answer("am i old").reply, "Yes.");
        f.sessions.set("u1", "age", "9").unwrap();
        assert_eq!(f.answer("am i old").reply, "No.");
    }

    #[test]
    fn redirects_follow_and_loops_stop() {
        let f = Fixture::new("+ hello\n- Hi!\n+ hey\n@ hello\n+ loop\n@ loop");
        assert_eq!(f.answer("hey").reply, "Hi!");
        assert_eq!(f.answer("loop").reply, f.errors.deep_recursion);
    }

    #[test]
    fn answers_record_history_and_last_match() {
        let f = Fixture::new("+ hello *\n- Hi <star>!");
        let answer = f.answer("Hello, Bot!");
        assert_eq!(answer.reply, "Hi bot!");
        assert_eq!(answer.topic, "random");
        assert!(answer.trigger.is_some());
        assert_eq!(answer.metrics.steps.len(), 1);
        let history = f.sessions.history("u1").unwrap();
        assert_eq!(history.input(1), "hello bot");
        assert_eq!(history.reply(1), "Hi bot!");
        assert_eq!(f.sessions.get("u1", LAST_MATCH_VAR).unwrap().as_deref(), Some("hello *"));

        assert_eq!(f.answer("nothing here").reply, f.errors.no_match);
        assert_eq!(f.sessions.get("u1", LAST_MATCH_VAR).unwrap(), None);
    }

    #[test]
    fn missing_topics_fall_back_to_random() {
        let f = Fixture::new("+ hi\n- hello");
        f.sessions.set("u1", TOPIC_VAR, "ghost").unwrap();
        assert_eq!(f.answer("hi").reply, "hello");
        assert_eq!(f.sessions.get("u1", TOPIC_VAR).unwrap().as_deref(), Some("random"));
    }

    #[test]
    fn runtime_vars_shadow_the_document() {
        let mut doc = Document::new();
        doc.vars.insert("name".into(), "Aiden".into());
        let vars = RuntimeVars::default();
        assert_eq!(vars.get(Scope::Bot, &doc, "name").as_deref(), Some("Aiden"));
        vars.set(Scope::Bot, "name", Some("Bob"));
        assert_eq!(vars.get(Scope::Bot, &doc, "name").as_deref(), Some("Bob"));
        vars.set(Scope::Bot, "name", Some("<undef>"));
        assert_eq!(vars.get(Scope::Bot, &doc, "name"), None);
        assert_eq!(vars.get(Scope::Env, &doc, "name"), None);
    }
}
