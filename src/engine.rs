//! Compilation and reply engine.
//!
//! The engine turns a parsed [`Document`](crate::Document) into a [`Brain`]
//! and answers messages against it. Its submodules live under `src/engine/`.
//!
//! ## How the parts work together
//!
//! ```text
//! Document ──┐
//!            │  Brain::compile                         (brain.rs)
//!            │    flatten arrays, TriggerInfo::scan    (regexp.rs, trigger.rs)
//!            │    SortKey per trigger                  (trigger.rs)
//!            │    resolve topic order                  (topics.rs)
//!            │    compile patterns                     (regexp.rs)
//!            └──────────────┬──────────────
//!                           v
//!                  CompiledTriggers                    (compiled_triggers.rs)
//!                    arena of CompiledTrigger
//!                    per topic: ordered, previous
//!                           │
//! message ── Normalizer ────┼─ Brain::match_input      (format.rs, matcher.rs)
//!                           v
//!                  Responder::respond                  (resolve.rs)
//!                    begin block, redirects, conditions
//!                           │
//!                           v
//!                  Responder::render                   (render.rs)
//!                    bounded fixed-point tag evaluation
//!                           │
//!                           v
//!                  reply + ReplyMetrics                (metrics.rs)
//! ```
//!
//! Compilation does all the expensive work once: after it, matching a message
//! is a linear walk over a precomputed list per topic, and the brain is never
//! mutated again. All per-user state lives behind the
//! [`SessionStore`](crate::SessionStore) handed to each reply.
//!
//! ## Responsibilities by module
//!
//! - `trigger.rs`: classifies a pattern (weight, bucket, words, wildcards) and
//!   derives its total sort key.
//! - `regexp.rs`: compiles patterns to anchored regexes; resolves trigger tags
//!   at match time through [`TagSource`](regexp::TagSource).
//! - `topics.rs`: includes/inherits graph traversal with cycle guards.
//! - `compiled_triggers.rs`: the trigger arena and per-topic match orders.
//! - `format.rs`: message normalization, substitutions and case transforms.
//! - `matcher.rs`: first-hit matching, `%Previous` first.
//! - `resolve.rs`: the reply pipeline and runtime bot variables.
//! - `render.rs`: the tag evaluator.
//! - `metrics.rs`: timings per reply and per match step.

#[path = "engine/brain.rs"]
mod brain;
#[path = "engine/compiled_triggers.rs"]
mod compiled_triggers;
#[path = "engine/format.rs"]
mod format;
#[path = "engine/matcher.rs"]
mod matcher;
#[path = "engine/metrics.rs"]
mod metrics;
#[path = "engine/regexp.rs"]
mod regexp;
#[path = "engine/render.rs"]
mod render;
#[path = "engine/resolve.rs"]
mod resolve;
#[path = "engine/topics.rs"]
mod topics;
#[path = "engine/trigger.rs"]
mod trigger;

pub use brain::Brain;
pub use metrics::{ReplyMetrics, StepMetrics};
pub(crate) use resolve::{Responder, RuntimeVars, Scope};
