//! Topic graph resolution.
//!
//! Topics relate in two ways:
//!
//! - **includes**: the included topic's triggers are merged into the includer's
//!   pool and sorted together with its own, as if declared locally.
//! - **inherits**: the inherited topic's triggers are tried after the
//!   inheritor's specific triggers but *before* its generic catch-alls, so a
//!   topic can fall back to another without its own `*` shadowing it.
//!
//! ```text
//! resolve(t) = specific(pool(t)) ++ resolve(i1) ++ resolve(i2) ++ ... ++ generic(pool(t))
//!   pool(t)  = t + transitive includes of t
//!   i1, i2   = inherited topics of every topic in pool(t), in declaration order
//! ```
//!
//! ## Invariants
//!
//! - Every traversal carries one visited set: a topic reached twice (through
//!   a cycle or a diamond) is skipped the second time, never an error.
//! - Relations naming topics that don't exist are ignored here; the brain
//!   reports them once at compile time.

use crate::document::Document;
use std::collections::HashSet;

pub(crate) struct TopicGraph<'d> {
    doc: &'d Document,
}

impl<'d> TopicGraph<'d> {
    pub fn new(doc: &'d Document) -> Self {
        Self { doc }
    }

    /// Resolve the matching order of `topic`.
    ///
    /// `rank` receives the names of a pool and returns its (specific, generic)
    /// items already sorted.
    pub fn resolve<T, F>(&self, topic: &str, rank: &mut F) -> Vec<T>
    where
        F: FnMut(&[&'d str]) -> (Vec<T>, Vec<T>),
    {
        let mut visited = HashSet::new();
        self.resolve_in(topic, &mut visited, rank)
    }

    fn resolve_in<T, F>(&self, topic: &str, visited: &mut HashSet<&'d str>, rank: &mut F) -> Vec<T>
    where
        F: FnMut(&[&'d str]) -> (Vec<T>, Vec<T>),
    {
        let Some((name, _)) = self.doc.topics.get_key_value(topic) else { return Vec::new() };
        if !visited.insert(name.as_str()) {
            return Vec::new();
        }

        let mut pool = vec![name.as_str()];
        self.collect_includes(name, visited, &mut pool);

        let (mut out, generic) = rank(&pool);
        for member in &pool {
            for inherited in &self.doc.topics[*member].inherits {
                out.extend(self.resolve_in(inherited, visited, rank));
            }
        }
        out.extend(generic);
        out
    }

    fn collect_includes(&self, topic: &str, visited: &mut HashSet<&'d str>, pool: &mut Vec<&'d str>) {
        let Some(t) = self.doc.topics.get(topic) else { return };
        for included in &t.includes {
            let Some((name, _)) = self.doc.topics.get_key_value(included) else { continue };
            if visited.insert(name.as_str()) {
                pool.push(name.as_str());
                self.collect_includes(name, visited, pool);
            }
        }
    }

    /// Relations that point at topics which don't exist, as (from, to).
    pub fn dangling(&self) -> Vec<(&'d str, &'d str)> {
        let mut out = Vec::new();
        for (name, topic) in &self.doc.topics {
            for target in topic.includes.iter().chain(&topic.inherits) {
                if !self.doc.topics.contains_key(target) {
                    out.push((name.as_str(), target.as_str()));
                }
            }
        }
        out
    }
}
