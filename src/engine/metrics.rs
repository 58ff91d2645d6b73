//! Reply metrics.
//!
//! A small set of structs used to observe and debug how a reply was found.
//! Every reply collects them; `RiveScript::reply` drops them and
//! `RiveScript::reply_verbose` hands them to the caller.
//!
//! ## Design notes
//!
//! - One `StepMetrics` is recorded per match attempt: the top-level match,
//!   the begin block, and each redirect.
//! - `StepMetrics::duration` covers the match only, not the rendering of the
//!   reply (rendering may itself contain redirects with their own steps).

use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct ReplyMetrics {
    /// Total elapsed time for the reply, history update included.
    pub total: Duration,
    /// Time spent normalizing the message.
    pub normalize: Duration,
    /// Time spent in the begin block, if the brain has one.
    pub begin: Option<Duration>,
    pub steps: Vec<StepMetrics>,
}

/// One match attempt.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Redirect depth (0 for the message itself).
    pub step: usize,
    pub topic: String,
    /// Normalized text that was matched.
    pub input: String,
    /// Pattern of the trigger that matched, if any.
    pub matched: Option<String>,
    pub duration: Duration,
}
