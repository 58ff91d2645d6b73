use crate::deparse::Deparsed;
use crate::document::{Document, SourceLocation, upsert};
use crate::engine::{Brain, ReplyMetrics, Responder, RuntimeVars, Scope};
use crate::error::{CompileError, Diagnostic, LoadError, MacroResult, SessionResult};
use crate::object::{MacroCall, MacroHandler, MacroRegistry};
use crate::parser::{Parser, SourceUnit};
use crate::session::{LAST_MATCH_VAR, MemorySessionStore, SessionStore, ThawAction};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand::rngs::StdRng;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// File extensions picked up by [`load_directory`].
const SOURCE_EXTENSIONS: [&str; 2] = ["rive", "rs"];

/// Marker strings spliced into replies when something goes wrong softly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorStrings {
    /// No trigger matched the message.
    pub no_match: String,
    /// A trigger matched but had no usable reply.
    pub no_reply: String,
    /// Redirects or tag evaluation ran past the depth budget.
    pub deep_recursion: String,
    pub object: String,
    pub object_handler: String,
    pub object_missing: String,
    pub divide_by_zero: String,
}

impl Default for ErrorStrings {
    fn default() -> Self {
        Self {
            no_match: "[ERR: No reply matched]".to_string(),
            no_reply: "[ERR: No reply found]".to_string(),
            deep_recursion: "[ERR: Deep recursion detected]".to_string(),
            object: "[ERR: Error when executing object]".to_string(),
            object_handler: "[ERR: No Object Handler]".to_string(),
            object_missing: "[ERR: Object Not Found]".to_string(),
            divide_by_zero: "[ERR: Can't Divide By Zero]".to_string(),
        }
    }
}

/// What to do with a source unit that fails to parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// The first syntax error fails the whole load.
    #[default]
    AbortOnFirst,
    /// Bad units are skipped; their errors are kept as warnings on the brain.
    SkipBadUnits,
}

/// Options that affect parsing, compilation and replies.
#[derive(Debug, Clone)]
pub struct Options {
    /// Unicode mode: keep non-ASCII letters in messages and patterns.
    pub utf8: bool,
    /// Characters stripped from messages in Unicode mode.
    pub unicode_punctuation: Regex,
    /// Syntax errors are fatal. Otherwise the offending line is logged and skipped.
    pub strict: bool,
    /// Recursion budget for redirects and tag evaluation (`! global depth` wins).
    pub depth: usize,
    pub load_policy: LoadPolicy,
    pub errors: ErrorStrings,
    /// Seed for random reply choice; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            utf8: false,
            unicode_punctuation: regex!(r"[.,!?;:]").clone(),
            strict: true,
            depth: 50,
            load_policy: LoadPolicy::default(),
            errors: ErrorStrings::default(),
            seed: None,
        }
    }
}

/// Result from [`RiveScript::reply_verbose`].
#[derive(Debug, Clone)]
pub struct ReplyDetails {
    pub reply: String,
    /// Pattern of the trigger that answered the message itself (not the
    /// begin block, and not a redirect target).
    pub trigger: Option<String>,
    /// Where that trigger was defined.
    pub location: Option<SourceLocation>,
    /// Topic the user was in when the message arrived.
    pub topic: String,
    pub metrics: ReplyMetrics,
}

/// One definition site of a trigger pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSource {
    pub topic: String,
    pub location: SourceLocation,
}

/// Parse `units` in order and compile them into a [`Brain`].
///
/// # Example
/// ```
/// use rivescript::{Options, SourceUnit, load};
///
/// let brain = load(&[SourceUnit::new("hello.rive", "+ hello bot\n- Hello human.")], &Options::default()).unwrap();
/// assert_eq!(brain.sorted_triggers("random").unwrap(), vec!["hello bot"]);
/// ```
pub fn load(units: &[SourceUnit], options: &Options) -> Result<Brain, LoadError> {
    let mut doc = Document::new();
    let warnings = parse_units(&mut doc, units, options)?;
    let mut brain = Brain::compile(doc, options)?;
    brain.add_warnings(warnings);
    Ok(brain)
}

/// Load every `.rive` (and `.rs`) file under `path`, recursively, in path order.
pub fn load_directory(path: impl AsRef<Path>, options: &Options) -> Result<Brain, LoadError> {
    let units = read_directory(path.as_ref())?;
    load(&units, options)
}

fn parse_units(doc: &mut Document, units: &[SourceUnit], options: &Options) -> Result<Vec<Diagnostic>, LoadError> {
    let parser = Parser::new(options);
    let mut warnings = Vec::new();
    for unit in units {
        let result = parser.parse_unit(doc, unit, &mut |d| warnings.push(d));
        match (result, options.load_policy) {
            (Ok(()), _) => {}
            (Err(e), LoadPolicy::AbortOnFirst) => return Err(e.into()),
            (Err(e), LoadPolicy::SkipBadUnits) => {
                warn!("skipping {}: {e}", unit.name);
                warnings.push(Diagnostic::new(&e.file, e.line, e.message));
            }
        }
    }
    Ok(warnings)
}

fn read_directory(dir: &Path) -> Result<Vec<SourceUnit>, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::NotADirectory(dir.to_path_buf()));
    }
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            LoadError::Io { path, source: e.into() }
        })?;
        let wanted = entry.path().extension().and_then(|ext| ext.to_str()).is_some_and(|ext| {
            SOURCE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known))
        });
        if entry.file_type().is_file() && wanted {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    paths.iter().map(|path| SourceUnit::from_file(path)).collect()
}

/// A bot: the current brain plus everything that outlives a reload (user
/// sessions, macro handlers, runtime bot variables).
///
/// `RiveScript` is `Send + Sync`; replies for different users run in
/// parallel, replies for one user are serialized.
///
/// # Example
/// ```
/// use rivescript::{Options, RiveScript};
///
/// let bot = RiveScript::new(Options::default());
/// bot.stream("+ hello bot\n- Hello human.").unwrap();
/// assert_eq!(bot.reply("alice", "Hello, Bot!").unwrap(), "Hello human.");
/// ```
pub struct RiveScript {
    options: Options,
    brain: RwLock<Arc<Brain>>,
    sessions: Arc<dyn SessionStore>,
    macros: MacroRegistry,
    vars: RuntimeVars,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    rng: Mutex<StdRng>,
    /// Held while a new brain is built so concurrent loads don't drop units.
    reload: Mutex<()>,
}

impl RiveScript {
    pub fn new(options: Options) -> Self {
        Self::with_sessions(options, Arc::new(MemorySessionStore::new()))
    }

    pub fn with_sessions(options: Options, sessions: Arc<dyn SessionStore>) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            brain: RwLock::new(Arc::new(Brain::empty(&options))),
            options,
            sessions,
            macros: MacroRegistry::new(),
            vars: RuntimeVars::default(),
            user_locks: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            reload: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The brain replies are currently served from.
    pub fn brain(&self) -> Arc<Brain> {
        self.brain.read().clone()
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    // --- Loading ---------------------------------------------------------------

    pub fn load_directory(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let units = read_directory(path.as_ref())?;
        self.load_units(&units)
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let unit = SourceUnit::from_file(path.as_ref())?;
        self.load_units(&[unit])
    }

    /// Load source text that doesn't come from a file.
    pub fn stream(&self, source: &str) -> Result<(), LoadError> {
        self.load_units(&[SourceUnit::new("<stream>", source)])
    }

    /// Parse `units` on top of the current document and publish the result.
    ///
    /// On error the current brain stays in place.
    pub fn load_units(&self, units: &[SourceUnit]) -> Result<(), LoadError> {
        let _reload = self.reload.lock();
        let mut doc = self.brain().document().clone();
        let warnings = parse_units(&mut doc, units, &self.options)?;
        let mut brain = Brain::compile(doc, &self.options)?;
        brain.add_warnings(warnings);
        info!("loaded {} source unit(s); {} trigger(s)", units.len(), brain.document().triggers().count());
        self.publish(brain);
        Ok(())
    }

    /// Serve replies from an already compiled brain (see [`load`]).
    pub fn set_brain(&self, brain: Brain) {
        let _reload = self.reload.lock();
        self.publish(brain);
    }

    fn publish(&self, brain: Brain) {
        self.macros.publish(&brain.document().objects);
        *self.brain.write() = Arc::new(brain);
    }

    /// Recompile the current document after `edit`.
    fn rebuild(&self, edit: impl FnOnce(&mut Document)) -> Result<(), CompileError> {
        let _reload = self.reload.lock();
        let mut doc = self.brain().document().clone();
        edit(&mut doc);
        let brain = Brain::compile(doc, &self.options)?;
        self.publish(brain);
        Ok(())
    }

    // --- Replies ---------------------------------------------------------------

    /// Answer `message` from `user`.
    ///
    /// Only a failing session store is an error; everything else ends up in
    /// the reply (see [`ErrorStrings`]).
    pub fn reply(&self, user: &str, message: &str) -> SessionResult<String> {
        self.reply_verbose(user, message).map(|details| details.reply)
    }

    /// Like [`RiveScript::reply`], also returning which trigger answered and timings.
    pub fn reply_verbose(&self, user: &str, message: &str) -> SessionResult<ReplyDetails> {
        let brain = self.brain();
        let lock = self.user_lock(user);
        let _turn = lock.lock();

        let responder = Responder::new(
            &brain,
            self.sessions.as_ref(),
            &self.macros,
            &self.vars,
            &self.options.errors,
            &self.rng,
            user,
            message,
        );
        let answer = responder.respond()?;
        let source = answer.trigger.map(|id| &brain.triggers.get(id).source);
        Ok(ReplyDetails {
            reply: answer.reply,
            trigger: source.map(|t| t.pattern.clone()),
            location: source.map(|t| t.location.clone()),
            topic: answer.topic,
            metrics: answer.metrics,
        })
    }

    fn user_lock(&self, user: &str) -> Arc<Mutex<()>> {
        self.user_locks.lock().entry(user.to_string()).or_default().clone()
    }

    /// Drop turn locks nobody holds. Locks are only cloned under the map's
    /// mutex, so a count of one means no reply is in flight for that user.
    fn prune_user_locks(&self, user: Option<&str>) {
        let mut locks = self.user_locks.lock();
        match user {
            Some(user) => {
                if locks.get(user).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                    locks.remove(user);
                }
            }
            None => locks.retain(|_, lock| Arc::strong_count(lock) > 1),
        }
    }

    // --- User variables --------------------------------------------------------

    pub fn set_uservar(&self, user: &str, name: &str, value: &str) -> SessionResult<()> {
        self.sessions.set(user, name, value)
    }

    pub fn set_uservars(&self, user: &str, vars: &BTreeMap<String, String>) -> SessionResult<()> {
        self.sessions.set_many(user, vars)
    }

    pub fn get_uservar(&self, user: &str, name: &str) -> SessionResult<Option<String>> {
        self.sessions.get(user, name)
    }

    pub fn get_uservars(&self, user: &str) -> SessionResult<Option<BTreeMap<String, String>>> {
        self.sessions.get_any(user)
    }

    pub fn clear_uservars(&self, user: &str) -> SessionResult<()> {
        self.sessions.reset(user)?;
        self.prune_user_locks(Some(user));
        Ok(())
    }

    pub fn clear_all_uservars(&self) -> SessionResult<()> {
        self.sessions.reset_all()?;
        self.prune_user_locks(None);
        Ok(())
    }

    pub fn freeze_uservars(&self, user: &str) -> SessionResult<()> {
        self.sessions.freeze(user)
    }

    pub fn thaw_uservars(&self, user: &str, action: ThawAction) -> SessionResult<()> {
        self.sessions.thaw(user, action)
    }

    /// Pattern of the trigger that answered the user's last message.
    pub fn last_match(&self, user: &str) -> SessionResult<Option<String>> {
        self.sessions.get(user, LAST_MATCH_VAR)
    }

    pub fn user_ids(&self) -> SessionResult<Vec<String>> {
        self.sessions.all_user_ids()
    }

    // --- Bot variables and definitions -----------------------------------------

    /// Set (or with `None`, delete) a bot variable, as `<bot name=value>` does.
    pub fn set_variable(&self, name: &str, value: Option<&str>) {
        self.vars.set(Scope::Bot, name, value);
    }

    pub fn get_variable(&self, name: &str) -> Option<String> {
        self.vars.get(Scope::Bot, self.brain().document(), name)
    }

    /// Set (or with `None`, delete) a global, as `<env name=value>` does.
    pub fn set_global(&self, name: &str, value: Option<&str>) {
        self.vars.set(Scope::Env, name, value);
    }

    pub fn get_global(&self, name: &str) -> Option<String> {
        self.vars.get(Scope::Env, self.brain().document(), name)
    }

    /// Add, replace or (with `None`) remove a `! sub` substitution.
    pub fn set_substitution(&self, pattern: &str, value: Option<&str>) -> Result<(), CompileError> {
        self.rebuild(|doc| upsert(&mut doc.subs, pattern, value.map(str::to_string)))
    }

    /// Add, replace or (with `None`) remove a `! person` substitution.
    pub fn set_person(&self, pattern: &str, value: Option<&str>) -> Result<(), CompileError> {
        self.rebuild(|doc| upsert(&mut doc.person, pattern, value.map(str::to_string)))
    }

    // --- Object macros ---------------------------------------------------------

    /// Serve macros declared with `> object NAME language` from `handler`.
    pub fn set_handler(&self, language: &str, handler: Arc<dyn MacroHandler>) {
        self.macros.set_handler(language, handler);
    }

    pub fn remove_handler(&self, language: &str) {
        self.macros.remove_handler(language);
    }

    /// Register a Rust closure as the `rust` macro `name`.
    pub fn set_subroutine<F>(&self, name: &str, f: F)
    where
        F: Fn(&MacroCall<'_>) -> MacroResult<String> + Send + Sync + 'static,
    {
        self.macros.subroutines().register(name, Arc::new(f));
    }

    // --- Introspection ---------------------------------------------------------

    pub fn deparse(&self) -> Deparsed {
        self.brain().document().deparse()
    }

    /// Write the current document back out as one source file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        std::fs::write(path, self.deparse().to_source())
            .map_err(|source| LoadError::Io { path: path.to_path_buf(), source })
    }

    /// Every place a trigger with exactly this pattern text is defined.
    pub fn trigger_info(&self, pattern: &str) -> Vec<TriggerSource> {
        self.brain()
            .document()
            .triggers()
            .filter(|t| t.pattern == pattern)
            .map(|t| TriggerSource { topic: t.topic.clone(), location: t.location.clone() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MacroError;
    use std::fs;

    fn unit(name: &str, text: &str) -> SourceUnit {
        SourceUnit::new(name, text)
    }

    #[test]
    fn clearing_users_drops_their_turn_locks() {
        let bot = RiveScript::new(Options::default());
        bot.stream("+ hi\n- hello").unwrap();
        for user in ["a", "b", "c"] {
            bot.reply(user, "hi").unwrap();
        }
        assert_eq!(bot.user_locks.lock().len(), 3);
        bot.clear_uservars("a").unwrap();
        assert!(!bot.user_locks.lock().contains_key("a"));
        bot.clear_all_uservars().unwrap();
        assert!(bot.user_locks.lock().is_empty());
    }

    #[test]
    fn load_aborts_on_first_bad_unit_by_default() {
        let units = [unit("good.rive", "+ hi\n- hello"), unit("bad.rive", "+ Hi There\n- oops")];
        let err = load(&units, &Options::default()).unwrap_err();
        assert!(matches!(err, LoadError::Syntax(ref e) if e.file == "bad.rive" && e.line == 1));
    }

    #[test]
    fn skip_policy_keeps_good_units_and_reports_bad_ones() {
        let options = Options { load_policy: LoadPolicy::SkipBadUnits, ..Options::default() };
        let units = [
            unit("good.rive", "+ hi\n- hello"),
            unit("bad.rive", "+ bye\n- later\n+ broken (\n- no"),
            unit("more.rive", "+ hey\n- yo"),
        ];
        let brain = load(&units, &options).unwrap();
        assert_eq!(brain.sorted_triggers("random").unwrap(), vec!["hey", "hi"]);
        assert!(brain.warnings().iter().any(|w| w.file == "bad.rive" && w.line == 3));
    }

    #[test]
    fn load_directory_reads_source_files_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.rive"), "! var name = First\n+ hi\n- hello").unwrap();
        fs::write(dir.path().join("nested/b.rive"), "! var name = Second\n+ bye\n- later").unwrap();
        fs::write(dir.path().join("c.rs"), "+ hey\n- yo").unwrap();
        fs::write(dir.path().join("notes.txt"), "+ ignored\n- never").unwrap();

        let brain = load_directory(dir.path(), &Options::default()).unwrap();
        assert_eq!(brain.document().vars["name"], "Second");
        assert_eq!(brain.sorted_triggers("random").unwrap(), vec!["bye", "hey", "hi"]);

        let missing = dir.path().join("missing");
        assert!(matches!(load_directory(&missing, &Options::default()), Err(LoadError::NotADirectory(_))));
    }

    #[test]
    fn failed_stream_keeps_the_current_brain() {
        let bot = RiveScript::new(Options::default());
        bot.stream("+ hi\n- hello").unwrap();
        assert!(bot.stream("+ Broken\n- no").is_err());
        assert_eq!(bot.reply("u", "hi").unwrap(), "hello");

        bot.stream("+ bye\n- later").unwrap();
        assert_eq!(bot.reply("u", "hi").unwrap(), "hello");
        assert_eq!(bot.reply("u", "bye").unwrap(), "later");
    }

    #[test]
    fn reply_verbose_names_the_trigger() {
        let bot = RiveScript::new(Options::default());
        bot.stream("+ hello *\n- Hi!\n+ hey\n@ hello there").unwrap();
        let details = bot.reply_verbose("u", "hey").unwrap();
        assert_eq!(details.reply, "Hi!");
        assert_eq!(details.trigger.as_deref(), Some("hey"));
        assert_eq!(details.location.unwrap().line, 3);
        assert_eq!(details.topic, "random");
        assert_eq!(details.metrics.steps.len(), 2);
        assert_eq!(bot.last_match("u").unwrap().as_deref(), Some("hello *"));
    }

    #[test]
    fn empty_bot_answers_with_the_fallback() {
        let options = Options {
            errors: ErrorStrings { no_match: "Sorry?".to_string(), ..ErrorStrings::default() },
            ..Options::default()
        };
        let bot = RiveScript::new(options);
        assert_eq!(bot.reply("u", "anything").unwrap(), "Sorry?");
    }

    #[test]
    fn runtime_variables_survive_reloads() {
        let bot = RiveScript::new(Options::default());
        bot.stream("! var name = Aiden\n+ name\n- <bot name>").unwrap();
        bot.set_variable("name", Some("Casey"));
        bot.stream("+ hi\n- hello").unwrap();
        assert_eq!(bot.reply("u", "name").unwrap(), "Casey");
        bot.set_variable("name", None);
        assert_eq!(bot.get_variable("name"), None);
        bot.set_global("mode", Some("test"));
        assert_eq!(bot.get_global("mode").as_deref(), Some("test"));
    }

    #[test]
    fn substitutions_can_change_at_runtime() {
        let bot = RiveScript::new(Options::default());
        bot.stream("+ what is up\n- Not much.").unwrap();
        assert_eq!(bot.reply("u", "whats up").unwrap(), "[ERR: No reply matched]");
        bot.set_substitution("whats", Some("what is")).unwrap();
        assert_eq!(bot.reply("u", "whats up").unwrap(), "Not much.");
        bot.set_substitution("whats", None).unwrap();
        assert!(bot.brain().document().subs.is_empty());
    }

    #[test]
    fn subroutines_answer_calls() {
        let bot = RiveScript::new(Options::default());
        bot.stream("+ reverse *\n- <call>reverse <star></call>\n+ fail\n- <call>broken</call>").unwrap();
        bot.set_subroutine("reverse", |call| Ok(call.args.join(" ").chars().rev().collect()));
        bot.set_subroutine("broken", |call| {
            Err(MacroError::Failed { name: call.name.to_string(), message: "nope".to_string() })
        });
        assert_eq!(bot.reply("u", "reverse hello").unwrap(), "olleh");
        assert_eq!(bot.reply("u", "fail").unwrap(), "[ERR: Error when executing object]");
    }

    #[test]
    fn trigger_info_and_write() {
        let bot = RiveScript::new(Options::default());
        bot.stream("+ hi\n- hello\n> topic other\n+ hi\n- again\n< topic").unwrap();
        let sites = bot.trigger_info("hi");
        assert_eq!(sites.len(), 2);
        assert!(sites.iter().any(|s| s.topic == "other" && s.location.line == 4));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.rive");
        bot.write(&path).unwrap();
        let copy = RiveScript::new(Options::default());
        copy.load_file(&path).unwrap();
        assert_eq!(copy.deparse().topics, bot.deparse().topics);
    }
}
