//! Source text to [`Document`].
//!
//! The parser is line oriented. Every non-comment line starts with a one
//! character command:
//!
//! ```text
//! !  definition        ! var name = Aiden
//! >  open a label      > topic sports inherits random
//! <  close a label     < topic
//! +  trigger           + my name is *
//! %  previous          % who is there
//! -  reply             - Nice to meet you, <star>.
//! *  condition         * <get name> == undefined => Who are you?
//! @  redirect          @ hello
//! ^  continuation      ^ and this goes on the previous line
//! ```
//!
//! ## Pass structure
//!
//! Each source unit is read once, top to bottom. A command is held as
//! *pending* until the next command arrives so that `^` lines can be folded
//! into it; only then is it syntax checked (`parser/syntax.rs`) and applied.
//! Labels (`>`/`<`) are applied immediately because object macro bodies that
//! follow them must be captured raw.
//!
//! ## Invariants
//!
//! - A unit is parsed into a scratch copy of the document; the caller's
//!   document only changes when the whole unit parsed cleanly.
//! - The `! local concat` join mode is reset for every unit.

#[path = "parser/syntax.rs"]
mod syntax;

use crate::document::{BEGIN_TOPIC, DEFAULT_TOPIC, Document, ObjectMacro, SourceLocation, Trigger, upsert};
use crate::error::{Diagnostic, LoadError, SyntaxError};
use crate::Options;
use log::{debug, warn};
use std::path::Path;

/// Highest `! version` this parser understands.
const SUPPORTED_VERSION: f64 = 2.0;

/// One named chunk of source text, usually a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub name: String,
    pub lines: Vec<String>,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, text: &str) -> Self {
        Self { name: name.into(), lines: text.lines().map(str::to_string).collect() }
    }

    /// Read a unit from disk, naming it after the path.
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?;
        Ok(Self::new(path.display().to_string(), &text))
    }
}

#[derive(Debug, Clone)]
pub struct Parser {
    strict: bool,
    utf8: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(&Options::default())
    }
}

impl Parser {
    pub fn new(options: &Options) -> Self {
        Self { strict: options.strict, utf8: options.utf8 }
    }

    /// Parse `units` in order into a fresh document. Warnings go to the log.
    pub fn parse(&self, units: &[SourceUnit]) -> Result<Document, SyntaxError> {
        self.parse_with(units, &mut |_| {})
    }

    /// Like [`Parser::parse`], also handing every warning to `on_warn`.
    pub fn parse_with(
        &self,
        units: &[SourceUnit],
        on_warn: &mut dyn FnMut(Diagnostic),
    ) -> Result<Document, SyntaxError> {
        let mut doc = Document::new();
        for unit in units {
            self.parse_unit(&mut doc, unit, on_warn)?;
        }
        Ok(doc)
    }

    /// Parse one unit on top of `doc`.
    ///
    /// On error `doc` is left untouched.
    pub fn parse_unit(
        &self,
        doc: &mut Document,
        unit: &SourceUnit,
        on_warn: &mut dyn FnMut(Diagnostic),
    ) -> Result<(), SyntaxError> {
        let mut run = UnitParser::new(self, &unit.name, doc.clone(), on_warn);
        for (idx, raw) in unit.lines.iter().enumerate() {
            run.line(idx + 1, raw)?;
        }
        *doc = run.finish(unit.lines.len())?;
        Ok(())
    }
}

// --- Per-unit state ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Begin,
    Topic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Concat {
    None,
    Space,
    Newline,
}

impl Concat {
    fn separator(self) -> &'static str {
        match self {
            Concat::None => "",
            Concat::Space => " ",
            Concat::Newline => "\n",
        }
    }
}

struct Pending {
    cmd: char,
    text: String,
    line: usize,
}

struct UnitParser<'a> {
    parser: &'a Parser,
    file: &'a str,
    doc: Document,
    on_warn: &'a mut dyn FnMut(Diagnostic),
    topic: String,
    labels: Vec<Label>,
    concat: Concat,
    /// Index of the last trigger in `topic`, if replies may attach to it.
    current: Option<usize>,
    in_comment: bool,
    object: Option<ObjectMacro>,
    pending: Option<Pending>,
}

impl<'a> UnitParser<'a> {
    fn new(parser: &'a Parser, file: &'a str, doc: Document, on_warn: &'a mut dyn FnMut(Diagnostic)) -> Self {
        Self {
            parser,
            file,
            doc,
            on_warn,
            topic: DEFAULT_TOPIC.to_string(),
            labels: Vec::new(),
            concat: Concat::None,
            current: None,
            in_comment: false,
            object: None,
            pending: None,
        }
    }

    fn warn(&mut self, line: usize, message: impl Into<String>) {
        let diag = Diagnostic::new(self.file, line, message);
        warn!("{diag}");
        (self.on_warn)(diag);
    }

    fn error(&self, line: usize, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.file, line, message)
    }

    fn line(&mut self, lineno: usize, raw: &str) -> Result<(), SyntaxError> {
        if let Some(object) = self.object.as_mut() {
            if regex!(r"^\s*<\s*object").is_match(raw) {
                self.close_object();
            } else {
                object.source.push(raw.to_string());
            }
            return Ok(());
        }

        let line = regex!(r"\s+").replace_all(raw.trim(), " ");
        if line.is_empty() {
            return Ok(());
        }

        if line.starts_with("//") {
            return Ok(());
        } else if line.starts_with("/*") {
            self.in_comment = !line.contains("*/");
            return Ok(());
        } else if line.contains("*/") {
            self.in_comment = false;
            return Ok(());
        }
        if self.in_comment {
            return Ok(());
        }
        if line.starts_with('#') {
            self.warn(lineno, "Using the # symbol for comments is deprecated");
            return Ok(());
        }

        let mut chars = line.chars();
        let Some(cmd) = chars.next() else { return Ok(()) };
        let mut text = chars.as_str().trim();
        if text.is_empty() {
            self.warn(lineno, format!("Weird single-character line '{line}' found"));
            return Ok(());
        }
        if let Some(idx) = text.find(" //") {
            text = text[..idx].trim_end();
        }

        if cmd == '^' {
            match self.pending.as_mut() {
                Some(pending) => {
                    let sep = if pending.cmd == '!' { "<crlf>" } else { self.concat.separator() };
                    pending.text.push_str(sep);
                    pending.text.push_str(text);
                }
                None => self.warn(lineno, "Continuation line has nothing to continue"),
            }
            return Ok(());
        }

        self.flush()?;
        match cmd {
            '>' => self.open_label(lineno, text),
            '<' => self.close_label(lineno, text),
            _ => {
                self.pending = Some(Pending { cmd, text: text.to_string(), line: lineno });
                Ok(())
            }
        }
    }

    fn finish(mut self, last_line: usize) -> Result<Document, SyntaxError> {
        self.flush()?;
        if self.object.is_some() {
            return Err(self.error(last_line, "Unclosed object label at end of file"));
        }
        if let Some(label) = self.labels.last() {
            let name = if *label == Label::Begin { "begin" } else { "topic" };
            return Err(self.error(last_line, format!("Unclosed '{name}' label at end of file")));
        }
        Ok(self.doc)
    }

    // --- Labels --------------------------------------------------------------

    fn open_label(&mut self, lineno: usize, text: &str) -> Result<(), SyntaxError> {
        if !self.checked(lineno, '>', text)? {
            return Ok(());
        }
        let fields: Vec<&str> = text.split(' ').collect();
        match fields[0] {
            "begin" | "topic" => {
                if !self.labels.is_empty() {
                    return Err(self.error(lineno, "Labels can't be nested: close the open topic first"));
                }
                let (label, name) = if fields[0] == "begin" {
                    (Label::Begin, BEGIN_TOPIC)
                } else {
                    match fields.get(1) {
                        Some(name) => (Label::Topic, *name),
                        None => return Err(self.error(lineno, "Topic label is missing a name")),
                    }
                };
                let (includes, inherits) = relations(&fields[2.min(fields.len())..]);
                debug!("{} line {lineno}: entering topic {name}", self.file);
                self.labels.push(label);
                self.topic = name.to_string();
                self.current = None;
                self.doc.topic_mut(name).relate(&includes, &inherits);
            }
            "object" => {
                let Some(name) = fields.get(1) else {
                    return Err(self.error(lineno, "Object label is missing a name"));
                };
                let language = match fields.get(2) {
                    Some(lang) => lang.to_lowercase(),
                    None => {
                        self.warn(lineno, format!("Object '{name}' has no language; assuming rust"));
                        "rust".to_string()
                    }
                };
                self.current = None;
                self.object = Some(ObjectMacro {
                    name: name.to_string(),
                    language,
                    source: Vec::new(),
                    location: SourceLocation { file: self.file.to_string(), line: lineno },
                });
            }
            other => self.warn(lineno, format!("Unknown label type '{other}'")),
        }
        Ok(())
    }

    fn close_label(&mut self, lineno: usize, text: &str) -> Result<(), SyntaxError> {
        let expected = match text {
            "begin" => Label::Begin,
            "topic" => Label::Topic,
            "object" => {
                self.warn(lineno, "Closing an object label that was never opened");
                return Ok(());
            }
            other => {
                self.warn(lineno, format!("Unknown label type '{other}'"));
                return Ok(());
            }
        };
        match self.labels.pop() {
            Some(open) if open == expected => {
                self.topic = DEFAULT_TOPIC.to_string();
                self.current = None;
                Ok(())
            }
            Some(_) => Err(self.error(lineno, format!("Mismatched label: '< {text}' closes a different block"))),
            None => Err(self.error(lineno, format!("'< {text}' has no matching open label"))),
        }
    }

    fn close_object(&mut self) {
        if let Some(object) = self.object.take() {
            debug!("{}: captured object macro {} ({})", self.file, object.name, object.language);
            self.doc.objects.push(object);
        }
    }

    // --- Commands ------------------------------------------------------------

    fn flush(&mut self) -> Result<(), SyntaxError> {
        let Some(Pending { cmd, text, line }) = self.pending.take() else { return Ok(()) };
        if !self.checked(line, cmd, &text)? {
            return Ok(());
        }
        match cmd {
            '!' => self.define(line, &text)?,
            '+' => {
                let location = SourceLocation { file: self.file.to_string(), line };
                let topic = self.topic.clone();
                let triggers = &mut self.doc.topic_mut(&topic).triggers;
                triggers.push(Trigger { pattern: text, topic, location, ..Default::default() });
                self.current = Some(triggers.len() - 1);
            }
            '%' | '-' | '*' | '@' => {
                let topic = self.topic.clone();
                let current = self.current;
                let Some(trigger) = current.and_then(|i| self.doc.topic_mut(&topic).triggers.get_mut(i)) else {
                    let what = match cmd {
                        '%' => "Previous",
                        '-' => "Response",
                        '*' => "Condition",
                        _ => "Redirect",
                    };
                    self.warn(line, format!("{what} found before trigger"));
                    return Ok(());
                };
                match cmd {
                    '%' => trigger.previous = Some(text),
                    '-' => trigger.replies.push(text),
                    '*' => trigger.conditions.push(text),
                    _ => trigger.redirect = Some(text),
                }
            }
            other => self.warn(line, format!("Unrecognized command \"{other}\"")),
        }
        Ok(())
    }

    /// Run the syntax check. `Ok(false)` means "skip this line" (non-strict mode).
    fn checked(&mut self, line: usize, cmd: char, text: &str) -> Result<bool, SyntaxError> {
        match syntax::check(cmd, text, self.parser.utf8) {
            Ok(()) => Ok(true),
            Err(message) => {
                let message = format!("{message} (near: {cmd} {text})");
                if self.parser.strict {
                    Err(self.error(line, message))
                } else {
                    self.warn(line, format!("Syntax error: {message}"));
                    Ok(false)
                }
            }
        }
    }

    fn define(&mut self, lineno: usize, text: &str) -> Result<(), SyntaxError> {
        let mut halves = regex!(r"\s*=\s*").splitn(text, 2);
        let left = halves.next().unwrap_or_default().trim();
        let mut value = halves.next().unwrap_or_default().trim().to_string();
        let mut words = left.split_whitespace();
        let kind = words.next().unwrap_or_default();
        let name = words.collect::<Vec<_>>().join(" ");

        if kind != "array" {
            value = value.replace("<crlf>", "");
        }

        if kind == "version" {
            match value.parse::<f64>() {
                Ok(v) if v > SUPPORTED_VERSION => {
                    return Err(self.error(lineno, format!("Unsupported version {value}; only {SUPPORTED_VERSION} is supported")));
                }
                Ok(_) => {}
                Err(_) => self.warn(lineno, "Error parsing version number: not a number"),
            }
            return Ok(());
        }

        if name.is_empty() {
            self.warn(lineno, "Undefined variable name");
            return Ok(());
        }
        if value.is_empty() {
            self.warn(lineno, "Undefined variable value");
            return Ok(());
        }
        let delete = value == "<undef>";

        match kind {
            "local" => {
                if name == "concat" {
                    self.concat = match value.as_str() {
                        "none" => Concat::None,
                        "space" => Concat::Space,
                        "newline" => Concat::Newline,
                        other => {
                            self.warn(lineno, format!("Unknown concat mode '{other}'; using none"));
                            Concat::None
                        }
                    };
                } else {
                    self.warn(lineno, format!("Unknown local option '{name}'"));
                }
            }
            "global" | "var" => {
                let table = if kind == "global" { &mut self.doc.globals } else { &mut self.doc.vars };
                if delete {
                    table.remove(&name);
                } else {
                    table.insert(name, value);
                }
            }
            "sub" | "person" => {
                let list = if kind == "sub" { &mut self.doc.subs } else { &mut self.doc.person };
                upsert(list, &name, (!delete).then_some(value));
            }
            "array" => {
                if delete {
                    self.doc.arrays.remove(&name);
                    return Ok(());
                }
                let mut fields = Vec::new();
                for part in value.split("<crlf>") {
                    let items: Vec<&str> =
                        if part.contains('|') { part.split('|').collect() } else { part.split_whitespace().collect() };
                    fields.extend(
                        items.into_iter().map(|f| f.trim().replace("\\s", " ")).filter(|f| !f.is_empty()),
                    );
                }
                self.doc.arrays.insert(name, fields);
            }
            other => self.warn(lineno, format!("Unknown definition type '{other}'")),
        }
        Ok(())
    }
}

/// Split `> topic` trailing fields into (includes, inherits).
fn relations(fields: &[&str]) -> (Vec<String>, Vec<String>) {
    let mut includes = Vec::new();
    let mut inherits = Vec::new();
    let mut mode = None;
    for field in fields {
        match *field {
            "includes" => mode = Some(true),
            "inherits" => mode = Some(false),
            name => match mode {
                Some(true) => includes.push(name.to_string()),
                Some(false) => inherits.push(name.to_string()),
                None => {}
            },
        }
    }
    (includes, inherits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<Document, SyntaxError> {
        Parser::default().parse(&[SourceUnit::new("test.rive", src)])
    }

    fn parse_warnings(src: &str) -> (Document, Vec<Diagnostic>) {
        let mut warnings = Vec::new();
        let doc = Parser::default()
            .parse_with(&[SourceUnit::new("test.rive", src)], &mut |d| warnings.push(d))
            .unwrap();
        (doc, warnings)
    }

    #[test]
    fn triggers_collect_replies_conditions_and_redirects() {
        let doc = parse(
            "
            + hello bot
            - Hello human.
            - Hi there!

            + what is my name
            * <get name> != undefined => Your name is <get name>.
            - You didn't tell me.

            + hey
            @ hello bot
        ",
        )
        .unwrap();
        let random = doc.topic("random").unwrap();
        assert_eq!(random.triggers.len(), 3);
        assert_eq!(random.triggers[0].replies, vec!["Hello human.", "Hi there!"]);
        assert_eq!(random.triggers[1].conditions.len(), 1);
        assert_eq!(random.triggers[2].redirect.as_deref(), Some("hello bot"));
        assert_eq!(random.triggers[0].location.line, 2);
    }

    #[test]
    fn definitions_fill_tables() {
        let doc = parse(
            "
            ! version = 2.0
            ! global debug = false
            ! var name = Aiden
            ! sub what's = what is
            ! person i am = you are
            ! array colors = red blue green
            ! array greek = alpha|beta gamma
            ! array pets = cat dog
            ^ fish
        ",
        )
        .unwrap();
        assert_eq!(doc.globals["debug"], "false");
        assert_eq!(doc.vars["name"], "Aiden");
        assert_eq!(doc.subs, vec![("what's".to_string(), "what is".to_string())]);
        assert_eq!(doc.person[0].0, "i am");
        assert_eq!(doc.arrays["colors"], vec!["red", "blue", "green"]);
        assert_eq!(doc.arrays["greek"], vec!["alpha", "beta gamma"]);
        assert_eq!(doc.arrays["pets"], vec!["cat", "dog", "fish"]);
    }

    #[test]
    fn undef_deletes_across_units() {
        let units = [
            SourceUnit::new("a.rive", "! var name = Aiden\n! var age = 5"),
            SourceUnit::new("b.rive", "! var age = <undef>"),
        ];
        let doc = Parser::default().parse(&units).unwrap();
        assert_eq!(doc.vars.get("age"), None);
        assert_eq!(doc.vars["name"], "Aiden");
    }

    #[test]
    fn continuation_respects_local_concat_and_resets_per_unit() {
        let units = [
            SourceUnit::new(
                "a.rive",
                "! local concat = space\n+ test one\n- First line\n^ second line\n",
            ),
            SourceUnit::new("b.rive", "+ test two\n- First line\n^ second line\n"),
        ];
        let doc = Parser::default().parse(&units).unwrap();
        let triggers = &doc.topic("random").unwrap().triggers;
        assert_eq!(triggers[0].replies[0], "First line second line");
        assert_eq!(triggers[1].replies[0], "First linesecond line");
    }

    #[test]
    fn previous_attaches_to_trigger() {
        let doc = parse("+ who is there\n% knock knock\n- <sentence> who?").unwrap();
        let trig = &doc.topic("random").unwrap().triggers[0];
        assert_eq!(trig.previous.as_deref(), Some("knock knock"));
        assert_eq!(trig.replies, vec!["<sentence> who?"]);
    }

    #[test]
    fn topics_record_relations_and_begin() {
        let doc = parse(
            "
            > begin
            + request
            - {ok}
            < begin

            > topic alpha includes beta gamma inherits delta
            + hi
            - alpha
            < topic
        ",
        )
        .unwrap();
        assert!(doc.topic(BEGIN_TOPIC).is_some());
        let alpha = doc.topic("alpha").unwrap();
        assert_eq!(alpha.includes, vec!["beta", "gamma"]);
        assert_eq!(alpha.inherits, vec!["delta"]);
        assert_eq!(alpha.triggers[0].topic, "alpha");
    }

    #[test]
    fn objects_are_captured_raw() {
        let doc = parse(
            "> object reverse perl\n    my ($rs, @args) = @_;\n    return reverse join ' ', @args;\n< object\n+ hi\n- ok",
        )
        .unwrap();
        assert_eq!(doc.objects.len(), 1);
        let obj = &doc.objects[0];
        assert_eq!(obj.name, "reverse");
        assert_eq!(obj.language, "perl");
        assert_eq!(obj.source[0], "    my ($rs, @args) = @_;");
        assert_eq!(doc.topic("random").unwrap().triggers.len(), 1);
    }

    #[test]
    fn comments_are_skipped() {
        let (doc, warnings) = parse_warnings(
            "
            // line comment
            /* block
               + not a trigger
            */
            + hello // inline
            - hi
            # old style
        ",
        );
        let triggers = &doc.topic("random").unwrap().triggers;
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].pattern, "hello");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("deprecated"));
    }

    #[test]
    fn reply_before_trigger_warns() {
        let (doc, warnings) = parse_warnings("- orphan\n+ hi\n- ok");
        assert_eq!(doc.topic("random").unwrap().triggers[0].replies, vec!["ok"]);
        assert_eq!(warnings[0].line, 1);
        assert!(warnings[0].message.contains("Response found before trigger"));
    }

    #[test]
    fn label_balance_is_enforced() {
        assert!(parse("> topic a\n+ hi\n- ok").is_err());
        assert!(parse("< topic").is_err());
        assert!(parse("> begin\n+ request\n- {ok}\n< topic").is_err());
        assert!(parse("> topic a\n> topic b\n< topic\n< topic").is_err());
        assert!(parse("> object x perl\nreturn 1;").is_err());
    }

    #[test]
    fn syntax_errors_carry_location() {
        let err = parse("+ hello bot\n- hi\n+ Hello Bot\n- hi").unwrap_err();
        assert_eq!(err.file, "test.rive");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn non_strict_mode_skips_bad_lines() {
        let parser = Parser::new(&Options { strict: false, ..Options::default() });
        let doc = parser.parse(&[SourceUnit::new("x", "+ Hello\n- hi\n+ ok\n- fine")]).unwrap();
        let triggers = &doc.topic("random").unwrap().triggers;
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].pattern, "ok");
    }

    #[test]
    fn newer_versions_are_rejected() {
        assert!(parse("! version = 3.0").is_err());
    }

    #[test]
    fn failed_unit_leaves_document_untouched() {
        let parser = Parser::default();
        let mut doc = Document::new();
        parser.parse_unit(&mut doc, &SourceUnit::new("a", "+ hi\n- ok"), &mut |_| {}).unwrap();
        let before = doc.clone();
        let bad = SourceUnit::new("b", "! var x = 1\n+ broken (\n- no");
        assert!(parser.parse_unit(&mut doc, &bad, &mut |_| {}).is_err());
        assert_eq!(doc, before);
    }
}
