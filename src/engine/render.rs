//! Tag evaluation (reply template to final text).
//!
//! Rendering runs in fixed stages. Only stage 5 iterates:
//!
//! ```text
//! (1) (@array)            -> {random}a|b|c{/random}
//! (2) shortcuts           -> <formal> = {formal}<star>{/formal}, <@> = {@<star>}
//! (3) {weight=N}          -> removed
//! (4) {random}..{/random} -> one alternative, innermost first
//! (5) fixed point, at most `depth` passes:
//!       every innermost ready <tag>           evaluated left to right
//!       every innermost ready {format} block  transformed
//! (6) escapes \s \n \#
//! (7) {topic=name}
//! (8) {@target}           -> inline redirect (step + 1)
//! (9) <call>..</call>     -> object macro
//! ```
//!
//! A tag is *ready* when nothing inside it is still pending: `<set a=<get b>>`
//! waits one pass for `<get b>`, and `<set a={formal}x{/formal}>` waits for
//! the block. A pass ends after the first nested tag so that a later
//! `<get a>` sees the outer `<set>` applied. Values produced by a tag are scanned again on the next pass,
//! which is what the pass budget protects against.
//!
//! Tags the evaluator doesn't know (HTML like `<b>`, and `<call>` until
//! stage 9) are parked as `\x00N\x01` placeholders so the loop cannot see
//! them, then restored after stage 5.

use super::format::Case;
use super::resolve::{Captures, Responder, Scope};
use crate::error::{MacroError, SessionResult};
use crate::object::MacroCall;
use crate::session::{TOPIC_VAR, UNDEFINED};
use log::{debug, warn};
use regex::{NoExpand, Regex};

const SHORTCUTS: [(&str, &str); 6] = [
    ("<person>", "{person}<star>{/person}"),
    ("<formal>", "{formal}<star>{/formal}"),
    ("<sentence>", "{sentence}<star>{/sentence}"),
    ("<uppercase>", "{uppercase}<star>{/uppercase}"),
    ("<lowercase>", "{lowercase}<star>{/lowercase}"),
    ("<@>", "{@<star>}"),
];

impl Responder<'_> {
    /// Render a reply (or condition side, or redirect target) template.
    pub(crate) fn render(&self, template: &str, caps: Captures<'_>, step: usize) -> SessionResult<String> {
        let text = self.expand_arrays(template);
        let text = SHORTCUTS.iter().fold(text, |text, (short, long)| text.replace(short, long));
        let text = regex!(r"\{weight=\d+\}").replace_all(&text, "").into_owned();
        let text = self.choose_random(text);

        let mut parked = Vec::new();
        let text = self.evaluate(text, caps, &mut parked)?;
        let text = regex!(r"\x00(\d+)\x01")
            .replace_all(&text, |c: &regex::Captures<'_>| {
                c[1].parse::<usize>().ok().and_then(|i| parked.get(i)).cloned().unwrap_or_default()
            })
            .into_owned();

        let mut text = text.replace("\\s", " ").replace("\\n", "\n").replace("\\#", "#");

        let topics: Vec<String> =
            regex!(r"\{topic=(.+?)\}").captures_iter(&text).map(|c| c[1].trim().to_string()).collect();
        for topic in topics {
            debug!("setting topic of {} to {topic}", self.user);
            self.sessions.set(self.user, TOPIC_VAR, &topic)?;
        }
        text = regex!(r"\{topic=(.+?)\}").replace_all(&text, "").into_owned();

        let text = try_replace(&text, regex!(r"\{@(.+?)\}"), |c| self.redirect(c[1].trim(), step))?;
        try_replace(&text, regex!(r"(?s)<call>(.*?)</call>"), |c| Ok(self.call(&c[1])))
    }

    fn expand_arrays(&self, template: &str) -> String {
        regex!(r"\(@([A-Za-z0-9_]+)\)")
            .replace_all(template, |c: &regex::Captures<'_>| match self.brain.arrays.get(&c[1]) {
                Some(members) if !members.is_empty() => format!("{{random}}{}{{/random}}", members.join("|")),
                _ => c[0].to_string(),
            })
            .into_owned()
    }

    fn choose_random(&self, mut text: String) -> String {
        const OPEN: &str = "{random}";
        const CLOSE: &str = "{/random}";
        while let Some(close) = text.find(CLOSE) {
            let Some(open) = text[..close].rfind(OPEN) else { break };
            let body = &text[open + OPEN.len()..close];
            let choices: Vec<&str> =
                if body.contains('|') { body.split('|').collect() } else { body.split_whitespace().collect() };
            let choice = self.pick(&choices).unwrap_or_default().to_string();
            text.replace_range(open..close + CLOSE.len(), &choice);
        }
        text
    }

    fn evaluate(&self, mut text: String, caps: Captures<'_>, parked: &mut Vec<String>) -> SessionResult<String> {
        for _ in 0..self.brain.depth.max(1) {
            let (next, changed) = self.evaluate_pass(&text, caps, parked)?;
            text = next;
            if !changed {
                return Ok(text);
            }
        }
        if regex!(r"<[^<>]+>").is_match(&text) {
            warn!("deep recursion while rendering a reply for {}", self.user);
            text = regex!(r"<[^<>]+>").replace_all(&text, NoExpand(&self.errors.deep_recursion)).into_owned();
        }
        Ok(text)
    }

    fn evaluate_pass(
        &self,
        text: &str,
        caps: Captures<'_>,
        parked: &mut Vec<String>,
    ) -> SessionResult<(String, bool)> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let mut changed = false;
        for m in regex!(r"<([^<>]+)>").captures_iter(text) {
            let (Some(whole), Some(inner)) = (m.get(0), m.get(1)) else { continue };
            if regex!(r"\{/?(?:person|formal|sentence|uppercase|lowercase)\}").is_match(inner.as_str()) {
                continue;
            }
            let gap = &text[last..whole.start()];
            out.push_str(gap);
            match self.tag(inner.as_str(), caps)? {
                Some(value) => out.push_str(&value),
                None => {
                    out.push_str(&format!("\x00{}\x01", parked.len()));
                    parked.push(whole.as_str().to_string());
                }
            }
            last = whole.end();
            changed = true;
            // Nested in an outer tag: what follows must see the outer tag's effect first.
            if nested_in_tag(text, whole.start(), whole.end()) {
                break;
            }
        }
        out.push_str(&text[last..]);

        let (out, transformed) = self.transform_blocks(&out);
        Ok((out, changed || transformed))
    }

    /// Transform every innermost `{format}` block whose content is final.
    fn transform_blocks(&self, text: &str) -> (String, bool) {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let mut changed = false;
        let mut open: Option<(usize, usize, &str)> = None;
        for m in regex!(r"\{(/?)(person|formal|sentence|uppercase|lowercase)\}").captures_iter(text) {
            let (Some(whole), Some(kind)) = (m.get(0), m.get(2)) else { continue };
            let closing = m.get(1).is_some_and(|slash| !slash.as_str().is_empty());
            if !closing {
                open = Some((whole.start(), whole.end(), kind.as_str()));
                continue;
            }
            let Some((start, body_start, opened)) = open.take() else { continue };
            let body = &text[body_start..whole.start()];
            if opened != kind.as_str() || regex!(r"<[^<>]+>").is_match(body) {
                continue;
            }
            out.push_str(&text[last..start]);
            out.push_str(&self.format_block(opened, body));
            last = whole.end();
            changed = true;
        }
        out.push_str(&text[last..]);
        (out, changed)
    }

    fn format_block(&self, kind: &str, body: &str) -> String {
        if kind == "person" {
            return self.brain.person.apply(body);
        }
        match Case::from_tag(kind) {
            Some(case) => case.apply(body),
            None => body.to_string(),
        }
    }

    /// Evaluate one angle tag. `None` means "not ours, leave it alone".
    fn tag(&self, inner: &str, caps: Captures<'_>) -> SessionResult<Option<String>> {
        let inner = inner.trim();
        let (name, data) = match inner.split_once(char::is_whitespace) {
            Some((name, data)) => (name.to_lowercase(), data.trim()),
            None => (inner.to_lowercase(), ""),
        };

        if data.is_empty() {
            if let Some(c) = regex!(r"^(bot)?star(\d*)$").captures(&name) {
                let list = if c.get(1).is_some() { caps.botstars } else { caps.stars };
                let index = c[2].parse::<usize>().unwrap_or(1);
                let value = index.checked_sub(1).and_then(|i| list.get(i));
                return Ok(Some(value.map_or(UNDEFINED.to_string(), String::clone)));
            }
            if let Some(c) = regex!(r"^(input|reply)(\d*)$").captures(&name) {
                let index = c[2].parse::<usize>().unwrap_or(1);
                let history = self.history()?;
                let value = if &c[1] == "input" { history.input(index) } else { history.reply(index) };
                return Ok(Some(value.to_string()));
            }
            if name == "id" {
                return Ok(Some(self.user.to_string()));
            }
            return Ok(None);
        }

        match name.as_str() {
            "bot" | "env" => {
                let scope = if name == "bot" { Scope::Bot } else { Scope::Env };
                match data.split_once('=') {
                    Some((key, value)) => {
                        debug!("set {name} variable {}={value}", key.trim());
                        self.vars.set(scope, key.trim(), Some(value));
                        Ok(Some(String::new()))
                    }
                    None => {
                        let value = self.vars.get(scope, &self.brain.document, data);
                        Ok(Some(value.unwrap_or_else(|| UNDEFINED.to_string())))
                    }
                }
            }
            "get" => Ok(Some(self.sessions.get(self.user, data)?.unwrap_or_else(|| UNDEFINED.to_string()))),
            "set" => match data.split_once('=') {
                Some((key, value)) => {
                    debug!("set uservar {}={value} for {}", key.trim(), self.user);
                    self.sessions.set(self.user, key.trim(), value)?;
                    Ok(Some(String::new()))
                }
                None => Ok(None),
            },
            "add" | "sub" | "mult" | "div" => match data.split_once('=') {
                Some((key, value)) => self.math(&name, key.trim(), value.trim()).map(Some),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Integer arithmetic on a user variable. Failures leave it unchanged.
    fn math(&self, op: &str, name: &str, value: &str) -> SessionResult<String> {
        let Ok(operand) = value.parse::<i64>() else {
            return Ok(format!("[ERR: Math can't '{op}' non-numeric value '{value}']"));
        };
        let current = match self.sessions.get(self.user, name)? {
            None => 0,
            Some(v) if v == UNDEFINED => 0,
            Some(v) => match v.trim().parse::<i64>() {
                Ok(n) => n,
                Err(_) => return Ok(format!("[ERR: Math couldn't '{op}' to value '{v}']")),
            },
        };
        let result = match op {
            "add" => current.checked_add(operand),
            "sub" => current.checked_sub(operand),
            "mult" => current.checked_mul(operand),
            _ if operand == 0 => return Ok(self.errors.divide_by_zero.clone()),
            _ => floor_div(current, operand),
        };
        match result {
            Some(n) => {
                self.sessions.set(self.user, name, &n.to_string())?;
                Ok(String::new())
            }
            None => Ok(format!("[ERR: Math couldn't '{op}' to value '{current}']")),
        }
    }

    fn call(&self, body: &str) -> String {
        let mut parts = split_args(body).into_iter();
        let Some(name) = parts.next() else { return String::new() };
        let args: Vec<String> = parts.collect();
        let call = MacroCall { name: &name, user: self.user, args: &args, message: self.message };
        match self.macros.call(&call) {
            Ok(output) => output,
            Err(MacroError::NotFound(_)) => {
                warn!("object {name} not found");
                self.errors.object_missing.clone()
            }
            Err(MacroError::NoHandler(language)) => {
                warn!("no handler for object {name} ({language})");
                self.errors.object_handler.clone()
            }
            Err(e) => {
                warn!("{e}");
                self.errors.object.clone()
            }
        }
    }
}

/// True when `text[start..end]` sits inside an outer tag such as `<set x=...>`:
/// the closest unclosed `<` before it opens a named tag that closes later.
fn nested_in_tag(text: &str, start: usize, end: usize) -> bool {
    let before = &text[..start];
    let Some(open) = before.rfind('<') else { return false };
    !before[open..].contains('>')
        && before[open + 1..].starts_with(|c: char| c.is_ascii_alphabetic())
        && text[end..].contains('>')
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) { Some(q - 1) } else { Some(q) }
}

/// Whitespace separated arguments; `"double quoted"` ones keep their spaces.
fn split_args(text: &str) -> Vec<String> {
    regex!(r#""([^"]*)"|(\S+)"#)
        .captures_iter(text)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)).map(|m| m.as_str().to_string()))
        .collect()
}

/// `Regex::replace_all` with a fallible replacement.
fn try_replace<F>(text: &str, re: &Regex, mut f: F) -> SessionResult<String>
where
    F: FnMut(&regex::Captures<'_>) -> SessionResult<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&text[last..whole.start()]);
        out.push_str(&f(&caps)?);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Options, RiveScript};

    fn bot(source: &str) -> RiveScript {
        let bot = RiveScript::new(Options { seed: Some(1), ..Options::default() });
        bot.stream(source).unwrap();
        bot
    }

    fn reply(bot: &RiveScript, message: &str) -> String {
        bot.reply("u1", message).unwrap()
    }

    #[test]
    fn nested_tags_resolve_inside_out() {
        let b = bot("+ my name is *\n- <set name=<formal>>Nice to meet you, <get name>.");
        assert_eq!(reply(&b, "my name is aiden james"), "Nice to meet you, Aiden James.");
        assert_eq!(b.get_uservar("u1", "name").unwrap().as_deref(), Some("Aiden James"));
    }

    #[test]
    fn set_from_own_value_is_a_no_op() {
        let b = bot("+ keep\n- <set name=<get name>>kept <get name>");
        b.set_uservar("u1", "name", "Aiden").unwrap();
        assert_eq!(reply(&b, "keep"), "kept Aiden");
        assert_eq!(b.get_uservar("u1", "name").unwrap().as_deref(), Some("Aiden"));
    }

    #[test]
    fn stars_and_history() {
        let b = bot("+ * told me to say *\n- Why would <star1> tell you to say \"<star2>\"?\n+ echo\n- <input1> / <reply1>");
        assert_eq!(reply(&b, "John told me to say hi"), "Why would john tell you to say \"hi\"?");
        assert_eq!(reply(&b, "echo"), "john told me to say hi / Why would john tell you to say \"hi\"?");
        assert_eq!(reply(&b, "echo"), "echo / john told me to say hi / Why would john tell you to say \"hi\"?");
    }

    #[test]
    fn arithmetic_is_soft() {
        let b = bot(
            "+ add *\n- <add n=<star>>n=<get n>\n+ div *\n- <div n=<star>>n=<get n>\n+ oops\n- <add n=abc>",
        );
        assert_eq!(reply(&b, "add 5"), "n=5");
        assert_eq!(reply(&b, "add 10"), "n=15");
        assert_eq!(reply(&b, "div 2"), "n=7");
        assert_eq!(reply(&b, "div 0"), "[ERR: Can't Divide By Zero]n=7");
        assert_eq!(reply(&b, "oops"), "[ERR: Math can't 'add' non-numeric value 'abc']");
        b.set_uservar("u1", "n", "seven").unwrap();
        assert_eq!(reply(&b, "add 1"), "[ERR: Math couldn't 'add' to value 'seven']n=seven");
    }

    #[test]
    fn format_blocks_and_unknown_tags() {
        let b = bot(
            "
            ! person i am = you are
            ! person you are = i am
            + say *
            - {uppercase}<star>{/uppercase} <b>{sentence}hello THERE{/sentence}</b>
            + i think *
            - You think <person>?
            ",
        );
        assert_eq!(reply(&b, "say hi"), "HI <b>Hello there</b>");
        assert_eq!(reply(&b, "i think i am smart"), "You think you are smart?");
    }

    #[test]
    fn random_escapes_and_topics() {
        let b = bot(
            "
            + pick
            - {random}alpha|alpha{/random}\\sdone\\#
            + go away
            - {topic=sorry}Fine.
            > topic sorry
              + *
              - Say sorry.
            < topic
            ",
        );
        assert_eq!(reply(&b, "pick"), "alpha done#");
        assert_eq!(reply(&b, "go away"), "Fine.");
        assert_eq!(b.get_uservar("u1", "topic").unwrap().as_deref(), Some("sorry"));
        assert_eq!(reply(&b, "hello"), "Say sorry.");
    }

    #[test]
    fn arrays_and_inline_redirects() {
        let b = bot(
            "
            ! array colors = red
            + color
            - (@colors) it is
            + hello
            - Hi!
            + greet *
            - {@hello} <@>
            ",
        );
        assert_eq!(reply(&b, "color"), "red it is");
        assert_eq!(reply(&b, "greet hello"), "Hi! Hi!");
    }

    #[test]
    fn bot_and_env_variables() {
        let b = bot("! var name = Aiden\n+ who\n- <bot name>\n+ rename\n- <bot name=Casey>ok\n+ env\n- <env missing>");
        assert_eq!(reply(&b, "who"), "Aiden");
        assert_eq!(reply(&b, "rename"), "ok");
        assert_eq!(reply(&b, "who"), "Casey");
        assert_eq!(reply(&b, "env"), "undefined");
    }

    #[test]
    fn runaway_values_hit_the_budget() {
        let b = bot("+ loop\n- <get x>");
        b.set_uservar("u1", "x", "<get x>").unwrap();
        assert_eq!(reply(&b, "loop"), "[ERR: Deep recursion detected]");
    }

    #[test]
    fn stray_angle_brackets_do_not_slow_evaluation() {
        let b = bot("! global depth = 3\n+ compare\n- 1 < 2 <id> <id> <id> <id> <id>");
        assert_eq!(reply(&b, "compare"), "1 < 2 u1 u1 u1 u1 u1");
        assert!(!nested_in_tag("1 < 2 <id>", 6, 10));
        assert!(nested_in_tag("<set a=<id>>", 7, 11));
    }

    #[test]
    fn args_keep_quoted_spaces() {
        assert_eq!(split_args(r#"greet "big world" now"#), vec!["greet", "big world", "now"]);
        assert_eq!(floor_div(7, 2), Some(3));
        assert_eq!(floor_div(-7, 2), Some(-4));
        assert_eq!(floor_div(i64::MIN, -1), None);
    }
}
