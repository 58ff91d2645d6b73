//! Per-command syntax checks.
//!
//! Runs on the fully joined text of a command (after `^` continuations) and
//! returns a human readable message on failure. The parser decides whether
//! that is fatal.

pub(super) fn check(cmd: char, text: &str, utf8: bool) -> Result<(), String> {
    match cmd {
        '!' => {
            if !regex!(r"^.+(?:\s+.+|)\s*=\s*.+?$").is_match(text) {
                return Err("Invalid format for !Definition line: must be '! type name = value' OR '! type = value'".into());
            }
        }
        '>' => {
            let mut parts = text.splitn(2, ' ');
            let kind = parts.next().unwrap_or_default();
            let rest = parts.next();
            match kind {
                "begin" if rest.is_some() => {
                    return Err("The 'begin' label takes no additional arguments, should be verbatim '> begin'".into());
                }
                "topic" if regex!(r"[^a-z0-9_\-\s]").is_match(text) => {
                    return Err("Topics should be lowercased and contain only numbers and letters".into());
                }
                "object" if regex!(r"[^A-Za-z0-9_\-\s]").is_match(text) => {
                    return Err("Objects can only contain numbers and letters".into());
                }
                _ => {}
            }
        }
        '+' | '%' | '@' => check_pattern(text, utf8)?,
        '*' => {
            if !regex!(r"^.+?\s*(?:==|eq|!=|ne|<>|<|<=|>|>=)\s*.+?=>.+?$").is_match(text) {
                return Err("Invalid format for !Condition: should be like '* value symbol value => response'".into());
            }
            check_reply_tags(text)?;
        }
        '-' => check_reply_tags(text)?,
        _ => {}
    }
    Ok(())
}

/// Brackets must nest properly, alternatives can't be empty and only the
/// pattern alphabet is allowed.
fn check_pattern(text: &str, utf8: bool) -> Result<(), String> {
    let mut open: Vec<char> = Vec::new();
    for ch in text.chars() {
        match ch {
            '(' | '[' | '{' | '<' => open.push(ch),
            ')' | ']' | '}' | '>' => {
                let want = match ch {
                    ')' => '(',
                    ']' => '[',
                    '}' => '{',
                    _ => '<',
                };
                match open.pop() {
                    Some(got) if got == want => {}
                    Some(got) => return Err(format!("Mismatched brackets: '{got}' closed by '{ch}'")),
                    None => return Err(format!("Unmatched closing '{ch}'")),
                }
            }
            _ => {}
        }
    }
    if let Some(got) = open.pop() {
        return Err(format!("Unmatched opening '{got}'"));
    }

    if regex!(r"\|\s*\||\[\s*\||\|\s*\]|\(\s*\||\|\s*\)|\[\s*\]|\(\s*\)").is_match(text) {
        return Err("Piped arrays can't include blank entries".into());
    }

    if utf8 {
        if regex!(r"[A-Z\\.]").is_match(text) {
            return Err("Triggers can't contain uppercase letters, backslashes or dots in UTF-8 mode".into());
        }
    } else if regex!(r"[^a-z0-9(|)\[\]*_#@{}<>=\s]").is_match(text) {
        return Err(
            "Triggers may only contain lowercase letters, numbers, and these symbols: ( | ) [ ] * _ # @ { } < > =".into(),
        );
    }
    Ok(())
}

/// Paired reply tags must open and close in order.
fn check_reply_tags(text: &str) -> Result<(), String> {
    let mut open: Vec<String> = Vec::new();
    let paired = regex!(r"\{(/?)(random|person|formal|sentence|uppercase|lowercase)\}|<(/?)call>");
    for caps in paired.captures_iter(text) {
        let (closing, name) = match (caps.get(1), caps.get(2)) {
            (Some(slash), Some(name)) => (!slash.as_str().is_empty(), name.as_str()),
            _ => (caps.get(3).is_some_and(|m| !m.as_str().is_empty()), "call"),
        };
        if closing {
            match open.pop() {
                Some(got) if got == name => {}
                Some(got) => return Err(format!("Tag {{{got}}} closed by a {name} tag")),
                None => return Err(format!("Closing {name} tag without an opening tag")),
            }
        } else {
            open.push(name.to_string());
        }
    }
    match open.pop() {
        Some(name) => Err(format!("Unclosed {name} tag")),
        None => Ok(()),
    }
}
