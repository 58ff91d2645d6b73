//! Object macros (`> object NAME LANG` blocks and `<call>`).
//!
//! The core never executes macro source itself. Each language is served by a
//! [`MacroHandler`]:
//!
//! - [`SubroutineHandler`] (language `rust`, always registered): Rust closures
//!   registered at runtime; the source in the bot file is only a declaration.
//! - [`CommandHandler`]: runs an external interpreter once per call and talks
//!   JSON over stdin/stdout.
//!
//! ```text
//! stdin:  {"id": "user", "name": "macro", "args": [..], "message": "..", "code": "<source>"}
//! stdout: {"status": "ok", "reply": ".."} | {"status": "error", "message": ".."}
//! ```
//!
//! ## Invariants
//!
//! - No registry lock is held while a handler runs: the handler `Arc` is
//!   cloned out first.

use crate::document::ObjectMacro;
use crate::error::{MacroError, MacroResult};
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Language served by [`SubroutineHandler`].
pub const RUST_LANGUAGE: &str = "rust";

/// One `<call>` invocation.
#[derive(Debug, Clone, Copy)]
pub struct MacroCall<'a> {
    pub name: &'a str,
    pub user: &'a str,
    pub args: &'a [String],
    /// The user's (raw) message that led to this call.
    pub message: &'a str,
}

pub trait MacroHandler: Send + Sync {
    /// Receive the source of one macro. Called when a brain is published and
    /// when the handler is registered after the fact.
    fn load(&self, name: &str, source: &[String]) -> MacroResult<()>;

    fn invoke(&self, call: &MacroCall<'_>) -> MacroResult<String>;
}

pub type Subroutine = Arc<dyn Fn(&MacroCall<'_>) -> MacroResult<String> + Send + Sync>;

/// In-process macros written in Rust.
#[derive(Default)]
pub struct SubroutineHandler {
    subs: RwLock<HashMap<String, Subroutine>>,
}

impl SubroutineHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, sub: Subroutine) {
        self.subs.write().insert(name.to_string(), sub);
    }

    pub fn remove(&self, name: &str) {
        self.subs.write().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.subs.read().contains_key(name)
    }
}

impl MacroHandler for SubroutineHandler {
    fn load(&self, name: &str, _source: &[String]) -> MacroResult<()> {
        if !self.contains(name) {
            debug!("object {name} declared as {RUST_LANGUAGE}; waiting for a registered subroutine");
        }
        Ok(())
    }

    fn invoke(&self, call: &MacroCall<'_>) -> MacroResult<String> {
        let sub = self.subs.read().get(call.name).cloned();
        match sub {
            Some(sub) => sub(call),
            None => Err(MacroError::NotFound(call.name.to_string())),
        }
    }
}

/// Runs `program args..` for every call.
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    sources: RwLock<HashMap<String, String>>,
}

#[derive(Serialize)]
struct CommandRequest<'a> {
    id: &'a str,
    name: &'a str,
    args: &'a [String],
    message: &'a str,
    code: &'a str,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum CommandResponse {
    Ok {
        #[serde(default)]
        reply: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

impl CommandHandler {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), sources: RwLock::new(HashMap::new()) }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl MacroHandler for CommandHandler {
    fn load(&self, name: &str, source: &[String]) -> MacroResult<()> {
        self.sources.write().insert(name.to_string(), source.join("\n"));
        Ok(())
    }

    fn invoke(&self, call: &MacroCall<'_>) -> MacroResult<String> {
        let code = self.sources.read().get(call.name).cloned();
        let Some(code) = code else { return Err(MacroError::NotFound(call.name.to_string())) };

        let request = CommandRequest { id: call.user, name: call.name, args: call.args, message: call.message, code: &code };
        let payload = serde_json::to_vec(&request).map_err(|e| MacroError::Protocol(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MacroError::Failed { name: call.name.to_string(), message: stderr.trim().to_string() });
        }

        match serde_json::from_slice(&output.stdout).map_err(|e| MacroError::Protocol(e.to_string()))? {
            CommandResponse::Ok { reply } => Ok(reply),
            CommandResponse::Error { message } => Err(MacroError::Failed { name: call.name.to_string(), message }),
        }
    }
}

/// Handlers by language plus the language of every declared macro.
pub(crate) struct MacroRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MacroHandler>>>,
    objects: RwLock<HashMap<String, ObjectMacro>>,
    subroutines: Arc<SubroutineHandler>,
}

impl MacroRegistry {
    pub fn new() -> Self {
        let subroutines = Arc::new(SubroutineHandler::new());
        let mut handlers: HashMap<String, Arc<dyn MacroHandler>> = HashMap::new();
        handlers.insert(RUST_LANGUAGE.to_string(), subroutines.clone());
        Self { handlers: RwLock::new(handlers), objects: RwLock::new(HashMap::new()), subroutines }
    }

    pub fn subroutines(&self) -> &SubroutineHandler {
        &self.subroutines
    }

    pub fn set_handler(&self, language: &str, handler: Arc<dyn MacroHandler>) {
        let language = language.to_lowercase();
        let pending: Vec<ObjectMacro> =
            self.objects.read().values().filter(|o| o.language == language).cloned().collect();
        for object in &pending {
            if let Err(e) = handler.load(&object.name, &object.source) {
                warn!("{language} handler failed to load object {}: {e}", object.name);
            }
        }
        self.handlers.write().insert(language, handler);
    }

    pub fn remove_handler(&self, language: &str) {
        self.handlers.write().remove(&language.to_lowercase());
    }

    /// Hand every macro of a freshly compiled brain to its handler.
    pub fn publish(&self, objects: &[ObjectMacro]) {
        let mut table = HashMap::new();
        for object in objects {
            let handler = self.handlers.read().get(&object.language).cloned();
            match handler {
                Some(handler) => {
                    if let Err(e) = handler.load(&object.name, &object.source) {
                        warn!("{} handler failed to load object {}: {e}", object.language, object.name);
                    }
                }
                None => warn!("no handler for object {} in language {}", object.name, object.language),
            }
            table.insert(object.name.clone(), object.clone());
        }
        *self.objects.write() = table;
    }

    pub fn call(&self, call: &MacroCall<'_>) -> MacroResult<String> {
        let language = match self.objects.read().get(call.name) {
            Some(object) => object.language.clone(),
            None if self.subroutines.contains(call.name) => RUST_LANGUAGE.to_string(),
            None => return Err(MacroError::NotFound(call.name.to_string())),
        };
        let handler = self.handlers.read().get(&language).cloned();
        let Some(handler) = handler else { return Err(MacroError::NoHandler(language)) };
        debug!("calling object {} ({language}) with {:?}", call.name, call.args);
        handler.invoke(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str, language: &str, source: &[&str]) -> ObjectMacro {
        ObjectMacro {
            name: name.to_string(),
            language: language.to_string(),
            source: source.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn call<'a>(name: &'a str, args: &'a [String]) -> MacroCall<'a> {
        MacroCall { name, user: "u1", args, message: "" }
    }

    #[test]
    fn subroutines_are_dispatched_by_name() {
        let registry = MacroRegistry::new();
        registry.subroutines().register(
            "reverse",
            Arc::new(|call: &MacroCall<'_>| -> MacroResult<String> { Ok(call.args.join(" ").chars().rev().collect()) }),
        );
        let args = vec!["abc".to_string()];
        assert_eq!(registry.call(&call("reverse", &args)).unwrap(), "cba");
        assert!(matches!(registry.call(&call("missing", &args)), Err(MacroError::NotFound(_))));
    }

    #[test]
    fn declared_macros_need_a_handler() {
        let registry = MacroRegistry::new();
        registry.publish(&[object("hello", "perl", &["return 'hi';"]), object("rusty", "rust", &[])]);
        assert!(matches!(registry.call(&call("hello", &[])), Err(MacroError::NoHandler(lang)) if lang == "perl"));
        // Declared for rust but never registered.
        assert!(matches!(registry.call(&call("rusty", &[])), Err(MacroError::NotFound(_))));
    }

    struct Echo;
    impl MacroHandler for Echo {
        fn load(&self, _name: &str, _source: &[String]) -> MacroResult<()> {
            Ok(())
        }
        fn invoke(&self, call: &MacroCall<'_>) -> MacroResult<String> {
            Ok(format!("{}:{}", call.user, call.args.len()))
        }
    }

    #[test]
    fn late_handlers_serve_already_published_macros() {
        let registry = MacroRegistry::new();
        registry.publish(&[object("hello", "echo", &[])]);
        registry.set_handler("ECHO", Arc::new(Echo));
        let args = vec!["a".to_string(), "b".to_string()];
        assert_eq!(registry.call(&call("hello", &args)).unwrap(), "u1:2");
        registry.remove_handler("echo");
        assert!(matches!(registry.call(&call("hello", &args)), Err(MacroError::NoHandler(_))));
    }

    #[cfg(unix)]
    #[test]
    fn command_handler_speaks_json() {
        let handler = CommandHandler::new("sh").arg("-c").arg(r#"cat >/dev/null; echo '{"status":"ok","reply":"from sh"}'"#);
        handler.load("greet", &["ignored".to_string()]).unwrap();
        assert_eq!(handler.invoke(&call("greet", &[])).unwrap(), "from sh");
        assert!(matches!(handler.invoke(&call("other", &[])), Err(MacroError::NotFound(_))));

        let failing = CommandHandler::new("sh").arg("-c").arg(r#"cat >/dev/null; echo '{"status":"error","message":"boom"}'"#);
        failing.load("greet", &[]).unwrap();
        assert!(matches!(failing.invoke(&call("greet", &[])), Err(MacroError::Failed { message, .. }) if message == "boom"));
    }
}
