//! A RiveScript interpreter.
//!
//! Source text is parsed into a [`Document`], compiled into an immutable
//! [`Brain`] (every topic's triggers sorted into one deterministic match
//! order) and served by a [`RiveScript`] bot, which adds user sessions,
//! object macro handlers and runtime bot variables.
//!
//! ```
//! use rivescript::{Options, RiveScript};
//!
//! let bot = RiveScript::new(Options { seed: Some(1), ..Options::default() });
//! bot.stream(
//!     "
//!     + my name is *
//!     - <set name=<formal>>Nice to meet you, <get name>.
//!
//!     + what is my name
//!     * <get name> != undefined => Your name is <get name>.
//!     - You didn't tell me your name.
//!     ",
//! )
//! .unwrap();
//!
//! assert_eq!(bot.reply("u1", "What is my name?").unwrap(), "You didn't tell me your name.");
//! assert_eq!(bot.reply("u1", "My name is Aiden").unwrap(), "Nice to meet you, Aiden.");
//! assert_eq!(bot.reply("u1", "What is my name?").unwrap(), "Your name is Aiden.");
//! ```

#[macro_use]
mod macros;
mod api;
mod deparse;
mod document;
mod engine;
mod error;
mod object;
mod parser;
mod session;

pub use api::{ErrorStrings, LoadPolicy, Options, ReplyDetails, RiveScript, TriggerSource, load, load_directory};
pub use deparse::{Deparsed, DeparsedBegin, DeparsedObject, DeparsedTopic, DeparsedTrigger};
pub use document::{BEGIN_TOPIC, DEFAULT_TOPIC, Document, ObjectMacro, SourceLocation, Topic, Trigger};
pub use engine::{Brain, ReplyMetrics, StepMetrics};
pub use error::{
    CompileError, Diagnostic, LoadError, MacroError, MacroResult, SessionError, SessionResult, SyntaxError,
};
pub use object::{CommandHandler, MacroCall, MacroHandler, RUST_LANGUAGE, Subroutine, SubroutineHandler};
pub use parser::{Parser, SourceUnit};
pub use session::{
    HISTORY_SIZE, History, MemorySessionStore, NullSessionStore, SessionStore, ThawAction, UNDEFINED, UserSession,
};
