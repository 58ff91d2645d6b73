/// Compile a literal regex once and hand out a `&'static Regex`.
///
/// Used for the fixed patterns of the parser, normalizer and tag evaluator.
/// Patterns built from bot source are compiled per brain instead.
macro_rules! regex {
    ($pat:literal) => {{
        static RE: once_cell::sync::Lazy<regex::Regex> =
            once_cell::sync::Lazy::new(|| regex::Regex::new($pat).unwrap());
        &*RE
    }};
}
