use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use courier_core::Message;

use crate::error::DispatchError;

/// Marker grammar: `<<NAME>>`, `<<NAME:args>>`, `<<NAME:selector:args>>`,
/// where `NAME` is upper-snake.
const MARKER_PATTERN: &str = "<<([A-Z][A-Z0-9_]*)(?::([^>]*))?>>";

fn marker_regex() -> &'static Regex {
    static MARKER: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    MARKER.get_or_init(|| Regex::new(MARKER_PATTERN).unwrap_or_else(|e| panic!("invalid marker pattern: {e}")))
}

/// Whether any substitution marker remains in the string.
#[must_use]
pub fn has_variables(s: &str) -> bool {
    marker_regex().is_match(s)
}

/// Marker names in the string, deduplicated, first occurrence first.
#[must_use]
pub fn variable_names(s: &str) -> Vec<String> {
    let mut names = Vec::new();
    for capture in marker_regex().captures_iter(s) {
        let name = capture[1].to_owned();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Resolution failure for a single marker.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no resolver registered for {0}")]
    Unknown(String),
    #[error("resolver failed: {0}")]
    Failed(String),
}

/// Resolves one variable name (plus arguments) into a rendered fragment.
/// Resolvers may perform I/O (content lookups); failures leave the marker
/// in place for validation to catch.
#[async_trait]
pub trait VariableResolver: Send + Sync {
    async fn resolve(&self, name: &str, args: &[&str]) -> Result<String, ResolveError>;
}

/// Substitution engine: a resolver registry keyed by variable name.
#[derive(Default)]
pub struct VariableEngine {
    resolvers: HashMap<String, Arc<dyn VariableResolver>>,
}

impl VariableEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver for a variable name.
    pub fn register(&mut self, name: impl Into<String>, resolver: Arc<dyn VariableResolver>) {
        self.resolvers.insert(name.into(), resolver);
    }

    /// Resolve markers in the message's subject, HTML, and text bodies.
    /// Best-effort: a marker whose resolver is missing or fails stays in
    /// place, to be caught by [`validate_resolved`].
    pub async fn substitute(&self, message: &mut Message) {
        let mut rendered: HashMap<String, String> = HashMap::new();

        let subject = std::mem::take(&mut message.subject);
        message.subject = self.substitute_str(&subject, &mut rendered).await;
        if let Some(html) = message.html.take() {
            message.html = Some(self.substitute_str(&html, &mut rendered).await);
        }
        if let Some(text) = message.text.take() {
            message.text = Some(self.substitute_str(&text, &mut rendered).await);
        }
    }

    /// Resolve the markers of one string, caching by full marker text.
    async fn substitute_str(&self, input: &str, cache: &mut HashMap<String, String>) -> String {
        let markers: Vec<(String, String, Option<String>)> = marker_regex()
            .captures_iter(input)
            .map(|c| {
                (
                    c[0].to_owned(),
                    c[1].to_owned(),
                    c.get(2).map(|m| m.as_str().to_owned()),
                )
            })
            .collect();

        let mut output = input.to_owned();
        for (full, name, raw_args) in markers {
            if let Some(done) = cache.get(&full) {
                output = output.replace(&full, done);
                continue;
            }
            let args: Vec<&str> = raw_args
                .as_deref()
                .map(|a| a.split(':').flat_map(|seg| seg.split(',')).collect())
                .unwrap_or_default();

            let Some(resolver) = self.resolvers.get(&name) else {
                debug!(variable = %name, "no resolver registered, leaving marker");
                continue;
            };
            match resolver.resolve(&name, &args).await {
                Ok(fragment) => {
                    output = output.replace(&full, &fragment);
                    cache.insert(full, fragment);
                }
                Err(e) => {
                    warn!(variable = %name, error = %e, "variable resolution failed, leaving marker");
                }
            }
        }
        output
    }
}

/// Mandatory post-substitution check: any surviving marker in subject,
/// HTML, or text fails the message with a validation error naming the
/// unresolved variables.
pub fn validate_resolved(message: &Message) -> Result<(), DispatchError> {
    let mut unresolved = Vec::new();
    for field in [
        Some(message.subject.as_str()),
        message.html.as_deref(),
        message.text.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        for name in variable_names(field) {
            if !unresolved.contains(&name) {
                unresolved.push(name);
            }
        }
    }

    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(DispatchError::Validation(format!(
            "unresolved variables: {}",
            unresolved.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticResolver(String);

    #[async_trait]
    impl VariableResolver for StaticResolver {
        async fn resolve(&self, _name: &str, _args: &[&str]) -> Result<String, ResolveError> {
            Ok(self.0.clone())
        }
    }

    struct EchoArgsResolver;

    #[async_trait]
    impl VariableResolver for EchoArgsResolver {
        async fn resolve(&self, _name: &str, args: &[&str]) -> Result<String, ResolveError> {
            Ok(args.join("|"))
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl VariableResolver for FailingResolver {
        async fn resolve(&self, name: &str, _args: &[&str]) -> Result<String, ResolveError> {
            Err(ResolveError::Failed(format!("{name} unavailable")))
        }
    }

    fn message_with_subject(subject: &str) -> Message {
        Message::new("a@x.com", vec!["b@y.com".into()]).with_subject(subject)
    }

    #[test]
    fn detects_markers() {
        assert!(has_variables("Check: <<TRENDING_QUESTION>>"));
        assert!(has_variables("<<NAME:arg1,arg2>>"));
        assert!(has_variables("<<NAME:selector:a,b>>"));
        assert!(!has_variables("plain text"));
        assert!(!has_variables("<<lowercase>> is not a marker"));
        assert!(!has_variables("<<1BAD>>"));
    }

    #[test]
    fn names_dedup_preserving_first_occurrence() {
        let names = variable_names("<<B>> then <<A:x>> then <<B>> again");
        assert_eq!(names, vec!["B".to_owned(), "A".to_owned()]);
    }

    #[tokio::test]
    async fn substitutes_registered_variables() {
        let mut engine = VariableEngine::new();
        engine.register("GREETING", Arc::new(StaticResolver("hello".into())));

        let mut msg = message_with_subject("Say: <<GREETING>>")
            .with_text("<<GREETING>> world")
            .with_html("<p><<GREETING>></p>");
        engine.substitute(&mut msg).await;

        assert_eq!(msg.subject, "Say: hello");
        assert_eq!(msg.text.as_deref(), Some("hello world"));
        assert_eq!(msg.html.as_deref(), Some("<p>hello</p>"));
        assert!(validate_resolved(&msg).is_ok());
    }

    #[tokio::test]
    async fn passes_selector_and_args() {
        let mut engine = VariableEngine::new();
        engine.register("PICK", Arc::new(EchoArgsResolver));

        let mut msg = message_with_subject("<<PICK:top:a,b,c>>");
        engine.substitute(&mut msg).await;
        assert_eq!(msg.subject, "top|a|b|c");
    }

    #[tokio::test]
    async fn unregistered_marker_survives_and_fails_validation() {
        let engine = VariableEngine::new();
        let mut msg = message_with_subject("Check: <<TRENDING_QUESTION>>");
        engine.substitute(&mut msg).await;

        let err = validate_resolved(&msg).unwrap_err();
        assert!(err.to_string().contains("TRENDING_QUESTION"));
    }

    #[tokio::test]
    async fn resolver_error_leaves_marker() {
        let mut engine = VariableEngine::new();
        engine.register("FLAKY", Arc::new(FailingResolver));

        let mut msg = message_with_subject("<<FLAKY>>");
        engine.substitute(&mut msg).await;
        assert_eq!(msg.subject, "<<FLAKY>>");
        assert!(validate_resolved(&msg).is_err());
    }

    #[tokio::test]
    async fn repeated_marker_resolved_once_everywhere() {
        let mut engine = VariableEngine::new();
        engine.register("X", Arc::new(StaticResolver("42".into())));

        let mut msg = message_with_subject("<<X>> and <<X>>").with_text("<<X>>");
        engine.substitute(&mut msg).await;
        assert_eq!(msg.subject, "42 and 42");
        assert_eq!(msg.text.as_deref(), Some("42"));
    }

    #[test]
    fn validation_reports_all_fields() {
        let msg = message_with_subject("<<A>>")
            .with_text("<<B>>")
            .with_html("<<C>>");
        let err = validate_resolved(&msg).unwrap_err();
        let text = err.to_string();
        assert!(text.contains('A') && text.contains('B') && text.contains('C'));
    }
}
