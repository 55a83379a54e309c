//! Declarative argument schemas.
//!
//! A schema lists the positional arguments of a method and, per argument, an
//! ordered list of formatters. The registry wraps a handler with its schema so
//! the formatters run before the handler body; the first failure aborts the
//! call with [`ProtocolError::InvalidArgument`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::core::value::{Value, ValueKind};
use crate::error::{ProtocolError, Result};

pub type FormatFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync>;
pub type ValidateFn = Arc<dyn Fn(Value) -> BoxFuture<'static, bool> + Send + Sync>;

/// One step of an argument's formatting pipeline
#[derive(Clone)]
pub enum Formatter {
    /// Reject a present argument of another kind
    Type(ValueKind),
    /// Transform a present argument
    Format(FormatFn),
    /// Reject an absent argument
    Required,
    /// Substitute an absent argument
    Default(Value),
    /// Reject when the predicate fails
    Validate(ValidateFn),
}

impl fmt::Debug for Formatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Formatter::Type(kind) => write!(f, "Type({kind})"),
            Formatter::Format(_) => f.write_str("Format(..)"),
            Formatter::Required => f.write_str("Required"),
            Formatter::Default(v) => write!(f, "Default({v:?})"),
            Formatter::Validate(_) => f.write_str("Validate(..)"),
        }
    }
}

/// Schema entry for one positional argument
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub formatters: Vec<Formatter>,
}

impl ArgSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formatters: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.formatters.push(Formatter::Type(kind));
        self
    }

    pub fn required(mut self) -> Self {
        self.formatters.push(Formatter::Required);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.formatters.push(Formatter::Default(value.into()));
        self
    }

    pub fn format<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        self.formatters
            .push(Formatter::Format(Arc::new(
                move |v| -> BoxFuture<'static, std::result::Result<Value, String>> {
                    Box::pin(f(v))
                },
            )));
        self
    }

    pub fn validate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.formatters
            .push(Formatter::Validate(Arc::new(move |v| -> BoxFuture<'static, bool> {
                Box::pin(f(v))
            })));
        self
    }

    /// Run the formatters over one slot; `None` means the argument is absent
    async fn apply(&self, event: &str, mut slot: Option<Value>) -> Result<Option<Value>> {
        let fail = |reason: String| ProtocolError::InvalidArgument {
            event: event.to_string(),
            argument: self.name.clone(),
            reason,
        };

        for formatter in &self.formatters {
            match formatter {
                Formatter::Type(kind) => {
                    if let Some(v) = &slot {
                        if !v.is_kind(*kind) {
                            return Err(fail(format!("expected {kind}, got {}", v.kind())));
                        }
                    }
                }
                Formatter::Format(f) => {
                    if let Some(v) = slot.take() {
                        slot = Some(f(v).await.map_err(fail)?);
                    }
                }
                Formatter::Required => {
                    if slot.is_none() {
                        return Err(fail("argument is required".into()));
                    }
                }
                Formatter::Default(value) => {
                    if slot.is_none() {
                        slot = Some(value.clone());
                    }
                }
                Formatter::Validate(p) => {
                    let candidate = slot.clone().unwrap_or_default();
                    if !p(candidate).await {
                        return Err(fail("validation failed".into()));
                    }
                }
            }
        }
        Ok(slot)
    }
}

/// Ordered argument specs of one method
#[derive(Debug, Clone, Default)]
pub struct ArgSchema {
    pub args: Vec<ArgSpec>,
}

impl ArgSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, spec: ArgSpec) -> Self {
        self.args.push(spec);
        self
    }

    /// Format `args` in place, position by position.
    ///
    /// A position is absent when it is past the end of `args` or holds `Null`.
    /// Arguments beyond the schema pass through untouched.
    pub async fn apply(&self, event: &str, mut args: Vec<Value>) -> Result<Vec<Value>> {
        for (index, spec) in self.args.iter().enumerate() {
            let slot = args.get(index).filter(|v| !v.is_null()).cloned();
            if let Some(value) = spec.apply(event, slot).await? {
                if args.len() <= index {
                    args.resize(index + 1, Value::Null);
                }
                args[index] = value;
            }
        }
        Ok(args)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn schema() -> ArgSchema {
        ArgSchema::new()
            .arg(ArgSpec::new("a").kind(ValueKind::Number).required())
            .arg(ArgSpec::new("b").kind(ValueKind::Number).default_value(10))
    }

    #[tokio::test]
    async fn test_defaults_fill_absent_positions() {
        let out = schema().apply("math::add", vec![Value::Int(1)]).await.unwrap();
        assert_eq!(out, vec![Value::Int(1), Value::Int(10)]);

        let out = schema()
            .apply("math::add", vec![Value::Int(1), Value::Null])
            .await
            .unwrap();
        assert_eq!(out[1], Value::Int(10));
    }

    #[tokio::test]
    async fn test_first_failure_names_event_and_argument() {
        let err = schema().apply("math::add", vec![]).await.unwrap_err();
        match err {
            ProtocolError::InvalidArgument { event, argument, .. } => {
                assert_eq!(event, "math::add");
                assert_eq!(argument, "a");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = schema()
            .apply("math::add", vec![Value::Int(1), Value::from("x")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[tokio::test]
    async fn test_format_then_validate_in_declared_order() {
        let schema = ArgSchema::new().arg(
            ArgSpec::new("name")
                .kind(ValueKind::Str)
                .format(|v| async move {
                    v.as_str()
                        .map(|s| Value::from(s.trim().to_uppercase()))
                        .ok_or_else(|| "not a string".to_string())
                })
                .validate(|v| async move { v.as_str().is_some_and(|s| s.len() <= 5) }),
        );

        let out = schema.apply("greet", vec![Value::from("  bob ")]).await.unwrap();
        assert_eq!(out, vec![Value::from("BOB")]);

        let err = schema
            .apply("greet", vec![Value::from("alexandra")])
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_extra_arguments_pass_through() {
        let out = schema()
            .apply("x", vec![Value::Int(1), Value::Int(2), Value::from("extra")])
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
    }
}
