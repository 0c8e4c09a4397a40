//! Input parsers.
//!
//! A [`Parser`] turns the optional raw input of a request into the typed
//! value a resolver receives, or rejects it with a [`ValidationError`].

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ValidationError;

/// Validates and converts raw procedure input.
pub trait Parser: Send + Sync + 'static {
    /// The value handed to the resolver.
    type Output: Send + 'static;

    /// Parses the input. `None` means the request carried no input.
    fn parse(&self, input: Option<Value>) -> Result<Self::Output, ValidationError>;
}

// ---------------------------------------------------------------------------
// Json
// ---------------------------------------------------------------------------

/// Deserializes the input into `T` with serde.
///
/// Missing input is treated as `null`, so `Json<Option<T>>` and `Json<()>`
/// accept calls without input.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Json<{}>", std::any::type_name::<T>())
    }
}

impl<T> Parser for Json<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn parse(&self, input: Option<Value>) -> Result<T, ValidationError> {
        serde_json::from_value(input.unwrap_or(Value::Null)).map_err(|e| {
            tracing::debug!(error = %e, "input failed to deserialize");
            ValidationError::new(e.to_string())
        })
    }
}

// ---------------------------------------------------------------------------
// NoInput
// ---------------------------------------------------------------------------

/// Accepts anything and hands the resolver `()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInput;

impl Parser for NoInput {
    type Output = ();

    fn parse(&self, _input: Option<Value>) -> Result<(), ValidationError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FnParser
// ---------------------------------------------------------------------------

/// A parser backed by a closure. Built with [`parser_fn`].
#[derive(Clone)]
pub struct FnParser<F>(F);

/// Wraps a closure as a [`Parser`].
///
/// ```rust
/// use relaywire_procedure::{Parser, ValidationError, parser_fn};
///
/// let positive = parser_fn(|input: Option<serde_json::Value>| {
///     input
///         .and_then(|v| v.as_u64())
///         .filter(|n| *n > 0)
///         .ok_or_else(|| ValidationError::new("expected a positive integer"))
/// });
///
/// assert_eq!(positive.parse(Some(3.into())), Ok(3));
/// assert!(positive.parse(None).is_err());
/// ```
pub fn parser_fn<F, T>(f: F) -> FnParser<F>
where
    F: Fn(Option<Value>) -> Result<T, ValidationError> + Send + Sync + 'static,
    T: Send + 'static,
{
    FnParser(f)
}

impl<F, T> Parser for FnParser<F>
where
    F: Fn(Option<Value>) -> Result<T, ValidationError> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn parse(&self, input: Option<Value>) -> Result<T, ValidationError> {
        (self.0)(input)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[test]
    fn test_json_parses_matching_input() {
        let parser = Json::<Add>::new();
        let parsed = parser.parse(Some(json!({ "a": 2, "b": 3 }))).unwrap();
        assert_eq!(parsed, Add { a: 2, b: 3 });
    }

    #[test]
    fn test_json_rejects_wrong_shape() {
        let parser = Json::<Add>::new();
        let err = parser.parse(Some(json!({ "a": "two" }))).unwrap_err();
        assert!(err.to_string().starts_with("invalid input: "));
    }

    #[test]
    fn test_json_treats_missing_input_as_null() {
        let parser = Json::<Option<u32>>::new();
        assert_eq!(parser.parse(None).unwrap(), None);

        let parser = Json::<u32>::new();
        assert!(parser.parse(None).is_err());
    }

    #[test]
    fn test_no_input_ignores_everything() {
        assert!(NoInput.parse(None).is_ok());
        assert!(NoInput.parse(Some(json!([1, 2]))).is_ok());
    }
}
