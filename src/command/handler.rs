//! Composable result handlers.
//!
//! A [`Handler<I, O>`] is a shared, pure function `I -> Result<O, CommandError>`.
//! Handlers come in two flavours:
//!
//! - **gates** inspect an [`ExecResult`] and either hand it back unchanged or
//!   fail with a specific [`CommandError`] (return code, missing output, empty
//!   output);
//! - **transforms** map a value to a new one (strip, split, parse, extract).
//!
//! Chains are ordinary function composition. [`Handler::then`] reads in
//! execution order (`gate.then(transform)`), [`compose`] reads mathematically
//! (`compose(outer, inner)` runs `inner` first). Gates that need the raw result
//! must come before the first transform that consumes it.
//!
//! # Example
//!
//! ```ignore
//! let handler = raise_on_non_zero_return_code()
//!     .then(output())
//!     .then(strip())
//!     .then(parse::<u16>());
//! let port = handler.apply(result)?;
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::error::CommandError;
use crate::shell::ExecResult;

type HandlerFn<I, O> = dyn Fn(I) -> Result<O, CommandError> + Send + Sync;

/// A single stage, or a composed chain of stages.
pub struct Handler<I, O> {
    f: Arc<HandlerFn<I, O>>,
}

impl<I, O> Clone for Handler<I, O> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<I, O> fmt::Debug for Handler<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

impl<I: 'static, O: 'static> Handler<I, O> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(I) -> Result<O, CommandError> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    pub fn apply(&self, input: I) -> Result<O, CommandError> {
        (self.f)(input)
    }

    /// Run `self`, then feed its output to `next`.
    pub fn then<P: 'static>(&self, next: Handler<O, P>) -> Handler<I, P> {
        compose(next, self.clone())
    }

    /// `true` when both handles point at the same function.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.f, &b.f)
    }
}

/// `compose(outer, inner)` is `outer ∘ inner`: `inner` runs first.
pub fn compose<A, B, C>(outer: Handler<B, C>, inner: Handler<A, B>) -> Handler<A, C>
where
    A: 'static,
    B: 'static,
    C: 'static,
{
    Handler::new(move |input| outer.apply(inner.apply(input)?))
}

pub fn identity<T: 'static>() -> Handler<T, T> {
    Handler::new(Ok)
}

/// Wrap `handler` so it never fails; any error is replaced by `default`.
pub fn safe<I, O>(handler: Handler<I, O>, default: O) -> Handler<I, O>
where
    I: 'static,
    O: Clone + Send + Sync + 'static,
{
    Handler::new(move |input| {
        Ok(handler.apply(input).unwrap_or_else(|e| {
            debug!("Best-effort handler swallowed error: {}", e);
            default.clone()
        }))
    })
}

pub fn raise_on_non_zero_return_code() -> Handler<ExecResult, ExecResult> {
    raise_on_return_code_not_in(&[0])
}

pub fn raise_on_return_code_not_in(accepted: &[i32]) -> Handler<ExecResult, ExecResult> {
    let accepted = accepted.to_vec();
    Handler::new(move |result: ExecResult| {
        if accepted.contains(&result.return_code) {
            Ok(result)
        } else {
            Err(CommandError::invalid_return_code(result, &accepted))
        }
    })
}

/// Fails only when nothing was captured; `Some("")` passes.
pub fn raise_when_output_is_none() -> Handler<ExecResult, ExecResult> {
    Handler::new(|result: ExecResult| {
        if result.output.is_none() {
            Err(CommandError::execute_with("output is empty", result))
        } else {
            Ok(result)
        }
    })
}

/// Fails when the output is missing or blank.
pub fn raise_when_output_is_empty() -> Handler<ExecResult, ExecResult> {
    Handler::new(|result: ExecResult| {
        let blank = result
            .output
            .as_deref()
            .is_none_or(|o| o.trim().is_empty());
        if blank {
            Err(CommandError::execute_with("command produced no output", result))
        } else {
            Ok(result)
        }
    })
}

pub fn output() -> Handler<ExecResult, String> {
    Handler::new(|result: ExecResult| match result.output {
        Some(output) => Ok(output),
        None => Err(CommandError::execute_with("output is empty", result)),
    })
}

pub fn decode_output_bytes() -> Handler<ExecResult, String> {
    Handler::new(|result: ExecResult| Ok(String::from_utf8_lossy(&result.output_bytes).into_owned()))
}

pub fn strip() -> Handler<String, String> {
    Handler::new(|s: String| Ok(s.trim().to_string()))
}

pub fn normalize_newlines() -> Handler<String, String> {
    Handler::new(|s: String| Ok(s.replace("\r\n", "\n")))
}

/// Trimmed, non-empty lines.
pub fn split_lines() -> Handler<String, Vec<String>> {
    Handler::new(|s: String| {
        Ok(s.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    })
}

pub fn parse<T>() -> Handler<String, T>
where
    T: FromStr + 'static,
    T::Err: fmt::Display,
{
    Handler::new(|s: String| {
        s.trim()
            .parse::<T>()
            .map_err(|e| CommandError::execute(format!("cannot parse {:?}: {}", s, e)))
    })
}

/// First capture group of `regex` (or the whole match when it has none).
pub fn first_capture(regex: Regex) -> Handler<String, String> {
    Handler::new(move |s: String| {
        regex
            .captures(&s)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| CommandError::not_found(format!("no match for /{}/", regex.as_str())))
    })
}

pub fn require_non_empty<T: 'static>() -> Handler<Vec<T>, Vec<T>> {
    Handler::new(|values: Vec<T>| {
        if values.is_empty() {
            Err(CommandError::not_found("no values in output"))
        } else {
            Ok(values)
        }
    })
}
