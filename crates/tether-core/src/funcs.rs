//! Named dynamic functions and the argument-count-checked caller.
//!
//! Template helpers are ordinary closures. To make them callable through an
//! RPC proxy they are registered in a [`FuncMap`] as [`TypedFunc`]s, which
//! record their declared parameter and return counts. [`call_func`] checks
//! those counts before and after invoking the closure, so that a remote
//! caller gets a specific error instead of a crash.
//!
//! Return shapes follow a fixed convention:
//!
//! | Closure returns | Declared returns | Result |
//! |---|---|---|
//! | `()` | 0 | `None` |
//! | `T` | 1 | `Some(T)` (`None` for null) |
//! | `Result<T, E>` | 2 | `T`, or `E` as [`FuncError::Call`] |
//! | `(A, B)` | 2 | rejected, the second value is not an error |
//! | `(A, B, C)` | 3 | rejected before the call |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{EnvelopeError, FuncError};
use crate::value::{FromValue, IntoValue, Value};

/// One returned slot of a function call.
#[derive(Debug, Clone, PartialEq)]
pub enum Returned {
    /// A plain value.
    Value(Value),
    /// An error slot; `None` is a nil error.
    Error(Option<String>),
}

/// Shape of a closure's return value.
pub trait FuncOutput {
    /// Number of declared return values.
    const ARITY: usize;

    /// Flatten into returned slots.
    ///
    /// # Errors
    ///
    /// Returns an error if a value has no envelope representation.
    fn into_returns(self) -> Result<Vec<Returned>, EnvelopeError>;
}

impl FuncOutput for () {
    const ARITY: usize = 0;

    fn into_returns(self) -> Result<Vec<Returned>, EnvelopeError> {
        Ok(Vec::new())
    }
}

macro_rules! single_output {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FuncOutput for $ty {
                const ARITY: usize = 1;

                fn into_returns(self) -> Result<Vec<Returned>, EnvelopeError> {
                    Ok(vec![Returned::Value(self.into_value()?)])
                }
            }
        )*
    };
}

single_output!(
    Value,
    String,
    &'static str,
    bool,
    i64,
    i32,
    u32,
    f64,
    DateTime<Utc>,
    BTreeMap<String, Value>,
    Vec<Value>,
);

impl<T: IntoValue, E: fmt::Display> FuncOutput for Result<T, E> {
    const ARITY: usize = 2;

    fn into_returns(self) -> Result<Vec<Returned>, EnvelopeError> {
        match self {
            Ok(value) => Ok(vec![
                Returned::Value(value.into_value()?),
                Returned::Error(None),
            ]),
            Err(e) => Ok(vec![
                Returned::Value(Value::Null),
                Returned::Error(Some(e.to_string())),
            ]),
        }
    }
}

impl<A: IntoValue, B: IntoValue> FuncOutput for (A, B) {
    const ARITY: usize = 2;

    fn into_returns(self) -> Result<Vec<Returned>, EnvelopeError> {
        Ok(vec![
            Returned::Value(self.0.into_value()?),
            Returned::Value(self.1.into_value()?),
        ])
    }
}

impl<A: IntoValue, B: IntoValue, C: IntoValue> FuncOutput for (A, B, C) {
    const ARITY: usize = 3;

    fn into_returns(self) -> Result<Vec<Returned>, EnvelopeError> {
        Ok(vec![
            Returned::Value(self.0.into_value()?),
            Returned::Value(self.1.into_value()?),
            Returned::Value(self.2.into_value()?),
        ])
    }
}

type Body = dyn Fn(Vec<Value>) -> Result<Vec<Returned>, FuncError> + Send + Sync;

/// A closure with known parameter and return counts.
pub struct TypedFunc {
    inputs: usize,
    outputs: usize,
    body: Box<Body>,
}

impl TypedFunc {
    /// Declared parameter count.
    #[must_use]
    pub fn inputs(&self) -> usize {
        self.inputs
    }

    /// Declared return count.
    #[must_use]
    pub fn outputs(&self) -> usize {
        self.outputs
    }
}

impl fmt::Debug for TypedFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedFunc")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Closures that can become a [`TypedFunc`].
///
/// Implemented for `Fn` closures of up to four parameters whose parameters
/// implement [`FromValue`] and whose return type implements [`FuncOutput`].
pub trait IntoFunc<Args, Out>: Send + Sync + 'static {
    /// Erase the closure's types.
    fn into_func(self) -> TypedFunc;
}

macro_rules! into_func {
    ($($ty:ident : $var:ident),*) => {
        impl<F, Out, $($ty,)*> IntoFunc<($($ty,)*), Out> for F
        where
            F: Fn($($ty),*) -> Out + Send + Sync + 'static,
            Out: FuncOutput,
            $($ty: FromValue,)*
        {
            #[allow(unused_mut, unused_variables)]
            fn into_func(self) -> TypedFunc {
                let inputs = <[&str]>::len(&[$(stringify!($ty)),*]);
                let f = self;
                TypedFunc {
                    inputs,
                    outputs: Out::ARITY,
                    body: Box::new(move |args: Vec<Value>| {
                        let actual = args.len();
                        let mut args = args.into_iter().enumerate();
                        $(
                            let $var = match args.next() {
                                Some((index, value)) => <$ty as FromValue>::from_value(value)
                                    .map_err(|source| FuncError::Argument {
                                        position: index.saturating_add(1),
                                        source,
                                    })?,
                                None => {
                                    return Err(FuncError::ArgumentCount {
                                        expected: inputs,
                                        actual,
                                    });
                                },
                            };
                        )*
                        f($($var),*).into_returns().map_err(FuncError::from)
                    }),
                }
            }
        }
    };
}

into_func!();
into_func!(A1: a1);
into_func!(A1: a1, A2: a2);
into_func!(A1: a1, A2: a2, A3: a3);
into_func!(A1: a1, A2: a2, A3: a3, A4: a4);

/// Invoke a [`TypedFunc`] with dynamic arguments.
///
/// Counts are checked before the closure runs.
///
/// # Errors
///
/// - [`FuncError::ArgumentCount`] when `args` has the wrong length
/// - [`FuncError::TooManyReturns`] when the function declares more than two
///   return values
/// - [`FuncError::SecondReturnNotError`] when the second return is a value
/// - [`FuncError::Call`] when the function itself returned an error
pub fn call_func(func: &TypedFunc, args: Vec<Value>) -> Result<Option<Value>, FuncError> {
    if args.len() != func.inputs {
        return Err(FuncError::ArgumentCount {
            expected: func.inputs,
            actual: args.len(),
        });
    }
    if func.outputs > 2 {
        return Err(FuncError::TooManyReturns(func.outputs));
    }

    let mut returns = (func.body)(args)?.into_iter();
    let first = returns.next();
    let second = returns.next();

    match (first, second) {
        (None, _) => Ok(None),
        (Some(first), None | Some(Returned::Error(None))) => single_return(first),
        (Some(_), Some(Returned::Error(Some(e)))) => Err(FuncError::Call(e)),
        (Some(_), Some(Returned::Value(_))) => Err(FuncError::SecondReturnNotError),
    }
}

fn single_return(slot: Returned) -> Result<Option<Value>, FuncError> {
    match slot {
        Returned::Value(Value::Null) | Returned::Error(None) => Ok(None),
        Returned::Value(v) => Ok(Some(v)),
        Returned::Error(Some(e)) => Err(FuncError::Call(e)),
    }
}

/// Anything that can be invoked by name from a [`FuncMap`].
///
/// Local closures and RPC stubs both implement this, so a template engine
/// never needs to know which side of the process boundary a helper lives on.
#[async_trait]
pub trait Callable: Send + Sync {
    /// Invoke with dynamic arguments.
    async fn call(&self, args: Vec<Value>) -> Result<Option<Value>, FuncError>;
}

#[async_trait]
impl Callable for TypedFunc {
    async fn call(&self, args: Vec<Value>) -> Result<Option<Value>, FuncError> {
        call_func(self, args)
    }
}

/// A table of named callables.
#[derive(Clone, Default)]
pub struct FuncMap {
    entries: BTreeMap<String, Arc<dyn Callable>>,
}

impl FuncMap {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure under `key`, replacing any previous entry.
    pub fn insert_fn<Args, Out>(&mut self, key: impl Into<String>, f: impl IntoFunc<Args, Out>) {
        self.entries.insert(key.into(), Arc::new(f.into_func()));
    }

    /// Builder form of [`insert_fn`](Self::insert_fn).
    #[must_use]
    pub fn with_fn<Args, Out>(mut self, key: impl Into<String>, f: impl IntoFunc<Args, Out>) -> Self {
        self.insert_fn(key, f);
        self
    }

    /// Register an arbitrary callable under `key`.
    pub fn insert(&mut self, key: impl Into<String>, callable: Arc<dyn Callable>) {
        self.entries.insert(key.into(), callable);
    }

    /// Look up a callable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<dyn Callable>> {
        self.entries.get(key).cloned()
    }

    /// Whether `key` is registered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Registered key names, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every entry of `other` into this table. Entries in `other` win.
    pub fn extend(&mut self, other: FuncMap) {
        self.entries.extend(other.entries);
    }

    /// Call the function registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`FuncError::UnknownKey`] if nothing is registered under
    /// `key`, otherwise whatever the callable returns.
    pub async fn call(&self, key: &str, args: Vec<Value>) -> Result<Option<Value>, FuncError> {
        let callable = self
            .get(key)
            .ok_or_else(|| FuncError::UnknownKey(key.to_string()))?;
        callable.call(args).await
    }
}

impl fmt::Debug for FuncMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    fn table() -> FuncMap {
        FuncMap::new()
            .with_fn("none_none", || {})
            .with_fn("one_none", |_: String| {})
            .with_fn("one_one", |a: String| a)
            .with_fn("onetime_one", |t: DateTime<Utc>| t.format("%Y-%m-%d").to_string())
            .with_fn("one_error", |_: bool| -> Result<(), String> {
                Err("bad things".to_string())
            })
            .with_fn("one_two", |a: String| -> Result<String, String> { Ok(a) })
            .with_fn("onebool_two", |fail: bool| -> Result<String, String> {
                if fail {
                    Err("failed".to_string())
                } else {
                    Ok("worked".to_string())
                }
            })
            .with_fn("one_twobad", |a: String| (a, "not an error"))
            .with_fn("one_threebad", |a: String| (a.clone(), a.clone(), a))
    }

    #[tokio::test]
    async fn test_zero_returns() {
        let fm = table();
        assert_eq!(fm.call("none_none", vec![]).await, Ok(None));
        assert_eq!(fm.call("one_none", vec![s("hi")]).await, Ok(None));
    }

    #[tokio::test]
    async fn test_single_return_matches_direct_call() {
        let fm = table();
        assert_eq!(fm.call("one_one", vec![s("hello")]).await, Ok(Some(s("hello"))));
    }

    #[tokio::test]
    async fn test_time_argument_from_string() {
        let fm = table();
        let out = fm
            .call("onetime_one", vec![s("2024-03-01T08:00:00Z")])
            .await
            .unwrap();
        assert_eq!(out, Some(s("2024-03-01")));
    }

    #[tokio::test]
    async fn test_error_return_is_propagated_verbatim() {
        let fm = table();
        assert_eq!(
            fm.call("one_error", vec![Value::Bool(true)]).await,
            Err(FuncError::Call("bad things".into()))
        );
        assert_eq!(
            fm.call("onebool_two", vec![Value::Bool(true)]).await,
            Err(FuncError::Call("failed".into()))
        );
        assert_eq!(
            fm.call("onebool_two", vec![Value::Bool(false)]).await,
            Ok(Some(s("worked")))
        );
    }

    #[tokio::test]
    async fn test_value_with_nil_error() {
        let fm = table();
        assert_eq!(fm.call("one_two", vec![s("x")]).await, Ok(Some(s("x"))));
    }

    #[tokio::test]
    async fn test_argument_count_mismatch() {
        let fm = table();
        let err = fm.call("one_one", vec![s("a"), s("b")]).await.unwrap_err();
        assert_eq!(err.to_string(), "input parameters expected is 1, but passed in 2");

        let err = fm.call("none_none", vec![s("a")]).await.unwrap_err();
        assert_eq!(
            err,
            FuncError::ArgumentCount {
                expected: 0,
                actual: 1
            }
        );
    }

    #[tokio::test]
    async fn test_bad_return_shapes() {
        let fm = table();
        assert_eq!(
            fm.call("one_twobad", vec![s("a")]).await,
            Err(FuncError::SecondReturnNotError)
        );
        let err = fm.call("one_threebad", vec![s("a")]).await.unwrap_err();
        assert_eq!(err.to_string(), "output parameters expected is max of 2, but passed in 3");
    }

    #[tokio::test]
    async fn test_argument_type_mismatch_names_position() {
        let fm = table();
        let err = fm.call("one_one", vec![Value::Int(3)]).await.unwrap_err();
        assert_eq!(err.to_string(), "argument 1: expected string, got int");
    }

    #[tokio::test]
    async fn test_unknown_key() {
        assert_eq!(
            table().call("missing", vec![]).await,
            Err(FuncError::UnknownKey("missing".into()))
        );
    }

    #[test]
    fn test_declared_counts() {
        let f = IntoFunc::<(i64, i64), i64>::into_func(|a: i64, b: i64| a.saturating_add(b));
        assert_eq!((f.inputs(), f.outputs()), (2, 1));
        assert_eq!(table().keys().len(), 9);
    }
}
