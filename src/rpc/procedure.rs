//! Locally implemented procedures that the peer can invoke.
//!
//! A procedure receives an explicit [`CallContext`] naming the invoking
//! model scope instead of reading ambient per-thread state, plus the
//! positional arguments the peer supplied after the procedure name and
//! context slot.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::client::Client;
use crate::rpc::connection::Connection;
use crate::Result;

/// Boxed future returned by [`Procedure::invoke`].
pub type ProcedureFuture = Pin<Box<dyn Future<Output = Result<ProcedureOutput>> + Send>>;

/// Shared handle to a registered procedure.
pub type Handler = Arc<dyn Procedure>;

/// A procedure the peer may call through `evaluate`.
///
/// Implemented for every `Fn(CallContext, Vec<Value>) -> impl Future<Output = Result<T>>`
/// where `T: Into<ProcedureOutput>`, so async closures can be registered
/// directly.
pub trait Procedure: Send + Sync + 'static {
    /// Run the procedure for one inbound call.
    fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> ProcedureFuture;
}

impl<F, Fut, T> Procedure for F
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Into<ProcedureOutput>,
{
    fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> ProcedureFuture {
        let fut = (self)(ctx, args);
        Box::pin(async move { fut.await.map(Into::into) })
    }
}

/// Wrap an async function or closure into a shareable [`Handler`].
///
/// ```rust,ignore
/// let echo = handler(|_ctx, args| async move { Ok(ProcedureOutput::Multiple(args)) });
/// ```
pub fn handler<F, Fut, T>(f: F) -> Handler
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Into<ProcedureOutput>,
{
    Arc::new(f)
}

/// Value produced by a procedure.
///
/// A [`ProcedureOutput::Single`] value becomes a one-element result, except
/// that `null` and `false` are both sent as `[null]`. A
/// [`ProcedureOutput::Multiple`] sequence is sent as that many result values.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureOutput {
    /// One result value.
    Single(Value),
    /// Several result values, passed through positionally.
    Multiple(Vec<Value>),
}

impl ProcedureOutput {
    /// Result values to place in the reply envelope.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Self::Single(Value::Null | Value::Bool(false)) => vec![Value::Null],
            Self::Single(value) => vec![value],
            Self::Multiple(values) => values,
        }
    }
}

impl From<Value> for ProcedureOutput {
    fn from(value: Value) -> Self {
        Self::Single(value)
    }
}

impl From<()> for ProcedureOutput {
    fn from((): ()) -> Self {
        Self::Single(Value::Null)
    }
}

impl From<bool> for ProcedureOutput {
    fn from(value: bool) -> Self {
        Self::Single(Value::Bool(value))
    }
}

impl From<String> for ProcedureOutput {
    fn from(value: String) -> Self {
        Self::Single(Value::String(value))
    }
}

impl From<&str> for ProcedureOutput {
    fn from(value: &str) -> Self {
        Self::Single(Value::String(value.to_owned()))
    }
}

impl From<i64> for ProcedureOutput {
    fn from(value: i64) -> Self {
        Self::Single(Value::from(value))
    }
}

impl From<f64> for ProcedureOutput {
    fn from(value: f64) -> Self {
        Self::Single(Value::from(value))
    }
}

/// Execution scope of one inbound invocation.
#[derive(Clone)]
pub struct CallContext {
    connection: Connection,
    procedure: String,
    model: Option<String>,
    call_id: Value,
}

impl CallContext {
    pub(crate) fn new(
        connection: Connection,
        procedure: impl Into<String>,
        model: Option<String>,
        call_id: Value,
    ) -> Self {
        Self {
            connection,
            procedure: procedure.into(),
            model,
            call_id,
        }
    }

    /// Name the peer used to invoke the procedure.
    #[must_use]
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Model the call is scoped to, if any.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Peer-side id of the inbound call.
    #[must_use]
    pub fn call_id(&self) -> &Value {
        &self.call_id
    }

    /// Connection the call arrived on.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Client for issuing calls back to the peer in this call's model scope.
    ///
    /// Its trace output state is fresh: output shown, no monitor installed.
    /// Use [`Client::for_call`] on an existing client to share that client's
    /// trace state instead.
    #[must_use]
    pub fn client(&self) -> Client {
        Client::from_connection(self.connection.clone()).with_model(self.model.clone())
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("procedure", &self.procedure)
            .field("model", &self.model)
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}
