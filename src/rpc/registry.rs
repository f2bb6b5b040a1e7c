//! Local procedure registry and registration specs.
//!
//! The registry maps the *call name* the peer sends as the first `evaluate`
//! parameter to a local [`Handler`]. An entry without a handler is a stub:
//! the name is known locally but all behaviour lives on the peer.
//!
//! Each entry records the identity of its owner. Re-registering a name with
//! the same owner replaces the handler; a different owner is refused and
//! the existing entry stays active.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::rpc::procedure::Handler;
use crate::{AppError, Result};

/// Default documentation string sent with a registration.
pub const DEFAULT_DOCUMENTATION: &str = "No documentation provided.";

/// One installed procedure.
#[derive(Clone)]
pub struct Registration {
    /// Peer-visible procedure name.
    pub name: String,
    /// Name the peer uses when it calls back; the registry key.
    pub call_name: String,
    /// Local implementation, or `None` for a peer-side stub.
    pub handler: Option<Handler>,
    /// Identity of the registrant.
    pub owner: String,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("call_name", &self.call_name)
            .field("has_handler", &self.handler.is_some())
            .field("owner", &self.owner)
            .finish()
    }
}

/// Result of a successful [`ProcedureRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The call name was not registered before.
    Inserted,
    /// The same owner re-registered the call name; the handler was replaced.
    Replaced,
}

/// What the dispatcher found for a call name.
#[derive(Clone)]
pub enum Resolved {
    /// A local implementation to invoke.
    Handler(Handler),
    /// A peer-side stub; answered with `true` without running anything.
    Stub,
}

/// Thread-safe procedure table keyed by call name.
#[derive(Debug, Default)]
pub struct ProcedureRegistry {
    entries: Mutex<HashMap<String, Registration>>,
}

impl ProcedureRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `registration` under its call name.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Registration`] if the call name is held by a
    /// different owner; the existing entry is left untouched.
    pub async fn insert(&self, registration: Registration) -> Result<InsertOutcome> {
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(&registration.call_name) {
            if existing.owner != registration.owner {
                return Err(AppError::Registration(format!(
                    "procedure '{}' is already owned by '{}'",
                    registration.call_name, existing.owner
                )));
            }
        }

        let key = registration.call_name.clone();
        let outcome = match entries.insert(key.clone(), registration) {
            Some(_) => InsertOutcome::Replaced,
            None => InsertOutcome::Inserted,
        };
        debug!(call_name = %key, ?outcome, "registry: procedure installed");
        Ok(outcome)
    }

    /// Check whether `owner` could install `call_name` without a conflict.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Registration`] if a different owner holds it.
    pub async fn ensure_available(&self, call_name: &str, owner: &str) -> Result<()> {
        match self.entries.lock().await.get(call_name) {
            Some(existing) if existing.owner != owner => Err(AppError::Registration(format!(
                "procedure '{call_name}' is already owned by '{}'",
                existing.owner
            ))),
            _ => Ok(()),
        }
    }

    /// Look up the implementation for `call_name`.
    pub async fn resolve(&self, call_name: &str) -> Option<Resolved> {
        self.entries
            .lock()
            .await
            .get(call_name)
            .map(|entry| match &entry.handler {
                Some(handler) => Resolved::Handler(handler.clone()),
                None => Resolved::Stub,
            })
    }

    /// Remove every entry whose peer-visible name is `name`.
    ///
    /// Returns `true` if anything was removed.
    pub async fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.name != name);
        before != entries.len()
    }

    /// Owner of `call_name`, if registered.
    pub async fn owner_of(&self, call_name: &str) -> Option<String> {
        self.entries
            .lock()
            .await
            .get(call_name)
            .map(|entry| entry.owner.clone())
    }

    /// Whether `call_name` is registered.
    pub async fn contains(&self, call_name: &str) -> bool {
        self.entries.lock().await.contains_key(call_name)
    }

    /// Registered call names, sorted.
    pub async fn call_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Description of a procedure to register with the peer.
///
/// ```rust,ignore
/// let spec = ProcedureSpec::new("echo")
///     .handler(handler(|_ctx, args| async move { Ok(ProcedureOutput::Multiple(args)) }))
///     .documentation("Returns its arguments.");
/// ```
#[derive(Clone)]
pub struct ProcedureSpec {
    name: String,
    handler: Option<Handler>,
    call_name: Option<String>,
    documentation: String,
    single: bool,
    peer_name: Option<String>,
    encoded: bool,
    owner: Option<String>,
}

impl ProcedureSpec {
    /// Spec for `name` with no local handler (a peer-side stub).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
            call_name: None,
            documentation: DEFAULT_DOCUMENTATION.to_owned(),
            single: true,
            peer_name: None,
            encoded: false,
            owner: None,
        }
    }

    /// Local implementation to run when the peer calls the procedure.
    #[must_use]
    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Name the peer should use when calling back, if different from the
    /// registered name.
    #[must_use]
    pub fn call_name(mut self, call_name: impl Into<String>) -> Self {
        self.call_name = Some(call_name.into());
        self
    }

    /// Documentation string shown by the peer.
    #[must_use]
    pub fn documentation(mut self, documentation: impl Into<String>) -> Self {
        self.documentation = documentation.into();
        self
    }

    /// Whether the peer may run only one instance of the procedure at a time.
    #[must_use]
    pub fn single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    /// Alternate name the peer should expose the procedure under.
    #[must_use]
    pub fn peer_name(mut self, peer_name: impl Into<String>) -> Self {
        self.peer_name = Some(peer_name.into());
        self
    }

    /// Whether arguments should be passed in the peer's encoded form.
    #[must_use]
    pub fn encoded(mut self, encoded: bool) -> Self {
        self.encoded = encoded;
        self
    }

    /// Owner identity; defaults to the connection's owner.
    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Peer-visible name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry key: the call name when a handler is present, else the name.
    #[must_use]
    pub fn local_key(&self) -> &str {
        match (&self.handler, &self.call_name) {
            (Some(_), Some(call_name)) => call_name,
            _ => &self.name,
        }
    }

    /// Explicit owner, if one was set.
    #[must_use]
    pub fn owner_override(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Parameters of the `add` call:
    /// `[name, call-name | null, documentation, single, peer-name | null, encoded]`.
    #[must_use]
    pub fn add_params(&self) -> Vec<Value> {
        let call_name = if self.handler.is_some() {
            Value::String(self.local_key().to_owned())
        } else {
            Value::Null
        };

        vec![
            Value::String(self.name.clone()),
            call_name,
            Value::String(self.documentation.clone()),
            Value::Bool(self.single),
            self.peer_name.clone().map_or(Value::Null, Value::String),
            Value::Bool(self.encoded),
        ]
    }

    /// Registration record for the local registry.
    #[must_use]
    pub fn into_registration(self, default_owner: &str) -> Registration {
        let call_name = self.local_key().to_owned();
        Registration {
            name: self.name,
            call_name,
            handler: self.handler,
            owner: self.owner.unwrap_or_else(|| default_owner.to_owned()),
        }
    }
}

impl fmt::Debug for ProcedureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureSpec")
            .field("name", &self.name)
            .field("has_handler", &self.handler.is_some())
            .field("call_name", &self.call_name)
            .field("single", &self.single)
            .field("peer_name", &self.peer_name)
            .field("encoded", &self.encoded)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
