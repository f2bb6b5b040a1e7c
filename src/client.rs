//! Command-level client built on a [`Connection`].
//!
//! [`Client`] adds the conveniences callers use day to day:
//!
//! - `evaluate` / `evaluate_single` of peer commands, scoped to an explicit
//!   model name instead of ambient per-thread state,
//! - procedure registration and monitor chaining,
//! - the trace output monitor, which registers a local `echo` procedure and
//!   chains it to the peer's trace streams so trace lines arrive on a
//!   [`broadcast`] channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::rpc::{handler, CallContext, Connection, Handler, NameStatus, ProcedureSpec};
use crate::{AppError, Result};

/// Peer trace streams the output monitor is chained to.
pub const TRACE_STREAMS: [&str; 4] = [
    "model-trace",
    "command-trace",
    "warning-trace",
    "general-trace",
];

/// Local call name of the trace output procedure.
pub const ECHO_CALL_NAME: &str = "echo";

/// Capacity of the trace line broadcast channel.
const TRACE_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on monitor names probed before giving up.
const MAX_MONITOR_PROBES: u32 = 256;

#[derive(Debug, Default)]
struct MonitorState {
    /// Peer-side monitor name while output echo is on.
    active: Option<String>,
    /// Next numeric suffix to probe.
    next_index: u32,
}

#[derive(Debug)]
struct TraceOutput {
    prefix: String,
    show: AtomicBool,
    lines: broadcast::Sender<String>,
    state: Mutex<MonitorState>,
}

impl TraceOutput {
    fn new(prefix: &str, show: bool) -> Self {
        let (lines, _) = broadcast::channel(TRACE_CHANNEL_CAPACITY);
        Self {
            prefix: prefix.to_owned(),
            show: AtomicBool::new(show),
            lines,
            state: Mutex::new(MonitorState::default()),
        }
    }

    fn publish(&self, line: String) {
        if self.show.load(Ordering::Relaxed) {
            // No subscribers is fine; the line is simply not shown.
            let _ = self.lines.send(line);
        }
    }
}

/// High-level client for the peer's command interface.
#[derive(Debug, Clone)]
pub struct Client {
    connection: Connection,
    model: Option<String>,
    trace: Arc<TraceOutput>,
}

impl Client {
    /// Connect using `config`, announce the client name, and install the
    /// trace monitor when `echo_output` is set.
    ///
    /// If one of the initial calls fails the connection is closed before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the peer is unreachable, or any error
    /// from the initial calls.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let connection =
            Connection::connect(&config.host, config.port, config.connection_options()).await?;
        let client = Self::with_config(connection, config);

        if let Err(err) = client.announce(config).await {
            warn!(%err, "client: setup failed, closing connection");
            client.connection.close().await;
            return Err(err);
        }

        Ok(client)
    }

    async fn announce(&self, config: &ClientConfig) -> Result<()> {
        if !self.set_name(&config.client_name).await? {
            warn!(name = %config.client_name, "client: peer did not accept client name");
        }

        if config.echo_output {
            self.echo_output().await?;
        }
        Ok(())
    }

    /// Wrap an existing connection with default trace settings.
    #[must_use]
    pub fn from_connection(connection: Connection) -> Self {
        Self::with_config(connection, &ClientConfig::default())
    }

    /// Wrap an existing connection using the trace settings from `config`.
    #[must_use]
    pub fn with_config(connection: Connection, config: &ClientConfig) -> Self {
        Self {
            connection,
            model: None,
            trace: Arc::new(TraceOutput::new(
                &config.trace_monitor_prefix,
                config.show_output,
            )),
        }
    }

    /// Same client, scoped to the model of the peer call `ctx` is serving.
    ///
    /// Unlike [`CallContext::client`], the result shares this client's trace
    /// output state.
    #[must_use]
    pub fn for_call(&self, ctx: &CallContext) -> Self {
        self.clone().with_model(ctx.model().map(str::to_owned))
    }

    /// Same client, scoped to `model` for subsequent `evaluate` calls.
    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Model scope applied to `evaluate` calls, if any.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Announce this client's name to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot complete.
    pub async fn set_name(&self, name: &str) -> Result<bool> {
        let outcome = self
            .connection
            .call("set-name", vec![Value::from(name)])
            .await?;
        Ok(outcome.success)
    }

    /// Evaluate a peer command in this client's model scope.
    ///
    /// # Errors
    ///
    /// - [`AppError::Remote`] if the peer reports an error.
    /// - Transport errors from [`Connection::call`].
    pub async fn evaluate(&self, command: &str, args: &[Value]) -> Result<Vec<Value>> {
        let outcome = self
            .connection
            .evaluate(command, self.model.as_deref(), args)
            .await?;

        outcome.into_result().map_err(|err| {
            warn!(command, %err, "client: error evaluating command");
            err
        })
    }

    /// Evaluate a peer command and return its first result value (`null`
    /// if there is none).
    ///
    /// # Errors
    ///
    /// Same as [`Client::evaluate`].
    pub async fn evaluate_single(&self, command: &str, args: &[Value]) -> Result<Value> {
        Ok(self
            .evaluate(command, args)
            .await?
            .into_iter()
            .next()
            .unwrap_or(Value::Null))
    }

    /// Call an arbitrary peer command; alias of [`Client::evaluate_single`].
    ///
    /// # Errors
    ///
    /// Same as [`Client::evaluate`].
    pub async fn call_command(&self, command: &str, args: &[Value]) -> Result<Value> {
        self.evaluate_single(command, args).await
    }

    /// Model scope of this client, or the peer's current model.
    ///
    /// # Errors
    ///
    /// Same as [`Client::evaluate`].
    pub async fn current_model(&self) -> Result<Option<String>> {
        if let Some(model) = &self.model {
            return Ok(Some(model.clone()));
        }
        Ok(match self.evaluate_single("current-model", &[]).await? {
            Value::String(name) => Some(name),
            _ => None,
        })
    }

    /// Names of the models currently defined on the peer.
    ///
    /// # Errors
    ///
    /// Same as [`Client::evaluate`].
    pub async fn available_models(&self) -> Result<Vec<String>> {
        Ok(match self.evaluate_single("mp-models", &[]).await? {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(name) => Some(name),
                    _ => None,
                })
                .collect(),
            Value::String(name) => vec![name],
            _ => Vec::new(),
        })
    }

    /// Client scoped to model `name`, after checking it exists on the peer.
    ///
    /// The comparison ignores case.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if the peer has no such model, or any
    /// error from [`Client::available_models`].
    pub async fn set_current_model(&self, name: &str) -> Result<Self> {
        let models = self.available_models().await?;
        if models.iter().any(|m| m.eq_ignore_ascii_case(name)) {
            Ok(self.clone().with_model(Some(name.to_owned())))
        } else {
            Err(AppError::NotFound(format!(
                "{name} is not one of the currently available models: {models:?}"
            )))
        }
    }

    /// Register a procedure with the peer; see
    /// [`Connection::register_procedure`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the calls to the peer cannot complete.
    pub async fn add_command(&self, spec: ProcedureSpec) -> Result<bool> {
        self.connection.register_procedure(spec).await
    }

    /// Remove a registered procedure.
    ///
    /// # Errors
    ///
    /// Returns an error only if the call to the peer cannot complete.
    pub async fn remove_command(&self, name: &str) -> Result<bool> {
        self.connection.unregister_procedure(name).await
    }

    /// Chain `monitor` to `original` on the peer.
    ///
    /// # Errors
    ///
    /// Returns an error only if the call to the peer cannot complete.
    pub async fn monitor_command(&self, original: &str, monitor: &str) -> Result<bool> {
        self.connection.add_monitor(original, monitor).await
    }

    /// Remove a chain created by [`Client::monitor_command`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the call to the peer cannot complete.
    pub async fn remove_command_monitor(&self, original: &str, monitor: &str) -> Result<bool> {
        self.connection.remove_monitor(original, monitor).await
    }

    /// Subscribe to trace lines delivered by the output monitor.
    #[must_use]
    pub fn trace_output(&self) -> broadcast::Receiver<String> {
        self.trace.lines.subscribe()
    }

    /// Stop forwarding trace lines without removing the monitor.
    pub fn hide_output(&self) {
        self.trace.show.store(false, Ordering::Relaxed);
    }

    /// Resume forwarding trace lines.
    pub fn unhide_output(&self) {
        self.trace.show.store(true, Ordering::Relaxed);
    }

    /// Whether trace lines are currently forwarded.
    #[must_use]
    pub fn is_output_shown(&self) -> bool {
        self.trace.show.load(Ordering::Relaxed)
    }

    /// Peer-side name of the active trace monitor, if output echo is on.
    pub async fn trace_monitor_name(&self) -> Option<String> {
        self.trace.state.lock().await.active.clone()
    }

    /// Install the trace output monitor.
    ///
    /// Probes `<prefix><n>` names with `check` until a free one (or one this
    /// client already owns) is found, registers it with call name `echo`,
    /// and chains it to every stream in [`TRACE_STREAMS`].
    ///
    /// Returns `Ok(false)` if echo was already on or the peer refused the
    /// registration.
    ///
    /// # Errors
    ///
    /// - [`AppError::Remote`] if the peer rejects the probed name outright.
    /// - [`AppError::Registration`] if no free name is found.
    /// - Transport errors from [`Connection::call`].
    pub async fn echo_output(&self) -> Result<bool> {
        let mut state = self.trace.state.lock().await;
        if state.active.is_some() {
            warn!("client: echo_output called when output was already on");
            return Ok(false);
        }

        let name = self.claim_monitor_name(&mut state).await?;
        let spec = ProcedureSpec::new(name.clone())
            .handler(self.echo_handler())
            .call_name(ECHO_CALL_NAME)
            .documentation("Trace monitor for the Rust client. Do not call directly.");

        if !self.connection.register_procedure(spec).await? {
            return Ok(false);
        }

        for stream in TRACE_STREAMS {
            if !self.connection.add_monitor(stream, &name).await? {
                warn!(stream, monitor = %name, "client: failed to monitor trace stream");
            }
        }

        info!(monitor = %name, "client: trace output monitor installed");
        state.active = Some(name);
        Ok(true)
    }

    /// Remove the trace output monitor installed by [`Client::echo_output`].
    ///
    /// Returns `Ok(false)` if echo was already off.
    ///
    /// # Errors
    ///
    /// Transport errors from [`Connection::call`].
    pub async fn no_output(&self) -> Result<bool> {
        let mut state = self.trace.state.lock().await;
        let Some(name) = state.active.take() else {
            warn!("client: no_output called when output was already off");
            return Ok(false);
        };

        for stream in TRACE_STREAMS {
            self.connection.remove_monitor(stream, &name).await?;
        }
        self.connection.unregister_procedure(&name).await?;

        info!(monitor = %name, "client: trace output monitor removed");
        Ok(true)
    }

    /// Close the underlying connection.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    async fn claim_monitor_name(&self, state: &mut MonitorState) -> Result<String> {
        for _ in 0..MAX_MONITOR_PROBES {
            let name = format!("{}{}", self.trace.prefix, state.next_index);
            match self.connection.check_name(&name).await? {
                NameStatus::Unregistered | NameStatus::OwnedBySelf => return Ok(name),
                NameStatus::OwnedByOther => {
                    debug!(%name, "client: monitor name taken, probing next");
                    state.next_index += 1;
                }
                NameStatus::Invalid(message) => return Err(AppError::Remote(message)),
            }
        }

        Err(AppError::Registration(format!(
            "no free trace monitor name with prefix '{}'",
            self.trace.prefix
        )))
    }

    fn echo_handler(&self) -> Handler {
        let trace = Arc::clone(&self.trace);
        handler(move |_ctx: CallContext, args: Vec<Value>| {
            let trace = Arc::clone(&trace);
            async move {
                let line = match args.into_iter().next() {
                    Some(Value::String(text)) => text,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                trace.publish(line.trim_end().to_owned());
                Ok(true)
            }
        })
    }
}
