//! A live connection to the peer.
//!
//! [`Connection`] owns the framed transport, the pending-call table, and the
//! local procedure registry. Constructing one spawns the receiver loop, the
//! only reader of the inbound frame sequence, which runs until the peer
//! disconnects or [`Connection::close`] is called. When it stops, every
//! outstanding call is failed with [`AppError::Disconnected`] and the
//! connection is marked dead.
//!
//! Calls suspend the issuing task until the matching reply arrives. No
//! per-call timeout is applied; a caller that wants one wraps the call in
//! `tokio::time::timeout`, and the abandoned call leaves the pending table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::rpc::dispatcher;
use crate::rpc::envelope::{self, EVALUATE_METHOD};
use crate::rpc::framing::DEFAULT_MAX_FRAME_BYTES;
use crate::rpc::pending::{CallOutcome, PendingCalls};
use crate::rpc::registry::{ProcedureRegistry, ProcedureSpec};
use crate::rpc::transport::{self, FrameReader, FrameWriter};
use crate::{AppError, Result};

/// Owner identity used when none is configured.
pub const DEFAULT_OWNER: &str = "actr-remote";

/// Default cap on peer invocations running at once.
pub const DEFAULT_MAX_CONCURRENT_INVOCATIONS: usize = 64;

/// Options applied when a connection is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Identity recorded as the owner of procedures registered locally.
    pub owner: String,
    /// Largest inbound frame accepted before the stream is dropped.
    pub max_frame_bytes: usize,
    /// Peer invocations allowed to run at once; further ones wait for a slot.
    pub max_concurrent_invocations: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            owner: DEFAULT_OWNER.to_owned(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_concurrent_invocations: DEFAULT_MAX_CONCURRENT_INVOCATIONS,
        }
    }
}

/// Registration state of a name in the peer's table, as reported by `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameStatus {
    /// Nobody has registered the name.
    Unregistered,
    /// This connection already owns the name.
    OwnedBySelf,
    /// A different client owns the name.
    OwnedByOther,
    /// The peer refused to check the name.
    Invalid(String),
}

struct ConnectionInner {
    writer: FrameWriter,
    pending: PendingCalls,
    registry: ProcedureRegistry,
    owner: String,
    invocation_slots: Arc<Semaphore>,
    alive: AtomicBool,
    /// Fired by [`Connection::close`] to stop the receiver loop.
    shutdown: CancellationToken,
    /// Fired by the receiver loop once the connection is fully torn down.
    terminated: CancellationToken,
}

/// Cheaply cloneable handle to one peer connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("owner", &self.inner.owner)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to the peer over TCP.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the TCP connection cannot be established.
    pub async fn connect(host: &str, port: u16, options: ConnectionOptions) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await.map_err(|err| {
            AppError::Io(format!("failed to connect to {host}:{port}: {err}"))
        })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "connection: could not disable nagle");
        }
        info!(host, port, "connection: established");
        Ok(Self::new(stream, options))
    }

    /// Wrap an established duplex stream and start the receiver loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S, options: ConnectionOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (writer, reader) = transport::split(stream, options.max_frame_bytes);
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                writer,
                pending: PendingCalls::new(),
                registry: ProcedureRegistry::new(),
                owner: options.owner,
                invocation_slots: Arc::new(Semaphore::new(
                    options.max_concurrent_invocations.max(1),
                )),
                alive: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
                terminated: CancellationToken::new(),
            }),
        };

        let span = info_span!("receiver", owner = %connection.inner.owner);
        tokio::spawn(run_receiver(connection.clone(), reader).instrument(span));
        connection
    }

    /// Whether the receiver loop is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Owner identity of this connection's registrations.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Local procedure registry.
    #[must_use]
    pub fn registry(&self) -> &ProcedureRegistry {
        &self.inner.registry
    }

    /// Number of outbound calls still waiting for a reply.
    #[must_use]
    pub fn outstanding_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.inner.pending
    }

    pub(crate) fn writer(&self) -> &FrameWriter {
        &self.inner.writer
    }

    pub(crate) fn invocation_slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.inner.invocation_slots)
    }

    /// Issue `method` with `params` and wait for the peer's reply.
    ///
    /// A peer error reply is `Ok` with `success == false`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Disconnected`] if the connection is dead or dies while
    ///   the call is pending.
    /// - [`AppError::Io`] / [`AppError::Protocol`] if the call cannot be
    ///   encoded or written.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<CallOutcome> {
        // Dropping `pending` on any early exit, or when this future is
        // cancelled, removes the entry again.
        let pending = self.inner.pending.register()?;
        let id = pending.id();

        let text = envelope::encode_call(method, id, &params)?;
        self.inner.writer.send(text).await?;

        debug!(call_id = id, method, "connection: call sent");
        pending.wait().await
    }

    /// Call the peer's `evaluate` method for `procedure` in `model`'s scope.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::call`].
    pub async fn evaluate(
        &self,
        procedure: &str,
        model: Option<&str>,
        args: &[Value],
    ) -> Result<CallOutcome> {
        self.call(
            EVALUATE_METHOD,
            envelope::evaluate_params(procedure, model, args),
        )
        .await
    }

    /// Ask the peer who owns `name`.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::call`].
    pub async fn check_name(&self, name: &str) -> Result<NameStatus> {
        let outcome = self.call("check", vec![Value::from(name)]).await?;
        if let Some(message) = outcome.error_message() {
            return Ok(NameStatus::Invalid(message));
        }

        let slot = |i: usize| outcome.values.get(i).filter(|v| !v.is_null());
        Ok(match (slot(0), slot(1)) {
            (None, _) => NameStatus::Unregistered,
            (Some(_), None) => NameStatus::OwnedByOther,
            (Some(_), Some(_)) => NameStatus::OwnedBySelf,
        })
    }

    /// Register a procedure with the peer and install it locally.
    ///
    /// The peer is asked with `check` first. An unregistered name is added
    /// with `add`, and the local entry is installed only once the peer
    /// accepts. A name this connection already owns is reinstalled locally
    /// and reported as success. A name owned by anybody else is refused and
    /// nothing is installed.
    ///
    /// Returns `Ok(false)` for conflicts and peer refusals.
    ///
    /// # Errors
    ///
    /// Returns an error only if the calls to the peer cannot complete.
    pub async fn register_procedure(&self, spec: ProcedureSpec) -> Result<bool> {
        let owner = spec
            .owner_override()
            .unwrap_or(&self.inner.owner)
            .to_owned();

        if let Err(err) = self
            .inner
            .registry
            .ensure_available(spec.local_key(), &owner)
            .await
        {
            warn!(name = spec.name(), %err, "connection: local registration conflict");
            return Ok(false);
        }

        match self.check_name(spec.name()).await? {
            NameStatus::Unregistered => {
                let outcome = self.call("add", spec.add_params()).await?;
                if let Some(message) = outcome.error_message() {
                    warn!(name = spec.name(), error = %message, "connection: peer refused add");
                    return Ok(false);
                }
            }
            NameStatus::OwnedBySelf => {
                debug!(name = spec.name(), "connection: name already owned by this client");
            }
            NameStatus::OwnedByOther => {
                warn!(
                    name = spec.name(),
                    "connection: cannot add procedure already added by a different owner"
                );
                return Ok(false);
            }
            NameStatus::Invalid(message) => {
                warn!(name = spec.name(), error = %message, "connection: invalid procedure name");
                return Ok(false);
            }
        }

        let name = spec.name().to_owned();
        match self
            .inner
            .registry
            .insert(spec.into_registration(&owner))
            .await
        {
            Ok(_) => {
                info!(name = %name, "connection: procedure registered");
                Ok(true)
            }
            Err(err) => {
                warn!(name = %name, %err, "connection: local registration conflict");
                Ok(false)
            }
        }
    }

    /// Remove `name` locally and ask the peer to release it.
    ///
    /// The peer is notified even if no local entry existed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the call to the peer cannot complete.
    pub async fn unregister_procedure(&self, name: &str) -> Result<bool> {
        let had_local = self.inner.registry.remove(name).await;
        debug!(name, had_local, "connection: local procedure evicted");
        self.simple_call("remove", vec![Value::from(name)]).await
    }

    /// Chain `monitor` to run whenever the peer runs `target`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the call to the peer cannot complete.
    pub async fn add_monitor(&self, target: &str, monitor: &str) -> Result<bool> {
        self.simple_call("monitor", vec![Value::from(target), Value::from(monitor)])
            .await
    }

    /// Sever a chain created by [`Connection::add_monitor`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the call to the peer cannot complete.
    pub async fn remove_monitor(&self, target: &str, monitor: &str) -> Result<bool> {
        self.simple_call(
            "remove-monitor",
            vec![Value::from(target), Value::from(monitor)],
        )
        .await
    }

    /// Stop the receiver loop, fail pending calls, and close the stream.
    ///
    /// Returns once the connection is fully torn down. Idempotent.
    pub async fn close(&self) {
        info!("connection: closing");
        self.inner.shutdown.cancel();
        self.inner.terminated.cancelled().await;
    }

    /// Wait until the connection is dead, for whatever reason.
    pub async fn closed(&self) {
        self.inner.terminated.cancelled().await;
    }

    async fn simple_call(&self, method: &str, params: Vec<Value>) -> Result<bool> {
        let outcome = self.call(method, params).await?;
        if let Some(message) = outcome.error_message() {
            warn!(method, error = %message, "connection: peer reported failure");
            return Ok(false);
        }
        Ok(true)
    }

    async fn mark_dead(&self, reason: &str) {
        self.inner.alive.store(false, Ordering::Release);
        let released = self.inner.pending.close();
        self.inner.writer.shutdown().await;
        info!(reason, released, "connection: receiver stopped");
        self.inner.terminated.cancel();
    }
}

/// Receiver loop: read frames, decode, dispatch, until the stream ends.
///
/// Undecodable frames and stray replies are logged and skipped; only the
/// end of the stream, a read failure, or a local close stop the loop.
async fn run_receiver(connection: Connection, mut reader: FrameReader) {
    let shutdown = connection.inner.shutdown.clone();

    let reason = loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                break "closed locally".to_owned();
            }

            frame = reader.next_frame() => {
                match frame {
                    None => break "stream closed".to_owned(),
                    Some(Err(err)) => {
                        warn!(error = %err, "receiver: stream error, stopping");
                        break format!("stream error: {err}");
                    }
                    Some(Ok(bytes)) => match envelope::decode(&bytes) {
                        Ok(inbound) => dispatcher::dispatch(&connection, inbound).await,
                        Err(err) => {
                            warn!(
                                error = %err,
                                raw = %String::from_utf8_lossy(&bytes),
                                "receiver: undecodable frame, skipping"
                            );
                        }
                    },
                }
            }
        }
    };

    connection.mark_dead(&reason).await;
}
