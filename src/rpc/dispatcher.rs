//! Routing of decoded inbound envelopes.
//!
//! | Inbound envelope                         | Action                                       |
//! |------------------------------------------|----------------------------------------------|
//! | reply, id pending                        | fulfil the waiting call                      |
//! | reply, id unknown                        | log at `WARN` and drop                       |
//! | `evaluate` of a registered handler       | spawn an invocation task, reply when it ends |
//! | `evaluate` of a registered stub          | reply `[true]`                               |
//! | `evaluate` of an unknown name, or any other method | reply with `Invalid method name …`  |
//!
//! Invocations run concurrently, up to the connection's invocation limit,
//! and reply in completion order; replies are correlated by id only.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::rpc::connection::Connection;
use crate::rpc::envelope::{self, Inbound, InboundCall, ReplyEnvelope, EVALUATE_METHOD};
use crate::rpc::pending::{CallOutcome, PendingCalls};
use crate::rpc::procedure::{CallContext, Handler};
use crate::rpc::registry::Resolved;

/// Route one inbound envelope.
pub(crate) async fn dispatch(connection: &Connection, inbound: Inbound) {
    match inbound {
        Inbound::Reply(reply) => handle_reply(connection.pending(), reply),
        Inbound::Call(call) => handle_call(connection, call).await,
    }
}

/// Convert a reply envelope into the caller-facing outcome.
///
/// A non-null `error` wins; otherwise the reply is a success carrying
/// `result` (empty when `result` is null).
#[must_use]
pub fn outcome_from_reply(reply: ReplyEnvelope) -> CallOutcome {
    match reply.error {
        Some(error) => CallOutcome::failure(error.message),
        None => CallOutcome::success(reply.result.unwrap_or_default()),
    }
}

fn handle_reply(pending: &PendingCalls, reply: ReplyEnvelope) {
    let Some(id) = reply.call_id() else {
        warn!(id = %reply.id, "dispatcher: reply with non-integer id, dropping");
        return;
    };

    let success = reply.error.is_none();
    if pending.fulfil(id, outcome_from_reply(reply)) {
        debug!(call_id = id, success, "dispatcher: call fulfilled");
    } else {
        warn!(call_id = id, "dispatcher: reply for unknown call id, dropping");
    }
}

async fn handle_call(connection: &Connection, call: InboundCall) {
    let target = if call.method == EVALUATE_METHOD {
        call.params.first().and_then(Value::as_str).map(str::to_owned)
    } else {
        None
    };

    let Some(name) = target else {
        let shown = if call.method == EVALUATE_METHOD {
            call.params
                .first()
                .map_or_else(|| "<missing>".to_owned(), ToString::to_string)
        } else {
            call.method.clone()
        };
        reject(connection, call.id, &shown).await;
        return;
    };

    match connection.registry().resolve(&name).await {
        None => reject(connection, call.id, &name).await,
        Some(Resolved::Stub) => {
            debug!(procedure = %name, "dispatcher: peer-side stub, answering true");
            send_reply(
                connection,
                ReplyEnvelope::success(call.id, vec![Value::Bool(true)]),
            )
            .await;
        }
        Some(Resolved::Handler(handler)) => spawn_invocation(connection, handler, name, call),
    }
}

async fn reject(connection: &Connection, id: Value, name: &str) {
    warn!(method = name, "dispatcher: invalid method name in peer call");
    send_reply(
        connection,
        ReplyEnvelope::failure(id, format!("Invalid method name {name}")),
    )
    .await;
}

fn spawn_invocation(connection: &Connection, handler: Handler, name: String, call: InboundCall) {
    let mut params = call.params.into_iter();
    // Skip the procedure name; the context slot follows it.
    params.next();
    let model = envelope::context_model(params.next().as_ref());
    let args: Vec<Value> = params.collect();

    let span = info_span!(
        "invocation",
        procedure = %name,
        call_id = %call.id,
        model = model.as_deref().unwrap_or("none")
    );

    let ctx = CallContext::new(connection.clone(), name, model, call.id);
    let slots = connection.invocation_slots();
    let connection = connection.clone();

    tokio::spawn(
        async move {
            // Acquired inside the task so the receiver loop never waits on a slot.
            let _slot = slots.acquire_owned().await.ok();
            let reply = run_procedure(&handler, ctx, args).await;
            send_reply(&connection, reply).await;
        }
        .instrument(span),
    );
}

/// Run `handler` and build the reply for its call.
///
/// Errors and panics raised by the handler become an error reply whose
/// message names the procedure, the model scope, and the arguments.
pub(crate) async fn run_procedure(
    handler: &Handler,
    ctx: CallContext,
    args: Vec<Value>,
) -> ReplyEnvelope {
    let id = ctx.call_id().clone();
    let procedure = ctx.procedure().to_owned();
    let model = ctx.model().map(str::to_owned);
    let shown_args = Value::Array(args.clone()).to_string();

    let result = AssertUnwindSafe(async { handler.invoke(ctx, args).await })
        .catch_unwind()
        .await;

    let failure = match result {
        Ok(Ok(output)) => return ReplyEnvelope::success(id, output.into_values()),
        Ok(Err(err)) => err.to_string(),
        Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
    };

    warn!(procedure = %procedure, error = %failure, "dispatcher: procedure failed");
    ReplyEnvelope::failure(
        id,
        format!(
            "Error {failure} while evaluating a command for command: {procedure}, model: {}, \
             parameters: {shown_args}",
            model.as_deref().unwrap_or("none")
        ),
    )
}

async fn send_reply(connection: &Connection, reply: ReplyEnvelope) {
    let text = match envelope::encode_reply(&reply) {
        Ok(text) => text,
        Err(err) => {
            warn!(%err, "dispatcher: failed to encode reply, sending error instead");
            let fallback = ReplyEnvelope::failure(reply.id, format!("unencodable result: {err}"));
            match envelope::encode_reply(&fallback) {
                Ok(text) => text,
                Err(_) => return,
            }
        }
    };

    if let Err(err) = connection.writer().send(text).await {
        debug!(%err, "dispatcher: reply not delivered");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
