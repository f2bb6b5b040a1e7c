//! Integration tests for peer-initiated calls.
//!
//! Validates:
//! - registered handlers run with their arguments and model scope
//! - unknown names and non-`evaluate` methods are rejected by name
//! - handler errors and panics become error replies and the loop survives
//! - stubs answer `true`; falsy and multi-value outputs are mapped
//! - invocations run concurrently

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Barrier;

use actr_remote::rpc::{
    handler, CallContext, ConnectionOptions, ProcedureOutput, ProcedureSpec,
};
use actr_remote::AppError;

use super::test_helpers::{MockPeer, TEST_TIMEOUT};

fn doubler() -> actr_remote::rpc::Handler {
    handler(|_ctx: CallContext, args: Vec<Value>| async move {
        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
        Ok(n * 2)
    })
}

// ── Routing ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn registered_handler_answers_peer_call() {
    let peer = MockPeer::new();
    let (conn, mut handle) = peer.attach("alpha").await;
    assert!(conn
        .register_procedure(ProcedureSpec::new("double").handler(doubler()))
        .await
        .expect("register"));

    let id = handle.evaluate_on_client("double", json!(false), vec![json!(21)]);
    let reply = handle.reply_for(id).await;

    assert_eq!(reply, json!({ "id": id, "result": [42], "error": null }));
}

#[tokio::test]
async fn handler_sees_model_scope_and_call_name() {
    let peer = MockPeer::new();
    let (conn, mut handle) = peer.attach("alpha").await;
    let spy = handler(|ctx: CallContext, args: Vec<Value>| async move {
        Ok(ProcedureOutput::Multiple(vec![
            json!(ctx.procedure()),
            json!(ctx.model()),
            Value::Array(args),
        ]))
    });
    conn.register_procedure(ProcedureSpec::new("spy").handler(spy))
        .await
        .expect("register");

    let scoped = handle.evaluate_on_client("spy", json!("count"), vec![json!(1), json!("a")]);
    let unscoped = handle.evaluate_on_client("spy", json!(false), vec![]);

    assert_eq!(
        handle.reply_for(scoped).await["result"],
        json!(["spy", "count", [1, "a"]])
    );
    assert_eq!(
        handle.reply_for(unscoped).await["result"],
        json!(["spy", null, []])
    );
}

/// An unregistered name is rejected by name; a call the client has in
/// flight at the same time is unaffected.
#[tokio::test]
async fn unknown_name_is_rejected_without_disturbing_pending_calls() {
    let peer = MockPeer::new();
    let (conn, mut handle) = peer.attach("alpha").await;

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.evaluate("delay", None, &[json!(100), json!("ok")]).await })
    };

    let id = handle.evaluate_on_client("frobnicate", json!(false), vec![]);
    let reply = handle.reply_for(id).await;

    assert_eq!(reply["result"], Value::Null);
    assert_eq!(
        reply["error"]["message"],
        json!("Invalid method name frobnicate")
    );

    let outcome = tokio::time::timeout(TEST_TIMEOUT, pending)
        .await
        .expect("timely")
        .expect("join")
        .expect("call");
    assert_eq!(outcome.values, vec![json!("ok")]);
}

#[tokio::test]
async fn non_evaluate_method_is_rejected() {
    let peer = MockPeer::new();
    let (_conn, mut handle) = peer.attach("alpha").await;

    let id = handle.call_client("shutdown", vec![]);
    let reply = handle.reply_for(id).await;

    assert_eq!(reply["error"]["message"], json!("Invalid method name shutdown"));
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handler_error_becomes_descriptive_error_reply() {
    let peer = MockPeer::new();
    let (conn, mut handle) = peer.attach("alpha").await;
    let failing = handler(|_ctx: CallContext, _args: Vec<Value>| async move {
        Err::<Value, _>(AppError::Procedure("division by zero".into()))
    });
    conn.register_procedure(ProcedureSpec::new("divide").handler(failing))
        .await
        .expect("register");

    let id = handle.evaluate_on_client("divide", json!("count"), vec![json!(1), json!(0)]);
    let reply = handle.reply_for(id).await;
    let message = reply["error"]["message"].as_str().expect("message");

    assert_eq!(reply["result"], Value::Null);
    assert!(message.contains("division by zero"), "{message}");
    assert!(message.contains("command: divide"), "{message}");
    assert!(message.contains("model: count"), "{message}");
    assert!(message.contains("[1,0]"), "{message}");
}

#[tokio::test]
async fn handler_panic_becomes_error_reply_and_loop_survives() {
    let peer = MockPeer::new();
    let (conn, mut handle) = peer.attach("alpha").await;
    let panicking = handler(|_ctx: CallContext, _args: Vec<Value>| async move {
        if true {
            panic!("handler exploded");
        }
        Ok(())
    });
    conn.register_procedure(ProcedureSpec::new("explode").handler(panicking))
        .await
        .expect("register");
    conn.register_procedure(ProcedureSpec::new("double").handler(doubler()))
        .await
        .expect("register");

    let id = handle.evaluate_on_client("explode", json!(false), vec![]);
    let reply = handle.reply_for(id).await;
    let message = reply["error"]["message"].as_str().expect("message");
    assert!(message.contains("handler exploded"), "{message}");
    assert!(message.contains("command: explode"), "{message}");

    let id = handle.evaluate_on_client("double", json!(false), vec![json!(4)]);
    assert_eq!(handle.reply_for(id).await["result"], json!([8]));
    assert!(conn.is_alive());
}

// ── Output mapping ────────────────────────────────────────────────────────────

#[tokio::test]
async fn stub_registration_answers_true() {
    let peer = MockPeer::new();
    let (conn, mut handle) = peer.attach("alpha").await;
    conn.register_procedure(ProcedureSpec::new("placeholder"))
        .await
        .expect("register");

    let id = handle.evaluate_on_client("placeholder", json!(false), vec![json!("ignored")]);

    assert_eq!(handle.reply_for(id).await["result"], json!([true]));
}

#[tokio::test]
async fn falsy_and_multiple_outputs_are_mapped() {
    let peer = MockPeer::new();
    let (conn, mut handle) = peer.attach("alpha").await;
    let falsy = handler(|_ctx: CallContext, _args: Vec<Value>| async move { Ok(false) });
    let nothing = handler(|_ctx: CallContext, _args: Vec<Value>| async move { Ok(()) });
    let spread = handler(|_ctx: CallContext, args: Vec<Value>| async move {
        Ok(ProcedureOutput::Multiple(args))
    });
    let list = handler(|_ctx: CallContext, args: Vec<Value>| async move { Ok(Value::Array(args)) });

    for (name, h) in [("falsy", falsy), ("nothing", nothing), ("spread", spread), ("list", list)] {
        conn.register_procedure(ProcedureSpec::new(name).handler(h))
            .await
            .expect("register");
    }

    let args = vec![json!(1), json!(2)];
    let falsy_id = handle.evaluate_on_client("falsy", json!(false), vec![]);
    let nothing_id = handle.evaluate_on_client("nothing", json!(false), vec![]);
    let spread_id = handle.evaluate_on_client("spread", json!(false), args.clone());
    let list_id = handle.evaluate_on_client("list", json!(false), args);

    assert_eq!(handle.reply_for(falsy_id).await["result"], json!([null]));
    assert_eq!(handle.reply_for(nothing_id).await["result"], json!([null]));
    assert_eq!(handle.reply_for(spread_id).await["result"], json!([1, 2]));
    assert_eq!(handle.reply_for(list_id).await["result"], json!([[1, 2]]));
}

// ── Concurrency ───────────────────────────────────────────────────────────────

/// Every invocation waits on a shared barrier; the barrier only opens if
/// they are all running at once.
#[tokio::test]
async fn invocations_run_concurrently() {
    const CALLS: usize = 4;

    let peer = MockPeer::new();
    let (conn, mut handle) = peer.attach("alpha").await;
    let barrier = Arc::new(Barrier::new(CALLS));
    let gate = handler(move |_ctx: CallContext, args: Vec<Value>| {
        let barrier = Arc::clone(&barrier);
        async move {
            barrier.wait().await;
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        }
    });
    conn.register_procedure(ProcedureSpec::new("gate").handler(gate))
        .await
        .expect("register");

    let ids: Vec<u64> = (0..CALLS)
        .map(|i| handle.evaluate_on_client("gate", json!(false), vec![json!(i)]))
        .collect();

    for (i, id) in ids.into_iter().enumerate() {
        assert_eq!(handle.reply_for(id).await["result"], json!([i]));
    }
}

/// With a limit of two, no more than two invocations overlap, and every
/// queued invocation still gets its reply.
#[tokio::test]
async fn invocation_limit_caps_overlap() {
    let peer = MockPeer::new();
    let (conn, mut handle) = peer
        .attach_with(ConnectionOptions {
            max_concurrent_invocations: 2,
            ..ConnectionOptions::default()
        })
        .await;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tracked = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        handler(move |_ctx: CallContext, _args: Vec<Value>| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(true)
            }
        })
    };
    conn.register_procedure(ProcedureSpec::new("tracked").handler(tracked))
        .await
        .expect("register");

    let ids: Vec<u64> = (0..6)
        .map(|_| handle.evaluate_on_client("tracked", json!(false), vec![]))
        .collect();
    for id in ids {
        assert_eq!(handle.reply_for(id).await["result"], json!([true]));
    }

    assert!(peak.load(Ordering::SeqCst) <= 2, "limit exceeded");
}

/// A handler can call back into the peer while the peer waits on it.
#[tokio::test]
async fn handler_can_call_peer_during_invocation() {
    let peer = MockPeer::new();
    let (conn, mut handle) = peer.attach("alpha").await;
    let nested = handler(|ctx: CallContext, _args: Vec<Value>| async move {
        ctx.client().evaluate_single("current-model", &[]).await
    });
    conn.register_procedure(ProcedureSpec::new("nested").handler(nested))
        .await
        .expect("register");

    let id = handle.evaluate_on_client("nested", json!(false), vec![]);

    assert_eq!(handle.reply_for(id).await["result"], json!(["count"]));
}
