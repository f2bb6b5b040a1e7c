//! Unit tests for JSON envelope encoding and classification.

use serde_json::{json, Value};

use actr_remote::rpc::dispatcher::outcome_from_reply;
use actr_remote::rpc::envelope::{
    context_model, decode, encode_call, encode_reply, evaluate_params, ErrorBody, Inbound,
    ReplyEnvelope,
};
use actr_remote::AppError;

fn parse(text: &str) -> Value {
    serde_json::from_str(text).expect("valid json")
}

// ── Outbound ──────────────────────────────────────────────────────────────────

#[test]
fn call_envelope_carries_method_id_and_params() {
    let text = encode_call("check", 7, &[json!("echo")]).expect("encode");

    assert_eq!(
        parse(&text),
        json!({ "method": "check", "id": 7, "params": ["echo"] })
    );
}

#[test]
fn success_reply_has_null_error() {
    let reply = ReplyEnvelope::success(json!(3), vec![json!(1), json!("two")]);
    let text = encode_reply(&reply).expect("encode");

    assert_eq!(
        parse(&text),
        json!({ "id": 3, "result": [1, "two"], "error": null })
    );
}

#[test]
fn failure_reply_has_null_result_and_message() {
    let reply = ReplyEnvelope::failure(json!(4), "Invalid method name nope");
    let text = encode_reply(&reply).expect("encode");

    assert_eq!(
        parse(&text),
        json!({
            "id": 4,
            "result": null,
            "error": { "message": "Invalid method name nope" }
        })
    );
}

#[test]
fn reply_echoes_non_integer_ids_verbatim() {
    let reply = ReplyEnvelope::success(json!("abc"), vec![Value::Null]);
    let text = encode_reply(&reply).expect("encode");

    assert_eq!(parse(&text)["id"], json!("abc"));
    assert_eq!(reply.call_id(), None);
}

#[test]
fn evaluate_params_places_context_second() {
    assert_eq!(
        evaluate_params("run", None, &[json!(1.5)]),
        vec![json!("run"), json!(false), json!(1.5)]
    );
    assert_eq!(
        evaluate_params("reset", Some("count"), &[]),
        vec![json!("reset"), json!("count")]
    );
}

// ── Inbound ───────────────────────────────────────────────────────────────────

#[test]
fn result_key_classifies_as_reply() {
    let inbound = decode(br#"{"id":1,"result":[true],"error":null}"#).expect("decode");

    let reply = match inbound {
        Inbound::Reply(reply) => reply,
        other => panic!("expected reply, got {other:?}"),
    };
    assert_eq!(reply.call_id(), Some(1));
    assert_eq!(reply.result, Some(vec![json!(true)]));
    assert!(reply.error.is_none());
}

#[test]
fn error_key_alone_classifies_as_reply() {
    let inbound = decode(br#"{"id":2,"error":{"message":"boom"}}"#).expect("decode");

    let reply = match inbound {
        Inbound::Reply(reply) => reply,
        other => panic!("expected reply, got {other:?}"),
    };
    assert_eq!(
        reply.error,
        Some(ErrorBody {
            message: "boom".into()
        })
    );
}

#[test]
fn method_key_classifies_as_call() {
    let inbound =
        decode(br#"{"method":"evaluate","id":9,"params":["echo",false,"hi"]}"#).expect("decode");

    let call = match inbound {
        Inbound::Call(call) => call,
        other => panic!("expected call, got {other:?}"),
    };
    assert_eq!(call.method, "evaluate");
    assert_eq!(call.id, json!(9));
    assert_eq!(call.params, vec![json!("echo"), json!(false), json!("hi")]);
}

#[test]
fn call_without_params_defaults_to_empty() {
    let Inbound::Call(call) = decode(br#"{"method":"ping","id":1}"#).expect("decode") else {
        panic!("expected call");
    };
    assert!(call.params.is_empty());
}

#[test]
fn non_json_frame_is_protocol_error() {
    let err = decode(b"not json").expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(ref m) if m.starts_with("malformed json")));
}

#[test]
fn object_without_known_keys_is_protocol_error() {
    let err = decode(br#"{"id":1}"#).expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(ref m) if m.starts_with("unrecognised envelope")));
}

#[test]
fn wrongly_typed_call_is_protocol_error() {
    let err = decode(br#"{"method":"evaluate","id":1,"params":"x"}"#).expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(ref m) if m.starts_with("malformed call")));
}

// ── Reply interpretation ──────────────────────────────────────────────────────

#[test]
fn error_field_makes_outcome_a_failure() {
    let outcome = outcome_from_reply(ReplyEnvelope::failure(json!(1), "no such command"));

    assert!(!outcome.success);
    assert_eq!(outcome.values, vec![json!("no such command")]);
    assert_eq!(outcome.error_message().as_deref(), Some("no such command"));
}

#[test]
fn missing_result_is_an_empty_success() {
    let reply: ReplyEnvelope = serde_json::from_value(json!({ "id": 1, "result": null, "error": null }))
        .expect("reply");
    let outcome = outcome_from_reply(reply);

    assert!(outcome.success);
    assert!(outcome.values.is_empty());
}

#[test]
fn context_slot_interpretation() {
    assert_eq!(context_model(Some(&json!(false))), None);
    assert_eq!(context_model(Some(&Value::Null)), None);
    assert_eq!(context_model(Some(&json!("count"))).as_deref(), Some("count"));
}
