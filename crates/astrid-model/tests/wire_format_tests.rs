// Copyright (c) 2025-2026 Astrid Contributors
//
// SPDX-License-Identifier: MIT
//! Cross-module wire-format behavior: flat-protocol chunk parsing, block
//! conversion, salvage interplay, and multiplexed streaming.

use std::sync::{Arc, Mutex};

use serde_json::{json, Map};

use astrid_model::{
    apply_salvage, build_block_messages, parse_block_messages, ChatClient, ChatRequest,
    ChatResponse, FunctionCall, Message, MultiClient, Role, ScriptedClient, StreamEvent, ToolCall,
};

fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        function: FunctionCall {
            name: name.into(),
            arguments: args.as_object().cloned().unwrap_or_default(),
        },
    }
}

// ── Flat protocol: one streamed exchange, chunk by chunk ─────────────────────

#[test]
fn flat_stream_transcript_parses_chunk_by_chunk() {
    // A realistic three-chunk transcript: two token chunks, one terminal
    // chunk carrying the tool call and counters.
    let transcript = [
        r#"{"model":"qwen2.5:14b","created_at":"","message":{"role":"assistant","content":"Let me "},"done":false}"#,
        r#"{"model":"qwen2.5:14b","created_at":"","message":{"role":"assistant","content":"check."},"done":false}"#,
        r#"{"model":"qwen2.5:14b","created_at":"2026-03-01T10:00:02Z",
            "message":{"role":"assistant","content":"",
                "tool_calls":[{"function":{"name":"get_state","arguments":{"entity_id":"light.office"}}}]},
            "done":true,"prompt_eval_count":134,"eval_count":41,
            "total_duration":812000000,"load_duration":9000000,"eval_duration":644000000}"#,
    ];

    let chunks: Vec<ChatResponse> = transcript
        .iter()
        .map(|line| serde_json::from_str(line).expect("every chunk parses"))
        .collect();

    assert!(!chunks[0].done);
    assert!(chunks[0].created_at.is_none());
    assert_eq!(chunks[0].message.content, "Let me ");
    assert_eq!(chunks[1].message.content, "check.");

    let terminal = &chunks[2];
    assert!(terminal.done);
    assert!(terminal.created_at.is_some());
    assert_eq!(terminal.input_tokens, 134);
    assert_eq!(terminal.output_tokens, 41);
    assert_eq!(terminal.total_duration, 812_000_000);
    assert_eq!(
        terminal.message.tool_calls[0].function.arguments["entity_id"],
        "light.office"
    );
}

// ── Block protocol: conversion invariants across a full exchange ─────────────

#[test]
fn block_conversion_round_trip_preserves_correlation() {
    let history = vec![
        Message::system("You are a home assistant."),
        Message::system("Be terse."),
        Message::user("Is anything on?"),
        Message::assistant_with_calls(
            "Checking two entities.",
            vec![
                call("toolu_a", "get_state", json!({ "entity_id": "light.office" })),
                call("toolu_b", "get_state", json!({ "entity_id": "light.hall" })),
            ],
        ),
        Message::tool_result("toolu_a", "State: on"),
        Message::tool_result("toolu_b", "State: off"),
        Message::assistant("The office light is on."),
    ];

    let (system, wire) = build_block_messages(&history);
    // Both system messages fold into one top-level field, blank-line joined.
    assert_eq!(system, "You are a home assistant.\n\nBe terse.");
    // No system turn remains in the message list.
    for m in &wire {
        assert_ne!(m["role"], "system");
    }
    // Tool results ride as user-role tool_result blocks with preserved ids.
    let tool_result_ids: Vec<&str> = wire
        .iter()
        .filter_map(|m| m["content"][0]["tool_use_id"].as_str())
        .collect();
    assert_eq!(tool_result_ids, vec!["toolu_a", "toolu_b"]);

    let back = parse_block_messages(&system, &wire);
    // Equivalent modulo the two system messages merging into one.
    assert_eq!(back[0].role, Role::System);
    assert_eq!(back[0].content, "You are a home assistant.\n\nBe terse.");
    assert_eq!(&back[1..], &history[2..]);
}

#[test]
fn every_tool_message_answers_a_prior_call_after_conversion() {
    let history = vec![
        Message::user("check"),
        Message::assistant_with_calls("", vec![call("toolu_1", "get_state", json!({}))]),
        Message::tool_result("toolu_1", "ok"),
    ];
    let (system, wire) = build_block_messages(&history);
    let back = parse_block_messages(&system, &wire);

    let call_ids: Vec<&str> = back
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
        .collect();
    for m in back.iter().filter(|m| m.role == Role::Tool) {
        let id = m.tool_call_id.as_deref().unwrap();
        assert!(call_ids.contains(&id), "orphaned tool_result {id}");
    }
}

// ── Salvage interplay with the response type ─────────────────────────────────

#[test]
fn salvage_then_convert_produces_valid_blocks() {
    // A local model wrote its call as text; after salvage the message must
    // convert into a tool_use block with a synthesized id.
    let mut resp = ChatResponse {
        message: Message::assistant(r#"{"name":"get_state","arguments":{"entity_id":"sun.sun"}}"#),
        ..Default::default()
    };
    assert!(apply_salvage(&mut resp, &["get_state".to_string()]));

    let (_, wire) = build_block_messages(&[resp.message]);
    let block = &wire[0]["content"][0];
    assert_eq!(block["type"], "tool_use");
    assert_eq!(block["id"], "tool_get_state_0");
    assert_eq!(block["input"]["entity_id"], "sun.sun");
}

#[test]
fn double_salvage_is_a_noop() {
    let mut resp = ChatResponse {
        message: Message::assistant(r#"{"name":"get_state","arguments":{}}"#),
        ..Default::default()
    };
    assert!(apply_salvage(&mut resp, &[]));
    let snapshot = resp.clone();
    assert!(!apply_salvage(&mut resp, &[]));
    assert_eq!(resp, snapshot);
}

// ── Multiplexed streaming ────────────────────────────────────────────────────

#[tokio::test]
async fn multiplexer_streams_through_the_routed_provider() {
    let local = Arc::new(ScriptedClient::new(vec![ScriptedClient::tool_call(
        "get_state",
        Map::new(),
        10,
        5,
    )]));
    let multi = MultiClient::new()
        .with_provider("ollama", local)
        .route("qwen2.5:14b", "ollama");

    let events: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let cb = |ev: StreamEvent| {
        let tag = match ev {
            StreamEvent::Token(_) => "token",
            StreamEvent::ToolCallStart { .. } => "start",
            StreamEvent::ToolCallDone(_) => "call",
            StreamEvent::Done => "done",
        };
        events.lock().unwrap().push(tag.to_string());
    };

    let resp = multi
        .chat_stream(
            ChatRequest {
                model: "qwen2.5:14b".into(),
                messages: vec![Message::user("check")],
                ..Default::default()
            },
            Some(&cb),
        )
        .await
        .unwrap();

    assert_eq!(resp.message.tool_calls.len(), 1);
    assert_eq!(*events.lock().unwrap(), vec!["call", "done"]);
}
