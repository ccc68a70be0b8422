//! Scriptable tool provider speaking newline-delimited JSON-RPC on stdio.
//!
//! Modes (first argument):
//! - `normal`: well-behaved provider
//! - `bad-handshake`: answers `initialize` with a non-object result
//! - `silent`: never answers `initialize`
//! - `stubborn`: keeps running after stdin closes

use std::io::{BufRead, Write};
use std::time::Duration;

use serde_json::{json, Value};

fn send(out: &mut impl Write, msg: &Value) {
    let _ = writeln!(out, "{}", msg);
    let _ = out.flush();
}

fn reply(out: &mut impl Write, id: &Value, result: Value) {
    send(out, &json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn text(s: &str, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": s}], "isError": is_error})
}

fn tool(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
    })
}

fn main() {
    let mode = std::env::args().nth(1).unwrap_or_else(|| "normal".into());
    let stdin = std::io::stdin();
    let mut out = std::io::stdout();

    eprintln!("mock provider starting in {} mode", mode);
    // Noise before the first message must be tolerated.
    let _ = writeln!(out, "mock provider ready");
    let _ = out.flush();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = msg["method"].as_str().unwrap_or("");
        let id = msg.get("id").cloned();

        let Some(id) = id else {
            // notification
            if method == "notifications/cancelled" {
                eprintln!("cancelled request {}", msg["params"]["requestId"]);
            }
            continue;
        };

        match method {
            "initialize" => match mode.as_str() {
                "bad-handshake" => reply(&mut out, &id, json!("oops")),
                "silent" => {}
                _ => reply(
                    &mut out,
                    &id,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mock-tool-provider", "version": "0.1.0"}
                    }),
                ),
            },
            "ping" => reply(&mut out, &id, json!({})),
            "tools/list" => {
                let page = if msg["params"]["cursor"] == "page2" {
                    json!({"tools": [
                        tool("slow", "Sleeps for `ms` milliseconds"),
                        tool("crash", "Exits the provider"),
                        tool("dup", "Answers twice"),
                        tool("garbled", "Answers with a non-standard error")
                    ]})
                } else {
                    json!({
                        "tools": [tool("echo", "Echo text"), tool("fail", "Always fails")],
                        "nextCursor": "page2"
                    })
                };
                reply(&mut out, &id, page);
            }
            "tools/call" => {
                let args = &msg["params"]["arguments"];
                match msg["params"]["name"].as_str().unwrap_or("") {
                    "echo" => reply(&mut out, &id, text(args["text"].as_str().unwrap_or(""), false)),
                    "fail" => reply(&mut out, &id, text("tool failed on purpose", true)),
                    "slow" => {
                        let ms = args["ms"].as_u64().unwrap_or(1000);
                        std::thread::sleep(Duration::from_millis(ms));
                        reply(&mut out, &id, text("slept", false));
                    }
                    "crash" => std::process::exit(3),
                    "garbled" => send(&mut out, &json!({"jsonrpc": "2.0", "id": id, "error": "boom"})),
                    "dup" => {
                        reply(&mut out, &id, text("first", false));
                        reply(&mut out, &id, text("second", false));
                        reply(&mut out, &json!(9999), text("stray", false));
                    }
                    other => send(
                        &mut out,
                        &json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": -32602, "message": format!("unknown tool: {}", other)}
                        }),
                    ),
                }
            }
            other => send(
                &mut out,
                &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("method not found: {}", other)}
                }),
            ),
        }
    }

    if mode == "stubborn" {
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }
}
