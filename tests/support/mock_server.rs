// Mock tool server - a scriptable stdio server for integration tests
//
// Speaks newline-delimited JSON-RPC on stdin/stdout. Every tools/call is
// answered from its own thread, so responses come back in completion order,
// not request order.
//
// Flags:
//   --tools a,b,c       tools to advertise (default: all built-in tools)
//   --exit-immediately  print to stderr and exit with code 3 before any output
//   --no-handshake      read requests but never answer them
//   --linger            keep running after stdin closes (needs a signal to stop)

use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const BUILTIN_TOOLS: &[(&str, &str)] = &[
    ("echo", "Returns its arguments"),
    ("sleep", "Waits `ms` milliseconds, then returns `tag`"),
    ("fail", "Reports a tool-level failure"),
    ("rpc_error", "Answers with a JSON-RPC error"),
    ("garbage", "Writes an undecodable line before answering"),
    ("never", "Never answers"),
    ("exit", "Terminates the server"),
];

struct Options {
    tools: Vec<String>,
    exit_immediately: bool,
    no_handshake: bool,
    linger: bool,
}

fn parse_options() -> Options {
    let mut options = Options {
        tools: BUILTIN_TOOLS.iter().map(|(name, _)| name.to_string()).collect(),
        exit_immediately: false,
        no_handshake: false,
        linger: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--tools" => {
                options.tools = args
                    .next()
                    .unwrap_or_default()
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "--exit-immediately" => options.exit_immediately = true,
            "--no-handshake" => options.no_handshake = true,
            "--linger" => options.linger = true,
            other => eprintln!("mock: ignoring unknown flag {other}"),
        }
    }
    options
}

type Out = Arc<Mutex<io::Stdout>>;

fn send(out: &Out, message: &Value) {
    send_raw(out, &message.to_string());
}

fn send_raw(out: &Out, line: &str) {
    let mut stdout = out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

fn result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error(id: &Value, code: i64, message: &str, data: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message, "data": data } })
}

fn tool_list(options: &Options) -> Value {
    let tools: Vec<Value> = options
        .tools
        .iter()
        .map(|name| {
            let description = BUILTIN_TOOLS
                .iter()
                .find(|(builtin, _)| builtin == name)
                .map(|(_, description)| *description)
                .unwrap_or("Echoes its arguments");
            json!({
                "name": name,
                "description": description,
                "inputSchema": { "type": "object" }
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn call_tool(out: Out, id: Value, name: String, arguments: Value) {
    match name.as_str() {
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            let tag = arguments.get("tag").cloned().unwrap_or(Value::Null);
            send(&out, &result(&id, json!({ "slept": ms, "tag": tag })));
        }
        "fail" => send(
            &out,
            &result(
                &id,
                json!({
                    "isError": true,
                    "content": [{ "type": "text", "text": "the backend refused the request" }],
                    "error": { "message": "the backend refused the request", "kind": "upstream", "tool": "fail" }
                }),
            ),
        ),
        "rpc_error" => send(
            &out,
            &error(&id, -32000, "tool exploded", json!({ "tool": "rpc_error" })),
        ),
        "garbage" => {
            send_raw(&out, "this line is not JSON");
            send(&out, &result(&id, json!({ "after": "garbage" })));
        }
        "never" => {}
        "exit" => {
            eprintln!("mock: exiting on request");
            std::process::exit(0);
        }
        _ => send(
            &out,
            &result(
                &id,
                json!({
                    "content": [{ "type": "text", "text": arguments.to_string() }],
                    "structuredContent": arguments
                }),
            ),
        ),
    }
}

fn main() {
    let options = parse_options();
    if options.exit_immediately {
        eprintln!("mock: refusing to start");
        std::process::exit(3);
    }
    eprintln!("mock: serving {} tools", options.tools.len());

    let out: Out = Arc::new(Mutex::new(io::stdout()));
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() || options.no_handshake {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock: undecodable request {line}");
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => send(
                &out,
                &result(
                    &id,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "serverInfo": { "name": "mock-tool-server", "version": "1.0.0" },
                        "capabilities": { "tools": { "listChanged": true } },
                        "instructions": "Use echo to test connectivity."
                    }),
                ),
            ),
            "tools/list" => send(&out, &result(&id, tool_list(&options))),
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !options.tools.contains(&name) {
                    send(
                        &out,
                        &error(&id, -32602, "unknown tool", json!({ "tool": name })),
                    );
                    continue;
                }
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                let out = Arc::clone(&out);
                thread::spawn(move || call_tool(out, id, name, arguments));
            }
            "ping" => send(&out, &result(&id, json!({}))),
            other => send(&out, &error(&id, -32601, "method not found", json!({ "method": other }))),
        }
    }

    if options.linger {
        eprintln!("mock: stdin closed, lingering");
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
}
