//! Minimal DAP backend used by integration tests.
//!
//! Usage: `fake_backend [--port N] [--straggler]`. Speaks DAP on stdio, or on a TCP port
//! when `--port` is given. With `--straggler` a `sleep` process is left behind in its own
//! process group, carrying the inherited environment.

use aidb::dap::transport::{FramedReader, MessageReader};
use serde_json::{json, Value};
use std::env;
use std::io::{BufReader, Read, Write};
use std::net::TcpListener;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

struct Output {
    out: Box<dyn Write>,
    seq: i64,
}

impl Output {
    fn send(&mut self, mut message: Value) {
        self.seq += 1;
        message["seq"] = json!(self.seq);
        let payload = serde_json::to_vec(&message).unwrap();
        write!(self.out, "Content-Length: {}\r\n\r\n", payload.len()).unwrap();
        self.out.write_all(&payload).unwrap();
        self.out.flush().unwrap();
    }

    fn respond(&mut self, request: &Value, body: Value) {
        self.send(json!({
            "type": "response",
            "request_seq": request["seq"],
            "success": true,
            "command": request["command"],
            "body": body,
        }));
    }

    fn event(&mut self, event: &str, body: Value) {
        self.send(json!({ "type": "event", "event": event, "body": body }));
    }
}

pub fn main() {
    let args: Vec<String> = env::args().collect();
    let port = args
        .iter()
        .position(|a| a == "--port")
        .map(|i| args[i + 1].parse::<u16>().unwrap());

    if args.iter().any(|a| a == "--straggler") {
        Command::new("sleep")
            .arg("30")
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
    }

    let (input, out): (Box<dyn Read + Send>, Box<dyn Write>) = match port {
        Some(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
            let (stream, _) = listener.accept().unwrap();
            (Box::new(stream.try_clone().unwrap()), Box::new(stream))
        }
        None => (Box::new(std::io::stdin()), Box::new(std::io::stdout())),
    };
    let mut reader = FramedReader::new(BufReader::new(input), None);
    let mut output = Output { out, seq: 0 };
    let mut pending_launch = None;

    while let Ok(request) = reader.read_message() {
        match request["command"].as_str().unwrap_or_default() {
            "initialize" => {
                output.respond(&request, json!({ "supportsConfigurationDoneRequest": true }))
            }
            "launch" | "attach" => {
                pending_launch = Some(request);
                output.event("initialized", json!({}));
            }
            "setBreakpoints" => {
                let breakpoints: Vec<Value> = request["arguments"]["breakpoints"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .enumerate()
                    .map(|(i, bp)| json!({ "id": i + 1, "verified": true, "line": bp["line"] }))
                    .collect();
                output.respond(&request, json!({ "breakpoints": breakpoints }));
            }
            "configurationDone" => {
                output.respond(&request, json!({}));
                if let Some(launch) = pending_launch.take() {
                    output.respond(&launch, json!({}));
                }
            }
            "disconnect" => {
                output.respond(&request, json!({}));
                return;
            }
            _ => output.respond(&request, json!({})),
        }
    }
}
