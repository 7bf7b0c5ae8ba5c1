#![allow(dead_code)]

//! Scripted fake DAP backend.

use aidb::dap::client::{ClientOptions, ProtocolClient};
use aidb::dap::transport::Transport;
use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// What the backend does after handling a request.
pub enum Flow {
    Continue,
    Close,
}

/// Server side of one backend connection.
pub struct Peer {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    seq: i64,
}

impl Peer {
    fn new(stream: TcpStream) -> anyhow::Result<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            seq: 1,
        })
    }

    fn next_seq(&mut self) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Next message, `None` when the client closed the connection.
    pub fn read_message(&mut self) -> anyhow::Result<Option<Value>> {
        let mut content_length = None;
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(value.trim().parse::<usize>()?);
            }
        }
        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(Some(serde_json::from_slice(&buf)?))
    }

    pub fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.write_raw(format!("Content-Length: {}\r\n\r\n", payload.len()).as_bytes())?;
        self.write_raw(&payload)
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn respond(&mut self, request: &Value, success: bool, body: Value) -> anyhow::Result<()> {
        let seq = self.next_seq();
        let mut response = json!({
            "seq": seq,
            "type": "response",
            "request_seq": request["seq"],
            "success": success,
            "command": request["command"],
            "body": body,
        });
        if !success {
            response["message"] = body
                .get("message")
                .cloned()
                .unwrap_or_else(|| json!("request failed"));
        }
        self.write_message(&response)
    }

    pub fn ok(&mut self, request: &Value) -> anyhow::Result<()> {
        self.respond(request, true, json!({}))
    }

    pub fn event(&mut self, event: &str, body: Value) -> anyhow::Result<()> {
        let seq = self.next_seq();
        self.write_message(&json!({
            "seq": seq,
            "type": "event",
            "event": event,
            "body": body,
        }))
    }

    /// Send a reverse request and read the client's answer.
    pub fn reverse_request(&mut self, command: &str, arguments: Value) -> anyhow::Result<Value> {
        let seq = self.next_seq();
        self.write_message(&json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        }))?;
        loop {
            let msg = self
                .read_message()?
                .ok_or_else(|| anyhow!("connection closed before reverse response"))?;
            if msg["type"] == "response" && msg["request_seq"] == json!(seq) {
                return Ok(msg);
            }
        }
    }
}

pub type Script = Box<dyn FnMut(&Value, &mut Peer) -> anyhow::Result<Flow> + Send>;

/// Backend accepting a single connection and answering requests with a script.
pub struct FakeBackend {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FakeBackend {
    pub fn start(
        script: impl FnMut(&Value, &mut Peer) -> anyhow::Result<Flow> + Send + 'static,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("bind fake backend")?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(vec![]));
        let mut script: Script = Box::new(script);

        let thread = thread::spawn({
            let requests = requests.clone();
            move || {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                let Ok(mut peer) = Peer::new(stream) else {
                    return;
                };
                while let Ok(Some(request)) = peer.read_message() {
                    requests.lock().unwrap().push(request.clone());
                    match script(&request, &mut peer) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) | Err(_) => return,
                    }
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            thread: Some(thread),
        })
    }

    /// Backend that completes the handshake, verifies every breakpoint and stops on `pause`.
    pub fn standard() -> anyhow::Result<Self> {
        Self::start(standard_script())
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r["command"].as_str().map(ToOwned::to_owned))
            .collect()
    }

    pub fn request(&self, command: &str) -> Option<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .find(|r| r["command"] == command)
            .cloned()
    }

    /// Wait until `command` was received.
    pub fn wait_for(&self, command: &str) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if self.request(command).is_some() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// Wait for the connection to end.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            _ = thread.join();
        }
    }
}

pub fn standard_script() -> impl FnMut(&Value, &mut Peer) -> anyhow::Result<Flow> + Send {
    let mut pending_launch: Option<Value> = None;
    move |request, peer| {
        match request["command"].as_str().unwrap_or_default() {
            "initialize" => peer.respond(
                request,
                true,
                json!({ "supportsConfigurationDoneRequest": true }),
            )?,
            "launch" | "attach" => {
                pending_launch = Some(request.clone());
                peer.event("initialized", json!({}))?;
            }
            "setBreakpoints" => {
                let breakpoints: Vec<Value> = request["arguments"]["breakpoints"]
                    .as_array()
                    .map(|bps| {
                        bps.iter()
                            .enumerate()
                            .map(|(i, bp)| json!({ "id": i + 1, "verified": true, "line": bp["line"] }))
                            .collect()
                    })
                    .unwrap_or_default();
                peer.respond(request, true, json!({ "breakpoints": breakpoints }))?;
            }
            "configurationDone" => {
                peer.ok(request)?;
                if let Some(launch) = pending_launch.take() {
                    peer.ok(&launch)?;
                }
            }
            "pause" => {
                peer.ok(request)?;
                peer.event("stopped", json!({ "reason": "pause", "threadId": 1 }))?;
            }
            "continue" => {
                peer.respond(request, true, json!({ "allThreadsContinued": true }))?;
                peer.event("continued", json!({ "threadId": 1 }))?;
            }
            "disconnect" => {
                peer.ok(request)?;
                return Ok(Flow::Close);
            }
            _ => peer.ok(request)?,
        }
        Ok(Flow::Continue)
    }
}

/// Protocol client connected to `backend`.
pub fn connect(backend: &FakeBackend) -> anyhow::Result<Arc<ProtocolClient>> {
    let transport = Transport::connect(backend.addr(), TIMEOUT, None, || Ok(()))?;
    Ok(ProtocolClient::start(
        transport,
        ClientOptions {
            name: "test".to_string(),
            request_timeout: TIMEOUT,
        },
    )?)
}

/// Poll `cond` until it holds or the test timeout expires.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}
