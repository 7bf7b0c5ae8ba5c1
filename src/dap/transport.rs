//! DAP transport layer.
//! Supports backends speaking over TCP and over subprocess stdio.

use crate::dap::tracer::FileTracer;
use crate::error::{Error, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::process::{ChildStdin, ChildStdout};
use std::thread;
use std::time::{Duration, Instant};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);
const CONTENT_LENGTH: &str = "Content-Length:";
/// Upper bound for a single message body.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Receiving half of a transport.
pub trait MessageReader: Send {
    /// Read a single DAP message (with Content-Length framing).
    fn read_message(&mut self) -> Result<Value>;
}

/// Sending half of a transport.
pub trait MessageWriter: Send {
    /// Write a single DAP message (with Content-Length framing).
    fn write_message(&mut self, message: &Value) -> Result<()>;

    /// Close the channel, a reader blocked on the other half must wake up.
    fn shutdown(&mut self);
}

/// Bidirectional byte channel carrying framed DAP messages.
pub struct Transport {
    pub reader: Box<dyn MessageReader>,
    pub writer: Box<dyn MessageWriter>,
}

impl Transport {
    /// Wrap a connected TCP stream.
    pub fn tcp(stream: TcpStream, tracer: Option<FileTracer>) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader = FramedReader::new(BufReader::new(stream.try_clone()?), tracer.clone());
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(TcpWriter { stream, tracer }),
        })
    }

    /// Connect to a backend that is about to start listening on `addr`.
    ///
    /// Connection is retried until `timeout` elapses. Before each retry `alive` is asked
    /// whether waiting still makes sense, an error from it aborts the connect
    /// (for example when the backend process already exited).
    pub fn connect(
        addr: SocketAddr,
        timeout: Duration,
        tracer: Option<FileTracer>,
        mut alive: impl FnMut() -> Result<()>,
    ) -> Result<Self> {
        let start = Instant::now();
        let stream = loop {
            match TcpStream::connect_timeout(&addr, timeout.min(CONNECT_ATTEMPT_TIMEOUT)) {
                Ok(stream) => break stream,
                Err(err) => {
                    alive()?;
                    if start.elapsed() > timeout {
                        return Err(Error::Connection(format!(
                            "failed to connect to {addr}: {err}"
                        )));
                    }
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        };
        log::debug!(target: "dap", "connected to backend at {addr}");
        Self::tcp(stream, tracer)
    }

    /// Use stdio pipes of a backend process.
    pub fn stdio(stdin: ChildStdin, stdout: ChildStdout, tracer: Option<FileTracer>) -> Self {
        Self {
            reader: Box::new(FramedReader::new(BufReader::new(stdout), tracer.clone())),
            writer: Box::new(StdioWriter {
                stdin: Some(stdin),
                tracer,
            }),
        }
    }
}

/// Content-Length framed message reader over any buffered byte source.
pub struct FramedReader<R> {
    reader: R,
    tracer: Option<FileTracer>,
}

impl<R: BufRead> FramedReader<R> {
    pub fn new(reader: R, tracer: Option<FileTracer>) -> Self {
        Self { reader, tracer }
    }

    fn read_frame(&mut self) -> Result<Value> {
        let mut content_length: Option<usize> = None;
        let mut first_line = true;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line).map_err(io_to_connection)?;
            if read_n == 0 {
                return Err(if first_line {
                    Error::Connection("DAP connection closed".to_string())
                } else {
                    Error::Connection("DAP connection closed inside message header".to_string())
                });
            }
            first_line = false;

            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix(CONTENT_LENGTH) {
                let len = v
                    .trim()
                    .parse()
                    .map_err(|_| Error::Protocol(format!("invalid header `{line}`")))?;
                content_length = Some(len);
            }
        }

        let len = content_length
            .ok_or_else(|| Error::Protocol("missing Content-Length header".to_string()))?;
        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "message of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|e| Error::Protocol(format!("can't allocate {len} byte message: {e}")))?;
        buf.resize(len, 0);
        self.reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::Connection("DAP connection closed inside message body".to_string())
            } else {
                io_to_connection(e)
            }
        })?;
        if let Some(tracer) = &self.tracer {
            tracer.incoming(&buf);
        }
        serde_json::from_slice(&buf).map_err(|e| Error::Protocol(format!("invalid JSON body: {e}")))
    }
}

impl<R: BufRead + Send> MessageReader for FramedReader<R> {
    fn read_message(&mut self) -> Result<Value> {
        self.read_frame()
    }
}

fn io_to_connection(e: std::io::Error) -> Error {
    Error::Connection(e.to_string())
}

fn write_frame(
    writer: &mut impl Write,
    message: &Value,
    tracer: Option<&FileTracer>,
) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    if let Some(tracer) = tracer {
        tracer.outgoing(&payload);
    }
    write_payload(writer, &payload).map_err(io_to_connection)
}

fn write_payload(writer: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    write!(writer, "{CONTENT_LENGTH} {}\r\n\r\n", payload.len())?;
    writer.write_all(payload)?;
    writer.flush()
}

struct TcpWriter {
    stream: TcpStream,
    tracer: Option<FileTracer>,
}

impl MessageWriter for TcpWriter {
    fn write_message(&mut self, message: &Value) -> Result<()> {
        write_frame(&mut self.stream, message, self.tracer.as_ref())
    }

    fn shutdown(&mut self) {
        _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct StdioWriter {
    stdin: Option<ChildStdin>,
    tracer: Option<FileTracer>,
}

impl MessageWriter for StdioWriter {
    fn write_message(&mut self, message: &Value) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Connection("backend stdin closed".to_string()))?;
        write_frame(stdin, message, self.tracer.as_ref())
    }

    fn shutdown(&mut self) {
        self.stdin.take();
    }
}

/// Writer into an in-memory buffer, mostly useful for tests and tooling.
impl MessageWriter for Vec<u8> {
    fn write_message(&mut self, message: &Value) -> Result<()> {
        write_frame(self, message, None)
    }

    fn shutdown(&mut self) {}
}
