use crate::error::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

/// Appends DAP traffic to a file, one JSON message per line.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
}

impl FileTracer {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn line(&self, text: &str) {
        let mut file = self.file.lock();
        _ = writeln!(file, "{text}");
    }

    /// Message sent to a backend.
    pub fn outgoing(&self, payload: &[u8]) {
        self.line(&format!("-> {}", String::from_utf8_lossy(payload)));
    }

    /// Message received from a backend.
    pub fn incoming(&self, payload: &[u8]) {
        self.line(&format!("<- {}", String::from_utf8_lossy(payload)));
    }
}

impl std::fmt::Debug for FileTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileTracer")
    }
}
