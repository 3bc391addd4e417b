//! Host-tagged output.
//!
//! Every host task writes through the same [`LineSink`]. The sink serializes
//! whole lines, so output from concurrent hosts interleaves by line and never
//! mid-line. Stdout and stderr of a remote command go through the same path.

use std::io::Write;
use std::sync::{Arc, Mutex};

enum Target {
    Stdout,
    Capture(Vec<String>),
}

/// A synchronized sink that accepts complete lines.
#[derive(Clone)]
pub struct LineSink {
    target: Arc<Mutex<Target>>,
}

impl LineSink {
    /// A sink writing to the process's stdout.
    pub fn stdout() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Stdout)),
        }
    }

    /// A sink keeping lines in memory, see [`LineSink::lines`].
    pub fn capture() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Capture(Vec::new()))),
        }
    }

    /// Write one line atomically. A trailing newline is added.
    pub fn write_line(&self, line: &str) {
        let mut target = match self.target.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &mut *target {
            Target::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", line);
                let _ = out.flush();
            }
            Target::Capture(lines) => lines.push(line.to_string()),
        }
    }

    /// Lines captured so far. Empty for a stdout sink.
    pub fn lines(&self) -> Vec<String> {
        let target = match self.target.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &*target {
            Target::Stdout => Vec::new(),
            Target::Capture(lines) => lines.clone(),
        }
    }

    /// Output handle that prefixes every line with `[{name}] `.
    pub fn for_host(&self, name: impl Into<String>) -> HostOutput {
        HostOutput {
            name: name.into(),
            sink: self.clone(),
        }
    }
}

impl std::fmt::Debug for LineSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineSink").finish_non_exhaustive()
    }
}

/// A [`LineSink`] bound to one host name.
#[derive(Debug, Clone)]
pub struct HostOutput {
    name: String,
    sink: LineSink,
}

impl HostOutput {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write one line prefixed with the host name.
    pub fn line(&self, text: &str) {
        self.sink.write_line(&format!("[{}] {}", self.name, text));
    }

    /// Write every line of `text`, each prefixed with the host name.
    pub fn lines(&self, text: &str) {
        for line in text.lines() {
            self.line(line);
        }
    }

    /// A line-splitting writer for a byte stream from this host.
    pub fn writer(&self) -> HostWriter {
        HostWriter {
            output: self.clone(),
            pending: Vec::new(),
        }
    }
}

/// Splits a byte stream into lines and forwards them to a [`HostOutput`].
///
/// A partial line is held until its newline arrives or [`HostWriter::flush`]
/// is called.
pub struct HostWriter {
    output: HostOutput,
    pending: Vec<u8>,
}

impl HostWriter {
    pub fn write(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
    }

    /// Forward any trailing partial line.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
    }

    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        self.output.line(text.trim_end_matches('\r'));
    }
}

impl Drop for HostWriter {
    fn drop(&mut self) {
        self.flush();
    }
}
