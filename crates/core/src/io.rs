//! Console narrative output
//!
//! stdout carries only the per-stage progress narrative and the final
//! failure line; diagnostics go to stderr through `tracing` and the full
//! detail lands in the event log. Every line is redacted before it is
//! written.

use crate::redaction::RedactionConfig;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Shared, cloneable handle to the console writer
#[derive(Clone)]
pub struct Console {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    redaction: RedactionConfig,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

impl Console {
    /// Console writing to stdout
    pub fn stdout(redaction: RedactionConfig) -> Self {
        Self::with_writer(Box::new(io::stdout()), redaction)
    }

    /// Console writing to an arbitrary sink
    pub fn with_writer(writer: Box<dyn Write + Send>, redaction: RedactionConfig) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            redaction,
        }
    }

    /// Console that discards output
    pub fn sink() -> Self {
        Self::with_writer(Box::new(io::sink()), RedactionConfig::default())
    }

    /// Console capturing into a shared buffer, returned alongside it
    pub fn buffer() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        (
            Self::with_writer(Box::new(captured.clone()), RedactionConfig::default()),
            captured,
        )
    }

    /// Announce a stage
    pub fn stage(&self, title: &str) {
        self.line(&format!("==> {}", title));
    }

    /// Report a skipped stage
    pub fn skipped(&self, title: &str, reason: &str) {
        self.line(&format!("==> {} (skipped: {})", title, reason));
    }

    /// Single human-readable failure line
    pub fn failure(&self, title: &str, message: &str) {
        self.line(&format!("!!! {} failed: {}", title, message));
    }

    /// Write a plain line
    pub fn line(&self, text: &str) {
        let text = self.redaction.redact(text);
        if let Ok(mut writer) = self.writer.lock() {
            // Console output is best-effort; a closed stdout must not fail the job
            let _ = writeln!(writer, "{}", text);
            let _ = writer.flush();
        }
    }
}

/// In-memory console sink shared between clones
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    /// Everything written so far
    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "console buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redaction::SecretRegistry;

    #[test]
    fn test_stage_narrative() {
        let (console, captured) = Console::buffer();
        console.stage("Build");
        console.skipped("Before deploy", "no steps configured");
        console.failure("Deploy", "stage failed");

        let output = captured.contents();
        assert_eq!(
            output,
            "==> Build\n==> Before deploy (skipped: no steps configured)\n!!! Deploy failed: stage failed\n"
        );
    }

    #[test]
    fn test_console_redacts() {
        let registry = SecretRegistry::new();
        registry.add_secret("letmein99");
        let captured = CapturedOutput::default();
        let console = Console::with_writer(
            Box::new(captured.clone()),
            RedactionConfig::with_registry(registry),
        );
        console.line("password letmein99");
        assert_eq!(captured.contents(), "password ****\n");
    }
}
