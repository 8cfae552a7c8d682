use anyhow::Result;

/// Accumulates a chunked byte stream and hands out complete lines.
///
/// Lines may straddle chunk boundaries, including inside a multi-byte
/// character; bytes are only decoded once the terminating `\n` has arrived.
#[derive(Debug, Default)]
pub struct LineBuffer {
    bytes: Vec<u8>,
    /// Prefix of `bytes` already known to contain no newline
    scanned: usize,
}

impl LineBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            scanned: 0,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Next complete line, trimmed; `None` until a newline arrives
    pub fn next_line(&mut self) -> Option<Result<String>> {
        let offset = self.bytes[self.scanned..].iter().position(|&b| b == b'\n');
        let Some(offset) = offset else {
            self.scanned = self.bytes.len();
            return None;
        };
        let end = self.scanned + offset;
        let line: Vec<u8> = self.bytes.drain(..=end).collect();
        self.scanned = 0;

        Some(
            String::from_utf8(line)
                .map(|s| s.trim().to_string())
                .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in stream: {}", e)),
        )
    }

    /// Whatever is left without a trailing newline
    pub fn take_remainder(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.bytes);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
