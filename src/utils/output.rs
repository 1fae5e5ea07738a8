/// Bounded line collection from an untrusted stream
///
/// The pipeline's stdout is read line by line; a single line never grows past
/// the configured limit no matter what the other side writes.
use std::fmt;
use std::io::{BufRead, BufReader, Read};

/// Default per-line ceiling for protocol messages
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Whether a line arrived whole
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineIntegrity {
    Complete,
    /// The line exceeded the limit; the remainder up to the newline was discarded.
    Truncated,
}

impl fmt::Display for LineIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineIntegrity::Complete => write!(f, "complete"),
            LineIntegrity::Truncated => write!(f, "truncated"),
        }
    }
}

/// One collected line, without its trailing newline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundedLine {
    pub bytes: Vec<u8>,
    pub integrity: LineIntegrity,
}

impl BoundedLine {
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Line reader with a hard per-line ceiling
pub struct BoundedLineReader<R: Read> {
    reader: BufReader<R>,
    max_line: usize,
    total_bytes: u64,
}

impl<R: Read> BoundedLineReader<R> {
    pub fn new(stream: R, max_line: usize) -> Self {
        BoundedLineReader {
            reader: BufReader::new(stream),
            max_line: max_line.max(1),
            total_bytes: 0,
        }
    }

    /// Bytes consumed from the stream so far
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Next line, `Ok(None)` at EOF
    pub fn next_line(&mut self) -> std::io::Result<Option<BoundedLine>> {
        let mut line = Vec::new();
        let mut integrity = LineIntegrity::Complete;
        let mut saw_any = false;

        loop {
            let available = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                break;
            }
            saw_any = true;

            let (chunk, found_newline) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (&available[..pos], true),
                None => (available, false),
            };

            let room = self.max_line.saturating_sub(line.len());
            if chunk.len() > room {
                line.extend_from_slice(&chunk[..room]);
                integrity = LineIntegrity::Truncated;
            } else {
                line.extend_from_slice(chunk);
            }

            let consumed = chunk.len() + usize::from(found_newline);
            self.reader.consume(consumed);
            self.total_bytes += consumed as u64;

            if found_newline {
                break;
            }
        }

        if !saw_any {
            return Ok(None);
        }

        if line.last() == Some(&b'\r') {
            line.pop();
        }

        Ok(Some(BoundedLine {
            bytes: line,
            integrity,
        }))
    }
}
