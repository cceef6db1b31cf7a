//! Rebuilds whole lines from arbitrarily chunked process output.
//!
//! One reassembler serves one channel. Bytes are buffered until a `\n`
//! arrives, so neither a line nor a multi-byte UTF-8 character is split by
//! chunk boundaries. Segments are trimmed and empty ones are dropped.

use testcast_core::{Channel, OutputLine};

#[derive(Debug)]
pub struct LineReassembler {
    channel: Channel,
    pending: Vec<u8>,
}

impl LineReassembler {
    pub const fn new(channel: Channel) -> Self {
        Self {
            channel,
            pending: Vec::new(),
        }
    }

    /// Append a chunk and return every line it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<OutputLine> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|&b| b == b'\n')
            .filter_map(|segment| self.make_line(segment))
            .collect()
    }

    /// Emit whatever is left once the stream has ended.
    pub fn flush(&mut self) -> Option<OutputLine> {
        let rest = std::mem::take(&mut self.pending);
        self.make_line(&rest)
    }

    fn make_line(&self, segment: &[u8]) -> Option<OutputLine> {
        let text = String::from_utf8_lossy(segment);
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(OutputLine::now(text, self.channel))
        }
    }
}
