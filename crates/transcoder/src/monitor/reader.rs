//! Record reader for the engine's piped output.
//!
//! ffmpeg rewrites its stats line with bare carriage returns, so a plain
//! line reader only surfaces progress once the run ends. Records here end at
//! `\n`, `\r` or `\r\n`, and overlong records are cut at [`MAX_RECORD_LEN`].

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Longest record kept before it is flushed without a delimiter.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Yields trimmed, non-empty text records straight out of the read buffer.
pub struct RecordReader<R> {
    reader: BufReader<R>,
    record: Vec<u8>,
    /// The previous record ended in `\r`; a `\n` right after it is part of
    /// the same terminator.
    after_cr: bool,
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            record: Vec::new(),
            after_cr: false,
        }
    }

    /// Next record, or `None` at end of stream.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(take_text(&mut self.record));
            }

            if self.after_cr {
                self.after_cr = false;
                if available[0] == b'\n' {
                    self.reader.consume(1);
                    continue;
                }
            }

            let room = MAX_RECORD_LEN - self.record.len();
            let window = &available[..available.len().min(room)];
            let (consumed, terminated) = match window.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                Some(idx) => {
                    self.after_cr = window[idx] == b'\r';
                    self.record.extend_from_slice(&window[..idx]);
                    (idx + 1, true)
                }
                None => {
                    self.record.extend_from_slice(window);
                    (window.len(), false)
                }
            };
            self.reader.consume(consumed);

            if terminated || self.record.len() >= MAX_RECORD_LEN {
                if let Some(text) = take_text(&mut self.record) {
                    return Ok(Some(text));
                }
            }
        }
    }
}

fn take_text(record: &mut Vec<u8>) -> Option<String> {
    let text = String::from_utf8_lossy(record).trim().to_string();
    record.clear();
    (!text.is_empty()).then_some(text)
}
