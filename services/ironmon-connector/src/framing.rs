//! IronMON TCP wire framing (§6): ASCII `"LEN SP JSON"`, where `LEN` is the
//! decimal byte length of the `JSON` token that follows a single space.
//! Consecutive messages may be concatenated in one packet, and a message may
//! arrive split across several reads — `FrameParser` buffers across both.

const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Incremental parser over a growing byte buffer. Owns no socket; `push`
/// feeds it raw bytes from a read, `drain_messages` pulls out every
/// complete frame currently available.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull out every complete message currently buffered. Partial data
    /// (no space yet, or not enough bytes for the declared length) is left
    /// in place for the next call. A non-numeric or over-cap length prefix
    /// is invalid: the buffer advances past it (including the separating
    /// space) and parsing continues with whatever follows.
    pub fn drain_messages(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let Some(space_idx) = self.buf.iter().position(|&b| b == b' ') else { break };
            let len_str = &self.buf[..space_idx];
            let parsed_len = std::str::from_utf8(len_str).ok().and_then(|s| s.parse::<usize>().ok());

            match parsed_len {
                Some(len) if len <= MAX_MESSAGE_BYTES => {
                    let start = space_idx + 1;
                    if self.buf.len() < start + len {
                        break;
                    }
                    let message = self.buf[start..start + len].to_vec();
                    self.buf.drain(..start + len);
                    out.push(message);
                }
                _ => {
                    self.buf.drain(..=space_idx);
                }
            }
        }
        out
    }
}
