//! Container header detection
//!
//! Publishers often deliver a few fragments before the container header, or
//! split the header across messages. Nothing reaches the transcoder until the
//! accumulated bytes begin with the expected magic signature.

/// EBML magic that opens every Matroska / WebM stream
pub const EBML_SIGNATURE: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSniffer {
    signature: Vec<u8>,
}

impl Default for HeaderSniffer {
    fn default() -> Self {
        HeaderSniffer::new(EBML_SIGNATURE.to_vec())
    }
}

impl HeaderSniffer {
    pub fn new(signature: Vec<u8>) -> Self {
        HeaderSniffer { signature }
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// True when `buffer` is at least as long as the signature and starts with it.
    pub fn matches(&self, buffer: &[u8]) -> bool {
        buffer.len() >= self.signature.len() && buffer.starts_with(&self.signature)
    }

    /// Offset of the first byte that could still begin a valid container.
    ///
    /// Everything before the offset can be dropped: no amount of further data
    /// would make a buffer starting there match. Returns `buffer.len()` when
    /// no suffix is a candidate.
    pub fn resync_offset(&self, buffer: &[u8]) -> usize {
        (0..buffer.len())
            .find(|&start| {
                let tail = &buffer[start..];
                tail.starts_with(&self.signature) || self.signature.starts_with(tail)
            })
            .unwrap_or(buffer.len())
    }
}

/// Chunks received before the header is confirmed
#[derive(Debug, Default)]
pub struct HeaderBuffer {
    chunks: Vec<Vec<u8>>,
    len: usize,
}

impl HeaderBuffer {
    pub fn push(&mut self, chunk: Vec<u8>) {
        self.len += chunk.len();
        self.chunks.push(chunk);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop leading bytes that can no longer start a container, then report a match.
    pub fn sniff(&mut self, sniffer: &HeaderSniffer) -> bool {
        if self.chunks.len() > 1 {
            let joined = self.chunks.concat();
            self.chunks = vec![joined];
        }
        let Some(buffer) = self.chunks.first_mut() else {
            return false;
        };

        let skip = sniffer.resync_offset(buffer);
        if skip > 0 {
            log::debug!("Discarding {} bytes ahead of container header", skip);
            buffer.drain(..skip);
            self.len -= skip;
        }
        sniffer.matches(buffer)
    }

    /// Hand over the buffered bytes, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        self.len = 0;
        std::mem::take(&mut self.chunks).concat()
    }
}
