//! Incremental UTF-8 decoding for byte streams read in arbitrary chunks.

/// Splits a byte stream into strings without cutting a UTF-8 sequence in
/// half; an incomplete trailing sequence waits for the next read.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    carry: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let cut = utf8_safe_boundary(&self.carry);
        let text = String::from_utf8_lossy(&self.carry[..cut]).into_owned();
        self.carry.drain(..cut);
        text
    }

    /// Whatever is still held back, decoded lossily.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        text
    }
}

fn utf8_safe_boundary(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(4) {
        let idx = len - back;
        let byte = buf[idx];
        if byte & 0xc0 == 0x80 {
            continue;
        }
        let width = match byte {
            b if b < 0x80 => 1,
            b if b & 0xe0 == 0xc0 => 2,
            b if b & 0xf0 == 0xe0 => 3,
            b if b & 0xf8 == 0xf0 => 4,
            _ => 1,
        };
        return if idx + width > len { idx } else { len };
    }
    len
}
