//! Frame boundary handling (spec.md Section 4.3, Section 6).
//!
//! The source terminates server-direction traffic with `0x0B` and worker
//! traffic with `0x0A`, but a single connection carries both directions
//! over the one socket and nothing in the protocol negotiates which byte
//! is in force. We resolve this by sniffing: the first terminator byte
//! (`0x0A` or `0x0B`) seen on a connection, in either direction, becomes
//! that connection's terminator for the rest of its life. Until a
//! terminator has been observed, outgoing frames default to `0x0B`
//! (the server-direction byte), since the order-creating and subscribing
//! clients always speak first.

pub const SERVER_DIRECTION_TERMINATOR: u8 = 0x0B;
pub const WORKER_DIRECTION_TERMINATOR: u8 = 0x0A;

fn is_terminator(b: u8) -> bool {
    b == SERVER_DIRECTION_TERMINATOR || b == WORKER_DIRECTION_TERMINATOR
}

/// Incrementally decodes a byte stream into terminator-delimited frames,
/// pinning the terminator byte the first time one is observed.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    terminator: Option<u8>,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminator(&self) -> u8 {
        self.terminator.unwrap_or(SERVER_DIRECTION_TERMINATOR)
    }

    /// Feed newly-read bytes in, returning any frames (terminator
    /// stripped) that are now complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            let terminator = match self.terminator {
                Some(t) => t,
                None => match self.buf.iter().position(|&b| is_terminator(b)) {
                    Some(pos) => {
                        let t = self.buf[pos];
                        self.terminator = Some(t);
                        t
                    }
                    None => break,
                },
            };

            match self.buf.iter().position(|&b| b == terminator) {
                Some(pos) => {
                    let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
                    frame.pop();
                    frames.push(frame);
                }
                None => break,
            }
        }

        frames
    }
}

/// Encode a single frame's payload with the connection's current
/// terminator.
pub fn encode_frame(payload: &[u8], terminator: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.extend_from_slice(payload);
    out.push(terminator);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_single_frame() {
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(b"{\"command\":\"OrderAssign\"}\x0B");
        assert_eq!(frames, vec![b"{\"command\":\"OrderAssign\"}".to_vec()]);
    }

    #[test]
    fn pins_the_first_terminator_seen() {
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(b"abc").is_empty());
        let frames = dec.feed(b"\nrest\x0B");
        assert_eq!(frames, vec![b"abc".to_vec()]);
        assert_eq!(dec.terminator(), WORKER_DIRECTION_TERMINATOR);
        // \x0B no longer terminates; it's just a byte now.
        assert!(dec.feed(b"").is_empty());
    }

    #[test]
    fn splits_multiple_frames_fed_at_once() {
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(b"one\x0Btwo\x0Bthr");
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        let rest = dec.feed(b"ee\x0B");
        assert_eq!(rest, vec![b"three".to_vec()]);
    }

    #[test]
    fn default_terminator_before_anything_observed_is_server_direction() {
        let dec = FrameDecoder::new();
        assert_eq!(dec.terminator(), SERVER_DIRECTION_TERMINATOR);
    }
}
