//! Plaintext framing.
//!
//! Plain framing is the identity: application bytes go to the wire as-is. The
//! interesting part is on the inbound side, where we have to decide from the
//! leading bytes whether a peer speaks plaintext at all.

use bytes::{Buf, BytesMut};

/// Leading bytes of the plaintext peer-wire handshake: a length byte followed
/// by the protocol string.
pub const DEFAULT_PLAINTEXT_HEADER: &[u8] = b"\x13BitTorrent protocol";

/// Outcome of inspecting the leading bytes of an inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detection {
    /// The bytes so far are a strict prefix of the plaintext header.
    NeedMore,
    /// The complete plaintext header is present.
    Plain,
    /// The bytes diverge from the plaintext header.
    Obfuscated,
}

/// Classify the leading bytes of an inbound stream.
///
/// Only inspects `leading`, nothing is consumed. Whatever framing wins gets to
/// decode the very same bytes.
pub(crate) fn detect(header: &[u8], leading: &[u8]) -> Detection {
    let n = header.len().min(leading.len());
    if leading[..n] != header[..n] {
        Detection::Obfuscated
    } else if leading.len() >= header.len() {
        Detection::Plain
    } else {
        Detection::NeedMore
    }
}

/// Identity codec for plaintext connections.
#[derive(Debug, Default)]
pub(crate) struct PlainCodec;

impl PlainCodec {
    /// Append application bytes to the wire buffer.
    pub(crate) fn encode(&mut self, data: &[u8], wire: &mut BytesMut) {
        wire.extend_from_slice(data);
    }

    /// Move all wire bytes into the application buffer.
    pub(crate) fn decode(&mut self, wire: &mut BytesMut, inbound: &mut BytesMut) {
        inbound.extend_from_slice(wire);
        wire.advance(wire.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_plain_header() {
        let mut leading = DEFAULT_PLAINTEXT_HEADER.to_vec();
        leading.extend_from_slice(&[0u8; 8]);
        assert_eq!(detect(DEFAULT_PLAINTEXT_HEADER, &leading), Detection::Plain);
    }

    #[test]
    fn test_detect_waits_on_prefix() {
        assert_eq!(detect(DEFAULT_PLAINTEXT_HEADER, &[]), Detection::NeedMore);
        assert_eq!(
            detect(DEFAULT_PLAINTEXT_HEADER, b"\x13BitTor"),
            Detection::NeedMore
        );
    }

    #[test]
    fn test_detect_obfuscated_on_first_mismatch() {
        assert_eq!(
            detect(DEFAULT_PLAINTEXT_HEADER, &[0xa7]),
            Detection::Obfuscated
        );
        assert_eq!(
            detect(DEFAULT_PLAINTEXT_HEADER, b"\x13BitTorrent pro\xff"),
            Detection::Obfuscated
        );
    }

    #[test]
    fn test_plain_codec_passthrough() {
        let mut codec = PlainCodec;
        let mut wire = BytesMut::new();
        codec.encode(b"hello ", &mut wire);
        codec.encode(b"swarm", &mut wire);

        let mut inbound = BytesMut::new();
        codec.decode(&mut wire, &mut inbound);
        assert!(wire.is_empty());
        assert_eq!(&inbound[..], b"hello swarm");
    }
}
