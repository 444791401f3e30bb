//! Obfuscated framing.
//!
//! Each side contributes an ephemeral X25519 key, both derive a pair of
//! directional keys with HKDF-SHA256, and every application byte afterwards
//! travels inside a ChaCha20-Poly1305 record.
//!
//! ```text
//! initiator                                responder
//!     | --- 32 byte ephemeral public key -----> |   (detected by first byte)
//!     | <-- 32 byte ephemeral public key ------ |
//!     | <============ records ================> |
//! ```
//!
//! A record is a 2 byte big-endian length followed by that many bytes of
//! ciphertext and tag. The nonce is a per-direction record counter, so records
//! must be opened in the order they were sealed, which a byte stream gives us.

use super::error::{FramingError, HandshakeError};
use super::state::Origin;
use bytes::{Buf, BufMut, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// Length of an X25519 public key on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Maximum application bytes carried by one record.
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;

const TAG_LEN: usize = 16;
const LENGTH_PREFIX_LEN: usize = 2;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const INITIATOR_KEY_INFO: &[u8] = b"swarmwire initiator to responder";
const RESPONDER_KEY_INFO: &[u8] = b"swarmwire responder to initiator";

/// One side of an ephemeral key agreement.
pub(crate) struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

// Manual Debug implementation, the secret must never end up in logs.
impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", self.public.as_bytes())
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl KeyExchange {
    /// Generate a fresh ephemeral key.
    ///
    /// If `avoid_first_byte` is set, keys whose encoding starts with that byte
    /// are discarded. Initiators pass the first plaintext header byte so that a
    /// responder can tell the two framings apart from a single byte.
    pub(crate) fn new(avoid_first_byte: Option<u8>) -> Self {
        loop {
            let secret = EphemeralSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret);
            if avoid_first_byte != Some(public.as_bytes()[0]) {
                return Self { secret, public };
            }
        }
    }

    /// Our public key as sent on the wire.
    pub(crate) fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Finish the agreement with the peer's public key and build the codec.
    ///
    /// `role` is which side of the connection we are, the outbound side is
    /// always the initiator.
    pub(crate) fn complete(
        self,
        role: Origin,
        remote: &[u8],
    ) -> Result<ObfuscatedCodec, HandshakeError> {
        let remote: [u8; PUBLIC_KEY_LEN] =
            remote.try_into().map_err(|_| HandshakeError::KeyExchange)?;
        let local = self.public_bytes();

        let shared = self.secret.diffie_hellman(&PublicKey::from(remote));
        // Low order points yield an all-zero secret.
        if !shared.was_contributory() {
            return Err(HandshakeError::KeyExchange);
        }

        let (initiator, responder) = match role {
            Origin::Outbound => (local, remote),
            Origin::Inbound => (remote, local),
        };
        let mut salt = [0u8; 2 * PUBLIC_KEY_LEN];
        salt[..PUBLIC_KEY_LEN].copy_from_slice(&initiator);
        salt[PUBLIC_KEY_LEN..].copy_from_slice(&responder);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut initiator_key = Zeroizing::new([0u8; KEY_LEN]);
        let mut responder_key = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(INITIATOR_KEY_INFO, &mut initiator_key[..])
            .map_err(|_| HandshakeError::KeyExchange)?;
        hk.expand(RESPONDER_KEY_INFO, &mut responder_key[..])
            .map_err(|_| HandshakeError::KeyExchange)?;

        Ok(match role {
            Origin::Outbound => ObfuscatedCodec::new(&initiator_key, &responder_key),
            Origin::Inbound => ObfuscatedCodec::new(&responder_key, &initiator_key),
        })
    }
}

/// Record codec for an established obfuscated connection.
pub(crate) struct ObfuscatedCodec {
    sealer: ChaCha20Poly1305,
    opener: ChaCha20Poly1305,
    send_counter: u64,
    recv_counter: u64,
}

// Manual Debug implementation because the ciphers don't implement Debug.
impl std::fmt::Debug for ObfuscatedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfuscatedCodec")
            .field("cipher", &"<chacha20poly1305>")
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish()
    }
}

impl ObfuscatedCodec {
    fn new(send_key: &[u8; KEY_LEN], recv_key: &[u8; KEY_LEN]) -> Self {
        Self {
            sealer: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            opener: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
            send_counter: 0,
            recv_counter: 0,
        }
    }

    /// Seal application bytes into records appended to `wire`.
    pub(crate) fn encode(&mut self, data: &[u8], wire: &mut BytesMut) -> Result<(), FramingError> {
        for chunk in data.chunks(MAX_RECORD_PAYLOAD) {
            let nonce = next_nonce(&mut self.send_counter)?;
            let sealed = self
                .sealer
                .encrypt(Nonce::from_slice(&nonce), chunk)
                .map_err(|_| FramingError::Encrypt)?;

            wire.reserve(LENGTH_PREFIX_LEN + sealed.len());
            wire.put_u16(sealed.len() as u16);
            wire.extend_from_slice(&sealed);
        }
        Ok(())
    }

    /// Open every complete record at the front of `wire` into `inbound`.
    ///
    /// A trailing partial record stays in `wire` until the rest arrives.
    pub(crate) fn decode(
        &mut self,
        wire: &mut BytesMut,
        inbound: &mut BytesMut,
    ) -> Result<(), FramingError> {
        while wire.len() >= LENGTH_PREFIX_LEN {
            let len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
            if len > MAX_RECORD_PAYLOAD + TAG_LEN {
                return Err(FramingError::RecordTooLarge(len));
            }
            if len < TAG_LEN {
                return Err(FramingError::Decrypt);
            }
            if wire.len() < LENGTH_PREFIX_LEN + len {
                break;
            }

            wire.advance(LENGTH_PREFIX_LEN);
            let record = wire.split_to(len);
            let nonce = next_nonce(&mut self.recv_counter)?;
            let opened = self
                .opener
                .decrypt(Nonce::from_slice(&nonce), &record[..])
                .map_err(|_| FramingError::Decrypt)?;
            inbound.extend_from_slice(&opened);
        }
        Ok(())
    }
}

fn next_nonce(counter: &mut u64) -> Result<[u8; NONCE_LEN], FramingError> {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    *counter = counter
        .checked_add(1)
        .ok_or(FramingError::NonceExhausted)?;
    Ok(nonce)
}
