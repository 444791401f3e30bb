//! Incremental framing negotiation.
//!
//! The handshake never blocks. The transport feeds whatever the socket produced
//! this pass into [`Negotiation::advance`], which either settles on a codec or
//! hands back the state to resume from on the next pass.
//!
//! Step bounds:
//!
//! * Initiator: send key, receive key.
//! * Responder: detect, receive key, send key.
//!
//! Anything the peer sent beyond the handshake stays in the inbound wire buffer
//! for the chosen codec to decode.

use super::error::HandshakeError;
use super::obfuscated::{KeyExchange, PUBLIC_KEY_LEN};
use super::plain::{detect, Detection, PlainCodec};
use super::state::{FramingMode, Origin};
use super::Codec;
use crate::connection::EncryptionPolicy;
use bytes::{BufMut, BytesMut};

/// Where a negotiation currently stands.
#[derive(Debug)]
pub(crate) enum Negotiation {
    /// Initiator. Our key is queued, waiting on the responder's.
    AwaitingResponderKey(KeyExchange),
    /// Responder. Waiting on enough leading bytes to classify the stream.
    Detecting,
    /// Responder. Obfuscated framing detected, waiting on the full initiator key.
    AwaitingInitiatorKey,
}

/// Result of advancing a negotiation.
#[derive(Debug)]
pub(crate) enum Progress {
    /// Not done yet, resume from this state once more bytes arrive.
    Pending(Negotiation),
    /// Framing is settled.
    Established(Codec),
}

/// Inputs that stay fixed for the whole negotiation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Context<'a> {
    pub origin: Origin,
    pub policy: EncryptionPolicy,
    pub plaintext_header: &'a [u8],
}

impl Context<'_> {
    fn check(&self, detected: FramingMode) -> Result<(), HandshakeError> {
        if self.policy.allows(detected) {
            Ok(())
        } else {
            Err(HandshakeError::PolicyViolation {
                policy: self.policy,
                detected,
            })
        }
    }
}

/// Start negotiating.
///
/// Outbound connections propose obfuscated framing unless the policy is
/// plaintext only, in which case the plain codec is settled right away.
/// Inbound connections always start by waiting on the peer.
pub(crate) fn begin(ctx: Context<'_>, wire_out: &mut BytesMut) -> Progress {
    match (ctx.origin, ctx.policy) {
        (Origin::Outbound, EncryptionPolicy::PlainOnly) => {
            Progress::Established(Codec::Plain(PlainCodec))
        }
        (Origin::Outbound, _) => {
            let exchange = KeyExchange::new(ctx.plaintext_header.first().copied());
            wire_out.put_slice(&exchange.public_bytes());
            log::debug!("Proposing obfuscated framing");
            Progress::Pending(Negotiation::AwaitingResponderKey(exchange))
        }
        (Origin::Inbound, _) => Progress::Pending(Negotiation::Detecting),
    }
}

impl Negotiation {
    /// Advance with the bytes buffered in `wire_in`.
    ///
    /// Handshake bytes are consumed from `wire_in`, any reply is appended to
    /// `wire_out`. Bytes that belong to the application are left in `wire_in`.
    pub(crate) fn advance(
        self,
        ctx: Context<'_>,
        wire_in: &mut BytesMut,
        wire_out: &mut BytesMut,
    ) -> Result<Progress, HandshakeError> {
        let mut state = self;
        loop {
            state = match state {
                Negotiation::Detecting => match detect(ctx.plaintext_header, wire_in) {
                    Detection::NeedMore => return Ok(Progress::Pending(Negotiation::Detecting)),
                    Detection::Plain => {
                        ctx.check(FramingMode::Plain)?;
                        return Ok(Progress::Established(Codec::Plain(PlainCodec)));
                    }
                    Detection::Obfuscated => {
                        ctx.check(FramingMode::Obfuscated)?;
                        Negotiation::AwaitingInitiatorKey
                    }
                },
                Negotiation::AwaitingInitiatorKey => {
                    if wire_in.len() < PUBLIC_KEY_LEN {
                        return Ok(Progress::Pending(Negotiation::AwaitingInitiatorKey));
                    }
                    let remote = wire_in.split_to(PUBLIC_KEY_LEN);
                    let exchange = KeyExchange::new(None);
                    wire_out.put_slice(&exchange.public_bytes());
                    let codec = exchange.complete(Origin::Inbound, &remote)?;
                    return Ok(Progress::Established(Codec::Obfuscated(codec)));
                }
                Negotiation::AwaitingResponderKey(exchange) => {
                    if wire_in.len() < PUBLIC_KEY_LEN {
                        return Ok(Progress::Pending(Negotiation::AwaitingResponderKey(
                            exchange,
                        )));
                    }
                    let remote = wire_in.split_to(PUBLIC_KEY_LEN);
                    let codec = exchange.complete(Origin::Outbound, &remote)?;
                    return Ok(Progress::Established(Codec::Obfuscated(codec)));
                }
            };
        }
    }
}
