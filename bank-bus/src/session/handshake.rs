//! Session handshake: mutual `Hello` exchange on the control stream.
//!
//! Both sides send their hello eagerly and then wait for the peer's, so
//! neither order deadlocks. Any failed check sends a `Goodbye` carrying
//! only a reason code and closes the connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use bank_core::capability::{verify_capability_bounds, CapabilityError, Keyring};
use bank_core::types::wire::{FrameKind, GoodbyePayload, HelloPayload, PROTOCOL_VERSION};
use bank_core::types::IntentCapability;

use crate::codec::{Frame, MuxCodec, MuxItem};
use crate::error::{BusError, Result};
use crate::replay::ReplayGuard;

use super::CONTROL_STREAM_ID;

/// Everything the handshake needs from the node.
pub(crate) struct HandshakeParams {
    pub signing: Arc<SigningKey>,
    pub keyring: Arc<Keyring>,
    pub replay: Arc<ReplayGuard>,
    pub local_capability: IntentCapability,
    pub credit_per_stream: u32,
    /// Local store dimension; 0 while still unfixed
    pub local_dim: u32,
    pub timeout: Duration,
}

/// Build and sign our hello.
fn build_hello(params: &HandshakeParams) -> HelloPayload {
    let mut hello = HelloPayload {
        protocol_version: PROTOCOL_VERSION,
        issuer_key: params.signing.verifying_key().to_bytes(),
        capability: params.local_capability.clone(),
        credit_per_stream: params.credit_per_stream,
        embedding_dim: params.local_dim,
        signature: Vec::new(),
    };
    hello.signature = params.signing.sign(&hello.signing_bytes()).to_bytes().to_vec();
    hello
}

/// Validate the peer's hello against our keyring, replay window, and
/// store dimension.
fn verify_hello(hello: &HelloPayload, params: &HandshakeParams) -> Result<()> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(BusError::UnsupportedVersion(hello.protocol_version));
    }

    let verifying_key = VerifyingKey::from_bytes(&hello.issuer_key)
        .map_err(|_| BusError::Protocol("malformed issuer key in hello".to_string()))?;
    let signature = Signature::from_slice(&hello.signature)
        .map_err(|_| BusError::Protocol("malformed hello signature".to_string()))?;
    verifying_key
        .verify(&hello.signing_bytes(), &signature)
        .map_err(|_| BusError::Protocol("hello signature does not verify".to_string()))?;

    // The presenter must be the capability's subject
    if hello.capability.subject_key != hello.issuer_key {
        return Err(BusError::Capability(CapabilityError::SignatureInvalid));
    }
    verify_capability_bounds(&hello.capability, Utc::now(), &params.keyring)?;

    if !params
        .replay
        .check_and_insert(hello.capability.issuer_key, hello.capability.nonce)
    {
        return Err(BusError::Capability(CapabilityError::SignatureInvalid));
    }

    if params.local_dim != 0
        && hello.embedding_dim != 0
        && hello.embedding_dim != params.local_dim
    {
        return Err(BusError::DimensionMismatch {
            ours: params.local_dim,
            theirs: hello.embedding_dim,
        });
    }

    if hello.credit_per_stream == 0 {
        return Err(BusError::Protocol("peer granted zero credit".to_string()));
    }
    Ok(())
}

/// Run the handshake over a fresh connection. Returns the peer's hello.
pub(crate) async fn perform(
    framed: &mut Framed<TcpStream, MuxCodec>,
    params: &HandshakeParams,
) -> Result<HelloPayload> {
    let result = tokio::time::timeout(params.timeout, async {
        let hello = build_hello(params);
        framed
            .send((CONTROL_STREAM_ID, Frame::new(FrameKind::Hello, &hello)?))
            .await?;

        loop {
            let item = framed
                .next()
                .await
                .ok_or_else(|| BusError::SessionClosed("connection closed during handshake".to_string()))??;
            match item {
                MuxItem::Frame { stream_id, frame } => {
                    if stream_id != CONTROL_STREAM_ID || frame.kind != FrameKind::Hello.code() {
                        return Err(BusError::Protocol(
                            "expected hello as the first frame".to_string(),
                        ));
                    }
                    let peer_hello: HelloPayload = frame.decode()?;
                    verify_hello(&peer_hello, params)?;
                    return Ok(peer_hello);
                }
                MuxItem::Oversize { .. } => {
                    return Err(BusError::Protocol("oversize frame during handshake".to_string()));
                }
            }
        }
    })
    .await
    .unwrap_or(Err(BusError::HandshakeTimeout));

    if let Err(e) = &result {
        debug!(reason = e.reason_code(), "handshake refused");
        // Best effort: tell the peer why before dropping the connection
        let goodbye = Frame::new(
            FrameKind::Goodbye,
            &GoodbyePayload {
                reason: e.reason_code().to_string(),
            },
        );
        if let Ok(goodbye) = goodbye {
            let _ = framed.send((CONTROL_STREAM_ID, goodbye)).await;
        }
    }
    result
}
