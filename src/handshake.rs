// ===============================
// src/handshake.rs
// ===============================
//
// Framing + autentikasi pre-shared key untuk control channel.
// Frame = panjang u32 big-endian + payload.
// Autentikasi mutual: verifier kirim "#CHALLENGE#<hex nonce>", prover balas
// HMAC-SHA256(key, challenge), verifier jawab "#WELCOME#" / "#FAILURE#",
// lalu peran ditukar.
//
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

pub const MAX_FRAME: usize = 1 << 20;

const CHALLENGE: &[u8] = b"#CHALLENGE#";
const WELCOME: &[u8] = b"#WELCOME#";
const FAILURE: &[u8] = b"#FAILURE#";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("digest received was wrong")]
    BadDigest,
    #[error("peer rejected our digest")]
    Rejected,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), HandshakeError> {
    if payload.len() > MAX_FRAME {
        return Err(HandshakeError::FrameTooLarge(payload.len()));
    }
    w.write_u32(payload.len() as u32).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, HandshakeError> {
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(HandshakeError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

fn mac(key: &[u8], msg: &[u8]) -> Result<HmacSha256, HandshakeError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| HandshakeError::Protocol("unusable key"))?;
    mac.update(msg);
    Ok(mac)
}

/// Verify that the peer knows the key.
pub async fn deliver_challenge<S>(stream: &mut S, key: &[u8]) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce: [u8; 32] = rand::random();
    let mut challenge = CHALLENGE.to_vec();
    challenge.extend_from_slice(hex::encode(nonce).as_bytes());
    write_frame(stream, &challenge).await?;

    let response = read_frame(stream).await?;
    if mac(key, &challenge)?.verify_slice(&response).is_ok() {
        write_frame(stream, WELCOME).await
    } else {
        write_frame(stream, FAILURE).await?;
        Err(HandshakeError::BadDigest)
    }
}

/// Prove to the peer that we know the key.
pub async fn answer_challenge<S>(stream: &mut S, key: &[u8]) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = read_frame(stream).await?;
    if !challenge.starts_with(CHALLENGE) {
        return Err(HandshakeError::Protocol("expected challenge"));
    }
    let digest = mac(key, &challenge)?.finalize().into_bytes();
    write_frame(stream, &digest).await?;

    match read_frame(stream).await?.as_slice() {
        WELCOME => Ok(()),
        FAILURE => Err(HandshakeError::Rejected),
        _ => Err(HandshakeError::Protocol("expected welcome or failure")),
    }
}

/// Listener side: verify first, then answer.
pub async fn accept_auth<S>(stream: &mut S, key: &[u8]) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    deliver_challenge(stream, key).await?;
    answer_challenge(stream, key).await
}

/// Connecting side: answer first, then verify.
pub async fn connect_auth<S>(stream: &mut S, key: &[u8]) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    answer_challenge(stream, key).await?;
    deliver_challenge(stream, key).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_authenticates_both_ways() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let (server, client) = tokio::join!(accept_auth(&mut a, b"secret"), connect_auth(&mut b, b"secret"));
        assert!(server.is_ok());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn wrong_key_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let (server, client) = tokio::join!(accept_auth(&mut a, b"secret"), connect_auth(&mut b, b"guess"));
        assert!(matches!(server, Err(HandshakeError::BadDigest)));
        assert!(matches!(client, Err(HandshakeError::Rejected)));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = b.write_u32((MAX_FRAME + 1) as u32).await;
        });
        assert!(matches!(read_frame(&mut a).await, Err(HandshakeError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"\"shutdown\"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"\"shutdown\"");
    }
}
