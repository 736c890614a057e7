//! Session handshake over a fresh connection

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedParts};

use dmsg_core::{DmsgError, Error, Result};
use dmsg_protocol::handshake::{client_proof, nonce, server_proof};
use dmsg_protocol::{
    Frame, FrameCodec, HandshakeCodec, HandshakeMessage, PubKey, SecKey, PROTOCOL_VERSION,
};

async fn next_message<T>(framed: &mut Framed<T, HandshakeCodec>) -> Result<HandshakeMessage>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(msg) => Ok(msg?),
        None => Err(Error::Handshake(
            "connection closed during handshake".to_string(),
        )),
    }
}

fn unexpected(msg: &HandshakeMessage) -> Error {
    Error::Handshake(format!("unexpected {} message", msg.name()))
}

async fn reject<T>(framed: &mut Framed<T, HandshakeCodec>, err: DmsgError) -> Error
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let _ = framed
        .send(HandshakeMessage::Rejected { code: err.code() })
        .await;
    err.into()
}

/// Switch a handshaken connection over to the frame codec
///
/// Bytes already buffered past the handshake belong to the first frames.
fn into_frames<T>(framed: Framed<T, HandshakeCodec>) -> Framed<T, FrameCodec>
where
    T: AsyncRead + AsyncWrite,
{
    let old = framed.into_parts();
    let mut parts = FramedParts::new::<Frame>(old.io, FrameCodec::new());
    parts.read_buf = old.read_buf;
    parts.write_buf = old.write_buf;
    Framed::from_parts(parts)
}

/// Authenticate to the relay expected to hold `server_pk`
pub(crate) async fn client_handshake<T>(
    io: T,
    pk: PubKey,
    sk: &SecKey,
    server_pk: PubKey,
) -> Result<Framed<T, FrameCodec>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(io, HandshakeCodec::new());
    let client_nonce = nonce();
    framed
        .send(HandshakeMessage::ClientHello {
            version: PROTOCOL_VERSION.to_string(),
            pk,
            nonce: client_nonce,
        })
        .await?;

    let server_nonce = match next_message(&mut framed).await? {
        HandshakeMessage::ServerHello {
            version,
            pk: got,
            nonce,
            sig,
        } => {
            if version != PROTOCOL_VERSION {
                return Err(Error::Handshake(format!(
                    "server speaks protocol {}, expected {}",
                    version, PROTOCOL_VERSION
                )));
            }
            if got != server_pk {
                return Err(Error::Handshake(
                    "server key does not match its discovery entry".to_string(),
                ));
            }
            server_pk
                .verify(&server_proof(&client_nonce, &nonce, &pk), &sig)
                .map_err(|_| DmsgError::ReqInvalidSig)?;
            nonce
        }
        HandshakeMessage::Rejected { code } => return Err(DmsgError::from_reject_code(code).into()),
        other => return Err(unexpected(&other)),
    };

    // The server waits for our auth here, so nothing else may be buffered.
    if !framed.read_buffer().is_empty() {
        return Err(DmsgError::SessionHandshakeExtraBytes.into());
    }

    framed
        .send(HandshakeMessage::ClientAuth {
            sig: sk.sign(&client_proof(&server_nonce, &client_nonce, &server_pk)),
        })
        .await?;

    match next_message(&mut framed).await? {
        HandshakeMessage::ServerAccept => Ok(into_frames(framed)),
        HandshakeMessage::Rejected { code } => Err(DmsgError::from_reject_code(code).into()),
        other => Err(unexpected(&other)),
    }
}

/// Authenticate an incoming client, returning its key
pub(crate) async fn server_handshake<T>(
    io: T,
    pk: PubKey,
    sk: &SecKey,
) -> Result<(PubKey, Framed<T, FrameCodec>)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(io, HandshakeCodec::new());

    let (client_pk, client_nonce) = match next_message(&mut framed).await? {
        HandshakeMessage::ClientHello { version, pk, nonce } => {
            if version != PROTOCOL_VERSION {
                return Err(Error::Handshake(format!(
                    "client speaks protocol {}, expected {}",
                    version, PROTOCOL_VERSION
                )));
            }
            (pk, nonce)
        }
        other => return Err(unexpected(&other)),
    };

    // The client waits for our hello here, so nothing else may be buffered.
    if !framed.read_buffer().is_empty() {
        return Err(reject(&mut framed, DmsgError::SessionHandshakeExtraBytes).await);
    }
    if client_pk.is_null() {
        return Err(reject(&mut framed, DmsgError::ReqInvalidSrcPk).await);
    }

    let server_nonce = nonce();
    framed
        .send(HandshakeMessage::ServerHello {
            version: PROTOCOL_VERSION.to_string(),
            pk,
            nonce: server_nonce,
            sig: sk.sign(&server_proof(&client_nonce, &server_nonce, &client_pk)),
        })
        .await?;

    match next_message(&mut framed).await? {
        HandshakeMessage::ClientAuth { sig } => {
            let proof = client_proof(&server_nonce, &client_nonce, &pk);
            if client_pk.verify(&proof, &sig).is_err() {
                return Err(reject(&mut framed, DmsgError::ReqInvalidSig).await);
            }
        }
        other => return Err(unexpected(&other)),
    }

    framed.send(HandshakeMessage::ServerAccept).await?;
    Ok((client_pk, into_frames(framed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use dmsg_protocol::cipher::generate_keypair;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Encoder;

    #[tokio::test]
    async fn test_handshake_succeeds() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (cpk, csk) = generate_keypair();
        let (spk, ssk) = generate_keypair();

        let server = tokio::spawn(async move { server_handshake(server_io, spk, &ssk).await });
        let client = client_handshake(client_io, cpk, &csk, spk).await;

        assert!(client.is_ok());
        let (seen, _) = server.await.unwrap().unwrap();
        assert_eq!(seen, cpk);
    }

    #[tokio::test]
    async fn test_wrong_server_key_fails() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (cpk, csk) = generate_keypair();
        let (spk, ssk) = generate_keypair();
        let (expected, _) = generate_keypair();

        tokio::spawn(async move { server_handshake(server_io, spk, &ssk).await });
        let err = client_handshake(client_io, cpk, &csk, expected)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn test_extra_bytes_rejected() {
        let (mut client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (cpk, _) = generate_keypair();
        let (spk, ssk) = generate_keypair();

        let mut buf = BytesMut::new();
        HandshakeCodec::new()
            .encode(
                HandshakeMessage::ClientHello {
                    version: PROTOCOL_VERSION.to_string(),
                    pk: cpk,
                    nonce: nonce(),
                },
                &mut buf,
            )
            .unwrap();
        buf.extend_from_slice(b"premature");
        client_io.write_all(&buf).await.unwrap();

        let err = server_handshake(server_io, spk, &ssk).await.unwrap_err();
        assert_eq!(err.dmsg(), Some(DmsgError::SessionHandshakeExtraBytes));
    }
}
