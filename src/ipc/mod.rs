mod codec;
mod messages;

pub use codec::MessageCodec;
pub use messages::*;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// Serialize `msg` as JSON and send it as one frame.
pub async fn send_json<T, S>(framed: &mut Framed<S, MessageCodec>, msg: &T) -> Result<()>
where
    T: Serialize,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(msg)?;
    framed.send(Bytes::from(json)).await?;
    Ok(())
}

/// Read the next frame and decode it as JSON. `Ok(None)` means the peer closed.
pub async fn recv_json<T, S>(framed: &mut Framed<S, MessageCodec>) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(msg) => {
            let msg = msg.context("Read error")?;
            Ok(Some(serde_json::from_slice(&msg)?))
        }
        None => Ok(None),
    }
}

/// Client side of the protocol version handshake.
pub async fn client_handshake<S>(framed: &mut Framed<S, MessageCodec>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_json(
        framed,
        &VersionHandshake {
            version: PROTOCOL_VERSION,
        },
    )
    .await?;

    let resp: VersionResponse = recv_json(framed)
        .await?
        .context("Peer closed connection during handshake")?;
    if !resp.ok {
        bail!(
            "Protocol version mismatch: {}",
            resp.message.unwrap_or_default()
        );
    }
    Ok(())
}

/// Server side of the protocol version handshake. Returns `Ok(false)` when the
/// peer speaks another version; the caller should close the connection.
pub async fn server_handshake<S>(framed: &mut Framed<S, MessageCodec>) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake: VersionHandshake = recv_json(framed)
        .await?
        .context("Connection closed before handshake")?;

    if handshake.version != PROTOCOL_VERSION {
        let resp = VersionResponse {
            version: PROTOCOL_VERSION,
            ok: false,
            error: Some(ERR_VERSION_MISMATCH.to_string()),
            message: Some(format!(
                "Unsupported protocol version {}",
                handshake.version
            )),
        };
        send_json(framed, &resp).await?;
        return Ok(false);
    }

    let resp = VersionResponse {
        version: PROTOCOL_VERSION,
        ok: true,
        error: None,
        message: None,
    };
    send_json(framed, &resp).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut client = Framed::new(a, MessageCodec);
        let mut server = Framed::new(b, MessageCodec);

        let (client_res, server_res) =
            tokio::join!(client_handshake(&mut client), server_handshake(&mut server));
        assert!(client_res.is_ok());
        assert!(server_res.unwrap());
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let (a, b) = tokio::io::duplex(4096);
        let mut client = Framed::new(a, MessageCodec);
        let mut server = Framed::new(b, MessageCodec);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });
        send_json(&mut client, &VersionHandshake { version: 99 })
            .await
            .unwrap();
        let resp: VersionResponse = recv_json(&mut client).await.unwrap().unwrap();

        assert!(!resp.ok);
        assert_eq!(resp.error.as_deref(), Some(ERR_VERSION_MISMATCH));
        assert!(!server_task.await.unwrap().unwrap());
    }
}
