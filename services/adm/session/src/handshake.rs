//! Login handshake.
//!
//! Immediately after the transport opens, the device sends its credentials
//! and waits for the hub's reply. Nothing else may be written until the reply
//! accepts the login.

use crate::SessionError;
use adm_wire::{encode, Envelope, FrameDecoder, Hello, HelloAck};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Send the login frame
pub async fn send_hello<W: AsyncWrite + Unpin>(
    writer: &mut W,
    hello: Hello,
) -> Result<(), SessionError> {
    let uid = hello.uid.clone();
    let frame = encode(&hello.into_envelope())?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    debug!("Sent login for device {}", uid);
    Ok(())
}

/// Read the next envelope, pulling more bytes as needed
pub async fn recv_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> Result<Envelope, SessionError> {
    loop {
        if let Some(envelope) = decoder.decode(buffer)? {
            return Ok(envelope);
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            return Err(SessionError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "hub closed the connection",
            )));
        }

        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

/// Wait for the hub's reply to the login.
///
/// The first envelope must be the reply, which is any object without a
/// `cmd` other than a termination request. Only an `err` field refuses the
/// credentials.
pub async fn await_hello_ack<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
    timeout: Duration,
) -> Result<HelloAck, SessionError> {
    let envelope = tokio::time::timeout(timeout, recv_envelope(reader, decoder, buffer))
        .await
        .map_err(|_| SessionError::HandshakeTimeout(timeout))??;

    let ack = HelloAck::try_from(&envelope)
        .map_err(|_| SessionError::UnexpectedHandshake(envelope.kind))?;
    if let Some(reason) = ack.error {
        return Err(SessionError::Rejected(reason));
    }
    debug!(
        "Login accepted (hub time {:?}, heartbeat {:?})",
        ack.hub_time, ack.heartbeat
    );
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adm_wire::EnvelopeKind;
    use serde_json::Value;
    use std::io::Cursor;

    fn hello() -> Hello {
        Hello {
            uid: "dev-1".into(),
            token: "tok".into(),
            platform: None,
            vm_uid: None,
            heartbeat: 60,
            fota: None,
            fota_capable: false,
        }
    }

    #[tokio::test]
    async fn test_hello_roundtrip() {
        let mut sent = Vec::new();
        send_hello(&mut sent, hello()).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        let mut cursor = Cursor::new(sent);
        let envelope = recv_envelope(&mut cursor, &mut decoder, &mut buffer)
            .await
            .unwrap();

        assert_eq!(envelope.kind, EnvelopeKind::Hello);
        assert_eq!(envelope.field("uid"), Some(&Value::from("dev-1")));
        assert_eq!(envelope.field("hearbeat"), Some(&Value::from(60)));
    }

    #[tokio::test]
    async fn test_ack_outcomes() {
        let mut decoder = FrameDecoder::new();
        let timeout = Duration::from_secs(1);

        let mut buffer = BytesMut::new();
        let mut ok = Cursor::new(b"{\"ts\":1700000000,\"htbm\":5}\n".to_vec());
        let ack = await_hello_ack(&mut ok, &mut decoder, &mut buffer, timeout)
            .await
            .unwrap();
        assert_eq!(ack.heartbeat, Some(5));
        assert_eq!(ack.hub_time, Some(1_700_000_000));

        let mut buffer = BytesMut::new();
        let mut refused = Cursor::new(b"{\"err\":\"bad token\"}\n".to_vec());
        let err = await_hello_ack(&mut refused, &mut decoder, &mut buffer, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Rejected(ref r) if r == "bad token"));

        let mut buffer = BytesMut::new();
        let mut wrong = Cursor::new(b"{\"cmd\":\"EVNT\",\"payload\":{}}\n".to_vec());
        let err = await_hello_ack(&mut wrong, &mut decoder, &mut buffer, timeout)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::UnexpectedHandshake(EnvelopeKind::Event)
        ));

        let mut buffer = BytesMut::new();
        let mut bare = Cursor::new(b"{}\n".to_vec());
        let ack = await_hello_ack(&mut bare, &mut decoder, &mut buffer, timeout)
            .await
            .unwrap();
        assert_eq!(ack, HelloAck::default());

        let mut buffer = BytesMut::new();
        let mut terminate = Cursor::new(b"{\"terminate\":1}\n".to_vec());
        let err = await_hello_ack(&mut terminate, &mut decoder, &mut buffer, timeout)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::UnexpectedHandshake(EnvelopeKind::Terminate)
        ));

        let mut buffer = BytesMut::new();
        let mut closed = Cursor::new(Vec::new());
        let err = await_hello_ack(&mut closed, &mut decoder, &mut buffer, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout() {
        let (_hub, mut device) = tokio::io::duplex(64);
        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        let err = await_hello_ack(&mut device, &mut decoder, &mut buffer, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout(_)));
    }
}
