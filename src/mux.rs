//! Wire framing shared by the RPC fabric and the Raft transport.
//!
//! Every inbound connection begins with a single magic byte selecting the
//! protocol. Payloads on a connection are length-prefixed frames: a
//! big-endian `u32` length followed by that many bytes (JSON for RPC and
//! Raft messages, raw chunks on hijacked streams). Multiplexed sessions
//! add a `u32` stream id ahead of the length; stream ids are assigned by
//! the opener and never reused within a session.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol selector bytes, first on every connection. Bit-exact.
pub const MAGIC_RPC: u8 = 0x01;
pub const MAGIC_RAFT: u8 = 0x02;
pub const MAGIC_MUX: u8 = 0x03;
pub const MAGIC_TLS: u8 = 0x04;
pub const MAGIC_STREAM: u8 = 0x05;
pub const MAGIC_MUX_V2: u8 = 0x06;

/// Frames above this are rejected to bound per-connection memory.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> std::io::Result<()> {
    w.write_u32(payload.len() as u32).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Read one multiplexed frame: `(stream_id, payload)`.
pub async fn read_mux_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> std::io::Result<(u32, Vec<u8>)> {
    let stream_id = r.read_u32().await?;
    let payload = read_frame(r).await?;
    Ok((stream_id, payload))
}

/// Write one multiplexed frame.
pub async fn write_mux_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    stream_id: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    w.write_u32(stream_id).await?;
    write_frame(w, payload).await
}

/// Header opening a streaming RPC: a length-prefixed encoded struct with
/// the method name.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamHeader {
    pub method: String,
}

/// Acknowledgement closing the streaming handshake; an empty error means
/// the stream is hijacked and the fabric becomes a byte bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamAck {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"hello");
        assert_eq!(read_frame(&mut b).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn mux_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_mux_frame(&mut a, 7, b"payload").await.unwrap();
        let (id, payload) = read_mux_frame(&mut b).await.unwrap();
        assert_eq!(id, 7);
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_u32(&mut a, (MAX_FRAME + 1) as u32)
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn magic_bytes_are_wire_stable() {
        assert_eq!(MAGIC_RPC, 0x01);
        assert_eq!(MAGIC_RAFT, 0x02);
        assert_eq!(MAGIC_MUX, 0x03);
        assert_eq!(MAGIC_TLS, 0x04);
        assert_eq!(MAGIC_STREAM, 0x05);
        assert_eq!(MAGIC_MUX_V2, 0x06);
    }

    #[test]
    fn stream_header_json_shape() {
        let h = StreamHeader {
            method: "ClientAlloc.Exec".into(),
        };
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, r#"{"method":"ClientAlloc.Exec"}"#);
    }
}
