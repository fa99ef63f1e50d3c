//! BER PDU framing over an async byte stream.

use bytes::{Buf, BytesMut};
use lber::structure::StructureTag;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound for a single PDU; anything larger is treated as a protocol
/// error rather than an allocation request.
const MAX_PDU_SIZE: usize = 8 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Read exactly one BER element from the stream.
///
/// Returns Ok(None) on a clean EOF at a message boundary. Bytes belonging to
/// a following PDU stay in `buf` for the next call.
pub async fn read_pdu<R>(stream: &mut R, buf: &mut BytesMut) -> Result<Option<StructureTag>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            match lber::parse::parse_tag(&buf[..]) {
                Ok((rest, tag)) => {
                    let consumed = buf.len() - rest.len();
                    buf.advance(consumed);
                    return Ok(Some(tag));
                }
                Err(nom::Err::Incomplete(_)) => {}
                Err(_) => {
                    return Err(Error::Protocol("malformed BER element".to_string()));
                }
            }
            if buf.len() > MAX_PDU_SIZE {
                return Err(Error::Protocol("PDU exceeds maximum size".to_string()));
            }
        }

        buf.reserve(READ_CHUNK);
        let n = stream
            .read_buf(buf)
            .await
            .map_err(|e| Error::Protocol(format!("read error: {e}")))?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::Protocol(
                "connection closed mid-PDU".to_string(),
            ));
        }
    }
}

/// Encode and write one PDU.
pub async fn write_pdu<W>(stream: &mut W, tag: StructureTag) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    lber::write::encode_into(&mut out, tag)
        .map_err(|e| Error::Protocol(format!("encode error: {e}")))?;
    stream
        .write_all(&out)
        .await
        .map_err(|e| Error::Protocol(format!("write error: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::Protocol(format!("flush error: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::proto::{self, ResultCode};

    #[tokio::test]
    async fn reads_single_pdu() {
        let bytes: Vec<u8> = vec![
            0x30, 0x0c, 0x02, 0x01, 0x01, 0x60, 0x07, 0x02, 0x01, 0x03, 0x04, 0x00, 0x80, 0x00,
        ];
        let mut stream = std::io::Cursor::new(bytes);
        let mut buf = BytesMut::new();
        let tag = read_pdu(&mut stream, &mut buf).await.unwrap().unwrap();
        assert_eq!(tag.id, 16);
        assert!(buf.is_empty());
        assert!(read_pdu(&mut stream, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_back_to_back_pdus() {
        let mut bytes = Vec::new();
        for id in 1..=2i64 {
            let mut out = BytesMut::new();
            lber::write::encode_into(&mut out, proto::bind_response(id, ResultCode::Success, ""))
                .unwrap();
            bytes.extend_from_slice(&out);
        }
        let mut stream = std::io::Cursor::new(bytes);
        let mut buf = BytesMut::new();
        for id in 1..=2i64 {
            let tag = read_pdu(&mut stream, &mut buf).await.unwrap().unwrap();
            let msg = proto::parse_message(tag).unwrap();
            assert_eq!(msg.message_id, id);
        }
        assert!(read_pdu(&mut stream, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_pdu_is_an_error() {
        let mut stream = std::io::Cursor::new(vec![0x30, 0x0c, 0x02]);
        let mut buf = BytesMut::new();
        assert!(read_pdu(&mut stream, &mut buf).await.is_err());
    }
}
