//! Length-prefixed packet frames for the stdin/stdout transport of process
//! workers: a little-endian `u32` byte count followed by the bincode packet.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::runtime::error::Error;
use crate::runtime::packet::Packet;

pub const MAX_FRAME_LEN: usize = 1 << 30;

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(packet).map_err(|e| Error::Serialize(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(body.len()));
    }
    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, Error>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let packet = bincode::deserialize(&body).map_err(|e| Error::Deserialize(e.to_string()))?;
    Ok(Some(packet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let sent = vec![
            Packet::new("trajectory", &vec![1.0f32; 100]).unwrap(),
            Packet::stop(),
        ];

        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move {
                for packet in &sent {
                    write_packet(&mut client, packet).await.unwrap();
                }
            })
        };

        let mut received = Vec::new();
        while let Some(packet) = read_packet(&mut server).await.unwrap() {
            received.push(packet);
        }
        writer.await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let mut bytes: &[u8] = &(u32::MAX).to_le_bytes();
        assert!(matches!(read_packet(&mut bytes).await, Err(Error::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn truncated_body_is_an_io_error() {
        let mut bytes: Vec<u8> = 10u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut slice: &[u8] = &bytes;
        assert!(matches!(read_packet(&mut slice).await, Err(Error::Io(_))));
    }
}
