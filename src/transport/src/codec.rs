// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Message framing.
//!
//! Messages are encoded using the [`bincode`] format and sent over the wire
//! with a big-endian `u64` length prefix.

use std::fmt::Debug;

use bincode::Options;
use sdb_ore::cast::CastFrom;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// The largest frame accepted from a peer.
pub const MAX_FRAME_LEN: u64 = 64 << 20;

/// Trait for messages that can be exchanged by a
/// [`Messenger`](crate::Messenger).
pub trait Message: Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}
impl<T: Debug + Send + Sync + Serialize + DeserializeOwned + 'static> Message for T {}

/// Write a message into the given writer, returning the number of body
/// bytes written.
///
/// The writer is not flushed.
pub async fn write_message<W, M>(mut writer: W, msg: &M) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let bytes = wire_encode(msg)?;

    let len = u64::cast_from(bytes.len());
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_u64(len).await?;
    writer.write_all(&bytes).await?;

    Ok(bytes.len())
}

/// Read a message from the given reader.
pub async fn read_message<R, M>(mut reader: R) -> Result<M, Error>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let len = reader.read_u64().await?;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut bytes = vec![0; usize::cast_from(len)];
    reader.read_exact(&mut bytes).await?;

    wire_decode(&bytes)
}

/// Encode a message for wire transport.
fn wire_encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, Error> {
    let bytes = bincode::DefaultOptions::new().serialize(msg)?;
    Ok(bytes)
}

/// Decode a wire frame back into a message.
fn wire_decode<M: DeserializeOwned>(bytes: &[u8]) -> Result<M, Error> {
    let msg = bincode::DefaultOptions::new().deserialize(bytes)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u64,
        name: String,
    }

    #[sdb_ore::test(tokio::test)]
    async fn frames_back_to_back() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let first = Job {
            id: 1,
            name: "one".into(),
        };
        write_message(&mut a, &first).await.expect("write");
        write_message(&mut a, &Some(7u32)).await.expect("write");
        let got: Job = read_message(&mut b).await.expect("read");
        assert_eq!(got, first);
        let got: Option<u32> = read_message(&mut b).await.expect("read");
        assert_eq!(got, Some(7));
    }

    #[sdb_ore::test(tokio::test)]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u64(MAX_FRAME_LEN + 1).await.expect("write");
        let err = read_message::<_, Job>(&mut b).await.unwrap_err();
        assert!(
            matches!(err, Error::FrameTooLarge { len, .. } if len == MAX_FRAME_LEN + 1),
            "{err}"
        );
    }

    #[sdb_ore::test(tokio::test)]
    async fn truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u64(10).await.expect("write");
        a.write_all(b"abc").await.expect("write");
        drop(a);
        let err = read_message::<_, Job>(&mut b).await.unwrap_err();
        assert!(
            matches!(&err, Error::Io(e) if e.kind() == ErrorKind::UnexpectedEof),
            "{err}"
        );
    }

    #[sdb_ore::test(tokio::test)]
    async fn garbage_is_codec_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u64(1).await.expect("write");
        a.write_all(&[0xff]).await.expect("write");
        let err = read_message::<_, Job>(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Codec(_)), "{err}");
    }
}
