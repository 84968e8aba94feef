//! The sending end of the application layer protocol.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// The sending end handle of the communication.
///
/// A frame is the length prefix, the serialized head, and an optional
/// borrowed tail. The tail lets bulk payloads (frame pixels) go out
/// without being copied into the scratch buffer first.
pub struct StudioSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    head: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> StudioSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            head: Vec::new(),
        }
    }

    /// Sends `msg` as one length-prefixed frame and flushes.
    ///
    /// # Arguments
    /// * `msg` - A serializable object; its borrowed tail, if any, is
    ///           written straight from the caller's memory.
    ///
    /// # Returns
    /// `io::Error` when the underlying writer fails; the peer must
    /// then be considered gone.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.head.clear();
        let tail = msg.serialize(&mut self.head).unwrap_or_default();

        let len = (self.head.len() + tail.len()) as LenType;
        debug_assert_eq!(size_of_val(&len), LEN_TYPE_SIZE);

        self.tx.write_all(&len.to_be_bytes()).await?;
        self.tx.write_all(&self.head).await?;
        if !tail.is_empty() {
            self.tx.write_all(tail).await?;
        }

        self.tx.flush().await
    }
}
