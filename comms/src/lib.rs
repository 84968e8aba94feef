pub mod msg;

mod deserialize;
mod receiver;
mod sender;
mod serialize;
mod test;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deserialize::Deserialize;
pub use receiver::StudioReceiver;
pub use sender::StudioSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Creates both `StudioReceiver` and `StudioSender` network channel parts.
///
/// Given a reader and a writer creates and returns both ends of the
/// communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a studio receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (StudioReceiver<R>, StudioSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (StudioReceiver::new(rx), StudioSender::new(tx))
}
