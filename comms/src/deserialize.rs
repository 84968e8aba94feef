use std::io;

/// Deserialization from a received frame.
///
/// The returned value may borrow from `buf`, which holds exactly one
/// frame stripped of its length prefix.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
