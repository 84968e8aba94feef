/// Serialization into a reusable frame buffer.
///
/// Implementors append their encoded representation to `buf` and may
/// additionally return a borrowed tail segment that the sender writes
/// after the buffer, so large payloads (image frames) never get copied
/// into the frame buffer.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
