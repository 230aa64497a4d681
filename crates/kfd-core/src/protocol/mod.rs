//! Key Management Message layer: CRC, message vocabulary, and frame codec.

pub mod crc;
pub mod framer;
pub mod messages;
