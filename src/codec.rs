//! Fixed and variable-size value codecs.
//!
//! A [`Codec`] turns a value into its on-page byte representation and back.
//! Pages never interpret record bytes themselves; they only need the codec
//! to report encoded lengths, both from a value about to be written and by
//! peeking at already-stored bytes (the latter is how freed records are
//! measured without a full decode).

use crate::error::{BaobabError, Result};

/// Encoding contract for keys and values stored in the tree.
pub trait Codec: Sized {
    /// Number of bytes [`Codec::encode`] will write for this value.
    fn encoded_len(&self) -> usize;

    /// Number of bytes occupied by the encoded value at the start of `buf`,
    /// determined by peeking only.
    fn stored_len(buf: &[u8]) -> Result<usize>;

    /// Writes the value into the start of `buf`, which holds at least
    /// [`Codec::encoded_len`] bytes.
    fn encode(&self, buf: &mut [u8]) -> Result<()>;

    /// Reads a value back from the start of `buf`.
    fn decode(buf: &[u8]) -> Result<Self>;
}

macro_rules! fixed_int_codec {
    ($ty:ty, $len:expr) => {
        impl Codec for $ty {
            fn encoded_len(&self) -> usize {
                $len
            }

            fn stored_len(buf: &[u8]) -> Result<usize> {
                if buf.len() < $len {
                    return Err(BaobabError::Corruption("integer record truncated"));
                }
                Ok($len)
            }

            fn encode(&self, buf: &mut [u8]) -> Result<()> {
                if buf.len() < $len {
                    return Err(BaobabError::Corruption("integer record does not fit"));
                }
                buf[..$len].copy_from_slice(&self.to_be_bytes());
                Ok(())
            }

            fn decode(buf: &[u8]) -> Result<Self> {
                if buf.len() < $len {
                    return Err(BaobabError::Corruption("integer record truncated"));
                }
                let mut raw = [0u8; $len];
                raw.copy_from_slice(&buf[..$len]);
                Ok(<$ty>::from_be_bytes(raw))
            }
        }
    };
}

fixed_int_codec!(u32, 4);
fixed_int_codec!(u64, 8);
fixed_int_codec!(i64, 8);

/// Strings are stored as a big-endian u16 length prefix followed by UTF-8
/// bytes; the payload may not exceed `u16::MAX` bytes.
impl Codec for String {
    fn encoded_len(&self) -> usize {
        2 + self.len()
    }

    fn stored_len(buf: &[u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Err(BaobabError::Corruption("string record truncated"));
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + len {
            return Err(BaobabError::Corruption("string record truncated"));
        }
        Ok(2 + len)
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let len = u16::try_from(self.len())
            .map_err(|_| BaobabError::Corruption("string longer than u16"))?;
        if buf.len() < 2 + self.len() {
            return Err(BaobabError::Corruption("string record does not fit"));
        }
        buf[..2].copy_from_slice(&len.to_be_bytes());
        buf[2..2 + self.len()].copy_from_slice(self.as_bytes());
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let total = Self::stored_len(buf)?;
        let bytes = &buf[2..total];
        String::from_utf8(bytes.to_vec())
            .map_err(|_| BaobabError::Corruption("string record is not valid UTF-8"))
    }
}
