//! Payload serialization.
//!
//! Frame headers are always MessagePack; the argument and result payloads
//! embedded in a frame go through a [`PayloadSerializer`]. The default is
//! [`MessagePackSerializer`].
//!
//! # Argument packing
//!
//! Arguments are packed by shape, symmetrically on both sides:
//!
//! - no parameters: `()`, written as the nil marker
//! - one parameter: the value itself, unwrapped
//! - two or more: a tuple `(a, b, ..)`, written as a fixed-length array
//!
//! Callers and handlers only need to agree on the Rust type, e.g. a method
//! `add(a: i32, b: i32)` is invoked with `(2, 3)` and decoded as `(i32, i32)`.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{DecodeError, EncodeError};

/// MessagePack nil, the packed form of an empty argument list.
pub const NIL: u8 = 0xc0;

/// Turns typed values into payload bytes and back.
pub trait PayloadSerializer: Send + Sync + 'static {
    /// Append the encoding of `value` to `buf`.
    fn serialize<T: Serialize + ?Sized>(value: &T, buf: &mut Vec<u8>) -> Result<(), EncodeError>;

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError>;
}

/// MessagePack payloads via `rmp-serde`. Structs encode as arrays (compact form).
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

impl PayloadSerializer for MessagePackSerializer {
    fn serialize<T: Serialize + ?Sized>(value: &T, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        rmp_serde::encode::write(buf, value).map_err(|e| EncodeError::Serialize(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
        rmp_serde::from_slice(bytes).map_err(|e| DecodeError::InvalidData(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack<T: Serialize>(value: &T) -> Vec<u8> {
        let mut buf = Vec::new();
        MessagePackSerializer::serialize(value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn zero_arguments_pack_as_nil() {
        assert_eq!(pack(&()), vec![NIL]);
        let () = MessagePackSerializer::deserialize(&[NIL]).unwrap();
    }

    #[test]
    fn single_argument_is_not_wrapped() {
        assert_eq!(pack(&5i32), vec![0x05]);
        assert_eq!(pack(&"hi"), vec![0xa2, b'h', b'i']);
    }

    #[test]
    fn multiple_arguments_pack_as_tuple() {
        let packed = pack(&(2i32, 3i32));
        assert_eq!(packed, vec![0x92, 0x02, 0x03]);
        let (a, b): (i32, i32) = MessagePackSerializer::deserialize(&packed).unwrap();
        assert_eq!((a, b), (2, 3));
    }

    #[test]
    fn shape_mismatch_is_a_decode_error() {
        let packed = pack(&"not a tuple");
        let result: Result<(i32, i32), _> = MessagePackSerializer::deserialize(&packed);
        assert!(matches!(result, Err(DecodeError::InvalidData(_))));
    }
}
