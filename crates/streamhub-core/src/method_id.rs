//! Stable method identifiers.
//!
//! A hub method is addressed on the wire by a 32-bit id: the FNV-1a hash of
//! its name, unless the method carries an explicit override.

/// Wire identifier of a hub or receiver method.
pub type MethodId = i32;

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a over `bytes`, reinterpreted as a signed wire id.
pub const fn fnv1a32(bytes: &[u8]) -> MethodId {
    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash as i32
}

/// Compute the id of a method from its name.
pub const fn method_id(name: &str) -> MethodId {
    fnv1a32(name.as_bytes())
}

/// Name and wire id of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub id: MethodId,
}

impl MethodDescriptor {
    /// Descriptor whose id is derived from the name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            id: method_id(name),
        }
    }

    /// Descriptor with an explicitly assigned id.
    pub const fn with_id(name: &'static str, id: MethodId) -> Self {
        Self { name, id }
    }
}

/// Path used to address a hub or method during call setup, e.g. `ChatHub/JoinAsync`.
pub fn method_path(service: &str, method: &str) -> String {
    format!("{service}/{method}")
}
