//! Opaque shader identifiers.

use std::fmt;

/// Size in bytes of a driver shader identifier.
pub const SHADER_IDENTIFIER_SIZE: usize = 32;

/// Opaque token identifying one exported shader of a linked pipeline.
///
/// The bytes are never interpreted. The default value is [`INVALID`](Self::INVALID),
/// which marks an identifier that has not been queried yet; [`NULL`](Self::NULL)
/// is the all-zero identifier the driver skips at execution time.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShaderIdentifier(pub [u8; SHADER_IDENTIFIER_SIZE]);

impl ShaderIdentifier {
    /// Identifier whose record performs no work.
    pub const NULL: Self = Self([0; SHADER_IDENTIFIER_SIZE]);

    /// Placeholder for identifiers that were never assigned.
    pub const INVALID: Self = Self([0xFF; SHADER_IDENTIFIER_SIZE]);

    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: [u8; SHADER_IDENTIFIER_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SHADER_IDENTIFIER_SIZE] {
        &self.0
    }

    /// `true` once the identifier has been assigned (NULL counts as assigned).
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl Default for ShaderIdentifier {
    #[inline]
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for ShaderIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("ShaderIdentifier(NULL)");
        }
        if !self.is_valid() {
            return f.write_str("ShaderIdentifier(INVALID)");
        }
        write!(f, "ShaderIdentifier(")?;
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}
