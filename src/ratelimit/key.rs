//! Rate limit key generation and handling.

/// A key that uniquely identifies a rate limit record.
///
/// The same identifier under two actions yields two independent keys, so a
/// caller's login attempts never count against its registrations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// The logical operation being limited (e.g. `login`)
    pub action: String,
    /// The caller IP or normalized account identifier
    pub identifier: String,
}

impl LimitKey {
    /// Create a new key from an action and identifier.
    pub fn new(action: &str, identifier: &str) -> Self {
        Self {
            action: action.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Convert the key to its string representation.
    ///
    /// Used as the storage key suffix and in log fields.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.action, self.identifier)
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
