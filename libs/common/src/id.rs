use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// ULIDs are a 48-bit millisecond timestamp followed by 80 random bits, so
/// IDs minted later sort after earlier ones.
///
/// # Examples
/// ```
/// let id = onair_common::id::prefixed_ulid("call");
/// assert!(id.starts_with("call_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types that represent a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const CALL: &str = "call";
    pub const CONNECTION: &str = "conn";
}
