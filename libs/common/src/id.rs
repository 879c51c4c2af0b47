use ulid::Ulid;

/// `<prefix>_<ulid>`, e.g. `req_01J8Z3...`.
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{prefix}_{}", Ulid::new())
}

/// Split an identifier produced by [`prefixed_ulid`] back into its prefix and
/// ULID. Returns `None` for anything else.
pub fn parse_prefixed(id: &str) -> Option<(&str, Ulid)> {
    let (prefix, ulid) = id.rsplit_once('_')?;
    if prefix.is_empty() {
        return None;
    }
    Ulid::from_string(ulid).ok().map(|ulid| (prefix, ulid))
}

/// Prefixes for connection and request identifiers.
pub mod prefix {
    /// One accepted WebSocket connection.
    pub const CONNECTION: &str = "conn";
    /// A regular chat message relayed from a session.
    pub const REQUEST: &str = "req";
    /// A message pushed through the HTTP fallback ingress.
    pub const INGRESS: &str = "ing";
    pub const TYPING: &str = "typ";
    pub const READ_RECEIPT: &str = "rr";
}
