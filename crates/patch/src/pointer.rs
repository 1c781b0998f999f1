//! JSON pointer token escaping (RFC 6901).

use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid escape in pointer token {token:?} at byte {at}")]
pub struct PointerError {
    pub token: String,
    pub at: usize,
}

/// `~` -> `~0` first, then `/` -> `~1`; the order matters.
pub fn escape(key: &str) -> Cow<'_, str> {
    if !key.contains(['~', '/']) {
        return Cow::Borrowed(key);
    }
    Cow::Owned(key.replace('~', "~0").replace('/', "~1"))
}

/// Inverse of [`escape`]. A `~` not followed by `0` or `1` is rejected.
pub fn unescape(token: &str) -> Result<String, PointerError> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.char_indices();
    while let Some((i, c)) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some((_, '0')) => out.push('~'),
            Some((_, '1')) => out.push('/'),
            _ => return Err(PointerError { token: token.to_string(), at: i }),
        }
    }
    Ok(out)
}

/// `prefix` + `/` + escaped `key`.
pub fn join(prefix: &str, key: &str) -> String {
    format!("{}/{}", prefix, escape(key))
}
