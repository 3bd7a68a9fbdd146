use axum::http::{header::AUTHORIZATION, HeaderMap};

pub const BEARER_PREFIX: &str = "Bearer ";

/// Compares two secrets without short-circuiting on the first differing byte.
///
/// Runtime depends only on the longer input's length, so a mismatch leaks
/// nothing about how long a matching prefix was.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let len = a.len().max(b.len());

    let mut diff = a.len() ^ b.len();
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix(BEARER_PREFIX)
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Decides whether a registration may join the pool.
///
/// With no configured secret every worker is accepted. Otherwise the token
/// carried in the registration message wins, falling back to the bearer token
/// presented on the upgrade request.
pub fn verify_registration(
    expected: Option<&str>,
    message_token: Option<&str>,
    upgrade_token: Option<&str>,
) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    match message_token.or(upgrade_token) {
        Some(provided) => constant_time_eq(expected, provided),
        None => false,
    }
}
