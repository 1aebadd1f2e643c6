use base64::{engine::general_purpose::STANDARD, Engine};
use http::{header::AUTHORIZATION, HeaderMap};

use crate::{error::TopologyError, models::route_rule::Credential};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted,
    Missing,
    Rejected,
}

/// Parses `user:hash` entries as written in a basicauth users label.
/// Entries are comma separated, compose `$$` escapes are undone.
pub fn parse_users(service: &str, label: &str, raw: &str) -> Result<Vec<Credential>, TopologyError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = |reason: &str| TopologyError::InvalidLabel {
                service: service.to_string(),
                label: label.to_string(),
                reason: reason.to_string(),
            };
            let (user, hash) = entry.split_once(':').ok_or_else(|| invalid("expected user:hash"))?;
            let hash = hash.replace("$$", "$");
            if user.is_empty() {
                return Err(invalid("empty user name"));
            }
            if !is_bcrypt_hash(&hash) {
                return Err(invalid("only bcrypt hashes ($2a$, $2b$, $2y$) are supported"));
            }
            Ok(Credential {
                user: user.to_string(),
                hash,
            })
        })
        .collect()
}

fn is_bcrypt_hash(hash: &str) -> bool {
    ["$2a$", "$2b$", "$2x$", "$2y$"]
        .iter()
        .any(|prefix| hash.starts_with(prefix))
}

/// Decodes an `Authorization: Basic ...` header into user and password.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Hash to verify the password against and whether `user` exists. Unknown users are
/// checked against another user's hash so both paths pay the bcrypt cost.
fn verification_hash<'a>(users: &'a [Credential], user: &str) -> Option<(&'a str, bool)> {
    match users.iter().find(|c| c.user == user) {
        Some(credential) => Some((credential.hash.as_str(), true)),
        None => users.first().map(|decoy| (decoy.hash.as_str(), false)),
    }
}

pub fn check_basic_auth(headers: &HeaderMap, users: &[Credential]) -> AuthOutcome {
    let (user, password) = match basic_credentials(headers) {
        Some(credentials) => credentials,
        None => return AuthOutcome::Missing,
    };
    let (hash, known) = match verification_hash(users, &user) {
        Some(target) => target,
        None => return AuthOutcome::Rejected,
    };
    let verified = bcrypt::verify(password, hash);
    if !known {
        tracing::debug!("basic auth: unknown user {}", user);
        return AuthOutcome::Rejected;
    }
    match verified {
        Ok(true) => AuthOutcome::Granted,
        Ok(false) => AuthOutcome::Rejected,
        Err(err) => {
            tracing::warn!("basic auth: cannot verify hash for {}: {}", user, err);
            AuthOutcome::Rejected
        }
    }
}

/// `user:hash` line, doubling `$` when the output goes into a compose file.
pub fn htpasswd_line(user: &str, password: &str, cost: u32, compose_escape: bool) -> Result<String, bcrypt::BcryptError> {
    let hash = bcrypt::hash(password, cost)?;
    let hash = if compose_escape { hash.replace('$', "$$") } else { hash };
    Ok(format!("{user}:{hash}"))
}
