//! Namespace ids.
//!
//! A session's namespace id is its account name right-padded with `#` to
//! 16 characters followed by its session qualifier right-padded to 8. All
//! namespace ids therefore have the same length, and as `#` may not occur
//! inside either part, no namespace id is a prefix of another. Destination
//! ids published by a session start with its namespace id.

use crate::protocol::{
    ACCOUNT_NAME_SIGNIFICANT_CHARACTERS, DESTINATION_ID_PREFIX_LENGTH,
    DESTINATION_ID_PREFIX_PADDING_CHARACTER, SESSION_QUALIFIER_DEFAULT,
    SESSION_QUALIFIER_SIGNIFICANT_CHARACTERS,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Why a namespace id could not be derived.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamespaceError {
    #[error("Missing account name")]
    EmptyAccountName,
    #[error(
        "The {field} '{value}' contains the reserved character '{pad}'",
        pad = DESTINATION_ID_PREFIX_PADDING_CHARACTER
    )]
    ReservedCharacter { field: &'static str, value: String },
}

fn truncate_chars(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

fn right_pad(value: &str, width: usize) -> String {
    let mut padded = value.to_string();
    let count = value.chars().count();
    padded.extend(std::iter::repeat(DESTINATION_ID_PREFIX_PADDING_CHARACTER).take(width.saturating_sub(count)));
    padded
}

fn check_reserved(field: &'static str, value: &str) -> Result<(), NamespaceError> {
    if value.contains(DESTINATION_ID_PREFIX_PADDING_CHARACTER) {
        return Err(NamespaceError::ReservedCharacter {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// The account name as used for the namespace id.
pub fn effective_account_name(login_account_name: &str) -> Result<String, NamespaceError> {
    if login_account_name.is_empty() {
        return Err(NamespaceError::EmptyAccountName);
    }
    check_reserved("account name", login_account_name)?;
    let truncated = truncate_chars(login_account_name, ACCOUNT_NAME_SIGNIFICANT_CHARACTERS);
    if truncated.len() != login_account_name.len() {
        warn!(
            account = login_account_name,
            used = truncated,
            "Uplink: only the first {ACCOUNT_NAME_SIGNIFICANT_CHARACTERS} characters of the login name identify the client"
        );
    }
    Ok(truncated.to_string())
}

/// The client's session qualifier as used for the namespace id.
pub fn effective_session_qualifier(qualifier: Option<&str>) -> Result<String, NamespaceError> {
    let qualifier = match qualifier {
        Some(q) if !q.is_empty() => q,
        _ => {
            debug!("Uplink: empty client id, using '{SESSION_QUALIFIER_DEFAULT}'");
            SESSION_QUALIFIER_DEFAULT
        }
    };
    check_reserved("client id", qualifier)?;
    let truncated = truncate_chars(qualifier, SESSION_QUALIFIER_SIGNIFICANT_CHARACTERS);
    if truncated.len() != qualifier.len() {
        warn!(
            client_id = qualifier,
            used = truncated,
            "Uplink: truncating client id to {SESSION_QUALIFIER_SIGNIFICANT_CHARACTERS} characters"
        );
    }
    Ok(truncated.to_string())
}

/// Join already validated parts into a namespace id.
pub fn derive_namespace_id(account_name: &str, session_qualifier: &str) -> String {
    let id = right_pad(account_name, ACCOUNT_NAME_SIGNIFICANT_CHARACTERS)
        + &right_pad(session_qualifier, SESSION_QUALIFIER_SIGNIFICANT_CHARACTERS);
    debug_assert_eq!(id.chars().count(), DESTINATION_ID_PREFIX_LENGTH);
    id
}

/// Validate, truncate and join in one step.
pub fn namespace_id_for(
    login_account_name: &str,
    session_qualifier: Option<&str>,
) -> Result<String, NamespaceError> {
    let account = effective_account_name(login_account_name)?;
    let qualifier = effective_session_qualifier(session_qualifier)?;
    Ok(derive_namespace_id(&account, &qualifier))
}

/// Whether `destination_id` belongs to the session owning `namespace_id`.
pub fn owns_destination(namespace_id: &str, destination_id: &str) -> bool {
    destination_id.starts_with(namespace_id)
}
