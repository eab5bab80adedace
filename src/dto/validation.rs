//! Validation helpers for DTOs.

use serde_json::Value;
use validator::ValidationError;

/// Longest accepted activity identifier.
pub const MAX_ACTIVITY_TYPE_LEN: usize = 64;

/// Validates that an activity type is 1 to 64 characters of lowercase ASCII letters, digits,
/// `-` or `_`.
///
/// # Examples
///
/// ```ignore
/// validate_activity_type("quiz")        // Ok
/// validate_activity_type("farm-2")      // Ok
/// validate_activity_type("Quiz")        // Err - uppercase
/// validate_activity_type("")            // Err - empty
/// ```
pub fn validate_activity_type(activity_type: &str) -> Result<(), ValidationError> {
    if activity_type.is_empty() || activity_type.len() > MAX_ACTIVITY_TYPE_LEN {
        let mut err = ValidationError::new("activity_type_length");
        err.message = Some(
            format!(
                "Activity type must be between 1 and {MAX_ACTIVITY_TYPE_LEN} characters (got {})",
                activity_type.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !activity_type
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        let mut err = ValidationError::new("activity_type_format");
        err.message = Some(
            "Activity type must contain only lowercase letters, digits, `-` or `_`".into(),
        );
        return Err(err);
    }

    Ok(())
}

/// Validates that a snapshot state blob is a JSON object.
pub fn validate_state_object(state: &Value) -> Result<(), ValidationError> {
    if state.is_object() {
        return Ok(());
    }

    let mut err = ValidationError::new("state_format");
    err.message = Some("Snapshot state must be a JSON object".into());
    Err(err)
}
