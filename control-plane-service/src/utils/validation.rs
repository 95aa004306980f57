//! Request validation helpers.

use service_core::error::FieldError;
use validator::ValidationErrors;

/// Password strength check; every violation is reported.
pub fn validate_password_strength(password: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if password.len() < 8 {
        errors.push(FieldError::new(
            "new_password",
            "password must be at least 8 characters",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        errors.push(FieldError::new(
            "new_password",
            "password must contain at least one uppercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        errors.push(FieldError::new(
            "new_password",
            "password must contain at least one number",
        ));
    }

    errors
}

/// Flatten `validator` derive output into the API's field-error shape.
pub fn collect_validator_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, field_errors)| {
            field_errors.iter().map(|e| {
                FieldError::new(
                    field.to_string(),
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("invalid {}", e.code)),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_password_reports_all_violations() {
        let errors = validate_password_strength("short");
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn strong_password_passes() {
        assert!(validate_password_strength("CorrectHorse7").is_empty());
    }

    #[test]
    fn missing_digit_reported() {
        let errors = validate_password_strength("NoDigitsHere");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].key, "new_password");
    }
}
