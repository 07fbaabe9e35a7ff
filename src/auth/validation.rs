//! Input normalization and validation for auth requests.

const PASSWORD_SPECIALS: &str = "@$!%*?&";

/// Canonical form of an email used as a rate limit identifier.
///
/// Trimming and lowercasing keeps `A@B.com ` and `a@b.com` on one counter.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// A pragmatic email shape check: one `@`, a non-empty local part, and a
/// dotted domain without empty labels.
pub fn is_valid_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return false;
    }

    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    !local.is_empty()
        && local.len() <= 64
        && !domain.contains('@')
        && domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Check registration password strength.
pub fn validate_password(password: &str) -> Result<(), &'static str> {
    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters long");
    }

    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| PASSWORD_SPECIALS.contains(c));

    if has_lower && has_upper && has_digit && has_special {
        Ok(())
    } else {
        Err("Password must contain at least one uppercase letter, one lowercase letter, one number, and one special character")
    }
}
