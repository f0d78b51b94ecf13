//! Input validators and the HTML sanitizer applied to user-supplied text.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::AppError;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));
static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("valid script regex"));
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("valid style regex"));
static IMG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<img[^>]*>").expect("valid img regex"));
// A `<` followed by whitespace is treated as text, not a tag.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<(?:[^\s>][^>]*)?>").expect("valid tag regex"));
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

pub fn validate_email(email: Option<&str>) -> Result<(), AppError> {
    let email = email.unwrap_or_default();
    if email.is_empty() {
        return Err(AppError::Validation("Email is required".into()));
    }
    if EMAIL_RE.is_match(email) {
        Ok(())
    } else {
        Err(AppError::Validation("Invalid email format".into()))
    }
}

/// Optional character-class requirements on top of the minimum length.
#[derive(Debug, Clone, Copy)]
pub struct PasswordRules {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_number: bool,
    pub require_special_char: bool,
}

impl Default for PasswordRules {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_uppercase: false,
            require_lowercase: false,
            require_number: false,
            require_special_char: false,
        }
    }
}

/// Collects every failed rule; the message joins them with `, `.
pub fn validate_password(password: &str, rules: &PasswordRules) -> Result<(), AppError> {
    let mut errors = Vec::new();
    if password.chars().count() < rules.min_length {
        errors.push(format!("Password must be at least {} characters", rules.min_length));
    }
    if rules.require_uppercase && !password.chars().any(|c| c.is_ascii_uppercase()) {
        errors.push("Password must contain uppercase letter".to_string());
    }
    if rules.require_lowercase && !password.chars().any(|c| c.is_ascii_lowercase()) {
        errors.push("Password must contain lowercase letter".to_string());
    }
    if rules.require_number && !password.chars().any(|c| c.is_ascii_digit()) {
        errors.push("Password must contain number".to_string());
    }
    if rules.require_special_char && password.chars().all(|c| c.is_ascii_alphanumeric()) {
        errors.push("Password must contain special character".to_string());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::ValidationList { message: errors.join(", "), errors })
    }
}

/// Returns the value when present and not blank.
pub fn validate_required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, AppError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::Validation(format!("{} is required", field))),
    }
}

/// Length bounds in characters; failures are joined with ` and `.
pub fn validate_length(field: &str, value: &str, min: Option<usize>, max: Option<usize>) -> Result<(), AppError> {
    let len = value.chars().count();
    let mut errors = Vec::new();
    if let Some(min) = min {
        if len < min {
            errors.push(format!("must be at least {} characters", min));
        }
    }
    if let Some(max) = max {
        if len > max {
            errors.push(format!("must not exceed {} characters", max));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!("{} {}", field, errors.join(" and "))))
    }
}

/// Strips markup from user text and escapes what is left.
///
/// `<script>`/`<style>` elements are removed together with their contents, `<img>` tags and
/// any other tag are dropped, whitespace is trimmed and collapsed, then `& < > "` are escaped.
pub fn sanitize_input(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let without_scripts = SCRIPT_RE.replace_all(input, "");
    let without_styles = STYLE_RE.replace_all(&without_scripts, "");
    let without_images = IMG_RE.replace_all(&without_styles, "");
    let without_tags = TAG_RE.replace_all(&without_images, "");
    let collapsed = WHITESPACE_RE.replace_all(without_tags.trim(), " ");

    collapsed
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
