//! Field checks shared by the account and content payloads.

use lazy_static::lazy_static;
use regex::Regex;

use crate::resp::problem::{problems, Problem};

lazy_static! {
    static ref EMAIL: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    static ref PHONE: Regex = Regex::new(r"^\+?[0-9]{10}$").unwrap();
}

pub const PASSWORD_MIN: usize = 8;
pub const PASSWORD_MAX: usize = 30;

pub fn email(value: &str) -> Result<String, Problem> {
    let normalized = value.trim().to_lowercase();
    if !EMAIL.is_match(&normalized) {
        return Err(problems::invalid_field(
            "email",
            "Not a valid e-mail address.",
        ));
    }
    Ok(normalized)
}

pub fn password(value: &str) -> Result<(), Problem> {
    let length = value.chars().count();
    if !(PASSWORD_MIN..=PASSWORD_MAX).contains(&length) {
        return Err(problems::invalid_field(
            "password",
            format!(
                "Password must be between {} and {} characters long.",
                PASSWORD_MIN, PASSWORD_MAX
            ),
        ));
    }

    let strong = !value.chars().any(char::is_whitespace)
        && value.chars().any(|c| c.is_lowercase())
        && value.chars().any(|c| c.is_uppercase())
        && value.chars().any(|c| c.is_ascii_digit())
        && value.chars().any(|c| !c.is_alphanumeric());

    if !strong {
        return Err(problems::invalid_field(
            "password",
            "Password must contain at least one uppercase letter, one lowercase letter, one number and one special character",
        ));
    }

    Ok(())
}

pub fn phone(value: &str) -> Result<String, Problem> {
    let trimmed = value.trim();
    if !PHONE.is_match(trimmed) {
        return Err(problems::invalid_field(
            "phone_number",
            "Phone number must be 10 digits.",
        ));
    }
    Ok(trimmed.to_string())
}

/// Trimmed text whose length (in chars) falls within `min..=max`.
pub fn text(field: &str, value: &str, min: usize, max: usize) -> Result<String, Problem> {
    let trimmed = value.trim();
    let length = trimmed.chars().count();
    if length < min || length > max {
        let detail = if min == 0 {
            format!("{} must be at most {} characters.", field, max)
        } else {
            format!("{} must be between {} and {} characters.", field, min, max)
        };
        return Err(problems::invalid_field(field, detail));
    }
    Ok(trimmed.to_string())
}

pub fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, Problem> {
    match value {
        Some(it) if !it.trim().is_empty() => Ok(it),
        _ => Err(problems::invalid_field(
            field,
            format!("{} is required.", field),
        )),
    }
}

pub fn required_value<T>(field: &str, value: Option<T>) -> Result<T, Problem> {
    value.ok_or_else(|| problems::invalid_field(field, format!("{} is required.", field)))
}

pub fn grade(value: u8) -> Result<u8, Problem> {
    if !(1..=12).contains(&value) {
        return Err(problems::invalid_field(
            "grade",
            "Grade must be a number between 1 - 12",
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_normalized() {
        assert_eq!(email("  Jane.Doe@School.EDU ").unwrap(), "jane.doe@school.edu");
        assert!(email("not-an-email").is_err());
        assert!(email("a@b").is_err());
    }

    #[test]
    fn password_strength_rules() {
        assert!(password("Str0ng!pass").is_ok());
        assert!(password("weakpass").is_err());
        assert!(password("NoDigits!!").is_err());
        assert!(password("nouppercase1!").is_err());
        assert!(password("Has Space1!").is_err());
        assert!(password("Sh0rt!").is_err());
        assert!(password(&format!("Aa1!{}", "x".repeat(40))).is_err());
    }

    #[test]
    fn phone_numbers() {
        assert_eq!(phone("5550102030").unwrap(), "5550102030");
        assert!(phone("+2505550102").is_ok());
        assert!(phone("555-010-2030").is_err());
    }

    #[test]
    fn text_bounds_are_inclusive() {
        assert_eq!(text("title", "  abc ", 3, 100).unwrap(), "abc");
        assert!(text("title", "ab", 3, 100).is_err());
        assert!(text("description", &"x".repeat(501), 0, 500).is_err());
    }

    #[test]
    fn grades() {
        assert!(grade(0).is_err());
        assert!(grade(12).is_ok());
        assert!(grade(13).is_err());
    }
}
