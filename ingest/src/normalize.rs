//! Contact field canonicalization, shared by idempotency key derivation and
//! duplicate matching. These must stay in lockstep: a lead is only ever
//! compared against values produced by the same functions at ingest time.

use std::sync::LazyLock;

use regex::Regex;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static E164_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+[1-9]\d{7,15}$").unwrap());

/// Trim and lowercase; anything that does not look like `local@domain.tld`
/// normalizes to None rather than an unusable match key.
pub fn normalize_email(email: &str) -> Option<String> {
    let e = email.trim().to_lowercase();
    if e.is_empty() || !EMAIL_RE.is_match(&e) {
        return None;
    }
    Some(e)
}

/// E.164 numbers pass through unchanged; everything else is stripped to its
/// digits. Fewer than 7 digits is not a phone number.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let p = phone.trim();
    if p.is_empty() {
        return None;
    }
    if E164_RE.is_match(p) {
        return Some(p.to_owned());
    }
    let digits: String = p.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return None;
    }
    Some(digits)
}

pub fn normalize_postal(postal: &str) -> String {
    postal.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_lowercases_and_trims() {
        assert_eq!(
            normalize_email("  Jane@Example.COM "),
            Some("jane@example.com".to_owned())
        );
    }

    #[test]
    fn email_rejects_implausible_shapes() {
        assert_eq!(normalize_email(""), None);
        assert_eq!(normalize_email("   "), None);
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email("a@b"), None);
        assert_eq!(normalize_email("a b@example.com"), None);
    }

    #[test]
    fn phone_keeps_e164() {
        assert_eq!(
            normalize_phone("+15125550123"),
            Some("+15125550123".to_owned())
        );
    }

    #[test]
    fn phone_strips_formatting_to_digits() {
        assert_eq!(
            normalize_phone("(512) 555-0123"),
            Some("5125550123".to_owned())
        );
    }

    #[test]
    fn phone_with_too_few_digits_is_null() {
        assert_eq!(normalize_phone("555-0"), None);
        assert_eq!(normalize_phone(""), None);
        assert_eq!(normalize_phone("call me"), None);
    }

    #[test]
    fn postal_trims_and_uppercases() {
        assert_eq!(normalize_postal(" 78701 "), "78701");
        assert_eq!(normalize_postal("m5v 2t6"), "M5V 2T6");
    }
}
