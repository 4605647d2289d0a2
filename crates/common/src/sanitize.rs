// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Identifier and port validation applied before any string composition

use crate::error::ValidationError;

/// Characters allowed besides ASCII letters and digits.
/// `:` `[` `]` cover IPv6 literals, `@` covers user@host forms.
const EXTRA_ALLOWED: &[char] = &['.', '-', '_', '@', ':', '[', ']'];

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || EXTRA_ALLOWED.contains(&c)
}

/// Check a username, hostname or address against the allow-list
///
/// A leading `-` is rejected so the value is never read as an ssh option.
/// Returns the value unchanged on success so callers can chain it into formatting.
pub fn validate_identifier<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.starts_with('-') {
        return Err(ValidationError::LeadingDash {
            field,
            value: value.to_string(),
        });
    }
    if let Some(character) = value.chars().find(|c| !is_allowed(*c)) {
        return Err(ValidationError::InvalidCharacter {
            field,
            value: value.to_string(),
            character,
        });
    }
    Ok(value)
}

/// Like [`validate_identifier`] but an empty value is accepted (and omitted by callers)
pub fn validate_optional_identifier<'a>(
    value: &'a str,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    if value.is_empty() {
        Ok(value)
    } else {
        validate_identifier(value, field)
    }
}

/// Range-check a port value; never wraps
pub fn validate_port(value: i64, field: &'static str) -> Result<u16, ValidationError> {
    if (1..=i64::from(u16::MAX)).contains(&value) {
        Ok(value as u16)
    } else {
        Err(ValidationError::PortOutOfRange { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_shell_metacharacters() {
        for bad in ["host;rm", "a|b", "a&b", "$HOME", "`id`", "x(1)", "x)", "two words", "a/b", "ä"] {
            let err = validate_identifier(bad, "hostname").unwrap_err();
            match err {
                ValidationError::InvalidCharacter { field, value, .. } => {
                    assert_eq!(field, "hostname");
                    assert_eq!(value, bad);
                }
                other => panic!("unexpected error for {}: {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_reports_offending_character() {
        let err = validate_identifier("db;reboot", "hostname").unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidCharacter {
                field: "hostname",
                value: "db;reboot".to_string(),
                character: ';',
            }
        );
        assert!(err.to_string().contains("';'"));
    }

    #[test]
    fn test_accepts_allow_list() {
        for good in [
            "bastion-01.example.com",
            "user_name",
            "deploy@corp",
            "10.0.0.1",
            "::1",
            "[fe80::1]",
            "ABCxyz789",
        ] {
            assert_eq!(validate_identifier(good, "hostname").unwrap(), good);
        }
    }

    #[test]
    fn test_rejects_option_lookalikes() {
        for bad in ["-G", "-oProxyCommand", "--help"] {
            assert_eq!(
                validate_identifier(bad, "hostname").unwrap_err(),
                ValidationError::LeadingDash {
                    field: "hostname",
                    value: bad.to_string(),
                }
            );
        }
        // '=' is outside the allow-list, but the dash is reported first
        assert!(matches!(
            validate_identifier("-oProxyCommand=x", "username"),
            Err(ValidationError::LeadingDash { field: "username", .. })
        ));
        assert!(validate_optional_identifier("-l", "username").is_err());
        assert_eq!(validate_identifier("a-b", "hostname").unwrap(), "a-b");
        assert_eq!(validate_identifier("bastion-", "hostname").unwrap(), "bastion-");
    }

    #[test]
    fn test_empty_identifier() {
        assert_eq!(
            validate_identifier("", "username").unwrap_err(),
            ValidationError::Empty { field: "username" }
        );
        assert_eq!(validate_optional_identifier("", "username").unwrap(), "");
        assert!(validate_optional_identifier("a;b", "username").is_err());
    }

    #[test]
    fn test_port_bounds() {
        for bad in [0, -1, 65536, i64::MIN, i64::MAX] {
            assert_eq!(
                validate_port(bad, "port").unwrap_err(),
                ValidationError::PortOutOfRange { field: "port", value: bad }
            );
        }
        assert_eq!(validate_port(1, "port").unwrap(), 1);
        assert_eq!(validate_port(22, "port").unwrap(), 22);
        assert_eq!(validate_port(65535, "port").unwrap(), 65535);
    }
}
