/// Canonical E.164 normalization for every phone comparison in the
/// pipeline. Binding lookups and seat matching must agree bit-for-bit on
/// equivalent inputs, so this is the only place numbers are parsed.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPhoneNumber(pub String);

pub fn normalize_phone(raw: &str, default_country_code: &str) -> Result<String, InvalidPhoneNumber> {
    let stripped = raw
        .trim()
        .strip_prefix("whatsapp:")
        .unwrap_or(raw.trim())
        .trim();
    if stripped.is_empty() {
        return Err(InvalidPhoneNumber(raw.to_string()));
    }

    let has_plus = stripped.starts_with('+');
    let digits: String = stripped.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(InvalidPhoneNumber(raw.to_string()));
    }

    if has_plus {
        if (10..=15).contains(&digits.len()) {
            return Ok(format!("+{digits}"));
        }
        return Err(InvalidPhoneNumber(raw.to_string()));
    }

    let cc = default_country_code.trim_start_matches('+');
    match digits.len() {
        10 => Ok(format!("+{cc}{digits}")),
        11 if digits.starts_with(cc) => Ok(format!("+{digits}")),
        11 if digits.starts_with('0') => Ok(format!("+{cc}{}", &digits[1..])),
        10..=15 => Ok(format!("+{digits}")),
        _ => Err(InvalidPhoneNumber(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> Result<String, InvalidPhoneNumber> {
        normalize_phone(raw, "1")
    }

    #[test]
    fn strips_channel_prefix() {
        assert_eq!(norm("whatsapp:+15551234567").unwrap(), "+15551234567");
    }

    #[test]
    fn plus_prefixed_accepted_as_is() {
        assert_eq!(norm("+447911123456").unwrap(), "+447911123456");
    }

    #[test]
    fn ten_digits_gets_default_country() {
        assert_eq!(norm("5551234567").unwrap(), "+15551234567");
    }

    #[test]
    fn eleven_digits_with_trunk_digit() {
        assert_eq!(norm("15551234567").unwrap(), "+15551234567");
    }

    #[test]
    fn national_trunk_zero_dropped() {
        assert_eq!(norm("05551234567").unwrap(), "+15551234567");
    }

    #[test]
    fn formatting_characters_ignored() {
        assert_eq!(norm("(555) 123-4567").unwrap(), "+15551234567");
        assert_eq!(norm("+1 555 123 4567").unwrap(), "+15551234567");
    }

    #[test]
    fn long_international_prepends_plus() {
        assert_eq!(norm("4479111234567").unwrap(), "+4479111234567");
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        assert!(norm("12345").is_err());
        assert!(norm("1234567890123456").is_err());
        assert!(norm("").is_err());
        assert!(norm("whatsapp:").is_err());
        assert!(norm("abc").is_err());
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "whatsapp:+15551234567",
            "5551234567",
            "15551234567",
            "05551234567",
            "+447911123456",
            "4479111234567",
        ] {
            let once = norm(raw).unwrap();
            assert_eq!(norm(&once).unwrap(), once);
        }
    }
}
