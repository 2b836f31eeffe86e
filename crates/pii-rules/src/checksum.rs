//! Checksum validators used to discard pattern matches that cannot be real
//! identifiers (Luhn, SSN area rules, IBAN mod-97, Verhoeff)

use std::str::FromStr;

/// Post-match validator attached to a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validator {
    /// Payment cards, IMEI
    Luhn,
    /// US social security number area/group/serial rules
    Ssn,
    /// International bank account number
    Iban,
    /// Verhoeff check digit (Aadhaar)
    Verhoeff,
}

impl Validator {
    /// Run the validator against a matched span
    #[inline]
    pub fn validate(&self, text: &str) -> bool {
        match self {
            Self::Luhn => luhn_valid(text),
            Self::Ssn => ssn_valid(text),
            Self::Iban => iban_valid(text),
            Self::Verhoeff => verhoeff_valid(text),
        }
    }
}

impl FromStr for Validator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "luhn" => Ok(Self::Luhn),
            "ssn" => Ok(Self::Ssn),
            "iban" => Ok(Self::Iban),
            "verhoeff" | "aadhaar" => Ok(Self::Verhoeff),
            _ => Err(s.to_string()),
        }
    }
}

/// Validate using Luhn algorithm (credit cards, IMEI)
#[inline]
pub fn luhn_valid(digits: &str) -> bool {
    let digits: Vec<u8> = digits
        .chars()
        .filter(|c| c.is_ascii_digit())
        .map(|c| c as u8 - b'0')
        .collect();

    if digits.len() < 2 {
        return false;
    }

    let mut sum: u32 = 0;
    for (i, &d) in digits.iter().rev().enumerate() {
        let mut val = d as u32;
        if i % 2 == 1 {
            val *= 2;
            if val > 9 {
                val -= 9;
            }
        }
        sum += val;
    }

    sum % 10 == 0
}

/// Validate SSN format (area number validation)
#[inline]
pub fn ssn_valid(ssn: &str) -> bool {
    let digits: String = ssn.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() != 9 {
        return false;
    }

    let area = &digits[0..3];
    let group = &digits[3..5];
    let serial = &digits[5..9];

    // Area cannot be 000, 666, or 900-999
    if area == "000" || area == "666" || area.starts_with('9') {
        return false;
    }

    if group == "00" || serial == "0000" {
        return false;
    }

    true
}

/// Validate IBAN format (basic check)
#[inline]
pub fn iban_valid(iban: &str) -> bool {
    let normalized: String = iban
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.len() < 15 || normalized.len() > 34 {
        return false;
    }

    // Move first 4 chars to end and convert letters to numbers
    let rearranged = format!("{}{}", &normalized[4..], &normalized[0..4]);

    let mut remainder = 0u32;
    for c in rearranged.chars() {
        let value = if c.is_ascii_digit() {
            c as u32 - '0' as u32
        } else {
            c as u32 - 'A' as u32 + 10
        };
        for d in value.to_string().chars().filter_map(|d| d.to_digit(10)) {
            remainder = (remainder * 10 + d) % 97;
        }
    }

    remainder == 1
}

const VERHOEFF_D: [[u8; 10]; 10] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 2, 3, 4, 0, 6, 7, 8, 9, 5],
    [2, 3, 4, 0, 1, 7, 8, 9, 5, 6],
    [3, 4, 0, 1, 2, 8, 9, 5, 6, 7],
    [4, 0, 1, 2, 3, 9, 5, 6, 7, 8],
    [5, 9, 8, 7, 6, 0, 4, 3, 2, 1],
    [6, 5, 9, 8, 7, 1, 0, 4, 3, 2],
    [7, 6, 5, 9, 8, 2, 1, 0, 4, 3],
    [8, 7, 6, 5, 9, 3, 2, 1, 0, 4],
    [9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
];

const VERHOEFF_P: [[u8; 10]; 8] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 5, 7, 6, 2, 8, 3, 0, 9, 4],
    [5, 8, 0, 3, 7, 9, 6, 1, 4, 2],
    [8, 9, 1, 6, 0, 4, 3, 5, 2, 7],
    [9, 4, 5, 3, 1, 2, 6, 8, 7, 0],
    [4, 2, 8, 6, 5, 7, 3, 9, 0, 1],
    [2, 7, 9, 3, 8, 0, 6, 4, 1, 5],
    [7, 0, 4, 6, 9, 1, 3, 2, 5, 8],
];

/// Validate a Verhoeff check digit (last digit of the sequence)
#[inline]
pub fn verhoeff_valid(digits: &str) -> bool {
    let digits: Vec<u8> = digits
        .chars()
        .filter(|c| c.is_ascii_digit())
        .map(|c| c as u8 - b'0')
        .collect();

    if digits.len() < 2 {
        return false;
    }

    let mut check = 0u8;
    for (i, &d) in digits.iter().rev().enumerate() {
        check = VERHOEFF_D[check as usize][VERHOEFF_P[i % 8][d as usize] as usize];
    }
    check == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luhn_valid() {
        assert!(luhn_valid("4111111111111111"));
        assert!(luhn_valid("4111-1111-1111-1111"));
        assert!(luhn_valid("5500 0000 0000 0004"));

        assert!(!luhn_valid("1234567890123456"));
        assert!(!luhn_valid("7"));
    }

    #[test]
    fn test_ssn_valid() {
        assert!(ssn_valid("123-45-6789"));
        assert!(ssn_valid("078-05-1120"));

        assert!(!ssn_valid("000-12-3456"));
        assert!(!ssn_valid("666-12-3456"));
        assert!(!ssn_valid("900-12-3456"));
        assert!(!ssn_valid("123-00-4567"));
        assert!(!ssn_valid("123-45-0000"));
    }

    #[test]
    fn test_iban_valid() {
        assert!(iban_valid("GB82WEST12345698765432"));
        assert!(iban_valid("DE89 3704 0044 0532 0130 00"));

        assert!(!iban_valid("GB82WEST12345698765431"));
        assert!(!iban_valid("GB82"));
    }

    #[test]
    fn test_verhoeff_valid() {
        assert!(verhoeff_valid("2363"));
        assert!(!verhoeff_valid("2364"));
    }

    #[test]
    fn test_validator_from_str() {
        assert_eq!("LUHN".parse::<Validator>(), Ok(Validator::Luhn));
        assert_eq!("aadhaar".parse::<Validator>(), Ok(Validator::Verhoeff));
        assert!("crc32".parse::<Validator>().is_err());
        assert!(Validator::Luhn.validate("4111 1111 1111 1111"));
    }
}
