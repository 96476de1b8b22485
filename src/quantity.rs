use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

lazy_static! {
    static ref UNIT_SUFFIX: Regex = Regex::new(r"([[:alpha:]]{1,2})$").unwrap();
}

/// Byte conversion for the storage quantities found in claim specs.
pub trait StorageQuantityExt {
    /// Converts the quantity to bytes.
    ///
    /// Accepts plain integers, the binary suffixes Ki..Ei and the decimal
    /// suffixes k..E (plus m for milli). Fails on unknown suffixes,
    /// non-integer amounts and overflow.
    fn to_bytes(&self) -> Result<i64>;
}

impl StorageQuantityExt for Quantity {
    fn to_bytes(&self) -> Result<i64> {
        let value = self.0.trim();
        let invalid = || Error::Validation(format!("cannot parse {:?} as a storage quantity", self.0));

        let Some(capture) = UNIT_SUFFIX.captures(value) else {
            return value.parse::<i64>().map_err(|_| invalid());
        };

        let unit = capture.get(1).map_or("", |m| m.as_str());
        let amount = value[..value.len() - unit.len()]
            .parse::<i64>()
            .map_err(|_| invalid())?;

        match unit {
            "m" => Ok(amount / 1000),
            _ => {
                let multiplier = unit_multiplier(unit).ok_or_else(|| invalid())?;
                amount.checked_mul(multiplier).ok_or_else(|| invalid())
            }
        }
    }
}

fn unit_multiplier(unit: &str) -> Option<i64> {
    Some(match unit {
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    })
}

/// Validates a user-provided disk size and returns it as a [`Quantity`].
pub fn parse_storage_size(size: &str) -> Result<Quantity> {
    if size.trim().is_empty() {
        return Err(Error::Validation("invalid disk size: must not be empty".into()));
    }
    let quantity = Quantity(size.trim().to_string());
    quantity.to_bytes()?;
    Ok(quantity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(value: &str) -> Result<i64> {
        Quantity(value.into()).to_bytes()
    }

    #[test]
    fn plain_integers_are_bytes() {
        assert_eq!(bytes("12345").unwrap(), 12345);
    }

    #[test]
    fn binary_units() {
        assert_eq!(bytes("1Ki").unwrap(), 1024);
        assert_eq!(bytes("1Mi").unwrap(), 1_048_576);
        assert_eq!(bytes("2Gi").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn decimal_units() {
        assert_eq!(bytes("1G").unwrap(), 1_000_000_000);
        assert_eq!(bytes("10G").unwrap(), 10_000_000_000);
        assert_eq!(bytes("5k").unwrap(), 5_000);
    }

    #[test]
    fn milli_divides() {
        assert_eq!(bytes("1500m").unwrap(), 1);
    }

    #[test]
    fn invalid_unit_fails() {
        assert!(bytes("12345r").is_err());
    }

    #[test]
    fn non_integer_amount_fails() {
        assert!(bytes("123.123").is_err());
    }

    #[test]
    fn overflow_fails() {
        assert!(bytes("9223372036854775807Gi").is_err());
    }

    #[test]
    fn parse_storage_size_accepts_kubernetes_syntax() {
        assert_eq!(parse_storage_size("10G").unwrap().0, "10G");
        assert_eq!(parse_storage_size(" 1Gi ").unwrap().0, "1Gi");
    }

    #[test]
    fn parse_storage_size_rejects_garbage() {
        assert!(matches!(parse_storage_size(""), Err(Error::Validation(_))));
        assert!(matches!(parse_storage_size("lots"), Err(Error::Validation(_))));
    }
}
