//! Exact integer arithmetic on Kubernetes resource quantities.

use snafu::{ensure, OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::api::resource::Quantity,
    memory::{BinaryMultiple, MemoryQuantity},
};

/// Largest decimal exponent and number of fraction digits accepted.
const MAX_DECIMAL_DIGITS: u32 = 18;

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("invalid quantity {value:?}"))]
    InvalidQuantity { value: String },

    #[snafu(display("quantity {value:?} is too large"))]
    QuantityTooLarge { value: String },
}

/// A quantity in thousandths of its base unit, rounded up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliQuantity(u128);

impl MilliQuantity {
    /// The value in whole base units (bytes, cores, ...), rounded up.
    pub fn ceil_units(self) -> u128 {
        self.0.div_ceil(1000)
    }
}

/// Parses plain numbers, decimal exponents (`1e3`), decimal SI suffixes (`n` to `E`) and the
/// binary suffixes understood by [`MemoryQuantity`] (`Ki` to `Ei`).
pub fn parse_quantity(quantity: &Quantity) -> Result<MilliQuantity, Error> {
    let value = quantity.0.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);

    let (numerator, denominator) =
        parse_decimal(number).context(InvalidQuantitySnafu { value })?;
    let (multiplier, divisor) = scale(quantity, suffix).context(InvalidQuantitySnafu { value })?;

    let millis = numerator
        .checked_mul(multiplier)
        .and_then(|n| n.checked_mul(1000))
        .context(QuantityTooLargeSnafu { value })?;
    Ok(MilliQuantity(millis.div_ceil(denominator * divisor)))
}

/// Whether both strings denote the same amount, e.g. `2048Mi` and `2Gi`.
pub fn same_quantity(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (
        parse_quantity(&Quantity(a.to_string())),
        parse_quantity(&Quantity(b.to_string())),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Splits `12.50` into `(1250, 100)`.
fn parse_decimal(number: &str) -> Option<(u128, u128)> {
    let (integer, fraction) = number.split_once('.').unwrap_or((number, ""));
    if integer.is_empty() && fraction.is_empty() {
        return None;
    }
    if fraction.contains('.') || fraction.len() > MAX_DECIMAL_DIGITS as usize {
        return None;
    }

    let denominator = 10u128.pow(fraction.len() as u32);
    let integer: u128 = if integer.is_empty() {
        0
    } else {
        integer.parse().ok()?
    };
    let fraction: u128 = if fraction.is_empty() {
        0
    } else {
        fraction.parse().ok()?
    };
    Some((
        integer.checked_mul(denominator)?.checked_add(fraction)?,
        denominator,
    ))
}

/// The factor a suffix applies, as `(multiplier, divisor)`.
fn scale(quantity: &Quantity, suffix: &str) -> Option<(u128, u128)> {
    if let Some(exponent) = suffix
        .strip_prefix(['e', 'E'])
        .and_then(|exponent| exponent.parse::<i32>().ok())
    {
        if exponent.unsigned_abs() > MAX_DECIMAL_DIGITS {
            return None;
        }
        let factor = 10u128.pow(exponent.unsigned_abs());
        return Some(if exponent >= 0 { (factor, 1) } else { (1, factor) });
    }

    let decimal = |exponent: u32| 10u128.pow(exponent);
    match suffix {
        "" => Some((1, 1)),
        "n" => Some((1, decimal(9))),
        "u" => Some((1, decimal(6))),
        "m" => Some((1, decimal(3))),
        "k" => Some((decimal(3), 1)),
        "M" => Some((decimal(6), 1)),
        "G" => Some((decimal(9), 1)),
        "T" => Some((decimal(12), 1)),
        "P" => Some((decimal(15), 1)),
        "E" => Some((decimal(18), 1)),
        _ => MemoryQuantity::try_from(quantity.clone())
            .ok()
            .map(|memory| (binary_multiplier(memory.unit), 1)),
    }
}

fn binary_multiplier(unit: BinaryMultiple) -> u128 {
    match unit {
        BinaryMultiple::Kibi => 1 << 10,
        BinaryMultiple::Mebi => 1 << 20,
        BinaryMultiple::Gibi => 1 << 30,
        BinaryMultiple::Tebi => 1 << 40,
        BinaryMultiple::Pebi => 1 << 50,
        BinaryMultiple::Exbi => 1 << 60,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn units(value: &str) -> u128 {
        parse_quantity(&Quantity(value.to_string()))
            .unwrap()
            .ceil_units()
    }

    #[rstest]
    #[case("1024", 1024)]
    #[case("1Ki", 1024)]
    #[case("1.5Gi", 1610612736)]
    #[case("1.1Gi", 1181116007)]
    #[case("512M", 512_000_000)]
    #[case("1e3", 1000)]
    #[case("1E", 1_000_000_000_000_000_000)]
    #[case("1500m", 2)]
    #[case("123456789123456789", 123456789123456789)]
    #[case("16Ei", 18446744073709551616)]
    fn test_parse_quantity(#[case] value: &str, #[case] expected: u128) {
        assert_eq!(units(value), expected);
    }

    #[rstest]
    #[case("")]
    #[case("lots")]
    #[case("-1Gi")]
    #[case("1.2.3")]
    #[case("1Xi")]
    #[case("1e40")]
    fn test_invalid_quantity(#[case] value: &str) {
        assert!(parse_quantity(&Quantity(value.to_string())).is_err());
    }

    #[rstest]
    #[case("2048Mi", "2Gi", true)]
    #[case("500m", "0.5", true)]
    #[case("1k", "1000", true)]
    #[case("1Gi", "1G", false)]
    #[case("2Gi", "garbage", false)]
    fn test_same_quantity(#[case] a: &str, #[case] b: &str, #[case] same: bool) {
        assert_eq!(same_quantity(a, b), same);
    }
}
