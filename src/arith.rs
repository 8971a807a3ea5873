//! Exact integer arithmetic helpers.
//!
//! Quadratic tallying needs `floor(sqrt(n))` over values that routinely exceed
//! 64 bits (token amounts carry 18 decimals), and allocation must reproduce the
//! 256-bit word semantics of the on-chain verifier.  Everything here works on
//! arbitrary-precision [`BigUint`]/[`BigInt`] values; no floating point is
//! ever involved.

use crate::error::{Result, RoundError};
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{Num, One, Zero};

/// Width of the on-chain machine word, in bits.
pub const WORD_BITS: u64 = 256;

/// Returns `floor(sqrt(n))` for a non-negative integer using Newton iteration.
///
/// The initial guess `2^ceil(bits/2)` is never below the true root, so the
/// iterates decrease monotonically and the loop stops at the floor.
pub fn isqrt(n: &BigUint) -> BigUint {
    if n.is_zero() {
        return BigUint::zero();
    }
    let mut x = BigUint::one() << ((n.bits() + 1) / 2);
    loop {
        let y = (&x + n / &x) >> 1usize;
        if y >= x {
            return x;
        }
        x = y;
    }
}

/// Signed entry point for the square root: negative input is rejected.
///
/// ```
/// use num_bigint::BigInt;
/// use qf_round::arith::integer_sqrt;
///
/// assert_eq!(integer_sqrt(&BigInt::from(99)).unwrap(), 9u32.into());
/// assert!(integer_sqrt(&BigInt::from(-4)).is_err());
/// ```
pub fn integer_sqrt(n: &BigInt) -> Result<BigUint> {
    match n.to_biguint() {
        Some(value) => Ok(isqrt(&value)),
        None => Err(RoundError::invalid_input(format!(
            "cannot take the square root of negative value {n}"
        ))),
    }
}

/// Largest value representable in one 256-bit word.
pub fn word_max() -> BigUint {
    (BigUint::one() << WORD_BITS as usize) - 1u32
}

/// Fails with [`RoundError::ArithmeticOverflow`] if `value` exceeds one word.
pub fn ensure_word(value: BigUint, what: &str) -> Result<BigUint> {
    if value.bits() > WORD_BITS {
        return Err(RoundError::ArithmeticOverflow(format!(
            "{what} exceeds 256 bits ({} bits)",
            value.bits()
        )));
    }
    Ok(value)
}

/// Multiplies two words, rejecting products that would wrap on-chain.
pub fn mul_word(a: &BigUint, b: &BigUint, what: &str) -> Result<BigUint> {
    ensure_word(a * b, what)
}

/// Adds two words, rejecting sums that would wrap on-chain.
pub fn add_word(a: &BigUint, b: &BigUint, what: &str) -> Result<BigUint> {
    ensure_word(a + b, what)
}

/// Parses a non-negative integer literal (decimal, or hex with a `0x` prefix).
pub fn parse_uint(raw: &str) -> Result<BigUint> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(RoundError::invalid_input("empty integer literal"));
    }
    if text.starts_with('-') {
        return Err(RoundError::invalid_input(format!(
            "negative value {text} where a non-negative integer is required"
        )));
    }
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex_digits) => BigUint::from_str_radix(hex_digits, 16),
        None => BigUint::from_str_radix(text, 10),
    };
    parsed.map_err(|err| RoundError::invalid_input(format!("invalid integer '{text}': {err}")))
}

/// Parses a possibly-signed decimal integer literal.
pub fn parse_int(raw: &str) -> Result<BigInt> {
    let text = raw.trim();
    BigInt::from_str_radix(text, 10)
        .map_err(|err| RoundError::invalid_input(format!("invalid integer '{text}': {err}")))
}

/// Converts a JSON number or numeric string into a signed integer.
pub fn int_from_json(value: &serde_json::Value) -> Result<BigInt> {
    match value {
        serde_json::Value::Number(num) => {
            if let Some(v) = num.as_u64() {
                Ok(BigInt::from(v))
            } else if let Some(v) = num.as_i64() {
                Ok(BigInt::from(v))
            } else {
                Err(RoundError::invalid_input(format!(
                    "expected an integer, found {num}"
                )))
            }
        }
        serde_json::Value::String(text) => parse_int(text),
        other => Err(RoundError::invalid_input(format!(
            "expected an integer, found {other}"
        ))),
    }
}

/// Returns `true` for values that carry a sign of [`Sign::Minus`].
pub(crate) fn is_negative(value: &BigInt) -> bool {
    value.sign() == Sign::Minus
}

/// Serde adapter storing a [`BigUint`] as a decimal string.
///
/// Deserialisation also accepts plain JSON integers.
pub mod decimal {
    use num_bigint::BigUint;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    /// Serialises as a base-10 string.
    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    /// Accepts a decimal/hex string or a non-negative JSON integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        deserializer.deserialize_any(DecimalVisitor)
    }

    struct DecimalVisitor;

    impl<'de> Visitor<'de> for DecimalVisitor {
        type Value = BigUint;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a non-negative integer or integer string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<BigUint, E> {
            Ok(BigUint::from(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<BigUint, E> {
            u64::try_from(v)
                .map(BigUint::from)
                .map_err(|_| E::custom(format!("negative value {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<BigUint, E> {
            super::parse_uint(v).map_err(E::custom)
        }
    }

    #[derive(serde::Deserialize)]
    #[serde(transparent)]
    pub(crate) struct Wrapped(#[serde(with = "crate::arith::decimal")] pub(crate) BigUint);
}

/// Serde adapter for `Vec<BigUint>` as an array of decimal strings.
pub mod decimal_vec {
    use super::decimal::Wrapped;
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialises every element as a base-10 string.
    pub fn serialize<S: Serializer>(values: &[BigUint], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|v| v.to_str_radix(10)))
    }

    /// Accepts an array of decimal strings or integers.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<BigUint>, D::Error> {
        let raw = Vec::<Wrapped>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|w| w.0).collect())
    }
}

/// Serde adapter for Merkle paths (`Vec<Vec<BigUint>>`).
pub mod decimal_nested {
    use super::decimal::Wrapped;
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialises as nested arrays of base-10 strings.
    pub fn serialize<S: Serializer>(
        values: &[Vec<BigUint>],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|level| {
            level
                .iter()
                .map(|v| v.to_str_radix(10))
                .collect::<Vec<_>>()
        }))
    }

    /// Accepts nested arrays of decimal strings or integers.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<BigUint>>, D::Error> {
        let raw = Vec::<Vec<Wrapped>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|level| level.into_iter().map(|w| w.0).collect())
            .collect())
    }
}

/// Serde adapter for optional decimal values.
pub mod decimal_opt {
    use super::decimal::Wrapped;
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialises `Some` as a base-10 string and `None` as null.
    pub fn serialize<S: Serializer>(
        value: &Option<BigUint>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_str_radix(10)),
            None => serializer.serialize_none(),
        }
    }

    /// Accepts null, a decimal string or an integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<BigUint>, D::Error> {
        let raw = Option::<Wrapped>::deserialize(deserializer)?;
        Ok(raw.map(|w| w.0))
    }
}
