//! Prime Field Arithmetic
//!
//! Arithmetic over GF(P) with P = 2^256 - 2^32 - 977. Every secret chunk,
//! polynomial coefficient and share value is an element of this field.
//!
//! Elements are always kept reduced, so any `FieldElement` that exists is
//! strictly below P. Deserialization enforces the same bound.

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// Width of a serialized field element in bytes.
pub const ELEMENT_BYTES: usize = 32;

const PRIME_BYTES: [u8; ELEMENT_BYTES] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE, 0xFF, 0xFF, 0xFC, 0x2F,
];

/// The field modulus.
pub static PRIME: Lazy<BigUint> = Lazy::new(|| BigUint::from_bytes_be(&PRIME_BYTES));

static PRIME_MINUS_TWO: Lazy<BigUint> = Lazy::new(|| &*PRIME - BigUint::from(2u8));

/// An element of GF(P).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FieldElement(BigUint);

impl FieldElement {
    /// Reduce an arbitrary integer into the field.
    pub fn new(value: BigUint) -> Self {
        Self(value % &*PRIME)
    }

    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    pub fn one() -> Self {
        Self(BigUint::one())
    }

    pub fn from_u64(value: u64) -> Self {
        Self::new(BigUint::from(value))
    }

    /// Interpret big-endian bytes as an integer and reduce it.
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        Self::new(BigUint::from_bytes_be(bytes))
    }

    /// Uniformly random element drawn from the OS CSPRNG.
    pub fn random() -> Self {
        Self(OsRng.gen_biguint_below(&PRIME))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn value(&self) -> &BigUint {
        &self.0
    }

    /// Fixed-width big-endian encoding.
    pub fn to_bytes(&self) -> [u8; ELEMENT_BYTES] {
        let raw = self.0.to_bytes_be();
        let mut out = [0u8; ELEMENT_BYTES];
        out[ELEMENT_BYTES - raw.len()..].copy_from_slice(&raw);
        out
    }

    /// Big-endian encoding left-padded to `width` bytes.
    ///
    /// Returns `None` if the value does not fit, which only happens when the
    /// element did not originate from a chunk of that width.
    pub fn to_bytes_padded(&self, width: usize) -> Option<Vec<u8>> {
        if self.0.is_zero() {
            return Some(vec![0u8; width]);
        }
        let raw = self.0.to_bytes_be();
        if raw.len() > width {
            return None;
        }
        let mut out = vec![0u8; width - raw.len()];
        out.extend_from_slice(&raw);
        Some(out)
    }

    /// Multiplicative inverse via Fermat's little theorem.
    ///
    /// # Panics
    ///
    /// Panics on zero. Callers guarantee distinct interpolation points, so a
    /// zero denominator means the sharing code itself is broken.
    pub fn inverse(&self) -> Self {
        assert!(!self.is_zero(), "zero has no multiplicative inverse in GF(P)");
        Self(self.0.modpow(&PRIME_MINUS_TWO, &PRIME))
    }

    /// Evaluate `coeffs[0] + coeffs[1]·x + …` at `x` with Horner's method.
    pub fn evaluate_polynomial(coeffs: &[FieldElement], x: &FieldElement) -> FieldElement {
        coeffs
            .iter()
            .rev()
            .fold(FieldElement::zero(), |acc, c| &(&acc * x) + c)
    }

    /// Lagrange basis weights for the nodes `xs`, evaluated at `x`.
    ///
    /// The polynomial through `(xs[i], ys[i])` takes the value
    /// `Σ weights[i]·ys[i]` at `x`, so one set of weights serves every chunk
    /// shared over the same nodes. Costs a single field inversion.
    pub fn lagrange_coefficients(xs: &[FieldElement], x: &FieldElement) -> Vec<FieldElement> {
        let mut numerators = Vec::with_capacity(xs.len());
        let mut denominators = Vec::with_capacity(xs.len());
        for (i, xi) in xs.iter().enumerate() {
            let mut num = FieldElement::one();
            let mut den = FieldElement::one();
            for (j, xj) in xs.iter().enumerate() {
                if i != j {
                    num = &num * &(x - xj);
                    den = &den * &(xi - xj);
                }
            }
            numerators.push(num);
            denominators.push(den);
        }

        // Batch inversion: invert the product once, then peel each factor off
        let mut prefix = Vec::with_capacity(denominators.len());
        let mut running = FieldElement::one();
        for den in &denominators {
            prefix.push(running.clone());
            running = &running * den;
        }
        let mut inverse = running.inverse();
        let mut weights = vec![FieldElement::zero(); xs.len()];
        for i in (0..xs.len()).rev() {
            weights[i] = &numerators[i] * &(&inverse * &prefix[i]);
            inverse = &inverse * &denominators[i];
        }
        weights
    }

    /// `Σ weights[i]·values[i]`.
    pub fn weighted_sum<'a>(
        weights: &[FieldElement],
        values: impl IntoIterator<Item = &'a FieldElement>,
    ) -> FieldElement {
        weights
            .iter()
            .zip(values)
            .fold(FieldElement::zero(), |acc, (w, v)| &acc + &(w * v))
    }

    /// Lagrange interpolation of the polynomial through `points`, evaluated
    /// at `x`. All point x-coordinates must be distinct.
    pub fn interpolate(points: &[(FieldElement, FieldElement)], x: &FieldElement) -> FieldElement {
        let xs: Vec<FieldElement> = points.iter().map(|(xi, _)| xi.clone()).collect();
        let weights = Self::lagrange_coefficients(&xs, x);
        Self::weighted_sum(&weights, points.iter().map(|(_, yi)| yi))
    }
}

impl fmt::Debug for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldElement({})", hex::encode(self.to_bytes()))
    }
}

impl Add for &FieldElement {
    type Output = FieldElement;

    fn add(self, rhs: &FieldElement) -> FieldElement {
        FieldElement::new(&self.0 + &rhs.0)
    }
}

impl Sub for &FieldElement {
    type Output = FieldElement;

    fn sub(self, rhs: &FieldElement) -> FieldElement {
        // Both operands are reduced, so adding P keeps the result non-negative
        FieldElement::new(&self.0 + &*PRIME - &rhs.0)
    }
}

impl Mul for &FieldElement {
    type Output = FieldElement;

    fn mul(self, rhs: &FieldElement) -> FieldElement {
        FieldElement::new(&self.0 * &rhs.0)
    }
}

impl Serialize for FieldElement {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldElement {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <[u8; ELEMENT_BYTES]>::deserialize(deserializer)?;
        let value = BigUint::from_bytes_be(&bytes);
        if value >= *PRIME {
            return Err(de::Error::custom("field element is not below the modulus"));
        }
        Ok(FieldElement(value))
    }
}
