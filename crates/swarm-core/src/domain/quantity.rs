//! CPU and memory quantities as written in manifests.
//!
//! CPU accepts a positive decimal number of cores (`0.5`, `2`) or an integer
//! count of millicores (`500m`). Memory accepts plain bytes or a binary
//! (`Ki`, `Mi`, `Gi`, `Ti`) or decimal (`k`, `M`, `G`, `T`) suffix.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Parse failure for a quantity string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid quantity '{input}': {reason}")]
pub struct QuantityError {
    pub input: String,
    pub reason: String,
}

impl QuantityError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Split `"1.25"` into `(1, 25, 2)`: integer part, fraction digits, fraction length.
fn split_decimal(input: &str, number: &str) -> Result<(u64, u64, u32), QuantityError> {
    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(QuantityError::new(input, "missing number"));
    }
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(QuantityError::new(input, "expected a non-negative number"));
    }
    if number.ends_with('.') {
        return Err(QuantityError::new(input, "dangling decimal point"));
    }
    let int_value = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse::<u64>()
            .map_err(|_| QuantityError::new(input, "number out of range"))?
    };
    let frac_value = if frac_part.is_empty() {
        0
    } else {
        frac_part
            .parse::<u64>()
            .map_err(|_| QuantityError::new(input, "too many decimal places"))?
    };
    Ok((int_value, frac_value, frac_part.len() as u32))
}

/// CPU request in millicores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuQuantity(u32);

impl CpuQuantity {
    pub const DEFAULT: CpuQuantity = CpuQuantity(500);

    pub fn from_millis(millis: u32) -> Self {
        Self(millis)
    }

    pub fn millis(&self) -> u32 {
        self.0
    }

    /// Fractional cores, e.g. `0.5`.
    pub fn cores(&self) -> f64 {
        f64::from(self.0) / 1000.0
    }

    /// Shortest decimal rendering in cores: `0.5`, `1`, `1.25`.
    pub fn cores_string(&self) -> String {
        let whole = self.0 / 1000;
        let frac = self.0 % 1000;
        if frac == 0 {
            return whole.to_string();
        }
        let digits = format!("{frac:03}");
        format!("{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl Default for CpuQuantity {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for CpuQuantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let millis: u64 = if let Some(number) = input.strip_suffix('m') {
            if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
                return Err(QuantityError::new(input, "millicores must be an integer"));
            }
            number
                .parse::<u64>()
                .map_err(|_| QuantityError::new(input, "number out of range"))?
        } else {
            let (whole, frac, frac_len) = split_decimal(input, input)?;
            if frac_len > 3 {
                return Err(QuantityError::new(
                    input,
                    "cpu precision is limited to millicores",
                ));
            }
            whole
                .checked_mul(1000)
                .and_then(|w| w.checked_add(frac * 10u64.pow(3 - frac_len)))
                .ok_or_else(|| QuantityError::new(input, "number out of range"))?
        };
        if millis == 0 {
            return Err(QuantityError::new(input, "cpu must be positive"));
        }
        let millis =
            u32::try_from(millis).map_err(|_| QuantityError::new(input, "number out of range"))?;
        Ok(Self(millis))
    }
}

impl fmt::Display for CpuQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.0)
    }
}

/// Memory request in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryQuantity(u64);

impl MemoryQuantity {
    pub const DEFAULT: MemoryQuantity = MemoryQuantity(512 * MIB);

    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Whole mebibytes, rounded up.
    pub fn mebibytes(&self) -> u64 {
        self.0.div_ceil(MIB)
    }

    /// Gibibytes as a float, e.g. `0.5`.
    pub fn gibibytes(&self) -> f64 {
        self.0 as f64 / GIB as f64
    }
}

impl Default for MemoryQuantity {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for MemoryQuantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let split = input
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(input.len());
        let (number, suffix) = input.split_at(split);
        let multiplier: u64 = match suffix {
            "" => 1,
            "Ki" => 1024,
            "Mi" => MIB,
            "Gi" => GIB,
            "Ti" => 1024 * GIB,
            "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            "T" => 1_000_000_000_000,
            other => {
                return Err(QuantityError::new(
                    input,
                    format!("unknown memory unit '{other}'"),
                ))
            }
        };
        let (whole, frac, frac_len) = split_decimal(input, number)?;
        if frac_len > 0 && multiplier == 1 {
            return Err(QuantityError::new(input, "fractional bytes"));
        }
        let scale = 10u128
            .checked_pow(frac_len)
            .ok_or_else(|| QuantityError::new(input, "too many decimal places"))?;
        let bytes = u128::from(whole) * u128::from(multiplier)
            + u128::from(frac) * u128::from(multiplier) / scale;
        let bytes =
            u64::try_from(bytes).map_err(|_| QuantityError::new(input, "number out of range"))?;
        if bytes == 0 {
            return Err(QuantityError::new(input, "memory must be positive"));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MemoryQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % GIB == 0 {
            write!(f, "{}Gi", self.0 / GIB)
        } else if self.0 % MIB == 0 {
            write!(f, "{}Mi", self.0 / MIB)
        } else {
            write!(f, "{}", self.0)
        }
    }
}
