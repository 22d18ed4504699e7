//! Scalar element types for tensors.
//!
//! Fixed-point is the only type the accelerator computes in. The float,
//! log and custom-float variants exist to carry metadata through a graph
//! (e.g. parameters quantized offline) and are never lowered.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    /// Signed fixed-point Qm.n: `bits` total of which `frac_bits` are
    /// fractional.
    FixedPoint { bits: u32, frac_bits: u32 },
    /// IEEE float (16 or 32 bits).
    Float { bits: u32 },
    /// Log-domain value with the given exponent width.
    Log { exp_bits: u32 },
    /// Non-IEEE float with an explicit exponent width.
    CustomFloat { bits: u32, exp_bits: u32 },
}

impl Dtype {
    /// 32-bit fixed-point, 16 fractional bits.
    pub const FXP32: Dtype = Dtype::fixed(32, 16);
    /// 16-bit fixed-point, 8 fractional bits.
    pub const FXP16: Dtype = Dtype::fixed(16, 8);
    /// 8-bit fixed-point, 8 fractional bits.
    pub const FXP8: Dtype = Dtype::fixed(8, 8);
    /// 32-bit IEEE float.
    pub const FP32: Dtype = Dtype::Float { bits: 32 };
    /// 16-bit IEEE float.
    pub const FP16: Dtype = Dtype::Float { bits: 16 };

    /// Fixed-point constructor usable in const context.
    pub const fn fixed(bits: u32, frac_bits: u32) -> Self {
        Dtype::FixedPoint { bits, frac_bits }
    }

    /// Storage width in bits.
    pub fn bits(&self) -> u32 {
        match *self {
            Dtype::FixedPoint { bits, .. } => bits,
            Dtype::Float { bits } => bits,
            // Log-domain values store a 2-bit mantissa sign/zero pair.
            Dtype::Log { .. } => 2,
            Dtype::CustomFloat { bits, .. } => bits,
        }
    }

    /// Fractional bit count. Non-fixed-point types report zero.
    pub fn frac_bits(&self) -> u32 {
        match *self {
            Dtype::FixedPoint { frac_bits, .. } => frac_bits,
            _ => 0,
        }
    }

    /// Integer bit count for fixed-point (bits − frac_bits).
    pub fn int_bits(&self) -> u32 {
        self.bits() - self.frac_bits()
    }

    /// True for the fixed-point variant.
    pub fn is_fixed_point(&self) -> bool {
        matches!(self, Dtype::FixedPoint { .. })
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Dtype::FixedPoint { bits, frac_bits } => {
                write!(f, "FXP{} ({},{})", bits, bits - frac_bits, frac_bits)
            }
            Dtype::Float { bits } => write!(f, "FP{}", bits),
            Dtype::Log { exp_bits } => write!(f, "Log{}", exp_bits),
            Dtype::CustomFloat { bits, exp_bits } => {
                write!(f, "CustomFloat({},{})", bits, exp_bits)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point_widths() {
        let t = Dtype::fixed(16, 12);
        assert_eq!(t.bits(), 16);
        assert_eq!(t.frac_bits(), 12);
        assert_eq!(t.int_bits(), 4);
        assert!(t.is_fixed_point());
    }

    #[test]
    fn test_equality_requires_both_fields() {
        assert_eq!(Dtype::fixed(16, 8), Dtype::FXP16);
        assert_ne!(Dtype::fixed(16, 8), Dtype::fixed(16, 12));
        assert_ne!(Dtype::fixed(32, 0), Dtype::Float { bits: 32 });
    }

    #[test]
    fn test_display() {
        assert_eq!(Dtype::FXP16.to_string(), "FXP16 (8,8)");
        assert_eq!(Dtype::FP32.to_string(), "FP32");
    }
}
