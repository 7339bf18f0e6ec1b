//! Lock modes and the mode matrices.
//!
//! The matrices are indexed by `mode + 1` so that row/column 0 is the
//! unlocked (invalid) mode and row/column 7 is padding.

use std::fmt;

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i8)]
pub enum LockMode {
    /// No mode: not granted, or no request outstanding
    #[default]
    Iv = -1,
    /// Null
    Nl = 0,
    /// Concurrent read
    Cr = 1,
    /// Concurrent write
    Cw = 2,
    /// Protected read
    Pr = 3,
    /// Protected write
    Pw = 4,
    /// Exclusive
    Ex = 5,
}

/// Direction of an LVB transfer for a (granted, requested) mode pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvbOp {
    /// No transfer
    None,
    /// Copy the resource LVB into the lock (caller reads)
    Read,
    /// Copy the lock LVB into the resource (caller writes)
    Write,
}

const COMPAT: [[u8; 8]; 8] = [
    // UN NL CR CW PR PW EX PD
    [1, 1, 1, 1, 1, 1, 1, 0], // UN
    [1, 1, 1, 1, 1, 1, 1, 0], // NL
    [1, 1, 1, 1, 1, 1, 0, 0], // CR
    [1, 1, 1, 1, 0, 0, 0, 0], // CW
    [1, 1, 1, 0, 1, 0, 0, 0], // PR
    [1, 1, 1, 0, 0, 0, 0, 0], // PW
    [1, 1, 0, 0, 0, 0, 0, 0], // EX
    [0, 0, 0, 0, 0, 0, 0, 0], // PD
];

// 1 = read into the lock, 0 = write to the resource, -1 = nothing.
const LVB_OPS: [[i8; 8]; 8] = [
    // UN  NL  CR  CW  PR  PW  EX  PD
    [-1, 1, 1, 1, 1, 1, 1, -1],     // UN
    [-1, 1, 1, 1, 1, 1, 1, 0],      // NL
    [-1, -1, 1, 1, 1, 1, 1, 0],     // CR
    [-1, -1, -1, 1, 1, 1, 1, 0],    // CW
    [-1, -1, -1, -1, 1, 1, 1, 0],   // PR
    [-1, 0, 0, 0, 0, 0, 1, 0],      // PW
    [-1, 0, 0, 0, 0, 0, 0, 0],      // EX
    [-1, 0, 0, 0, 0, 0, 0, 0],      // PD
];

// Conversions allowed to carry QUECVT.
const QUECVT_COMPAT: [[u8; 8]; 8] = [
    // UN NL CR CW PR PW EX PD
    [0, 0, 0, 0, 0, 0, 0, 0], // UN
    [0, 0, 1, 1, 1, 1, 1, 0], // NL
    [0, 0, 0, 1, 1, 1, 1, 0], // CR
    [0, 0, 0, 0, 1, 1, 1, 0], // CW
    [0, 0, 0, 1, 0, 1, 1, 0], // PR
    [0, 0, 0, 0, 0, 0, 1, 0], // PW
    [0, 0, 0, 0, 0, 0, 0, 0], // EX
    [0, 0, 0, 0, 0, 0, 0, 0], // PD
];

impl LockMode {
    /// All grantable modes, weakest first
    pub const ALL: [LockMode; 6] = [
        LockMode::Nl,
        LockMode::Cr,
        LockMode::Cw,
        LockMode::Pr,
        LockMode::Pw,
        LockMode::Ex,
    ];

    #[inline]
    const fn index(self) -> usize {
        (self as i8 + 1) as usize
    }

    /// Wire encoding
    #[inline]
    pub const fn as_i8(self) -> i8 {
        self as i8
    }

    /// Decode a wire value. Out-of-range values yield `None`.
    pub const fn from_i8(value: i8) -> Option<LockMode> {
        match value {
            -1 => Some(LockMode::Iv),
            0 => Some(LockMode::Nl),
            1 => Some(LockMode::Cr),
            2 => Some(LockMode::Cw),
            3 => Some(LockMode::Pr),
            4 => Some(LockMode::Pw),
            5 => Some(LockMode::Ex),
            _ => None,
        }
    }

    /// Whether this is a real mode (not `Iv`)
    #[inline]
    pub const fn is_valid(self) -> bool {
        !matches!(self, LockMode::Iv)
    }

    /// Whether a lock held at `self` is compatible with a request at `other`
    #[inline]
    pub const fn compatible(self, other: LockMode) -> bool {
        COMPAT[self.index()][other.index()] == 1
    }

    /// LVB transfer direction when a lock granted at `self` is granted `requested`
    #[inline]
    pub const fn lvb_op(self, requested: LockMode) -> LvbOp {
        match LVB_OPS[self.index()][requested.index()] {
            1 => LvbOp::Read,
            0 => LvbOp::Write,
            _ => LvbOp::None,
        }
    }

    /// Whether a conversion from `self` to `requested` may carry QUECVT
    #[inline]
    pub const fn quecvt_allowed(self, requested: LockMode) -> bool {
        QUECVT_COMPAT[self.index()][requested.index()] == 1
    }

    /// PR and CW are not ordered: a conversion between them is neither up nor down.
    #[inline]
    pub const fn is_middle_conversion(gr: LockMode, rq: LockMode) -> bool {
        matches!(
            (gr, rq),
            (LockMode::Pr, LockMode::Cw) | (LockMode::Cw, LockMode::Pr)
        )
    }

    /// Down-conversions never block.
    #[inline]
    pub fn is_down_conversion(gr: LockMode, rq: LockMode) -> bool {
        !Self::is_middle_conversion(gr, rq) && rq < gr
    }

    /// Short name
    pub const fn as_str(&self) -> &'static str {
        match self {
            LockMode::Iv => "IV",
            LockMode::Nl => "NL",
            LockMode::Cr => "CR",
            LockMode::Cw => "CW",
            LockMode::Pr => "PR",
            LockMode::Pw => "PW",
            LockMode::Ex => "EX",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compat_is_symmetric() {
        for a in LockMode::ALL {
            for b in LockMode::ALL {
                assert_eq!(a.compatible(b), b.compatible(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_compat_known_pairs() {
        assert!(LockMode::Pr.compatible(LockMode::Pr));
        assert!(LockMode::Cw.compatible(LockMode::Cw));
        assert!(!LockMode::Pr.compatible(LockMode::Cw));
        assert!(!LockMode::Ex.compatible(LockMode::Cr));
        assert!(LockMode::Ex.compatible(LockMode::Nl));
        assert!(LockMode::Iv.compatible(LockMode::Ex));
    }

    #[test]
    fn test_lvb_ops() {
        assert_eq!(LockMode::Iv.lvb_op(LockMode::Pr), LvbOp::Read);
        assert_eq!(LockMode::Ex.lvb_op(LockMode::Nl), LvbOp::Write);
        assert_eq!(LockMode::Pw.lvb_op(LockMode::Ex), LvbOp::Read);
        assert_eq!(LockMode::Cr.lvb_op(LockMode::Nl), LvbOp::None);
    }

    #[test]
    fn test_quecvt_matrix() {
        assert!(LockMode::Nl.quecvt_allowed(LockMode::Ex));
        assert!(LockMode::Pr.quecvt_allowed(LockMode::Cw));
        assert!(!LockMode::Ex.quecvt_allowed(LockMode::Nl));
        assert!(!LockMode::Pr.quecvt_allowed(LockMode::Pr));
    }

    #[test]
    fn test_conversion_direction() {
        assert!(LockMode::is_down_conversion(LockMode::Ex, LockMode::Pr));
        assert!(!LockMode::is_down_conversion(LockMode::Pr, LockMode::Cw));
        assert!(!LockMode::is_down_conversion(LockMode::Nl, LockMode::Ex));
        assert!(LockMode::is_middle_conversion(LockMode::Cw, LockMode::Pr));
    }

    #[test]
    fn test_wire_encoding() {
        for mode in LockMode::ALL {
            assert_eq!(LockMode::from_i8(mode.as_i8()), Some(mode));
        }
        assert_eq!(LockMode::from_i8(6), None);
    }
}
