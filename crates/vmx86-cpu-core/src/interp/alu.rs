//! Value arithmetic and flag derivation for the micro-op interpreter.

use vmx86_jit::ir::{BinOp, FlagOp, UnOp};
use vmx86_types::{
    parity_even, Width, RFLAGS_AF, RFLAGS_CF, RFLAGS_OF, RFLAGS_PF, RFLAGS_SF, RFLAGS_ZF,
};

pub(crate) fn bin_op(op: BinOp, width: Width, lhs: u64, rhs: u64) -> u64 {
    let bits = u64::from(width.bits());
    let lhs = width.truncate(lhs);
    let result = match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Xor => lhs ^ rhs,
        BinOp::Shl if rhs >= bits => 0,
        BinOp::Shl => lhs << rhs,
        BinOp::Shr if rhs >= bits => 0,
        BinOp::Shr => lhs >> rhs,
        BinOp::Sar => ((width.sign_extend(lhs) as i64) >> rhs.min(63)) as u64,
        BinOp::Rol => rotate_left(width, lhs, rhs % bits),
        BinOp::Ror => rotate_left(width, lhs, (bits - rhs % bits) % bits),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::Eq => u64::from(lhs == width.truncate(rhs)),
    };
    width.truncate(result)
}

fn rotate_left(width: Width, value: u64, n: u64) -> u64 {
    if n == 0 {
        return value;
    }
    let bits = u64::from(width.bits());
    width.truncate((value << n) | (value >> (bits - n)))
}

pub(crate) fn un_op(op: UnOp, width: Width, src: u64) -> u64 {
    let src = width.truncate(src);
    match op {
        UnOp::Not => width.truncate(!src),
        UnOp::Neg => width.truncate(src.wrapping_neg()),
        UnOp::Bswap => match width {
            Width::W64 => src.swap_bytes(),
            Width::W32 => u64::from((src as u32).swap_bytes()),
            // bswap of a 16-bit register is undefined; real parts clear it.
            Width::W16 | Width::W8 => 0,
        },
        UnOp::Bsf if src == 0 => 0,
        UnOp::Bsf => u64::from(src.trailing_zeros()),
        UnOp::Bsr if src == 0 => 0,
        UnOp::Bsr => u64::from(63 - src.leading_zeros()),
    }
}

/// Full double-width product. Returns `(lo, hi)`, each truncated to `width`.
pub(crate) fn mul_wide(width: Width, lhs: u64, rhs: u64, signed: bool) -> (u64, u64) {
    let bits = width.bits();
    let product = if signed {
        let l = width.sign_extend(lhs) as i64 as i128;
        let r = width.sign_extend(rhs) as i64 as i128;
        (l * r) as u128
    } else {
        u128::from(width.truncate(lhs)) * u128::from(width.truncate(rhs))
    };
    (
        width.truncate(product as u64),
        width.truncate((product >> bits) as u64),
    )
}

/// `hi:lo / divisor`. `None` for a zero divisor or a quotient that does not fit in `width`.
pub(crate) fn div_wide(
    width: Width,
    hi: u64,
    lo: u64,
    divisor: u64,
    signed: bool,
) -> Option<(u64, u64)> {
    let bits = width.bits();
    let dividend = (u128::from(width.truncate(hi)) << bits) | u128::from(width.truncate(lo));
    if signed {
        let shift = 128 - 2 * bits;
        let dividend = ((dividend << shift) as i128) >> shift;
        let divisor = width.sign_extend(divisor) as i64 as i128;
        let quot = dividend.checked_div(divisor)?;
        let rem = dividend.checked_rem(divisor)?;
        let min = -(1i128 << (bits - 1));
        let max = (1i128 << (bits - 1)) - 1;
        if quot < min || quot > max {
            return None;
        }
        Some((width.truncate(quot as u64), width.truncate(rem as u64)))
    } else {
        let divisor = u128::from(width.truncate(divisor));
        let quot = dividend.checked_div(divisor)?;
        if quot > u128::from(width.mask()) {
            return None;
        }
        Some((quot as u64, (dividend % divisor) as u64))
    }
}

fn result_flags(width: Width, result: u64) -> u64 {
    let mut f = 0;
    if result == 0 {
        f |= RFLAGS_ZF;
    }
    if result & width.sign_bit() != 0 {
        f |= RFLAGS_SF;
    }
    if parity_even(result) {
        f |= RFLAGS_PF;
    }
    f
}

#[inline]
fn bit(cond: bool, flag: u64) -> u64 {
    if cond {
        flag
    } else {
        0
    }
}

/// Flags produced by a [`FlagOp`], in `RFLAGS` layout. `None` means the update is suppressed
/// (shift or rotate by zero).
pub(crate) fn flags(op: FlagOp, width: Width, lhs: u64, rhs: u64, result: u64) -> Option<u64> {
    let sign = width.sign_bit();
    let bits = u64::from(width.bits());
    let (lhs, rhs, result) = (
        width.truncate(lhs),
        width.truncate(rhs),
        width.truncate(result),
    );
    let msb = |v: u64| v & sign != 0;
    let af = bit((lhs ^ rhs ^ result) & 0x10 != 0, RFLAGS_AF);

    let f = match op {
        FlagOp::Add | FlagOp::Adc => {
            let cf = match op {
                FlagOp::Adc => result < lhs || (result == lhs && rhs != 0),
                _ => result < lhs,
            };
            result_flags(width, result)
                | af
                | bit(cf, RFLAGS_CF)
                | bit(msb((lhs ^ result) & (rhs ^ result)), RFLAGS_OF)
        }
        FlagOp::Sub | FlagOp::Sbb => {
            let cf = match op {
                FlagOp::Sbb => result > lhs || (result == lhs && rhs != 0),
                _ => lhs < rhs,
            };
            result_flags(width, result)
                | af
                | bit(cf, RFLAGS_CF)
                | bit(msb((lhs ^ rhs) & (lhs ^ result)), RFLAGS_OF)
        }
        FlagOp::Logic => result_flags(width, result),
        FlagOp::Shl | FlagOp::Shr | FlagOp::Sar | FlagOp::Rol | FlagOp::Ror if rhs == 0 => {
            return None
        }
        FlagOp::Shl => {
            let cf = rhs <= bits && (lhs >> (bits - rhs)) & 1 != 0;
            result_flags(width, result) | bit(cf, RFLAGS_CF) | bit(msb(result) != cf, RFLAGS_OF)
        }
        FlagOp::Shr => {
            let cf = rhs <= bits && (lhs >> (rhs - 1)) & 1 != 0;
            result_flags(width, result) | bit(cf, RFLAGS_CF) | bit(msb(lhs), RFLAGS_OF)
        }
        FlagOp::Sar => {
            let cf = (width.sign_extend(lhs) >> (rhs - 1).min(63)) & 1 != 0;
            result_flags(width, result) | bit(cf, RFLAGS_CF)
        }
        FlagOp::Rol => {
            let cf = result & 1 != 0;
            bit(cf, RFLAGS_CF) | bit(msb(result) != cf, RFLAGS_OF)
        }
        FlagOp::Ror => {
            let second = result & (sign >> 1) != 0;
            bit(msb(result), RFLAGS_CF) | bit(msb(result) != second, RFLAGS_OF)
        }
        FlagOp::MulUnsigned => {
            let overflow = lhs != 0;
            result_flags(width, result) | bit(overflow, RFLAGS_CF | RFLAGS_OF)
        }
        FlagOp::MulSigned => {
            let fill = if msb(result) { width.mask() } else { 0 };
            result_flags(width, result) | bit(lhs != fill, RFLAGS_CF | RFLAGS_OF)
        }
        FlagOp::BitTest => bit(rhs < bits && (lhs >> rhs) & 1 != 0, RFLAGS_CF),
        FlagOp::BitScan => bit(lhs == 0, RFLAGS_ZF),
    };
    Some(f)
}
