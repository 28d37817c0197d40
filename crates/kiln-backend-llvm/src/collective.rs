//! Native host implementations of the collective kernels.
//!
//! These run on raw addresses handed through the backend interface; the
//! callers have already ordered them against the owning stream.

use kiln::backend::ReduceOp;
use kiln::{JitError, Result, VarType};

pub(crate) fn fill(ty: VarType, ptr: usize, size: u32, value: &[u8]) {
    let width = ty.size();
    let out = ptr as *mut u8;
    for i in 0..size as usize {
        // SAFETY: The destination holds at least `size` elements.
        unsafe {
            std::ptr::copy_nonoverlapping(value.as_ptr(), out.add(i * width), width);
        }
    }
}

fn reduce_typed<T: Copy>(ptr: usize, size: u32, out: usize, init: T, f: impl Fn(T, T) -> T) {
    // SAFETY: The source holds `size` elements of T; `out` holds one.
    unsafe {
        let values = std::slice::from_raw_parts(ptr as *const T, size as usize);
        let mut acc = init;
        for &v in values {
            acc = f(acc, v);
        }
        *(out as *mut T) = acc;
    }
}

macro_rules! reduce_int {
    ($t:ty, $op:expr, $ptr:expr, $size:expr, $out:expr) => {
        match $op {
            ReduceOp::Add => reduce_typed::<$t>($ptr, $size, $out, 0, |a, b| a.wrapping_add(b)),
            ReduceOp::Mul => reduce_typed::<$t>($ptr, $size, $out, 1, |a, b| a.wrapping_mul(b)),
            ReduceOp::Min => reduce_typed::<$t>($ptr, $size, $out, <$t>::MAX, |a, b| a.min(b)),
            ReduceOp::Max => reduce_typed::<$t>($ptr, $size, $out, <$t>::MIN, |a, b| a.max(b)),
            ReduceOp::And => reduce_typed::<$t>($ptr, $size, $out, !0, |a, b| a & b),
            ReduceOp::Or => reduce_typed::<$t>($ptr, $size, $out, 0, |a, b| a | b),
        }
    };
}

macro_rules! reduce_float {
    ($t:ty, $op:expr, $ptr:expr, $size:expr, $out:expr) => {
        match $op {
            ReduceOp::Add => reduce_typed::<$t>($ptr, $size, $out, 0.0, |a, b| a + b),
            ReduceOp::Mul => reduce_typed::<$t>($ptr, $size, $out, 1.0, |a, b| a * b),
            ReduceOp::Min => reduce_typed::<$t>($ptr, $size, $out, <$t>::INFINITY, |a, b| a.min(b)),
            ReduceOp::Max => {
                reduce_typed::<$t>($ptr, $size, $out, <$t>::NEG_INFINITY, |a, b| a.max(b))
            }
            _ => unreachable!("bitwise reduction over floats"),
        }
    };
}

pub(crate) fn reduce(
    ty: VarType,
    op: ReduceOp,
    ptr: usize,
    size: u32,
    out: usize,
) -> Result<()> {
    let supported = match op {
        ReduceOp::Add | ReduceOp::Mul | ReduceOp::Min | ReduceOp::Max => {
            ty.is_arithmetic() && ty != VarType::F16
        }
        ReduceOp::And | ReduceOp::Or => ty.is_integral(),
    };
    if !supported {
        return Err(JitError::Driver(format!(
            "reduce(): {} reduction over {} is not supported",
            op.name(),
            ty.name()
        )));
    }

    match ty {
        VarType::I8 => reduce_int!(i8, op, ptr, size, out),
        VarType::U8 => reduce_int!(u8, op, ptr, size, out),
        VarType::I16 => reduce_int!(i16, op, ptr, size, out),
        VarType::U16 => reduce_int!(u16, op, ptr, size, out),
        VarType::I32 => reduce_int!(i32, op, ptr, size, out),
        VarType::U32 => reduce_int!(u32, op, ptr, size, out),
        VarType::I64 => reduce_int!(i64, op, ptr, size, out),
        VarType::U64 => reduce_int!(u64, op, ptr, size, out),
        VarType::F32 => reduce_float!(f32, op, ptr, size, out),
        VarType::F64 => reduce_float!(f64, op, ptr, size, out),
        _ => unreachable!("rejected above"),
    }
    Ok(())
}

/// Exclusive prefix sum; `input` and `output` may alias.
pub(crate) fn scan_u32(input: usize, output: usize, size: u32) {
    // SAFETY: Both regions hold `size` u32 values; aliasing is handled by
    // reading each element before overwriting it.
    unsafe {
        let src = input as *const u32;
        let dst = output as *mut u32;
        let mut sum = 0u32;
        for i in 0..size as usize {
            let value = *src.add(i);
            *dst.add(i) = sum;
            sum = sum.wrapping_add(value);
        }
    }
}

pub(crate) fn all(values: usize, size: u32) -> bool {
    // SAFETY: The region holds `size` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(values as *const u8, size as usize) };
    bytes.iter().all(|&b| b != 0)
}

pub(crate) fn any(values: usize, size: u32) -> bool {
    // SAFETY: The region holds `size` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(values as *const u8, size as usize) };
    bytes.iter().any(|&b| b != 0)
}

/// Counting-sort permutation; see the trait documentation for the
/// `offsets` quadruple layout.
pub(crate) fn mkperm(
    values: usize,
    size: u32,
    bucket_count: u32,
    perm: usize,
    offsets: usize,
) -> u32 {
    // SAFETY: `values` holds `size` u32 entries below `bucket_count`;
    // `perm` holds `size` writable slots.
    let values = unsafe { std::slice::from_raw_parts(values as *const u32, size as usize) };
    let perm = unsafe { std::slice::from_raw_parts_mut(perm as *mut u32, size as usize) };

    let mut counts = vec![0u32; bucket_count as usize];
    for &v in values {
        counts[v as usize] += 1;
    }

    let mut starts = vec![0u32; bucket_count as usize];
    let mut running = 0u32;
    let mut unique = 0u32;
    for (i, &count) in counts.iter().enumerate() {
        starts[i] = running;
        running += count;
        if count != 0 {
            unique += 1;
        }
    }

    if offsets != 0 {
        let quads = offsets as *mut u32;
        let mut slot = 0usize;
        for (i, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            // SAFETY: The caller supplied bucket_count * 4 + 1 writable
            // u32 slots.
            unsafe {
                *quads.add(slot * 4) = i as u32;
                *quads.add(slot * 4 + 1) = starts[i];
                *quads.add(slot * 4 + 2) = count;
                *quads.add(slot * 4 + 3) = 0;
            }
            slot += 1;
        }
    }

    let mut cursors = starts;
    for (i, &v) in values.iter().enumerate() {
        let bucket = v as usize;
        perm[cursors[bucket] as usize] = i as u32;
        cursors[bucket] += 1;
    }

    if offsets != 0 {
        unique
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_replicates_the_pattern() {
        let mut data = [0u32; 7];
        fill(
            VarType::U32,
            data.as_mut_ptr() as usize,
            7,
            &0xdead_beefu32.to_ne_bytes(),
        );
        assert!(data.iter().all(|&v| v == 0xdead_beef));
    }

    #[test]
    fn reductions() {
        let data = [3u32, 1, 4, 1, 5];
        let mut out = 0u32;
        let ptr = data.as_ptr() as usize;
        let out_ptr = &mut out as *mut u32 as usize;
        reduce(VarType::U32, ReduceOp::Add, ptr, 5, out_ptr).unwrap();
        assert_eq!(out, 14);
        reduce(VarType::U32, ReduceOp::Min, ptr, 5, out_ptr).unwrap();
        assert_eq!(out, 1);
        reduce(VarType::U32, ReduceOp::Max, ptr, 5, out_ptr).unwrap();
        assert_eq!(out, 5);

        let floats = [0.5f32, 2.0, -1.0];
        let mut fout = 0.0f32;
        reduce(
            VarType::F32,
            ReduceOp::Mul,
            floats.as_ptr() as usize,
            3,
            &mut fout as *mut f32 as usize,
        )
        .unwrap();
        assert_eq!(fout, -1.0);
    }

    #[test]
    fn unsupported_reductions_are_rejected() {
        let data = [0u8; 4];
        assert!(reduce(VarType::Bool, ReduceOp::Add, data.as_ptr() as usize, 4, 0).is_err());
        assert!(reduce(VarType::F32, ReduceOp::And, data.as_ptr() as usize, 1, 0).is_err());
        assert!(reduce(VarType::F16, ReduceOp::Add, data.as_ptr() as usize, 2, 0).is_err());
    }

    #[test]
    fn scan_is_exclusive_and_in_place() {
        let mut data = [1u32, 2, 3, 4];
        scan_u32(data.as_ptr() as usize, data.as_mut_ptr() as usize, 4);
        assert_eq!(data, [0, 1, 3, 6]);
    }

    #[test]
    fn scan_wraps_on_overflow() {
        let mut data = [u32::MAX, 2, 0];
        scan_u32(data.as_ptr() as usize, data.as_mut_ptr() as usize, 3);
        assert_eq!(data, [0, u32::MAX, 1]);
    }

    #[test]
    fn all_any() {
        let mut data = [1u8, 1, 1, 0, 1];
        assert!(!all(data.as_mut_ptr() as usize, 5));
        assert!(any(data.as_mut_ptr() as usize, 5));
        assert!(all(data.as_mut_ptr() as usize, 3));
        data = [0; 5];
        assert!(!any(data.as_mut_ptr() as usize, 5));
    }

    #[test]
    fn mkperm_buckets_and_offsets() {
        let values = [2u32, 0, 2, 1, 0, 2];
        let mut perm = [0u32; 6];
        let mut offsets = [0u32; 4 * 4 + 1];
        let unique = mkperm(
            values.as_ptr() as usize,
            6,
            4,
            perm.as_mut_ptr() as usize,
            offsets.as_mut_ptr() as usize,
        );
        assert_eq!(unique, 3);

        // Bucket 0 at [0, 2), bucket 1 at [2, 3), bucket 2 at [3, 6).
        assert_eq!(&offsets[0..3], &[0, 0, 2]);
        assert_eq!(&offsets[4..7], &[1, 2, 1]);
        assert_eq!(&offsets[8..11], &[2, 3, 3]);

        // The permutation bucket-sorts the values.
        let sorted: Vec<u32> = perm.iter().map(|&i| values[i as usize]).collect();
        assert_eq!(sorted, vec![0, 0, 1, 2, 2, 2]);

        // Each input index appears exactly once.
        let mut seen = perm.to_vec();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn mkperm_without_offsets_returns_zero() {
        let values = [1u32, 0];
        let mut perm = [0u32; 2];
        let unique = mkperm(values.as_ptr() as usize, 2, 2, perm.as_mut_ptr() as usize, 0);
        assert_eq!(unique, 0);
    }
}
