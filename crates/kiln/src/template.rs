//! IR statement template substitution.
//!
//! Templates contain placeholders of the form `$xN` where `x` is one of
//! `r` (register name), `t` (type name), `b` (generic binary type of the
//! same width), or `w` (current SIMD width), and `N` is a single decimal
//! digit selecting an operand: 0 is the result, 1-3 are the dependencies.
//! Anything that does not match this grammar is copied verbatim.

/// Per-statement substitution context, with names resolved up front so the
/// scanner itself stays a plain byte loop.
pub(crate) struct Operands<'a> {
    /// Register names, result first.
    pub regs: [&'a str; 4],
    /// Textual type names (`$t`).
    pub types: [&'a str; 4],
    /// Generic binary type names of matching width (`$b`).
    pub binary: [&'a str; 4],
    /// Current SIMD width (`$w`).
    pub width: u32,
}

pub(crate) fn substitute(stmt: &str, ops: &Operands<'_>) -> String {
    let bytes = stmt.as_bytes();
    let mut out = Vec::with_capacity(stmt.len() + 16);
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' {
            let kind = bytes.get(i + 1).copied();
            let digit = bytes.get(i + 2).copied();
            let index = match digit {
                Some(d @ b'0'..=b'3') => Some((d - b'0') as usize),
                _ => None,
            };
            match (kind, index) {
                (Some(b'r'), Some(n)) => {
                    out.extend_from_slice(ops.regs[n].as_bytes());
                    i += 3;
                    continue;
                }
                (Some(b't'), Some(n)) => {
                    out.extend_from_slice(ops.types[n].as_bytes());
                    i += 3;
                    continue;
                }
                (Some(b'b'), Some(n)) => {
                    out.extend_from_slice(ops.binary[n].as_bytes());
                    i += 3;
                    continue;
                }
                (Some(b'w'), Some(_)) => {
                    out.extend_from_slice(ops.width.to_string().as_bytes());
                    i += 3;
                    continue;
                }
                _ => {}
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    // Splits only ever happen at ASCII '$', so the byte stream stays
    // valid UTF-8.
    String::from_utf8(out).expect("template substitution produced invalid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops() -> Operands<'static> {
        Operands {
            regs: ["%f4", "%f2", "%r7", "%p1"],
            types: ["f32", "f32", "u32", "pred"],
            binary: ["b32", "b32", "b32", "b32"],
            width: 8,
        }
    }

    #[test]
    fn registers_and_types() {
        let out = substitute("add.$t0 $r0, $r1, $r2", &ops());
        assert_eq!(out, "add.f32 %f4, %f2, %r7");
    }

    #[test]
    fn binary_and_width() {
        let out = substitute("mov.$b0 $r0, $r1; // w=$w0", &ops());
        assert_eq!(out, "mov.b32 %f4, %f2; // w=8");
    }

    #[test]
    fn fallback_is_verbatim() {
        assert_eq!(substitute("no placeholders", &ops()), "no placeholders");
        assert_eq!(substitute("cost: $5", &ops()), "cost: $5");
        assert_eq!(substitute("$r", &ops()), "$r");
        assert_eq!(substitute("$r9", &ops()), "$r9");
        assert_eq!(substitute("trailing $", &ops()), "trailing $");
    }

    #[test]
    fn adjacent_placeholders() {
        assert_eq!(substitute("$r0$r1", &ops()), "%f4%f2");
    }
}
