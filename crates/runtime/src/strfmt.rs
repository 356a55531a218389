//! String formatting.
//!
//! Implements the brace-substitution engine behind `String.Format` and the
//! two float renderings the runtime needs: fixed six-decimal (`Format`
//! substitutions) and six-significant-digit general (`Single.ToString`).
//! Everything operates on raw bytes; managed strings are not required to be
//! UTF-8.

use relay_core::slot;
use relay_core::value::{ARRAY_HEADER, OBJECT_HEADER, STRING_HEADER, TypeCode};

use crate::error::{Result, VmError};
use crate::vm::Vm;

impl Vm {
    /// Render `fmt` substituting `{N}` with the tagged values at `args`
    /// (offsets of tagged slots in machine memory).
    ///
    /// An index takes at most two digits; characters after the digits up to
    /// the closing brace are ignored (`{1:}` selects argument 1). Braces
    /// that do not parse, or indices out of range, are copied literally.
    pub(crate) fn format_braces(&self, fmt: &[u8], args: &[usize]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(fmt.len());
        let mut i = 0;
        while i < fmt.len() {
            if fmt[i] == b'{' {
                if let Some(rel) = fmt[i..].iter().position(|&c| c == b'}') {
                    // At most two digits between the braces.
                    if (1..=3).contains(&rel) {
                        let index = atoi(&fmt[i + 1..i + rel]);
                        if index < args.len() {
                            self.format_arg(&mut out, args[index])?;
                            i += rel + 1;
                            continue;
                        }
                    }
                }
            }
            out.push(fmt[i]);
            i += 1;
        }
        Ok(out)
    }

    /// Append one tagged value. A boxed value unwraps and retries at its
    /// inner type; a null reference substitutes nothing.
    fn format_arg(&self, out: &mut Vec<u8>, mut at: usize) -> Result<()> {
        loop {
            let tag = self.mem[at];
            match TypeCode::decode(tag) {
                Some(TypeCode::SByte) => {
                    out.extend_from_slice(format!("{}", self.mem[at + 1] as i8).as_bytes());
                }
                Some(TypeCode::Byte) => {
                    out.extend_from_slice(format!("{}", self.mem[at + 1]).as_bytes());
                }
                Some(TypeCode::Int16) => {
                    out.extend_from_slice(format!("{}", slot::read_i16(&self.mem, at)).as_bytes());
                }
                Some(TypeCode::UInt16) => {
                    let v = u16::from_le_bytes([self.mem[at + 1], self.mem[at + 2]]);
                    out.extend_from_slice(format!("{v}").as_bytes());
                }
                Some(TypeCode::Int32) => {
                    out.extend_from_slice(format!("{}", slot::read_i32(&self.mem, at)).as_bytes());
                }
                Some(TypeCode::UInt32) => {
                    let v = slot::read_i32(&self.mem, at) as u32;
                    out.extend_from_slice(format!("{v}").as_bytes());
                }
                Some(TypeCode::Single) => {
                    out.extend_from_slice(
                        format_fixed(slot::read_f32(&self.mem, at)).as_bytes(),
                    );
                }
                Some(TypeCode::Boolean) => {
                    out.extend_from_slice(if self.mem[at + 1] != 0 {
                        b"True"
                    } else {
                        b"False"
                    });
                }
                Some(TypeCode::Address) => out.extend_from_slice(b"<Address>"),
                Some(TypeCode::JumpAddress) => out.extend_from_slice(b"<JumpAddress>"),
                Some(TypeCode::MethodPointer) => {
                    let kind = self.mem[at + 1];
                    let id = i16::from_le_bytes([self.mem[at + 2], self.mem[at + 3]]);
                    out.extend_from_slice(format!("<Method: type={kind}, id={id}>").as_bytes());
                }
                Some(TypeCode::ReferenceId) => {
                    let id = slot::read_i32(&self.mem, at);
                    if id != 0 {
                        let s = self.heap.slot(id)?;
                        match self.mem[s.offset] {
                            STRING_HEADER => {
                                out.extend_from_slice(self.string_bytes(id, "format")?);
                            }
                            ARRAY_HEADER => out.extend_from_slice(b"<Array>"),
                            OBJECT_HEADER => out.extend_from_slice(b"<Object>"),
                            other => {
                                return Err(VmError::lifecycle(format!(
                                    "format met object {id} with bad header {other}"
                                )));
                            }
                        }
                    }
                }
                Some(TypeCode::BoxedObject) => {
                    at += 1;
                    continue;
                }
                _ => {
                    out.extend_from_slice(format!("<Unsupported type: {tag}>").as_bytes());
                }
            }
            return Ok(());
        }
    }
}

/// Leading-digits integer parse; anything else (including nothing) is 0.
fn atoi(bytes: &[u8]) -> usize {
    let mut v = 0usize;
    for &c in bytes {
        if !c.is_ascii_digit() {
            break;
        }
        v = v * 10 + (c - b'0') as usize;
    }
    v
}

/// Fixed six-decimal rendering (C `printf("%f")`).
pub fn format_fixed(v: f32) -> String {
    format!("{v:.6}")
}

/// Six-significant-digit general rendering (C `printf("%g")`): trailing
/// zeros stripped, scientific notation outside `1e-4 ..= 1e6`.
pub fn format_general(v: f32) -> String {
    if v == 0.0 {
        return if v.is_sign_negative() { "-0".into() } else { "0".into() };
    }
    if v.is_nan() {
        return "nan".into();
    }
    if v.is_infinite() {
        return if v < 0.0 { "-inf".into() } else { "inf".into() };
    }

    let sci = format!("{v:.5e}");
    let (mantissa, exp) = sci.split_once('e').expect("exponential form");
    let exp: i32 = exp.parse().expect("exponent");

    if (-4..6).contains(&exp) {
        let decimals = (5 - exp).max(0) as usize;
        let fixed = format!("{v:.decimals$}");
        trim_zeros(&fixed)
    } else {
        let mantissa = trim_zeros(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    }
}

fn trim_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}
