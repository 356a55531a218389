//! Built-in method dispatch.
//!
//! A fixed-capacity table of native functions, populated at machine
//! construction in a stable order — the indices are part of the code-image
//! ABI, and [`BuiltinTable::register`] only ever appends. Every built-in
//! follows one convention: pop typed arguments in reverse, push a typed
//! result if any.

use relay_core::slot;
use relay_core::value::{MethodKind, TypeCode, is_delegate_class, delegate_payload_size, OBJECT_HEADER_SIZE};

use crate::error::{Result, VmError};
use crate::interp::Bounds;
use crate::io::{EVENT_KIND, STREAM_KIND};
use crate::strfmt::format_general;
use crate::vm::Vm;

/// Signature of a native built-in: the machine plus the caller's
/// evaluation-stack top.
pub type BuiltinFn = fn(&mut Vm, &mut usize) -> Result<()>;

/// Fixed table capacity.
pub const BUILTIN_CAPACITY: usize = 256;

/// The dispatch table.
pub struct BuiltinTable {
    entries: Vec<Option<BuiltinFn>>,
    count: usize,
}

impl BuiltinTable {
    /// The standard inventory at its ABI indices (0..=120).
    pub fn with_standard() -> Self {
        let mut t = BuiltinTable {
            entries: vec![None; BUILTIN_CAPACITY],
            count: 0,
        };
        for f in STANDARD {
            t.entries[t.count] = Some(*f);
            t.count += 1;
        }
        t
    }

    /// Append an additional built-in past the standard set, returning its
    /// index. Extension is monotonic; indices never shift.
    pub fn register(&mut self, f: BuiltinFn) -> Result<u16> {
        if self.count >= BUILTIN_CAPACITY {
            return Err(VmError::memory(format!(
                "built-in table full ({BUILTIN_CAPACITY})"
            )));
        }
        let idx = self.count;
        self.entries[idx] = Some(f);
        self.count += 1;
        Ok(idx as u16)
    }

    pub fn get(&self, id: u16) -> Result<BuiltinFn> {
        self.entries
            .get(id as usize)
            .copied()
            .flatten()
            .ok_or_else(|| VmError::image(format!("invalid built-in method id {id}")))
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// =============================================================================
// Typed stack helpers (the builtin calling convention)
// =============================================================================

impl Vm {
    pub(crate) fn builtin_bounds(&self) -> Bounds {
        match self.frames.last() {
            Some(f) => Bounds {
                base: f.eval_base,
                limit: f.eval_base + f.max_stack,
            },
            None => Bounds {
                base: self.image.stack0,
                limit: self.heap.tail(),
            },
        }
    }

    pub(crate) fn call_builtin(&mut self, id: u16, eptr: &mut usize) -> Result<()> {
        let f = self.builtins.get(id)?;
        f(self, eptr)
    }

    pub fn pop_slot(&mut self, eptr: &mut usize) -> Result<usize> {
        let b = self.builtin_bounds();
        self.pop(b, eptr)
    }

    fn pop_typed(&mut self, eptr: &mut usize, code: TypeCode) -> Result<usize> {
        let at = self.pop_slot(eptr)?;
        let got = slot::tag(&self.mem, at);
        if got != code as u8 {
            return Err(VmError::type_error(format!(
                "type mismatch: expected {code:?}, got type {got}"
            )));
        }
        Ok(at)
    }

    pub fn pop_i32(&mut self, eptr: &mut usize) -> Result<i32> {
        let at = self.pop_typed(eptr, TypeCode::Int32)?;
        Ok(slot::read_i32(&self.mem, at))
    }

    pub fn pop_f32(&mut self, eptr: &mut usize) -> Result<f32> {
        let at = self.pop_typed(eptr, TypeCode::Single)?;
        Ok(slot::read_f32(&self.mem, at))
    }

    pub fn pop_bool(&mut self, eptr: &mut usize) -> Result<bool> {
        let at = self.pop_typed(eptr, TypeCode::Boolean)?;
        Ok(self.mem[at + 1] != 0)
    }

    pub fn pop_i16(&mut self, eptr: &mut usize) -> Result<i16> {
        let at = self.pop_typed(eptr, TypeCode::Int16)?;
        Ok(slot::read_i16(&self.mem, at))
    }

    pub fn pop_reference(&mut self, eptr: &mut usize) -> Result<i32> {
        let at = self.pop_typed(eptr, TypeCode::ReferenceId)?;
        Ok(slot::read_i32(&self.mem, at))
    }

    /// Pop any integer slot widened to 64 bits — the native-side affordance
    /// behind the Int64 math entries.
    pub fn pop_int_any(&mut self, eptr: &mut usize) -> Result<i64> {
        let at = self.pop_slot(eptr)?;
        slot::widen_int(&self.mem, at, false)
            .map(i64::from)
            .ok_or_else(|| {
                VmError::type_error(format!(
                    "type mismatch: expected an integer, got type {}",
                    self.mem[at]
                ))
            })
    }

    pub fn push_i32(&mut self, eptr: &mut usize, v: i32) -> Result<()> {
        let b = self.builtin_bounds();
        let at = self.bump(b, eptr)?;
        slot::write_tagged_i32(&mut self.mem, at, TypeCode::Int32, v);
        Ok(())
    }

    pub fn push_f32_val(&mut self, eptr: &mut usize, v: f32) -> Result<()> {
        let b = self.builtin_bounds();
        let at = self.bump(b, eptr)?;
        slot::write_tagged_f32(&mut self.mem, at, TypeCode::Single, v);
        Ok(())
    }

    pub fn push_bool(&mut self, eptr: &mut usize, v: bool) -> Result<()> {
        let b = self.builtin_bounds();
        let at = self.bump(b, eptr)?;
        slot::write_tagged_i32(&mut self.mem, at, TypeCode::Boolean, i32::from(v));
        Ok(())
    }

    pub fn push_u16_val(&mut self, eptr: &mut usize, v: u16) -> Result<()> {
        let b = self.builtin_bounds();
        let at = self.bump(b, eptr)?;
        slot::write_tagged_i32(&mut self.mem, at, TypeCode::UInt16, i32::from(v));
        Ok(())
    }

    pub fn push_reference(&mut self, eptr: &mut usize, id: i32) -> Result<()> {
        let b = self.builtin_bounds();
        let at = self.bump(b, eptr)?;
        slot::write_tagged_i32(&mut self.mem, at, TypeCode::ReferenceId, id);
        Ok(())
    }
}

// =============================================================================
// Object
// =============================================================================

fn object_ctor(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    // Discard `this`; the base constructor has no body.
    vm.pop_slot(eptr)?;
    Ok(())
}

// =============================================================================
// Math
// =============================================================================

fn math_abs_decimal(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.abs())
}
fn math_abs_double(vm: &mut Vm, e: &mut usize) -> Result<()> {
    math_abs_decimal(vm, e)
}
fn math_abs_i16(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i32(e)?;
    vm.push_i32(e, i32::from(v as i16).abs())
}
fn math_abs_i32(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i32(e)?;
    vm.push_i32(e, v.wrapping_abs())
}
fn math_abs_i64(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_int_any(e)?;
    vm.push_i32(e, v.abs() as i32)
}
fn math_abs_sbyte(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i32(e)?;
    vm.push_i32(e, i32::from(v as i8).abs())
}
fn math_abs_single(vm: &mut Vm, e: &mut usize) -> Result<()> {
    math_abs_decimal(vm, e)
}
fn math_acos(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.acos())
}
fn math_acosh(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.acosh())
}
fn math_asin(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.asin())
}
fn math_asinh(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.asinh())
}
fn math_atan(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.atan())
}
fn math_atan2(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let y = vm.pop_f32(e)?;
    let x = vm.pop_f32(e)?;
    vm.push_f32_val(e, y.atan2(x))
}
fn math_atanh(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.atanh())
}
fn math_ceiling(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.ceil())
}
fn math_clamp_double(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let max = vm.pop_f32(e)?;
    let min = vm.pop_f32(e)?;
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, min.max(max.min(v)))
}
fn clamp_i32(v: i32, min: i32, max: i32) -> i32 {
    if v < min {
        min
    } else if v > max {
        max
    } else {
        v
    }
}
fn math_clamp_i16(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let max = vm.pop_i32(e)?;
    let min = vm.pop_i32(e)?;
    let v = vm.pop_i32(e)?;
    vm.push_i32(e, i32::from(clamp_i32(v, min, max) as i16))
}
fn math_clamp_i32(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let max = vm.pop_i32(e)?;
    let min = vm.pop_i32(e)?;
    let v = vm.pop_i32(e)?;
    vm.push_i32(e, clamp_i32(v, min, max))
}
fn math_clamp_i64(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let max = vm.pop_int_any(e)?;
    let min = vm.pop_int_any(e)?;
    let v = vm.pop_int_any(e)?;
    let r = if v < min { min } else if v > max { max } else { v };
    vm.push_i32(e, r as i32)
}
fn math_clamp_sbyte(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let max = vm.pop_i32(e)?;
    let min = vm.pop_i32(e)?;
    let v = vm.pop_i32(e)?;
    vm.push_i32(e, i32::from(clamp_i32(v, min, max) as i8))
}
fn math_clamp_single(vm: &mut Vm, e: &mut usize) -> Result<()> {
    math_clamp_double(vm, e)
}
fn math_cos(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.cos())
}
fn math_cosh(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.cosh())
}
fn math_exp(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.exp())
}
fn math_floor(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.floor())
}
fn math_log(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.ln())
}
fn math_log_base(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let base = vm.pop_f32(e)?;
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.ln() / base.ln())
}
fn math_log10(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.log10())
}
fn math_log2(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.log2())
}
fn math_max_double(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_f32(e)?;
    let a = vm.pop_f32(e)?;
    vm.push_f32_val(e, a.max(b))
}
fn math_max_i16(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_i32(e)?;
    let a = vm.pop_i32(e)?;
    vm.push_i32(e, i32::from(a.max(b) as i16))
}
fn math_max_i32(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_i32(e)?;
    let a = vm.pop_i32(e)?;
    vm.push_i32(e, a.max(b))
}
fn math_max_i64(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_int_any(e)?;
    let a = vm.pop_int_any(e)?;
    vm.push_i32(e, a.max(b) as i32)
}
fn math_max_sbyte(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_i32(e)?;
    let a = vm.pop_i32(e)?;
    vm.push_i32(e, i32::from(a.max(b) as i8))
}
fn math_max_single(vm: &mut Vm, e: &mut usize) -> Result<()> {
    math_max_double(vm, e)
}
fn math_min_decimal(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_f32(e)?;
    let a = vm.pop_f32(e)?;
    vm.push_f32_val(e, a.min(b))
}
fn math_min_double(vm: &mut Vm, e: &mut usize) -> Result<()> {
    math_min_decimal(vm, e)
}
fn math_min_i16(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_i32(e)?;
    let a = vm.pop_i32(e)?;
    vm.push_i32(e, i32::from(a.min(b) as i16))
}
fn math_min_i32(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_i32(e)?;
    let a = vm.pop_i32(e)?;
    vm.push_i32(e, a.min(b))
}
fn math_min_i64(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_int_any(e)?;
    let a = vm.pop_int_any(e)?;
    vm.push_i32(e, a.min(b) as i32)
}
fn math_min_sbyte(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let b = vm.pop_i32(e)?;
    let a = vm.pop_i32(e)?;
    vm.push_i32(e, i32::from(a.min(b) as i8))
}
fn math_min_single(vm: &mut Vm, e: &mut usize) -> Result<()> {
    math_min_decimal(vm, e)
}
fn math_pow(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let exp = vm.pop_f32(e)?;
    let base = vm.pop_f32(e)?;
    vm.push_f32_val(e, base.powf(exp))
}
fn math_round(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.round())
}
fn sign_of(v: f32) -> i32 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}
fn math_sign_double(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_i32(e, sign_of(v))
}
fn math_sign_i16(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i32(e)? as i16;
    vm.push_i32(e, i32::from(v.signum()))
}
fn math_sign_i32(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i32(e)?;
    vm.push_i32(e, v.signum())
}
fn math_sign_i64(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_int_any(e)?;
    vm.push_i32(e, v.signum() as i32)
}
fn math_sign_sbyte(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i32(e)? as i8;
    vm.push_i32(e, i32::from(v.signum()))
}
fn math_sign_single(vm: &mut Vm, e: &mut usize) -> Result<()> {
    math_sign_double(vm, e)
}
fn math_sin(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.sin())
}
fn math_sinh(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.sinh())
}
fn math_sqrt(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.sqrt())
}
fn math_tan(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.tan())
}
fn math_tanh(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    vm.push_f32_val(e, v.tanh())
}

// =============================================================================
// String
// =============================================================================

fn do_format(vm: &mut Vm, eptr: &mut usize, args: &[usize]) -> Result<()> {
    let fmt_id = vm.pop_reference(eptr)?;
    if fmt_id == 0 {
        return Err(VmError::reference("format string is null"));
    }
    let fmt = vm.string_bytes(fmt_id, "format")?.to_vec();
    let out = vm.format_braces(&fmt, args)?;
    let id = vm.alloc_string(&out)?;
    vm.push_reference(eptr, id)
}

fn string_format_1(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let a0 = vm.pop_slot(eptr)?;
    do_format(vm, eptr, &[a0])
}
fn string_format_2(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let a1 = vm.pop_slot(eptr)?;
    let a0 = vm.pop_slot(eptr)?;
    do_format(vm, eptr, &[a0, a1])
}
fn string_format_3(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let a2 = vm.pop_slot(eptr)?;
    let a1 = vm.pop_slot(eptr)?;
    let a0 = vm.pop_slot(eptr)?;
    do_format(vm, eptr, &[a0, a1, a2])
}
fn string_format_array(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let arr = vm.pop_reference(eptr)?;
    if arr == 0 {
        return Err(VmError::reference("format argument array is null"));
    }
    let (elem, len, payload) = vm.array_info(arr, "format")?;
    if elem != TypeCode::BoxedObject as u8 {
        return Err(VmError::type_error("format arguments must be an object array"));
    }
    let args: Vec<usize> = (0..len as usize)
        .map(|i| payload + TypeCode::BoxedObject.payload_size() * i)
        .collect();
    do_format(vm, eptr, &args)
}

fn concat(vm: &mut Vm, eptr: &mut usize, n: usize) -> Result<()> {
    let mut ids = vec![0i32; n];
    for i in (0..n).rev() {
        ids[i] = vm.pop_reference(eptr)?;
    }
    let mut out = Vec::new();
    for id in ids {
        if id == 0 {
            return Err(VmError::reference("concat of null string"));
        }
        out.extend_from_slice(vm.string_bytes(id, "concat")?);
    }
    let id = vm.alloc_string(&out)?;
    vm.push_reference(eptr, id)
}

fn string_concat_2(vm: &mut Vm, e: &mut usize) -> Result<()> {
    concat(vm, e, 2)
}
fn string_concat_3(vm: &mut Vm, e: &mut usize) -> Result<()> {
    concat(vm, e, 3)
}
fn string_concat_4(vm: &mut Vm, e: &mut usize) -> Result<()> {
    concat(vm, e, 4)
}

fn string_substring_2(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let length = vm.pop_i32(eptr)?;
    let start = vm.pop_i32(eptr)?;
    let id = vm.pop_reference(eptr)?;
    if id == 0 {
        return Err(VmError::reference("substring of null string"));
    }
    let (len, payload) = vm.string_info(id, "substring")?;
    if start < 0 || length < 0 || (start + length) as usize > len {
        // Out of range substitutes null rather than faulting.
        return vm.push_reference(eptr, 0);
    }
    let bytes =
        vm.mem[payload + start as usize..payload + (start + length) as usize].to_vec();
    let id = vm.alloc_string(&bytes)?;
    vm.push_reference(eptr, id)
}

fn string_get_length(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let id = vm.pop_reference(eptr)?;
    let (len, _) = vm.string_info(id, "get_Length")?;
    vm.push_i32(eptr, len as i32)
}

// =============================================================================
// Cyclic I/O intrinsics
// =============================================================================

fn mcu_read_event(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let event = vm.pop_i32(eptr)?;
    let port = vm.pop_i32(eptr)?;
    vm.io_read(eptr, EVENT_KIND, port, event)
}

fn mcu_read_snapshot(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    vm.read_snapshot_slot(eptr)
}

fn mcu_read_stream(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let port = vm.pop_i32(eptr)?;
    vm.io_read(eptr, STREAM_KIND, port, 0)
}

fn byte_array_contents(vm: &Vm, id: i32, op: &str) -> Result<Vec<u8>> {
    let (elem, len, payload) = vm.array_info(id, op)?;
    if elem != TypeCode::Byte as u8 {
        return Err(VmError::type_error(format!("{op} requires a Byte[] argument")));
    }
    Ok(vm.mem[payload..payload + len as usize].to_vec())
}

fn mcu_write_event(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let event = vm.pop_i32(eptr)?;
    let port = vm.pop_i32(eptr)?;
    let arr = vm.pop_reference(eptr)?;
    let bytes = byte_array_contents(vm, arr, "WriteEvent")?;
    vm.io.reserve(&bytes)?;
    vm.host.write_event(port, event, &bytes);
    Ok(())
}

fn mcu_write_snapshot(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let arr = vm.pop_reference(eptr)?;
    let bytes = byte_array_contents(vm, arr, "WriteSnapshot")?;
    vm.io.reserve(&bytes)?;
    vm.host.write_snapshot(&bytes);
    Ok(())
}

fn mcu_write_stream(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let port = vm.pop_i32(eptr)?;
    let arr = vm.pop_reference(eptr)?;
    let bytes = byte_array_contents(vm, arr, "WriteStream")?;
    vm.io.reserve(&bytes)?;
    vm.host.write_stream(port, &bytes);
    Ok(())
}

fn mcu_micros(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let v = vm.host.cyclic_micros();
    vm.push_i32(eptr, v)
}
fn mcu_millis(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let v = vm.host.cyclic_millis();
    vm.push_i32(eptr, v)
}
fn mcu_seconds(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let v = vm.host.cyclic_seconds();
    vm.push_i32(eptr, v)
}

// =============================================================================
// Value tuples & array initialization
// =============================================================================

fn value_tuple2_ctor(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let v2 = vm.pop_slot(eptr)?;
    let v1 = vm.pop_slot(eptr)?;

    let header = if vm.ctor_this > 0 {
        vm.heap.slot(vm.ctor_this)?.offset
    } else {
        // Called on an inline tuple: the stack carries an address of its
        // JumpAddress slot.
        let at = vm.pop_slot(eptr)?;
        if slot::tag(&vm.mem, at) != TypeCode::Address as u8 {
            return Err(VmError::type_error(
                "value-tuple constructor needs an address operand",
            ));
        }
        let (off, _) = slot::read_address(&vm.mem, at);
        let off = off as usize;
        if vm.mem[off] != TypeCode::JumpAddress as u8 {
            return Err(VmError::type_error(
                "value-tuple constructor needs a jump address",
            ));
        }
        i32::from_le_bytes(vm.mem[off + 1..off + 5].try_into().unwrap()) as usize
    };

    let t1 = header + OBJECT_HEADER_SIZE;
    let t1_code = slot::type_of(&vm.mem, t1)
        .ok_or_else(|| VmError::type_error("value tuple with untyped first field"))?;
    let t2 = t1 + t1_code.slot_size();
    vm.copy_val(t1, v1)?;
    vm.copy_val(t2, v2)
}

fn value_tuple3_ctor(_vm: &mut Vm, _eptr: &mut usize) -> Result<()> {
    Err(VmError::image("ValueTuple3 constructor not implemented"))
}

fn value_tuple4_ctor(_vm: &mut Vm, _eptr: &mut usize) -> Result<()> {
    Err(VmError::image("ValueTuple4 constructor not implemented"))
}

fn runtime_init_array(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let at = vm.pop_slot(eptr)?;
    if slot::tag(&vm.mem, at) != TypeCode::Address as u8 {
        return Err(VmError::type_error("InitializeArray needs a metadata address"));
    }
    let (data, _) = slot::read_address(&vm.mem, at);
    let arr = vm.pop_reference(eptr)?;
    let (elem, len, payload) = vm.array_info(arr, "InitializeArray")?;
    let ecode = TypeCode::decode(elem)
        .ok_or_else(|| VmError::image(format!("array with unknown element type {elem}")))?;
    let total = ecode.payload_size() * len as usize;
    vm.mem.copy_within(data as usize..data as usize + total, payload);
    Ok(())
}

// =============================================================================
// ToString
// =============================================================================

fn bool_to_string(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let v = vm.pop_bool(eptr)?;
    let id = vm.alloc_string(if v { b"True" } else { b"False" })?;
    vm.push_reference(eptr, id)
}

/// Pop an operand that is either an immediate of `code` or an `Address`
/// referencing one; return the offset of the 4 payload bytes.
fn pop_value_or_address(vm: &mut Vm, eptr: &mut usize, code: TypeCode) -> Result<usize> {
    let at = vm.pop_slot(eptr)?;
    match slot::type_of(&vm.mem, at) {
        Some(t) if t == code => Ok(at + 1),
        Some(TypeCode::Address) => {
            let (off, _) = slot::read_address(&vm.mem, at);
            Ok(off as usize)
        }
        _ => Err(VmError::type_error(format!(
            "bad ToString input type {}",
            vm.mem[at]
        ))),
    }
}

fn i32_to_string(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let at = pop_value_or_address(vm, eptr, TypeCode::Int32)?;
    let v = i32::from_le_bytes(vm.mem[at..at + 4].try_into().unwrap());
    let id = vm.alloc_string(format!("{v}").as_bytes())?;
    vm.push_reference(eptr, id)
}

fn i16_to_string(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let at = pop_value_or_address(vm, eptr, TypeCode::Int16)?;
    let v = i16::from_le_bytes(vm.mem[at..at + 2].try_into().unwrap());
    let id = vm.alloc_string(format!("{v}").as_bytes())?;
    vm.push_reference(eptr, id)
}

fn single_to_string(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let at = pop_value_or_address(vm, eptr, TypeCode::Single)?;
    let v = f32::from_le_bytes(vm.mem[at..at + 4].try_into().unwrap());
    let id = vm.alloc_string(format_general(v).as_bytes())?;
    vm.push_reference(eptr, id)
}

// =============================================================================
// Delegates
// =============================================================================

fn delegate_ctor(vm: &mut Vm, eptr: &mut usize, class_id: u16) -> Result<()> {
    debug_assert!(is_delegate_class(class_id));
    let at = vm.pop_slot(eptr)?;
    if slot::tag(&vm.mem, at) != TypeCode::MethodPointer as u8 {
        return Err(VmError::type_error("delegate constructor requires a method pointer"));
    }
    let mref = slot::read_method_ref(&vm.mem, at)
        .ok_or_else(|| VmError::type_error("method pointer with unknown kind"))?;
    match mref.kind {
        MethodKind::Custom => {
            if mref.id < 0 || mref.id as usize >= vm.image.method_count {
                return Err(VmError::image(format!("invalid custom method id {}", mref.id)));
            }
        }
        MethodKind::Builtin => {
            return Err(VmError::image("built-in method as delegate target not supported"));
        }
    }
    let instance = vm.pop_reference(eptr)?;

    let this_id = vm.ctor_this;
    if this_id <= 0 {
        return Err(VmError::lifecycle("delegate constructor outside newobj"));
    }
    let s = vm.heap.slot(this_id)?;
    if s.len < OBJECT_HEADER_SIZE + delegate_payload_size() {
        return Err(VmError::image(format!(
            "delegate backing class too small ({} bytes)",
            s.len
        )));
    }
    // Re-tag the object into the reserved delegate class range and store
    // the two bound fields.
    vm.mem[s.offset + 1..s.offset + 3].copy_from_slice(&class_id.to_le_bytes());
    let p = s.offset + OBJECT_HEADER_SIZE;
    slot::write_tagged_i32(&mut vm.mem, p, TypeCode::ReferenceId, instance);
    let p2 = p + TypeCode::ReferenceId.slot_size();
    slot::write_tagged_i32(&mut vm.mem, p2, TypeCode::Int32, mref.id as i32);
    Ok(())
}

fn delegate_invoke(vm: &mut Vm, eptr: &mut usize, class_id: u16, arg_n: usize) -> Result<()> {
    let top = *eptr;
    for _ in 0..arg_n {
        vm.pop_slot(eptr)?;
    }
    let del_at = vm.pop_slot(eptr)?;
    if slot::tag(&vm.mem, del_at) != TypeCode::ReferenceId as u8 {
        return Err(VmError::type_error("delegate invoke requires a delegate reference"));
    }
    let del_id = slot::read_i32(&vm.mem, del_at);
    let (cls, payload) = vm.object_info(del_id, "delegate invoke")?;
    if cls != class_id {
        return Err(VmError::type_error(format!(
            "not the required delegate type: class {cls}, expected {class_id}"
        )));
    }
    let this_id = slot::read_i32(&vm.mem, payload);
    let method_id = slot::read_i32(&vm.mem, payload + TypeCode::ReferenceId.slot_size());

    // Splice the captured instance over the delegate slot; the argument
    // pack above it is untouched, then a regular call consumes it.
    slot::write_tagged_i32(&mut vm.mem, del_at, TypeCode::ReferenceId, this_id);
    *eptr = top;
    vm.invoke(method_id as u16, -1, Some(&mut *eptr))
}

macro_rules! delegates {
    ($(($ctor:ident, $invoke:ident, $cls:literal, $args:literal)),* $(,)?) => {
        $(
            fn $ctor(vm: &mut Vm, e: &mut usize) -> Result<()> {
                delegate_ctor(vm, e, $cls)
            }
            fn $invoke(vm: &mut Vm, e: &mut usize) -> Result<()> {
                delegate_invoke(vm, e, $cls, $args)
            }
        )*
    };
}

delegates!(
    (action_ctor, action_invoke, 0xf000, 0),
    (action1_ctor, action1_invoke, 0xf001, 1),
    (action2_ctor, action2_invoke, 0xf004, 2),
    (action3_ctor, action3_invoke, 0xf005, 3),
    (action4_ctor, action4_invoke, 0xf006, 4),
    (action5_ctor, action5_invoke, 0xf007, 5),
    (func1_ctor, func1_invoke, 0xf002, 0),
    (func2_ctor, func2_invoke, 0xf003, 1),
    (func3_ctor, func3_invoke, 0xf008, 2),
    (func4_ctor, func4_invoke, 0xf009, 3),
    (func5_ctor, func5_invoke, 0xf00a, 4),
    (func6_ctor, func6_invoke, 0xf00b, 5),
);

// =============================================================================
// Console
// =============================================================================

fn console_write_line(vm: &mut Vm, eptr: &mut usize) -> Result<()> {
    let id = vm.pop_reference(eptr)?;
    let bytes = vm.string_bytes(id, "WriteLine")?.to_vec();
    let line = String::from_utf8_lossy(&bytes).into_owned();
    vm.host.print_line(&line);
    Ok(())
}

// =============================================================================
// BitConverter
// =============================================================================

fn push_byte_array(vm: &mut Vm, eptr: &mut usize, bytes: &[u8]) -> Result<()> {
    let id = vm.alloc_array(bytes.len() as i32, TypeCode::Byte)?;
    let (_, _, payload) = vm.array_info(id, "GetBytes")?;
    vm.mem[payload..payload + bytes.len()].copy_from_slice(bytes);
    vm.push_reference(eptr, id)
}

fn bc_get_bytes_bool(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_bool(e)?;
    push_byte_array(vm, e, &[u8::from(v)])
}
fn bc_get_bytes_char(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i16(e)?;
    push_byte_array(vm, e, &v.to_le_bytes())
}
fn bc_get_bytes_i16(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i16(e)?;
    push_byte_array(vm, e, &v.to_le_bytes())
}
fn bc_get_bytes_i32(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i32(e)?;
    push_byte_array(vm, e, &v.to_le_bytes())
}
fn bc_get_bytes_single(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_f32(e)?;
    push_byte_array(vm, e, &v.to_le_bytes())
}
fn bc_get_bytes_u16(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i32(e)? as u16;
    push_byte_array(vm, e, &v.to_le_bytes())
}
fn bc_get_bytes_u32(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let v = vm.pop_i32(e)? as u32;
    push_byte_array(vm, e, &v.to_le_bytes())
}

/// Offset of a bounds-checked `width`-byte window for a BitConverter read.
fn bc_source(vm: &mut Vm, eptr: &mut usize, width: usize) -> Result<usize> {
    let start = vm.pop_i32(eptr)?;
    let arr = vm.pop_reference(eptr)?;
    let (elem, len, payload) = vm.array_info(arr, "BitConverter")?;
    let ecode = TypeCode::decode(elem)
        .ok_or_else(|| VmError::image(format!("array with unknown element type {elem}")))?;
    let total = ecode.payload_size() * len as usize;
    if start < 0 || start as usize + width > total {
        return Err(VmError::reference(format!(
            "BitConverter read of {width} bytes at {start} exceeds array of {total}"
        )));
    }
    Ok(payload + start as usize)
}

fn bc_to_bool(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let at = bc_source(vm, e, 1)?;
    let v = vm.mem[at] != 0;
    vm.push_bool(e, v)
}
fn bc_to_char(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let at = bc_source(vm, e, 2)?;
    let v = i16::from_le_bytes(vm.mem[at..at + 2].try_into().unwrap());
    vm.push_i32(e, i32::from(v))
}
fn bc_to_i16(vm: &mut Vm, e: &mut usize) -> Result<()> {
    bc_to_char(vm, e)
}
fn bc_to_i32(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let at = bc_source(vm, e, 4)?;
    let v = i32::from_le_bytes(vm.mem[at..at + 4].try_into().unwrap());
    vm.push_i32(e, v)
}
fn bc_to_single(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let at = bc_source(vm, e, 4)?;
    let v = f32::from_le_bytes(vm.mem[at..at + 4].try_into().unwrap());
    vm.push_f32_val(e, v)
}
fn bc_to_u16(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let at = bc_source(vm, e, 2)?;
    let v = u16::from_le_bytes(vm.mem[at..at + 2].try_into().unwrap());
    vm.push_u16_val(e, v)
}
fn bc_to_u32(vm: &mut Vm, e: &mut usize) -> Result<()> {
    let at = bc_source(vm, e, 4)?;
    let v = u32::from_le_bytes(vm.mem[at..at + 4].try_into().unwrap());
    vm.push_i32(e, v as i32)
}

/// The standard table, in ABI index order (0..=120).
static STANDARD: &[BuiltinFn] = &[
    object_ctor,        // 0
    math_abs_decimal,   // 1
    math_abs_double,    // 2
    math_abs_i16,       // 3
    math_abs_i32,       // 4
    math_abs_i64,       // 5
    math_abs_sbyte,     // 6
    math_abs_single,    // 7
    math_acos,          // 8
    math_acosh,         // 9
    math_asin,          // 10
    math_asinh,         // 11
    math_atan,          // 12
    math_atan2,         // 13
    math_atanh,         // 14
    math_ceiling,       // 15
    math_clamp_double,  // 16
    math_clamp_i16,     // 17
    math_clamp_i32,     // 18
    math_clamp_i64,     // 19
    math_clamp_sbyte,   // 20
    math_clamp_single,  // 21
    math_cos,           // 22
    math_cosh,          // 23
    math_exp,           // 24
    math_floor,         // 25
    math_log,           // 26
    math_log_base,      // 27
    math_log10,         // 28
    math_log2,          // 29
    math_max_double,    // 30
    math_max_i16,       // 31
    math_max_i32,       // 32
    math_max_i64,       // 33
    math_max_sbyte,     // 34
    math_max_single,    // 35
    math_min_decimal,   // 36
    math_min_double,    // 37
    math_min_i16,       // 38
    math_min_i32,       // 39
    math_min_i64,       // 40
    math_min_sbyte,     // 41
    math_min_single,    // 42
    math_pow,           // 43
    math_round,         // 44
    math_sign_double,   // 45
    math_sign_i16,      // 46
    math_sign_i32,      // 47
    math_sign_i64,      // 48
    math_sign_sbyte,    // 49
    math_sign_single,   // 50
    math_sin,           // 51
    math_sinh,          // 52
    math_sqrt,          // 53
    math_tan,           // 54
    math_tanh,          // 55
    string_format_1,    // 56
    string_format_2,    // 57
    string_format_3,    // 58
    string_format_array, // 59
    string_concat_2,    // 60
    string_concat_3,    // 61
    string_concat_4,    // 62
    string_substring_2, // 63
    string_get_length,  // 64
    mcu_read_event,     // 65
    mcu_read_snapshot,  // 66
    mcu_read_stream,    // 67
    mcu_write_event,    // 68
    mcu_write_snapshot, // 69
    mcu_write_stream,   // 70
    mcu_micros,         // 71
    mcu_millis,         // 72
    mcu_seconds,        // 73
    value_tuple2_ctor,  // 74
    value_tuple3_ctor,  // 75
    value_tuple4_ctor,  // 76
    runtime_init_array, // 77
    bool_to_string,     // 78
    i32_to_string,      // 79
    i16_to_string,      // 80
    single_to_string,   // 81
    action_ctor,        // 82
    action_invoke,      // 83
    action1_ctor,       // 84
    action1_invoke,     // 85
    action2_ctor,       // 86
    action2_invoke,     // 87
    action3_ctor,       // 88
    action3_invoke,     // 89
    action4_ctor,       // 90
    action4_invoke,     // 91
    action5_ctor,       // 92
    action5_invoke,     // 93
    func1_ctor,         // 94
    func1_invoke,       // 95
    func2_ctor,         // 96
    func2_invoke,       // 97
    func3_ctor,         // 98
    func3_invoke,       // 99
    func4_ctor,         // 100
    func4_invoke,       // 101
    func5_ctor,         // 102
    func5_invoke,       // 103
    func6_ctor,         // 104
    func6_invoke,       // 105
    console_write_line, // 106
    bc_get_bytes_bool,  // 107
    bc_get_bytes_char,  // 108
    bc_get_bytes_i16,   // 109
    bc_get_bytes_i32,   // 110
    bc_get_bytes_single, // 111
    bc_get_bytes_u16,   // 112
    bc_get_bytes_u32,   // 113
    bc_to_bool,         // 114
    bc_to_char,         // 115
    bc_to_i16,          // 116
    bc_to_i32,          // 117
    bc_to_single,       // 118
    bc_to_u16,          // 119
    bc_to_u32,          // 120
];

/// Index of the first extension slot after the standard set.
pub const FIRST_EXTENSION_INDEX: usize = 121;
