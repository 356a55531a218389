//! Tagged slot accessors over machine memory.
//!
//! The machine keeps every tagged value in one flat byte arena: evaluation
//! stacks, static slots, object fields. A stored value is always
//! `{type_code:u8, payload}`; evaluation stacks additionally stride slots at
//! a fixed 8 bytes regardless of payload width. These helpers are the only
//! place that knows the byte-level encoding.
//!
//! All payloads are little-endian. Reads use fixed widths (an 8-byte slot
//! copy reads past a 1-byte payload into the slot's padding), mirroring the
//! stride-based layout the image compiler assumes.

use crate::value::{MethodKind, MethodRef, TypeCode};

/// Evaluation-stack slots advance by 8 bytes per value.
pub const STACK_STRIDE: usize = 8;

/// Raw type-code byte of the slot at `at`.
#[inline]
pub fn tag(mem: &[u8], at: usize) -> u8 {
    mem[at]
}

/// Decoded type code of the slot at `at`, `None` for unknown bytes.
#[inline]
pub fn type_of(mem: &[u8], at: usize) -> Option<TypeCode> {
    TypeCode::decode(mem[at])
}

#[inline]
pub fn read_i32(mem: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(mem[at + 1..at + 5].try_into().expect("4-byte payload"))
}

#[inline]
pub fn write_i32(mem: &mut [u8], at: usize, v: i32) {
    mem[at + 1..at + 5].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn read_i16(mem: &[u8], at: usize) -> i16 {
    i16::from_le_bytes(mem[at + 1..at + 3].try_into().expect("2-byte payload"))
}

#[inline]
pub fn read_f32(mem: &[u8], at: usize) -> f32 {
    f32::from_le_bytes(mem[at + 1..at + 5].try_into().expect("4-byte payload"))
}

#[inline]
pub fn write_f32(mem: &mut [u8], at: usize, v: f32) {
    mem[at + 1..at + 5].copy_from_slice(&v.to_le_bytes());
}

/// Write a complete tagged value: type code plus 32-bit payload.
#[inline]
pub fn write_tagged_i32(mem: &mut [u8], at: usize, code: TypeCode, v: i32) {
    mem[at] = code as u8;
    write_i32(mem, at, v);
}

#[inline]
pub fn write_tagged_f32(mem: &mut [u8], at: usize, code: TypeCode, v: f32) {
    mem[at] = code as u8;
    write_f32(mem, at, v);
}

/// Copy one 8-byte evaluation slot. Overlap-safe.
#[inline]
pub fn copy_slot(mem: &mut [u8], dst: usize, src: usize) {
    mem.copy_within(src..src + STACK_STRIDE, dst);
}

// =============================================================================
// Addresses
// =============================================================================

/// Read an `Address` payload: `(memory offset, referenced type code)`.
#[inline]
pub fn read_address(mem: &[u8], at: usize) -> (u32, u8) {
    (read_i32(mem, at) as u32, mem[at + 5])
}

/// Write an `Address` slot referencing `offset` with value type `ref_type`.
#[inline]
pub fn write_address(mem: &mut [u8], at: usize, offset: u32, ref_type: u8) {
    mem[at] = TypeCode::Address as u8;
    write_i32(mem, at, offset as i32);
    mem[at + 5] = ref_type;
}

// =============================================================================
// Method pointers
// =============================================================================

/// Read a `MethodPointer` payload, rejecting unknown kind bytes.
pub fn read_method_ref(mem: &[u8], at: usize) -> Option<MethodRef> {
    let kind = MethodKind::try_from(mem[at + 1]).ok()?;
    let id = i16::from_le_bytes([mem[at + 2], mem[at + 3]]);
    Some(MethodRef { kind, id })
}

pub fn write_method_ref(mem: &mut [u8], at: usize, mref: MethodRef) {
    mem[at] = TypeCode::MethodPointer as u8;
    mem[at + 1] = mref.kind as u8;
    mem[at + 2..at + 4].copy_from_slice(&mref.id.to_le_bytes());
    mem[at + 4] = 0;
}

// =============================================================================
// Integer widening
// =============================================================================

/// Widen the integer slot at `at` to 32 bits, signedness-aware.
///
/// Returns `None` for non-integer slots. `ReferenceId` slots widen only when
/// `allow_ref` is set (equality comparison treats ids as plain 32-bit
/// values).
pub fn widen_int(mem: &[u8], at: usize, allow_ref: bool) -> Option<i32> {
    let code = type_of(mem, at)?;
    let v = match code {
        TypeCode::Boolean | TypeCode::Byte => i32::from(mem[at + 1]),
        TypeCode::SByte => i32::from(mem[at + 1] as i8),
        TypeCode::Char | TypeCode::UInt16 => {
            i32::from(u16::from_le_bytes([mem[at + 1], mem[at + 2]]))
        }
        TypeCode::Int16 => i32::from(read_i16(mem, at)),
        TypeCode::Int32 | TypeCode::UInt32 => read_i32(mem, at),
        TypeCode::ReferenceId if allow_ref => read_i32(mem, at),
        _ => return None,
    };
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Vec<u8> {
        vec![0u8; 64]
    }

    #[test]
    fn tagged_i32_round_trip() {
        let mut mem = arena();
        write_tagged_i32(&mut mem, 8, TypeCode::Int32, -123456);
        assert_eq!(tag(&mem, 8), TypeCode::Int32 as u8);
        assert_eq!(read_i32(&mem, 8), -123456);
    }

    #[test]
    fn f32_round_trip_is_bit_exact() {
        let mut mem = arena();
        write_tagged_f32(&mut mem, 0, TypeCode::Single, 4.25);
        assert_eq!(read_f32(&mem, 0), 4.25);
        assert_eq!(read_i32(&mem, 0), 4.25f32.to_bits() as i32);
    }

    #[test]
    fn address_round_trip() {
        let mut mem = arena();
        write_address(&mut mem, 16, 0x1234, TypeCode::Int16 as u8);
        assert_eq!(tag(&mem, 16), TypeCode::Address as u8);
        assert_eq!(read_address(&mem, 16), (0x1234, TypeCode::Int16 as u8));
    }

    #[test]
    fn method_ref_round_trip() {
        let mut mem = arena();
        let mref = MethodRef {
            kind: MethodKind::Custom,
            id: 37,
        };
        write_method_ref(&mut mem, 24, mref);
        assert_eq!(read_method_ref(&mem, 24), Some(mref));
    }

    #[test]
    fn widen_int_signedness() {
        let mut mem = arena();
        mem[0] = TypeCode::SByte as u8;
        mem[1] = 0xfe;
        assert_eq!(widen_int(&mem, 0, false), Some(-2));

        mem[8] = TypeCode::Byte as u8;
        mem[9] = 0xfe;
        assert_eq!(widen_int(&mem, 8, false), Some(254));

        mem[16] = TypeCode::Int16 as u8;
        mem[17..19].copy_from_slice(&(-2i16).to_le_bytes());
        assert_eq!(widen_int(&mem, 16, false), Some(-2));

        mem[24] = TypeCode::UInt16 as u8;
        mem[25..27].copy_from_slice(&0xfffeu16.to_le_bytes());
        assert_eq!(widen_int(&mem, 24, false), Some(0xfffe));

        write_tagged_i32(&mut mem, 32, TypeCode::ReferenceId, 7);
        assert_eq!(widen_int(&mem, 32, false), None);
        assert_eq!(widen_int(&mem, 32, true), Some(7));
    }
}
