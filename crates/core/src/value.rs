//! Type codes and heap object layout.
//!
//! Every value the machine touches carries a one-byte type code, whether it
//! sits in an evaluation-stack slot, a static slot, or an object field. The
//! codes and their payload widths are part of the program-image ABI and must
//! not be renumbered.

use num_enum::TryFromPrimitive;

/// One-byte type code attached to every tagged value.
///
/// Codes 0..=8 are primitives; the remainder are machine-internal value
/// shapes (addresses, heap references, inline value-type handles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeCode {
    Boolean = 0,
    Byte = 1,
    SByte = 2,
    Char = 3,
    Int16 = 4,
    UInt16 = 5,
    Int32 = 6,
    UInt32 = 7,
    Single = 8,
    /// `{kind:u8, id:i16, pad:u8}` — a custom or built-in method handle.
    MethodPointer = 14,
    /// `{offset:i32, referenced_type:u8}` — an offset into machine memory.
    Address = 15,
    /// Heap object id. Id 0 is null, id 1 the root object.
    ReferenceId = 16,
    /// Offset of an inline value-type object materialized in a stack frame.
    JumpAddress = 17,
    /// `{inner_type:u8, payload:4B}` — a primitive wrapped for object slots.
    BoxedObject = 18,
    /// Offset of an inline metadata blob in the code region.
    Metadata = 19,
}

impl TypeCode {
    /// Payload width in bytes, excluding the type-code byte itself.
    pub fn payload_size(self) -> usize {
        match self {
            TypeCode::Boolean | TypeCode::Byte | TypeCode::SByte => 1,
            TypeCode::Char | TypeCode::Int16 | TypeCode::UInt16 => 2,
            TypeCode::Int32 | TypeCode::UInt32 | TypeCode::Single => 4,
            TypeCode::MethodPointer => 4,
            TypeCode::Address => 5,
            TypeCode::ReferenceId | TypeCode::JumpAddress | TypeCode::Metadata => 4,
            TypeCode::BoxedObject => 5,
        }
    }

    /// Full stored width: type-code byte plus payload.
    pub fn slot_size(self) -> usize {
        1 + self.payload_size()
    }

    /// True for codes 0..=7 (everything the integer ALU accepts).
    pub fn is_integer(self) -> bool {
        (self as u8) <= 7
    }

    /// Decode a raw byte, mapping unknown codes to `None`.
    pub fn decode(raw: u8) -> Option<TypeCode> {
        TypeCode::try_from(raw).ok()
    }
}

// =============================================================================
// Heap object headers
// =============================================================================

/// Header tag of a heap array: `{tag, elem_type:u8, len:i32, payload}`.
pub const ARRAY_HEADER: u8 = 11;
/// Header tag of a heap string: `{tag, len:u16, payload, NUL}`.
pub const STRING_HEADER: u8 = 12;
/// Header tag of a heap object: `{tag, class_id:u16, payload}`.
pub const OBJECT_HEADER: u8 = 13;

pub const ARRAY_HEADER_SIZE: usize = 6;
pub const STRING_HEADER_SIZE: usize = 3;
pub const OBJECT_HEADER_SIZE: usize = 3;

// =============================================================================
// Method pointers
// =============================================================================

/// Dispatch kind of a [`MethodRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MethodKind {
    /// Index into the native built-in table.
    Builtin = 0,
    /// Method id in the program image.
    Custom = 1,
}

/// Payload of a `MethodPointer` slot: `{kind:u8, id:i16, pad:u8}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodRef {
    pub kind: MethodKind,
    pub id: i16,
}

// =============================================================================
// Delegate classes
// =============================================================================

/// Class ids with the high nibble `0xf` are reserved for the built-in
/// delegate family (`Action`, `Action1..5`, `Func1..6`).
pub const DELEGATE_CLASS_BASE: u16 = 0xf000;

/// Every delegate object carries exactly two fields: the captured instance
/// and the bound method id.
pub const DELEGATE_FIELD_TYPES: [TypeCode; 2] = [TypeCode::ReferenceId, TypeCode::Int32];

/// True if `class_id` names a built-in delegate class rather than an entry
/// of the image's class table.
pub fn is_delegate_class(class_id: u16) -> bool {
    class_id >> 12 == 0xf
}

/// Total payload size of a delegate object (two packed typed slots).
pub fn delegate_payload_size() -> usize {
    DELEGATE_FIELD_TYPES.iter().map(|t| t.slot_size()).sum()
}
