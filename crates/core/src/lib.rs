//! Relay Core: the shared value foundation of the Relay runtime.
//!
//! This crate holds the pieces of the machine that are pure data layout and
//! carry no execution state:
//!
//! - `value`: one-byte type codes with their ABI-fixed payload widths, heap
//!   object header tags, method pointers, and the reserved delegate class
//!   range.
//! - `slot`: tagged-slot accessors over the flat byte arena — the single
//!   place that knows how values are encoded in memory.
//!
//! The machine itself (heap, collector, interpreter, cyclic I/O) lives in
//! `relay-runtime`.

pub mod slot;
pub mod value;

pub use slot::STACK_STRIDE;
pub use value::{
    ARRAY_HEADER, ARRAY_HEADER_SIZE, DELEGATE_CLASS_BASE, DELEGATE_FIELD_TYPES, MethodKind,
    MethodRef, OBJECT_HEADER, OBJECT_HEADER_SIZE, STRING_HEADER, STRING_HEADER_SIZE, TypeCode,
    delegate_payload_size, is_delegate_class,
};
