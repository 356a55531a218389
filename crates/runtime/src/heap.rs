//! Managed heap.
//!
//! One downward-growing region at the tail of machine memory. Objects are
//! allocated by decrementing a tail offset; each receives a monotonically
//! increasing reference id indexing a side table of `(offset, len, scratch)`
//! entries. Id 0 is null, id 1 the root object. The collector (`gc.rs`)
//! renumbers and compacts the region after every iteration.

use relay_core::slot;
use relay_core::value::{
    ARRAY_HEADER, ARRAY_HEADER_SIZE, OBJECT_HEADER, OBJECT_HEADER_SIZE, STRING_HEADER,
    STRING_HEADER_SIZE, TypeCode,
};
use tracing::trace;

use crate::error::{Result, VmError};
use crate::vm::Vm;

/// Fixed capacity of the reference-id side table.
pub const MAX_HEAP_OBJECTS: usize = 1024;

/// Side-table entry for one live heap object.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapSlot {
    /// Current offset of the object header in machine memory.
    pub offset: usize,
    /// Total byte length, header included. Sizes never change after
    /// creation.
    pub len: usize,
    /// Collector scratch: the object's next id during renumbering.
    pub scratch: i32,
}

/// The reference-id table plus the allocation cursor.
#[derive(Debug)]
pub struct HeapTable {
    slots: Vec<HeapSlot>,
    /// Next id to hand out; every live id is `< next_id`.
    pub next_id: i32,
    /// Initial tail: the end of machine memory.
    pub image_end: usize,
}

impl HeapTable {
    pub fn new(image_end: usize) -> Self {
        HeapTable {
            slots: vec![HeapSlot::default(); MAX_HEAP_OBJECTS],
            next_id: 1,
            image_end,
        }
    }

    /// Offset below which the next allocation must fit.
    pub fn tail(&self) -> usize {
        if self.next_id == 1 {
            self.image_end
        } else {
            self.slots[(self.next_id - 1) as usize].offset
        }
    }

    /// Side-table entry for `id`, validating the id range. Callers check
    /// for null (id 0) themselves to produce operation-specific messages.
    pub fn slot(&self, id: i32) -> Result<HeapSlot> {
        if id <= 0 || id >= self.next_id {
            return Err(VmError::reference(format!(
                "reference id {id} out of range (next {})",
                self.next_id
            )));
        }
        Ok(self.slots[id as usize])
    }

    pub fn slot_mut(&mut self, id: i32) -> &mut HeapSlot {
        &mut self.slots[id as usize]
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        (self.next_id - 1) as usize
    }
}

impl Vm {
    /// Lowest offset an allocation may reach: the deepest frame's current
    /// evaluation top, or the frame region base when no frame is live.
    fn alloc_floor(&self) -> usize {
        match self.frames.last() {
            Some(f) => f.eval_ptr,
            None => self.image.stack0,
        }
    }

    fn claim(&mut self, size: usize, what: &str) -> Result<(i32, usize)> {
        let id = self.heap.next_id;
        if id as usize >= MAX_HEAP_OBJECTS {
            return Err(VmError::memory(format!(
                "heap object table full ({MAX_HEAP_OBJECTS}) allocating {what}"
            )));
        }
        let tail = self.heap.tail();
        let floor = self.alloc_floor();
        if size > tail || tail - size < floor {
            return Err(VmError::memory(format!(
                "not enough space allocating {size} bytes for {what}, heap available={}",
                tail.saturating_sub(floor)
            )));
        }
        let offset = tail - size;
        self.heap.next_id += 1;
        *self.heap.slot_mut(id) = HeapSlot {
            offset,
            len: size,
            scratch: 0,
        };
        Ok((id, offset))
    }

    /// Allocate an object of `class_id`, zero its payload, stamp per-field
    /// type bytes, and eagerly instantiate reference fields whose descriptor
    /// carries an auto-new class id.
    pub fn alloc_object(&mut self, class_id: u16) -> Result<i32> {
        let class = self.image.class_layout(&self.mem, class_id)?;
        let size = class.total_size as usize + OBJECT_HEADER_SIZE;
        let (id, offset) = self.claim(size, "object")?;

        self.mem[offset] = OBJECT_HEADER;
        self.mem[offset + 1..offset + 3].copy_from_slice(&class_id.to_le_bytes());
        let payload = offset + OBJECT_HEADER_SIZE;
        self.mem[payload..offset + size].fill(0);

        for i in 0..class.field_count as usize {
            let field = self.image.field_desc(&self.mem, &class, i)?;
            let at = payload + field.offset as usize;
            self.mem[at] = field.type_code;
            if field.aux >= 0 && field.type_code == TypeCode::ReferenceId as u8 {
                let nested = self.alloc_object(field.aux as u16)?;
                slot::write_i32(&mut self.mem, at, nested);
            }
        }

        trace!(id, class_id, offset, "alloc object");
        Ok(id)
    }

    /// Allocate an immutable string: `{tag, len:u16, payload, NUL}`.
    pub fn alloc_string(&mut self, bytes: &[u8]) -> Result<i32> {
        let len = bytes.len();
        if len > u16::MAX as usize {
            return Err(VmError::memory(format!("string of {len} bytes too long")));
        }
        let size = len + STRING_HEADER_SIZE + 1;
        let (id, offset) = self.claim(size, "string")?;

        self.mem[offset] = STRING_HEADER;
        self.mem[offset + 1..offset + 3].copy_from_slice(&(len as u16).to_le_bytes());
        let payload = offset + STRING_HEADER_SIZE;
        self.mem[payload..payload + len].copy_from_slice(bytes);
        self.mem[payload + len] = 0;

        trace!(id, len, "alloc string");
        Ok(id)
    }

    /// Allocate an array of `len` elements, zero-filled. Elements are
    /// stored at their payload width; reference elements are 4-byte ids.
    pub fn alloc_array(&mut self, len: i32, elem: TypeCode) -> Result<i32> {
        if len < 0 {
            return Err(VmError::memory(format!("array of negative length {len}")));
        }
        let size = elem.payload_size() * len as usize + ARRAY_HEADER_SIZE;
        let (id, offset) = self.claim(size, "array")?;

        self.mem[offset] = ARRAY_HEADER;
        self.mem[offset + 1] = elem as u8;
        self.mem[offset + 2..offset + 6].copy_from_slice(&len.to_le_bytes());
        self.mem[offset + ARRAY_HEADER_SIZE..offset + size].fill(0);

        trace!(id, len, elem = elem as u8, "alloc array");
        Ok(id)
    }

    // =========================================================================
    // Typed heap object views
    // =========================================================================

    /// `(elem_type, len, payload_offset)` of array object `id`.
    pub fn array_info(&self, id: i32, op: &str) -> Result<(u8, i32, usize)> {
        if id == 0 {
            return Err(VmError::reference(format!("{op} on null array")));
        }
        let s = self.heap.slot(id)?;
        if self.mem[s.offset] != ARRAY_HEADER {
            return Err(VmError::type_error(format!("{op}: object {id} is not an array")));
        }
        let elem = self.mem[s.offset + 1];
        let len = i32::from_le_bytes(self.mem[s.offset + 2..s.offset + 6].try_into().unwrap());
        Ok((elem, len, s.offset + ARRAY_HEADER_SIZE))
    }

    /// `(len, payload_offset)` of string object `id`.
    pub fn string_info(&self, id: i32, op: &str) -> Result<(usize, usize)> {
        if id == 0 {
            return Err(VmError::reference(format!("{op} on null string")));
        }
        let s = self.heap.slot(id)?;
        if self.mem[s.offset] != STRING_HEADER {
            return Err(VmError::type_error(format!("{op}: object {id} is not a string")));
        }
        let len = u16::from_le_bytes(self.mem[s.offset + 1..s.offset + 3].try_into().unwrap());
        Ok((len as usize, s.offset + STRING_HEADER_SIZE))
    }

    /// String contents of object `id`.
    pub fn string_bytes(&self, id: i32, op: &str) -> Result<&[u8]> {
        let (len, payload) = self.string_info(id, op)?;
        Ok(&self.mem[payload..payload + len])
    }

    /// `(class_id, payload_offset)` of object `id`.
    pub fn object_info(&self, id: i32, op: &str) -> Result<(u16, usize)> {
        if id == 0 {
            return Err(VmError::reference(format!("{op} on null reference")));
        }
        let s = self.heap.slot(id)?;
        if self.mem[s.offset] != OBJECT_HEADER {
            return Err(VmError::type_error(format!("{op}: object {id} is not an object")));
        }
        let cls = u16::from_le_bytes(self.mem[s.offset + 1..s.offset + 3].try_into().unwrap());
        Ok((cls, s.offset + OBJECT_HEADER_SIZE))
    }

    /// Class id and header offset of the inline object a `JumpAddress`
    /// payload points at.
    fn inline_object(&self, at: usize) -> Result<(u16, usize)> {
        let offset = slot::read_i32(&self.mem, at) as usize;
        if self.mem[offset] != OBJECT_HEADER {
            return Err(VmError::type_error("inline value does not carry an object header"));
        }
        let cls = u16::from_le_bytes(self.mem[offset + 1..offset + 3].try_into().unwrap());
        Ok((cls, offset))
    }

    // =========================================================================
    // copy_val
    // =========================================================================

    /// The single choke point for heterogeneous tagged assignment.
    ///
    /// `dst` and `src` are offsets of tagged value slots. The destination
    /// type code is authoritative; the source is widened, truncated, copied
    /// or boxed according to the type contract, and any unhandled pairing is
    /// a fatal type fault.
    pub fn copy_val(&mut self, dst: usize, src: usize) -> Result<()> {
        let dt = slot::type_of(&self.mem, dst)
            .ok_or_else(|| VmError::type_error(format!("copy to unknown type {}", self.mem[dst])))?;
        let st = slot::type_of(&self.mem, src)
            .ok_or_else(|| VmError::type_error(format!("copy from unknown type {}", self.mem[src])))?;

        let incompatible =
            || VmError::type_error(format!("cannot copy {:?} value into {:?} slot", st, dt));

        match dt {
            // A Boolean destination takes the low byte of any source; the
            // image compiler feeds it Int32-valued comparison results.
            TypeCode::Boolean => {
                self.mem[dst + 1] = self.mem[src + 1];
            }
            TypeCode::Byte | TypeCode::SByte => {
                if !st.is_integer() {
                    return Err(incompatible());
                }
                self.mem[dst + 1] = self.mem[src + 1];
            }
            TypeCode::Char | TypeCode::Int16 | TypeCode::UInt16 => {
                let widened: i16 = match st {
                    TypeCode::Byte => i16::from(self.mem[src + 1]),
                    TypeCode::SByte => i16::from(self.mem[src + 1] as i8),
                    TypeCode::Char | TypeCode::Int16 | TypeCode::UInt16 => {
                        slot::read_i16(&self.mem, src)
                    }
                    _ => return Err(incompatible()),
                };
                self.mem[dst + 1..dst + 3].copy_from_slice(&widened.to_le_bytes());
            }
            TypeCode::Int32 | TypeCode::UInt32 => {
                let widened = slot::widen_int(&self.mem, src, false).ok_or_else(incompatible)?;
                slot::write_i32(&mut self.mem, dst, widened);
            }
            TypeCode::Single => {
                if st != TypeCode::Single {
                    return Err(incompatible());
                }
                let val = slot::read_i32(&self.mem, src);
                slot::write_i32(&mut self.mem, dst, val);
            }
            TypeCode::ReferenceId => match st {
                TypeCode::ReferenceId => {
                    let val = slot::read_i32(&self.mem, src);
                    slot::write_i32(&mut self.mem, dst, val);
                }
                // Auto-box: an inline value assigned to a reference slot
                // becomes a fresh heap copy.
                TypeCode::JumpAddress => {
                    let (cls, src_off) = self.inline_object(src)?;
                    let len = self
                        .image
                        .class_layout(&self.mem, cls)?
                        .total_size as usize
                        + OBJECT_HEADER_SIZE;
                    let boxed = self.alloc_object(cls)?;
                    let dst_off = self.heap.slot(boxed)?.offset;
                    self.mem.copy_within(src_off..src_off + len, dst_off);
                    slot::write_i32(&mut self.mem, dst, boxed);
                }
                _ => return Err(incompatible()),
            },
            TypeCode::JumpAddress => {
                let (dst_cls, dst_off) = self.inline_object(dst)?;
                let (src_cls, src_off) = match st {
                    TypeCode::ReferenceId => {
                        let id = slot::read_i32(&self.mem, src);
                        if id == 0 {
                            return Err(VmError::reference("copy of null reference into inline value"));
                        }
                        self.object_info(id, "inline copy")
                            .map(|(cls, payload)| (cls, payload - OBJECT_HEADER_SIZE))?
                    }
                    TypeCode::JumpAddress => self.inline_object(src)?,
                    _ => return Err(incompatible()),
                };
                if dst_cls != src_cls {
                    return Err(VmError::type_error(format!(
                        "inline copy from class {src_cls} into class {dst_cls}"
                    )));
                }
                let len = self
                    .image
                    .class_layout(&self.mem, src_cls)?
                    .total_size as usize
                    + OBJECT_HEADER_SIZE;
                self.mem.copy_within(src_off..src_off + len, dst_off);
            }
            TypeCode::Address => {
                if st != TypeCode::Address {
                    return Err(incompatible());
                }
                self.mem.copy_within(src + 1..src + 6, dst + 1);
            }
            TypeCode::MethodPointer | TypeCode::BoxedObject | TypeCode::Metadata => {
                return Err(incompatible());
            }
        }
        Ok(())
    }
}
