//! Program image layout.
//!
//! The host downloads one contiguous little-endian image:
//!
//! ```text
//! | meta_header | program_desc | code_chunk | virt_chunk | statics_desc |
//! ```
//!
//! followed in RAM by the materialized statics value region, the stack-frame
//! region, and (growing downward from the end of machine memory) the heap.
//! Parsing records region offsets and counts; descriptor records are read in
//! place on demand, so the image stays the single source of truth.

use crate::error::{Result, VmError};

/// Byte cursor over the image with truncation checks.
pub struct Reader<'a> {
    mem: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn at(mem: &'a [u8], pos: usize) -> Self {
        Reader { mem, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.mem.len())
            .ok_or_else(|| VmError::image(format!("image truncated at offset {}", self.pos)))?;
        let bytes = &self.mem[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

/// Per-class header: `{total_size:u16, field_count:u8, layout_offset:u32}`.
#[derive(Debug, Clone, Copy)]
pub struct ClassLayout {
    pub total_size: u16,
    pub field_count: u8,
    pub layout_offset: u32,
}

/// Per-field record: `{type_code:u8, offset:u16, aux:i16}`.
///
/// `aux` is -1 unless the field is a reference that must be eagerly
/// instantiated to a default object of class `aux`.
#[derive(Debug, Clone, Copy)]
pub struct FieldDesc {
    pub type_code: u8,
    pub offset: u16,
    pub aux: i16,
}

/// Region offsets and counts of a parsed image.
///
/// All offsets index the machine memory arena (the image is loaded at
/// offset 0). `stack0` is filled in after the statics value region is
/// materialized at load time.
#[derive(Debug, Clone, Default)]
pub struct ImageLayout {
    pub interval_us: i32,
    pub entry_method: u16,
    pub root_class: u16,

    pub code: usize,
    /// End of the code chunk; a program counter at or past this is fatal.
    pub code_end: usize,
    pub statics_val: usize,
    pub image_end: usize,
    pub stack0: usize,

    pub cart_io_count: usize,
    cart_io_table: usize,
    pub class_count: usize,
    class_table: usize,
    class_fields: usize,
    pub method_count: usize,
    method_table: usize,
    method_detail: usize,
    pub vmethod_count: usize,
    virt_offsets: usize,
    virt_entries: usize,
    pub statics_count: usize,
    /// Offset of the statics descriptor records, just past the count.
    pub statics_records: usize,
}

// Packed record widths (the image is 1-byte aligned throughout).
const CLASS_HEADER_SIZE: usize = 7;
const FIELD_DESC_SIZE: usize = 5;
const METHOD_INDEX_SIZE: usize = 8;

impl ImageLayout {
    /// Parse the meta header and section tables of an image occupying the
    /// front of a `memory_size`-byte arena.
    pub fn parse(mem: &[u8], memory_size: usize) -> Result<ImageLayout> {
        let mut r = Reader::at(mem, 0);
        let interval_us = r.read_i32()?;
        let entry_method = r.read_i32()?;
        let program_desc_size = r.read_i32()?;
        let code_chunk_size = r.read_i32()?;
        let virt_chunk_size = r.read_i32()?;
        let statics_desc_size = r.read_i32()?;
        let root_class = r.read_i32()?;

        let section = |v: i32, what: &str| -> Result<usize> {
            usize::try_from(v).map_err(|_| VmError::image(format!("negative {what} size")))
        };

        let program_desc = r.pos();
        let code = program_desc + section(program_desc_size, "program descriptor")?;
        let virt = code + section(code_chunk_size, "code chunk")?;
        let statics_desc = virt + section(virt_chunk_size, "virt chunk")?;
        // The statics value region is budgeted at twice the descriptor size:
        // a descriptor record is 3 bytes, a materialized slot at most 6.
        let statics_val = statics_desc + 2 * section(statics_desc_size, "statics descriptor")?;
        if statics_val > memory_size || statics_desc + 2 > mem.len() {
            return Err(VmError::image("image sections exceed machine memory"));
        }

        let mut layout = ImageLayout {
            interval_us,
            entry_method: u16::try_from(entry_method)
                .map_err(|_| VmError::image(format!("bad entry method id {entry_method}")))?,
            root_class: u16::try_from(root_class)
                .map_err(|_| VmError::image(format!("bad root class id {root_class}")))?,
            code,
            code_end: virt,
            statics_val,
            image_end: memory_size,
            ..ImageLayout::default()
        };

        // Program descriptor: cart-I/O offset table, then class layouts.
        let mut r = Reader::at(mem, program_desc);
        layout.cart_io_count = r.read_u16()? as usize;
        layout.cart_io_table = r.pos();
        r.skip(layout.cart_io_count * 4)?;
        layout.class_count = r.read_u16()? as usize;
        layout.class_table = r.pos();
        layout.class_fields = layout.class_table + CLASS_HEADER_SIZE * layout.class_count;

        // Code chunk: method index table, then concatenated bodies.
        let mut r = Reader::at(mem, code);
        layout.method_count = r.read_u16()? as usize;
        layout.method_table = r.pos();
        layout.method_detail = layout.method_table + METHOD_INDEX_SIZE * layout.method_count;
        if layout.method_detail > virt {
            return Err(VmError::image("method index table exceeds code chunk"));
        }

        // Virt chunk: per-method offsets, then dispatch entry lists.
        let mut r = Reader::at(mem, virt);
        layout.vmethod_count = r.read_u16()? as usize;
        layout.virt_offsets = r.pos();
        layout.virt_entries = layout.virt_offsets + 2 * layout.vmethod_count;

        let mut r = Reader::at(mem, statics_desc);
        layout.statics_count = r.read_u16()? as usize;
        layout.statics_records = r.pos();

        Ok(layout)
    }

    /// Offset of the static value slot backing cart-I/O id `cart_id`.
    pub fn cart_io_slot(&self, mem: &[u8], cart_id: usize) -> Result<usize> {
        if cart_id >= self.cart_io_count {
            return Err(VmError::image(format!(
                "cart-I/O id {cart_id} out of range (count {})",
                self.cart_io_count
            )));
        }
        let off = Reader::at(mem, self.cart_io_table + 4 * cart_id).read_i32()?;
        Ok(self.statics_val + off as usize)
    }

    /// Class header for `class_id`.
    pub fn class_layout(&self, mem: &[u8], class_id: u16) -> Result<ClassLayout> {
        let idx = class_id as usize;
        if idx >= self.class_count {
            return Err(VmError::image(format!(
                "class id {class_id} out of range (count {})",
                self.class_count
            )));
        }
        let mut r = Reader::at(mem, self.class_table + CLASS_HEADER_SIZE * idx);
        Ok(ClassLayout {
            total_size: r.read_u16()?,
            field_count: r.read_u8()?,
            layout_offset: r.read_i32()? as u32,
        })
    }

    /// Field record `index` of a class previously fetched with
    /// [`Self::class_layout`].
    pub fn field_desc(&self, mem: &[u8], class: &ClassLayout, index: usize) -> Result<FieldDesc> {
        let at = self.class_fields + class.layout_offset as usize + FIELD_DESC_SIZE * index;
        let mut r = Reader::at(mem, at);
        Ok(FieldDesc {
            type_code: r.read_u8()?,
            offset: r.read_u16()?,
            aux: r.read_i16()?,
        })
    }

    /// `(meta offset, code offset)` of method `method_id`, both absolute.
    pub fn method_offsets(&self, mem: &[u8], method_id: u16) -> Result<(usize, usize)> {
        let idx = method_id as usize;
        if idx >= self.method_count {
            return Err(VmError::image(format!(
                "method id {method_id} out of range (count {})",
                self.method_count
            )));
        }
        let mut r = Reader::at(mem, self.method_table + METHOD_INDEX_SIZE * idx);
        let meta = r.read_i32()?;
        let code = r.read_i32()?;
        Ok((
            self.method_detail + meta as usize,
            self.method_detail + code as usize,
        ))
    }

    /// Dispatch list of virtual method `virt_id`:
    /// `(param_count, [(class_id, method_id)])` walked lazily.
    pub fn virt_entry(&self, mem: &[u8], virt_id: u16) -> Result<VirtEntry> {
        let idx = virt_id as usize;
        if idx >= self.vmethod_count {
            return Err(VmError::image(format!(
                "virtual method id {virt_id} out of range (count {})",
                self.vmethod_count
            )));
        }
        let off = Reader::at(mem, self.virt_offsets + 2 * idx).read_u16()?;
        let base = self.virt_entries + off as usize;
        let mut r = Reader::at(mem, base);
        Ok(VirtEntry {
            class_count: r.read_u8()?,
            param_count: r.read_u8()?,
            entries_at: r.pos(),
        })
    }

    /// Resolve `virt_id` against a concrete class, walking the entry list
    /// linearly and stopping at the first class-id match.
    pub fn resolve_virtual(&self, mem: &[u8], virt_id: u16, class_id: u16) -> Result<u16> {
        let entry = self.virt_entry(mem, virt_id)?;
        let mut r = Reader::at(mem, entry.entries_at);
        for _ in 0..entry.class_count {
            let cls = r.read_u16()?;
            let mid = r.read_u16()?;
            if cls == class_id {
                return Ok(mid);
            }
        }
        Err(VmError::image(format!(
            "no implementation of virtual method {virt_id} for class {class_id}"
        )))
    }
}

/// One virtual dispatch table entry header.
#[derive(Debug, Clone, Copy)]
pub struct VirtEntry {
    pub class_count: u8,
    pub param_count: u8,
    pub entries_at: usize,
}
