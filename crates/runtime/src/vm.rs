//! The runtime instance.
//!
//! Everything the machine owns — memory arena, heap table, frames, builtin
//! table, cyclic I/O — hangs off one [`Vm`] value, so isolated machines can
//! coexist in one process. `set_program` loads and re-arms; `run` executes
//! one iteration of the cyclic model.

use std::sync::Arc;

use relay_core::slot;
use relay_core::value::TypeCode;
use tracing::debug;

use crate::builtins::{BuiltinFn, BuiltinTable};
use crate::error::{Result, VmError};
use crate::frame::Frame;
use crate::heap::HeapTable;
use crate::host::Host;
use crate::image::ImageLayout;
use crate::io::{CartBitmap, CyclicIo, IoBuf, IoHandle, SLOT_NUMBER};

/// One isolated virtual machine.
pub struct Vm {
    /// The flat byte arena: image, statics values, frame region, heap.
    pub(crate) mem: Vec<u8>,
    pub(crate) host: Box<dyn Host>,
    pub(crate) image: ImageLayout,
    pub(crate) heap: HeapTable,
    pub(crate) frames: Vec<Frame>,
    pub(crate) builtins: BuiltinTable,
    pub(crate) io: Arc<CyclicIo>,
    /// The frozen input buffer the current iteration reads.
    pub(crate) processing: IoBuf,
    /// Parallel sort index over the processing slots.
    pub(crate) sorted: Vec<u16>,
    pub(crate) touched: CartBitmap,
    pub(crate) iterations: i32,
    pub(crate) lower_len: usize,
    /// `this` id during a built-in constructor call, 0 otherwise.
    pub(crate) ctor_this: i32,
    loaded: bool,
    halted: bool,
}

impl Vm {
    pub fn new(host: Box<dyn Host>) -> Self {
        Vm {
            mem: Vec::new(),
            host,
            image: ImageLayout::default(),
            heap: HeapTable::new(0),
            frames: Vec::new(),
            builtins: BuiltinTable::with_standard(),
            io: Arc::new(CyclicIo::new()),
            processing: IoBuf::default(),
            sorted: vec![0; SLOT_NUMBER],
            touched: CartBitmap::new(),
            iterations: 0,
            lower_len: 0,
            ctor_this: 0,
            loaded: false,
            halted: false,
        }
    }

    /// Load a program image into a `memory_size`-byte arena, materialize
    /// the statics (eagerly instantiating nested objects), and create the
    /// root object. Returns the operation interval in microseconds.
    pub fn set_program(&mut self, image: &[u8], memory_size: usize) -> Result<i32> {
        if image.len() > memory_size {
            return Err(VmError::image(format!(
                "image of {} bytes exceeds machine memory of {memory_size}",
                image.len()
            )));
        }
        let mut mem = vec![0u8; memory_size];
        mem[..image.len()].copy_from_slice(image);
        let mut layout = ImageLayout::parse(&mem, memory_size)?;

        // The frame region starts where the statics values end; lay that
        // out before anything allocates.
        let mut desc = layout.statics_records;
        let mut val_end = layout.statics_val;
        for _ in 0..layout.statics_count {
            let code = TypeCode::decode(mem[desc]).ok_or_else(|| {
                VmError::image(format!("static with unknown type {}", mem[desc]))
            })?;
            desc += 3;
            val_end += code.slot_size();
        }
        layout.stack0 = val_end;
        if layout.stack0 > memory_size {
            return Err(VmError::image("statics region exceeds machine memory"));
        }

        let root_class = layout.root_class;
        let interval = layout.interval_us;
        self.mem = mem;
        self.image = layout;
        self.heap = HeapTable::new(memory_size);
        self.frames.clear();
        self.touched.clear();
        self.iterations = 0;
        self.lower_len = 0;
        self.ctor_this = 0;
        self.halted = false;
        self.loaded = true;

        // The root object is always reference id 1.
        let root = self.alloc_object(root_class)?;
        if root != 1 {
            return Err(VmError::lifecycle("root object did not receive id 1"));
        }

        // Materialize static value slots from the descriptor records.
        let mut desc = self.image.statics_records;
        let mut at = self.image.statics_val;
        for _ in 0..self.image.statics_count {
            let tag = self.mem[desc];
            let aux = i16::from_le_bytes([self.mem[desc + 1], self.mem[desc + 2]]);
            desc += 3;
            let code = TypeCode::decode(tag)
                .ok_or_else(|| VmError::image(format!("static with unknown type {tag}")))?;
            self.mem[at] = tag;
            if code == TypeCode::ReferenceId && aux >= 0 {
                let id = self.alloc_object(aux as u16)?;
                slot::write_i32(&mut self.mem, at, id);
            } else {
                self.mem[at + 1..at + code.slot_size()].fill(0);
            }
            at += code.slot_size();
        }

        // Drain both I/O buffers and the snapshot latch.
        self.io.swap_into(&mut self.processing);
        self.processing.clear();

        debug!(
            interval_us = interval,
            statics = self.image.statics_count,
            root_class,
            "program loaded"
        );
        Ok(interval)
    }

    /// Execute one iteration: swap and sort the input buffers, clear the
    /// touched map, invoke the entry method, then collect the heap.
    ///
    /// A snapshot must have been supplied since the previous run. Any fault
    /// is reported through the host and latches the machine into a halted
    /// state.
    pub fn run(&mut self, iteration: i32) -> Result<()> {
        if !self.loaded {
            return Err(VmError::lifecycle("run without a loaded program"));
        }
        if self.halted {
            return Err(VmError::lifecycle("machine halted by a previous fault"));
        }

        let result = self.run_inner(iteration);
        if let Err(e) = &result {
            let off = e.il_offset.map_or(-1, |o| o as i32);
            let msg = e.to_string();
            self.host.report_error(off, &msg);
            self.halted = true;
            self.frames.clear();
        }
        result
    }

    fn run_inner(&mut self, iteration: i32) -> Result<()> {
        if !self.io.snapshot_present() {
            return Err(VmError::lifecycle(
                "must update the machine snapshot before a new iteration",
            ));
        }
        self.io.swap_into(&mut self.processing);
        self.sort_slots();
        self.touched.clear();
        self.iterations = iteration;
        debug!(iteration, slots = self.processing.slots.len(), "iteration start");

        let entry = self.image.entry_method;
        self.invoke(entry, -1, None)?;
        self.collect()
    }

    // =========================================================================
    // Producer surface
    // =========================================================================

    pub fn put_snapshot_buffer(&self, bytes: &[u8]) -> Result<()> {
        self.io.put_snapshot(bytes)
    }

    pub fn put_stream_buffer(&self, port: i32, bytes: &[u8]) -> Result<()> {
        self.io.put_stream(port, bytes)
    }

    pub fn put_event_buffer(&self, port: i32, event: i32, bytes: &[u8]) -> Result<()> {
        self.io.put_event(port, event, bytes)
    }

    /// A cloneable handle for feeding buffers from another thread.
    pub fn io_handle(&self) -> IoHandle {
        IoHandle(Arc::clone(&self.io))
    }

    // =========================================================================
    // Host exchange
    // =========================================================================

    /// The dirty-cart-I/O upload for the completed iteration.
    pub fn lower_memory(&mut self) -> Result<&[u8]> {
        let len = self.build_lower_memory()?;
        let base = self.image.stack0;
        Ok(&self.mem[base..base + len])
    }

    /// Size of the blob produced by the last [`Self::lower_memory`] call.
    pub fn lower_memory_size(&self) -> usize {
        self.lower_len
    }

    /// Append a native built-in past the standard set; the returned index
    /// is stable for the life of the process.
    pub fn register_builtin(&mut self, f: BuiltinFn) -> Result<u16> {
        self.builtins.register(f)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn iteration(&self) -> i32 {
        self.iterations
    }

    /// Number of live heap objects.
    pub fn live_objects(&self) -> usize {
        self.heap.live_count()
    }

    /// The next reference id the heap will hand out.
    pub fn heap_next_id(&self) -> i32 {
        self.heap.next_id
    }

    /// Type code and zero-extended payload of static slot `index`.
    pub fn static_slot(&self, index: usize) -> Result<(TypeCode, i32)> {
        if index >= self.image.statics_count {
            return Err(VmError::image(format!(
                "static index {index} out of range (count {})",
                self.image.statics_count
            )));
        }
        let mut at = self.image.statics_val;
        for _ in 0..index {
            let code = slot::type_of(&self.mem, at)
                .ok_or_else(|| VmError::lifecycle("static slot with unknown type"))?;
            at += code.slot_size();
        }
        let code = slot::type_of(&self.mem, at)
            .ok_or_else(|| VmError::lifecycle("static slot with unknown type"))?;
        Ok((code, self.read_payload(code, at)))
    }

    /// Type code and zero-extended payload of the field at byte `offset`
    /// within object `id`.
    pub fn object_field(&self, id: i32, offset: usize) -> Result<(TypeCode, i32)> {
        let (_, payload) = self.object_info(id, "field read")?;
        let at = payload + offset;
        let code = slot::type_of(&self.mem, at)
            .ok_or_else(|| VmError::type_error("field with unknown type"))?;
        Ok((code, self.read_payload(code, at)))
    }

    /// Raw element bytes of array object `id`.
    pub fn array_bytes(&self, id: i32) -> Result<Vec<u8>> {
        let (elem, len, payload) = self.array_info(id, "array read")?;
        let code = TypeCode::decode(elem)
            .ok_or_else(|| VmError::type_error("array with unknown element type"))?;
        Ok(self.mem[payload..payload + code.payload_size() * len as usize].to_vec())
    }

    fn read_payload(&self, code: TypeCode, at: usize) -> i32 {
        match code.payload_size() {
            1 => i32::from(self.mem[at + 1]),
            2 => i32::from(u16::from_le_bytes([self.mem[at + 1], self.mem[at + 2]])),
            _ => slot::read_i32(&self.mem, at),
        }
    }
}
