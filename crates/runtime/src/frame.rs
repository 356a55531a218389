//! Call frames.
//!
//! Frames stack upward in the region between the statics values and the
//! heap. A frame's data — packed args, packed locals, materialized inline
//! value-type objects, then the 8-byte-strided evaluation stack — lives in
//! machine memory so that address loads can reference it; the header itself
//! is a plain Rust struct.

use relay_core::slot;
use relay_core::value::{OBJECT_HEADER, OBJECT_HEADER_SIZE, TypeCode};
use tracing::trace;

use crate::error::{Result, VmError};
use crate::image::Reader;
use crate::vm::Vm;

/// Maximum call depth.
pub const MAX_FRAME_DEPTH: usize = 32;

/// Header of one live call frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub method_id: u16,
    /// Program counter, an offset into machine memory.
    pub pc: usize,
    /// First code byte of the method; branch targets are relative to it.
    pub entry_il: usize,
    /// Current evaluation top (next push goes here).
    pub eval_ptr: usize,
    /// Base of the packed argument slots.
    pub args: usize,
    /// Base of the packed local slots.
    pub vars: usize,
    /// Base of the evaluation stack, aligned so payloads sit on 4 bytes.
    pub eval_base: usize,
    /// Byte bound of the evaluation region above `eval_base`.
    pub max_stack: usize,
}

/// An inline value-type slot awaiting materialization past the locals.
struct PendingInline {
    class_id: u16,
    /// Offset of the `JumpAddress` slot to patch.
    slot_at: usize,
    /// Heap object to copy contents from, 0 for zero-init.
    copy_from: i32,
}

impl Vm {
    /// Set up a frame for `method_id` and leave it on top of the frame
    /// stack with its PC at the method entry.
    ///
    /// `new_obj` is the freshly allocated `this` for constructor calls (the
    /// caller does not supply a `this` slot then), -1 otherwise. For
    /// non-entry calls `caller_eptr` is the caller's evaluation top; the
    /// arguments are popped from it in reverse and copied into the new
    /// frame with `copy_val`.
    pub(crate) fn push_frame(
        &mut self,
        method_id: u16,
        new_obj: i32,
        caller_eptr: Option<&mut usize>,
    ) -> Result<()> {
        if self.frames.len() >= MAX_FRAME_DEPTH {
            return Err(VmError::memory(format!(
                "call depth exceeds {MAX_FRAME_DEPTH}"
            )));
        }
        let depth = self.frames.len();
        let base = match self.frames.last() {
            Some(caller) => caller.eval_ptr,
            None => self.image.stack0,
        };

        let (meta_off, code_off) = self.image.method_offsets(&self.mem, method_id)?;
        let mut r = Reader::at(&self.mem, meta_off);
        let _ret_type = r.read_u8()?;
        let _ret_class = r.read_i16()?;
        let n_args = r.read_u16()? as usize;
        let mut args_meta = Vec::with_capacity(n_args);
        for _ in 0..n_args {
            args_meta.push((r.read_u8()?, r.read_i16()?));
        }
        let n_vars = r.read_u16()? as usize;
        let mut vars_meta = Vec::with_capacity(n_vars);
        for _ in 0..n_vars {
            vars_meta.push((r.read_u8()?, r.read_i16()?));
        }
        let max_stack = r.read_i32()?;
        let max_stack = usize::try_from(max_stack)
            .map_err(|_| VmError::image(format!("method {method_id} has bad max-stack")))?;

        let mut pending: Vec<PendingInline> = Vec::new();
        let mut sptr = base;

        let args_base = sptr;
        if depth == 0 {
            // The entry frame synthesizes its own arguments:
            // (this = root object, Int32 iteration).
            let shape_ok = n_args == 2
                && args_meta[0].0 == TypeCode::ReferenceId as u8
                && args_meta[1].0 == TypeCode::Int32 as u8;
            if !shape_ok {
                return Err(VmError::image("entry method must be 'void Entry(int)'"));
            }
            slot::write_tagged_i32(&mut self.mem, sptr, TypeCode::ReferenceId, 1);
            sptr += TypeCode::ReferenceId.slot_size();
            slot::write_tagged_i32(&mut self.mem, sptr, TypeCode::Int32, self.iterations);
            sptr += TypeCode::Int32.slot_size();
        } else {
            let eptr = caller_eptr
                .ok_or_else(|| VmError::lifecycle("non-entry call without a caller stack"))?;
            let caller_base = self.frames[depth - 1].eval_base;
            let first_arg = if new_obj > 0 { 1 } else { 0 };
            if n_args < first_arg {
                return Err(VmError::image(format!(
                    "constructor method {method_id} declares no arguments"
                )));
            }

            let popped = n_args - first_arg;
            if *eptr < caller_base + 8 * popped {
                return Err(VmError::memory(format!(
                    "calling method {method_id}: evaluation stack underflow popping {popped} args"
                )));
            }
            *eptr -= 8 * popped;
            let mut septr = *eptr;

            if new_obj > 0 {
                if args_meta[0].0 != TypeCode::ReferenceId as u8 {
                    return Err(VmError::image(format!(
                        "constructor method {method_id} lacks a reference 'this'"
                    )));
                }
                slot::write_tagged_i32(&mut self.mem, sptr, TypeCode::ReferenceId, new_obj);
                sptr += TypeCode::ReferenceId.slot_size();
            }

            for &(type_byte, aux) in &args_meta[first_arg..] {
                let code = TypeCode::decode(type_byte).ok_or_else(|| {
                    VmError::image(format!("method {method_id} argument of unknown type {type_byte}"))
                })?;
                if code == TypeCode::JumpAddress {
                    // Inline value-type parameter: capture the source heap
                    // object now, materialize past the locals.
                    if aux < 0 {
                        return Err(VmError::image(
                            "inline value parameter without an instantiable class",
                        ));
                    }
                    if slot::tag(&self.mem, septr) != TypeCode::ReferenceId as u8 {
                        return Err(VmError::type_error(format!(
                            "inline value parameter fed from type {}",
                            slot::tag(&self.mem, septr)
                        )));
                    }
                    pending.push(PendingInline {
                        class_id: aux as u16,
                        slot_at: sptr,
                        copy_from: slot::read_i32(&self.mem, septr),
                    });
                    self.mem[sptr] = TypeCode::JumpAddress as u8;
                } else {
                    self.mem[sptr] = type_byte;
                    self.copy_val(sptr, septr)?;
                }
                sptr += code.slot_size();
                septr += 8;
            }
        }

        // Zero the locals; inline-struct locals join the pending list.
        let vars_base = sptr;
        for &(type_byte, aux) in &vars_meta {
            let code = TypeCode::decode(type_byte).ok_or_else(|| {
                VmError::image(format!("method {method_id} local of unknown type {type_byte}"))
            })?;
            if code == TypeCode::JumpAddress {
                if aux < 0 {
                    return Err(VmError::image(
                        "inline value local without an instantiable class",
                    ));
                }
                pending.push(PendingInline {
                    class_id: aux as u16,
                    slot_at: sptr,
                    copy_from: 0,
                });
            }
            self.mem[sptr] = type_byte;
            self.mem[sptr + 1..sptr + code.slot_size()].fill(0);
            sptr += code.slot_size();
        }

        // Materialize inline value-type objects past the locals and patch
        // their JumpAddress slots with the object offsets.
        for p in &pending {
            let class = self.image.class_layout(&self.mem, p.class_id)?;
            let size = class.total_size as usize + OBJECT_HEADER_SIZE;
            self.mem[sptr] = OBJECT_HEADER;
            self.mem[sptr + 1..sptr + 3].copy_from_slice(&p.class_id.to_le_bytes());
            let payload = sptr + OBJECT_HEADER_SIZE;
            self.mem[payload..sptr + size].fill(0);

            if p.copy_from > 0 {
                let (cls, src_payload) = self.object_info(p.copy_from, "inline argument copy")?;
                if cls != p.class_id {
                    return Err(VmError::type_error(format!(
                        "inline argument copy from class {cls}, expected class {}",
                        p.class_id
                    )));
                }
                self.mem.copy_within(
                    src_payload..src_payload + class.total_size as usize,
                    payload,
                );
            } else {
                for i in 0..class.field_count as usize {
                    let field = self.image.field_desc(&self.mem, &class, i)?;
                    self.mem[payload + field.offset as usize] = field.type_code;
                }
            }

            slot::write_i32(&mut self.mem, p.slot_at, sptr as i32);
            sptr += size;
        }

        // Align the evaluation base so slot payloads (base + 1) land on a
        // 4-byte boundary.
        let eval_base = ((sptr + 3) & !3) + 3;
        if eval_base + max_stack > self.heap.tail() {
            return Err(VmError::memory(format!(
                "frame for method {method_id} collides with the heap"
            )));
        }

        trace!(method_id, depth, n_args, n_vars, "push frame");
        self.frames.push(Frame {
            method_id,
            pc: code_off,
            entry_il: code_off,
            eval_ptr: eval_base,
            args: args_base,
            vars: vars_base,
            eval_base,
            max_stack,
        });
        Ok(())
    }
}
