//! The interpreter.
//!
//! One loop over the current frame's program counter: read an opcode byte,
//! read its operand immediates, manipulate the 8-byte-strided evaluation
//! stack. Calls recurse through [`Vm::invoke`]; a frame runs to completion
//! before control returns to its caller's dispatch loop.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use relay_core::slot;
use relay_core::value::{MethodKind, MethodRef, STRING_HEADER, ARRAY_HEADER, TypeCode};
use tracing::trace;

use crate::error::{Result, VmError};
use crate::vm::Vm;

/// Opcode bytes. The assignment is image ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum Op {
    Nop = 0x00,
    Break = 0x01,
    Ldarg = 0x02,
    Ldarga = 0x03,
    Starg = 0x04,
    Ldloc = 0x06,
    Stloc = 0x0A,
    Ldloca = 0x0B,
    Ldc = 0x15,
    /// `ldstr` or `newarr`, discriminated by a header-tag operand.
    NewHeap = 0x16,
    Dup = 0x23,
    Pop = 0x24,
    Jmp = 0x25,
    Ret = 0x26,
    BrS = 0x27,
    BrfalseS = 0x28,
    BrtrueS = 0x29,
    BeqS = 0x2A,
    BgeS = 0x2B,
    BgtS = 0x2C,
    BleS = 0x2D,
    BltS = 0x2E,
    BneUnS = 0x2F,
    BgeUnS = 0x30,
    BgtUnS = 0x31,
    BleUnS = 0x32,
    BltUnS = 0x33,
    Br = 0x34,
    Brfalse = 0x35,
    Brtrue = 0x36,
    Beq = 0x37,
    Bge = 0x38,
    Bgt = 0x39,
    Ble = 0x3A,
    Blt = 0x3B,
    BneUn = 0x3C,
    BgeUn = 0x3D,
    BgtUn = 0x3E,
    BleUn = 0x3F,
    BltUn = 0x40,
    Ldind = 0x41,
    Stind = 0x4C,
    Arith = 0x4D,
    Switch = 0x50,
    Neg = 0x6D,
    Not = 0x6E,
    ConvI1 = 0x70,
    ConvU1 = 0x71,
    ConvI2 = 0x72,
    ConvU2 = 0x73,
    ConvI4 = 0x74,
    ConvU4 = 0x75,
    ConvR4 = 0x76,
    ConvRUn = 0x77,
    Initobj = 0x79,
    Newobj = 0x7A,
    Ldfld = 0x7B,
    Ldflda = 0x7C,
    Stfld = 0x7D,
    Ldlen = 0x8E,
    Ldelema = 0x8F,
    Ldelem = 0x90,
    Stelem = 0x91,
    Callvirt = 0xA0,
    LdftnLdtoken = 0xA1,
    CallvirtInstanced = 0xA2,
    Call = 0xA6,
    CallBuiltin = 0xA7,
    Calli = 0xA8,
    Ceq = 0xE2,
    Cgt = 0xE3,
    CgtUn = 0xE4,
    Clt = 0xE5,
    CltUn = 0xE6,
}

bitflags! {
    /// Access flag byte carried by the `ldfld`/`ldflda`/`stfld` family.
    struct FieldAccess: u8 {
        const STATIC = 1;
        const CART_IO = 2;
    }
}

/// Dispatch-kind bytes shared by `newobj`, `ldftn`, and `callvirt`
/// operands.
const KIND_CUSTOM: u8 = 0xA6;
const KIND_BUILTIN: u8 = 0xA7;
/// `ldtoken` sub-code under opcode 0xA1.
const KIND_TOKEN: u8 = 0x11;

/// Evaluation-region bounds of the running frame.
#[derive(Clone, Copy)]
pub(crate) struct Bounds {
    pub base: usize,
    pub limit: usize,
}

enum Flow {
    Continue,
    Return(Option<[u8; 8]>),
}

#[derive(Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

impl Vm {
    // =========================================================================
    // Stack and operand primitives
    // =========================================================================

    pub(crate) fn pop(&self, b: Bounds, eptr: &mut usize) -> Result<usize> {
        if *eptr < b.base + slot::STACK_STRIDE {
            return Err(VmError::memory("evaluation stack underflow"));
        }
        *eptr -= slot::STACK_STRIDE;
        Ok(*eptr)
    }

    /// Reserve the next evaluation slot, honoring the frame's max-stack.
    pub(crate) fn bump(&self, b: Bounds, eptr: &mut usize) -> Result<usize> {
        if *eptr + slot::STACK_STRIDE > b.limit {
            return Err(VmError::memory("evaluation stack exceeds max-stack"));
        }
        let at = *eptr;
        *eptr += slot::STACK_STRIDE;
        Ok(at)
    }

    fn push_tagged_i32(
        &mut self,
        b: Bounds,
        eptr: &mut usize,
        code: TypeCode,
        v: i32,
    ) -> Result<()> {
        let at = self.bump(b, eptr)?;
        slot::write_tagged_i32(&mut self.mem, at, code, v);
        Ok(())
    }

    fn push_f32(&mut self, b: Bounds, eptr: &mut usize, v: f32) -> Result<()> {
        let at = self.bump(b, eptr)?;
        slot::write_tagged_f32(&mut self.mem, at, TypeCode::Single, v);
        Ok(())
    }

    fn push_ref(&mut self, b: Bounds, eptr: &mut usize, id: i32) -> Result<()> {
        self.push_tagged_i32(b, eptr, TypeCode::ReferenceId, id)
    }

    fn push_address(&mut self, b: Bounds, eptr: &mut usize, off: usize, rt: u8) -> Result<()> {
        let at = self.bump(b, eptr)?;
        slot::write_address(&mut self.mem, at, off as u32, rt);
        Ok(())
    }

    /// Push a copy of the tagged value slot at `src` (8 raw bytes).
    fn push_indirect(&mut self, b: Bounds, eptr: &mut usize, src: usize) -> Result<()> {
        let at = self.bump(b, eptr)?;
        slot::copy_slot(&mut self.mem, at, src);
        Ok(())
    }

    fn fetch_u8(&self, pc: &mut usize) -> Result<u8> {
        let v = *self
            .mem
            .get(*pc)
            .ok_or_else(|| VmError::image("instruction stream truncated"))?;
        *pc += 1;
        Ok(v)
    }

    fn fetch_u16(&self, pc: &mut usize) -> Result<u16> {
        let b = self
            .mem
            .get(*pc..*pc + 2)
            .ok_or_else(|| VmError::image("instruction stream truncated"))?;
        *pc += 2;
        Ok(u16::from_le_bytes(b.try_into().unwrap()))
    }

    fn fetch_i16(&self, pc: &mut usize) -> Result<i16> {
        Ok(self.fetch_u16(pc)? as i16)
    }

    fn fetch_i32(&self, pc: &mut usize) -> Result<i32> {
        let b = self
            .mem
            .get(*pc..*pc + 4)
            .ok_or_else(|| VmError::image("instruction stream truncated"))?;
        *pc += 4;
        Ok(i32::from_le_bytes(b.try_into().unwrap()))
    }

    fn branch_target(&self, entry_il: usize, off: i16) -> Result<usize> {
        entry_il
            .checked_add_signed(off as isize)
            .ok_or_else(|| VmError::image(format!("branch offset {off} escapes the method")))
    }

    // =========================================================================
    // Frame execution
    // =========================================================================

    /// Call method `method_id`: push a frame, run it to completion, pop it,
    /// and deliver any return value to the caller's evaluation stack.
    pub(crate) fn invoke(
        &mut self,
        method_id: u16,
        new_obj: i32,
        mut caller_eptr: Option<&mut usize>,
    ) -> Result<()> {
        self.push_frame(method_id, new_obj, caller_eptr.as_deref_mut())?;
        let ret = self.exec_frame();
        self.frames.pop();
        if let Some(bytes) = ret? {
            if let Some(eptr) = caller_eptr {
                self.mem[*eptr..*eptr + slot::STACK_STRIDE].copy_from_slice(&bytes);
                *eptr += slot::STACK_STRIDE;
            }
        }
        Ok(())
    }

    fn exec_frame(&mut self) -> Result<Option<[u8; 8]>> {
        loop {
            let f = self.frames.last().expect("running frame");
            let bounds = Bounds {
                base: f.eval_base,
                limit: f.eval_base + f.max_stack,
            };
            let entry_il = f.entry_il;
            let mut pc = f.pc;
            let mut eptr = f.eval_ptr;
            let il_off = (pc - entry_il) as u32;

            let flow = self
                .step(&mut pc, &mut eptr, entry_il, bounds)
                .map_err(|e| e.at_il(il_off))?;

            // A returning frame is done with its pc; a `ret` on the last
            // byte of the code chunk legitimately leaves pc == code_end.
            if let Flow::Return(v) = flow {
                return Ok(v);
            }
            if pc >= self.image.code_end {
                return Err(VmError::image("program counter escaped the code region").at_il(il_off));
            }
            let f = self.frames.last_mut().expect("running frame");
            f.pc = pc;
            f.eval_ptr = eptr;
        }
    }

    fn step(
        &mut self,
        pc: &mut usize,
        eptr: &mut usize,
        entry_il: usize,
        b: Bounds,
    ) -> Result<Flow> {
        let byte = self.fetch_u8(pc)?;
        let op = Op::try_from(byte)
            .map_err(|_| VmError::image(format!("unknown instruction 0x{byte:02X}")))?;
        trace!(op = ?op, il = *pc - entry_il - 1, depth = self.frames.len());

        match op {
            Op::Nop | Op::Break => {}

            Op::Ldarg => {
                let offset = self.fetch_u16(pc)? as usize;
                let args = self.frames.last().unwrap().args;
                self.push_indirect(b, eptr, args + offset)?;
            }
            Op::Ldarga => {
                let offset = self.fetch_u16(pc)? as usize;
                let at = self.frames.last().unwrap().args + offset;
                self.push_address(b, eptr, at + 1, self.mem[at])?;
            }
            Op::Starg => {
                let offset = self.fetch_u16(pc)? as usize;
                let at = self.frames.last().unwrap().args + offset;
                let val = self.pop(b, eptr)?;
                self.copy_val(at, val)?;
            }
            Op::Ldloc => {
                let offset = self.fetch_u16(pc)? as usize;
                let vars = self.frames.last().unwrap().vars;
                self.push_indirect(b, eptr, vars + offset)?;
            }
            Op::Stloc => {
                let _declared = self.fetch_u8(pc)?;
                let offset = self.fetch_u16(pc)? as usize;
                let at = self.frames.last().unwrap().vars + offset;
                let val = self.pop(b, eptr)?;
                self.copy_val(at, val)?;
            }
            Op::Ldloca => {
                let offset = self.fetch_u16(pc)? as usize;
                let at = self.frames.last().unwrap().vars + offset;
                self.push_address(b, eptr, at + 1, self.mem[at])?;
            }

            Op::Ldc => {
                let code = self.fetch_u8(pc)?;
                match TypeCode::decode(code) {
                    Some(TypeCode::Int32) => {
                        let v = self.fetch_i32(pc)?;
                        self.push_tagged_i32(b, eptr, TypeCode::Int32, v)?;
                    }
                    Some(TypeCode::Single) => {
                        let bits = self.fetch_i32(pc)?;
                        self.push_tagged_i32(b, eptr, TypeCode::Single, bits)?;
                    }
                    // ldnull
                    Some(TypeCode::ReferenceId) => self.push_ref(b, eptr, 0)?,
                    _ => return Err(VmError::image(format!("ldc of unsupported type {code}"))),
                }
            }

            Op::NewHeap => self.op_new_heap(pc, eptr, b)?,

            Op::Dup => {
                if *eptr < b.base + slot::STACK_STRIDE {
                    return Err(VmError::memory("dup on empty evaluation stack"));
                }
                self.push_indirect(b, eptr, *eptr - slot::STACK_STRIDE)?;
            }
            Op::Pop => {
                self.pop(b, eptr)?;
            }

            Op::Jmp | Op::Calli => {
                return Err(VmError::image(format!("unsupported instruction {op:?}")));
            }

            Op::Ret => {
                if *eptr > b.base {
                    let at = self.pop(b, eptr)?;
                    let mut out = [0u8; 8];
                    out.copy_from_slice(&self.mem[at..at + 8]);
                    return Ok(Flow::Return(Some(out)));
                }
                return Ok(Flow::Return(None));
            }

            Op::BrS | Op::Br => {
                let off = self.fetch_i16(pc)?;
                *pc = self.branch_target(entry_il, off)?;
            }
            Op::BrfalseS | Op::Brfalse | Op::BrtrueS | Op::Brtrue => {
                let off = self.fetch_i16(pc)?;
                let at = self.pop(b, eptr)?;
                let v = slot::widen_int(&self.mem, at, true).ok_or_else(|| {
                    VmError::type_error(format!(
                        "unsupported branch operand type {}",
                        self.mem[at]
                    ))
                })?;
                let truthy = v != 0;
                let wanted = matches!(op, Op::BrtrueS | Op::Brtrue);
                if truthy == wanted {
                    *pc = self.branch_target(entry_il, off)?;
                }
            }

            Op::BeqS | Op::BgeS | Op::BgtS | Op::BleS | Op::BltS | Op::BneUnS | Op::BgeUnS
            | Op::BgtUnS | Op::BleUnS | Op::BltUnS | Op::Beq | Op::Bge | Op::Bgt | Op::Ble
            | Op::Blt | Op::BneUn | Op::BgeUn | Op::BgtUn | Op::BleUn | Op::BltUn => {
                let off = self.fetch_i16(pc)?;
                let v2 = self.pop(b, eptr)?;
                let v1 = self.pop(b, eptr)?;
                let (cmp, unsigned) = branch_cmp(op);
                if self.compare(cmp, unsigned, v1, v2, false)? {
                    *pc = self.branch_target(entry_il, off)?;
                }
            }

            Op::Ldind => {
                let code = self.fetch_u8(pc)?;
                let at = self.pop(b, eptr)?;
                if slot::tag(&self.mem, at) != TypeCode::Address as u8 {
                    return Err(VmError::type_error("ldind operand is not an address"));
                }
                let (off, rt) = slot::read_address(&self.mem, at);
                if rt != code {
                    return Err(VmError::type_error(format!(
                        "ldind of type {code} through an address of type {rt}"
                    )));
                }
                let val_at = off as usize;
                let dst = self.bump(b, eptr)?;
                self.mem[dst] = code;
                self.mem.copy_within(val_at..val_at + 4, dst + 1);
            }
            Op::Stind => {
                let code = self.fetch_u8(pc)?;
                let val = self.pop(b, eptr)?;
                let addr = self.pop(b, eptr)?;
                if slot::tag(&self.mem, addr) != TypeCode::Address as u8 {
                    return Err(VmError::type_error("stind operand is not an address"));
                }
                let (off, _) = slot::read_address(&self.mem, addr);
                let width = raw_width(code);
                self.mem
                    .copy_within(val + 1..val + 1 + width, off as usize);
            }

            Op::Arith => self.op_arith(pc, eptr, b)?,

            Op::Switch => {
                let n = self.fetch_u16(pc)? as usize;
                let at = self.pop(b, eptr)?;
                if slot::tag(&self.mem, at) != TypeCode::Int32 as u8 {
                    return Err(VmError::type_error(format!(
                        "switch requires an Int32 selector, got type {}",
                        self.mem[at]
                    )));
                }
                let sel = slot::read_i32(&self.mem, at) as u32 as usize;
                if sel < n {
                    let mut table = *pc + 2 * sel;
                    let off = self.fetch_u16(&mut table)?;
                    *pc = entry_il + off as usize;
                } else {
                    *pc += 2 * n;
                }
            }

            Op::Neg => {
                let at = self.pop(b, eptr)?;
                match slot::type_of(&self.mem, at) {
                    Some(TypeCode::Int32) => {
                        let v = slot::read_i32(&self.mem, at).wrapping_neg();
                        self.push_tagged_i32(b, eptr, TypeCode::Int32, v)?;
                    }
                    Some(TypeCode::Single) => {
                        let v = -slot::read_f32(&self.mem, at);
                        self.push_f32(b, eptr, v)?;
                    }
                    _ => {
                        return Err(VmError::type_error(format!(
                            "neg of unsupported type {}",
                            self.mem[at]
                        )));
                    }
                }
            }
            Op::Not => {
                let at = self.pop(b, eptr)?;
                if slot::tag(&self.mem, at) != TypeCode::Int32 as u8 {
                    return Err(VmError::type_error(format!(
                        "not of unsupported type {}",
                        self.mem[at]
                    )));
                }
                let v = !slot::read_i32(&self.mem, at);
                self.push_tagged_i32(b, eptr, TypeCode::Int32, v)?;
            }

            Op::ConvI1 | Op::ConvU1 | Op::ConvI2 | Op::ConvU2 | Op::ConvI4 | Op::ConvU4
            | Op::ConvR4 | Op::ConvRUn => self.op_conv(op, eptr, b)?,

            Op::Initobj => {
                // The target was default-initialized when its frame slot was
                // materialized; discard the address.
                self.pop(b, eptr)?;
            }

            Op::Newobj => {
                let class_id = self.fetch_u16(pc)?;
                let kind = self.fetch_u8(pc)?;
                let method_id = self.fetch_u16(pc)?;
                let id = self.alloc_object(class_id)?;
                match kind {
                    KIND_CUSTOM => self.invoke(method_id, id, Some(&mut *eptr))?,
                    KIND_BUILTIN => {
                        self.ctor_this = id;
                        let r = self.call_builtin(method_id, eptr);
                        self.ctor_this = 0;
                        r?;
                    }
                    other => {
                        return Err(VmError::image(format!(
                            "newobj with unknown constructor kind 0x{other:02X}"
                        )));
                    }
                }
                self.push_ref(b, eptr, id)?;
            }

            Op::Ldfld | Op::Ldflda | Op::Stfld => self.op_field(op, pc, eptr, b)?,

            Op::Ldlen => {
                let at = self.pop(b, eptr)?;
                if slot::tag(&self.mem, at) != TypeCode::ReferenceId as u8 {
                    return Err(VmError::type_error("ldlen expects an array reference"));
                }
                let id = slot::read_i32(&self.mem, at);
                let (_, len, _) = self.array_info(id, "ldlen")?;
                self.push_tagged_i32(b, eptr, TypeCode::Int32, len)?;
            }

            Op::Ldelema => {
                let idx_at = self.pop(b, eptr)?;
                let index = slot::read_i32(&self.mem, idx_at);
                let arr_at = self.pop(b, eptr)?;
                if slot::tag(&self.mem, arr_at) != TypeCode::ReferenceId as u8 {
                    return Err(VmError::type_error("ldelema expects an array reference"));
                }
                let id = slot::read_i32(&self.mem, arr_at);
                let (elem, len, payload) = self.array_info(id, "ldelema")?;
                if index < 0 || index >= len {
                    return Err(VmError::reference(format!(
                        "ldelema index {index} out of range (len {len})"
                    )));
                }
                let ecode = TypeCode::decode(elem)
                    .ok_or_else(|| VmError::image(format!("array with unknown element type {elem}")))?;
                let mut at = payload + ecode.payload_size() * index as usize;
                let mut rt = elem;
                if ecode == TypeCode::BoxedObject {
                    // Unwrap to the boxed element's inner type.
                    rt = self.mem[at];
                    at += 1;
                }
                self.push_address(b, eptr, at, rt)?;
            }

            Op::Ldelem => {
                let declared = self.fetch_u8(pc)?;
                let idx_at = self.pop(b, eptr)?;
                let index = slot::read_i32(&self.mem, idx_at);
                let arr_at = self.pop(b, eptr)?;
                if slot::tag(&self.mem, arr_at) != TypeCode::ReferenceId as u8 {
                    return Err(VmError::type_error("ldelem expects an array reference"));
                }
                let id = slot::read_i32(&self.mem, arr_at);
                let (elem, len, payload) = self.array_info(id, "ldelem")?;
                if index < 0 || index >= len {
                    return Err(VmError::reference(format!(
                        "ldelem index {index} out of range (len {len})"
                    )));
                }
                let ecode = TypeCode::decode(elem)
                    .ok_or_else(|| VmError::image(format!("array with unknown element type {elem}")))?;
                let at = payload + ecode.payload_size() * index as usize;
                let dst = self.bump(b, eptr)?;
                if ecode == TypeCode::BoxedObject {
                    // A boxed element is read back at its inner type.
                    self.mem[dst] = self.mem[at];
                    self.mem.copy_within(at + 1..at + 5, dst + 1);
                } else {
                    if elem != declared {
                        return Err(VmError::type_error(format!(
                            "ldelem of type {declared} from an array of type {elem}"
                        )));
                    }
                    self.mem[dst] = elem;
                    self.mem.copy_within(at..at + 4, dst + 1);
                }
            }

            Op::Stelem => {
                let declared = self.fetch_u8(pc)?;
                let val = self.pop(b, eptr)?;
                let idx_at = self.pop(b, eptr)?;
                let index = slot::read_i32(&self.mem, idx_at);
                let arr_at = self.pop(b, eptr)?;
                if slot::tag(&self.mem, arr_at) != TypeCode::ReferenceId as u8 {
                    return Err(VmError::type_error("stelem expects an array reference"));
                }
                let id = slot::read_i32(&self.mem, arr_at);
                let (elem, len, payload) = self.array_info(id, "stelem")?;
                if index < 0 || index >= len {
                    return Err(VmError::reference(format!(
                        "stelem index {index} out of range (len {len})"
                    )));
                }
                let ecode = TypeCode::decode(elem)
                    .ok_or_else(|| VmError::image(format!("array with unknown element type {elem}")))?;
                let at = payload + ecode.payload_size() * index as usize;
                if ecode == TypeCode::BoxedObject {
                    // Boxed elements store the inner type code alongside the
                    // payload.
                    self.mem[at] = self.mem[val];
                    self.copy_val(at, val)?;
                } else {
                    if elem != declared {
                        return Err(VmError::type_error(format!(
                            "stelem of type {declared} into an array of type {elem}"
                        )));
                    }
                    let width = raw_width(elem);
                    self.mem.copy_within(val + 1..val + 1 + width, at);
                }
            }

            Op::Callvirt => {
                let virt_id = self.fetch_u16(pc)?;
                let entry = self.image.virt_entry(&self.mem, virt_id)?;
                let saved = *eptr;
                for _ in 0..entry.param_count {
                    self.pop(b, eptr)?;
                }
                let at = self.pop(b, eptr)?;
                if slot::tag(&self.mem, at) != TypeCode::ReferenceId as u8 {
                    return Err(VmError::type_error("callvirt 'this' must be a reference"));
                }
                let id = slot::read_i32(&self.mem, at);
                if id == 0 {
                    return Err(VmError::reference("callvirt on null reference"));
                }
                let (cls, _) = self.object_info(id, "callvirt")?;
                let method_id = self.image.resolve_virtual(&self.mem, virt_id, cls)?;
                *eptr = saved;
                self.invoke(method_id, -1, Some(&mut *eptr))?;
            }

            Op::LdftnLdtoken => {
                let addr_type = self.fetch_u8(pc)?;
                if addr_type != TypeCode::Address as u8 {
                    return Err(VmError::image("ldftn/ldtoken without an address operand"));
                }
                let sub = self.fetch_u8(pc)?;
                match sub {
                    KIND_CUSTOM | KIND_BUILTIN => {
                        let id = self.fetch_u16(pc)? as i16;
                        let kind = if sub == KIND_CUSTOM {
                            MethodKind::Custom
                        } else {
                            MethodKind::Builtin
                        };
                        let at = self.bump(b, eptr)?;
                        slot::write_method_ref(&mut self.mem, at, MethodRef { kind, id });
                    }
                    KIND_TOKEN => {
                        // Inline metadata blob; push its address and skip it.
                        let len = self.fetch_u16(pc)? as usize;
                        let data = *pc;
                        *pc += len;
                        self.push_address(b, eptr, data, TypeCode::Metadata as u8)?;
                    }
                    other => {
                        return Err(VmError::image(format!(
                            "unknown ldftn/ldtoken sub-code 0x{other:02X}"
                        )));
                    }
                }
            }

            Op::CallvirtInstanced => {
                let sub = self.fetch_u8(pc)?;
                let method_id = self.fetch_u16(pc)?;
                match sub {
                    KIND_CUSTOM => self.invoke(method_id, -1, Some(&mut *eptr))?,
                    KIND_BUILTIN => self.call_builtin(method_id, eptr)?,
                    other => {
                        return Err(VmError::image(format!(
                            "unknown instanced-call kind 0x{other:02X}"
                        )));
                    }
                }
            }
            Op::Call => {
                let method_id = self.fetch_u16(pc)?;
                self.invoke(method_id, -1, Some(&mut *eptr))?;
            }
            Op::CallBuiltin => {
                let method_id = self.fetch_u16(pc)?;
                self.call_builtin(method_id, eptr)?;
            }

            Op::Ceq | Op::Cgt | Op::CgtUn | Op::Clt | Op::CltUn => {
                let v2 = self.pop(b, eptr)?;
                let v1 = self.pop(b, eptr)?;
                let (cmp, unsigned) = match op {
                    Op::Ceq => (CmpOp::Eq, false),
                    Op::Cgt => (CmpOp::Gt, false),
                    Op::CgtUn => (CmpOp::Gt, true),
                    Op::Clt => (CmpOp::Lt, false),
                    _ => (CmpOp::Lt, true),
                };
                // Equality comparisons may see reference ids; unsigned
                // float comparisons are not a thing.
                let result = self.compare(cmp, unsigned, v1, v2, true)?;
                self.push_tagged_i32(b, eptr, TypeCode::Int32, i32::from(result))?;
            }
        }
        Ok(Flow::Continue)
    }

    // =========================================================================
    // Grouped opcode bodies
    // =========================================================================

    /// Opcode 0x16: `ldstr` / `newarr`, split by a header-tag operand.
    fn op_new_heap(&mut self, pc: &mut usize, eptr: &mut usize, b: Bounds) -> Result<()> {
        let tag = self.fetch_u8(pc)?;
        if tag == STRING_HEADER {
            let len = self.fetch_u16(pc)? as usize;
            let bytes = self
                .mem
                .get(*pc..*pc + len)
                .ok_or_else(|| VmError::image("ldstr literal truncated"))?
                .to_vec();
            *pc += len;
            let id = self.alloc_string(&bytes)?;
            self.push_ref(b, eptr, id)?;
        } else if tag == ARRAY_HEADER {
            let elem = self.fetch_u8(pc)?;
            let ecode = TypeCode::decode(elem)
                .ok_or_else(|| VmError::image(format!("newarr of unknown element type {elem}")))?;
            let at = self.pop(b, eptr)?;
            if slot::tag(&self.mem, at) != TypeCode::Int32 as u8 {
                return Err(VmError::type_error("newarr length must be Int32"));
            }
            let len = slot::read_i32(&self.mem, at);
            let id = self.alloc_array(len, ecode)?;
            self.push_ref(b, eptr, id)?;
            if ecode == TypeCode::ReferenceId {
                // A reference array carries an element class id; when it is
                // instantiable, every element is eagerly constructed.
                let aux = self.fetch_i16(pc)?;
                if aux >= 0 {
                    for i in 0..len as usize {
                        let nested = self.alloc_object(aux as u16)?;
                        let payload = self.heap.slot(id)?.offset + 6;
                        let at = payload + 4 * i;
                        self.mem[at..at + 4].copy_from_slice(&nested.to_le_bytes());
                    }
                }
            }
        } else {
            return Err(VmError::image(format!(
                "heap-literal instruction with unknown tag {tag}"
            )));
        }
        Ok(())
    }

    /// Opcode 0x4D: binary arithmetic, sub-op selected by an operand byte.
    fn op_arith(&mut self, pc: &mut usize, eptr: &mut usize, b: Bounds) -> Result<()> {
        let sub = self.fetch_u8(pc)?;
        let v2_at = self.pop(b, eptr)?;
        let v1_at = self.pop(b, eptr)?;
        let f1 = slot::tag(&self.mem, v1_at) == TypeCode::Single as u8;
        let f2 = slot::tag(&self.mem, v2_at) == TypeCode::Single as u8;
        if f1 != f2 {
            return Err(VmError::type_error("mixed integer/float arithmetic"));
        }

        if f1 {
            let a = slot::read_f32(&self.mem, v1_at);
            let c = slot::read_f32(&self.mem, v2_at);
            let r = match sub {
                0x60 => a + c,
                0x61 => a - c,
                0x62 => a * c,
                0x63 => a / c,
                _ => {
                    return Err(VmError::type_error(format!(
                        "arithmetic sub-op 0x{sub:02X} unsupported for Single"
                    )));
                }
            };
            return self.push_f32(b, eptr, r);
        }

        let a = slot::widen_int(&self.mem, v1_at, false)
            .ok_or_else(|| VmError::type_error("arithmetic on a non-numeric operand"))?;
        let c = slot::widen_int(&self.mem, v2_at, false)
            .ok_or_else(|| VmError::type_error("arithmetic on a non-numeric operand"))?;
        let div_guard = |x: i32| {
            if x == 0 {
                Err(VmError::type_error("integer division by zero"))
            } else {
                Ok(x)
            }
        };
        let r = match sub {
            0x60 => a.wrapping_add(c),
            0x61 => a.wrapping_sub(c),
            0x62 => a.wrapping_mul(c),
            0x63 => a.wrapping_div(div_guard(c)?),
            0x64 => ((a as u32) / div_guard(c)? as u32) as i32,
            0x65 => a.wrapping_rem(div_guard(c)?),
            0x66 => ((a as u32) % div_guard(c)? as u32) as i32,
            0x67 => a & c,
            0x68 => a | c,
            0x69 => a ^ c,
            0x6A => a.wrapping_shl(c as u32),
            0x6B => a.wrapping_shr(c as u32),
            0x6C => ((a as u32).wrapping_shr(c as u32)) as i32,
            _ => {
                return Err(VmError::image(format!(
                    "unknown arithmetic sub-op 0x{sub:02X}"
                )));
            }
        };
        self.push_tagged_i32(b, eptr, TypeCode::Int32, r)
    }

    /// Opcodes 0x70..0x77: pop one operand, reinterpret per target type.
    fn op_conv(&mut self, op: Op, eptr: &mut usize, b: Bounds) -> Result<()> {
        let at = self.pop(b, eptr)?;
        let src = slot::type_of(&self.mem, at)
            .ok_or_else(|| VmError::type_error("conversion of an untyped slot"))?;
        let bad = || VmError::type_error(format!("unsupported conversion of {src:?} by {op:?}"));

        let i8v = |m: &Vm| m.mem[at + 1] as i8;
        let u8v = |m: &Vm| m.mem[at + 1];
        let i16v = |m: &Vm| slot::read_i16(&m.mem, at);
        let u16v = |m: &Vm| u16::from_le_bytes([m.mem[at + 1], m.mem[at + 2]]);
        let i32v = |m: &Vm| slot::read_i32(&m.mem, at);
        let f32v = |m: &Vm| slot::read_f32(&m.mem, at);

        match op {
            Op::ConvI1 => {
                let v: i8 = match src {
                    TypeCode::Byte | TypeCode::SByte => i8v(self),
                    TypeCode::Int16 | TypeCode::UInt16 => i16v(self) as i8,
                    TypeCode::Int32 | TypeCode::UInt32 => i32v(self) as i8,
                    TypeCode::Single => f32v(self) as i8,
                    _ => return Err(bad()),
                };
                self.push_tagged_i32(b, eptr, TypeCode::SByte, i32::from(v))
            }
            Op::ConvU1 => {
                let v: u8 = match src {
                    TypeCode::Byte | TypeCode::SByte => u8v(self),
                    TypeCode::Int16 | TypeCode::UInt16 => u16v(self) as u8,
                    TypeCode::Int32 | TypeCode::UInt32 => i32v(self) as u32 as u8,
                    TypeCode::Single => f32v(self) as u8,
                    _ => return Err(bad()),
                };
                self.push_tagged_i32(b, eptr, TypeCode::Byte, i32::from(v))
            }
            Op::ConvI2 => {
                let v: i16 = match src {
                    TypeCode::Byte => i16::from(u8v(self)),
                    TypeCode::SByte => i16::from(i8v(self)),
                    TypeCode::Int16 | TypeCode::UInt16 => i16v(self),
                    TypeCode::Int32 | TypeCode::UInt32 => i32v(self) as i16,
                    TypeCode::Single => f32v(self) as i16,
                    _ => return Err(bad()),
                };
                self.push_tagged_i32(b, eptr, TypeCode::Int16, i32::from(v))
            }
            Op::ConvU2 => {
                let v: u16 = match src {
                    TypeCode::Byte => u16::from(u8v(self)),
                    TypeCode::SByte => i8v(self) as u16,
                    TypeCode::Int16 | TypeCode::UInt16 => u16v(self),
                    TypeCode::Int32 | TypeCode::UInt32 => i32v(self) as u32 as u16,
                    TypeCode::Single => f32v(self) as u16,
                    _ => return Err(bad()),
                };
                self.push_tagged_i32(b, eptr, TypeCode::UInt16, i32::from(v))
            }
            Op::ConvI4 | Op::ConvU4 => {
                let v: i32 = match src {
                    TypeCode::Byte => i32::from(u8v(self)),
                    TypeCode::SByte => i32::from(i8v(self)),
                    TypeCode::Int16 => i32::from(i16v(self)),
                    TypeCode::UInt16 => i32::from(u16v(self)),
                    TypeCode::Int32 | TypeCode::UInt32 => i32v(self),
                    TypeCode::Single => {
                        if op == Op::ConvI4 {
                            f32v(self) as i32
                        } else {
                            f32v(self) as u32 as i32
                        }
                    }
                    _ => return Err(bad()),
                };
                let code = if op == Op::ConvI4 {
                    TypeCode::Int32
                } else {
                    TypeCode::UInt32
                };
                self.push_tagged_i32(b, eptr, code, v)
            }
            Op::ConvR4 => {
                let v: f32 = match src {
                    TypeCode::Byte => f32::from(u8v(self)),
                    TypeCode::SByte => f32::from(i8v(self)),
                    TypeCode::Int16 => f32::from(i16v(self)),
                    TypeCode::UInt16 => f32::from(u16v(self)),
                    TypeCode::Int32 => i32v(self) as f32,
                    TypeCode::UInt32 => i32v(self) as u32 as f32,
                    TypeCode::Single => f32v(self),
                    _ => return Err(bad()),
                };
                self.push_f32(b, eptr, v)
            }
            Op::ConvRUn => {
                let v: f32 = match src {
                    TypeCode::Byte => f32::from(u8v(self)),
                    TypeCode::UInt16 => f32::from(u16v(self)),
                    TypeCode::UInt32 => i32v(self) as u32 as f32,
                    _ => return Err(bad()),
                };
                self.push_f32(b, eptr, v)
            }
            _ => unreachable!("op_conv called for {op:?}"),
        }
    }

    /// Opcodes 0x7B..0x7D: instance, static, and cart-I/O field access.
    fn op_field(&mut self, op: Op, pc: &mut usize, eptr: &mut usize, b: Bounds) -> Result<()> {
        let access = FieldAccess::from_bits_truncate(self.fetch_u8(pc)?);
        let offset = self.fetch_i16(pc)? as u16 as usize;
        let aux = self.fetch_i16(pc)?;

        if access.contains(FieldAccess::CART_IO) {
            // Cart-I/O fields live in the statics region but are addressed
            // through the root object's cart instance; the instance slot is
            // discarded.
            let io_id = aux as u16 as usize;
            let field = self.image.statics_val + offset;
            let val = self.pop(b, eptr)?;
            match op {
                Op::Ldfld => self.push_indirect(b, eptr, field)?,
                Op::Ldflda => self.push_address(b, eptr, field + 1, self.mem[field])?,
                Op::Stfld => {
                    self.pop(b, eptr)?;
                    self.copy_val(field, val)?;
                    self.touched.set(io_id)?;
                }
                _ => unreachable!(),
            }
        } else if access.contains(FieldAccess::STATIC) {
            let field = self.image.statics_val + offset;
            match op {
                Op::Ldfld => self.push_indirect(b, eptr, field)?,
                Op::Ldflda => self.push_address(b, eptr, field + 1, self.mem[field])?,
                Op::Stfld => {
                    let val = self.pop(b, eptr)?;
                    self.copy_val(field, val)?;
                }
                _ => unreachable!(),
            }
        } else {
            let val = if op == Op::Stfld {
                Some(self.pop(b, eptr)?)
            } else {
                None
            };
            let at = self.pop(b, eptr)?;
            let obj = self.field_object(at)?;

            let (cls, payload) = obj;
            if cls != aux as u16 {
                return Err(VmError::image(format!(
                    "field access expects class {aux}, object is class {cls}"
                )));
            }
            let field = payload + offset;
            match op {
                Op::Ldfld => self.push_indirect(b, eptr, field)?,
                Op::Ldflda => self.push_address(b, eptr, field + 1, self.mem[field])?,
                Op::Stfld => self.copy_val(field, val.unwrap())?,
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    /// Resolve the object an instance-field access targets:
    /// `(class_id, payload_offset)`. Accepts a direct reference, an inline
    /// value handle, or an address referencing either.
    fn field_object(&self, at: usize) -> Result<(u16, usize)> {
        let deref_inline = |off: usize| -> Result<(u16, usize)> {
            let cls = u16::from_le_bytes([self.mem[off + 1], self.mem[off + 2]]);
            Ok((cls, off + 3))
        };
        match slot::type_of(&self.mem, at) {
            Some(TypeCode::ReferenceId) => {
                let id = slot::read_i32(&self.mem, at);
                self.object_info(id, "field access")
            }
            Some(TypeCode::JumpAddress) => {
                deref_inline(slot::read_i32(&self.mem, at) as usize)
            }
            Some(TypeCode::Address) => {
                let (off, rt) = slot::read_address(&self.mem, at);
                match TypeCode::decode(rt) {
                    Some(TypeCode::ReferenceId) => {
                        let id = i32::from_le_bytes(
                            self.mem[off as usize..off as usize + 4].try_into().unwrap(),
                        );
                        self.object_info(id, "field access")
                    }
                    Some(TypeCode::JumpAddress) => {
                        let inline = i32::from_le_bytes(
                            self.mem[off as usize..off as usize + 4].try_into().unwrap(),
                        );
                        deref_inline(inline as usize)
                    }
                    _ => Err(VmError::type_error(
                        "field access through an address of a non-object",
                    )),
                }
            }
            _ => Err(VmError::type_error("field access requires an object value")),
        }
    }

    /// Same-domain comparison of two evaluation slots.
    fn compare(
        &self,
        cmp: CmpOp,
        unsigned: bool,
        v1_at: usize,
        v2_at: usize,
        strict_float_set: bool,
    ) -> Result<bool> {
        let f1 = slot::tag(&self.mem, v1_at) == TypeCode::Single as u8;
        let f2 = slot::tag(&self.mem, v2_at) == TypeCode::Single as u8;
        if f1 != f2 {
            return Err(VmError::type_error("comparison operands of mixed domains"));
        }
        if f1 {
            if strict_float_set && unsigned {
                return Err(VmError::type_error(
                    "unsigned ordering comparison unsupported for Single",
                ));
            }
            let a = slot::read_f32(&self.mem, v1_at);
            let c = slot::read_f32(&self.mem, v2_at);
            return Ok(match cmp {
                CmpOp::Eq => a == c,
                CmpOp::Ne => a != c,
                CmpOp::Ge => a >= c,
                CmpOp::Gt => a > c,
                CmpOp::Le => a <= c,
                CmpOp::Lt => a < c,
            });
        }
        let a = slot::widen_int(&self.mem, v1_at, true)
            .ok_or_else(|| VmError::type_error("comparison of a non-numeric operand"))?;
        let c = slot::widen_int(&self.mem, v2_at, true)
            .ok_or_else(|| VmError::type_error("comparison of a non-numeric operand"))?;
        Ok(if unsigned {
            let (a, c) = (a as u32, c as u32);
            match cmp {
                CmpOp::Eq => a == c,
                CmpOp::Ne => a != c,
                CmpOp::Ge => a >= c,
                CmpOp::Gt => a > c,
                CmpOp::Le => a <= c,
                CmpOp::Lt => a < c,
            }
        } else {
            match cmp {
                CmpOp::Eq => a == c,
                CmpOp::Ne => a != c,
                CmpOp::Ge => a >= c,
                CmpOp::Gt => a > c,
                CmpOp::Le => a <= c,
                CmpOp::Lt => a < c,
            }
        })
    }
}

/// Raw copy width of typed stores that bypass promotion (`stind`, `stelem`).
fn raw_width(type_code: u8) -> usize {
    match type_code {
        0..=2 => 1,
        3..=5 => 2,
        _ => 4,
    }
}

fn branch_cmp(op: Op) -> (CmpOp, bool) {
    match op {
        Op::BeqS | Op::Beq => (CmpOp::Eq, false),
        Op::BgeS | Op::Bge => (CmpOp::Ge, false),
        Op::BgtS | Op::Bgt => (CmpOp::Gt, false),
        Op::BleS | Op::Ble => (CmpOp::Le, false),
        Op::BltS | Op::Blt => (CmpOp::Lt, false),
        Op::BneUnS | Op::BneUn => (CmpOp::Ne, true),
        Op::BgeUnS | Op::BgeUn => (CmpOp::Ge, true),
        Op::BgtUnS | Op::BgtUn => (CmpOp::Gt, true),
        Op::BleUnS | Op::BleUn => (CmpOp::Le, true),
        Op::BltUnS | Op::BltUn => (CmpOp::Lt, true),
        _ => unreachable!("not a binary branch: {op:?}"),
    }
}
