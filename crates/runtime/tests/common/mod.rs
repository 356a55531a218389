//! Programmatic program-image assembly for integration tests.
//!
//! Builds bit-exact little-endian images: meta header, program descriptor
//! (cart-I/O offsets + class layouts), code chunk (method index + bodies),
//! virtual dispatch tables, and the statics descriptor. The `Asm` helper
//! assembles method bodies with label-patched branch offsets.

// Each integration test binary gets its own copy; not all of them use
// every assembler mnemonic.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use relay_runtime::{Host, MockHost, TypeCode, Vm};

pub const T_BOOL: u8 = TypeCode::Boolean as u8;
pub const T_I32: u8 = TypeCode::Int32 as u8;
pub const T_F32: u8 = TypeCode::Single as u8;
pub const T_REF: u8 = TypeCode::ReferenceId as u8;
pub const T_JMP: u8 = TypeCode::JumpAddress as u8;

/// One class: payload size plus `(type, offset, aux)` field records.
pub struct ClassDef {
    pub total_size: u16,
    pub fields: Vec<(u8, u16, i16)>,
}

/// One method body with its signature metadata.
pub struct MethodDef {
    pub ret: (u8, i16),
    pub args: Vec<(u8, i16)>,
    pub vars: Vec<(u8, i16)>,
    /// Byte bound of the evaluation region (a multiple of the 8-byte
    /// stride).
    pub max_stack: i32,
    pub code: Vec<u8>,
}

impl MethodDef {
    pub fn new(args: Vec<(u8, i16)>, vars: Vec<(u8, i16)>, code: Vec<u8>) -> Self {
        MethodDef {
            ret: (0, -1),
            args,
            vars,
            max_stack: 16 * 8,
            code,
        }
    }
}

/// The canonical entry signature: `(this, Int32 iteration)`.
pub fn entry_args() -> Vec<(u8, i16)> {
    vec![(T_REF, -1), (T_I32, -1)]
}

#[derive(Default)]
pub struct ImageBuilder {
    pub interval_us: i32,
    pub entry_method: i32,
    pub root_class: u16,
    /// Byte offsets of cart-I/O slots within the statics value region.
    pub cart_io: Vec<i32>,
    pub classes: Vec<ClassDef>,
    pub methods: Vec<MethodDef>,
    /// `(param_count, [(class_id, method_id)])` per virtual method.
    pub virts: Vec<(u8, Vec<(u16, u16)>)>,
    /// `(type_code, aux_class_id)` per static slot.
    pub statics: Vec<(u8, i16)>,
}

impl ImageBuilder {
    pub fn build(&self) -> Vec<u8> {
        // Program descriptor.
        let mut desc = Vec::new();
        put_u16(&mut desc, self.cart_io.len() as u16);
        for &off in &self.cart_io {
            desc.extend_from_slice(&off.to_le_bytes());
        }
        put_u16(&mut desc, self.classes.len() as u16);
        let mut fields = Vec::new();
        for c in &self.classes {
            put_u16(&mut desc, c.total_size);
            desc.push(c.fields.len() as u8);
            desc.extend_from_slice(&(fields.len() as i32).to_le_bytes());
            for &(t, off, aux) in &c.fields {
                fields.push(t);
                fields.extend_from_slice(&off.to_le_bytes());
                fields.extend_from_slice(&aux.to_le_bytes());
            }
        }
        desc.extend_from_slice(&fields);

        // Code chunk: index table, then concatenated meta+code bodies.
        let mut index = Vec::new();
        let mut bodies = Vec::new();
        for m in &self.methods {
            index.extend_from_slice(&(bodies.len() as i32).to_le_bytes());
            let meta_len = 1 + 2 + 2 + 3 * m.args.len() + 2 + 3 * m.vars.len() + 4;
            index.extend_from_slice(&((bodies.len() + meta_len) as i32).to_le_bytes());
            bodies.push(m.ret.0);
            bodies.extend_from_slice(&m.ret.1.to_le_bytes());
            put_u16(&mut bodies, m.args.len() as u16);
            for &(t, aux) in &m.args {
                bodies.push(t);
                bodies.extend_from_slice(&aux.to_le_bytes());
            }
            put_u16(&mut bodies, m.vars.len() as u16);
            for &(t, aux) in &m.vars {
                bodies.push(t);
                bodies.extend_from_slice(&aux.to_le_bytes());
            }
            bodies.extend_from_slice(&m.max_stack.to_le_bytes());
            bodies.extend_from_slice(&m.code);
        }
        let mut code = Vec::new();
        put_u16(&mut code, self.methods.len() as u16);
        code.extend_from_slice(&index);
        code.extend_from_slice(&bodies);

        // Virt chunk: per-method offsets into the entry blob.
        let mut ventries = Vec::new();
        let mut voffsets = Vec::new();
        for (params, impls) in &self.virts {
            put_u16(&mut voffsets, ventries.len() as u16);
            ventries.push(impls.len() as u8);
            ventries.push(*params);
            for &(cls, mid) in impls {
                put_u16(&mut ventries, cls);
                put_u16(&mut ventries, mid);
            }
        }
        let mut virt = Vec::new();
        put_u16(&mut virt, self.virts.len() as u16);
        virt.extend_from_slice(&voffsets);
        virt.extend_from_slice(&ventries);

        // Statics descriptor.
        let mut statics = Vec::new();
        put_u16(&mut statics, self.statics.len() as u16);
        for &(t, aux) in &self.statics {
            statics.push(t);
            statics.extend_from_slice(&aux.to_le_bytes());
        }

        let mut image = Vec::new();
        image.extend_from_slice(&self.interval_us.to_le_bytes());
        image.extend_from_slice(&self.entry_method.to_le_bytes());
        image.extend_from_slice(&(desc.len() as i32).to_le_bytes());
        image.extend_from_slice(&(code.len() as i32).to_le_bytes());
        image.extend_from_slice(&(virt.len() as i32).to_le_bytes());
        image.extend_from_slice(&(statics.len() as i32).to_le_bytes());
        image.extend_from_slice(&i32::from(self.root_class).to_le_bytes());
        image.extend_from_slice(&desc);
        image.extend_from_slice(&code);
        image.extend_from_slice(&virt);
        image.extend_from_slice(&statics);
        image
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

// =============================================================================
// Method body assembler
// =============================================================================

#[derive(Default)]
pub struct Asm {
    bytes: Vec<u8>,
    labels: HashMap<&'static str, usize>,
    fixups: Vec<(usize, &'static str)>,
}

impl Asm {
    pub fn new() -> Self {
        Asm::default()
    }

    /// Resolve branch fixups (targets are absolute method offsets) and
    /// return the body.
    pub fn finish(mut self) -> Vec<u8> {
        for (at, name) in &self.fixups {
            let target = *self.labels.get(name).unwrap_or_else(|| {
                panic!("undefined label {name}");
            }) as i16;
            self.bytes[*at..*at + 2].copy_from_slice(&target.to_le_bytes());
        }
        self.bytes
    }

    pub fn label(&mut self, name: &'static str) -> &mut Self {
        self.labels.insert(name, self.bytes.len());
        self
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i16(&mut self, v: i16) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn jump(&mut self, op: u8, to: &'static str) -> &mut Self {
        self.u8(op);
        self.fixups.push((self.bytes.len(), to));
        self.i16(0)
    }

    pub fn ldarg(&mut self, off: u16) -> &mut Self {
        self.u8(0x02).u16(off)
    }

    pub fn ldarga(&mut self, off: u16) -> &mut Self {
        self.u8(0x03).u16(off)
    }

    pub fn starg(&mut self, off: u16) -> &mut Self {
        self.u8(0x04).u16(off)
    }

    pub fn ldloc(&mut self, off: u16) -> &mut Self {
        self.u8(0x06).u16(off)
    }

    pub fn stloc(&mut self, t: u8, off: u16) -> &mut Self {
        self.u8(0x0A).u8(t).u16(off)
    }

    pub fn ldloca(&mut self, off: u16) -> &mut Self {
        self.u8(0x0B).u16(off)
    }

    pub fn ldc_i4(&mut self, v: i32) -> &mut Self {
        self.u8(0x15).u8(T_I32).i32(v)
    }

    pub fn ldc_r4(&mut self, v: f32) -> &mut Self {
        self.u8(0x15).u8(T_F32).i32(v.to_bits() as i32)
    }

    pub fn ldnull(&mut self) -> &mut Self {
        self.u8(0x15).u8(T_REF)
    }

    pub fn ldstr(&mut self, s: &str) -> &mut Self {
        self.u8(0x16).u8(12).u16(s.len() as u16);
        self.bytes.extend_from_slice(s.as_bytes());
        self
    }

    /// `newarr`; reference-element arrays carry an element class id.
    pub fn newarr(&mut self, elem: u8, aux: Option<i16>) -> &mut Self {
        self.u8(0x16).u8(11).u8(elem);
        if elem == T_REF {
            self.i16(aux.unwrap_or(-1));
        }
        self
    }

    pub fn dup(&mut self) -> &mut Self {
        self.u8(0x23)
    }

    pub fn pop(&mut self) -> &mut Self {
        self.u8(0x24)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.u8(0x26)
    }

    pub fn br(&mut self, to: &'static str) -> &mut Self {
        self.jump(0x34, to)
    }

    pub fn brtrue(&mut self, to: &'static str) -> &mut Self {
        self.jump(0x36, to)
    }

    pub fn brfalse(&mut self, to: &'static str) -> &mut Self {
        self.jump(0x35, to)
    }

    pub fn bge(&mut self, to: &'static str) -> &mut Self {
        self.jump(0x38, to)
    }

    pub fn blt(&mut self, to: &'static str) -> &mut Self {
        self.jump(0x3B, to)
    }

    pub fn beq(&mut self, to: &'static str) -> &mut Self {
        self.jump(0x37, to)
    }

    pub fn switch(&mut self, targets: &[&'static str]) -> &mut Self {
        self.u8(0x50).u16(targets.len() as u16);
        for t in targets {
            self.fixups.push((self.bytes.len(), *t));
            self.i16(0);
        }
        self
    }

    pub fn add(&mut self) -> &mut Self {
        self.u8(0x4D).u8(0x60)
    }

    pub fn sub(&mut self) -> &mut Self {
        self.u8(0x4D).u8(0x61)
    }

    pub fn mul(&mut self) -> &mut Self {
        self.u8(0x4D).u8(0x62)
    }

    pub fn div(&mut self) -> &mut Self {
        self.u8(0x4D).u8(0x63)
    }

    pub fn rem(&mut self) -> &mut Self {
        self.u8(0x4D).u8(0x65)
    }

    pub fn neg(&mut self) -> &mut Self {
        self.u8(0x6D)
    }

    pub fn conv(&mut self, op: u8) -> &mut Self {
        self.u8(op)
    }

    pub fn ceq(&mut self) -> &mut Self {
        self.u8(0xE2)
    }

    pub fn clt(&mut self) -> &mut Self {
        self.u8(0xE5)
    }

    pub fn ldind(&mut self, t: u8) -> &mut Self {
        self.u8(0x41).u8(t)
    }

    pub fn stind(&mut self, t: u8) -> &mut Self {
        self.u8(0x4C).u8(t)
    }

    pub fn newobj(&mut self, cls: u16, kind: u8, method: u16) -> &mut Self {
        self.u8(0x7A).u16(cls).u8(kind).u16(method)
    }

    fn field(&mut self, op: u8, flags: u8, off: i16, aux: i16) -> &mut Self {
        self.u8(op).u8(flags).i16(off).i16(aux)
    }

    pub fn ldfld(&mut self, off: i16, cls: i16) -> &mut Self {
        self.field(0x7B, 0, off, cls)
    }

    pub fn stfld(&mut self, off: i16, cls: i16) -> &mut Self {
        self.field(0x7D, 0, off, cls)
    }

    pub fn ldsfld(&mut self, off: i16) -> &mut Self {
        self.field(0x7B, 1, off, -1)
    }

    pub fn stsfld(&mut self, off: i16) -> &mut Self {
        self.field(0x7D, 1, off, -1)
    }

    pub fn ldsflda(&mut self, off: i16) -> &mut Self {
        self.field(0x7C, 1, off, -1)
    }

    /// Cart-I/O access: `aux` is the cart id, `off` the slot offset.
    pub fn cart_ldfld(&mut self, off: i16, io_id: i16) -> &mut Self {
        self.field(0x7B, 2, off, io_id)
    }

    pub fn cart_stfld(&mut self, off: i16, io_id: i16) -> &mut Self {
        self.field(0x7D, 2, off, io_id)
    }

    pub fn ldlen(&mut self) -> &mut Self {
        self.u8(0x8E)
    }

    pub fn ldelema(&mut self) -> &mut Self {
        self.u8(0x8F)
    }

    pub fn ldelem(&mut self, t: u8) -> &mut Self {
        self.u8(0x90).u8(t)
    }

    pub fn stelem(&mut self, t: u8) -> &mut Self {
        self.u8(0x91).u8(t)
    }

    pub fn call(&mut self, method: u16) -> &mut Self {
        self.u8(0xA6).u16(method)
    }

    pub fn call_builtin(&mut self, method: u16) -> &mut Self {
        self.u8(0xA7).u16(method)
    }

    pub fn callvirt(&mut self, virt: u16) -> &mut Self {
        self.u8(0xA0).u16(virt)
    }

    pub fn ldftn_custom(&mut self, method: u16) -> &mut Self {
        self.u8(0xA1).u8(15).u8(0xA6).u16(method)
    }

    pub fn ldtoken(&mut self, data: &[u8]) -> &mut Self {
        self.u8(0xA1).u8(15).u8(0x11).u16(data.len() as u16);
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn initobj(&mut self) -> &mut Self {
        self.u8(0x79)
    }
}

// =============================================================================
// Shared recording host
// =============================================================================

/// A `Host` handing everything to a shared `MockHost`, so tests keep a
/// handle after the machine takes ownership.
#[derive(Clone, Default)]
pub struct SharedHost(pub Arc<Mutex<MockHost>>);

impl SharedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mock(&self) -> std::sync::MutexGuard<'_, MockHost> {
        self.0.lock().unwrap()
    }
}

impl Host for SharedHost {
    fn write_snapshot(&mut self, bytes: &[u8]) {
        self.mock().write_snapshot(bytes);
    }

    fn write_stream(&mut self, port: i32, bytes: &[u8]) {
        self.mock().write_stream(port, bytes);
    }

    fn write_event(&mut self, port: i32, event: i32, bytes: &[u8]) {
        self.mock().write_event(port, event, bytes);
    }

    fn report_error(&mut self, il_offset: i32, message: &str) {
        self.mock().report_error(il_offset, message);
    }

    fn print_line(&mut self, line: &str) {
        self.mock().print_line(line);
    }

    fn cyclic_millis(&mut self) -> i32 {
        self.mock().millis
    }

    fn cyclic_micros(&mut self) -> i32 {
        self.mock().micros
    }

    fn cyclic_seconds(&mut self) -> i32 {
        self.mock().seconds
    }
}

pub const MEMORY_SIZE: usize = 64 * 1024;

/// Opt-in interpreter tracing for test debugging (`RUST_LOG=trace`).
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Load `builder` into a fresh machine over a shared recording host.
pub fn load(builder: &ImageBuilder) -> (Vm, SharedHost) {
    init_tracing();
    let host = SharedHost::new();
    let mut vm = Vm::new(Box::new(host.clone()));
    vm.set_program(&builder.build(), MEMORY_SIZE)
        .expect("image loads");
    (vm, host)
}

/// Run one iteration with a throwaway snapshot.
pub fn run_with_snapshot(vm: &mut Vm, iteration: i32) {
    vm.put_snapshot_buffer(&[0u8; 8]).expect("snapshot fits");
    vm.run(iteration).expect("iteration runs");
}
