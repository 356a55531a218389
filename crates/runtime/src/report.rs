//! Machine-state report.
//!
//! A serializable snapshot of the interesting KPIs after an iteration:
//! heap occupancy, touched cart-I/O ids, and a hex dump of the last
//! lower-memory blob. Meant for host-side diagnostics and test assertions,
//! not for the wire.

use serde::Serialize;

use crate::vm::Vm;

#[derive(Debug, Serialize)]
pub struct VmReport {
    pub iteration: i32,
    pub live_objects: usize,
    pub heap_bytes: usize,
    pub heap_tail: usize,
    pub statics_count: usize,
    pub cart_io_count: usize,
    pub touched_cart_io: Vec<u16>,
    pub lower_memory_hex: String,
}

impl VmReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

impl Vm {
    /// Snapshot the machine state for diagnostics.
    pub fn report(&self) -> VmReport {
        let tail = self.heap.tail();
        let base = self.image.stack0;
        VmReport {
            iteration: self.iterations,
            live_objects: self.heap.live_count(),
            heap_bytes: self.mem.len().saturating_sub(tail),
            heap_tail: tail,
            statics_count: self.image.statics_count,
            cart_io_count: self.image.cart_io_count,
            touched_cart_io: (0..self.image.cart_io_count)
                .filter(|&i| self.touched.get(i))
                .map(|i| i as u16)
                .collect(),
            lower_memory_hex: hex::encode(&self.mem[base..base + self.lower_len]),
        }
    }
}
