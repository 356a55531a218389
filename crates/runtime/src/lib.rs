//! Relay Runtime: a cyclic managed-bytecode machine.
//!
//! The machine interprets a compact CIL-style binary image against an
//! in-VM heap with mark-compact reclamation, dispatches into a fixed table
//! of native built-in methods, and runs a cyclic execution model: the entry
//! method is invoked once per iteration, framed by a snapshot ingest and a
//! dirty-output (lower-memory) upload exchanged with the host.
//!
//! # Modules
//!
//! - `vm`: the runtime instance — `set_program`, `run`, the producer and
//!   host-exchange surface.
//! - `image`: program image layout and in-place descriptor access.
//! - `heap` / `gc`: the managed heap, `copy_val`, and the collector.
//! - `frame` / `interp`: call frames and the opcode dispatch loop.
//! - `builtins`: the fixed native-method table and its typed helpers.
//! - `io`: snapshot/stream/event double buffering and the cart-I/O
//!   exchange.
//! - `strfmt`: `String.Format` brace substitution and float rendering.
//! - `host`: the trait the embedding environment implements.
//! - `error`: the fatal fault model.
//! - `report`: a serializable diagnostics snapshot.

pub mod builtins;
pub mod error;
pub mod frame;
pub mod heap;
pub mod host;
pub mod image;
pub mod io;
pub mod report;
pub mod strfmt;
pub mod vm;

mod gc;
mod interp;

pub use builtins::{BUILTIN_CAPACITY, BuiltinFn, BuiltinTable, FIRST_EXTENSION_INDEX};
pub use error::{FaultKind, Result, VmError};
pub use host::{Host, MockHost, NullHost};
pub use io::{BUF_SZ, EVENT_KIND, IoHandle, MAX_CART_IO, SLOT_NUMBER, SNAPSHOT_KIND, STREAM_KIND};
pub use report::VmReport;
pub use vm::Vm;

// The shared value foundation is re-exported for embedders and tests.
pub use relay_core::{MethodKind, MethodRef, TypeCode};
