//! Mark-compact collector.
//!
//! Runs once per iteration, immediately after the entry method returns.
//! Reachability is marked from the root object (id 1) and every
//! `ReferenceId` static; survivors are renumbered densely in old-id order,
//! every stored reference is rewritten, and the objects are packed toward
//! the heap tail. Ids stay small and dense, so the side table is the only
//! thing the move rewrites.

use relay_core::slot;
use relay_core::value::{
    ARRAY_HEADER, DELEGATE_FIELD_TYPES, OBJECT_HEADER, STRING_HEADER, TypeCode, is_delegate_class,
};
use tracing::debug;

use crate::error::{Result, VmError};
use crate::heap::HeapSlot;
use crate::vm::Vm;

const UNVISITED: i32 = -1;
const VISITED: i32 = -2;

impl Vm {
    /// One full mark / renumber / rewrite / compact cycle.
    pub(crate) fn collect(&mut self) -> Result<()> {
        let before = self.heap.live_count();

        for i in 1..self.heap.next_id {
            self.heap.slot_mut(i).scratch = UNVISITED;
        }

        // The root is always reachable; statics contribute the rest.
        self.mark_object(1)?;
        let mut at = self.image.statics_val;
        for _ in 0..self.image.statics_count {
            let code = slot::type_of(&self.mem, at)
                .ok_or_else(|| VmError::lifecycle("static slot with unknown type at reclaim"))?;
            if code == TypeCode::ReferenceId {
                self.mark_object(slot::read_i32(&self.mem, at))?;
            }
            at += code.slot_size();
        }

        // Dense renumbering in old-id order keeps relative object order.
        let mut next = 1;
        for i in 1..self.heap.next_id {
            if self.heap.slot(i)?.scratch == VISITED {
                self.heap.slot_mut(i).scratch = next;
                next += 1;
            }
        }

        self.rewrite_static_refs()?;
        for i in 1..self.heap.next_id {
            if self.heap.slot(i)?.scratch != UNVISITED {
                self.rewrite_object_refs(i)?;
            }
        }

        self.check_headers("before compaction")?;
        self.compact()?;
        self.check_headers("after compaction")?;

        debug!(live_before = before, live_after = self.heap.live_count(), "gc");
        Ok(())
    }

    /// Depth-first mark. Strings contribute no outgoing references;
    /// delegate-class objects use the hard-coded two-field layout.
    fn mark_object(&mut self, id: i32) -> Result<()> {
        if id < 0 || id >= self.heap.next_id {
            return Err(VmError::reference(format!(
                "collector met reference id {id} out of range"
            )));
        }
        if id == 0 || self.heap.slot(id)?.scratch != UNVISITED {
            return Ok(());
        }
        self.heap.slot_mut(id).scratch = VISITED;

        let s = self.heap.slot(id)?;
        match self.mem[s.offset] {
            ARRAY_HEADER => {
                let (elem, len, payload) = self.array_info(id, "mark")?;
                if elem == TypeCode::ReferenceId as u8 {
                    for i in 0..len as usize {
                        let r = i32::from_le_bytes(
                            self.mem[payload + 4 * i..payload + 4 * i + 4].try_into().unwrap(),
                        );
                        if r != 0 {
                            self.mark_object(r)?;
                        }
                    }
                }
            }
            OBJECT_HEADER => {
                let (cls, payload) = self.object_info(id, "mark")?;
                if is_delegate_class(cls) {
                    let mut at = payload;
                    for t in DELEGATE_FIELD_TYPES {
                        if self.mem[at] != t as u8 {
                            return Err(VmError::lifecycle(format!(
                                "delegate object {id} has corrupt field layout"
                            )));
                        }
                        if t == TypeCode::ReferenceId {
                            let r = slot::read_i32(&self.mem, at);
                            if r != 0 {
                                self.mark_object(r)?;
                            }
                        }
                        at += t.slot_size();
                    }
                } else {
                    let class = self.image.class_layout(&self.mem, cls)?;
                    for i in 0..class.field_count as usize {
                        let field = self.image.field_desc(&self.mem, &class, i)?;
                        if field.type_code == TypeCode::ReferenceId as u8 {
                            let r = slot::read_i32(&self.mem, payload + field.offset as usize);
                            if r != 0 {
                                self.mark_object(r)?;
                            }
                        }
                    }
                }
            }
            STRING_HEADER => {}
            other => {
                return Err(VmError::lifecycle(format!(
                    "object {id} has bad heap header {other} at reclaim"
                )));
            }
        }
        Ok(())
    }

    fn renumbered(&self, old: i32) -> Result<i32> {
        if old >= self.heap.next_id {
            return Err(VmError::lifecycle(format!(
                "collector met stale reference id {old}"
            )));
        }
        Ok(self.heap.slot(old)?.scratch)
    }

    fn rewrite_static_refs(&mut self) -> Result<()> {
        let mut at = self.image.statics_val;
        for _ in 0..self.image.statics_count {
            let code = slot::type_of(&self.mem, at)
                .ok_or_else(|| VmError::lifecycle("static slot with unknown type at reclaim"))?;
            if code == TypeCode::ReferenceId {
                let old = slot::read_i32(&self.mem, at);
                if old > 0 {
                    let new = self.renumbered(old)?;
                    slot::write_i32(&mut self.mem, at, new);
                }
            }
            at += code.slot_size();
        }
        Ok(())
    }

    fn rewrite_object_refs(&mut self, id: i32) -> Result<()> {
        let s = self.heap.slot(id)?;
        match self.mem[s.offset] {
            ARRAY_HEADER => {
                let (elem, len, payload) = self.array_info(id, "rewrite")?;
                if elem == TypeCode::ReferenceId as u8 {
                    for i in 0..len as usize {
                        let at = payload + 4 * i;
                        let old =
                            i32::from_le_bytes(self.mem[at..at + 4].try_into().unwrap());
                        if old > 0 {
                            let new = self.renumbered(old)?;
                            self.mem[at..at + 4].copy_from_slice(&new.to_le_bytes());
                        }
                    }
                }
            }
            OBJECT_HEADER => {
                let (cls, payload) = self.object_info(id, "rewrite")?;
                if is_delegate_class(cls) {
                    let mut at = payload;
                    for t in DELEGATE_FIELD_TYPES {
                        if t == TypeCode::ReferenceId {
                            let old = slot::read_i32(&self.mem, at);
                            if old > 0 {
                                let new = self.renumbered(old)?;
                                slot::write_i32(&mut self.mem, at, new);
                            }
                        }
                        at += t.slot_size();
                    }
                } else {
                    let class = self.image.class_layout(&self.mem, cls)?;
                    for i in 0..class.field_count as usize {
                        let field = self.image.field_desc(&self.mem, &class, i)?;
                        if field.type_code == TypeCode::ReferenceId as u8 {
                            let at = payload + field.offset as usize;
                            let old = slot::read_i32(&self.mem, at);
                            if old > 0 {
                                let new = self.renumbered(old)?;
                                slot::write_i32(&mut self.mem, at, new);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Slide survivors toward the tail, highest address (lowest id) first.
    /// The destination of a move always sits at or below the source, so an
    /// overlapping move copies trailing-to-leading (`copy_within` is a
    /// memmove).
    fn compact(&mut self) -> Result<()> {
        let mut tail = self.heap.slot(1)?.offset;
        let mut last = 1;
        for i in 2..self.heap.next_id {
            let nid = self.heap.slot(i)?.scratch;
            if nid == UNVISITED {
                continue;
            }
            let HeapSlot { offset, len, .. } = self.heap.slot(i)?;
            if nid != i {
                let new_offset = tail - len;
                self.mem.copy_within(offset..offset + len, new_offset);
                *self.heap.slot_mut(nid) = HeapSlot {
                    offset: new_offset,
                    len,
                    scratch: 0,
                };
                tail = new_offset;
            } else {
                self.heap.slot_mut(i).scratch = 0;
                tail = offset;
            }
            last = nid;
        }
        self.heap.slot_mut(1).scratch = 0;
        self.heap.next_id = last + 1;
        Ok(())
    }

    fn check_headers(&self, when: &str) -> Result<()> {
        for i in 1..self.heap.next_id {
            let s = self.heap.slot(i)?;
            let h = self.mem[s.offset];
            if h != ARRAY_HEADER && h != STRING_HEADER && h != OBJECT_HEADER {
                return Err(VmError::lifecycle(format!(
                    "object {i} has bad heap header {h} {when}"
                )));
            }
        }
        Ok(())
    }
}
