// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Looking records up, iterating over them, and keeping track of which ones
//! are open.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::error::Error;
use crate::low_level::{self, Flash, Geometry, PageTag, RecordHeader, RecordSlot, RecordState, Slot};
use crate::reserve::{PageBook, Role};

/// Position of a record in flash as of some layout generation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Hint {
    pub page: u32,
    pub offset: u32,
    pub generation: u32,
}

/// Handle on a record.
///
/// The record id is what identifies the record; the descriptor also caches
/// where the record was last seen, which is trusted only if GC hasn't moved
/// anything since. The default descriptor is null and refers to nothing.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordDesc {
    pub(crate) record_id: u32,
    pub(crate) hint: Option<Hint>,
}

impl RecordDesc {
    pub(crate) fn new(record_id: u32) -> Self {
        Self { record_id, hint: None }
    }

    pub fn record_id(&self) -> u32 {
        self.record_id
    }

    pub fn is_null(&self) -> bool {
        self.record_id == 0
    }
}

/// Iteration state for `Store::find`.
///
/// A fresh token starts at the first record. If GC moves records between two
/// calls, the token starts over, which may return records seen already.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FindToken {
    pos: Option<Hint>,
}

impl FindToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.pos = None;
    }
}

/// Which records `find` returns. `None` matches anything.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Filter {
    pub file_id: Option<u16>,
    pub record_key: Option<u16>,
}

impl Filter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn record(file_id: u16, record_key: u16) -> Self {
        Self {
            file_id: Some(file_id),
            record_key: Some(record_key),
        }
    }

    pub fn file(file_id: u16) -> Self {
        Self {
            file_id: Some(file_id),
            record_key: None,
        }
    }

    pub fn key(record_key: u16) -> Self {
        Self {
            file_id: None,
            record_key: Some(record_key),
        }
    }

    pub fn matches(&self, header: &RecordHeader) -> bool {
        self.file_id.map_or(true, |f| f == header.file_id.get())
            && self.record_key.map_or(true, |k| k == header.record_key.get())
    }
}

/// Header fields of a record, decoded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RecordInfo {
    pub file_id: u16,
    pub record_key: u16,
    pub record_id: u32,
    pub length_words: u16,
}

impl From<&RecordHeader> for RecordInfo {
    fn from(h: &RecordHeader) -> Self {
        Self {
            file_id: h.file_id.get(),
            record_key: h.record_key.get(),
            record_id: h.record_id.get(),
            length_words: h.length_words.get(),
        }
    }
}

/// A record found in a readable page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Location {
    pub page: u32,
    pub slot: RecordSlot,
}

impl Location {
    pub fn state(&self) -> RecordState {
        self.slot.header.state()
    }

    pub fn desc(&self, generation: u32) -> RecordDesc {
        RecordDesc {
            record_id: self.slot.header.record_id.get(),
            hint: Some(Hint {
                page: self.page,
                offset: self.slot.offset,
                generation,
            }),
        }
    }
}

/// Read-only view of the store's pages, for lookups.
pub(crate) struct View<'a, F: Flash> {
    pub flash: &'a F,
    pub geo: &'a Geometry,
    pub book: &'a PageBook,
    pub generation: u32,
}

impl<F: Flash> View<'_, F> {
    fn readable(&self, page: u32) -> bool {
        page < self.geo.virtual_pages() && self.book.page(page).role == Role::Data
    }

    fn slot_at(&self, page: u32, offset: u32) -> Result<Option<RecordSlot>, Error> {
        match low_level::next_record(self.flash, self.geo, page, offset)? {
            Slot::Record(slot) => Ok(Some(slot)),
            Slot::End | Slot::Torn => Ok(None),
        }
    }

    /// Finds the record `desc` refers to, valid or dirty.
    ///
    /// Pending records are never returned: they were not finished, and the
    /// id in their header may since have been handed out again.
    pub fn locate(&self, desc: &RecordDesc) -> Result<Option<Location>, Error> {
        if desc.is_null() {
            return Err(Error::NullArg);
        }
        let wanted = |slot: &RecordSlot| {
            slot.header.record_id.get() == desc.record_id
                && slot.header.state() != RecordState::Pending
        };

        if let Some(hint) = desc.hint {
            if hint.generation == self.generation && self.readable(hint.page) {
                if let Some(slot) = self.slot_at(hint.page, hint.offset)? {
                    if wanted(&slot) {
                        return Ok(Some(Location { page: hint.page, slot }));
                    }
                }
            }
        }

        self.scan(wanted)
    }

    /// Walks every readable page in order, returning the first record for
    /// which `pred` holds.
    pub fn scan(
        &self,
        mut pred: impl FnMut(&RecordSlot) -> bool,
    ) -> Result<Option<Location>, Error> {
        for page in 0..self.geo.virtual_pages() {
            if !self.readable(page) {
                continue;
            }
            let mut offset = PageTag::WORDS;
            while let Some(slot) = self.slot_at(page, offset)? {
                if pred(&slot) {
                    return Ok(Some(Location { page, slot }));
                }
                offset = slot.next;
            }
        }
        Ok(None)
    }

    /// Returns the next valid record matching `filter` after the position in
    /// `token`, and advances the token past it.
    pub fn find_next(
        &self,
        filter: &Filter,
        token: &mut FindToken,
    ) -> Result<Option<RecordDesc>, Error> {
        let (first_page, mut offset) = match token.pos {
            Some(pos) if pos.generation == self.generation => (pos.page, pos.offset),
            _ => (0, PageTag::WORDS),
        };

        for page in first_page..self.geo.virtual_pages() {
            if page != first_page {
                offset = PageTag::WORDS;
            }
            if !self.readable(page) {
                continue;
            }
            while let Some(slot) = self.slot_at(page, offset)? {
                offset = slot.next;
                if slot.header.state() == RecordState::Valid && filter.matches(&slot.header) {
                    token.pos = Some(Hint {
                        page,
                        offset,
                        generation: self.generation,
                    });
                    return Ok(Some(Location { page, slot }.desc(self.generation)));
                }
            }
        }

        // Park the token past the last page so that it keeps reporting the
        // end until reset.
        token.pos = Some(Hint {
            page: self.geo.virtual_pages(),
            offset: PageTag::WORDS,
            generation: self.generation,
        });
        Ok(None)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Open records.

/// Record ids currently open, with the page each lives on and a count.
#[derive(Debug, Default)]
pub(crate) struct OpenTable {
    pins: RefCell<BTreeMap<u32, (u32, u32)>>,
}

impl OpenTable {
    pub fn pin(self: &Rc<Self>, record_id: u32, page: u32) -> Pin {
        let mut pins = self.pins.borrow_mut();
        let entry = pins.entry(record_id).or_insert((page, 0));
        entry.1 += 1;
        Pin {
            table: self.clone(),
            record_id,
        }
    }

    fn unpin(&self, record_id: u32) {
        let mut pins = self.pins.borrow_mut();
        if let Some(entry) = pins.get_mut(&record_id) {
            entry.1 -= 1;
            if entry.1 == 0 {
                pins.remove(&record_id);
            }
        }
    }

    /// Number of open handles, over all records.
    pub fn count(&self) -> u32 {
        self.pins.borrow().values().map(|(_, n)| n).sum()
    }

    pub fn page_busy(&self, page: u32) -> bool {
        self.pins.borrow().values().any(|&(p, _)| p == page)
    }
}

/// Keeps a record's page from being collected while it is open.
#[derive(Debug)]
pub struct Pin {
    table: Rc<OpenTable>,
    record_id: u32,
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.table.unpin(self.record_id);
    }
}

/// A record opened for reading: its header fields and a copy of its payload.
///
/// While this exists, GC leaves the page holding the record alone. Drop it
/// (or call `close`) when done.
#[derive(Debug)]
pub struct OpenRecord {
    info: RecordInfo,
    data: Vec<u8>,
    _pin: Pin,
}

impl OpenRecord {
    pub(crate) fn new(info: RecordInfo, data: Vec<u8>, pin: Pin) -> Self {
        Self {
            info,
            data,
            _pin: pin,
        }
    }

    pub fn info(&self) -> &RecordInfo {
        &self.info
    }

    /// Payload, padded with zeroes to a whole number of words.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matching() {
        let h = RecordHeader::new(3, 7, 1, &[]);
        assert!(Filter::any().matches(&h));
        assert!(Filter::file(3).matches(&h));
        assert!(Filter::key(7).matches(&h));
        assert!(Filter::record(3, 7).matches(&h));
        assert!(!Filter::record(3, 8).matches(&h));
        assert!(!Filter::file(4).matches(&h));
    }

    #[test]
    fn pins_release_on_drop() {
        let table = Rc::new(OpenTable::default());
        let a = table.pin(5, 1);
        let b = table.pin(5, 1);
        let c = table.pin(6, 2);
        assert_eq!(table.count(), 3);
        assert!(table.page_busy(1));
        assert!(table.page_busy(2));

        drop(a);
        assert!(table.page_busy(1));
        drop(b);
        assert!(!table.page_busy(1));
        drop(c);
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn null_descriptor() {
        assert!(RecordDesc::default().is_null());
        assert!(!RecordDesc::new(1).is_null());
        assert_eq!(RecordDesc::new(9).record_id(), 9);
    }
}
