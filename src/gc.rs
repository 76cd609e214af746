// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Garbage collection.
//!
//! A cycle picks the data page with the most dirty words, copies its valid
//! records into the swap page one flash write at a time, then swaps roles:
//! the old swap page becomes a data page and the source is erased and tagged
//! as the new swap page.
//!
//! Until the source erase starts, the source is intact and an interrupted
//! cycle can simply be thrown away (the swap page is erased before reuse).
//! Records left behind take their ids with them when the source is erased,
//! so if nothing else on flash still covers the newest of those ids, an
//! empty dirty record carrying it goes into the swap page first.
//! After that, the swap page holds the only copy, which is why it is made
//! readable first and why recovery at init promotes a swap page with records
//! in it whenever some other page has lost its tag.

use alloc::vec::Vec;
use log::{debug, error, info, warn};
use zerocopy::AsBytes;

use crate::error::Error;
use crate::low_level::{
    self, Flash, PageKind, PageTag, RecordHeader, RecordState, Slot, ERASED_WORD,
};
use crate::queue::promote_command;
use crate::reserve::Role;
use crate::store::{Command, Progress, Store, StoreState};

/// Where an unfinished collection stands. Kept on the store so that a bounded
/// GC can pick up where the last one paused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct GcCursor {
    /// Page being collected.
    pub source: u32,
    /// Next word in the source to look at.
    pub offset: u32,
    /// First unwritten word in the swap page.
    pub swap_fill: u32,
    /// Set once the collection has paused; records copied before the pause
    /// may have been deleted since.
    pub paused: bool,
    /// Largest id among source records not copied, or zero.
    pub dropped_max: u32,
}

impl GcCursor {
    fn leave_behind(&mut self, record_id: u32) {
        if record_id != ERASED_WORD {
            self.dropped_max = self.dropped_max.max(record_id);
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum GcStep {
    Select,
    EraseSwap { next: u32 },
    TagSwap,
    SwapReady,
    Copy,
    Reconcile { offset: u32 },
    MarkFloor,
    Handover,
    EraseSource { source: u32, promoted: u32, next: u32 },
    Promote { source: u32, promoted: u32 },
    TagNewSwap { source: u32 },
    Finish { source: u32 },
}

pub(crate) struct GcOp {
    /// Stop after this many record copies.
    pub bound: Option<u32>,
    pub step: GcStep,
    copied: u32,
    /// Some dirty page was passed over because it had open records.
    skipped_busy: bool,
}

impl GcOp {
    pub fn new(bound: Option<u32>) -> Self {
        Self {
            bound,
            step: GcStep::Select,
            copied: 0,
            skipped_busy: false,
        }
    }

    fn bound_reached(&self) -> bool {
        self.bound.map_or(false, |b| self.copied >= b)
    }
}

impl<F: Flash> Store<F> {
    /// Data page with the most dirty words, skipping pages with open records.
    fn select_source(&self, skipped_busy: &mut bool) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        for (page, state) in self.book.pages() {
            if state.role != Role::Data || state.dirty_words == 0 {
                continue;
            }
            if self.open.page_busy(page) {
                *skipped_busy = true;
                continue;
            }
            if best.map_or(true, |(_, dirty)| state.dirty_words > dirty) {
                best = Some((page, state.dirty_words));
            }
        }
        best.map(|(page, _)| page)
    }

    pub(crate) fn advance_gc(&mut self, op: &mut GcOp) -> Result<Progress, Error> {
        loop {
            match op.step {
                GcStep::Select => {
                    if self.gc_cursor.is_some() {
                        op.step = GcStep::Copy;
                        continue;
                    }
                    if self.swap_dirty {
                        let first = self.geo.physical_pages(self.swap_page).start;
                        op.step = GcStep::EraseSwap { next: first };
                        continue;
                    }
                    if op.bound_reached() {
                        return Ok(Progress::Done);
                    }
                    match self.select_source(&mut op.skipped_busy) {
                        Some(source) => {
                            info!(
                                "gc: collecting page {} ({} dirty words) into page {}",
                                source,
                                self.book.page(source).dirty_words,
                                self.swap_page,
                            );
                            self.gc_cursor = Some(GcCursor {
                                source,
                                offset: PageTag::WORDS,
                                swap_fill: PageTag::WORDS,
                                paused: false,
                                dropped_max: 0,
                            });
                            op.step = GcStep::Copy;
                        }
                        None if op.skipped_busy => return Err(Error::NoOpenRecords),
                        None => return Ok(Progress::Done),
                    }
                }
                GcStep::EraseSwap { next } => {
                    if next < self.geo.physical_pages(self.swap_page).end {
                        op.step = GcStep::EraseSwap { next: next + 1 };
                        return self.issue(Command::Erase { page: next });
                    }
                    op.step = GcStep::TagSwap;
                }
                GcStep::TagSwap => {
                    op.step = GcStep::SwapReady;
                    let tag = PageTag::new(PageKind::Swap, self.next_record_id);
                    return self.issue(Command::write(self.swap_page, 0, tag.as_bytes()));
                }
                GcStep::SwapReady => {
                    self.swap_dirty = false;
                    op.step = GcStep::Select;
                }
                GcStep::Copy => {
                    let mut cursor = self.gc_cursor.ok_or(Error::Internal)?;
                    if op.bound_reached() {
                        cursor.paused = true;
                        self.gc_cursor = Some(cursor);
                        debug!("gc: pausing at page {} offset {}", cursor.source, cursor.offset);
                        return Ok(Progress::Done);
                    }
                    if let Some(command) = self.next_copy(&mut cursor)? {
                        self.gc_cursor = Some(cursor);
                        op.copied += 1;
                        return self.issue(command);
                    }
                    self.gc_cursor = Some(cursor);
                    op.step = if cursor.paused {
                        GcStep::Reconcile { offset: PageTag::WORDS }
                    } else {
                        GcStep::MarkFloor
                    };
                }
                GcStep::Reconcile { offset } => {
                    let cursor = self.gc_cursor.ok_or(Error::Internal)?;
                    match self.next_stale_copy(&cursor, offset)? {
                        Some((stale, next)) => {
                            op.step = GcStep::Reconcile { offset: next };
                            return self.issue(Command::write(
                                self.swap_page,
                                stale + RecordHeader::STATE_WORD,
                                &RecordState::Dirty.word_bytes(),
                            ));
                        }
                        None => op.step = GcStep::MarkFloor,
                    }
                }
                GcStep::MarkFloor => {
                    let cursor = self.gc_cursor.ok_or(Error::Internal)?;
                    op.step = GcStep::Handover;
                    if let Some(command) = self.floor_marker(&cursor)? {
                        return self.issue(command);
                    }
                }
                GcStep::Handover => {
                    let cursor = self.gc_cursor.ok_or(Error::Internal)?;
                    let source = cursor.source;
                    if self.open.page_busy(source) {
                        warn!("gc: page {} was opened during collection, abandoning", source);
                        self.gc_cursor = None;
                        self.swap_dirty = true;
                        return Err(Error::NoOpenRecords);
                    }

                    let promoted = self.swap_page;
                    let scan = low_level::scan_page(&self.flash, &self.geo, promoted, false)?;
                    self.book.adopt(promoted, &scan);
                    self.book.set_erasing(source);
                    self.generation = self.generation.wrapping_add(1);
                    self.gc_cursor = None;
                    info!("gc: page {} now holds the live records of page {}", promoted, source);

                    let first = self.geo.physical_pages(source).start;
                    op.step = GcStep::EraseSource { source, promoted, next: first };
                }
                GcStep::EraseSource { source, promoted, next } => {
                    // The tag page goes first: from then on the source reads
                    // as untagged, which tells recovery the swap page is the
                    // one to keep.
                    if next < self.geo.physical_pages(source).end {
                        op.step = GcStep::EraseSource { source, promoted, next: next + 1 };
                        return self.issue(Command::Erase { page: next });
                    }
                    op.step = GcStep::Promote { source, promoted };
                }
                GcStep::Promote { source, promoted } => {
                    op.step = GcStep::TagNewSwap { source };
                    return self.issue(promote_command(promoted));
                }
                GcStep::TagNewSwap { source } => {
                    op.step = GcStep::Finish { source };
                    let tag = PageTag::new(PageKind::Swap, self.next_record_id);
                    return self.issue(Command::write(source, 0, tag.as_bytes()));
                }
                GcStep::Finish { source } => {
                    self.book.set_swap(source);
                    self.swap_page = source;
                    self.swap_dirty = false;
                    op.step = GcStep::Select;
                }
            }
        }
    }

    /// Finds the next valid record at or after `cursor.offset` in the source
    /// and returns the write that copies it, advancing the cursor past it.
    /// Returns `None` at the end of the source.
    fn next_copy(&mut self, cursor: &mut GcCursor) -> Result<Option<Command>, Error> {
        let mut payload = Vec::new();
        loop {
            let slot = match low_level::next_record(&self.flash, &self.geo, cursor.source, cursor.offset)? {
                Slot::Record(slot) => slot,
                Slot::End | Slot::Torn => return Ok(None),
            };
            cursor.offset = slot.next;

            if slot.header.state() != RecordState::Valid {
                cursor.leave_behind(slot.header.record_id.get());
                continue;
            }
            low_level::read_payload(&self.flash, &self.geo, cursor.source, &slot, &mut payload)?;
            if !slot.header.crc_valid(&payload) {
                warn!(
                    "gc: dropping record {} at page {} offset {}: bad CRC",
                    slot.header.record_id.get(), cursor.source, slot.offset,
                );
                self.corruption.set(true);
                cursor.leave_behind(slot.header.record_id.get());
                continue;
            }

            let total = slot.header.total_words();
            if cursor.swap_fill + total > self.geo.virtual_page_words() {
                error!("gc: swap page overflow copying record {}", slot.header.record_id.get());
                return Err(Error::Internal);
            }

            let mut image = Vec::with_capacity(low_level::words_to_bytes(total));
            image.extend_from_slice(slot.header.as_bytes());
            image.extend_from_slice(&payload);
            let command = Command::Write {
                page: self.swap_page,
                offset: cursor.swap_fill,
                data: image,
            };
            cursor.swap_fill += total;
            return Ok(Some(command));
        }
    }

    /// Returns the write that puts an empty dirty record into the swap page
    /// when the source holds the only trace of its newest left-behind id.
    /// Other pages' tags and headers, and the copies already made, are
    /// looked at first.
    fn floor_marker(&self, cursor: &GcCursor) -> Result<Option<Command>, Error> {
        let dropped = cursor.dropped_max;
        if dropped == 0 {
            return Ok(None);
        }
        for page in 0..self.geo.virtual_pages() {
            if page == cursor.source {
                continue;
            }
            let info = low_level::read_page_info(&self.flash, &self.geo, page)?;
            if info.id_floor > dropped {
                return Ok(None);
            }
            if info.has_records {
                let scan = low_level::scan_page(&self.flash, &self.geo, page, false)?;
                if scan.max_record_id >= dropped {
                    return Ok(None);
                }
            }
        }

        if cursor.swap_fill + RecordHeader::WORDS > self.geo.virtual_page_words() {
            error!("gc: no room to keep record id {} in page {}", dropped, self.swap_page);
            return Err(Error::Internal);
        }
        let record_id = dropped.max(self.next_record_id.saturating_sub(1));
        let mut header = RecordHeader::new(0, 0, record_id, &[]);
        header.state = (RecordState::Dirty as u32).into();
        debug!("gc: keeping record id {} alive in page {}", record_id, self.swap_page);
        Ok(Some(Command::write(self.swap_page, cursor.swap_fill, header.as_bytes())))
    }

    /// Looks through the swap page from `offset` for a valid copy whose
    /// original in the source has since been deleted. Returns the copy's
    /// offset and where to continue from.
    fn next_stale_copy(
        &self,
        cursor: &GcCursor,
        mut offset: u32,
    ) -> Result<Option<(u32, u32)>, Error> {
        while offset < cursor.swap_fill {
            let copy = match low_level::next_record(&self.flash, &self.geo, self.swap_page, offset)? {
                Slot::Record(slot) => slot,
                Slot::End | Slot::Torn => break,
            };
            offset = copy.next;
            if copy.header.state() != RecordState::Valid {
                continue;
            }

            // TODO: this rescans the source for every copy; a cycle that
            // pauses often on a full page pays O(n^2) reads here.
            let id = copy.header.record_id.get();
            let mut at = PageTag::WORDS;
            while let Slot::Record(orig) = low_level::next_record(&self.flash, &self.geo, cursor.source, at)? {
                if orig.header.record_id.get() == id {
                    if orig.header.state() != RecordState::Valid {
                        debug!("gc: record {} deleted during pause", id);
                        return Ok(Some((copy.offset, offset)));
                    }
                    break;
                }
                at = orig.next;
            }
        }
        Ok(None)
    }

    pub(crate) fn abort_gc(&mut self, op: &GcOp) {
        match op.step {
            GcStep::Select | GcStep::Handover => (),
            GcStep::EraseSwap { .. }
            | GcStep::TagSwap
            | GcStep::SwapReady
            | GcStep::Copy
            | GcStep::Reconcile { .. }
            | GcStep::MarkFloor => {
                // The source is still intact; start over next time.
                self.gc_cursor = None;
                self.swap_dirty = true;
            }
            GcStep::EraseSource { .. }
            | GcStep::Promote { .. }
            | GcStep::TagNewSwap { .. }
            | GcStep::Finish { .. } => {
                error!("gc: flash failure during page handover; store needs init");
                self.state = StoreState::Uninit;
            }
        }
    }
}
