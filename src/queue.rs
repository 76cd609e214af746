// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queued operations and their step machines.
//!
//! Each operation is a plain value holding its request parameters and a step
//! enum. `Store::advance` moves an operation forward from its current step,
//! running synchronous steps back to back, until it either starts a flash
//! operation or finishes. The step left behind says what to do when the
//! flash operation completes.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, error, info, warn};
use zerocopy::AsBytes;

use crate::error::Error;
use crate::event::{Event, EventKind};
use crate::find::{Location, RecordDesc};
use crate::gc::GcOp;
use crate::low_level::{
    self, Flash, PageInfo, PageKind, PageTag, PageType, RecordHeader, RecordState,
};
use crate::reserve::Reservation;
use crate::store::{Command, Progress, Store, StoreState};

pub(crate) enum Operation {
    Init(InitOp),
    Write(WriteOp),
    DelRecord(DeleteOp),
    DelFile(DeleteFileOp),
    Gc(GcOp),
}

impl Operation {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Init(_) => EventKind::Init,
            Self::Write(w) if w.replaces.is_some() => EventKind::Update,
            Self::Write(_) => EventKind::Write,
            Self::DelRecord(_) => EventKind::DelRecord,
            Self::DelFile(_) => EventKind::DelFile,
            Self::Gc(_) => EventKind::Gc,
        }
    }

    /// The event announcing this operation's end.
    pub fn event(&self, result: Result<(), Error>) -> Event {
        let mut event = Event::bare(self.kind(), result);
        match self {
            Self::Write(w) => {
                event.file_id = w.file_id;
                event.record_key = w.record_key;
                event.record_id = w.record_id;
            }
            Self::DelRecord(d) => {
                event.record_id = d.desc.record_id();
                if let Some(loc) = &d.found {
                    event.file_id = loc.slot.header.file_id.get();
                    event.record_key = loc.slot.header.record_key.get();
                }
            }
            Self::DelFile(d) => event.file_id = d.file_id,
            Self::Init(_) | Self::Gc(_) => (),
        }
        event
    }
}

/// Bounded FIFO of operations waiting behind the current one.
pub(crate) struct OpQueue {
    ops: VecDeque<Operation>,
    capacity: usize,
}

impl OpQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn is_full(&self) -> bool {
        self.ops.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Callers check `is_full` first, so that a refused request can be
    /// turned away before anything is allocated for it.
    pub fn push(&mut self, op: Operation) {
        debug_assert!(!self.is_full());
        self.ops.push_back(op);
    }

    pub fn pop(&mut self) -> Option<Operation> {
        self.ops.pop_front()
    }
}

//////////////////////////////////////////////////////////////////////////////
// Init and format.

/// One flash-level step of bringing the pages into a mountable state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Action {
    /// Erase every physical page of a virtual page.
    Erase(u32),
    TagSwap(u32),
    TagData(u32),
    /// Turn a swap page into a data page in place.
    Promote(u32),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum InitStep {
    Scan,
    Run,
    Erasing { next: u32, end: u32 },
    Mount,
}

pub(crate) struct InitOp {
    pub format: bool,
    pub step: InitStep,
    plan: VecDeque<Action>,
    /// Id floor for any tags written during recovery.
    floor: u32,
}

impl InitOp {
    pub fn new(format: bool) -> Self {
        Self {
            format,
            step: InitStep::Scan,
            plan: VecDeque::new(),
            floor: 1,
        }
    }
}

/// Works out what has to be done to the pages described by `pages` so that
/// there is exactly one empty swap page and every other page is a data page.
///
/// `format` erases everything. Otherwise the point is to finish, or undo,
/// whatever a GC cycle or an earlier init was doing when power was lost.
pub(crate) fn plan_recovery(pages: &[PageInfo], format: bool) -> Result<VecDeque<Action>, Error> {
    let mut plan = VecDeque::new();

    let tagged = pages.iter()
        .any(|p| matches!(p.page_type, PageType::Data | PageType::Swap));

    if format || !tagged {
        for (page, info) in pages.iter().enumerate() {
            let page = page as u32;
            if format || info.page_type != PageType::Erased {
                plan.push_back(Action::Erase(page));
            }
            plan.push_back(if page == 0 { Action::TagSwap(page) } else { Action::TagData(page) });
        }
        return Ok(plan);
    }

    let mut full_swaps = pages.iter().enumerate()
        .filter(|(_, p)| p.page_type == PageType::Swap && p.has_records)
        .map(|(i, _)| i as u32);
    let full_swap = full_swaps.next();
    if full_swaps.next().is_some() {
        return Err(Error::Internal);
    }

    let untagged = pages.iter()
        .any(|p| matches!(p.page_type, PageType::Erased | PageType::Undefined));

    let mut swap = None;
    if let Some(page) = full_swap {
        if untagged {
            // The GC got as far as erasing its source, so the swap page holds
            // the only copy of the source's records.
            plan.push_back(Action::Promote(page));
        } else {
            // The GC was still copying; the source is intact.
            plan.push_back(Action::Erase(page));
            plan.push_back(Action::TagSwap(page));
            swap = Some(page);
        }
    }

    for (page, info) in pages.iter().enumerate() {
        let page = page as u32;
        match info.page_type {
            PageType::Swap if !info.has_records => {
                if swap.is_none() {
                    swap = Some(page);
                } else {
                    plan.push_back(Action::Promote(page));
                }
            }
            PageType::Erased | PageType::Undefined => {
                if info.page_type == PageType::Undefined {
                    plan.push_back(Action::Erase(page));
                }
                if swap.is_none() {
                    plan.push_back(Action::TagSwap(page));
                    swap = Some(page);
                } else {
                    plan.push_back(Action::TagData(page));
                }
            }
            _ => (),
        }
    }

    if swap.is_none() {
        return Err(Error::Internal);
    }
    Ok(plan)
}

impl<F: Flash> Store<F> {
    pub(crate) fn advance_init(&mut self, op: &mut InitOp) -> Result<Progress, Error> {
        loop {
            match op.step {
                InitStep::Scan => {
                    let mut pages = Vec::with_capacity(self.geo.virtual_pages() as usize);
                    let mut floor = 1u32;
                    for page in 0..self.geo.virtual_pages() {
                        let info = low_level::read_page_info(&self.flash, &self.geo, page)?;
                        floor = floor.max(info.id_floor);
                        if matches!(info.page_type, PageType::Data | PageType::Swap) {
                            let scan = low_level::scan_page(&self.flash, &self.geo, page, false)?;
                            floor = floor.max(scan.max_record_id.saturating_add(1));
                        }
                        debug!("init: page {} is {:?}", page, info.page_type);
                        pages.push(info);
                    }
                    op.plan = plan_recovery(&pages, op.format).map_err(|e| {
                        error!("init: no way to recover page layout");
                        e
                    })?;
                    op.floor = if op.format { 1 } else { floor };
                    if op.format {
                        info!("format: erasing {} pages", pages.len());
                    } else if !op.plan.is_empty() {
                        warn!("init: {} recovery actions needed", op.plan.len());
                    }
                    op.step = InitStep::Run;
                }
                InitStep::Run => {
                    let Some(action) = op.plan.pop_front() else {
                        op.step = InitStep::Mount;
                        continue;
                    };
                    debug!("init: {:?}", action);
                    match action {
                        Action::Erase(page) => {
                            let range = self.geo.physical_pages(page);
                            op.step = InitStep::Erasing { next: range.start, end: range.end };
                        }
                        Action::TagSwap(page) | Action::TagData(page) => {
                            let kind = if let Action::TagSwap(_) = action {
                                PageKind::Swap
                            } else {
                                PageKind::Data
                            };
                            let tag = PageTag::new(kind, op.floor);
                            return self.issue(Command::write(page, 0, tag.as_bytes()));
                        }
                        Action::Promote(page) => {
                            return self.issue(promote_command(page));
                        }
                    }
                }
                InitStep::Erasing { next, end } => {
                    if next < end {
                        op.step = InitStep::Erasing { next: next + 1, end };
                        return self.issue(Command::Erase { page: next });
                    }
                    op.step = InitStep::Run;
                }
                InitStep::Mount => {
                    self.mount()?;
                    return Ok(Progress::Done);
                }
            }
        }
    }

    pub(crate) fn abort_init(&mut self, _op: &InitOp) {
        error!("init failed; store left uninitialized");
        self.state = StoreState::Uninit;
    }
}

/// Clears the low bit of a swap page's type word, making it a data page.
pub(crate) fn promote_command(page: u32) -> Command {
    let word: [u8; 4] = (PageKind::Data as u32).to_le_bytes();
    Command::write(page, PageTag::TYPE_WORD, &word)
}

//////////////////////////////////////////////////////////////////////////////
// Write and update.

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WriteStep {
    FindExisting,
    WriteHeader,
    WriteData,
    Finalize,
    Verify,
    DirtyOld,
    Done,
}

pub(crate) struct WriteOp {
    pub file_id: u16,
    pub record_key: u16,
    pub record_id: u32,
    /// Payload, padded to whole words.
    pub data: Vec<u8>,
    /// Space to write into; consumed when the header goes out.
    pub reservation: Option<Reservation>,
    /// For updates, the record being replaced.
    pub replaces: Option<RecordDesc>,
    pub step: WriteStep,
    old: Option<Location>,
    page: u32,
    offset: u32,
}

impl WriteOp {
    pub fn new(
        file_id: u16,
        record_key: u16,
        record_id: u32,
        data: Vec<u8>,
        reservation: Reservation,
        replaces: Option<RecordDesc>,
    ) -> Self {
        Self {
            file_id,
            record_key,
            record_id,
            data,
            reservation: Some(reservation),
            step: if replaces.is_some() { WriteStep::FindExisting } else { WriteStep::WriteHeader },
            replaces,
            old: None,
            page: 0,
            offset: 0,
        }
    }

    fn total_words(&self) -> u32 {
        RecordHeader::WORDS + low_level::bytes_to_words(self.data.len())
    }
}

impl<F: Flash> Store<F> {
    pub(crate) fn advance_write(&mut self, op: &mut WriteOp) -> Result<Progress, Error> {
        loop {
            match op.step {
                WriteStep::FindExisting => {
                    let desc = op.replaces.ok_or(Error::Internal)?;
                    let loc = self.view().locate(&desc)?
                        .filter(|l| l.state() == RecordState::Valid)
                        .ok_or(Error::NotFound)?;
                    op.old = Some(loc);
                    op.step = WriteStep::WriteHeader;
                }
                WriteStep::WriteHeader => {
                    let reservation = op.reservation.take().ok_or(Error::Internal)?;
                    let total = op.total_words();
                    op.page = reservation.page;
                    op.offset = self.book.begin_record(&reservation, total);
                    debug!(
                        "write: record {} at page {} offset {}",
                        op.record_id, op.page, op.offset,
                    );

                    let header = RecordHeader::new(op.file_id, op.record_key, op.record_id, &op.data);
                    op.step = if op.data.is_empty() { WriteStep::Finalize } else { WriteStep::WriteData };
                    return self.issue(Command::write(op.page, op.offset, header.body_bytes()));
                }
                WriteStep::WriteData => {
                    op.step = WriteStep::Finalize;
                    let command = Command::write(op.page, op.offset + RecordHeader::WORDS, &op.data);
                    return self.issue(command);
                }
                WriteStep::Finalize => {
                    op.step = WriteStep::Verify;
                    return self.issue(Command::write(
                        op.page,
                        op.offset + RecordHeader::STATE_WORD,
                        &RecordState::Valid.word_bytes(),
                    ));
                }
                WriteStep::Verify => {
                    self.book.finalize_record(op.page, op.total_words());
                    if self.config.verify_on_write {
                        self.verify_record(op.page, op.offset)?;
                    }
                    op.step = if op.old.is_some() { WriteStep::DirtyOld } else { WriteStep::Done };
                }
                WriteStep::DirtyOld => {
                    let old = op.old.ok_or(Error::Internal)?;
                    op.step = WriteStep::Done;
                    return self.issue(dirty_command(&old));
                }
                WriteStep::Done => {
                    if let Some(old) = op.old {
                        self.book.dirty_record(old.page, old.slot.header.total_words());
                    }
                    return Ok(Progress::Done);
                }
            }
        }
    }

    pub(crate) fn abort_write(&mut self, op: &mut WriteOp) {
        if let Some(r) = op.reservation.take() {
            self.book.release(r);
            return;
        }

        // A header that never reached flash would leave an erased hole that
        // ends every scan of the page early, so its space is handed back.
        // Anything partly written stays, and is dirty.
        let header_in_flight = op.step == WriteStep::WriteData
            || (op.step == WriteStep::Finalize && op.data.is_empty());
        if !header_in_flight {
            return;
        }
        let erased_to = |end| {
            matches!(
                low_level::is_erased_range(&self.flash, &self.geo, op.page, op.offset, end),
                Ok(true)
            )
        };
        let untouched = erased_to(op.offset + RecordHeader::BODY_WORDS);
        let lost_length = erased_to(op.offset + 1);
        if untouched {
            debug!("write: header for record {} never landed", op.record_id);
            self.book.unwind_record(op.page, op.offset, op.total_words());
        } else if lost_length {
            // Without its first word the header can't be stepped over, and a
            // mount will count the rest of the page as dirty.
            error!(
                "write: header for record {} landed without its length; store needs init",
                op.record_id,
            );
            self.state = StoreState::Uninit;
        }
    }

    fn verify_record(&mut self, page: u32, offset: u32) -> Result<(), Error> {
        let slot = match low_level::next_record(&self.flash, &self.geo, page, offset)? {
            low_level::Slot::Record(slot) => slot,
            _ => return Err(Error::CrcCheckFailed),
        };
        let mut data = Vec::new();
        low_level::read_payload(&self.flash, &self.geo, page, &slot, &mut data)?;
        if !slot.header.crc_valid(&data) {
            warn!("write: record {} failed read-back check", slot.header.record_id.get());
            self.corruption.set(true);
            return Err(Error::CrcCheckFailed);
        }
        Ok(())
    }
}

/// Programs a record's state word to dirty.
pub(crate) fn dirty_command(loc: &Location) -> Command {
    Command::write(
        loc.page,
        loc.slot.offset + RecordHeader::STATE_WORD,
        &RecordState::Dirty.word_bytes(),
    )
}

//////////////////////////////////////////////////////////////////////////////
// Deletion.

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum DeleteStep {
    Locate,
    Flagged,
}

pub(crate) struct DeleteOp {
    pub desc: RecordDesc,
    pub step: DeleteStep,
    found: Option<Location>,
}

impl DeleteOp {
    pub fn new(desc: RecordDesc) -> Self {
        Self {
            desc,
            step: DeleteStep::Locate,
            found: None,
        }
    }
}

pub(crate) struct DeleteFileOp {
    pub file_id: u16,
    current: Option<Location>,
    flagged: u32,
}

impl DeleteFileOp {
    pub fn new(file_id: u16) -> Self {
        Self {
            file_id,
            current: None,
            flagged: 0,
        }
    }
}

impl<F: Flash> Store<F> {
    pub(crate) fn advance_delete(&mut self, op: &mut DeleteOp) -> Result<Progress, Error> {
        match op.step {
            DeleteStep::Locate => {
                let loc = match self.view().locate(&op.desc)? {
                    Some(loc) => loc,
                    // Collected already, or never existed.
                    None if op.desc.record_id() < self.next_record_id => return Ok(Progress::Done),
                    None => return Err(Error::NotFound),
                };
                op.found = Some(loc);
                if loc.state() != RecordState::Valid {
                    return Ok(Progress::Done);
                }
                op.step = DeleteStep::Flagged;
                self.issue(dirty_command(&loc))
            }
            DeleteStep::Flagged => {
                let loc = op.found.ok_or(Error::Internal)?;
                self.book.dirty_record(loc.page, loc.slot.header.total_words());
                Ok(Progress::Done)
            }
        }
    }

    pub(crate) fn advance_delete_file(&mut self, op: &mut DeleteFileOp) -> Result<Progress, Error> {
        if let Some(loc) = op.current.take() {
            self.book.dirty_record(loc.page, loc.slot.header.total_words());
            op.flagged += 1;
        }

        let file_id = op.file_id;
        let next = self.view().scan(|slot| {
            slot.header.state() == RecordState::Valid && slot.header.file_id.get() == file_id
        })?;
        match next {
            Some(loc) => {
                op.current = Some(loc);
                self.issue(dirty_command(&loc))
            }
            None => {
                debug!("delete file {}: {} records", file_id, op.flagged);
                Ok(Progress::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(page_type: PageType, has_records: bool) -> PageInfo {
        PageInfo {
            page_type,
            id_floor: 0,
            has_records,
        }
    }

    const DATA: PageInfo = PageInfo { page_type: PageType::Data, id_floor: 1, has_records: true };

    #[test]
    fn first_use_tags_everything() {
        let pages = [
            info(PageType::Erased, false),
            info(PageType::Undefined, true),
            info(PageType::Erased, false),
        ];
        let plan: Vec<_> = plan_recovery(&pages, false).unwrap().into_iter().collect();
        assert_eq!(plan, [
            Action::TagSwap(0),
            Action::Erase(1),
            Action::TagData(1),
            Action::TagData(2),
        ]);
    }

    #[test]
    fn format_erases_everything() {
        let pages = [DATA, info(PageType::Swap, false)];
        let plan: Vec<_> = plan_recovery(&pages, true).unwrap().into_iter().collect();
        assert_eq!(plan, [
            Action::Erase(0),
            Action::TagSwap(0),
            Action::Erase(1),
            Action::TagData(1),
        ]);
    }

    #[test]
    fn clean_layout_needs_nothing() {
        let pages = [DATA, info(PageType::Swap, false), DATA];
        assert!(plan_recovery(&pages, false).unwrap().is_empty());
    }

    #[test]
    fn interrupted_copy_discards_swap() {
        let pages = [DATA, info(PageType::Swap, true)];
        let plan: Vec<_> = plan_recovery(&pages, false).unwrap().into_iter().collect();
        assert_eq!(plan, [Action::Erase(1), Action::TagSwap(1)]);
    }

    #[test]
    fn interrupted_handover_promotes_swap() {
        for source in [PageType::Erased, PageType::Undefined] {
            let pages = [info(source, source == PageType::Undefined), info(PageType::Swap, true), DATA];
            let plan: Vec<_> = plan_recovery(&pages, false).unwrap().into_iter().collect();
            let mut expected = vec![Action::Promote(1)];
            if source == PageType::Undefined {
                expected.push(Action::Erase(0));
            }
            expected.push(Action::TagSwap(0));
            assert_eq!(plan, expected);
        }
    }

    #[test]
    fn missing_swap_is_retagged() {
        let pages = [DATA, info(PageType::Erased, false), DATA];
        let plan: Vec<_> = plan_recovery(&pages, false).unwrap().into_iter().collect();
        assert_eq!(plan, [Action::TagSwap(1)]);
    }

    #[test]
    fn extra_empty_swaps_are_promoted() {
        let pages = [info(PageType::Swap, false), DATA, info(PageType::Swap, false)];
        let plan: Vec<_> = plan_recovery(&pages, false).unwrap().into_iter().collect();
        assert_eq!(plan, [Action::Promote(2)]);
    }

    #[test]
    fn unrecoverable_layouts() {
        let two_full = [info(PageType::Swap, true), info(PageType::Swap, true), DATA];
        assert_eq!(plan_recovery(&two_full, false), Err(Error::Internal));
        let no_swap = [DATA, DATA];
        assert_eq!(plan_recovery(&no_swap, false), Err(Error::Internal));
    }

    #[test]
    fn queue_is_bounded() {
        let mut q = OpQueue::new(2);
        q.push(Operation::DelFile(DeleteFileOp::new(1)));
        assert!(!q.is_full());
        q.push(Operation::DelFile(DeleteFileOp::new(2)));
        assert!(q.is_full());
        match q.pop() {
            Some(Operation::DelFile(op)) => assert_eq!(op.file_id, 1),
            _ => panic!("wrong operation"),
        }
        assert!(!q.is_full());
    }

    #[test]
    fn events_carry_request_fields() {
        let op = Operation::DelFile(DeleteFileOp::new(7));
        let e = op.event(Ok(()));
        assert_eq!(e.kind, EventKind::DelFile);
        assert_eq!(e.file_id, 7);
        assert_eq!(e.record_id, 0);
    }
}
