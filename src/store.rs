// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The record store proper: request admission, the operation pump, and
//! reads.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::Cell;
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::event::{Event, EventKind, SubscriberId, Subscribers};
use crate::find::{Filter, FindToken, OpenRecord, OpenTable, RecordDesc, RecordInfo, View};
use crate::gc::{GcCursor, GcOp};
use crate::low_level::{
    self, bytes_to_words, Flash, FlashEvent, FlashOp, FlashOutcome, Geometry, PageType,
    RecordHeader, RecordState,
};
use crate::queue::{DeleteFileOp, DeleteOp, InitOp, OpQueue, Operation, WriteOp};
use crate::reserve::{PageBook, Reservation, Role};

/// File id that may not be used.
pub const INVALID_FILE_ID: u16 = 0xFFFF;
/// Record key that may not be used.
pub const INVALID_RECORD_KEY: u16 = 0xFFFF;

/// A single flash operation, as issued (and, on failure, re-issued).
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Command {
    /// Program `data` at word `offset` of virtual page `page`.
    Write { page: u32, offset: u32, data: Vec<u8> },
    /// Erase physical page `page`.
    Erase { page: u32 },
}

impl Command {
    pub fn write(page: u32, offset: u32, data: &[u8]) -> Self {
        Self::Write {
            page,
            offset,
            data: data.to_vec(),
        }
    }

    fn op(&self) -> FlashOp {
        match self {
            Self::Write { .. } => FlashOp::Write,
            Self::Erase { .. } => FlashOp::Erase,
        }
    }
}

struct InFlight {
    command: Command,
    retries_left: u8,
}

/// What an operation's step machine did when advanced.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Progress {
    /// A flash operation was started; call again when it completes.
    Issued,
    Done,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum StoreState {
    Uninit,
    Initializing,
    Ready,
}

/// A `write_reserved` or `update_reserved` request that was turned away. The
/// reservation comes back untouched.
#[derive(Debug)]
pub struct Refused {
    pub error: Error,
    pub reservation: Reservation,
}

/// Counters returned by `Store::stat`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stat {
    /// Data pages, i.e. pages records can go to.
    pub pages_available: u32,
    pub open_records: u32,
    pub valid_records: u32,
    pub dirty_records: u32,
    pub words_reserved: u32,
    /// Words written on data pages, valid or not.
    pub words_used: u32,
    /// Largest record (header included) that could be reserved right now.
    pub largest_contig: u32,
    /// Words a full GC would free.
    pub freeable_words: u32,
    /// Some record has failed its CRC check since init.
    pub corruption: bool,
}

pub struct Store<F: Flash> {
    pub(crate) flash: F,
    pub(crate) config: Config,
    pub(crate) geo: Geometry,
    pub(crate) book: PageBook,
    pub(crate) state: StoreState,
    queue: OpQueue,
    current: Option<Operation>,
    in_flight: Option<InFlight>,
    subscribers: Subscribers,
    pub(crate) open: Rc<OpenTable>,
    pub(crate) swap_page: u32,
    /// The swap page may hold something other than a tag and the copies
    /// described by `gc_cursor`, and must be erased before use.
    pub(crate) swap_dirty: bool,
    pub(crate) gc_cursor: Option<GcCursor>,
    /// GC operations queued or running.
    gc_pending: u32,
    pub(crate) next_record_id: u32,
    /// Bumped whenever records move.
    pub(crate) generation: u32,
    pub(crate) corruption: Cell<bool>,
}

impl<F: Flash> Store<F> {
    /// Wraps `flash`. The store starts out uninitialized; call `init` (or
    /// `format`) and wait for the `Init` event.
    pub fn new(flash: F, config: Config) -> Result<Self, Error> {
        config.validate()?;
        let geo = Geometry::for_flash(&flash, config.pages_per_virtual)
            .ok_or(Error::InvalidParam)?;
        Ok(Self {
            book: PageBook::new(&geo),
            queue: OpQueue::new(config.queue_size),
            subscribers: Subscribers::new(config.max_subscribers),
            flash,
            config,
            geo,
            state: StoreState::Uninit,
            current: None,
            in_flight: None,
            open: Rc::new(OpenTable::default()),
            swap_page: 0,
            swap_dirty: false,
            gc_cursor: None,
            gc_pending: 0,
            next_record_id: 1,
            generation: 0,
            corruption: Cell::new(false),
        })
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Access to the driver, e.g. to pull completions out of it.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.state == StoreState::Ready
    }

    /// Whether any operation is queued or in progress.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || self.current.is_some() || !self.queue.is_empty()
    }

    /// Words in one virtual page.
    pub fn page_size_words(&self) -> u32 {
        self.geo.virtual_page_words()
    }

    /// Words managed by the store, swap page included.
    pub fn total_size_words(&self) -> u32 {
        self.geo.virtual_page_words() * self.geo.virtual_pages()
    }

    /// Words neither written nor reserved on data pages.
    pub fn free_words(&self) -> u32 {
        self.book.free_words()
    }

    pub fn subscribe(&mut self, handler: impl FnMut(&Event) + 'static) -> Result<SubscriberId, Error> {
        self.subscribers.add(Box::new(handler))
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> Result<(), Error> {
        self.subscribers.remove(id)
    }

    pub(crate) fn view(&self) -> View<'_, F> {
        View {
            flash: &self.flash,
            geo: &self.geo,
            book: &self.book,
            generation: self.generation,
        }
    }

    fn check_ready(&self) -> Result<(), Error> {
        match self.state {
            StoreState::Ready => Ok(()),
            _ => Err(Error::NotInitialized),
        }
    }

    fn check_queue(&self) -> Result<(), Error> {
        if self.queue.is_full() {
            return Err(Error::NoSpaceInQueues);
        }
        Ok(())
    }

    fn allocate_record_id(&mut self) -> u32 {
        let id = self.next_record_id;
        self.next_record_id = self.next_record_id.wrapping_add(1).max(1);
        id
    }
}

//////////////////////////////////////////////////////////////////////////////
// Requests.

impl<F: Flash> Store<F> {
    /// Mounts the store, repairing whatever an interrupted GC or init left
    /// behind. Completes with an `Init` event. On an already initialized
    /// store the event is delivered before this returns.
    pub fn init(&mut self) -> Result<(), Error> {
        match self.state {
            StoreState::Ready => {
                self.subscribers.dispatch(&Event::bare(EventKind::Init, Ok(())));
                Ok(())
            }
            StoreState::Initializing => Err(Error::Busy),
            StoreState::Uninit => self.start_init(false),
        }
    }

    /// Erases every page and lays the store out from scratch. All records
    /// are lost. Completes with an `Init` event.
    pub fn format(&mut self) -> Result<(), Error> {
        if self.is_busy() || self.book.tokens_out() > 0 || self.state == StoreState::Initializing {
            return Err(Error::Busy);
        }
        self.start_init(true)
    }

    fn start_init(&mut self, format: bool) -> Result<(), Error> {
        self.check_queue()?;
        info!("{}: starting", if format { "format" } else { "init" });
        self.state = StoreState::Initializing;
        self.queue.push(Operation::Init(InitOp::new(format)));
        self.pump();
        Ok(())
    }

    /// Drops the in-RAM state. Pages are left as they are; `init` mounts
    /// them again.
    pub fn uninit(&mut self) -> Result<(), Error> {
        if self.is_busy() || self.book.tokens_out() > 0 {
            return Err(Error::Busy);
        }
        self.state = StoreState::Uninit;
        self.book = PageBook::new(&self.geo);
        self.gc_cursor = None;
        Ok(())
    }

    /// Checks shared by all writes; returns the payload size in words.
    fn check_write(&self, file_id: u16, record_key: u16, len: usize) -> Result<u32, Error> {
        self.check_ready()?;
        if file_id == INVALID_FILE_ID || record_key == INVALID_RECORD_KEY {
            return Err(Error::InvalidParam);
        }
        if len > low_level::words_to_bytes(self.geo.max_payload_words()) {
            return Err(Error::RecordTooLarge);
        }
        if self.gc_pending > 0 {
            return Err(Error::Busy);
        }
        Ok(bytes_to_words(len))
    }

    /// Queues a new record. The descriptor is valid right away, though the
    /// record can't be found until the `Write` event reports success.
    pub fn write(&mut self, file_id: u16, record_key: u16, data: &[u8]) -> Result<RecordDesc, Error> {
        let words = self.check_write(file_id, record_key, data.len())?;
        self.check_queue()?;
        let reservation = self.book.reserve(RecordHeader::WORDS + words)?;
        Ok(self.enqueue_write(file_id, record_key, data, reservation, None))
    }

    /// Queues a new record replacing `desc`. The old record is marked dirty
    /// once the new one is in place; if it is gone by the time the update
    /// runs, the update fails with `NotFound` and writes nothing.
    pub fn update(
        &mut self,
        desc: &RecordDesc,
        file_id: u16,
        record_key: u16,
        data: &[u8],
    ) -> Result<RecordDesc, Error> {
        if desc.is_null() {
            return Err(Error::NullArg);
        }
        let words = self.check_write(file_id, record_key, data.len())?;
        self.check_queue()?;
        let reservation = self.book.reserve(RecordHeader::WORDS + words)?;
        Ok(self.enqueue_write(file_id, record_key, data, reservation, Some(*desc)))
    }

    /// Sets aside room for a record with a payload of up to `length_words`.
    pub fn reserve(&mut self, length_words: u32) -> Result<Reservation, Error> {
        self.check_ready()?;
        if length_words > self.geo.max_payload_words() {
            return Err(Error::RecordTooLarge);
        }
        if self.gc_pending > 0 {
            return Err(Error::Busy);
        }
        self.book.reserve_token(RecordHeader::WORDS + length_words)
    }

    pub fn cancel_reservation(&mut self, reservation: Reservation) {
        self.book.redeem();
        self.book.release(reservation);
    }

    /// Like `write`, using space reserved earlier.
    pub fn write_reserved(
        &mut self,
        reservation: Reservation,
        file_id: u16,
        record_key: u16,
        data: &[u8],
    ) -> Result<RecordDesc, Refused> {
        if let Err(error) = self.check_reserved(&reservation, file_id, record_key, data.len()) {
            return Err(Refused { error, reservation });
        }
        self.book.redeem();
        Ok(self.enqueue_write(file_id, record_key, data, reservation, None))
    }

    /// Like `update`, using space reserved earlier.
    pub fn update_reserved(
        &mut self,
        reservation: Reservation,
        desc: &RecordDesc,
        file_id: u16,
        record_key: u16,
        data: &[u8],
    ) -> Result<RecordDesc, Refused> {
        let checked = if desc.is_null() {
            Err(Error::NullArg)
        } else {
            self.check_reserved(&reservation, file_id, record_key, data.len())
        };
        if let Err(error) = checked {
            return Err(Refused { error, reservation });
        }
        self.book.redeem();
        Ok(self.enqueue_write(file_id, record_key, data, reservation, Some(*desc)))
    }

    fn check_reserved(
        &self,
        reservation: &Reservation,
        file_id: u16,
        record_key: u16,
        len: usize,
    ) -> Result<(), Error> {
        let words = self.check_write(file_id, record_key, len)?;
        if words > reservation.payload_words() {
            return Err(Error::InvalidParam);
        }
        self.check_queue()
    }

    fn enqueue_write(
        &mut self,
        file_id: u16,
        record_key: u16,
        data: &[u8],
        reservation: Reservation,
        replaces: Option<RecordDesc>,
    ) -> RecordDesc {
        let record_id = self.allocate_record_id();
        debug!(
            "queue write: file {:#x} key {:#x} record {} ({} bytes)",
            file_id, record_key, record_id, data.len(),
        );
        let op = WriteOp::new(
            file_id,
            record_key,
            record_id,
            low_level::pad_to_words(data),
            reservation,
            replaces,
        );
        self.queue.push(Operation::Write(op));
        self.pump();
        RecordDesc::new(record_id)
    }

    /// Queues deletion of a record. Deleting a record that is already gone
    /// succeeds.
    ///
    /// The event names the record's file and key for as long as its header
    /// is still on flash, deleted or not. Once GC has reclaimed it, a repeat
    /// delete still succeeds but reports file and key as zero.
    pub fn delete_record(&mut self, desc: &RecordDesc) -> Result<(), Error> {
        self.check_ready()?;
        if desc.is_null() {
            return Err(Error::NullArg);
        }
        self.check_queue()?;
        self.queue.push(Operation::DelRecord(DeleteOp::new(*desc)));
        self.pump();
        Ok(())
    }

    /// Queues deletion of every record in `file_id`, as one operation.
    pub fn delete_file(&mut self, file_id: u16) -> Result<(), Error> {
        self.check_ready()?;
        if file_id == INVALID_FILE_ID {
            return Err(Error::InvalidParam);
        }
        self.check_queue()?;
        self.queue.push(Operation::DelFile(DeleteFileOp::new(file_id)));
        self.pump();
        Ok(())
    }

    /// Queues a GC that runs until no page it may touch has dirty words.
    pub fn gc(&mut self) -> Result<(), Error> {
        self.queue_gc(None)
    }

    /// Queues a GC that stops after copying `max_copies` records. The next GC
    /// carries on from where this one stopped.
    pub fn gc_bounded(&mut self, max_copies: u32) -> Result<(), Error> {
        self.queue_gc(Some(max_copies))
    }

    fn queue_gc(&mut self, bound: Option<u32>) -> Result<(), Error> {
        self.check_ready()?;
        if self.book.tokens_out() > 0 {
            return Err(Error::Busy);
        }
        self.check_queue()?;
        self.gc_pending += 1;
        self.queue.push(Operation::Gc(GcOp::new(bound)));
        self.pump();
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Reads.

impl<F: Flash> Store<F> {
    /// Returns the next valid record matching `filter`, continuing from
    /// `token`.
    pub fn find(&self, filter: &Filter, token: &mut FindToken) -> Result<Option<RecordDesc>, Error> {
        self.check_ready()?;
        self.view().find_next(filter, token)
    }

    pub fn find_record(
        &self,
        file_id: u16,
        record_key: u16,
        token: &mut FindToken,
    ) -> Result<Option<RecordDesc>, Error> {
        self.find(&Filter::record(file_id, record_key), token)
    }

    pub fn find_in_file(&self, file_id: u16, token: &mut FindToken) -> Result<Option<RecordDesc>, Error> {
        self.find(&Filter::file(file_id), token)
    }

    pub fn find_by_key(&self, record_key: u16, token: &mut FindToken) -> Result<Option<RecordDesc>, Error> {
        self.find(&Filter::key(record_key), token)
    }

    /// Every valid record, in storage order.
    pub fn iterate(&self, token: &mut FindToken) -> Result<Option<RecordDesc>, Error> {
        self.find(&Filter::any(), token)
    }

    pub fn descriptor_from_record_id(&self, record_id: u32) -> Result<RecordDesc, Error> {
        if record_id == 0 {
            return Err(Error::NullArg);
        }
        Ok(RecordDesc::new(record_id))
    }

    /// Reads a record. Its page is left alone by GC until the returned
    /// handle is dropped.
    pub fn open(&self, desc: &RecordDesc) -> Result<OpenRecord, Error> {
        self.check_ready()?;
        let loc = self.view().locate(desc)?
            .filter(|l| l.state() == RecordState::Valid)
            .ok_or(Error::NotFound)?;

        let mut data = Vec::new();
        low_level::read_payload(&self.flash, &self.geo, loc.page, &loc.slot, &mut data)?;
        if self.config.crc_on_read && !loc.slot.header.crc_valid(&data) {
            warn!("record {} failed CRC check", desc.record_id());
            self.corruption.set(true);
            return Err(Error::CrcCheckFailed);
        }

        let pin = self.open.pin(desc.record_id(), loc.page);
        Ok(OpenRecord::new(RecordInfo::from(&loc.slot.header), data, pin))
    }

    pub fn stat(&self) -> Stat {
        let mut stat = Stat {
            open_records: self.open.count(),
            words_reserved: self.book.reserved_words(),
            words_used: self.book.used_words(),
            largest_contig: self.book.largest_contig(),
            freeable_words: self.book.dirty_words(),
            corruption: self.corruption.get(),
            ..Stat::default()
        };
        for (_, page) in self.book.pages() {
            if page.role == Role::Data {
                stat.pages_available += 1;
                stat.valid_records += page.valid_records;
                stat.dirty_records += page.dirty_records;
            }
        }
        stat
    }
}

//////////////////////////////////////////////////////////////////////////////
// Execution.

impl<F: Flash> Store<F> {
    /// Delivers the completion of the flash operation the store started
    /// last. Drives the current operation forward and starts queued ones;
    /// events for anything that finishes are dispatched before this returns.
    pub fn on_flash_event(&mut self, event: FlashEvent) {
        let Some(in_flight) = self.in_flight.take() else {
            warn!("flash completion {:?} with nothing in flight", event);
            return;
        };
        if event.op != in_flight.command.op() {
            warn!("flash completion {:?} for a {:?}", event.op, in_flight.command.op());
        }

        if event.outcome != FlashOutcome::Success {
            if let Err(e) = self.retry(in_flight, event.outcome) {
                self.fail_current(e);
            } else {
                return;
            }
        }
        self.pump();
    }

    /// Starts `command`, retrying synchronous refusals.
    pub(crate) fn issue(&mut self, command: Command) -> Result<Progress, Error> {
        if let Command::Write { page, offset, data } = &command {
            if self.geo.physical(*page, *offset, bytes_to_words(data.len())).is_none() {
                error!("write outside virtual page {} at offset {}", page, offset);
                return Err(Error::UnalignedAddr);
            }
        }
        let in_flight = InFlight {
            command,
            retries_left: self.config.op_retries,
        };
        match self.start(&in_flight.command) {
            Ok(()) => self.in_flight = Some(in_flight),
            Err(()) => self.retry(in_flight, FlashOutcome::Failed)?,
        }
        Ok(Progress::Issued)
    }

    /// Re-issues a command whose last attempt ended in `outcome`, for as long
    /// as it has retries left.
    fn retry(&mut self, mut in_flight: InFlight, mut outcome: FlashOutcome) -> Result<(), Error> {
        while in_flight.retries_left > 0 {
            in_flight.retries_left -= 1;
            warn!(
                "flash {:?} {:?}, retrying ({} left)",
                in_flight.command.op(), outcome, in_flight.retries_left,
            );
            if self.start(&in_flight.command).is_ok() {
                self.in_flight = Some(in_flight);
                return Ok(());
            }
            outcome = FlashOutcome::Failed;
        }
        error!("flash {:?} {:?}, giving up", in_flight.command.op(), outcome);
        Err(match outcome {
            FlashOutcome::TimedOut => Error::OperationTimeout,
            _ => Error::Internal,
        })
    }

    fn start(&mut self, command: &Command) -> Result<(), ()> {
        let r = match command {
            Command::Write { page, offset, data } => {
                // Checked in `issue`.
                let (page, offset) = self.geo.physical(*page, *offset, bytes_to_words(data.len()))
                    .ok_or(())?;
                self.flash.begin_write(page, offset, data)
            }
            Command::Erase { page } => self.flash.begin_erase(*page),
        };
        r.map_err(|e| warn!("flash driver refused {:?}: {:?}", command.op(), e))
    }

    /// Runs operations until one is waiting on flash or there are none left.
    fn pump(&mut self) {
        while self.in_flight.is_none() {
            let mut op = match self.current.take().or_else(|| self.queue.pop()) {
                Some(op) => op,
                None => return,
            };
            match self.advance(&mut op) {
                Ok(Progress::Issued) => self.current = Some(op),
                Ok(Progress::Done) => self.complete(op, Ok(())),
                Err(e) => {
                    self.abort(&mut op, e);
                    self.complete(op, Err(e));
                }
            }
        }
    }

    fn advance(&mut self, op: &mut Operation) -> Result<Progress, Error> {
        if self.state != StoreState::Ready && !matches!(op, Operation::Init(_)) {
            return Err(Error::NotInitialized);
        }
        match op {
            Operation::Init(op) => self.advance_init(op),
            Operation::Write(op) => self.advance_write(op),
            Operation::DelRecord(op) => self.advance_delete(op),
            Operation::DelFile(op) => self.advance_delete_file(op),
            Operation::Gc(op) => self.advance_gc(op),
        }
    }

    fn abort(&mut self, op: &mut Operation, e: Error) {
        debug!("{:?} failed: {}", op.kind(), e);
        match op {
            Operation::Init(op) => self.abort_init(op),
            Operation::Write(op) => self.abort_write(op),
            Operation::Gc(op) => self.abort_gc(op),
            Operation::DelRecord(_) | Operation::DelFile(_) => (),
        }
    }

    fn fail_current(&mut self, e: Error) {
        if let Some(mut op) = self.current.take() {
            self.abort(&mut op, e);
            self.complete(op, Err(e));
        }
    }

    fn complete(&mut self, op: Operation, result: Result<(), Error>) {
        if let Operation::Gc(_) = op {
            self.gc_pending -= 1;
        }
        let event = op.event(result);
        debug!("event {:?}", event);
        self.subscribers.dispatch(&event);
    }

    /// Builds the in-RAM state from the (by now consistent) pages.
    pub(crate) fn mount(&mut self) -> Result<(), Error> {
        let mut book = PageBook::new(&self.geo);
        let mut swap = None;
        let mut next_id = 1u32;
        let mut corrupt = 0;

        for page in 0..self.geo.virtual_pages() {
            let info = low_level::read_page_info(&self.flash, &self.geo, page)?;
            next_id = next_id.max(info.id_floor);
            match info.page_type {
                PageType::Data => {
                    let scan = low_level::scan_page(&self.flash, &self.geo, page, true)?;
                    next_id = next_id.max(scan.max_record_id.saturating_add(1));
                    corrupt += scan.corrupt_records;
                    book.adopt(page, &scan);
                }
                PageType::Swap if swap.is_none() && !info.has_records => swap = Some(page),
                other => {
                    error!("mount: page {} is {:?} after recovery", page, other);
                    return Err(Error::Internal);
                }
            }
        }

        let swap = swap.ok_or(Error::Internal)?;
        if corrupt > 0 {
            warn!("mount: {} records failed CRC check", corrupt);
            self.corruption.set(true);
        }

        self.book = book;
        self.swap_page = swap;
        self.swap_dirty = false;
        self.gc_cursor = None;
        self.next_record_id = next_id;
        self.generation = self.generation.wrapping_add(1);
        self.state = StoreState::Ready;
        info!(
            "mounted: {} data pages, swap page {}, next record id {}, {} words free",
            self.geo.virtual_pages() - 1, swap, next_id, self.book.free_words(),
        );
        Ok(())
    }
}
