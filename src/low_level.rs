// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-media layout of pages and records, and the flash device interface.
//!
//! Everything in here is synchronous: it reads flash, builds byte images of
//! things that need writing, and parses what it reads back. Issuing the
//! asynchronous writes and erases, and deciding what to do when they finish,
//! is the store's job.

use alloc::vec::Vec;
use core::mem::size_of;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned};

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

pub fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in buffer");
    (lv.into_ref(), rest)
}

//////////////////////////////////////////////////////////////////////////////
// Units.

/// Size of a flash word in bytes. The medium is only ever programmed in whole
/// words.
pub const WORD_SIZE: usize = 4;

/// Contents of a word after erase.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Converts a word count into bytes.
pub fn words_to_bytes(words: u32) -> usize {
    words as usize * WORD_SIZE
}

/// Converts a byte length into words, rounding up.
pub fn bytes_to_words(bytes: usize) -> u32 {
    ((bytes + WORD_SIZE - 1) / WORD_SIZE) as u32
}

/// Copies `data` into a fresh buffer zero-padded to a whole number of words.
pub fn pad_to_words(data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(words_to_bytes(bytes_to_words(data.len())));
    v.extend_from_slice(data);
    v.resize(words_to_bytes(bytes_to_words(data.len())), 0);
    v
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;
/// Shorthand for a `u32` in little-endian representation.
type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// Tag written at offset 0 of every virtual page to give it a role.
///
/// The first two words are the tag proper; the magic number is what tells a
/// written type word apart from leftover data or a torn write. The third word
/// carries the record id high-water mark so that ids stay unique across
/// restarts even after the records that held the largest ids are reclaimed.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct PageTag {
    /// Magic number (`EXPECTED_MAGIC`).
    pub magic: U32LE,
    /// One of the `PageKind` values.
    pub page_type: U32LE,
    /// No record id below this value may be allocated again.
    pub id_floor: U32LE,
}

impl PageTag {
    /// Bits we expect to find in the `magic` field.
    pub const EXPECTED_MAGIC: u32 = 0xDEAD_C0DE;
    /// Size of the tag in bytes.
    pub const SIZE: usize = size_of::<Self>();
    /// Size of the tag in words; records start right after it.
    pub const WORDS: u32 = (Self::SIZE / WORD_SIZE) as u32;
    /// Word offset of the type word, which is rewritten when a swap page is
    /// promoted.
    pub const TYPE_WORD: u32 = 1;

    pub fn new(kind: PageKind, id_floor: u32) -> Self {
        Self {
            magic: Self::EXPECTED_MAGIC.into(),
            page_type: (kind as u32).into(),
            id_floor: id_floor.into(),
        }
    }

    /// Parses the role out of the tag, if the tag is intact.
    pub fn kind(&self) -> Option<PageKind> {
        if self.magic.get() != Self::EXPECTED_MAGIC {
            return None;
        }
        PageKind::from_u32(self.page_type.get())
    }

    /// Checks whether the tag area has never been programmed.
    pub fn is_erased(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0xFF)
    }
}

/// Values for the `PageTag::page_type` word.
///
/// `Data` differs from `Swap` only by a cleared bit, so a swap page can be
/// promoted in place without an erase.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[repr(u32)]
pub enum PageKind {
    Data = 0xF11E_01FE,
    Swap = 0xF11E_01FF,
}

/// Role of a virtual page as found on media.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageType {
    Data,
    Swap,
    /// Tag and contents are all erased.
    Erased,
    /// Anything else: torn tag, wrong magic, or an erased tag over data.
    Undefined,
}

/// Record header, written in front of every record's payload.
///
/// Words 0 through 2 are written in one go at the start of a write. The
/// `state` word is left erased (`RecordState::Pending`) until the payload has
/// been written, and only then programmed to `Valid`. Deleting a record
/// programs it again to `Dirty`. Each step only clears bits.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct RecordHeader {
    /// Caller-chosen tag for the record.
    pub record_key: U16LE,
    /// Length of the payload, in words.
    pub length_words: U16LE,
    /// Caller-chosen grouping id.
    pub file_id: U16LE,
    /// CRC-16 over the other header fields and the payload.
    pub crc16: U16LE,
    /// Store-wide unique id.
    pub record_id: U32LE,
    /// See `RecordState`.
    pub state: U32LE,
}

impl RecordHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = size_of::<Self>();
    /// Size of the header in words.
    pub const WORDS: u32 = (Self::SIZE / WORD_SIZE) as u32;
    /// Number of words written by the first step of a record write.
    pub const BODY_WORDS: u32 = 3;
    /// Word offset of the state word within the header.
    pub const STATE_WORD: u32 = 3;

    /// Builds the header for a new record holding `data`, which must already
    /// be padded to whole words. The state is left erased.
    pub fn new(file_id: u16, record_key: u16, record_id: u32, data: &[u8]) -> Self {
        let mut header = Self {
            record_key: record_key.into(),
            length_words: (bytes_to_words(data.len()) as u16).into(),
            file_id: file_id.into(),
            crc16: 0.into(),
            record_id: record_id.into(),
            state: ERASED_WORD.into(),
        };
        header.crc16 = header.expected_crc(data).into();
        header
    }

    /// Compute the _expected_ CRC given the other header fields and `data`.
    pub fn expected_crc(&self, data: &[u8]) -> u16 {
        let algo = crc::Crc::<u16>::new(&crc::CRC_16_IBM_3740);
        let mut digest = algo.digest();
        digest.update(self.record_key.as_bytes());
        digest.update(self.length_words.as_bytes());
        digest.update(self.file_id.as_bytes());
        digest.update(self.record_id.as_bytes());
        digest.update(data);

        digest.finalize()
    }

    /// Checks if the CRC field correctly describes the header and `data`.
    pub fn crc_valid(&self, data: &[u8]) -> bool {
        self.crc16.get() == self.expected_crc(data)
    }

    pub fn state(&self) -> RecordState {
        // A flag write that was cut short leaves some bits set and some
        // cleared. Nothing reads such a record, so it counts as dirty.
        RecordState::from_u32(self.state.get()).unwrap_or(RecordState::Dirty)
    }

    /// Words occupied by the record including its header.
    pub fn total_words(&self) -> u32 {
        Self::WORDS + u32::from(self.length_words.get())
    }

    /// An erased first word means no record starts here.
    pub fn is_end_marker(&self) -> bool {
        self.record_key.get() == 0xFFFF && self.length_words.get() == 0xFFFF
    }

    /// Bytes written by the first step of a record write (everything but the
    /// state word).
    pub fn body_bytes(&self) -> &[u8] {
        &self.as_bytes()[..words_to_bytes(Self::BODY_WORDS)]
    }
}

/// Values for the `RecordHeader::state` word.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[repr(u32)]
pub enum RecordState {
    /// Header written, payload may be incomplete. Never read.
    Pending = 0xFFFF_FFFF,
    /// Payload complete.
    Valid = 0xA55A_5AA5,
    /// Deleted or superseded; space is reclaimed by GC.
    Dirty = 0x0000_0000,
}

impl RecordState {
    /// The word to program into a header to move it into this state.
    pub fn word_bytes(self) -> [u8; WORD_SIZE] {
        (self as u32).to_le_bytes()
    }
}

//////////////////////////////////////////////////////////////////////////////
// Flash device interface.

/// Trait describing the physical flash for the purposes of the record store.
///
/// Reads are synchronous, as they are for memory-mapped flash. Writes and
/// erases only _start_ the operation; the driver reports completion later,
/// by handing a `FlashEvent` to `Store::on_flash_event`. The store never has
/// more than one write or erase outstanding.
pub trait Flash {
    /// Error type for accesses the driver refuses outright.
    type Error: core::fmt::Debug;

    /// Number of words in one physical (erase unit) page.
    fn words_per_page(&self) -> u32;

    /// Number of physical pages the store may use.
    fn page_count(&self) -> u32;

    /// Reads `dest.len()` bytes starting `offset` words into physical page
    /// `page`. `offset` may run past the end of `page` into the following
    /// pages, for convenience.
    fn read(&self, page: u32, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error>;

    /// Starts programming `data`, a whole number of words, at `offset` words
    /// into `page`. As with `read`, the range may continue into the
    /// following pages.
    ///
    /// Programming can only clear bits. On a failed completion the target
    /// words may or may not have been written.
    fn begin_write(&mut self, page: u32, offset: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Starts erasing physical page `page`, setting every bit in it.
    fn begin_erase(&mut self, page: u32) -> Result<(), Self::Error>;
}

/// Kind of a flash operation, as echoed back in a completion.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashOp {
    Write,
    Erase,
}

/// How a flash operation ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashOutcome {
    Success,
    Failed,
    /// The driver gave up waiting for the hardware.
    TimedOut,
}

/// Completion notification for the single in-flight flash operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashEvent {
    pub op: FlashOp,
    pub outcome: FlashOutcome,
}

impl FlashEvent {
    pub fn success(op: FlashOp) -> Self {
        Self { op, outcome: FlashOutcome::Success }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Virtual page geometry.

/// Mapping from virtual pages onto physical pages.
///
/// A virtual page is `pages_per_virtual` physical pages in a row. Any
/// physical pages left over at the end of the device are not used.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    words_per_page: u32,
    pages_per_virtual: u32,
    virtual_pages: u32,
}

impl Geometry {
    /// Largest virtual page the header's length field can describe.
    pub const MAX_VIRTUAL_PAGE_WORDS: u32 = 0xFFFF;

    /// Builds a geometry, or returns `None` if the device can't hold at least
    /// two virtual pages with room for one single-word record each.
    pub fn new(words_per_page: u32, page_count: u32, pages_per_virtual: u32) -> Option<Self> {
        if pages_per_virtual == 0 {
            return None;
        }
        let virtual_pages = page_count / pages_per_virtual;
        let vpw = words_per_page.checked_mul(pages_per_virtual)?;

        if virtual_pages < 2
            || vpw > Self::MAX_VIRTUAL_PAGE_WORDS
            || vpw < PageTag::WORDS + RecordHeader::WORDS + 1
        {
            return None;
        }

        Some(Self {
            words_per_page,
            pages_per_virtual,
            virtual_pages,
        })
    }

    pub fn for_flash<F: Flash>(flash: &F, pages_per_virtual: u32) -> Option<Self> {
        Self::new(flash.words_per_page(), flash.page_count(), pages_per_virtual)
    }

    pub fn virtual_pages(&self) -> u32 {
        self.virtual_pages
    }

    pub fn pages_per_virtual(&self) -> u32 {
        self.pages_per_virtual
    }

    pub fn virtual_page_words(&self) -> u32 {
        self.words_per_page * self.pages_per_virtual
    }

    /// Words available for records in one virtual page.
    pub fn capacity_words(&self) -> u32 {
        self.virtual_page_words() - PageTag::WORDS
    }

    /// Largest payload a single record can carry.
    pub fn max_payload_words(&self) -> u32 {
        self.capacity_words() - RecordHeader::WORDS
    }

    /// Physical pages making up virtual page `vpage`, tag page first.
    pub fn physical_pages(&self, vpage: u32) -> core::ops::Range<u32> {
        let first = vpage * self.pages_per_virtual;
        first..first + self.pages_per_virtual
    }

    /// Translates a word range inside a virtual page into a physical
    /// (page, offset) address. Returns `None` if the range leaves the page.
    pub fn physical(&self, vpage: u32, offset: u32, words: u32) -> Option<(u32, u32)> {
        let end = offset.checked_add(words)?;
        if vpage >= self.virtual_pages || end > self.virtual_page_words() {
            return None;
        }
        Some((vpage * self.pages_per_virtual, offset))
    }
}

//////////////////////////////////////////////////////////////////////////////
// Reading pages and records.

/// Things that can go wrong while reading the store's structures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadError<E> {
    /// The given virtual page or range does not exist, or the buffer is not a
    /// whole number of words.
    BadAddress(u32),
    Flash(E),
}

impl<E> From<E> for ReadError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

/// Reads `dest.len()` bytes starting `offset` words into virtual page
/// `vpage`.
pub fn read<F: Flash>(
    flash: &F,
    geo: &Geometry,
    vpage: u32,
    offset: u32,
    dest: &mut [u8],
) -> Result<(), ReadError<F::Error>> {
    if dest.len() % WORD_SIZE != 0 {
        return Err(ReadError::BadAddress(vpage));
    }
    let (page, offset) = geo.physical(vpage, offset, bytes_to_words(dest.len()))
        .ok_or(ReadError::BadAddress(vpage))?;
    flash.read(page, offset, dest)?;
    Ok(())
}

/// Checks whether everything in `vpage` from `offset` to the end is erased.
pub fn is_erased_from<F: Flash>(
    flash: &F,
    geo: &Geometry,
    vpage: u32,
    offset: u32,
) -> Result<bool, ReadError<F::Error>> {
    is_erased_range(flash, geo, vpage, offset, geo.virtual_page_words())
}

/// Checks whether words `offset..end` of `vpage` are all erased.
pub fn is_erased_range<F: Flash>(
    flash: &F,
    geo: &Geometry,
    vpage: u32,
    offset: u32,
    end: u32,
) -> Result<bool, ReadError<F::Error>> {
    const CHUNK_WORDS: u32 = 16;
    let mut buffer = [0u8; CHUNK_WORDS as usize * WORD_SIZE];

    let mut offset = offset;
    while offset < end {
        let n = u32::min(CHUNK_WORDS, end - offset);
        let chunk = &mut buffer[..words_to_bytes(n)];
        read(flash, geo, vpage, offset, chunk)?;
        if chunk.iter().any(|&b| b != 0xFF) {
            return Ok(false);
        }
        offset += n;
    }
    Ok(true)
}

/// What a page's tag says about it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageInfo {
    pub page_type: PageType,
    /// Id floor from the tag; zero for untagged pages.
    pub id_floor: u32,
    /// Whether anything past the tag has been programmed.
    pub has_records: bool,
}

/// Reads and classifies the tag of virtual page `vpage`.
pub fn read_page_info<F: Flash>(
    flash: &F,
    geo: &Geometry,
    vpage: u32,
) -> Result<PageInfo, ReadError<F::Error>> {
    let mut buffer = [0u8; PageTag::SIZE];
    read(flash, geo, vpage, 0, &mut buffer)?;
    let (tag, _) = cast_prefix::<PageTag>(&buffer);
    let tag = *tag;

    let has_records = !is_erased_from(flash, geo, vpage, PageTag::WORDS)?;

    let (page_type, id_floor) = if tag.is_erased() {
        if has_records {
            (PageType::Undefined, 0)
        } else {
            (PageType::Erased, 0)
        }
    } else {
        match tag.kind() {
            Some(PageKind::Data) => (PageType::Data, tag.id_floor.get()),
            Some(PageKind::Swap) => (PageType::Swap, tag.id_floor.get()),
            None => (PageType::Undefined, 0),
        }
    };

    Ok(PageInfo {
        page_type,
        id_floor,
        has_records,
    })
}

/// A record found while walking a page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RecordSlot {
    /// Word offset of the header within the virtual page.
    pub offset: u32,
    pub header: RecordHeader,
    /// Word offset just past the record, where the next header would be.
    pub next: u32,
}

/// Result of looking for a record header at some offset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Slot {
    Record(RecordSlot),
    /// Nothing written here; this is where the next record goes.
    End,
    /// A header is present but its length runs off the end of the page, or
    /// a header is partly programmed with its first word still erased. Its
    /// contents can't be trusted and nothing after it can be found.
    Torn,
}

/// Parses whatever sits at word `offset` of virtual page `vpage`.
pub fn next_record<F: Flash>(
    flash: &F,
    geo: &Geometry,
    vpage: u32,
    offset: u32,
) -> Result<Slot, ReadError<F::Error>> {
    let page_words = geo.virtual_page_words();
    if offset + RecordHeader::WORDS > page_words {
        return Ok(Slot::End);
    }

    let mut buffer = [0u8; RecordHeader::SIZE];
    read(flash, geo, vpage, offset, &mut buffer)?;
    let (header, _) = cast_prefix::<RecordHeader>(&buffer);

    if header.is_end_marker() {
        // Anything programmed behind an erased first word is left over from
        // a failed write and must not be written over.
        if buffer.iter().all(|&b| b == 0xFF) {
            return Ok(Slot::End);
        }
        return Ok(Slot::Torn);
    }

    let next = offset + header.total_words();
    if next > page_words {
        return Ok(Slot::Torn);
    }

    Ok(Slot::Record(RecordSlot {
        offset,
        header: *header,
        next,
    }))
}

/// Reads the payload of the record in `slot` into `out`, replacing its
/// contents.
pub fn read_payload<F: Flash>(
    flash: &F,
    geo: &Geometry,
    vpage: u32,
    slot: &RecordSlot,
    out: &mut Vec<u8>,
) -> Result<(), ReadError<F::Error>> {
    out.clear();
    out.resize(words_to_bytes(u32::from(slot.header.length_words.get())), 0);
    if !out.is_empty() {
        read(flash, geo, vpage, slot.offset + RecordHeader::WORDS, out)?;
    }
    Ok(())
}

/// Summary of the records in a page.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageScan {
    /// Word offset of the first unwritten word.
    pub write_offset: u32,
    /// Words held by records nobody can read any more.
    pub dirty_words: u32,
    pub valid_records: u32,
    pub dirty_records: u32,
    /// Valid records whose CRC did not match (only counted if requested).
    pub corrupt_records: u32,
    /// Largest record id found in a header, whatever the record's state, or
    /// zero.
    pub max_record_id: u32,
}

/// Walks every record in virtual page `vpage`.
///
/// If `check_crc` is set, the payload of each valid record is read and
/// checked; records that fail count as dirty, since nothing will ever return
/// them.
pub fn scan_page<F: Flash>(
    flash: &F,
    geo: &Geometry,
    vpage: u32,
    check_crc: bool,
) -> Result<PageScan, ReadError<F::Error>> {
    let mut scan = PageScan::default();
    let mut offset = PageTag::WORDS;
    let mut payload = Vec::new();

    loop {
        match next_record(flash, geo, vpage, offset)? {
            Slot::End => break,
            Slot::Torn => {
                let end = geo.virtual_page_words();
                scan.dirty_words += end - offset;
                scan.dirty_records += 1;
                offset = end;
                break;
            }
            Slot::Record(slot) => {
                let total = slot.header.total_words();
                // Programming only clears bits, so a programmed id word is
                // never below the id that was handed out for it.
                let id = slot.header.record_id.get();
                if id != ERASED_WORD {
                    scan.max_record_id = scan.max_record_id.max(id);
                }
                match slot.header.state() {
                    RecordState::Valid => {
                        let intact = if check_crc {
                            read_payload(flash, geo, vpage, &slot, &mut payload)?;
                            slot.header.crc_valid(&payload)
                        } else {
                            true
                        };
                        if intact {
                            scan.valid_records += 1;
                        } else {
                            scan.corrupt_records += 1;
                            scan.dirty_records += 1;
                            scan.dirty_words += total;
                        }
                    }
                    RecordState::Pending | RecordState::Dirty => {
                        scan.dirty_records += 1;
                        scan.dirty_words += total;
                    }
                }
                offset = slot.next;
            }
        }
    }

    scan.write_offset = offset;
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFlash;

    fn geo(flash: &SimFlash) -> Geometry {
        Geometry::for_flash(flash, 1).unwrap()
    }

    fn program(flash: &mut SimFlash, page: u32, offset: u32, data: &[u8]) {
        flash.begin_write(page, offset, data).unwrap();
        flash.complete().expect("write should be pending");
    }

    #[test]
    fn header_layout_matches_word_format() {
        let data = pad_to_words(&[1, 2, 3, 4, 5]);
        let header = RecordHeader::new(0x1234, 0xABCD, 0xDEAD_BEEF, &data);
        let bytes = header.as_bytes();

        assert_eq!(RecordHeader::WORDS, 4);
        assert_eq!(&bytes[0..4], &(0xABCD_u32 | 2 << 16).to_le_bytes());
        assert_eq!(&bytes[4..6], &0x1234_u16.to_le_bytes());
        assert_eq!(&bytes[8..12], &0xDEAD_BEEF_u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &[0xFF; 4]);
        assert_eq!(header.state(), RecordState::Pending);
    }

    #[test]
    fn crc_detects_payload_and_header_changes() {
        let data = pad_to_words(b"payload!");
        let header = RecordHeader::new(1, 2, 3, &data);
        assert!(header.crc_valid(&data));

        let mut bad = data.clone();
        bad[3] ^= 0x10;
        assert!(!header.crc_valid(&bad));

        let mut other = header;
        other.record_id = 4.into();
        assert!(!other.crc_valid(&data));
    }

    #[test]
    fn torn_state_word_reads_as_dirty() {
        let mut header = RecordHeader::new(1, 2, 3, &[]);
        header.state = 0xA55A_0000.into();
        assert_eq!(header.state(), RecordState::Dirty);
    }

    #[test]
    fn page_tag_promotion_only_clears_bits() {
        let swap = PageKind::Swap as u32;
        let data = PageKind::Data as u32;
        assert_eq!(swap & data, data);
    }

    #[test]
    fn geometry_rejects_tiny_devices() {
        assert!(Geometry::new(64, 1, 1).is_none());
        assert!(Geometry::new(4, 8, 1).is_none());
        assert!(Geometry::new(64, 4, 0).is_none());
        assert!(Geometry::new(0x8000, 4, 2).is_none());

        let geo = Geometry::new(64, 5, 2).unwrap();
        assert_eq!(geo.virtual_pages(), 2);
        assert_eq!(geo.virtual_page_words(), 128);
        assert_eq!(geo.physical_pages(1), 2..4);
        assert_eq!(geo.physical(1, 120, 8), Some((2, 120)));
        assert_eq!(geo.physical(1, 121, 8), None);
        assert_eq!(geo.physical(2, 0, 1), None);
    }

    #[test]
    fn classify_pages() {
        let mut flash = SimFlash::new(32, 4);
        let geo = geo(&flash);

        program(&mut flash, 0, 0, PageTag::new(PageKind::Data, 7).as_bytes());
        program(&mut flash, 1, 0, PageTag::new(PageKind::Swap, 9).as_bytes());
        // Page 2 stays erased. Page 3 gets junk past an erased tag.
        program(&mut flash, 3, 10, &[0; 4]);

        let info = read_page_info(&flash, &geo, 0).unwrap();
        assert_eq!(info, PageInfo { page_type: PageType::Data, id_floor: 7, has_records: false });
        let info = read_page_info(&flash, &geo, 1).unwrap();
        assert_eq!(info.page_type, PageType::Swap);
        assert_eq!(info.id_floor, 9);
        assert_eq!(read_page_info(&flash, &geo, 2).unwrap().page_type, PageType::Erased);
        assert_eq!(read_page_info(&flash, &geo, 3).unwrap().page_type, PageType::Undefined);
    }

    #[test]
    fn torn_tag_is_undefined() {
        let mut flash = SimFlash::new(32, 2);
        let geo = geo(&flash);
        // Magic made it out, type word did not.
        program(&mut flash, 0, 0, &PageTag::EXPECTED_MAGIC.to_le_bytes());
        assert_eq!(read_page_info(&flash, &geo, 0).unwrap().page_type, PageType::Undefined);
    }

    #[test]
    fn scan_counts_records_by_state() {
        let mut flash = SimFlash::new(64, 2);
        let geo = geo(&flash);
        program(&mut flash, 0, 0, PageTag::new(PageKind::Data, 1).as_bytes());

        let mut offset = PageTag::WORDS;
        for (id, state) in [
            (1, RecordState::Valid),
            (2, RecordState::Dirty),
            (3, RecordState::Pending),
        ] {
            let data = pad_to_words(&[id as u8; 8]);
            let header = RecordHeader::new(1, 1, id, &data);
            program(&mut flash, 0, offset, header.body_bytes());
            program(&mut flash, 0, offset + RecordHeader::WORDS, &data);
            if state != RecordState::Pending {
                program(&mut flash, 0, offset + RecordHeader::STATE_WORD, &RecordState::Valid.word_bytes());
            }
            if state == RecordState::Dirty {
                program(&mut flash, 0, offset + RecordHeader::STATE_WORD, &RecordState::Dirty.word_bytes());
            }
            offset += header.total_words();
        }

        let scan = scan_page(&flash, &geo, 0, true).unwrap();
        assert_eq!(scan.write_offset, offset);
        assert_eq!(scan.valid_records, 1);
        assert_eq!(scan.dirty_records, 2);
        assert_eq!(scan.dirty_words, 2 * (RecordHeader::WORDS + 2));
        // The pending record's id was handed out all the same.
        assert_eq!(scan.max_record_id, 3);
    }

    #[test]
    fn scan_treats_crc_failures_as_dirty() {
        let mut flash = SimFlash::new(64, 2);
        let geo = geo(&flash);
        program(&mut flash, 0, 0, PageTag::new(PageKind::Data, 1).as_bytes());

        let data = pad_to_words(b"abcd");
        let mut header = RecordHeader::new(1, 1, 5, &data);
        header.crc16 = (header.crc16.get() ^ 1).into();
        header.state = (RecordState::Valid as u32).into();
        program(&mut flash, 0, PageTag::WORDS, header.as_bytes());
        program(&mut flash, 0, PageTag::WORDS + RecordHeader::WORDS, &data);

        let scan = scan_page(&flash, &geo, 0, false).unwrap();
        assert_eq!(scan.valid_records, 1);
        let scan = scan_page(&flash, &geo, 0, true).unwrap();
        assert_eq!(scan.valid_records, 0);
        assert_eq!(scan.corrupt_records, 1);
        assert_eq!(scan.dirty_words, RecordHeader::WORDS + 1);
    }

    #[test]
    fn header_running_off_page_is_torn() {
        let mut flash = SimFlash::new(32, 2);
        let geo = geo(&flash);
        program(&mut flash, 0, 0, PageTag::new(PageKind::Data, 1).as_bytes());
        let mut header = RecordHeader::new(1, 1, 1, &[]);
        header.length_words = 500.into();
        program(&mut flash, 0, PageTag::WORDS, header.body_bytes());

        assert_eq!(next_record(&flash, &geo, 0, PageTag::WORDS).unwrap(), Slot::Torn);
        let scan = scan_page(&flash, &geo, 0, false).unwrap();
        assert_eq!(scan.write_offset, 32);
        assert_eq!(scan.dirty_words, 32 - PageTag::WORDS);
    }

    #[test]
    fn header_with_erased_first_word_is_torn() {
        let mut flash = SimFlash::new(32, 2);
        let geo = geo(&flash);
        program(&mut flash, 0, 0, PageTag::new(PageKind::Data, 1).as_bytes());
        let header = RecordHeader::new(1, 1, 4, &[]);
        // Words 1 and 2 of the header landed, word 0 didn't.
        program(&mut flash, 0, PageTag::WORDS + 1, &header.body_bytes()[4..]);

        assert_eq!(next_record(&flash, &geo, 0, PageTag::WORDS).unwrap(), Slot::Torn);
        let scan = scan_page(&flash, &geo, 0, false).unwrap();
        assert_eq!(scan.write_offset, 32);
        assert_eq!(scan.dirty_records, 1);

        // A header that is erased all the way through is the end.
        assert_eq!(next_record(&flash, &geo, 1, PageTag::WORDS).unwrap(), Slot::End);
    }

    #[test]
    fn reads_outside_page_are_rejected() {
        let flash = SimFlash::new(32, 2);
        let geo = geo(&flash);
        let mut buffer = [0u8; 8];
        assert_eq!(read(&flash, &geo, 0, 31, &mut buffer), Err(ReadError::BadAddress(0)));
        assert_eq!(read(&flash, &geo, 2, 0, &mut buffer), Err(ReadError::BadAddress(2)));
        let mut odd = [0u8; 3];
        assert_eq!(read(&flash, &geo, 0, 0, &mut odd), Err(ReadError::BadAddress(0)));
    }
}
