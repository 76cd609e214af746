// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-RAM accounting of every virtual page, and space reservations.
//!
//! Space for a record is set aside on one particular page when the request is
//! accepted, so that the write can't run out of room later when it is finally
//! executed. Reservations can also be taken out ahead of time by callers, as
//! `Reservation` tokens.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::Error;
use crate::low_level::{Geometry, PageScan, PageTag, RecordHeader};

/// Role of a page as far as the running store is concerned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Data,
    Swap,
    /// A GC source whose live records now sit in the old swap page, waiting
    /// for (or undergoing) erase. Not readable.
    Erasing,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageState {
    pub role: Role,
    /// First unwritten word.
    pub write_offset: u32,
    /// Words set aside for writes that haven't started yet.
    pub reserved_words: u32,
    /// Words no reader will ever see again, including writes in progress.
    pub dirty_words: u32,
    pub valid_records: u32,
    pub dirty_records: u32,
}

impl PageState {
    fn empty(role: Role) -> Self {
        Self {
            role,
            write_offset: PageTag::WORDS,
            reserved_words: 0,
            dirty_words: 0,
            valid_records: 0,
            dirty_records: 0,
        }
    }
}

/// Space set aside on one data page.
///
/// Hand it to `Store::write_reserved` or `Store::update_reserved`, or give it
/// back with `Store::cancel_reservation`. Dropping it leaks the words until the
/// store is initialized again.
#[must_use]
#[derive(Debug, Eq, PartialEq)]
pub struct Reservation {
    pub(crate) page: u32,
    pub(crate) words: u32,
}

impl Reservation {
    /// Largest payload, in words, a write using this reservation may carry.
    pub fn payload_words(&self) -> u32 {
        self.words - RecordHeader::WORDS
    }
}

pub(crate) struct PageBook {
    pages: Vec<PageState>,
    page_words: u32,
    /// Reservations handed out to callers and not yet returned or used.
    tokens_out: u32,
}

impl PageBook {
    /// A book where every page is a swap page with nothing in it. Filled in
    /// by `adopt` during mount.
    pub fn new(geo: &Geometry) -> Self {
        Self {
            pages: vec![PageState::empty(Role::Swap); geo.virtual_pages() as usize],
            page_words: geo.virtual_page_words(),
            tokens_out: 0,
        }
    }

    pub fn page(&self, page: u32) -> &PageState {
        &self.pages[page as usize]
    }

    pub fn pages(&self) -> impl Iterator<Item = (u32, &PageState)> + '_ {
        self.pages.iter().enumerate().map(|(i, p)| (i as u32, p))
    }

    pub fn tokens_out(&self) -> u32 {
        self.tokens_out
    }

    /// Records the result of scanning a data page.
    pub fn adopt(&mut self, page: u32, scan: &PageScan) {
        self.pages[page as usize] = PageState {
            role: Role::Data,
            write_offset: scan.write_offset,
            reserved_words: 0,
            dirty_words: scan.dirty_words,
            valid_records: scan.valid_records,
            dirty_records: scan.dirty_records,
        };
    }

    pub fn set_swap(&mut self, page: u32) {
        self.pages[page as usize] = PageState::empty(Role::Swap);
    }

    pub fn set_erasing(&mut self, page: u32) {
        let p = &mut self.pages[page as usize];
        debug_assert_eq!(p.reserved_words, 0);
        p.role = Role::Erasing;
    }

    fn free_on(&self, p: &PageState) -> u32 {
        if p.role != Role::Data {
            return 0;
        }
        self.page_words - p.write_offset - p.reserved_words
    }

    /// Words neither written nor reserved, over all data pages.
    pub fn free_words(&self) -> u32 {
        self.pages.iter().map(|p| self.free_on(p)).sum()
    }

    /// Largest run of free words on any one data page.
    pub fn largest_contig(&self) -> u32 {
        self.pages.iter().map(|p| self.free_on(p)).max().unwrap_or(0)
    }

    pub fn reserved_words(&self) -> u32 {
        self.pages.iter().map(|p| p.reserved_words).sum()
    }

    /// Words written on data pages, tags excluded.
    pub fn used_words(&self) -> u32 {
        self.pages.iter()
            .filter(|p| p.role == Role::Data)
            .map(|p| p.write_offset - PageTag::WORDS)
            .sum()
    }

    pub fn dirty_words(&self) -> u32 {
        self.pages.iter()
            .filter(|p| p.role == Role::Data)
            .map(|p| p.dirty_words)
            .sum()
    }

    /// Sets aside room for a record of `total_words` (header included) on
    /// the first data page where it fits.
    pub fn reserve(&mut self, total_words: u32) -> Result<Reservation, Error> {
        let page = (0..self.pages.len())
            .find(|&i| self.free_on(&self.pages[i]) >= total_words)
            .ok_or(Error::NoSpaceInFlash)?;
        self.pages[page].reserved_words += total_words;
        Ok(Reservation {
            page: page as u32,
            words: total_words,
        })
    }

    /// Like `reserve`, for a token that leaves the store.
    pub fn reserve_token(&mut self, total_words: u32) -> Result<Reservation, Error> {
        let r = self.reserve(total_words)?;
        self.tokens_out += 1;
        Ok(r)
    }

    /// A caller's token came back: its words stay set aside for the write
    /// that consumes it, or are released separately.
    pub fn redeem(&mut self) {
        debug_assert!(self.tokens_out > 0);
        self.tokens_out = self.tokens_out.saturating_sub(1);
    }

    /// Gives words set aside by `r` back to the page.
    pub fn release(&mut self, r: Reservation) {
        let p = &mut self.pages[r.page as usize];
        p.reserved_words = p.reserved_words.saturating_sub(r.words);
    }

    /// Accounts for the header of a record of `total_words` going out under
    /// reservation `r`. Surplus reserved words are released. The new record
    /// counts as dirty until it is finalized. Returns the record's offset.
    pub fn begin_record(&mut self, r: &Reservation, total_words: u32) -> u32 {
        let p = &mut self.pages[r.page as usize];
        debug_assert!(total_words <= r.words);
        let offset = p.write_offset;
        p.reserved_words = p.reserved_words.saturating_sub(r.words);
        p.write_offset += total_words;
        p.dirty_words += total_words;
        p.dirty_records += 1;
        offset
    }

    /// Undoes `begin_record` for the last record on `page`, which never made
    /// it to flash.
    pub fn unwind_record(&mut self, page: u32, offset: u32, total_words: u32) {
        let p = &mut self.pages[page as usize];
        debug_assert_eq!(p.write_offset, offset + total_words);
        p.write_offset = offset;
        p.dirty_words -= total_words;
        p.dirty_records -= 1;
    }

    /// A record begun with `begin_record` is now valid.
    pub fn finalize_record(&mut self, page: u32, total_words: u32) {
        let p = &mut self.pages[page as usize];
        p.dirty_words -= total_words;
        p.dirty_records -= 1;
        p.valid_records += 1;
    }

    /// A valid record was flagged dirty.
    pub fn dirty_record(&mut self, page: u32, total_words: u32) {
        let p = &mut self.pages[page as usize];
        p.dirty_words += total_words;
        p.dirty_records += 1;
        p.valid_records = p.valid_records.saturating_sub(1);
    }
}
