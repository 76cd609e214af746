// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RAM-backed flash simulator for tests and host tools.
//!
//! Writes and erases are accepted by `begin_write`/`begin_erase` but only take
//! effect when the test calls `complete`, which hands back the `FlashEvent`
//! the driver would have delivered. In between, a test can cut the power,
//! which throws the pending operation away (or applies part of it) and
//! leaves the array as a real device would find it on the next boot.
//!
//! Programming follows NOR rules: it can only clear bits. An attempt to set a
//! bit without an erase is a bug in the store and panics.

use alloc::vec;
use alloc::vec::Vec;

use crate::low_level::{words_to_bytes, Flash, FlashEvent, FlashOp, FlashOutcome, WORD_SIZE};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimError {
    /// A write or erase was started while another was in flight.
    Busy,
    OutOfRange,
    /// Injected with `reject_next`.
    Rejected,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Pending {
    Write { byte_offset: usize, data: Vec<u8> },
    Erase { page: u32 },
}

#[derive(Clone, Debug)]
pub struct SimFlash {
    words_per_page: u32,
    page_count: u32,
    cells: Vec<u8>,
    pending: Option<Pending>,
    fail_next: u32,
    time_out_next: u32,
    reject_next: u32,
    /// Count of completed writes, for tests that care about wear.
    pub writes: u32,
    /// Count of completed erases.
    pub erases: u32,
}

impl SimFlash {
    /// Creates a fully erased device.
    pub fn new(words_per_page: u32, page_count: u32) -> Self {
        Self {
            words_per_page,
            page_count,
            cells: vec![0xFF; words_to_bytes(words_per_page * page_count)],
            pending: None,
            fail_next: 0,
            time_out_next: 0,
            reject_next: 0,
            writes: 0,
            erases: 0,
        }
    }

    /// Builds a device from an existing image, such as one loaded from a
    /// file. The image length must be a whole number of pages.
    pub fn from_image(words_per_page: u32, image: Vec<u8>) -> Option<Self> {
        let page_bytes = words_to_bytes(words_per_page);
        if page_bytes == 0 || image.len() % page_bytes != 0 {
            return None;
        }
        let mut flash = Self::new(words_per_page, 0);
        flash.page_count = (image.len() / page_bytes) as u32;
        flash.cells = image;
        Some(flash)
    }

    /// The whole array, page 0 first.
    pub fn image(&self) -> &[u8] {
        &self.cells
    }

    /// Contents of one physical page.
    pub fn page(&self, page: u32) -> &[u8] {
        let start = words_to_bytes(page * self.words_per_page);
        &self.cells[start..start + words_to_bytes(self.words_per_page)]
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Makes the next `n` completions report failure without touching the
    /// array.
    pub fn fail_next(&mut self, n: u32) {
        self.fail_next = n;
    }

    /// Like `fail_next`, but reports timeouts.
    pub fn time_out_next(&mut self, n: u32) {
        self.time_out_next = n;
    }

    /// Makes the next `n` calls to `begin_write`/`begin_erase` fail outright.
    pub fn reject_next(&mut self, n: u32) {
        self.reject_next = n;
    }

    /// Finishes the pending operation, if any, and returns the completion to
    /// be handed to the store.
    pub fn complete(&mut self) -> Option<FlashEvent> {
        let pending = self.pending.take()?;
        let op = match pending {
            Pending::Write { .. } => FlashOp::Write,
            Pending::Erase { .. } => FlashOp::Erase,
        };

        if self.time_out_next > 0 {
            self.time_out_next -= 1;
            return Some(FlashEvent { op, outcome: FlashOutcome::TimedOut });
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Some(FlashEvent { op, outcome: FlashOutcome::Failed });
        }

        self.apply(pending, usize::MAX);
        Some(FlashEvent::success(op))
    }

    /// Simulates losing power with an operation in flight: the operation is
    /// dropped and has no effect.
    pub fn power_cut(&mut self) {
        self.pending = None;
    }

    /// Simulates losing power part way through a pending write: only its
    /// first `words` words make it to the array. An erase is dropped.
    pub fn power_cut_torn(&mut self, words: u32) {
        if let Some(pending) = self.pending.take() {
            if let Pending::Write { .. } = pending {
                self.apply(pending, words_to_bytes(words));
            }
        }
    }

    /// Flips bits in place, bypassing programming rules. For corrupting
    /// records in tests.
    pub fn corrupt(&mut self, page: u32, offset: u32, xor: u8) {
        self.cells[words_to_bytes(page * self.words_per_page + offset)] ^= xor;
    }

    fn apply(&mut self, pending: Pending, limit: usize) {
        match pending {
            Pending::Write { byte_offset, data } => {
                let n = usize::min(data.len(), limit);
                let target = &mut self.cells[byte_offset..byte_offset + n];
                for (i, (cell, &new)) in target.iter_mut().zip(&data[..n]).enumerate() {
                    if *cell & new != new {
                        panic!(
                            "attempt to set bits at word {} (have {:#04x}, want {:#04x})",
                            (byte_offset + i) / WORD_SIZE,
                            *cell,
                            new,
                        );
                    }
                    *cell = new;
                }
                self.writes += 1;
            }
            Pending::Erase { page } => {
                let start = words_to_bytes(page * self.words_per_page);
                self.cells[start..start + words_to_bytes(self.words_per_page)].fill(0xFF);
                self.erases += 1;
            }
        }
    }

    fn check_range(&self, page: u32, offset: u32, len: usize) -> Result<usize, SimError> {
        if page >= self.page_count || len % WORD_SIZE != 0 {
            return Err(SimError::OutOfRange);
        }
        let start = words_to_bytes(page * self.words_per_page + offset);
        if start + len > self.cells.len() {
            return Err(SimError::OutOfRange);
        }
        Ok(start)
    }

    fn start(&mut self, pending: Pending) -> Result<(), SimError> {
        if self.pending.is_some() {
            return Err(SimError::Busy);
        }
        if self.reject_next > 0 {
            self.reject_next -= 1;
            return Err(SimError::Rejected);
        }
        self.pending = Some(pending);
        Ok(())
    }
}

impl Flash for SimFlash {
    type Error = SimError;

    fn words_per_page(&self) -> u32 {
        self.words_per_page
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn read(&self, page: u32, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let start = self.check_range(page, offset, dest.len())?;
        dest.copy_from_slice(&self.cells[start..start + dest.len()]);
        Ok(())
    }

    fn begin_write(&mut self, page: u32, offset: u32, data: &[u8]) -> Result<(), Self::Error> {
        let byte_offset = self.check_range(page, offset, data.len())?;
        self.start(Pending::Write { byte_offset, data: data.to_vec() })
    }

    fn begin_erase(&mut self, page: u32) -> Result<(), Self::Error> {
        self.check_range(page, 0, 0)?;
        self.start(Pending::Erase { page })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_land_on_completion() {
        let mut flash = SimFlash::new(8, 2);
        flash.begin_write(1, 2, &[1, 2, 3, 4]).unwrap();
        assert_eq!(flash.page(1)[8..12], [0xFF; 4]);
        assert_eq!(flash.begin_erase(0), Err(SimError::Busy));

        assert_eq!(flash.complete(), Some(FlashEvent::success(FlashOp::Write)));
        assert_eq!(flash.page(1)[8..12], [1, 2, 3, 4]);
        assert_eq!(flash.complete(), None);
    }

    #[test]
    fn writes_may_span_pages() {
        let mut flash = SimFlash::new(2, 2);
        flash.begin_write(0, 1, &[0; 8]).unwrap();
        flash.complete();
        let mut buffer = [0xAA; 8];
        flash.read(0, 1, &mut buffer).unwrap();
        assert_eq!(buffer, [0; 8]);
        assert_eq!(flash.page(1)[..4], [0; 4]);
    }

    #[test]
    #[should_panic(expected = "attempt to set bits")]
    fn setting_bits_panics() {
        let mut flash = SimFlash::new(8, 1);
        flash.begin_write(0, 0, &[0x0F, 0, 0, 0]).unwrap();
        flash.complete();
        flash.begin_write(0, 0, &[0xF0, 0, 0, 0]).unwrap();
        flash.complete();
    }

    #[test]
    fn injected_faults() {
        let mut flash = SimFlash::new(8, 1);
        flash.fail_next(1);
        flash.time_out_next(1);
        flash.begin_write(0, 0, &[0; 4]).unwrap();
        assert_eq!(flash.complete().unwrap().outcome, FlashOutcome::TimedOut);
        flash.begin_write(0, 0, &[0; 4]).unwrap();
        assert_eq!(flash.complete().unwrap().outcome, FlashOutcome::Failed);
        assert_eq!(flash.page(0)[..4], [0xFF; 4]);

        flash.reject_next(1);
        assert_eq!(flash.begin_erase(0), Err(SimError::Rejected));
        flash.begin_erase(0).unwrap();
        assert_eq!(flash.complete().unwrap().outcome, FlashOutcome::Success);
    }

    #[test]
    fn power_cuts() {
        let mut flash = SimFlash::new(8, 1);
        flash.begin_write(0, 0, &[0; 8]).unwrap();
        flash.power_cut();
        assert!(!flash.is_pending());
        assert_eq!(flash.page(0)[..8], [0xFF; 8]);

        flash.begin_write(0, 0, &[0; 8]).unwrap();
        flash.power_cut_torn(1);
        assert_eq!(flash.page(0)[..8], [0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn images_reload() {
        let mut flash = SimFlash::new(4, 3);
        flash.begin_write(2, 1, &[7; 4]).unwrap();
        flash.complete();

        let copy = SimFlash::from_image(4, flash.image().to_vec()).unwrap();
        assert_eq!(copy.page_count(), 3);
        assert_eq!(copy.page(2), flash.page(2));
        assert!(SimFlash::from_image(4, vec![0xFF; 17]).is_none());
    }
}
