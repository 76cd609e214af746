// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Completion events and the subscriber table.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::Error;

/// Which kind of operation an event reports on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    Init,
    Write,
    Update,
    DelRecord,
    DelFile,
    Gc,
}

/// Exactly one of these is delivered for every operation that was accepted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub result: Result<(), Error>,
    /// Zero where the operation has no file.
    pub file_id: u16,
    /// Zero where the operation has no record key.
    pub record_key: u16,
    /// Zero where the operation has no record.
    pub record_id: u32,
}

impl Event {
    pub(crate) fn bare(kind: EventKind, result: Result<(), Error>) -> Self {
        Self {
            kind,
            result,
            file_id: 0,
            record_key: 0,
            record_id: 0,
        }
    }
}

/// Event handler. Handlers run synchronously, inside whichever store call
/// finished the operation, and can't call back into the store.
pub type Handler = Box<dyn FnMut(&Event)>;

/// Returned by `subscribe`, for `unsubscribe`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubscriberId(u32);

pub(crate) struct Subscribers {
    entries: Vec<(SubscriberId, Handler)>,
    next_id: u32,
    limit: usize,
}

impl Subscribers {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            limit,
        }
    }

    pub fn add(&mut self, handler: Handler) -> Result<SubscriberId, Error> {
        if self.entries.len() >= self.limit {
            return Err(Error::UserLimitReached);
        }
        let id = SubscriberId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.push((id, handler));
        Ok(id)
    }

    pub fn remove(&mut self, id: SubscriberId) -> Result<(), Error> {
        let index = self.entries.iter()
            .position(|(i, _)| *i == id)
            .ok_or(Error::NotFound)?;
        // Keep the rest in registration order.
        self.entries.remove(index);
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn dispatch(&mut self, event: &Event) {
        for (_, handler) in &mut self.entries {
            handler(event);
        }
    }
}
