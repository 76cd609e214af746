// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A record store for raw NOR-style flash.
//!
//! Records are small binary payloads tagged with a file id and a record key,
//! appended to fixed-size pages that can only be written once per erase.
//! Deleting or replacing a record marks the old copy dirty; garbage
//! collection copies the live records of a page into a spare (swap) page and
//! erases the original.
//!
//! Flash writes and erases are asynchronous. Every mutating request is queued
//! and acknowledged by an `Event` delivered to subscribers once it finishes;
//! the integrator forwards flash completions with `Store::on_flash_event`,
//! which is what moves everything along. Exactly one flash operation is ever
//! outstanding.
//!
//! Power can be lost at any point. Records are written header first, with the
//! state word left erased, and only marked valid once their payload is in
//! place; `init` repairs anything a garbage collection cycle left half done.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod event;
pub mod find;
mod gc;
pub mod low_level;
mod queue;
pub mod reserve;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod store;


pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::event::{Event, EventKind, Handler, SubscriberId};
pub use crate::find::{Filter, FindToken, OpenRecord, RecordDesc, RecordInfo};
pub use crate::low_level::{Flash, FlashEvent, FlashOp, FlashOutcome};
pub use crate::reserve::Reservation;
pub use crate::store::{Refused, Stat, Store, INVALID_FILE_ID, INVALID_RECORD_KEY};
