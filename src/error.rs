// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error codes reported by the store.
//!
//! The same type is used for requests refused at submission time and for
//! results carried by completion events. Refused requests have no side
//! effects.

use core::fmt;

use crate::low_level::ReadError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Not enough free words on any data page; GC may help.
    NoSpaceInFlash,
    /// The operation queue is full.
    NoSpaceInQueues,
    /// A reserved id or key, an out-of-range value, or a payload that does
    /// not fit its reservation.
    InvalidParam,
    /// A null descriptor (record id zero) was given where a record is needed.
    NullArg,
    NotInitialized,
    /// The request conflicts with a reservation or GC already under way.
    Busy,
    /// Subscriber table is full.
    UserLimitReached,
    /// Payload exceeds what fits in a single virtual page.
    RecordTooLarge,
    CrcCheckFailed,
    NotFound,
    /// The record or page is held open by a reader.
    NoOpenRecords,
    /// The flash driver kept reporting timeouts.
    OperationTimeout,
    /// An address outside the store's pages, or a misaligned length.
    UnalignedAddr,
    /// Flash failures past the retry budget, or an on-media state that can't
    /// be recovered.
    Internal,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoSpaceInFlash => "no space in flash",
            Self::NoSpaceInQueues => "operation queue full",
            Self::InvalidParam => "invalid parameter",
            Self::NullArg => "null record descriptor",
            Self::NotInitialized => "store not initialized",
            Self::Busy => "store busy",
            Self::UserLimitReached => "too many subscribers",
            Self::RecordTooLarge => "record too large",
            Self::CrcCheckFailed => "CRC check failed",
            Self::NotFound => "record not found",
            Self::NoOpenRecords => "record is open",
            Self::OperationTimeout => "flash operation timed out",
            Self::UnalignedAddr => "unaligned or out-of-range address",
            Self::Internal => "internal error",
        };
        f.write_str(s)
    }
}

impl<E: fmt::Debug> From<ReadError<E>> for Error {
    fn from(e: ReadError<E>) -> Self {
        match e {
            ReadError::BadAddress(page) => {
                log::error!("read outside store, virtual page {}", page);
                Self::UnalignedAddr
            }
            ReadError::Flash(e) => {
                log::error!("flash read failed: {:?}", e);
                Self::Internal
            }
        }
    }
}
