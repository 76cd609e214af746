// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Store tunables.

use crate::error::Error;

/// Configuration consumed by `Store::new`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Physical pages per virtual page. Default 1.
    pub pages_per_virtual: u32,

    /// Operations that may wait behind the one in progress. Default 4.
    pub queue_size: usize,

    /// Size of the event subscriber table. Default 8.
    pub max_subscribers: usize,

    /// Verify the CRC of a record's payload when it is opened. Default true.
    pub crc_on_read: bool,

    /// Read each record back after writing it and check its CRC. Default
    /// false.
    pub verify_on_write: bool,

    /// How many times a failed flash operation is re-issued before the
    /// operation that issued it fails. Default 3.
    pub op_retries: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pages_per_virtual: 1,
            queue_size: 4,
            max_subscribers: 8,
            crc_on_read: true,
            verify_on_write: false,
            op_retries: 3,
        }
    }
}

impl Config {
    pub fn with_pages_per_virtual(mut self, pages: u32) -> Self {
        self.pages_per_virtual = pages;
        self
    }

    pub fn with_queue_size(mut self, entries: usize) -> Self {
        self.queue_size = entries;
        self
    }

    pub fn with_max_subscribers(mut self, n: usize) -> Self {
        self.max_subscribers = n;
        self
    }

    pub fn with_crc_on_read(mut self, on: bool) -> Self {
        self.crc_on_read = on;
        self
    }

    pub fn with_verify_on_write(mut self, on: bool) -> Self {
        self.verify_on_write = on;
        self
    }

    pub fn with_op_retries(mut self, n: u8) -> Self {
        self.op_retries = n;
        self
    }

    /// Rejects settings the store can't work with. Geometry is checked
    /// separately, against the flash device.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pages_per_virtual == 0 || self.queue_size == 0 {
            return Err(Error::InvalidParam);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.queue_size, 4);
        assert_eq!(c.max_subscribers, 8);
        assert_eq!(c.op_retries, 3);
        assert!(c.crc_on_read);
        assert!(!c.verify_on_write);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn builder_and_validation() {
        let c = Config::default().with_queue_size(0);
        assert_eq!(c.validate(), Err(Error::InvalidParam));

        let c = Config::default()
            .with_pages_per_virtual(2)
            .with_verify_on_write(true)
            .with_op_retries(0);
        assert_eq!(c.pages_per_virtual, 2);
        assert!(c.verify_on_write);
        assert!(c.validate().is_ok());
    }
}
