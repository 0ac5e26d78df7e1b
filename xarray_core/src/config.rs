//! Construction-time policy for an XArray.

use crate::constants::*;
use crate::errors::Error;

/// Where node allocations may happen during a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Allocate while holding the writer lock.
    Direct,
    /// Never allocate under the lock; every node must be supplied by
    /// `XaState::nomem` after the lock is dropped.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XArrayConfig {
    chunk_shift: u8,
    tag_count: u8,
    alloc_mode: AllocMode,
}

impl Default for XArrayConfig {
    fn default() -> Self {
        Self {
            chunk_shift: DEFAULT_CHUNK_SHIFT,
            tag_count: DEFAULT_TAGS,
            alloc_mode: AllocMode::Direct,
        }
    }
}

impl XArrayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// log2 of the node fanout.
    pub fn chunk_shift(mut self, shift: u8) -> Self {
        self.chunk_shift = shift;
        self
    }

    pub fn tag_count(mut self, tags: u8) -> Self {
        self.tag_count = tags;
        self
    }

    pub fn alloc_mode(mut self, mode: AllocMode) -> Self {
        self.alloc_mode = mode;
        self
    }

    /// Defaults overridden by `XARRAY_CHUNK_SHIFT`, `XARRAY_TAGS` and
    /// `XARRAY_ALLOC` when they are set.
    pub fn from_env() -> Result<Self, Error> {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var(ENV_CHUNK_SHIFT) {
            cfg.chunk_shift = raw
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("{ENV_CHUNK_SHIFT}={raw}")))?;
        }
        if let Ok(raw) = std::env::var(ENV_TAGS) {
            cfg.tag_count = raw
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("{ENV_TAGS}={raw}")))?;
        }
        if let Ok(raw) = std::env::var(ENV_ALLOC) {
            cfg.alloc_mode = match raw.trim().to_ascii_lowercase().as_str() {
                "direct" => AllocMode::Direct,
                "deferred" => AllocMode::Deferred,
                _ => return Err(Error::InvalidConfig(format!("{ENV_ALLOC}={raw}"))),
            };
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_CHUNK_SHIFT..=MAX_CHUNK_SHIFT).contains(&self.chunk_shift) {
            return Err(Error::InvalidConfig(format!(
                "chunk shift {} outside {}..={}",
                self.chunk_shift, MIN_CHUNK_SHIFT, MAX_CHUNK_SHIFT
            )));
        }
        if self.tag_count == 0 || self.tag_count as usize > MAX_TAGS {
            return Err(Error::InvalidConfig(format!(
                "tag count {} outside 1..={}",
                self.tag_count, MAX_TAGS
            )));
        }
        Ok(())
    }

    pub fn get_chunk_shift(&self) -> u8 {
        self.chunk_shift
    }

    pub fn get_tag_count(&self) -> u8 {
        self.tag_count
    }

    pub fn get_alloc_mode(&self) -> AllocMode {
        self.alloc_mode
    }
}
