//! Positions in the change stream.
//!
//! An [`Lsn`] is a Postgres log sequence number. A [`Sequence`] pairs the
//! LSN of a commit with an index into the changes of that commit, which is
//! enough to identify a single change uniquely and to order all changes
//! totally. Sequences have a canonical string form `lsnHi.lsnLo.index`,
//! each part in lowercase hex, used in the HTTP API.

use std::fmt;

use crate::error::{Error, Result};

/// A Postgres log sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Parse the Postgres textual form, e.g. "16/B374D848".
    pub fn parse(s: &str) -> Result<Lsn> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidSequence(s.to_string()))?;
        let hi =
            u64::from_str_radix(hi, 16).map_err(|_| Error::InvalidSequence(s.to_string()))?;
        let lo =
            u64::from_str_radix(lo, 16).map_err(|_| Error::InvalidSequence(s.to_string()))?;
        Ok(Lsn((hi << 32) | lo))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }
}

/// A unique position in the list of changes: the commit LSN plus an index
/// into the changes of that commit. Ordering is lexicographic, LSN first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence {
    pub lsn: u64,
    pub index: u32,
}

impl Sequence {
    pub fn new(lsn: u64, index: u32) -> Sequence {
        Sequence { lsn, index }
    }

    /// True for the zero value, which is used as the "nothing yet" sentinel
    /// by the tracker and the HTTP layer. Real sequences are always nonzero.
    pub fn is_zero(&self) -> bool {
        self.lsn == 0 && self.index == 0
    }

    /// Parse the canonical `lsnHi.lsnLo.index` hex form.
    pub fn parse(s: &str) -> Result<Sequence> {
        let mut parts = s.split('.');
        let mut next = |name: &str| -> Result<u64> {
            let p = parts
                .next()
                .ok_or_else(|| Error::InvalidSequence(format!("{s}: missing {name}")))?;
            u64::from_str_radix(p, 16).map_err(|_| Error::InvalidSequence(s.to_string()))
        };
        let hi = next("lsn high")?;
        let lo = next("lsn low")?;
        let ix = next("index")?;
        if parts.next().is_some() || hi > u32::MAX as u64 || lo > u32::MAX as u64 || ix > u32::MAX as u64
        {
            return Err(Error::InvalidSequence(s.to_string()));
        }
        Ok(Sequence {
            lsn: (hi << 32) | lo,
            index: ix as u32,
        })
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}.{:x}.{:x}",
            self.lsn >> 32,
            self.lsn & 0xffff_ffff,
            self.index
        )
    }
}
