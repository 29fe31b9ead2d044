use std::io::{self, Write};

pub const MIN_BLOCKSIZE: u16 = 8;
pub const MAX_BLOCKSIZE: u16 = 65_464;
pub const MIN_TIMEOUT: u8 = 1;

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum TftpOption {
    Blocksize(u16),
    TransferSize(u64),
    Timeout(u8),
}

impl TftpOption {
    /// Stable identifier for an option's *kind*, independent of its value.
    /// Used to detect a request carrying the same option name twice.
    pub fn ident(&self) -> &'static str {
        use self::TftpOption::*;
        match *self {
            Blocksize(_) => "blksize",
            TransferSize(_) => "tsize",
            Timeout(_) => "timeout",
        }
    }

    pub fn write_to(&self, buf: &mut impl Write) -> io::Result<()> {
        use self::TftpOption::*;
        match *self {
            Blocksize(size) => {
                write!(buf, "blksize\0{}\0", size)?;
            }
            TransferSize(size) => {
                write!(buf, "tsize\0{}\0", size)?;
            }
            Timeout(t) => {
                write!(buf, "timeout\0{}\0", t)?;
            }
        };
        Ok(())
    }

    /// Parses a single name/value pair. Returns `None` for an unrecognized
    /// name or a value that fails to parse as an integer -- bounds
    /// (blksize 8..=65464, timeout 1..=255) are enforced later, by the
    /// negotiator, not here: this is just wire deserialization.
    pub fn try_from(name: &str, value: &str) -> Option<Self> {
        if "blksize".eq_ignore_ascii_case(name) {
            let val = value.parse::<u16>().ok()?;
            return Some(TftpOption::Blocksize(val));
        } else if "timeout".eq_ignore_ascii_case(name) {
            let val = value.parse().ok()?;
            return Some(TftpOption::Timeout(val));
        } else if "tsize".eq_ignore_ascii_case(name) {
            let val = value.parse().ok()?;
            return Some(TftpOption::TransferSize(val));
        }
        None
    }
}
