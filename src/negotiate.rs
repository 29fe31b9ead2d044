//! Pure option negotiation, separated from the session so it can be unit
//! tested without a socket, a timer, or a backend: given the options a
//! peer requested and the locally configured bounds, decide what subset
//! (if any) gets echoed back in an OACK.

use crate::options::{TftpOption, MAX_BLOCKSIZE, MIN_BLOCKSIZE, MIN_TIMEOUT};
use std::time::Duration;

pub const DEFAULT_BLOCKSIZE: u16 = 512;

/// Locally configured bounds a request's options are validated against.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub max_blksize: u16,
    pub default_timeout: Duration,
}

/// The result of negotiating one request's options.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Final transfer block size, whether or not `blksize` was requested.
    pub blksize: u16,
    /// Final per-attempt retransmit timeout, whether or not `timeout` was requested.
    pub timeout: Duration,
    /// The options to echo back in an OACK. Empty means "send no OACK".
    pub accepted: Vec<TftpOption>,
}

/// Negotiates a request's options against `bounds`.
///
/// `reader_size` is the RRQ file's length, if known; it is only consulted
/// when the request carries `tsize` and `is_read` is true, in which case
/// the accepted `tsize` echoes the real length rather than the client's
/// (advisory) query value. For a WRQ, a requested `tsize` is echoed back
/// unchanged -- it is informational only, per RFC 2349.
pub fn negotiate(requested: &[TftpOption], bounds: &Bounds, is_read: bool, reader_size: Option<u64>) -> Negotiated {
    let mut blksize = DEFAULT_BLOCKSIZE;
    let mut timeout = bounds.default_timeout;
    let mut accepted = Vec::with_capacity(requested.len());

    for opt in requested {
        match *opt {
            TftpOption::Blocksize(requested_size) => {
                if requested_size < MIN_BLOCKSIZE {
                    continue;
                }
                blksize = requested_size.min(bounds.max_blksize).min(MAX_BLOCKSIZE);
                accepted.push(TftpOption::Blocksize(blksize));
            }
            TftpOption::Timeout(secs) => {
                if secs < MIN_TIMEOUT {
                    continue;
                }
                timeout = Duration::from_secs(u64::from(secs));
                accepted.push(TftpOption::Timeout(secs));
            }
            TftpOption::TransferSize(requested_tsize) => {
                if is_read {
                    if let Some(actual) = reader_size {
                        accepted.push(TftpOption::TransferSize(actual));
                    }
                    // size unknown: tsize is dropped from the OACK entirely
                } else {
                    accepted.push(TftpOption::TransferSize(requested_tsize));
                }
            }
        }
    }

    Negotiated {
        blksize,
        timeout,
        accepted,
    }
}
