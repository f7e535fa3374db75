// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that engine code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.
//!
//! Two error domains exist. [`IoctlError`] covers failures of a driver entry
//! point as a whole -- these surface to the embedding program as the ioctl's
//! return value. [`DeliveryError`] covers failures of an individual send
//! while the ioctl itself keeps going -- these are routed back through the
//! thread's error slots as tagged records on a later read.

use ferry_abi::{Return, UsageError};

/// Failure of a driver entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IoctlError {
    /// A user-supplied pointer or length did not refer to accessible memory
    /// of the calling process.
    Fault,
    /// A non-blocking read found no work.
    WouldBlock,
    /// Argument outside the ioctl's domain (unknown request, bad size,
    /// oversize value).
    BadRequest,
    /// The context-manager slot is already occupied.
    Busy,
    /// A policy predicate refused the operation.
    Denied,
    /// The command stream contained a record the driver could not step
    /// over. Fatal for this ioctl; stream progress is reported up to the
    /// offending record.
    Stream(UsageError),
    /// The operation needs the shared mapping, which has not been set up.
    NoMapping,
    /// A second mapping was requested.
    AlreadyMapped,
}

impl From<UsageError> for IoctlError {
    fn from(e: UsageError) -> Self {
        Self::Stream(e)
    }
}

/// Failure of a single send, reported to the sending thread as a tagged
/// record rather than as an ioctl error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    /// Target process or thread died between admission and enqueue, or the
    /// node had no living owner.
    Dead,
    /// The payload was malformed or named things the sender does not hold.
    Failed(UsageError),
    /// Allocator or descriptor-table exhaustion in the target.
    Exhausted,
    /// A policy predicate refused the transfer.
    Denied,
}

impl DeliveryError {
    /// The record used to report this failure to the sender.
    pub fn return_code(&self) -> Return {
        match self {
            Self::Dead => Return::DeadReply,
            Self::Failed(_) | Self::Exhausted | Self::Denied => {
                Return::FailedReply
            }
        }
    }
}

impl From<UsageError> for DeliveryError {
    fn from(e: UsageError) -> Self {
        Self::Failed(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_errors_map_to_reply_records() {
        assert_eq!(DeliveryError::Dead.return_code(), Return::DeadReply);
        assert_eq!(
            DeliveryError::Failed(UsageError::BadObject).return_code(),
            Return::FailedReply
        );
        assert_eq!(
            DeliveryError::Exhausted.return_code(),
            Return::FailedReply
        );
        assert_eq!(DeliveryError::Denied.return_code(), Return::FailedReply);
    }
}
