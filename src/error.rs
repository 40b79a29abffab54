// Copyright 2026 dotforge developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::layout::LayoutPhase;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic error type covering every failure this library can return.
///
/// Two families of errors exist, mirroring the two halves of the crate:
///
/// - **Reader-side, recoverable** — [`Error::Malformed`], [`Error::OutOfBounds`],
///   [`Error::UnmappedRva`], [`Error::RecursionLimit`]: the input file is damaged
///   or adversarial. These are routed through an
///   [`crate::diagnostics::ErrorSink`] during parsing so that one bad structure
///   does not abort its siblings.
/// - **Builder-side, fatal** — [`Error::LayoutPhase`],
///   [`Error::UnresolvedReference`]: a precondition of the build pipeline was
///   violated. These always unwind; a half-built image is never safe to emit.
#[derive(Error, Debug)]
pub enum Error {
    /// The file is damaged and could not be parsed.
    ///
    /// Includes the source location where the malformation was detected, for
    /// debugging against hostile inputs.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading or writing.
    #[error("Out of Bound access would have occurred!")]
    OutOfBounds,

    /// This file type is not supported.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// An RVA has no file representation.
    ///
    /// Either the address falls into a section's loader-zeroed virtual tail, or
    /// it lies outside every section. Both are explicit conditions, never
    /// clamped.
    #[error("RVA {0:#010x} has no file representation")]
    UnmappedRva(u32),

    /// A file offset falls outside every section's raw data range.
    #[error("File offset {0:#x} is not covered by any section")]
    UnmappedOffset(u64),

    /// An operation was invoked in the wrong layout phase.
    ///
    /// The segment graph moves strictly through Collecting, `OffsetsAssigned`
    /// and `ReferencesResolved`; mutating children after offsets were assigned
    /// or resolving references before they were is a defect in the calling
    /// code, reported loudly instead of producing a silently broken image.
    #[error("Layout phase violation: required {required:?}, current {current:?}")]
    LayoutPhase {
        /// The phase the operation requires
        required: LayoutPhase,
        /// The phase the graph is actually in
        current: LayoutPhase,
    },

    /// A reference was resolved against a segment that never received an
    /// offset assignment.
    #[error("Reference to segment #{0} resolved before its offsets were assigned")]
    UnresolvedReference(u32),

    /// Recursion limit reached while walking a recursive structure.
    #[error("Reached the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
