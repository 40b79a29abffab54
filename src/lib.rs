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

#![deny(missing_docs)]

//! # dotforge
//!
//! A layout engine for Windows Portable Executable files with embedded CLR
//! metadata: read existing images tolerantly, build new ones deterministically.
//!
//! The crate is organized around one idea: every piece of an image is a
//! *segment* in an arena ([`layout::SegmentArena`]), and the build pipeline
//! moves the whole segment graph through three strict phases — collect,
//! assign offsets, resolve references — before a single byte is written.
//! Cross-references between not-yet-placed structures (import thunks, export
//! name pointers, metadata RVA columns, the bootstrap stub's absolute jump)
//! are deferred [`layout::Reference`] values patched in the final phase.
//!
//! ## Building an image
//!
//! ```rust
//! use dotforge::builder::{PeBuilderConfig, PeImageBuilder};
//! use dotforge::metadata::bodies::MethodBody;
//!
//! let mut builder = PeImageBuilder::new(PeBuilderConfig::default())?;
//! let body = MethodBody::tiny(vec![0x2A]); // ret
//! builder.add_method_body(&body)?;
//! let bytes = builder.build()?;
//! # Ok::<(), dotforge::Error>(())
//! ```
//!
//! ## Reading an image
//!
//! ```rust,no_run
//! use dotforge::pe::image::PeImage;
//! use std::path::Path;
//!
//! let image = PeImage::from_file(Path::new("some.exe"))?;
//! for module in image.imports() {
//!     println!("imports {}", module.library);
//! }
//! for issue in image.issues() {
//!     eprintln!("tolerated: {issue}");
//! }
//! # Ok::<(), dotforge::Error>(())
//! ```
//!
//! Reader-side damage is routed through [`diagnostics::ErrorSink`] instead of
//! aborting the parse; builder-side misuse (adding children after layout,
//! resolving unplaced references) fails fast.

#[macro_use]
mod error;

pub mod builder;
pub mod diagnostics;
pub mod file;
pub mod layout;
pub mod metadata;
pub mod pe;

pub use error::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
