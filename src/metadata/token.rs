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

//! Metadata token representation.
//!
//! A token is a 32-bit handle combining a table identifier in the high byte
//! with a 1-based row index (RID) in the low three bytes. Tokens are how
//! metadata rows refer to each other once coded indices are expanded, and how
//! callers name rows in the public API.
//!
//! # Reference
//! - [ECMA-335 II.22](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

/// A metadata token: table byte in bits 24..32, RID in bits 0..24.
///
/// A RID of zero is the null token for its table, used where a reference is
/// optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u32);

impl Token {
    /// Wrap a raw 32-bit token value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Build a token from a table identifier and a row index.
    ///
    /// The RID is masked to its 24-bit field.
    #[must_use]
    pub fn from_parts(table: u8, rid: u32) -> Self {
        Token((u32::from(table) << 24) | (rid & 0x00FF_FFFF))
    }

    /// The raw 32-bit value.
    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }

    /// The table identifier byte.
    #[must_use]
    pub fn table(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The 1-based row index within the table.
    #[must_use]
    pub fn rid(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// `true` if the RID is zero.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.rid() == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
