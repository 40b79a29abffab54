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

//! PE file structures: headers, the section table, address translation, and
//! the builders and readers for the standard data directories.

pub mod debug;
pub mod export;
pub mod headers;
pub mod image;
pub mod import;
pub mod reloc;
pub mod resource;
pub mod section;
pub mod translator;
