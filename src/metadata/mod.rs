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

//! CLR metadata: the physical heaps and tables, method bodies, the metadata
//! root, and the COR20 header that anchors it all inside a PE image.

pub mod bodies;
pub mod cor20;
pub mod heaps;
pub mod resources;
pub mod root;
pub mod streams;
pub mod tables;
pub mod token;
