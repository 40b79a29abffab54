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

//! Error routing for the tolerant reader pipeline.
//!
//! Reading a damaged image should not abort at the first bad structure: a
//! resource tree with one corrupt leaf still has valid siblings, a metadata
//! stream with one bad row still has readable neighbors. Reader code funnels
//! recoverable errors through an [`ErrorSink`], and the caller picks the
//! policy: [`FailFast`] turns the first issue into a hard error, while
//! [`IssueCollector`] records everything and lets parsing continue.
//!
//! Builder-side errors never pass through a sink. A precondition violation in
//! the build pipeline always unwinds.

use crate::{Error, Result};

/// Receives recoverable reader-side errors and decides whether parsing
/// continues.
pub trait ErrorSink {
    /// Report one issue.
    ///
    /// # Errors
    /// Returns `Err` to abort the surrounding parse, `Ok(())` to continue.
    fn report(&mut self, error: Error) -> Result<()>;

    /// Route a fallible sub-parse through the sink.
    ///
    /// `Ok(None)` means the value was skipped (issue reported, parsing
    /// continues); the surrounding structure carries on without it.
    ///
    /// # Errors
    /// Propagates the error if the sink chose to abort.
    fn absorb<T>(&mut self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                self.report(error)?;
                Ok(None)
            }
        }
    }
}

/// Strict policy: the first issue aborts the parse.
pub struct FailFast;

impl ErrorSink for FailFast {
    fn report(&mut self, error: Error) -> Result<()> {
        Err(error)
    }
}

/// Tolerant policy: issues are recorded and parsing continues.
#[derive(Default)]
pub struct IssueCollector {
    issues: Vec<Error>,
}

impl IssueCollector {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        IssueCollector { issues: Vec::new() }
    }

    /// The issues recorded so far, in encounter order.
    #[must_use]
    pub fn issues(&self) -> &[Error] {
        &self.issues
    }

    /// Number of issues recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.issues.len()
    }

    /// `true` if no issues were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Consume the collector and return the recorded issues.
    #[must_use]
    pub fn into_issues(self) -> Vec<Error> {
        self.issues
    }
}

impl ErrorSink for IssueCollector {
    fn report(&mut self, error: Error) -> Result<()> {
        self.issues.push(error);
        Ok(())
    }
}
