/*
Copyright 2017 Takashi Ogura

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Hard failures of the solver shell.
///
/// Rejections that merely continue the candidate search are not errors; they
/// travel as [`IkReturnAction`](crate::IkReturnAction) values instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid arguments: {}", .0)]
    InvalidArguments(String),
    /// The kernel and the bound manipulator disagree on something that should
    /// be structurally impossible, e.g. more redundant unwrappings than the
    /// joint range admits.
    #[error("inconsistent constraints: {}", .0)]
    InconsistentConstraints(String),
    #[error("not implemented: {}", .0)]
    NotImplemented(String),
    /// The operation is not valid in the solver's current state, e.g. a
    /// filter-scoped command outside a filter callback, or a second `solve`
    /// entered while one is in flight.
    #[error("invalid state: {}", .0)]
    InvalidState(String),
}
