// Copyright 2025 tsumiki
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Block-packed file backend: a key-value store that packs consecutive
//! blocks of a large object into one host file at deterministic offsets,
//! with per-block CRC framing, tombstones and streaming folds.

pub mod backend;
pub mod codec;
pub mod config;
pub mod err;
pub mod fold;
pub mod layout;
pub mod path;
pub mod version;

pub use backend::{Backend, BackendStatus};
pub use config::StorageConfig;
pub use err::{Error, Result};
pub use layout::FileLayout;
