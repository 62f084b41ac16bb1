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

//! Chunked upload coordinator: slices a streamed object into blocks,
//! writes them through a shared writer pool with backpressure, and
//! finalizes into a manifest.

pub mod config;
pub mod err;
pub mod session;
pub mod slicer;
pub mod writer;

pub use config::UploadConfig;
pub use err::{Error, Result};
pub use session::{ManifestSink, UploadHandle, UploadRequest, UploadSession};
pub use slicer::BlockSlicer;
pub use writer::{Writer, WriterPool};
