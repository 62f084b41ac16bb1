use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    StorageError {
        #[snafu(implicit)]
        location: Location,
        source: tsumiki_storage::Error,
    },

    #[snafu(display("invalid upload configuration: {}", reason))]
    Config {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("upload was cancelled"))]
    UploadCancelled {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("upload failed: {}", reason))]
    UploadFailed {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("no more data accepted in state {}", state))]
    UnexpectedChunk {
        state: &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("chunk overruns content length: {} + {} > {}", received, chunk, content_length))]
    TooManyBytes {
        received: u64,
        chunk: u64,
        content_length: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("upload has not received all data yet"))]
    NotFinished {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("a finalize call is already pending"))]
    FinalizePending {
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
