use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("not found"))]
    NotFound {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("stored block failed checksum validation"))]
    BadCrc {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("value of {} bytes exceeds block size {}", len, block_size))]
    InvalidUserArgument {
        len: usize,
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid backend configuration: {}", reason))]
    Config {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("partition version file mismatch: {}", reason))]
    VersionMismatch {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("undecodable path token {:?}", token))]
    BadPathToken {
        token: String,
        #[snafu(implicit)]
        location: Location,
    },

    UnknownIOError {
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },
}

impl Error {
    /// Missing files, tombstones, short reads and checksum mismatches all
    /// classify as not-found: callers treat partial-write remnants as absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } | Error::BadCrc { .. } => true,
            Error::UnknownIOError { source, .. } => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
