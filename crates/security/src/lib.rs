pub mod armor;
mod backend;
mod gpg;
#[cfg(feature = "native")]
mod pipeline;

pub use backend::PgpBackend;
pub use gpg::GpgBackend;
#[cfg(feature = "native")]
pub use pipeline::{PgpReply, PgpRequest, SecurityCompletion, SecurityPipeline};

#[derive(Debug, thiserror::Error)]
pub enum PgpError {
    #[error("bad passphrase")]
    BadPassphrase,

    #[error("gpg could not be run: {0}")]
    Unavailable(String),

    #[error("gpg failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
