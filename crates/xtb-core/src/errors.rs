/// Core error type for the membership bot.
///
/// Transport adapters should map their specific errors into this type so the
/// bot core can tell stream-level failures (retried by the supervisor) apart
/// from everything else.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("message stream error: {0}")]
    Stream(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
