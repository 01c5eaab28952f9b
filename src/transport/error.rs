/// Transport error.
///
/// Returned by every operation that reaches the broker: opening connections and channels,
/// protocol verbs, acknowledgments.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct TransportError(#[from] anyhow::Error);

impl TransportError {
    /// Build a transport error out of a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self(anyhow::Error::msg(message))
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}
