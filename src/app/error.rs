use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Pool(#[from] crate::pool::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
