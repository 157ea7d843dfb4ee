use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Catalog Error: {0}")]
    Catalog(#[from] anyhow::Error),

    #[error("Framing Error: {0}")]
    Framing(String),

    #[error("Unsupported BUFR edition: {0}")]
    UnsupportedEdition(u8),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        Self::Framing(value.to_string())
    }
}

impl<'a> From<nom::Err<nom::error::Error<(&'a [u8], usize)>>> for Error {
    fn from(value: nom::Err<nom::error::Error<(&'a [u8], usize)>>) -> Self {
        Self::Framing(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
