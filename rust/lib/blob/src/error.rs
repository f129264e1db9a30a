use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("cannot save file: filename {0} is colliding with an existing file with different content")]
    Collision(String),
}
