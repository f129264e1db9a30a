pub mod error;
pub mod store;

pub use error::BlobError;
pub use store::{ContentStore, FileStore, content_checksum};
