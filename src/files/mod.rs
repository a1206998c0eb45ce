//! Durable item storage
//!
//! Serialized buckets are appended to numbered data files. Each flush writes
//! one new file; an item is addressed by a [`DataLocation`] packing the file
//! index and byte offset. Files are never modified after they are finished.

mod collection;
mod file;
mod location;

pub use collection::{DataFileCollection, FileStatistics, LoadedDataCallback, READ_RETRIES};
pub use file::{
    data_file_name, parse_data_file_name, DataFileHeader, DataFileReader, DataFileWriter,
    DATA_FILE_EXTENSION,
};
pub use location::{DataLocation, MAX_FILE_INDEX, MAX_OFFSET, OFFSET_BITS};
