// Local scratch storage for uploads in flight

pub mod temp;

pub use temp::{remove_all, remove_temp_file, IncomingFile, SpoolError, SpooledBatch, TempStore};
