//! Transfer pipeline services: the storage seam and its local backend, the
//! video source, progress accounting, fan-out writing and the transfer
//! session that ties them together.

pub mod extractor;
pub mod local_store;
pub mod multiplex;
pub mod progress;
pub mod storage;
pub mod transfer;
