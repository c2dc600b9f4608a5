//! Stage workers for the near-line data store.
//!
//! Each stage is a [`nearline_fabric::Processor`] run by the shared consumer
//! loop: the marshaller routes completion events to the next stage, the
//! indexer expands and splits user path lists, the transfer workers stream
//! between POSIX disk and the object store, and the archive workers move
//! tape-sized aggregates through the prepare/poll recall cycle.

pub mod aggregations;
pub mod archive_get;
pub mod archive_put;
pub mod chown;
pub mod groups;
pub mod indexer;
pub mod logger;
pub mod marshaller;
pub mod tar_stream;
pub mod transfer_get;
pub mod transfer_put;

pub use archive_get::ArchiveGetProcessor;
pub use archive_put::ArchivePutProcessor;
pub use indexer::IndexerProcessor;
pub use logger::LoggingProcessor;
pub use marshaller::MarshallerProcessor;
pub use transfer_get::TransferGetProcessor;
pub use transfer_put::TransferPutProcessor;
