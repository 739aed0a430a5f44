//! S3-compatible object storage backend / S3兼容对象存储后端

pub mod driver;

pub use driver::S3Backend;
