mod file;
mod memory;
mod result;
mod submission;

pub use file::FileDbTrait;
pub use memory::MemoryDb;
pub use result::ResultDbTrait;
pub use submission::SubmissionDbTrait;

/// Combined trait for all storage operations
/// used by the processing pipeline.
/// Should be used through dyn dispatch at the top level
/// to pass the complete storage interface
pub trait DatabaseTrait: SubmissionDbTrait + FileDbTrait + ResultDbTrait {}

impl<T> DatabaseTrait for T where T: SubmissionDbTrait + FileDbTrait + ResultDbTrait {}
