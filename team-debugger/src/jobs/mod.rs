// Jobs
//
// Concrete units of background work scheduled on the Worker

pub mod expression;
pub mod image;
pub mod memory;
pub mod report;
pub mod thread;
pub mod value;

pub use expression::ExpressionEvaluationJob;
pub use image::LoadImageDebugInfoJob;
pub use memory::{RetrieveMemoryBlockJob, WriteMemoryJob};
pub use report::GenerateReportJob;
pub use thread::{GetCpuStateJob, GetStackTraceJob, GetThreadStateJob};
pub use value::{ResolveValueNodeValueJob, WriteValueNodeValueJob};

use crate::types::{ImageId, ThreadId};
use crate::worker::{JobKey, JobType};

pub fn thread_job_key(thread: ThreadId, job_type: JobType) -> JobKey {
    JobKey::new(thread as u32 as u64, job_type)
}

pub fn image_job_key(image: ImageId) -> JobKey {
    JobKey::new(image as u32 as u64, JobType::LoadImageDebugInfo)
}
