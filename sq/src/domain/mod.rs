//! Domain types shared by the request scheduler and the job queue

mod priority;

pub use priority::Priority;
