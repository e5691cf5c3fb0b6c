pub mod resources;
pub mod rpc;
pub mod task_queue;
