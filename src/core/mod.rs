pub mod collection;
pub mod observable;
pub mod remote;
pub mod source;
pub mod task;
pub mod task_list;
