//! The task scheduler (spec 4.D): task control blocks, per-class ready
//! queues, the sleepers set, and the operations that move a task through
//! ready/running/blocked/dead.

pub mod queue;
pub mod scheduler;
pub mod smp;
pub mod task;

pub use scheduler::{
    block, block_on_interrupt, current_task_id, die, init, spawn, tick, timer_tick, unblock,
    with_task, with_two_tasks, yield_now,
};
pub use task::{BlockReason, PriorityClass, Task, TaskId};
