pub mod conflict;
pub mod store;
pub mod supabase_store;
pub mod queue;
pub mod redis_queue;
pub mod producer;
pub mod worker;
pub mod consumer;
pub mod notification;

pub use conflict::*;
pub use store::*;
pub use supabase_store::*;
pub use queue::*;
pub use redis_queue::*;
pub use producer::*;
pub use worker::*;
pub use consumer::*;
pub use notification::*;
