// Connection pools for the schedule store and distributed locks

pub mod pool;
pub mod redis;

pub use pool::DbPool;
pub use redis::RedisPool;
