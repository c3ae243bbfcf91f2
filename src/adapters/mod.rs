pub mod postgres;
pub mod redis_cache;
pub mod redis_stream;

pub use postgres::{create_pool, PostgresAccountStore, PostgresTransactionRepository};
pub use redis_cache::RedisCache;
pub use redis_stream::RedisEventLog;
