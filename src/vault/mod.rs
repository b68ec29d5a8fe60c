pub mod audit;
pub mod checkpoint;
pub mod chunks;
pub mod config;
pub mod container;
pub mod derived;
pub mod fetcher;
pub mod key;
pub mod latest;
pub mod lock;
pub mod manifest;
pub mod migrate;
pub mod object_store;
pub mod paths;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod summary;
pub mod util;
pub mod verify;
pub mod warn;
