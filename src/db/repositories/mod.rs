pub mod memory;
pub mod models;
pub mod sqlx_postgresql;

pub use memory::MemoryRepository;
pub use sqlx_postgresql::SqlxPostgresqlRepository;

pub type Repository = SqlxPostgresqlRepository;
