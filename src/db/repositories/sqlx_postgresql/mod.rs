mod sqlx_postgresql_repository;

pub use sqlx_postgresql_repository::SqlxPostgresqlRepository;
