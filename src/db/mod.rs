pub mod repositories;
pub mod traits;

pub use repositories::{MemoryRepository, Repository};
pub use traits::PaymentRepository;
