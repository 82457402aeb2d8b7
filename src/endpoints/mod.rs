pub mod check;
pub mod new;
pub mod status;
