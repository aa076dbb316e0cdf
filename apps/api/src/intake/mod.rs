pub mod handlers;
pub mod register;
