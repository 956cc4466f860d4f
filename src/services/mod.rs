pub mod contracts;
pub mod notifications;
pub mod postgres;
