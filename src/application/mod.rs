pub mod app_error;
pub mod clock;
pub mod filter;
pub mod scope;
pub mod use_cases;
pub mod validators;
