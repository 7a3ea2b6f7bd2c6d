pub mod app_error;
pub mod store_error;
