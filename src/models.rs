pub mod activity;
pub mod event;
pub mod login_attempt;
pub mod session;
