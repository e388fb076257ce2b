pub mod headers;
pub mod health;
pub mod message;
pub mod outcome;
pub mod response;
pub mod retry;
pub mod status;
