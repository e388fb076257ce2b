pub mod database;
pub mod gateway;
pub mod health;
pub mod rbmq;
