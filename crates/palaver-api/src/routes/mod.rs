pub mod health;
pub mod messages;
pub mod projects;
pub mod threads;
pub mod usage;
