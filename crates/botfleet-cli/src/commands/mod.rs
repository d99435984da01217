pub mod bot;
pub mod health;
pub mod serve;
pub mod utils;
pub mod webhook;
