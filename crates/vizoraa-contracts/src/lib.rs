pub mod analysis;
pub mod charts;
pub mod chat;
pub mod columns;
pub mod events;
pub mod export;
pub mod session;
