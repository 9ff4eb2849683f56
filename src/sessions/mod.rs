//! Session tracking module.

mod store;

pub use store::SessionStore;
