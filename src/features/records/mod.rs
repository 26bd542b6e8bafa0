pub mod controller;
pub mod view;

pub use controller::{Confirmation, Notice, Notifier, RecordViewController};
