pub mod dropdown;
pub mod executor;
pub mod http;
pub mod template;

pub use http::{HttpTransport, ReqwestTransport};
