pub mod callback;
pub mod flow;
pub mod login;
pub mod oauth;
pub mod refresh;
pub mod vault;
