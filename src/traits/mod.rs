pub mod http;

pub use http::{HttpClient, ReqwestHttpClient};

#[cfg(test)]
pub use http::MockHttpClient;
