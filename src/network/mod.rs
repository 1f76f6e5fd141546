pub mod http;
pub mod wifi;

pub use http::EspApiServer;
pub use wifi::EspRadio;
