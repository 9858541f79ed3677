mod endpoint;

pub use endpoint::{bind, BindError, NetworkEndpoint};
