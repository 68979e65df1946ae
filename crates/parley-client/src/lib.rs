pub mod store;
pub mod transport;
pub mod typing;

pub use store::ChatStore;
pub use transport::GatewayClient;
pub use typing::TypingNotifier;
