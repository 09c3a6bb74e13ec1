// Web frontend module
pub mod gateway;
pub mod protocol;
pub mod routes;
pub mod server;

pub use gateway::{ConnectionGateway, ConnectionState, Inbound};
pub use protocol::{decode_client_message, ClientMessage, DecodeError, ServerMessage};
pub use routes::{create_router, AppState};
pub use server::{build_app, WebServer};
