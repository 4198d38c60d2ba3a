// Order submission module
pub mod gateway;

pub use gateway::{BrokerClient, ExecutionGateway, GatewayError, PaperGateway};
