pub mod dispatcher;
pub mod tcp_server;

pub use dispatcher::RequestDispatcher;
pub use tcp_server::{ClientInfo, ModbusTcpServer};
