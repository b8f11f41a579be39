pub mod rpc;
pub mod transport;
