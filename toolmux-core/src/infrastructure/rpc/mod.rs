pub mod codec;
pub mod types;

pub use codec::{CodecError, decode, encode_notification, encode_request, encode_response};
pub use types::{
    Incoming, RequestId, RpcError, RpcNotification, RpcRequest, RpcResponse, ServerNotification,
};
