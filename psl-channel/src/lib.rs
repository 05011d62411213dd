// psl-channel - Framed binary RPC channel
//
// Buffered send/receive over a swappable byte transport, a typed
// marshalling schema, and the opcode/status RPC convention built on it.

pub mod backend;
pub mod buffer;
pub mod channel;
pub mod codec;
pub mod rpc;

pub use backend::{pipe, IoBackend, PipeBackend, TcpBackend, TcpOptions};
pub use channel::Channel;
pub use codec::{encoded_len, signature, Arg, Field, Item, Value};
pub use rpc::RpcReply;
