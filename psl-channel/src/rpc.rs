//! Request/response convention on top of a [`Channel`].
//!
//! A request is an int32 opcode followed by the marshalled arguments and is
//! flushed at once. A reply starts with an int32 status; result fields follow
//! only when the status is `STATUS_OK`.

use psl_common::{Opcode, PslError, PslResult, Status, STATUS_OK};
use tracing::{debug, error};

use crate::channel::{expect_consumed, Channel};
use crate::codec::{self, Arg, Field, Item, Value};

/// Decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub status: Status,
    /// Result fields; empty unless `status == STATUS_OK`.
    pub values: Vec<Value>,
}

impl RpcReply {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

const STATUS_FIELD: [Item<'static>; 1] = [Item::Recv(Field::Int32)];

impl Channel {
    /// Sends `opcode` and the leading `Send` items of `schema`, then flushes.
    ///
    /// Returns the unconsumed tail of `schema`.
    pub fn rpc_request<'s, 'a>(
        &mut self,
        opcode: Opcode,
        schema: &'s [Item<'a>],
    ) -> PslResult<&'s [Item<'a>]> {
        self.send(&[Item::Send(Arg::Int32(opcode))])?;
        let tail = self.send(schema)?;
        self.flush()?;
        Ok(tail)
    }

    /// Reads a reply whose results are described by `schema`.
    ///
    /// # Errors
    /// `UnexpectedEof` if the stream ends anywhere in the reply.
    ///
    /// # Panics
    /// Panics if `schema` contains anything but `Recv` items.
    pub fn rpc_result(&mut self, just: bool, schema: &[Item<'_>]) -> PslResult<RpcReply> {
        self.read_reply(just, None, schema)
    }

    /// Like [`rpc_result`](Self::rpc_result) within a message of `*budget`
    /// bytes; `*budget` is decreased by the bytes consumed.
    pub fn rpc_result_sized(
        &mut self,
        just: bool,
        budget: &mut usize,
        schema: &[Item<'_>],
    ) -> PslResult<RpcReply> {
        self.read_reply(just, Some(budget), schema)
    }

    /// Sends a request and reads its reply.
    ///
    /// `schema` holds the request arguments, `Item::Split`, then the result
    /// fields.
    ///
    /// # Panics
    /// Panics if the split is missing or items remain after the results.
    pub fn rpc(&mut self, just: bool, opcode: Opcode, schema: &[Item<'_>]) -> PslResult<RpcReply> {
        let tail = self.rpc_request(opcode, schema)?;
        match tail.split_first() {
            Some((Item::Split, results)) => self.rpc_result(just, results),
            _ => {
                error!(
                    opcode,
                    schema = %codec::signature(schema),
                    "rpc schema has no request/response split"
                );
                panic!(
                    "rpc: missing '/' in schema \"{}\"",
                    codec::signature(schema)
                );
            }
        }
    }

    fn read_reply(
        &mut self,
        just: bool,
        mut budget: Option<&mut usize>,
        schema: &[Item<'_>],
    ) -> PslResult<RpcReply> {
        let (status, _) = self.recv_fields(just, budget.as_deref_mut(), &STATUS_FIELD)?;
        let status = match status.as_deref() {
            Some([Value::Int32(status)]) => *status,
            Some(_) => return Err(PslError::Protocol),
            None => {
                debug!("stream ended before rpc status");
                return Err(PslError::UnexpectedEof);
            }
        };
        if status != STATUS_OK {
            debug!(status, "rpc returned error status");
            return Ok(RpcReply {
                status,
                values: Vec::new(),
            });
        }

        let (values, tail) = self.recv_fields(just, budget, schema)?;
        let Some(values) = values else {
            debug!(schema = %codec::signature(schema), "stream ended inside rpc results");
            return Err(PslError::UnexpectedEof);
        };
        expect_consumed("rpc_result", schema, tail);
        Ok(RpcReply { status, values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pipe;

    #[test]
    fn request_is_opcode_then_arguments() {
        let (a, b) = pipe();
        let mut client = Channel::new(a);
        let mut server = Channel::new(b);

        let schema: [Item<'_>; 2] = [Arg::Str("x").into(), Item::Split];
        let tail = client.rpc_request(42, &schema).unwrap();
        assert_eq!(tail, &[Item::Split]);
        assert_eq!(client.pending(), 0);

        let values = server
            .recv(true, &[Field::Int32.into(), Field::Str.into()])
            .unwrap()
            .unwrap();
        assert_eq!(values, vec![Value::Int32(42), Value::Str("x".into())]);
    }

    #[test]
    fn error_status_skips_results() {
        let (a, b) = pipe();
        let mut client = Channel::new(a);
        let mut server = Channel::new(b);
        server.send_all(&[Arg::Int32(13).into()]).unwrap();
        server.flush().unwrap();

        let reply = client
            .rpc_result(true, &[Field::Str.into(), Field::Int64.into()])
            .unwrap();
        assert_eq!(reply.status, 13);
        assert!(!reply.is_ok());
        assert!(reply.values.is_empty());
        assert!(!client.recv_is_ready());
    }

    #[test]
    fn eof_inside_reply_is_unexpected() {
        let (a, b) = pipe();
        let mut client = Channel::new(a);
        let mut server = Channel::new(b);
        server.send_all(&[Arg::Int32(STATUS_OK).into()]).unwrap();
        server.flush().unwrap();
        drop(server);

        let err = client.rpc_result(false, &[Field::Int32.into()]).unwrap_err();
        assert!(matches!(err, PslError::UnexpectedEof));
    }

    #[test]
    fn eof_before_status_is_unexpected() {
        let (a, b) = pipe();
        let mut client = Channel::new(a);
        drop(b);
        let err = client.rpc_result(false, &[]).unwrap_err();
        assert!(matches!(err, PslError::UnexpectedEof));
    }

    #[test]
    fn sized_reply_counts_status() {
        let (a, b) = pipe();
        let mut client = Channel::new(a);
        let mut server = Channel::new(b);
        server
            .send_all(&[Arg::Int32(STATUS_OK).into(), Arg::Int16(5).into()])
            .unwrap();
        server.flush().unwrap();

        let mut budget = 6;
        let reply = client
            .rpc_result_sized(true, &mut budget, &[Field::Int16.into()])
            .unwrap();
        assert_eq!(reply.values, vec![Value::Int16(5)]);
        assert_eq!(budget, 0);
    }

    #[test]
    #[should_panic(expected = "missing '/'")]
    fn rpc_without_split_panics() {
        let (a, _b) = pipe();
        let mut client = Channel::new(a);
        let _ = client.rpc(true, 1, &[Arg::Int32(1).into(), Field::Int32.into()]);
    }
}
