//! Public `echos` service, used for smoke tests and demos.
//!
//! - `hello`: returns the payload object with `connId` set to the caller's
//!   connection id.
//! - `push`: sends the payload back to the caller through the sender, then
//!   answers with no result.

use serde_json::{Map, Value};

use crate::context::RequestContext;
use crate::endpoint::{fn_not_found, Endpoint};
use crate::error::CodeError;

pub const ECHO_SERVICE_NAME: &str = "echos";

#[derive(Debug, Default)]
pub struct EchoService;

impl Endpoint for EchoService {
    fn name(&self) -> &str {
        ECHO_SERVICE_NAME
    }

    fn handle(&self, ctx: &RequestContext, fn_name: &str, argument: Value) -> Result<Option<Value>, CodeError> {
        match fn_name {
            "hello" => {
                let mut object = match argument {
                    Value::Object(object) => object,
                    Value::Null => Map::new(),
                    _ => return Err(CodeError::bad_request("hello expects an object payload")),
                };
                let conn_id = ctx.connection_id.map(|id| id.to_string()).unwrap_or_default();
                object.insert("connId".to_string(), Value::String(conn_id));
                Ok(Some(Value::Object(object)))
            }
            "push" => {
                let id = ctx
                    .connection_id
                    .ok_or_else(|| CodeError::bad_request("push needs a client connection"))?;
                ctx.send(id, &argument)?;
                Ok(None)
            }
            other => Err(fn_not_found(ECHO_SERVICE_NAME, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fns_ws::ConnectionId;
    use serde_json::json;

    #[test]
    fn hello_adds_conn_id() {
        let mut ctx = RequestContext::new(false);
        let id = ConnectionId::new();
        ctx.connection_id = Some(id);
        let out = EchoService
            .handle(&ctx, "hello", json!({"world": "2024-01-01T00:00:00Z"}))
            .unwrap()
            .unwrap();
        assert_eq!(out, json!({"world": "2024-01-01T00:00:00Z", "connId": id.to_string()}));
    }

    #[test]
    fn hello_rejects_non_objects() {
        let ctx = RequestContext::new(false);
        assert_eq!(EchoService.handle(&ctx, "hello", json!([1])).unwrap_err().code, 400);
        assert_eq!(EchoService.handle(&ctx, "hello", Value::Null).unwrap().unwrap(), json!({"connId": ""}));
    }

    #[test]
    fn push_without_connection_fails() {
        let ctx = RequestContext::new(false);
        assert_eq!(EchoService.handle(&ctx, "push", json!(1)).unwrap_err().code, 400);
        assert_eq!(EchoService.handle(&ctx, "bye", json!(1)).unwrap_err().code, 404);
    }
}
