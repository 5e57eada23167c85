//! Request-scoped context handed to endpoints.

use fns_ws::ConnectionId;
use serde::Serialize;

use crate::envelope::Header;
use crate::error::CodeError;
use crate::send::Sender;

/// Header carrying the client's device id on the upgrade request.
pub const DEVICE_ID_HEADER: &str = "X-Fns-Device-Id";
/// Header carrying the client's address as seen by a fronting proxy.
pub const DEVICE_IP_HEADER: &str = "X-Fns-Device-Ip";

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Set when the request arrived over a client WebSocket.
    pub connection_id: Option<ConnectionId>,
    pub device_id: String,
    pub device_ip: String,
    pub header: Header,
    /// True for calls from another node; only these may reach internal
    /// endpoints.
    pub internal: bool,
    sender: Option<Sender>,
}

impl RequestContext {
    pub fn new(internal: bool) -> Self {
        RequestContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            connection_id: None,
            device_id: String::new(),
            device_ip: String::new(),
            header: Header::new(),
            internal,
            sender: None,
        }
    }

    pub fn with_sender(mut self, sender: Sender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn sender(&self) -> Option<&Sender> {
        self.sender.as_ref()
    }

    /// Push `payload` to connection `id`, wherever it lives.
    pub fn send<T: Serialize + ?Sized>(&self, id: ConnectionId, payload: &T) -> Result<(), CodeError> {
        match &self.sender {
            Some(sender) => sender.send(id, payload),
            None => Err(CodeError::service_error("send is not available in this context")),
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("connection_id", &self.connection_id)
            .field("device_id", &self.device_id)
            .field("device_ip", &self.device_ip)
            .field("internal", &self.internal)
            .finish()
    }
}
