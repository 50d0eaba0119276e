//! Method registry for incoming RPC requests

use prost::Message;
use rpc_keeper_shared::{methods, EchoReply, EchoRequest, RpcRequest, RpcResponse};
use std::collections::HashMap;

type Handler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Maps method names to handlers and turns requests into responses
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: HashMap<String, Handler>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry serving `Health.Ping` and `Echo.Echo`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(methods::HEALTH_PING, |_: ()| Ok(()));
        registry.register(methods::ECHO, |request: EchoRequest| {
            Ok(EchoReply { text: request.text })
        });
        registry
    }

    /// Register a typed handler; a later registration under the same name wins
    pub fn register<Req, Resp, F>(&mut self, method: impl Into<String>, handler: F)
    where
        Req: Message + Default,
        Resp: Message,
        F: Fn(Req) -> Result<Resp, String> + Send + Sync + 'static,
    {
        let handler: Handler = Box::new(move |body: &[u8]| {
            let request =
                Req::decode(body).map_err(|e| format!("rpc: can't decode request body: {}", e))?;
            handler(request).map(|reply| reply.encode_to_vec())
        });
        self.handlers.insert(method.into(), handler);
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `request.method` and build the response frame
    pub fn dispatch(&self, request: &RpcRequest) -> RpcResponse {
        let Some(handler) = self.handlers.get(&request.method) else {
            return RpcResponse::failed(
                request.seq,
                format!("rpc: can't find method {}", request.method),
            );
        };

        match handler(&request.body) {
            Ok(body) => RpcResponse::ok(request.seq, body),
            Err(error) => RpcResponse::failed(request.seq, error),
        }
    }
}
