use async_trait::async_trait;
use burrow_core::{ConnectionId, Request, Response};
use burrow_ipc::{Outbound, RequestHandler};

use crate::handlers::Handler;

pub struct DaemonDispatcher {
    handler: Handler,
}

impl DaemonDispatcher {
    pub fn new(handler: Handler) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl RequestHandler for DaemonDispatcher {
    async fn connected(&self, outbound: Outbound) {
        self.handler.register(outbound);
    }

    async fn handle(&self, conn: ConnectionId, req: Request) -> Response {
        self.handler.handle(conn, req).await
    }

    async fn disconnected(&self, conn: ConnectionId) {
        self.handler.unregister(conn);
    }
}

impl From<Handler> for DaemonDispatcher {
    fn from(handler: Handler) -> Self {
        Self::new(handler)
    }
}
