pub mod api;
pub mod websocket;

use crate::cli::Args;
use crate::fanout::Fanout;
use crate::pipeline::ChatService;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    service: Arc<ChatService>,
    fanout: Arc<Fanout>,
    args: Args,
}

impl Server {
    pub fn new(addr: String, service: Arc<ChatService>, fanout: Arc<Fanout>, args: Args) -> Self {
        Self {
            addr,
            service,
            fanout,
            args,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.args.http_port {
            api::start_http_server(http_port, self.service.clone()).await?;
        }

        websocket::start_ws_server(
            &self.addr,
            self.service.clone(),
            self.fanout.clone(),
            self.args.server_api_key.clone(),
            self.args.clone(),
        )
        .await
    }
}
