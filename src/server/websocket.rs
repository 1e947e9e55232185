use crate::cli::Args;
use crate::fanout::{ConnectionHandle, Fanout};
use crate::models::websocket::{ClientFrame, ServerEvent};
use crate::pipeline::ChatService;

use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use lazy_static::lazy_static;

use chrono::Utc;
use hex;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;

use futures::{SinkExt, StreamExt};
use log::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str,
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path)
        .map_err(|e| format!("Failed to open TLS certificate file '{}': {}", cert_path, e))?;
    let key_file = File::open(key_path)
        .map_err(|e| format!("Failed to open TLS key file '{}': {}", key_path, e))?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let mut keys = pkcs8_private_keys(&mut key_reader);
    let key = match keys.next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

pub async fn start_ws_server(
    addr: &str,
    service: Arc<ChatService>,
    fanout: Arc<Fanout>,
    api_key: Option<String>,
    args: Args,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let protocol = if args.enable_tls && args.tls_cert_path.is_some() && args.tls_key_path.is_some()
    {
        "wss"
    } else {
        "ws"
    };
    info!("{} server listening on: {}", protocol.to_uppercase(), addr);

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path, key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        None
    };

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!(
                "Global connection rate limit exceeded for {}. Dropping connection.",
                peer
            );
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let service_clone = Arc::clone(&service);
        let fanout_clone = Arc::clone(&fanout);
        let required_api_key = api_key.clone();
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(
                            peer,
                            tls_stream,
                            service_clone,
                            fanout_clone,
                            required_api_key,
                        )
                        .await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, service_clone, fanout_clone, required_api_key)
                    .await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    service: Arc<ChatService>,
    fanout: Arc<Fanout>,
    required_api_key: Option<String>,
) -> Result<(), Box<dyn Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Filled in by the handshake callback; connections must say who they are.
    let mut authenticated_user: Option<String> = None;

    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let qs = req.uri().query().unwrap_or("");
        let params: HashMap<String, String> =
            form_urlencoded::parse(qs.as_bytes()).into_owned().collect();

        match params.get("user").filter(|u| !u.is_empty()) {
            Some(user) => authenticated_user = Some(user.clone()),
            None => {
                let res = Response::builder()
                    .status(401)
                    .body(Some("missing user".into()))
                    .unwrap();
                return Err(ErrorResponse::from(res));
            }
        }

        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => return Ok(response),
        };

        let ts = params
            .get("ts")
            .or_else(|| params.get("X-Api-Ts"))
            .map(|s| s.as_str());
        let sig = params
            .get("sig")
            .or_else(|| params.get("X-Api-Sign"))
            .map(|s| s.as_str());

        if let (Some(ts), Some(sig)) = (ts, sig) {
            let now = Utc::now().timestamp();
            let ts_i: i64 = ts.parse().unwrap_or(0);
            if (now - ts_i).abs() > 300 {
                let res = Response::builder()
                    .status(401)
                    .body(Some("timestamp out of range".into()))
                    .unwrap();
                return Err(ErrorResponse::from(res));
            }

            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|_| ErrorResponse::from(
                    Response::builder()
                        .status(500)
                        .body(Some("server key error".into()))
                        .unwrap(),
                ))?;
            mac.update(ts.as_bytes());
            let expected = hex::encode(mac.finalize().into_bytes());

            if expected == sig {
                Ok(response)
            } else {
                let res = Response::builder()
                    .status(401)
                    .body(Some("bad signature".into()))
                    .unwrap();
                Err(ErrorResponse::from(res))
            }
        } else {
            let res = Response::builder()
                .status(401)
                .body(Some("missing ts/sig".into()))
                .unwrap();
            Err(ErrorResponse::from(res))
        }
    };

    let accepted = accept_hdr_async(stream, auth_callback).await;
    match accepted {
        Ok(ws) => {
            let user_id = match authenticated_user {
                Some(u) => u,
                None => return Err("handshake passed without a user".into()),
            };
            handle_connection(peer, ws, service, fanout, user_id).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    service: Arc<ChatService>,
    fanout: Arc<Fanout>,
    user_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("New WebSocket connection: {} as {}", peer, user_id);

    let (mut tx, mut rx) = websocket.split();
    let (handle, mut events) = fanout.register(&user_id);

    // A fresh connection starts subscribed to all of its visible
    // conversations.
    match service.conversation_ids_for(&user_id).await {
        Ok(ids) => {
            for id in ids {
                fanout.join(&handle.id, &id);
            }
        }
        Err(e) => warn!("initial topic subscription failed for {}: {}", user_id, e),
    }

    // Single writer: everything leaving this connection funnels through the
    // fanout receiver.
    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("failed to serialize outbound event: {}", e);
                    continue;
                }
            };
            if tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = tx.close().await;
    });

    while let Some(msg) = rx.next().await {
        match msg {
            Ok(message) => {
                if message.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        message.len(),
                        MAX_MESSAGE_SIZE
                    );
                    handle.send(ServerEvent::Error {
                        code: "validation".to_string(),
                        message: "Message too large".to_string(),
                    });
                    break;
                }

                match message {
                    Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => {
                            dispatch_frame(&service, &fanout, &handle, frame).await;
                        }
                        Err(e) => {
                            warn!("Failed to parse frame from {}: {}", peer, e);
                            handle.send(ServerEvent::Error {
                                code: "validation".to_string(),
                                message: format!("Failed to parse frame: {}", e),
                            });
                        }
                    },
                    Message::Close(_) => {
                        info!("Received close frame from {}", peer);
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        // tungstenite answers pings on its own.
                    }
                    Message::Binary(_) => {
                        warn!("Ignoring binary message from {}", peer);
                    }
                    Message::Frame(_) => {}
                }
            }
            Err(e) => {
                match e {
                    tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::Protocol(_)
                    | tokio_tungstenite::tungstenite::Error::Utf8 => {
                        info!(
                            "WebSocket connection closed or protocol error for {}: {}",
                            peer, e
                        );
                    }
                    tokio_tungstenite::tungstenite::Error::Io(ref io_err)
                        if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                    {
                        info!("WebSocket connection reset by peer {}", peer);
                    }
                    _ => {
                        error!("Error receiving message from {}: {}", peer, e);
                    }
                }
                break;
            }
        }
    }

    fanout.deregister(&handle.id);
    writer.abort();
    info!("WebSocket connection closed for {} ({})", peer, user_id);
}

/// Routes one parsed client frame into the service. Failures come back on the
/// same connection as an `error` event; successful sends are acked with the
/// persisted message.
async fn dispatch_frame(
    service: &Arc<ChatService>,
    fanout: &Arc<Fanout>,
    handle: &ConnectionHandle,
    frame: ClientFrame,
) {
    let user_id = handle.user_id.clone();
    let outcome = match frame {
        ClientFrame::Send { request } => match service.send_message(&user_id, request).await {
            Ok(message) => {
                handle.send(ServerEvent::Ack { message });
                Ok(())
            }
            Err(e) => Err(e),
        },
        ClientFrame::Join { conversation_id } => {
            match service.ensure_member(&user_id, &conversation_id).await {
                Ok(()) => {
                    fanout.join(&handle.id, &conversation_id);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        ClientFrame::Leave { conversation_id } => {
            fanout.leave(&handle.id, &conversation_id);
            Ok(())
        }
        ClientFrame::Typing {
            conversation_id,
            is_typing,
        } => service.set_typing(&user_id, &conversation_id, is_typing).await,
        ClientFrame::Delivered {
            conversation_id,
            message_id,
        } => {
            service
                .mark_delivered(&user_id, &conversation_id, &message_id)
                .await
        }
        ClientFrame::Read {
            conversation_id,
            message_id,
        } => service.mark_read(&user_id, &conversation_id, &message_id).await,
        ClientFrame::React {
            conversation_id,
            message_id,
            emoji,
        } => {
            service
                .add_reaction(&user_id, &conversation_id, &message_id, &emoji)
                .await
        }
        ClientFrame::Unreact {
            conversation_id,
            message_id,
        } => {
            service
                .remove_reaction(&user_id, &conversation_id, &message_id)
                .await
        }
        ClientFrame::Delete {
            conversation_id,
            message_id,
        } => {
            service
                .delete_message(&user_id, &conversation_id, &message_id)
                .await
        }
    };

    if let Err(e) = outcome {
        handle.send(ServerEvent::Error {
            code: e.kind().to_string(),
            message: e.to_string(),
        });
    }
}
