use crate::control;
use crate::loader::ApiLoader;
use crate::mux::{Endpoint, ListenKey, Resolution};
use bytes::Bytes;
use gantry_chain::chain::ApiChain;
use gantry_chain::stage::{error_response, RequestCtx};
use gantry_core::error::GatewayError;
use gantry_core::LOOP_SCHEME;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Bind one listener per configured port and serve until cancelled. The
/// default and control ports are always bound; reloads that add routers on
/// new ports need a restart of the serving layer.
pub async fn run_listeners(loader: Arc<ApiLoader>) -> anyhow::Result<()> {
    let config = loader.config().clone();
    let mut ports: BTreeSet<u16> = BTreeSet::new();
    ports.insert(config.listen_port);
    ports.insert(config.control_port());
    for key in loader.routers().keys() {
        ports.insert(key.port);
    }

    let mut tasks = tokio::task::JoinSet::new();
    for port in ports {
        let loader = loader.clone();
        tasks.spawn(async move {
            if let Err(e) = listen_on(port, loader).await {
                error!(port, error = %e, "listener failed");
            }
        });
    }
    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn listen_on(port: u16, loader: Arc<ApiLoader>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port, "listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let loader = loader.clone();
        let http2 = loader.config().http_server_options.enable_http2;
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let loader = loader.clone();
                async move { handle_request(req, loader, port, peer.ip().to_string()).await }
            });
            if http2 {
                let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                if let Err(e) = builder.serve_connection(io, service).await {
                    debug!(error = %e, "connection closed");
                }
            } else if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!(error = %e, "connection closed");
            }
        });
    }
}

async fn handle_request(
    req: hyper::Request<Incoming>,
    loader: Arc<ApiLoader>,
    port: u16,
    client_ip: String,
) -> Result<hyper::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(to_hyper(error_response(&GatewayError::Internal(format!(
                "body read failed: {}",
                e
            )))));
        }
    };

    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.to_string())
        .or_else(|| parts.uri.authority().map(|a| a.to_string()));
    let path = parts.uri.path().to_string();

    let resolution = loader.resolve(ListenKey::http(port), host.as_deref(), &path);
    let response = match resolution {
        Resolution::Matched(Endpoint::Control) => control::handle(&parts.method, &path),
        Resolution::Matched(Endpoint::SideChain(chain)) => {
            if parts.method != http::Method::GET {
                error_response(&GatewayError::NotFound)
            } else {
                let mut ctx = RequestCtx::new(
                    parts.method,
                    parts.uri,
                    parts.headers,
                    body,
                    client_ip,
                );
                chain.serve(&mut ctx).await
            }
        }
        Resolution::Matched(Endpoint::Chain(chain)) => {
            serve_chain(&loader, chain, parts, body, client_ip).await
        }
        Resolution::Matched(Endpoint::NotFound)
        | Resolution::GateMiss
        | Resolution::NoRoute
        | Resolution::NoRouter => {
            if loader.config().track_404_logs {
                warn!(path = %path, host = ?host, "no route matched");
            }
            error_response(&GatewayError::NotFound)
        }
    };

    Ok(to_hyper(response))
}

async fn serve_chain(
    loader: &Arc<ApiLoader>,
    chain: Arc<ApiChain>,
    parts: http::request::Parts,
    body: Bytes,
    client_ip: String,
) -> http::Response<Bytes> {
    let mut ctx = RequestCtx::new(parts.method, parts.uri, parts.headers, body, client_ip);
    ctx.api_id = chain.descriptor.api_id.clone();
    let engine = loader.loop_engine();
    ctx.dispatcher = Some(engine.clone());

    // Descriptors proxying into the reserved scheme get their redirect
    // target staged before the chain runs.
    if chain.descriptor.target_url.starts_with(&format!("{}://", LOOP_SCHEME)) {
        if let Err(e) = engine.prepare_internal_redirect(&mut ctx, &chain.descriptor) {
            return error_response(&e);
        }
    }

    chain.handler.serve(&mut ctx).await
}

fn to_hyper(resp: http::Response<Bytes>) -> hyper::Response<Full<Bytes>> {
    let (parts, body) = resp.into_parts();
    hyper::Response::from_parts(parts, Full::new(body))
}
