use std::{
    collections::BTreeSet,
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
    sync::Arc,
    time::Duration,
};

use bollard::Docker;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::RwLock,
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    controllers::{
        cert_controller::{load_cert_store, server_config},
        docker_controller::{self, discover_containers, routes_from_containers},
        route_controller::{EntryPointContext, DEFAULT_HTTPS_PORT},
        topology_controller::{load_topology, routes_from_topology},
    },
    error::{ConfigError, ProxyError},
    handlers::proxy_handler::{handle_request, ProxyState},
    models::{proxy_config_model::StaticConfig, route_rule::RouteTable},
    utils::tracing_utils,
};

pub const DASHBOARD_ENTRYPOINT: &str = "traefik";
pub const DASHBOARD_ADDRESS: &str = ":8080";
const SECURE_ENTRYPOINT: &str = "websecure";
const DEFAULT_REFRESH_SECS: u64 = 10;

type SharedTlsConfig = Arc<RwLock<Arc<ServerConfig>>>;

pub fn load_static_config(path: &Path) -> Result<StaticConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_static_config(path, &raw)
}

pub fn parse_static_config(path: &Path, raw: &str) -> Result<StaticConfig, ConfigError> {
    toml::from_str::<StaticConfig>(raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `:80` listens on every interface.
pub fn parse_address(address: &str) -> Result<SocketAddr, ProxyError> {
    let address = address.trim();
    let full = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    full.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ProxyError::Address(address.to_string()))
}

/// Listener settings for every configured entrypoint plus the insecure dashboard one.
pub fn entrypoint_contexts(config: &StaticConfig) -> Result<Vec<(EntryPointContext, SocketAddr)>, ProxyError> {
    let mut secure = config
        .entry_points
        .values()
        .filter_map(|entrypoint| entrypoint.redirection())
        .map(|redirection| redirection.to.clone())
        .collect::<BTreeSet<String>>();
    if config.entry_points.contains_key(SECURE_ENTRYPOINT) {
        secure.insert(SECURE_ENTRYPOINT.to_string());
    }
    let port_of = |name: &str| -> Option<u16> {
        config
            .entry_points
            .get(name)
            .and_then(|entrypoint| parse_address(&entrypoint.address).ok())
            .map(|address| address.port())
    };
    let default_https_port = secure
        .iter()
        .find_map(|name| port_of(name))
        .unwrap_or(DEFAULT_HTTPS_PORT);
    let insecure_dashboard = config.api.as_ref().map(|api| api.insecure).unwrap_or(false);

    let mut contexts = vec![];
    for (name, entrypoint) in &config.entry_points {
        let redirection = entrypoint.redirection();
        let https_port = redirection
            .and_then(|redirection| port_of(&redirection.to))
            .unwrap_or(default_https_port);
        contexts.push((
            EntryPointContext {
                name: name.clone(),
                secure: secure.contains(name),
                redirect_to_https: redirection.map(|r| r.scheme == "https").unwrap_or(false),
                https_port,
                https_available: !secure.is_empty(),
                dashboard_only: insecure_dashboard && name == DASHBOARD_ENTRYPOINT,
            },
            parse_address(&entrypoint.address)?,
        ));
    }
    if insecure_dashboard && !config.entry_points.contains_key(DASHBOARD_ENTRYPOINT) {
        contexts.push((
            EntryPointContext {
                name: DASHBOARD_ENTRYPOINT.to_string(),
                secure: false,
                redirect_to_https: false,
                https_port: default_https_port,
                https_available: !secure.is_empty(),
                dashboard_only: true,
            },
            parse_address(DASHBOARD_ADDRESS)?,
        ));
    }
    Ok(contexts)
}

/// Without certificates every listener serves plain http and nothing redirects to https.
pub fn plaintext_fallback(contexts: Vec<(EntryPointContext, SocketAddr)>) -> Vec<(EntryPointContext, SocketAddr)> {
    contexts
        .into_iter()
        .map(|(context, address)| {
            (
                EntryPointContext {
                    secure: false,
                    redirect_to_https: false,
                    https_available: false,
                    ..context
                },
                address,
            )
        })
        .collect()
}

/// File provider routes first, then docker ones.
pub async fn load_routes(config: &StaticConfig, docker: Option<&Docker>) -> Result<RouteTable, ProxyError> {
    let mut table = RouteTable::default();
    if let Some(file) = &config.providers.file {
        let descriptor = load_topology(&file.filename)?;
        table.merge(routes_from_topology(&descriptor)?);
    }
    if let (Some(docker), Some(docker_config)) = (docker, &config.providers.docker) {
        let containers = discover_containers(docker).await?;
        table.merge(routes_from_containers(&containers, docker_config));
    }
    Ok(table)
}

async fn serve_connection<S>(stream: S, state: Arc<ProxyState>, entrypoint: Arc<EntryPointContext>, remote: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| handle_request(state.clone(), entrypoint.clone(), remote, request));
    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!("connection from {} ended: {}", remote, err);
    }
}

pub async fn serve_entrypoint(
    listener: TcpListener,
    entrypoint: Arc<EntryPointContext>,
    state: Arc<ProxyState>,
    tls: Option<SharedTlsConfig>,
) -> Result<(), ProxyError> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let state = state.clone();
        let entrypoint = entrypoint.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(tls) => {
                    let acceptor = TlsAcceptor::from(tls.read().await.clone());
                    match acceptor.accept(stream).await {
                        Ok(stream) => serve_connection(stream, state, entrypoint, remote).await,
                        Err(err) => tracing::debug!("tls handshake with {} failed: {}", remote, err),
                    }
                }
                None => serve_connection(stream, state, entrypoint, remote).await,
            }
        });
    }
}

async fn refresh(config: &StaticConfig, docker: Option<&Docker>, state: &ProxyState, tls: Option<&SharedTlsConfig>) {
    match load_routes(config, docker).await {
        Ok(routes) => state.replace_routes(routes).await,
        Err(err) => tracing::warn!("keeping previous routes, provider refresh failed: {}", err),
    }
    if let Some(tls) = tls {
        match load_cert_store(config) {
            Ok(store) if !store.is_empty() => *tls.write().await = server_config(store),
            Ok(_) => {}
            Err(err) => tracing::warn!("keeping previous certificates: {}", err),
        }
    }
}

pub async fn run_proxy(config_path: &Path) -> Result<(), ProxyError> {
    let config = load_static_config(config_path)?;
    tracing_utils::init(&config.log.level);

    let docker = match &config.providers.docker {
        Some(docker_config) => Some(docker_controller::connect(docker_config)?),
        None => None,
    };
    let routes = load_routes(&config, docker.as_ref()).await?;
    tracing::info!("loaded {} router(s)", routes.routes.len());
    let state = Arc::new(ProxyState::new(routes, config.access_log.is_some())?);

    let mut contexts = entrypoint_contexts(&config)?;
    let tls = if contexts.iter().any(|(context, _)| context.secure) {
        let store = load_cert_store(&config)?;
        if store.is_empty() {
            tracing::warn!("no certificates available, serving every entrypoint over plain http until restarted with some");
            contexts = plaintext_fallback(contexts);
            None
        } else {
            Some(Arc::new(RwLock::new(server_config(store))))
        }
    } else {
        None
    };

    let mut listeners = JoinSet::new();
    for (context, address) in contexts {
        let listener = TcpListener::bind(address).await?;
        tracing::info!("entrypoint {} listening on {}{}", context.name, address, if context.secure { " (tls)" } else { "" });
        let entry_tls = if context.secure { tls.clone() } else { None };
        listeners.spawn(serve_entrypoint(listener, Arc::new(context), state.clone(), entry_tls));
    }

    let refresh_secs = config
        .providers
        .docker
        .as_ref()
        .map(|docker| docker.poll_interval)
        .unwrap_or(DEFAULT_REFRESH_SECS)
        .max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(refresh_secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => refresh(&config, docker.as_ref(), &state, tls.as_ref()).await,
            finished = listeners.join_next() => {
                return match finished {
                    Some(Ok(Err(err))) => Err(err),
                    Some(Err(join_err)) => Err(ProxyError::Io(std::io::Error::other(join_err))),
                    _ => Ok(()),
                };
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
        }
    }
}
