//! Mount entry point: parses the CLI, logs in, builds the VirtualPath/
//! RealPath tree on the scheduler loop, and spawns the FUSE session.
//! Grounded directly in `brfs::main`'s shape: same `Command`-to-mount-to-
//! signal-await structure, same `event_rx.recv()` handshake around
//! `spawn_mount2`, same `SignalStream::merge` shutdown loop — with a SIGHUP
//! branch added for cache invalidation (spec.md §4.7/§9 open question,
//! resolved in DESIGN.md) since `brfs` never needed one.

use campusfs::catalog::auth::{
    Authenticator, BasicAuthenticator, Credentials, FormAuthenticator, OAuth1Authenticator, SystemBrowserLauncher,
};
use campusfs::catalog::http::StudipCatalog;
use campusfs::catalog::RemoteCatalog;
use campusfs::cli::{normalize_mount_path, Cli, CHARSET, ESCAPE_MODE};
use campusfs::fuse_ops::{event_channel, mount, CampusFs, FsEvent};
use campusfs::http_client::ClientConfig;
use campusfs::rpath::RealPath;
use campusfs::scheduler::Scheduler;
use campusfs::template::Template;
use campusfs::vpath::VirtualPath;
use clap::Parser;
use futures::FutureExt;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamExt;

/// Builds the authenticator for `credentials` and, for OAuth1, drives the
/// interactive request-token/authorize/callback/access-token dance (unless
/// a session token was already loaded from disk, or `no_login` opts out).
async fn build_authenticator(
    credentials: &Credentials,
    studip_url: &str,
    login_client: &reqwest::Client,
) -> campusfs::error::Result<Arc<dyn Authenticator>> {
    match credentials {
        Credentials::Basic { username, password } => Ok(Arc::new(BasicAuthenticator {
            username: username.clone(),
            password: password.clone(),
        })),
        Credentials::OAuth1 {
            client_key,
            client_secret,
            session_token_file,
            no_login,
            no_browser,
            no_store,
        } => {
            let oauth1 = Arc::new(OAuth1Authenticator::new(
                client_key.clone(),
                client_secret.clone(),
                session_token_file.clone(),
                *no_store,
            ));
            if *no_login {
                return Ok(oauth1);
            }
            oauth1
                .complete_interactive_login(login_client, studip_url, &SystemBrowserLauncher, *no_browser)
                .await?;
            Ok(oauth1)
        }
        Credentials::Form {
            shib_url,
            username,
            password,
        } => Ok(Arc::new(FormAuthenticator::new(
            shib_url.clone(),
            username.clone(),
            password.clone(),
        ))),
    }
}

fn init_logging(cli: &Cli) {
    let mut builder = env_logger::Builder::from_default_env();
    if cli.effective_debug_logging() {
        builder.filter_level(log::LevelFilter::Debug);
    }
    if cli.effective_debug_aio() {
        // A per-module filter, not a blanket trace level, so turning this on
        // doesn't also drown the log in HTTP/template noise.
        builder.filter_module("campusfs::scheduler", log::LevelFilter::Trace);
    }
    builder.init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let cache_dir = cli.resolved_cache_dir();
    if let Err(err) = std::fs::create_dir_all(&cache_dir) {
        error!("failed to create cache directory {cache_dir:?}: {err}");
        std::process::exit(1);
    }

    let credentials = match cli.credentials() {
        Ok(c) => c,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    let mount_options = match cli.fuse_mount_options() {
        Ok(o) => o,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    let download_client = match reqwest::Client::builder()
        .user_agent(concat!("campusfs/", env!("CARGO_PKG_VERSION")))
        .build()
    {
        Ok(c) => c,
        Err(err) => {
            error!("failed to build HTTP client: {err}");
            std::process::exit(1);
        }
    };

    let format = cli.studip.format.clone();
    let studip_url = cli.studip.studip_url.clone();
    let setup_cache_dir = cache_dir.clone();
    let setup_credentials = credentials.clone();

    let setup = Scheduler::start(move || async move {
        let login_client = reqwest::Client::new();
        let authenticator = build_authenticator(&setup_credentials, &studip_url, &login_client).await?;
        let catalog = Arc::new(StudipCatalog::new(
            studip_url,
            setup_cache_dir,
            authenticator,
            ClientConfig::default(),
        )?);
        catalog.login(&setup_credentials).await?;
        let catalog: Arc<dyn RemoteCatalog> = catalog;
        let template = Arc::new(Template::parse(&format));
        let root_vp = VirtualPath::root(catalog, template, CHARSET, ESCAPE_MODE);
        RealPath::root(vec![root_vp])
    });

    let (scheduler, root) = match setup {
        Ok(pair) => pair,
        Err(err) => {
            error!("login/startup failed: {err}");
            std::process::exit(1);
        }
    };

    let mount_path = normalize_mount_path(&cli.mount);
    let (event_tx, event_rx) = event_channel();
    // SAFETY: getuid/getgid never fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    let fs = CampusFs::new(event_tx, scheduler.clone(), download_client, root.clone(), uid, gid);

    let session = match mount(&mount_path, fs, mount_options) {
        Ok(session) => session,
        Err(err) => {
            error!("failed to mount at {mount_path:?}: {err}");
            std::process::exit(1);
        }
    };

    match event_rx.recv() {
        Ok(FsEvent::Init) => debug!("mounted at {mount_path:?}"),
        Ok(FsEvent::Destroy) | Err(_) => {
            warn!("externally unmounted before we finished mounting");
            return;
        }
    }

    #[derive(Clone, Copy, Debug)]
    enum Sig {
        Int,
        Term,
        Hup,
        Unmount,
    }

    fn install(kind: SignalKind, sig: Sig) -> impl StreamExt<Item = Option<Sig>> {
        SignalStream::new(signal(kind).unwrap_or_else(|_| panic!("failed to install SIG{sig:?} handler")))
            .map(move |_| Some(sig))
    }

    let signal_rt = tokio::runtime::Runtime::new().expect("failed to start signal-handling runtime");
    signal_rt.block_on(async move {
        let sigint = install(SignalKind::interrupt(), Sig::Int);
        let sigterm = install(SignalKind::terminate(), Sig::Term);
        let sighup = install(SignalKind::hangup(), Sig::Hup);

        let unmount = tokio::task::spawn_blocking(move || match event_rx.recv() {
            Ok(FsEvent::Destroy) | Err(_) => Some(Sig::Unmount),
            Ok(FsEvent::Init) => None,
        })
        .map(|res| res.unwrap_or(None))
        .into_stream();

        let mut events = sigint.merge(sigterm).merge(sighup).merge(unmount);
        while let Some(event) = events.next().await {
            match event {
                Some(Sig::Hup) => {
                    debug!("SIGHUP: invalidating cached tree");
                    root.invalidate();
                }
                Some(sig) => {
                    debug!("shutting down on {sig:?}");
                    break;
                }
                None => break,
            }
        }
    });

    drop(session);
    scheduler.shutdown(Duration::from_secs(20));
}
