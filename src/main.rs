use clap::Parser;
use log::{error, info, warn};
use parking_lot::Mutex;
use pasarela::config::{options, Options};
use pasarela::session::{CursorStore, Session};
use pasarela::{auth, ops, Ctx};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::BufStream;
use tokio::net::TcpListener;

fn main() {
    let opts = Options::parse();

    init_logging(&opts);
    if let Some(key_file) = &opts.key_file {
        if let Err(e) = auth::load_secret(key_file) {
            eprintln!("pasarela: {e}");
            std::process::exit(1);
        }
    }

    let threads = opts.threads.max(1);
    opts.install();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .expect("cannot build runtime");

    if let Err(e) = runtime.block_on(run()) {
        error!("{e}; pasarela stopped");
        eprintln!("pasarela: {e}");
        std::process::exit(1);
    }
}

async fn run() -> pasarela::error::Result<()> {
    info!("starting pasarela");

    let ctx = Ctx::bootstrap(options())?;

    let global_cursors = if options().global_cursors {
        Some(Arc::new(Mutex::new(HashMap::new())))
    } else {
        None
    };

    if options().auth {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            keep_credentials_updated(ctx).await;
        });
    }

    let mut listeners = Vec::new();
    for addr in &options().listen {
        let addr = normalize_listen_addr(addr);
        let listener = TcpListener::bind(&addr).await?;
        info!("listening on {addr}");
        listeners.push(listener);
    }

    let mut accept_tasks = Vec::new();
    for listener in listeners {
        let ctx = ctx.clone();
        let global_cursors = global_cursors.clone();
        accept_tasks.push(tokio::spawn(async move {
            accept_loop(listener, ctx, global_cursors).await;
        }));
    }

    futures::future::join_all(accept_tasks).await;
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<Ctx>,
    global_cursors: Option<Arc<Mutex<HashMap<u64, Box<dyn ops::read::DataSource>>>>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let cursors = match &global_cursors {
                    Some(shared) => CursorStore::global(shared.clone()),
                    None => CursorStore::local(),
                };
                let session =
                    Session::new(BufStream::new(stream), peer.to_string(), ctx.clone(), cursors);
                tokio::spawn(async move {
                    session.run().await;
                });
            }
            Err(e) => {
                warn!("cannot accept a new connection: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}

async fn keep_credentials_updated(ctx: Arc<Ctx>) {
    loop {
        tokio::time::sleep(options().conf_interval).await;
        match ops::read::fetch_credentials(&ctx).await {
            Ok(fetched) => ctx.credentials.install(fetched),
            Err(e) => error!("cannot update credentials cache: {e}"),
        }
    }
}

/// `[host:]port`: a bare port listens on all interfaces.
fn normalize_listen_addr(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("0.0.0.0:{addr}")
    }
}

fn init_logging(opts: &Options) {
    let level = match opts.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    if let Some(path) = &opts.log {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("pasarela: cannot open log file {}: {e}", path.display()),
        }
    }
    builder.init();
}
