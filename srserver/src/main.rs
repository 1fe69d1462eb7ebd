use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;
use serde::Deserialize;

use srserver::auth::PermissiveAuthorizer;
use srserver::metrics::PrometheusSink;
use srserver::{App, Config, router};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    addr: Option<String>,

    #[arg(long, default_value = "./registry-data")]
    storage: PathBuf,

    // development control plane seed: {"streams": [...], "images": [...]}.
    // production deployments wire a real metadata client instead
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
struct Seed {
    #[serde(default)]
    streams: Vec<srmeta::ImageStream>,
    #[serde(default)]
    images: Vec<srmeta::Image>,
}

fn setup_logs() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() {
    setup_logs();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path).expect("reading config file");
            Config::from_json(&data).expect("parsing config file")
        }
        None => Config::from_json("{}").unwrap(),
    };
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }

    let driver = Arc::new(srdriver::FsDriver::new(&args.storage).expect("opening storage"));

    let meta = Arc::new(srmeta::FakeMetadataClient::new());
    if let Some(seed_path) = &args.seed {
        let data = std::fs::read_to_string(seed_path).expect("reading seed file");
        let seed: Seed = serde_json::from_str(&data).expect("parsing seed file");
        for stream in seed.streams {
            meta.put_stream(stream);
        }
        for image in seed.images {
            meta.put_image(image);
        }
    }

    let app = App::new(
        config.clone(),
        driver,
        meta,
        Arc::new(PermissiveAuthorizer),
        Arc::new(PrometheusSink),
    )
    .expect("building app");

    let addr = if config.server.addr.starts_with(':') {
        format!("0.0.0.0{}", config.server.addr)
    } else {
        config.server.addr.clone()
    };
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, router(app))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.unwrap();
        })
        .await
        .unwrap();
}
